use crate::catalog::{Discoverer, MetricDefinition};
use crate::engine::{EngineContext, EngineError, EngineInvocation, EngineInvoker};
use crate::query::{QueryError, Resolver};
use crate::refresh::{CatalogState, RefreshOutcome};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&EngineInvocation) -> Result<String, EngineError> + Send + Sync>;

enum Reply {
    Output(String),
    Fail(String),
}

/// Scripted stand-in for the external engine. List calls (`ls`) and run calls
/// (`run-operation`) get separate canned replies; every call is recorded.
pub(crate) struct FakeEngine {
    listing: Mutex<Reply>,
    running: Mutex<Reply>,
    custom: Option<Responder>,
    calls: Mutex<Vec<EngineInvocation>>,
}

impl FakeEngine {
    fn with_replies(listing: Reply, running: Reply) -> Self {
        Self {
            listing: Mutex::new(listing),
            running: Mutex::new(running),
            custom: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn new(
        responder: impl Fn(&EngineInvocation) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        let mut engine = Self::failing("unused");
        engine.custom = Some(Box::new(responder));
        engine
    }

    pub(crate) fn listing(output: &str) -> Self {
        Self::with_replies(
            Reply::Output(output.to_string()),
            Reply::Fail("no run output scripted".to_string()),
        )
    }

    pub(crate) fn running(output: &str) -> Self {
        Self::with_replies(
            Reply::Fail("no listing scripted".to_string()),
            Reply::Output(output.to_string()),
        )
    }

    pub(crate) fn failing(diagnostic: &str) -> Self {
        Self::with_replies(
            Reply::Fail(diagnostic.to_string()),
            Reply::Fail(diagnostic.to_string()),
        )
    }

    pub(crate) fn set_listing(&self, output: &str) {
        *self.listing.lock().unwrap() = Reply::Output(output.to_string());
    }

    pub(crate) fn set_running(&self, output: &str) {
        *self.running.lock().unwrap() = Reply::Output(output.to_string());
    }

    pub(crate) fn fail_with(&self, diagnostic: &str) {
        *self.listing.lock().unwrap() = Reply::Fail(diagnostic.to_string());
        *self.running.lock().unwrap() = Reply::Fail(diagnostic.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<EngineInvocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineInvoker for FakeEngine {
    async fn invoke(&self, invocation: EngineInvocation) -> Result<String, EngineError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if let Some(custom) = &self.custom {
            return custom(&invocation);
        }
        let reply = match invocation.args.first().map(String::as_str) {
            Some("ls") => self.listing.lock().unwrap(),
            _ => self.running.lock().unwrap(),
        };
        match &*reply {
            Reply::Output(output) => Ok(output.clone()),
            Reply::Fail(diagnostic) => Err(EngineError::Execution {
                exit_code: Some(1),
                output: diagnostic.clone(),
            }),
        }
    }
}

pub(crate) fn metric(name: &str, dimensions: &[&str], grains: &[&str]) -> MetricDefinition {
    serde_json::from_value(json!({
        "name": name,
        "label": name,
        "type": "simple",
        "time_grains": grains,
        "dimensions": dimensions,
        "unique_id": format!("metric.test.{}", name),
        "package_name": "test"
    }))
    .unwrap()
}

pub(crate) fn catalog_state(engine: Arc<FakeEngine>) -> CatalogState {
    let context = EngineContext::new("dbt");
    CatalogState::new(
        Discoverer::new(engine.clone(), context.clone()),
        Resolver::new(engine, context),
    )
}

#[test_log::test(tokio::test)]
async fn discovers_synthesizes_and_resolves() {
    let engine = Arc::new(FakeEngine::listing(
        "{\"name\": \"revenue\", \"time_grains\": [\"month\"], \"dimensions\": [\"region\", \"channel\"]}\n{\"name\": \"orders\"}",
    ));
    engine.set_running(
        "Running macro run_metric\n<<<MAPI-BEGIN>>>\n[{\"date_month\": \"2024-01-01\", \"revenue\": 120.5, \"region\": \"emea\"}]",
    );
    let state = catalog_state(engine.clone());
    assert!(matches!(
        state.refresh().await,
        RefreshOutcome::Refreshed { metrics: 2, .. }
    ));

    let response = state
        .query(r#"{ revenue(grain: "month", start_date: "2024-01-01") { period revenue region } }"#)
        .await
        .unwrap();
    assert_eq!(
        Value::Object(response.data),
        json!({"revenue": [{"period": "2024-01-01", "revenue": 120.5, "region": "emea"}]})
    );

    let run = engine.calls().pop().unwrap();
    let sent: Value = serde_json::from_str(&run.args[3]).unwrap();
    assert_eq!(
        sent,
        json!({
            "metric_name": "revenue",
            "grain": "month",
            "dimensions": ["region"],
            "start_date": "2024-01-01",
            "end_date": null,
            "format": "json"
        })
    );
}

#[test_log::test(tokio::test)]
async fn syntax_errors_are_reported_once_ready() {
    let engine = Arc::new(FakeEngine::listing("{\"name\": \"revenue\"}"));
    let state = catalog_state(engine);
    state.refresh().await;
    assert!(matches!(
        state.query("{ revenue(grain: day) ").await,
        Err(QueryError::Document(_))
    ));
}

// Two catalogs expose the same metric with different dimensions. Queries run
// while refreshes flip between them; every query must be validated and shaped
// by the same snapshot.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_never_mixes_schema_and_bindings() {
    let listings = Arc::new(AtomicUsize::new(0));
    let counter = listings.clone();
    let engine = Arc::new(FakeEngine::new(move |invocation| {
        if invocation.args.first().map(String::as_str) == Some("ls") {
            let dimension = if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                "a"
            } else {
                "b"
            };
            Ok(format!("{{\"name\": \"m\", \"dimensions\": [\"{}\"]}}", dimension))
        } else {
            Ok("<<<MAPI-BEGIN>>>\n[{\"period\": \"p\", \"m\": 1, \"a\": \"x\", \"b\": \"y\"}]".to_string())
        }
    }));
    let state = Arc::new(catalog_state(engine));
    state.refresh().await;

    let mut tasks = Vec::new();
    for i in 0..200 {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            if i % 4 == 0 {
                state.refresh().await;
                None
            } else {
                Some(state.query("{ m(grain: day) { period m a } }").await.unwrap())
            }
        }));
    }

    let mut answered = 0;
    for task in tasks {
        let Some(response) = task.await.unwrap() else {
            continue;
        };
        if response.errors.is_empty() {
            assert_eq!(response.data["m"], json!([{"period": "p", "m": 1, "a": "x"}]));
            answered += 1;
        } else {
            assert_eq!(response.errors[0].message, "Field m has no sub-field a");
            assert_eq!(response.data["m"], Value::Null);
        }
    }
    assert!(answered > 0);
    assert!(listings.load(Ordering::SeqCst) > 1);
}
