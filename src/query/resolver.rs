use super::{OutputFormat, QueryRequest, QueryResult, ResolveArgs};
use crate::engine::{EngineContext, EngineError, EngineInvoker};
use crate::schema::{AttributeRole, FieldDescriptor, PERIOD};
use log::{debug, error};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use thiserror::Error;

/// Line the engine prints between its own log output and the result payload.
pub const RESULT_MARKER: &str = "<<<MAPI-BEGIN>>>";

/// Engine operation computing a metric.
pub const RUN_OPERATION: &str = "run_metric";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Metric {metric} failed: {diagnostic}")]
    MetricExecution { metric: String, diagnostic: String },

    #[error("Malformed engine result: {0}")]
    MalformedResult(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Turns metric queries into `run_metric` calls and parses what comes back.
#[derive(Clone)]
pub struct Resolver {
    engine: Arc<dyn EngineInvoker>,
    context: EngineContext,
}

impl Resolver {
    pub fn new(engine: Arc<dyn EngineInvoker>, context: EngineContext) -> Self {
        Self { engine, context }
    }

    /// Dimensions to request for a typed query: everything the caller selected
    /// except the metric value itself and `period`.
    pub fn derive_dimensions(field_name: &str, requested: &[String]) -> Vec<String> {
        let mut dimensions: Vec<String> = Vec::new();
        for sub_field in requested {
            if sub_field == field_name || sub_field == PERIOD || dimensions.contains(sub_field) {
                continue;
            }
            dimensions.push(sub_field.clone());
        }
        dimensions
    }

    /// Arguments of the run call, before the profile flags.
    pub fn run_args(request: &QueryRequest) -> Result<Vec<String>, ResolveError> {
        Ok(vec![
            "run-operation".to_string(),
            RUN_OPERATION.to_string(),
            "--args".to_string(),
            serde_json::to_string(request)?,
        ])
    }

    /// Runs a fully specified request, as received by the REST surface.
    pub async fn run(&self, request: &QueryRequest) -> Result<QueryResult, ResolveError> {
        let invocation = self.context.invocation(Self::run_args(request)?);
        let output = match self.engine.invoke(invocation).await {
            Ok(output) => output,
            Err(EngineError::Execution { output, exit_code }) => {
                error!(
                    "Metric {} failed with exit code {:?}",
                    request.metric_name, exit_code
                );
                return Err(ResolveError::MetricExecution {
                    metric: request.metric_name.clone(),
                    diagnostic: output,
                });
            }
            Err(e) => return Err(e.into()),
        };
        parse_payload(extract_payload(&output)?, request.format)
    }

    /// Resolves one field of the typed schema.
    pub async fn resolve(
        &self,
        field_name: &str,
        requested: &[String],
        args: &ResolveArgs,
    ) -> Result<QueryResult, ResolveError> {
        let dimensions = Self::derive_dimensions(field_name, requested);
        debug!("Resolving {} with dimensions {:?}", field_name, dimensions);
        let request = QueryRequest {
            metric_name: field_name.to_string(),
            grain: args.grain.clone(),
            dimensions,
            start_date: args.start_date.clone(),
            end_date: args.end_date.clone(),
            format: OutputFormat::Json,
        };
        self.run(&request).await
    }
}

/// Returns the text following the marker line.
pub fn extract_payload(output: &str) -> Result<&str, ResolveError> {
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        offset += line.len();
        // The engine may prefix its log lines with a timestamp.
        if line.trim_end().ends_with(RESULT_MARKER) {
            return Ok(&output[offset..]);
        }
    }
    Err(ResolveError::MalformedResult(format!(
        "engine output has no {} line",
        RESULT_MARKER
    )))
}

pub fn parse_payload(payload: &str, format: OutputFormat) -> Result<QueryResult, ResolveError> {
    match format {
        OutputFormat::Json => serde_json::from_str(payload.trim())
            .map(QueryResult::Json)
            .map_err(|e| ResolveError::MalformedResult(format!("payload is not JSON: {}", e))),
        OutputFormat::Csv => Ok(QueryResult::Csv(payload.trim().to_string())),
    }
}

/// Re-shapes engine rows into the rows promised by `field`, keeping only the
/// requested attributes.
///
/// Column names are matched case-insensitively since warehouses tend to
/// upper-case them, and `date_<grain>` is accepted for `period`.
pub fn shape_rows(
    field: &FieldDescriptor,
    requested: &[String],
    grain: &str,
    payload: Value,
) -> Result<Vec<Map<String, Value>>, ResolveError> {
    let rows = match payload {
        Value::Array(rows) => rows,
        other => {
            return Err(ResolveError::MalformedResult(format!(
                "expected a list of rows, got {}",
                json_kind(&other)
            )))
        }
    };
    let period_alias = format!("date_{}", grain);

    rows.into_iter()
        .map(|row| {
            let row = match row {
                Value::Object(row) => row,
                other => {
                    return Err(ResolveError::MalformedResult(format!(
                        "expected a row object, got {}",
                        json_kind(&other)
                    )))
                }
            };
            let mut shaped = Map::new();
            for name in requested {
                let Some(attribute) = field.attribute(name) else {
                    continue;
                };
                let mut raw = lookup(&row, name);
                if raw.is_none() && attribute.role == AttributeRole::Period {
                    raw = lookup(&row, &period_alias);
                }
                let value = match attribute.role {
                    AttributeRole::Value => to_number(name, raw)?,
                    AttributeRole::Period | AttributeRole::Dimension => to_text(raw),
                };
                shaped.insert(name.clone(), value);
            }
            Ok(shaped)
        })
        .collect()
}

fn lookup<'a>(row: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    row.get(key).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn to_number(name: &str, raw: Option<&Value>) -> Result<Value, ResolveError> {
    match raw {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                ResolveError::MalformedResult(format!("value of {} is not numeric: {}", name, s))
            }),
        Some(other) => Err(ResolveError::MalformedResult(format!(
            "value of {} is not numeric: {}",
            name, other
        ))),
    }
}

fn to_text(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(other) => Value::String(other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
