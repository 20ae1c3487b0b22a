use crate::catalog::{Catalog, Discoverer, DiscoveryError};
use crate::query::executor::MetricBinding;
use crate::query::{execute, parse_document, QueryError, QueryResponse, Resolver};
use crate::schema::{FieldDescriptor, QuerySchema};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Catalog, schema and bindings published together.
///
/// Version 0 is the empty snapshot the service starts with.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub version: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub catalog: Arc<Catalog>,
    pub schema: Arc<QuerySchema>,
    bindings: HashMap<String, MetricBinding>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(version: u64, catalog: Catalog) -> Self {
        let schema = QuerySchema::synthesize(&catalog.metrics);
        let bindings = catalog
            .metrics
            .iter()
            .filter_map(|metric| {
                // Metrics left out of the schema get no binding.
                let field: FieldDescriptor = schema.field(&metric.name)?.clone();
                Some((
                    metric.name.clone(),
                    MetricBinding::new(Arc::new(metric.clone()), field),
                ))
            })
            .collect();
        Self {
            version,
            refreshed_at: Some(Utc::now()),
            catalog: Arc::new(catalog),
            schema: Arc::new(schema),
            bindings,
        }
    }

    /// False until a discovery yielded at least one metric.
    pub fn is_ready(&self) -> bool {
        !self.schema.is_empty()
    }

    pub fn binding(&self, name: &str) -> Option<&MetricBinding> {
        self.bindings.get(name)
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed { version: u64, metrics: usize },
    /// Discovery failed, the previous snapshot is still published.
    Retained { version: u64, error: DiscoveryError },
}

/// Process-wide holder of the current [`Snapshot`].
///
/// Readers load the snapshot without locking and keep using the one they
/// loaded even if a refresh publishes a newer one meanwhile.
pub struct CatalogState {
    current: ArcSwap<Snapshot>,
    refresh_lock: Mutex<()>,
    discoverer: Discoverer,
    resolver: Resolver,
}

impl CatalogState {
    pub fn new(discoverer: Discoverer, resolver: Resolver) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            refresh_lock: Mutex::new(()),
            discoverer,
            resolver,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn discoverer(&self) -> &Discoverer {
        &self.discoverer
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Re-discovers the catalog and publishes a new snapshot.
    ///
    /// Concurrent calls run one after the other. A failed discovery is
    /// logged and leaves the current snapshot in place.
    pub async fn refresh(&self) -> RefreshOutcome {
        let _guard = self.refresh_lock.lock().await;
        let previous = self.current.load_full();

        match self.discoverer.discover_catalog().await {
            Ok(catalog) => {
                let version = previous.version + 1;
                let metrics = catalog.len();
                self.current.store(Arc::new(Snapshot::build(version, catalog)));
                info!("Published catalog snapshot v{} with {} metrics", version, metrics);
                RefreshOutcome::Refreshed { version, metrics }
            }
            Err(e) => {
                error!(
                    "Catalog refresh failed, keeping snapshot v{}: {}",
                    previous.version, e
                );
                RefreshOutcome::Retained {
                    version: previous.version,
                    error: e,
                }
            }
        }
    }

    /// Parses and executes a typed query against the current snapshot.
    pub async fn query(&self, source: &str) -> Result<QueryResponse, QueryError> {
        let snapshot = self.snapshot();
        if !snapshot.is_ready() {
            return Err(QueryError::SchemaUnready);
        }
        let document = parse_document(source)?;
        execute(&snapshot, &self.resolver, &document).await
    }

    /// Refreshes on a fixed interval, the first run happening after one period.
    pub fn spawn_periodic_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!("Background catalog refresh enabled (every {:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}
