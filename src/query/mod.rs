pub mod document;
pub mod executor;
pub mod resolver;

pub use document::{parse_document, Document, DocumentError, FieldSelection};
pub use executor::{execute, FieldError, QueryError, QueryResponse};
pub use resolver::{extract_payload, ResolveError, Resolver, RESULT_MARKER};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

/// Arguments of a single `run_metric` call, serialized as its `--args` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub metric_name: String,
    pub grain: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Arguments accepted by every metric field of the typed schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveArgs {
    pub grain: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Json(Value),
    Csv(String),
}

impl QueryResult {
    pub fn format(&self) -> OutputFormat {
        match self {
            QueryResult::Json(_) => OutputFormat::Json,
            QueryResult::Csv(_) => OutputFormat::Csv,
        }
    }
}
