use super::document::{Document, DocumentError, FieldSelection};
use super::resolver::{shape_rows, ResolveError, Resolver};
use super::{QueryResult, ResolveArgs};
use crate::catalog::MetricDefinition;
use crate::refresh::Snapshot;
use crate::schema::{FieldDescriptor, END_DATE_ARG, GRAIN_ARG, START_DATE_ARG};
use futures::future::join_all;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Schema not ready: no metrics have been discovered yet")]
    SchemaUnready,

    #[error("Invalid query: {0}")]
    Document(#[from] DocumentError),

    #[error("Unknown field {0}")]
    UnknownField(String),

    #[error("Field {field} has no sub-field {sub_field}")]
    UnknownSubField { field: String, sub_field: String },

    #[error("Field {field} requires argument {argument}")]
    MissingArgument {
        field: String,
        argument: &'static str,
    },

    #[error("Field {field} does not accept argument {argument}")]
    UnknownArgument { field: String, argument: String },

    #[error("Metric {field} does not support grain {grain}")]
    UnsupportedGrain { field: String, grain: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Resolver entry for one metric, bound to the definition it was built from.
#[derive(Debug, Clone)]
pub struct MetricBinding {
    definition: Arc<MetricDefinition>,
    field: FieldDescriptor,
}

impl MetricBinding {
    pub fn new(definition: Arc<MetricDefinition>, field: FieldDescriptor) -> Self {
        Self { definition, field }
    }

    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    pub fn field(&self) -> &FieldDescriptor {
        &self.field
    }

    /// Checks a selection against this field and extracts its arguments.
    pub fn bind_args(&self, selection: &FieldSelection) -> Result<ResolveArgs, QueryError> {
        let field = &self.field.name;
        for sub_field in &selection.sub_fields {
            if self.field.attribute(sub_field).is_none() {
                return Err(QueryError::UnknownSubField {
                    field: field.clone(),
                    sub_field: sub_field.clone(),
                });
            }
        }
        for (argument, _) in &selection.arguments {
            if self.field.argument(argument).is_none() {
                return Err(QueryError::UnknownArgument {
                    field: field.clone(),
                    argument: argument.clone(),
                });
            }
        }

        let grain = selection
            .argument(GRAIN_ARG)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| QueryError::MissingArgument {
                field: field.clone(),
                argument: GRAIN_ARG,
            })?;
        if !self.definition.supports_grain(grain) {
            return Err(QueryError::UnsupportedGrain {
                field: field.clone(),
                grain: grain.to_string(),
            });
        }

        Ok(ResolveArgs {
            grain: grain.to_string(),
            start_date: selection.argument(START_DATE_ARG).map(str::to_string),
            end_date: selection.argument(END_DATE_ARG).map(str::to_string),
        })
    }

    pub async fn resolve(
        &self,
        resolver: &Resolver,
        requested: &[String],
        args: &ResolveArgs,
    ) -> Result<Vec<Map<String, Value>>, QueryError> {
        let result = resolver
            .resolve(&self.definition.name, requested, args)
            .await?;
        match result {
            QueryResult::Json(payload) => {
                Ok(shape_rows(&self.field, requested, &args.grain, payload)?)
            }
            QueryResult::Csv(_) => Err(ResolveError::MalformedResult(
                "typed queries need a JSON payload".to_string(),
            )
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub message: String,
    pub path: Vec<String>,
}

/// Response of a typed query. Fields that failed are `null` in `data` and
/// have an entry in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

/// Executes `document` against one snapshot. All fields are resolved
/// concurrently and all of them see the same schema and bindings.
pub async fn execute(
    snapshot: &Snapshot,
    resolver: &Resolver,
    document: &Document,
) -> Result<QueryResponse, QueryError> {
    if !snapshot.is_ready() {
        return Err(QueryError::SchemaUnready);
    }
    debug!(
        "Executing query {:?} with {} fields against snapshot v{}",
        document.operation_name,
        document.selections.len(),
        snapshot.version
    );

    let results = join_all(
        document
            .selections
            .iter()
            .map(|selection| resolve_selection(snapshot, resolver, selection)),
    )
    .await;

    let mut response = QueryResponse::default();
    for (selection, result) in document.selections.iter().zip(results) {
        let key = selection.response_key().to_string();
        match result {
            Ok(rows) => {
                let rows = rows.into_iter().map(Value::Object).collect();
                response.data.insert(key, Value::Array(rows));
            }
            Err(e) => {
                response.data.insert(key.clone(), Value::Null);
                response.errors.push(FieldError {
                    message: e.to_string(),
                    path: vec![key],
                });
            }
        }
    }
    Ok(response)
}

async fn resolve_selection(
    snapshot: &Snapshot,
    resolver: &Resolver,
    selection: &FieldSelection,
) -> Result<Vec<Map<String, Value>>, QueryError> {
    let binding = snapshot
        .binding(&selection.name)
        .ok_or_else(|| QueryError::UnknownField(selection.name.clone()))?;
    let args = binding.bind_args(selection)?;
    binding.resolve(resolver, &selection.sub_fields, &args).await
}
