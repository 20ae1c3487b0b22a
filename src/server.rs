//! HTTP surface of the service.
//!
//! - `GET /list` - live metric listing, filtered by `name`, `type`, `model`, `package_name`
//! - `POST /run` - run one metric, answering JSON or CSV
//! - `POST /query` - typed query against the synthesized schema
//! - `GET /schema` - the synthesized schema in SDL notation
//! - `POST /refresh` - re-discover metrics and rebuild the schema
//! - `GET /health` - readiness of the schema

use crate::catalog::{DiscoveryError, MetricDefinition, MetricSelector};
use crate::config::Config;
use crate::query::{OutputFormat, QueryError, QueryRequest, QueryResponse, QueryResult, ResolveError};
use crate::refresh::{CatalogState, RefreshOutcome};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogState>,
}

impl AppState {
    pub fn new(catalog: Arc<CatalogState>) -> Self {
        Self { catalog }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Discovery(_) | ApiError::Resolve(_) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Query(QueryError::SchemaUnready) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "errors": [{ "message": message }] })),
            )
                .into_response(),
            ApiError::Query(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "errors": [{ "message": message }] })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub model: Option<String>,
    pub package_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunBody {
    pub metric_name: Option<String>,
    pub grain: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshResponse {
    pub version: u64,
    pub metrics: usize,
    pub refreshed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub version: u64,
    pub metrics: usize,
}

async fn list_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<MetricDefinition>>, ApiError> {
    let selector = MetricSelector {
        kind: params.kind,
        model: params.model,
        package_name: params.package_name,
    };
    let metrics = state
        .catalog
        .discoverer()
        .discover(params.name.as_deref(), &selector)
        .await
        .map_err(|e| {
            error!("Listing metrics failed: {}", e);
            e
        })?;
    Ok(Json(metrics))
}

fn wants_csv(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |accept| accept.contains("text/csv"))
}

async fn run_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunBody>,
) -> Result<Response, ApiError> {
    let metric_name = body
        .metric_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("metric_name is required".to_string()))?;
    let grain = body
        .grain
        .filter(|g| !g.is_empty())
        .ok_or_else(|| ApiError::BadRequest("grain is required".to_string()))?;
    let format = body.format.unwrap_or(if wants_csv(&headers) {
        OutputFormat::Csv
    } else {
        OutputFormat::Json
    });

    let request = QueryRequest {
        metric_name,
        grain,
        dimensions: body.dimensions,
        start_date: body.start_date,
        end_date: body.end_date,
        format,
    };
    let result = state.catalog.resolver().run(&request).await.map_err(|e| {
        warn!("Running metric {} failed: {}", request.metric_name, e);
        e
    })?;

    Ok(match result {
        QueryResult::Json(value) => Json(value).into_response(),
        QueryResult::Csv(text) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"))],
            text,
        )
            .into_response(),
    })
}

async fn query_handler(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<QueryResponse>, ApiError> {
    Ok(Json(state.catalog.query(&body.query).await?))
}

async fn schema_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.catalog.snapshot();
    if !snapshot.is_ready() {
        return Err(QueryError::SchemaUnready.into());
    }
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
        snapshot.schema.to_sdl(),
    )
        .into_response())
}

async fn refresh_handler(State(state): State<AppState>) -> Json<RefreshResponse> {
    let response = match state.catalog.refresh().await {
        RefreshOutcome::Refreshed { version, metrics } => RefreshResponse {
            version,
            metrics,
            refreshed: true,
            error: None,
        },
        RefreshOutcome::Retained { version, error } => RefreshResponse {
            version,
            metrics: state.catalog.snapshot().catalog.len(),
            refreshed: false,
            error: Some(error.to_string()),
        },
    };
    Json(response)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.catalog.snapshot();
    Json(HealthResponse {
        status: if snapshot.is_ready() { "ok" } else { "not_ready" }.to_string(),
        version: snapshot.version,
        metrics: snapshot.catalog.len(),
    })
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} -> {} in {:?}",
        method,
        uri,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// CORS from a comma-separated origin list, `*` allowing any origin.
pub fn build_cors_layer(origins: Option<&str>) -> Option<CorsLayer> {
    match origins.map(str::trim) {
        None | Some("") => None,
        Some("*") => {
            warn!("CORS: allowing all origins");
            Some(CorsLayer::permissive())
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("CORS: invalid origin '{}': {}", origin.trim(), e);
                        None
                    }
                })
                .collect();
            if allowed.is_empty() {
                return None;
            }
            Some(
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::ACCEPT]),
            )
        }
    }
}

pub fn create_router(state: AppState, cors: Option<CorsLayer>) -> Router {
    let router = Router::new()
        .route("/list", get(list_handler))
        .route("/run", post(run_handler))
        .route("/query", post(query_handler))
        .route("/schema", get(schema_handler))
        .route("/refresh", post(refresh_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(log_requests))
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

pub struct ApiServer {
    config: Config,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        create_router(
            self.state.clone(),
            build_cors_layer(self.config.cors_origins.as_deref()),
        )
    }

    pub async fn run(&self) -> Result<(), std::io::Error> {
        let server_address = format!("{}:{}", self.config.server_host, self.config.server_port);
        info!("Starting server at {}", server_address);

        let listener = TcpListener::bind(&server_address).await.map_err(|e| {
            error!("Failed to bind server address {}: {}", server_address, e);
            e
        })?;
        info!("Listening for connections on {}", server_address);

        axum::serve(listener, self.router()).await
    }
}
