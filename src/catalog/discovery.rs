use super::{Catalog, MetricDefinition, MetricSelector};
use crate::engine::{EngineContext, EngineError, EngineInvoker};
use log::{debug, info, warn};
use serde::de::IgnoredAny;
use std::sync::Arc;
use thiserror::Error;

/// Keys requested from the engine's list command.
pub const OUTPUT_KEYS: [&str; 10] = [
    "name",
    "model",
    "label",
    "description",
    "type",
    "time_grains",
    "dimensions",
    "filters",
    "unique_id",
    "package_name",
];

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Metric discovery failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Engine listed no metric definitions")]
    NoMetrics,

    #[error("Invalid metric record: {0}")]
    Parse(String),
}

/// Lists metric definitions through the engine.
#[derive(Clone)]
pub struct Discoverer {
    engine: Arc<dyn EngineInvoker>,
    context: EngineContext,
}

impl Discoverer {
    pub fn new(engine: Arc<dyn EngineInvoker>, context: EngineContext) -> Self {
        Self { engine, context }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Arguments of the list call, before the profile flags.
    pub fn list_args(name_filter: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["ls", "--resource-type", "metric", "--output", "json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push("--output-keys".to_string());
        args.extend(OUTPUT_KEYS.iter().map(|k| k.to_string()));
        if let Some(name) = name_filter {
            args.push("--select".to_string());
            args.push(format!("metric:{}", name));
        }
        args
    }

    pub async fn discover(
        &self,
        name_filter: Option<&str>,
        selector: &MetricSelector,
    ) -> Result<Vec<MetricDefinition>, DiscoveryError> {
        let invocation = self.context.invocation(Self::list_args(name_filter));
        let output = self.engine.invoke(invocation).await?;

        let metrics = parse_metric_records(&output)?;
        if metrics.is_empty() && name_filter.is_none() {
            return Err(DiscoveryError::NoMetrics);
        }

        let metrics: Vec<MetricDefinition> = metrics
            .into_iter()
            .filter(|m| name_filter.map_or(true, |name| m.name == name))
            .filter(|m| selector.matches(m))
            .collect();
        debug!(
            "Discovered {} metrics (name_filter={:?}, selector={:?})",
            metrics.len(),
            name_filter,
            selector
        );
        Ok(metrics)
    }

    /// Full, unfiltered discovery packaged as a [`Catalog`].
    pub async fn discover_catalog(&self) -> Result<Catalog, DiscoveryError> {
        let metrics = self.discover(None, &MetricSelector::default()).await?;
        info!("Catalog discovery found {} metrics", metrics.len());
        Ok(Catalog {
            metrics,
            profile: self.context.profile.clone(),
        })
    }
}

/// Returns every JSON object embedded in `text`.
///
/// The engine prints one JSON object per line, possibly interleaved with log
/// lines. Braces inside string literals do not count towards nesting. A
/// candidate that never closes or is not JSON belongs to log text, so the
/// scan resumes just past its opening brace.
pub fn extract_object_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut from = 0usize;
    while let Some((start, end)) = candidate_span(text, from) {
        if let Some(end) = end {
            let span = &text[start..end];
            if serde_json::from_str::<IgnoredAny>(span).is_ok() {
                spans.push(span);
                from = end;
                continue;
            }
        }
        from = start + 1;
    }
    spans
}

/// Locates the first `{` at or after `from` and the end of its balanced span,
/// if it has one.
///
/// Quotes only open a string once a candidate is open, so a quoted brace in
/// log text before it is treated as a plain character.
fn candidate_span(text: &str, from: usize) -> Option<(usize, Option<usize>)> {
    let start = from + text[from..].find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, Some(start + offset + 1)));
                }
            }
            _ => {}
        }
    }
    Some((start, None))
}

/// Parses the engine's list output into metric definitions.
///
/// Records without a name are skipped and duplicate names keep their first
/// record.
pub fn parse_metric_records(text: &str) -> Result<Vec<MetricDefinition>, DiscoveryError> {
    let mut metrics: Vec<MetricDefinition> = Vec::new();
    for span in extract_object_spans(text) {
        let metric: MetricDefinition =
            serde_json::from_str(span).map_err(|e| DiscoveryError::Parse(e.to_string()))?;
        if metric.name.is_empty() {
            warn!("Skipping metric record without a name: {}", span);
            continue;
        }
        if metrics.iter().any(|m| m.name == metric.name) {
            warn!("Duplicate metric {} in engine output, keeping the first", metric.name);
            continue;
        }
        metrics.push(metric);
    }
    Ok(metrics)
}
