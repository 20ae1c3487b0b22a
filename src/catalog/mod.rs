pub mod discovery;

pub use discovery::{extract_object_spans, parse_metric_records, Discoverer, DiscoveryError};

use crate::engine::ConnectionProfile;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Metric calculation type as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MetricKind {
    #[default]
    Simple,
    Ratio,
    Cumulative,
    Derived,
    Conversion,
    Other(String),
}

impl MetricKind {
    pub fn as_str(&self) -> &str {
        match self {
            MetricKind::Simple => "simple",
            MetricKind::Ratio => "ratio",
            MetricKind::Cumulative => "cumulative",
            MetricKind::Derived => "derived",
            MetricKind::Conversion => "conversion",
            MetricKind::Other(other) => other,
        }
    }
}

impl From<String> for MetricKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "simple" => MetricKind::Simple,
            "ratio" => MetricKind::Ratio,
            "cumulative" => MetricKind::Cumulative,
            "derived" => MetricKind::Derived,
            "conversion" => MetricKind::Conversion,
            _ => MetricKind::Other(value),
        }
    }
}

impl Serialize for MetricKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One metric as discovered from the engine.
///
/// Serialized with the engine's own key names so `/list` responses look like
/// what the engine reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDefinition {
    pub name: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(rename = "time_grains")]
    pub supported_grains: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Vec<Value>,
    #[serde(rename = "unique_id")]
    pub source_id: String,
    pub model: Option<String>,
    pub package_name: String,
}

impl MetricDefinition {
    pub fn supports_grain(&self, grain: &str) -> bool {
        self.supported_grains.is_empty()
            || self
                .supported_grains
                .iter()
                .any(|g| g.eq_ignore_ascii_case(grain))
    }
}

impl<'de> Deserialize<'de> for MetricDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct MetricHelper {
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            description: Option<String>,
            #[serde(default, rename = "type", alias = "calculation_method")]
            kind: Option<String>,
            #[serde(default)]
            time_grains: Option<Vec<String>>,
            #[serde(default)]
            dimensions: Option<Vec<String>>,
            #[serde(default)]
            filters: Option<Value>,
            #[serde(default)]
            unique_id: Option<String>,
            #[serde(default)]
            model: Option<String>,
            #[serde(default)]
            package_name: Option<String>,
        }

        let helper = MetricHelper::deserialize(deserializer)?;

        let mut dimensions: Vec<String> = Vec::new();
        for dimension in helper.dimensions.unwrap_or_default() {
            if !dimensions.contains(&dimension) {
                dimensions.push(dimension);
            }
        }

        let filters = match helper.filters {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
        };

        let name = helper.name.unwrap_or_default();
        Ok(MetricDefinition {
            label: helper.label.unwrap_or_else(|| name.clone()),
            name,
            description: helper.description.unwrap_or_default(),
            kind: helper.kind.map(MetricKind::from).unwrap_or_default(),
            supported_grains: helper.time_grains.unwrap_or_default(),
            dimensions,
            filters,
            source_id: helper.unique_id.unwrap_or_default(),
            model: helper.model.as_deref().and_then(normalize_model),
            package_name: helper.package_name.unwrap_or_default(),
        })
    }
}

/// Reduces `ref('orders')` style references to the bare model name.
fn normalize_model(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("ref(")
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|args| {
            // ref('package', 'model') names the model last
            args.rsplit(',')
                .next()
                .unwrap_or(args)
                .trim()
                .trim_matches(|c| c == '\'' || c == '"')
        })
        .unwrap_or(trimmed);
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Client-side filters the engine's list command cannot apply itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricSelector {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub model: Option<String>,
    pub package_name: Option<String>,
}

impl MetricSelector {
    pub fn matches(&self, metric: &MetricDefinition) -> bool {
        let kind_matches = self
            .kind
            .as_deref()
            .map_or(true, |kind| metric.kind.as_str().eq_ignore_ascii_case(kind));
        let model_matches = self.model.as_deref().map_or(true, |model| {
            metric.model.as_deref().and_then(normalize_model).as_deref()
                == normalize_model(model).as_deref()
        });
        let package_matches = self
            .package_name
            .as_deref()
            .map_or(true, |package| metric.package_name == package);
        kind_matches && model_matches && package_matches
    }
}

/// All metrics visible at one point in time, with the profile used to get them.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub metrics: Vec<MetricDefinition>,
    pub profile: ConnectionProfile,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
