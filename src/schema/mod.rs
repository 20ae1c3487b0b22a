//! Typed query schema derived from the discovered metrics.
//!
//! Every metric becomes one queryable field returning a list of rows. A row
//! always has a `period` string and a numeric attribute named after the
//! metric, followed by one string attribute per declared dimension.

use crate::catalog::MetricDefinition;
use log::warn;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Name of the time bucket attribute present on every row.
pub const PERIOD: &str = "period";

pub const GRAIN_ARG: &str = "grain";
pub const START_DATE_ARG: &str = "start_date";
pub const END_DATE_ARG: &str = "end_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Float,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::String => "String",
            AttributeType::Float => "Float",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeRole {
    Period,
    Value,
    Dimension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
    pub role: AttributeRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDescriptor {
    pub name: &'static str,
    pub required: bool,
}

const ARGUMENTS: [ArgumentDescriptor; 3] = [
    ArgumentDescriptor {
        name: GRAIN_ARG,
        required: true,
    },
    ArgumentDescriptor {
        name: START_DATE_ARG,
        required: false,
    },
    ArgumentDescriptor {
        name: END_DATE_ARG,
        required: false,
    },
];

/// Schema entry for a single metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub description: String,
    pub grains: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub arguments: Vec<ArgumentDescriptor>,
}

impl FieldDescriptor {
    pub fn from_metric(metric: &MetricDefinition) -> Self {
        let mut attributes = vec![
            Attribute {
                name: PERIOD.to_string(),
                ty: AttributeType::String,
                role: AttributeRole::Period,
            },
            Attribute {
                name: metric.name.clone(),
                ty: AttributeType::Float,
                role: AttributeRole::Value,
            },
        ];
        for dimension in &metric.dimensions {
            if dimension == PERIOD || *dimension == metric.name {
                warn!(
                    "Metric {} declares dimension {} which collides with a fixed attribute, skipping it",
                    metric.name, dimension
                );
                continue;
            }
            // Dimensions are always exposed as strings, whatever their warehouse type.
            attributes.push(Attribute {
                name: dimension.clone(),
                ty: AttributeType::String,
                role: AttributeRole::Dimension,
            });
        }

        Self {
            name: metric.name.clone(),
            description: metric.description.clone(),
            grains: metric.supported_grains.clone(),
            attributes,
            arguments: ARGUMENTS.to_vec(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentDescriptor> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Type name of the row, e.g. `weekly_revenue` -> `WeeklyRevenueRow`.
    pub fn row_type_name(&self) -> String {
        let mut type_name = String::with_capacity(self.name.len() + 3);
        let mut upper = true;
        for ch in self.name.chars() {
            if ch.is_ascii_alphanumeric() {
                if upper {
                    type_name.push(ch.to_ascii_uppercase());
                } else {
                    type_name.push(ch);
                }
                upper = false;
            } else {
                upper = true;
            }
        }
        type_name.push_str("Row");
        type_name
    }
}

/// Read-only schema: metric name to field descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySchema {
    fields: BTreeMap<String, FieldDescriptor>,
}

impl QuerySchema {
    /// Builds one field per metric. An empty input gives an empty but valid
    /// schema.
    ///
    /// A metric named `period` cannot be told apart from the period attribute
    /// of its own rows and is left out.
    pub fn synthesize(metrics: &[MetricDefinition]) -> Self {
        let fields = metrics
            .iter()
            .filter(|metric| {
                if metric.name == PERIOD {
                    warn!(
                        "Metric {} collides with the period attribute, leaving it out of the schema",
                        metric.name
                    );
                    return false;
                }
                true
            })
            .map(|metric| (metric.name.clone(), FieldDescriptor::from_metric(metric)))
            .collect();
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the schema in SDL notation for clients to inspect.
    pub fn to_sdl(&self) -> String {
        let mut sdl = String::from("type Query {\n");
        for field in self.fields() {
            if !field.description.is_empty() {
                let _ = writeln!(sdl, "  \"{}\"", field.description.replace('"', "\\\""));
            }
            let args: Vec<String> = field
                .arguments
                .iter()
                .map(|arg| format!("{}: String{}", arg.name, if arg.required { "!" } else { "" }))
                .collect();
            let _ = writeln!(
                sdl,
                "  {}({}): [{}!]!",
                field.name,
                args.join(", "),
                field.row_type_name()
            );
        }
        sdl.push_str("}\n");

        for field in self.fields() {
            let _ = write!(sdl, "\ntype {} {{\n", field.row_type_name());
            for attribute in &field.attributes {
                let _ = writeln!(sdl, "  {}: {}", attribute.name, attribute.ty.as_str());
            }
            sdl.push_str("}\n");
        }
        sdl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metric(name: &str, dimensions: &[&str]) -> MetricDefinition {
        serde_json::from_value(json!({
            "name": name,
            "description": format!("{} description", name),
            "time_grains": ["day", "month"],
            "dimensions": dimensions,
        }))
        .unwrap()
    }

    #[test]
    fn field_has_period_value_and_dimensions() {
        let schema = QuerySchema::synthesize(&[metric("revenue", &["region", "channel"])]);
        let field = schema.field("revenue").unwrap();

        let names: Vec<&str> = field.attribute_names().collect();
        assert_eq!(names, vec!["period", "revenue", "region", "channel"]);
        assert_eq!(field.attribute("period").unwrap().ty, AttributeType::String);
        assert_eq!(field.attribute("revenue").unwrap().ty, AttributeType::Float);
        assert_eq!(field.attribute("region").unwrap().ty, AttributeType::String);
        assert_eq!(field.attribute("channel").unwrap().role, AttributeRole::Dimension);
    }

    #[test]
    fn grain_is_the_only_required_argument() {
        let schema = QuerySchema::synthesize(&[metric("revenue", &[])]);
        let field = schema.field("revenue").unwrap();

        assert!(field.argument(GRAIN_ARG).unwrap().required);
        assert!(!field.argument(START_DATE_ARG).unwrap().required);
        assert!(!field.argument(END_DATE_ARG).unwrap().required);
        assert!(field.argument("limit").is_none());
    }

    #[test]
    fn empty_catalog_gives_empty_schema() {
        let schema = QuerySchema::synthesize(&[]);
        assert!(schema.is_empty());
        assert_eq!(schema.len(), 0);
        assert_eq!(schema.to_sdl(), "type Query {\n}\n");
    }

    #[test]
    fn skips_dimensions_colliding_with_fixed_attributes() {
        let schema = QuerySchema::synthesize(&[metric("revenue", &["period", "revenue", "region"])]);
        let names: Vec<&str> = schema.field("revenue").unwrap().attribute_names().collect();
        assert_eq!(names, vec!["period", "revenue", "region"]);
    }

    #[test]
    fn leaves_out_metric_named_like_the_period_attribute() {
        let schema = QuerySchema::synthesize(&[metric("period", &["region"]), metric("revenue", &[])]);
        assert!(schema.field("period").is_none());
        assert_eq!(schema.len(), 1);
        assert!(!schema.to_sdl().contains("PeriodRow"));
    }

    #[test]
    fn one_field_per_metric() {
        let schema = QuerySchema::synthesize(&[metric("revenue", &["region"]), metric("orders", &[])]);
        assert_eq!(schema.len(), 2);
        let names: Vec<&str> = schema.fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "revenue"]);
    }

    #[test]
    fn renders_sdl() {
        let schema = QuerySchema::synthesize(&[metric("weekly_revenue", &["region"])]);
        let sdl = schema.to_sdl();
        assert!(sdl.contains(
            "  weekly_revenue(grain: String!, start_date: String, end_date: String): [WeeklyRevenueRow!]!"
        ));
        assert!(sdl.contains("type WeeklyRevenueRow {\n  period: String\n  weekly_revenue: Float\n  region: String\n}"));
        assert!(sdl.contains("\"weekly_revenue description\""));
    }
}
