//! Serde model of the warehouse configuration (JSON or YAML).
//!
//! The config format allows several heterogeneous shapes: `connect` is a
//! URL string or a `{func, params}` object, a column's `fields` entries
//! are names or full binding objects, a metric's `aggregation` is a
//! scalar or a map of variants, and `technical` is a shorthand string or
//! an object. Each is an untagged enum so the deserializer accepts both
//! forms.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level warehouse configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,

    /// Datasource name -> datasource config, in declaration order
    /// (BTreeMap keeps iteration deterministic).
    #[serde(default)]
    pub datasources: BTreeMap<String, DataSourceConfig>,
}

impl WarehouseConfig {
    /// Load from a JSON or YAML file, chosen by extension (`.json` vs
    /// `.yaml`/`.yml`); unknown extensions try JSON first.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&raw),
            Some("json") => Self::from_json(&raw),
            _ => Self::from_json(&raw).or_else(|_| Self::from_yaml(&raw)),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::InvalidWarehouseConfig(format!("json parse: {}", e)))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidWarehouseConfig(format!("yaml parse: {}", e)))
    }
}

/// A metric definition. `formula` makes it a formula metric; otherwise
/// it is a plain metric bound to datasource columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighting_metric: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifnull: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_grain: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical: Option<TechnicalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divisors: Option<DivisorsConfig>,
}

/// Scalar aggregation name, or a map of synthesized variants:
/// `{sum: {}, mean: {name: my_mean, rounding: 2}}` produces one metric
/// per entry named `{base}_{agg}` unless a custom name is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregationConfig {
    Single(String),
    Variants(BTreeMap<String, AggregationVariantConfig>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationVariantConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding: Option<u32>,
}

/// Divisor metric generator: one `{base}_per_{divisor}` formula metric
/// per listed divisor, from a template with `{metric}` / `{divisor}`
/// placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DivisorsConfig {
    pub metrics: Vec<String>,

    #[serde(default = "default_divisor_formula")]
    pub formula: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding: Option<u32>,
}

fn default_divisor_formula() -> String {
    "{metric}/{divisor}".to_string()
}

/// Shorthand string (`"mean(5)"`) or full object form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TechnicalConfig {
    Shorthand(String),
    Full {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        window: Option<usize>,
        #[serde(default)]
        min_periods: Option<usize>,
        #[serde(default)]
        mode: Option<String>,
    },
}

/// A dimension definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// Ordered display values; drives dimension-value ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,

    /// Named sorter applied to the values (reserved; `values` order is
    /// the default sorter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// A datasource: connection, field overrides and tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfig {
    pub connect: ConnectConfig,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,

    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,

    /// Position in the warehouse priority order; lower wins ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Connection URL or a registered-connector invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectConfig {
    Url(String),
    Func {
        func: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

/// A physical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    #[serde(rename = "type")]
    pub table_type: String,

    /// Auto-create fields named after unbound columns.
    #[serde(default)]
    pub create_fields: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default)]
    pub siblings: Vec<String>,

    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Dimensions present on the table but not guaranteed at PK grain.
    #[serde(default)]
    pub incomplete_dimensions: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub use_full_column_names: bool,

    /// Dialect hint emitted ahead of queries against this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_with: Option<String>,

    #[serde(default)]
    pub columns: BTreeMap<String, ColumnConfig>,
}

/// A physical column and the fields it can produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    #[serde(default)]
    pub fields: Vec<FieldBindingConfig>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    #[serde(default)]
    pub allow_type_conversions: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_conversion_prefix: Option<String>,

    #[serde(default)]
    pub disabled_type_conversions: Vec<String>,
}

/// Field name, or a full binding with a datasource formula and
/// per-operator criteria conversions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldBindingConfig {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        ds_formula: Option<String>,
        /// Operator -> replacement expression template (`{value}`
        /// placeholder), e.g. `{"=": "birth_year = 2020-{value}"}`.
        #[serde(default)]
        ds_criteria_conversions: BTreeMap<String, String>,
        #[serde(default)]
        required_grain: Option<Vec<String>>,
    },
}

impl FieldBindingConfig {
    pub fn name(&self) -> &str {
        match self {
            FieldBindingConfig::Name(n) => n,
            FieldBindingConfig::Full { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json() {
        let cfg = WarehouseConfig::from_json(
            r#"{
                "metrics": [{"name": "revenue", "type": "float", "aggregation": "sum"}],
                "dimensions": [{"name": "partner_name", "type": "string"}],
                "datasources": {
                    "main": {
                        "connect": "sqlite:///tmp/test.db",
                        "tables": {
                            "main.sales": {
                                "type": "metric",
                                "primary_key": ["sale_id"],
                                "columns": {
                                    "revenue": {"fields": ["revenue"]},
                                    "id": {"fields": ["sale_id"]}
                                }
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.metrics.len(), 1);
        assert_eq!(cfg.datasources["main"].tables.len(), 1);
    }

    #[test]
    fn test_connect_func_object() {
        let cfg: ConnectConfig = serde_json::from_str(
            r#"{"func": "sqlite", "params": {"path": "/tmp/x.db"}}"#,
        )
        .unwrap();
        assert!(matches!(cfg, ConnectConfig::Func { .. }));
    }

    #[test]
    fn test_field_binding_both_shapes() {
        let bindings: Vec<FieldBindingConfig> = serde_json::from_str(
            r#"["sales_count", {"name": "sales", "ds_formula": "COUNT(DISTINCT sales.id)"}]"#,
        )
        .unwrap();
        assert_eq!(bindings[0].name(), "sales_count");
        assert_eq!(bindings[1].name(), "sales");
    }

    #[test]
    fn test_aggregation_variants_map() {
        let metric: MetricConfig = serde_yaml::from_str(
            "name: sale_size\ntype: float\naggregation:\n  mean:\n    rounding: 2\n  sum:\n    name: sale_size_total\n",
        )
        .unwrap();
        match metric.aggregation.unwrap() {
            AggregationConfig::Variants(map) => {
                assert_eq!(map.len(), 2);
                assert_eq!(map["sum"].name.as_deref(), Some("sale_size_total"));
            }
            _ => panic!("expected variants"),
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let cfg = WarehouseConfig {
            metrics: vec![MetricConfig {
                name: "leads".into(),
                data_type: Some("integer".into()),
                aggregation: Some(AggregationConfig::Single("count_distinct".into())),
                rounding: None,
                weighting_metric: None,
                ifnull: None,
                required_grain: None,
                technical: None,
                formula: None,
                divisors: None,
            }],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back = WarehouseConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.metrics[0].name, "leads");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = WarehouseConfig::from_json(r#"{"metricz": []}"#).unwrap_err();
        assert!(err.to_string().contains("json parse"));
    }
}
