//! The field model: metrics, dimensions, formula fields and the
//! scope-local registry.
//!
//! A field is the unit of addressable data. The same business concept
//! may be produced by many physical columns across datasources; fields
//! carry the aggregation/formula semantics, the schema layer carries the
//! bindings.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{
    AggregationConfig, DimensionConfig, MetricConfig, TechnicalConfig,
};
use crate::error::{Error, Result};
use crate::model::formula::{self, FieldResolver};
use crate::model::technical::Technical;
use crate::model::types::{AggregationType, DataType, FieldType};

/// Column-name suffixes for the two synthetic columns a weighted metric
/// emits at the datasource layer.
pub const WEIGHTED_NUMERATOR_SUFFIX: &str = "_weighting_metric_numerator";
pub const WEIGHTED_DENOMINATOR_SUFFIX: &str = "_weighting_metric_denominator";

static FIELD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

pub fn check_field_name(name: &str) -> Result<()> {
    if !FIELD_NAME.is_match(name) {
        return Err(Error::field_config(name, "invalid field name"));
    }
    Ok(())
}

/// A plain (non-formula) numeric measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub data_type: DataType,
    pub aggregation: AggregationType,
    pub rounding: Option<u32>,
    /// Name of the metric whose per-row product weights this one's mean.
    pub weighting_metric: Option<String>,
    /// Combined-layer default for missing values.
    pub ifnull: Option<f64>,
    /// Dimensions that must all be present in the report grain.
    pub required_grain: Option<Vec<String>>,
    pub technical: Option<Technical>,
}

impl Metric {
    pub fn new(name: impl Into<String>, data_type: DataType, aggregation: AggregationType) -> Self {
        Self {
            name: name.into(),
            data_type,
            aggregation,
            rounding: None,
            weighting_metric: None,
            ifnull: None,
            required_grain: None,
            technical: None,
        }
    }

    pub fn with_rounding(mut self, rounding: u32) -> Self {
        self.rounding = Some(rounding);
        self
    }

    pub fn with_weighting_metric(mut self, weighting: impl Into<String>) -> Self {
        self.weighting_metric = Some(weighting.into());
        self
    }

    /// Combined-layer column names for the weighted numerator/denominator.
    pub fn weighted_column_names(&self) -> (String, String) {
        (
            format!("{}{}", self.name, WEIGHTED_NUMERATOR_SUFFIX),
            format!("{}{}", self.name, WEIGHTED_DENOMINATOR_SUFFIX),
        )
    }
}

/// A grouping/filter field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub data_type: DataType,
    /// Ordered display values; drives dimension-value ordering in the
    /// final sort pass.
    pub values: Option<Vec<String>>,
    pub sorter: Option<String>,
}

impl Dimension {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            values: None,
            sorter: None,
        }
    }
}

/// A metric defined by a formula over other fields. Its referenced
/// metrics aggregate at the datasource layer; the formula body is
/// evaluated at the combined layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaMetric {
    pub name: String,
    pub formula: String,
    pub rounding: Option<u32>,
    pub required_grain: Option<Vec<String>>,
    pub technical: Option<Technical>,
}

impl FormulaMetric {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            rounding: None,
            required_grain: None,
            technical: None,
        }
    }
}

/// A dimension defined by a formula over other dimensions. May not
/// appear in criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaDimension {
    pub name: String,
    pub formula: String,
}

impl FormulaDimension {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }
}

/// A formula field bound to a single report's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdHocField {
    pub name: String,
    pub formula: String,
    pub field_type: FieldType,
    pub rounding: Option<u32>,
    pub technical: Option<Technical>,
}

impl AdHocField {
    pub fn metric(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            field_type: FieldType::Metric,
            rounding: None,
            technical: None,
        }
    }

    pub fn dimension(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            field_type: FieldType::Dimension,
            rounding: None,
            technical: None,
        }
    }
}

/// The five field kinds behind one tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    Metric(Metric),
    FormulaMetric(FormulaMetric),
    Dimension(Dimension),
    FormulaDimension(FormulaDimension),
    AdHoc(AdHocField),
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Metric(m) => &m.name,
            Field::FormulaMetric(m) => &m.name,
            Field::Dimension(d) => &d.name,
            Field::FormulaDimension(d) => &d.name,
            Field::AdHoc(a) => &a.name,
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Metric(_) | Field::FormulaMetric(_) => FieldType::Metric,
            Field::Dimension(_) | Field::FormulaDimension(_) => FieldType::Dimension,
            Field::AdHoc(a) => a.field_type,
        }
    }

    pub fn is_metric(&self) -> bool {
        self.field_type() == FieldType::Metric
    }

    pub fn is_dimension(&self) -> bool {
        self.field_type() == FieldType::Dimension
    }

    pub fn formula(&self) -> Option<&str> {
        match self {
            Field::FormulaMetric(m) => Some(&m.formula),
            Field::FormulaDimension(d) => Some(&d.formula),
            Field::AdHoc(a) => Some(&a.formula),
            _ => None,
        }
    }

    pub fn is_formula(&self) -> bool {
        self.formula().is_some()
    }

    /// Formula dimensions may not appear in criteria.
    pub fn criteria_allowed(&self) -> bool {
        !matches!(self, Field::FormulaDimension(_))
            && !matches!(
                self,
                Field::AdHoc(a) if a.field_type == FieldType::Dimension
            )
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Field::Metric(m) => m.data_type,
            Field::Dimension(d) => d.data_type,
            // Formula fields take the combined layer's computed type.
            Field::FormulaMetric(_) | Field::AdHoc(_) => DataType::Float,
            Field::FormulaDimension(_) => DataType::String,
        }
    }

    pub fn aggregation(&self) -> Option<AggregationType> {
        match self {
            Field::Metric(m) => Some(m.aggregation),
            _ => None,
        }
    }

    pub fn rounding(&self) -> Option<u32> {
        match self {
            Field::Metric(m) => m.rounding,
            Field::FormulaMetric(m) => m.rounding,
            Field::AdHoc(a) => a.rounding,
            _ => None,
        }
    }

    pub fn weighting_metric(&self) -> Option<&str> {
        match self {
            Field::Metric(m) => m.weighting_metric.as_deref(),
            _ => None,
        }
    }

    pub fn ifnull(&self) -> Option<f64> {
        match self {
            Field::Metric(m) => m.ifnull,
            _ => None,
        }
    }

    pub fn required_grain(&self) -> Option<&[String]> {
        match self {
            Field::Metric(m) => m.required_grain.as_deref(),
            Field::FormulaMetric(m) => m.required_grain.as_deref(),
            _ => None,
        }
    }

    pub fn technical(&self) -> Option<&Technical> {
        match self {
            Field::Metric(m) => m.technical.as_ref(),
            Field::FormulaMetric(m) => m.technical.as_ref(),
            Field::AdHoc(a) => a.technical.as_ref(),
            _ => None,
        }
    }

    pub fn dimension_values(&self) -> Option<&[String]> {
        match self {
            Field::Dimension(d) => d.values.as_deref(),
            _ => None,
        }
    }

    /// Whether a narrower-scope definition may shadow this one: same
    /// kind, and for plain metrics the same aggregation semantics.
    pub fn compatible_with(&self, other: &Field) -> bool {
        if self.field_type() != other.field_type() {
            return false;
        }
        match (self.aggregation(), other.aggregation()) {
            (Some(a), Some(b)) if a != b => false,
            _ => self.weighting_metric() == other.weighting_metric(),
        }
    }
}

/// A scope-local name -> field map. The warehouse owns the global
/// registry; each datasource owns an overlay; each report owns its
/// ad-hoc fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldRegistry {
    fields: BTreeMap<String, Field>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.fields
            .values()
            .filter(|f| f.is_metric())
            .map(|f| f.name())
            .collect()
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        self.fields
            .values()
            .filter(|f| f.is_dimension())
            .map(|f| f.name())
            .collect()
    }

    /// Insert a field; duplicate names are rejected unless `force`.
    pub fn insert(&mut self, field: Field, force: bool) -> Result<()> {
        check_field_name(field.name())?;
        if !force {
            if let Some(existing) = self.fields.get(field.name()) {
                if existing != &field {
                    return Err(Error::field_config(
                        field.name(),
                        "field already defined in this scope",
                    ));
                }
                return Ok(());
            }
        }
        self.fields.insert(field.name().to_string(), field);
        Ok(())
    }

    /// Add a metric config, synthesizing aggregation variants and
    /// divisor metrics as declared.
    pub fn add_metric_config(&mut self, cfg: &MetricConfig) -> Result<()> {
        for field in fields_from_metric_config(cfg)? {
            self.insert(field, false)?;
        }
        Ok(())
    }

    pub fn add_dimension_config(&mut self, cfg: &DimensionConfig) -> Result<()> {
        self.insert(dimension_from_config(cfg)?, false)
    }
}

impl FieldResolver for FieldRegistry {
    fn resolve_field(&self, name: &str) -> Option<&Field> {
        self.get(name)
    }
}

/// Build the field (or synthesized fields) a metric config declares.
pub fn fields_from_metric_config(cfg: &MetricConfig) -> Result<Vec<Field>> {
    check_field_name(&cfg.name)?;
    let mut out = Vec::new();

    if let Some(formula) = &cfg.formula {
        formula::check_allowed_sql(formula)?;
        if cfg.aggregation.is_some() {
            return Err(Error::field_config(
                &cfg.name,
                "formula metrics may not declare an aggregation",
            ));
        }
        out.push(Field::FormulaMetric(FormulaMetric {
            name: cfg.name.clone(),
            formula: formula.clone(),
            rounding: cfg.rounding,
            required_grain: cfg.required_grain.clone(),
            technical: parse_technical(&cfg.name, cfg.technical.as_ref())?,
        }));
    } else {
        match &cfg.aggregation {
            None | Some(AggregationConfig::Single(_)) => {
                let aggregation = single_aggregation(cfg)?;
                out.push(Field::Metric(plain_metric(cfg, &cfg.name, aggregation, cfg.rounding)?));
            }
            Some(AggregationConfig::Variants(variants)) => {
                for (agg_name, variant) in variants {
                    let aggregation = AggregationType::parse(agg_name).ok_or_else(|| {
                        Error::field_config(
                            &cfg.name,
                            format!("unknown aggregation '{}'", agg_name),
                        )
                    })?;
                    let name = variant
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{}_{}", cfg.name, aggregation));
                    let rounding = variant.rounding.or(cfg.rounding);
                    out.push(Field::Metric(plain_metric(cfg, &name, aggregation, rounding)?));
                }
            }
        }
    }

    if let Some(divisors) = &cfg.divisors {
        for divisor in &divisors.metrics {
            let name = format!("{}_per_{}", cfg.name, divisor);
            let body = divisors
                .formula
                .replace("{metric}", &format!("{{{}}}", cfg.name))
                .replace("{divisor}", &format!("{{{}}}", divisor));
            formula::check_allowed_sql(&body)?;
            out.push(Field::FormulaMetric(FormulaMetric {
                name,
                formula: body,
                rounding: divisors.rounding,
                required_grain: None,
                technical: None,
            }));
        }
    }

    Ok(out)
}

fn single_aggregation(cfg: &MetricConfig) -> Result<AggregationType> {
    let aggregation = match &cfg.aggregation {
        Some(AggregationConfig::Single(s)) => AggregationType::parse(s).ok_or_else(|| {
            Error::field_config(&cfg.name, format!("unknown aggregation '{}'", s))
        })?,
        None => AggregationType::Sum,
        Some(AggregationConfig::Variants(_)) => unreachable!("handled by caller"),
    };
    if cfg.weighting_metric.is_some() && aggregation != AggregationType::Mean {
        return Err(Error::field_config(
            &cfg.name,
            "weighting_metric requires the mean aggregation",
        ));
    }
    Ok(aggregation)
}

fn plain_metric(
    cfg: &MetricConfig,
    name: &str,
    aggregation: AggregationType,
    rounding: Option<u32>,
) -> Result<Metric> {
    check_field_name(name)?;
    let data_type = match &cfg.data_type {
        Some(s) => DataType::parse(s)
            .ok_or_else(|| Error::field_config(name, format!("unknown type '{}'", s)))?,
        None => DataType::Float,
    };
    Ok(Metric {
        name: name.to_string(),
        data_type,
        aggregation,
        rounding,
        weighting_metric: cfg.weighting_metric.clone(),
        ifnull: cfg.ifnull,
        required_grain: cfg.required_grain.clone(),
        technical: parse_technical(name, cfg.technical.as_ref())?,
    })
}

pub fn dimension_from_config(cfg: &DimensionConfig) -> Result<Field> {
    check_field_name(&cfg.name)?;
    if let Some(formula) = &cfg.formula {
        formula::check_allowed_sql(formula)?;
        return Ok(Field::FormulaDimension(FormulaDimension {
            name: cfg.name.clone(),
            formula: formula.clone(),
        }));
    }
    let data_type = match &cfg.data_type {
        Some(s) => DataType::parse(s)
            .ok_or_else(|| Error::field_config(&cfg.name, format!("unknown type '{}'", s)))?,
        None => DataType::String,
    };
    Ok(Field::Dimension(Dimension {
        name: cfg.name.clone(),
        data_type,
        values: cfg.values.clone(),
        sorter: cfg.sorter.clone(),
    }))
}

fn parse_technical(name: &str, cfg: Option<&TechnicalConfig>) -> Result<Option<Technical>> {
    match cfg {
        None => Ok(None),
        Some(cfg) => Technical::from_config(cfg).map(Some).map_err(|e| {
            Error::field_config(name, e.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregationVariantConfig;

    fn metric_cfg(name: &str) -> MetricConfig {
        MetricConfig {
            name: name.into(),
            data_type: Some("float".into()),
            aggregation: Some(AggregationConfig::Single("sum".into())),
            rounding: None,
            weighting_metric: None,
            ifnull: None,
            required_grain: None,
            technical: None,
            formula: None,
            divisors: None,
        }
    }

    #[test]
    fn test_plain_metric_from_config() {
        let fields = fields_from_metric_config(&metric_cfg("revenue")).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].aggregation(), Some(AggregationType::Sum));
    }

    #[test]
    fn test_aggregation_variant_synthesis() {
        let mut cfg = metric_cfg("sale_size");
        cfg.aggregation = Some(AggregationConfig::Variants(
            [
                ("mean".to_string(), AggregationVariantConfig::default()),
                (
                    "sum".to_string(),
                    AggregationVariantConfig {
                        name: Some("sale_size_total".into()),
                        rounding: Some(1),
                    },
                ),
            ]
            .into_iter()
            .collect(),
        ));
        let fields = fields_from_metric_config(&cfg).unwrap();
        let names: Vec<_> = fields.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"sale_size_mean".to_string()));
        assert!(names.contains(&"sale_size_total".to_string()));
    }

    #[test]
    fn test_divisor_synthesis() {
        let mut cfg = metric_cfg("revenue");
        cfg.divisors = Some(crate::config::warehouse::DivisorsConfig {
            metrics: vec!["leads".into()],
            formula: "{metric}/{divisor}".into(),
            rounding: Some(2),
        });
        let fields = fields_from_metric_config(&cfg).unwrap();
        assert_eq!(fields.len(), 2);
        let per = &fields[1];
        assert_eq!(per.name(), "revenue_per_leads");
        assert_eq!(per.formula(), Some("{revenue}/{leads}"));
        assert_eq!(per.rounding(), Some(2));
    }

    #[test]
    fn test_weighting_requires_mean() {
        let mut cfg = metric_cfg("sale_size");
        cfg.weighting_metric = Some("quantity".into());
        assert!(fields_from_metric_config(&cfg).is_err());

        cfg.aggregation = Some(AggregationConfig::Single("mean".into()));
        let fields = fields_from_metric_config(&cfg).unwrap();
        assert_eq!(fields[0].weighting_metric(), Some("quantity"));
    }

    #[test]
    fn test_registry_rejects_conflicting_duplicate() {
        let mut reg = FieldRegistry::new();
        reg.insert(
            Field::Metric(Metric::new("m", DataType::Float, AggregationType::Sum)),
            false,
        )
        .unwrap();
        // Identical re-insert is a no-op...
        reg.insert(
            Field::Metric(Metric::new("m", DataType::Float, AggregationType::Sum)),
            false,
        )
        .unwrap();
        // ...but a conflicting one is rejected.
        let err = reg.insert(
            Field::Metric(Metric::new("m", DataType::Float, AggregationType::Max)),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_shadow_compatibility() {
        let sum = Field::Metric(Metric::new("m", DataType::Float, AggregationType::Sum));
        let sum2 = Field::Metric(Metric::new("m", DataType::Integer, AggregationType::Sum));
        let max = Field::Metric(Metric::new("m", DataType::Float, AggregationType::Max));
        let dim = Field::Dimension(Dimension::new("m", DataType::String));
        assert!(sum.compatible_with(&sum2));
        assert!(!sum.compatible_with(&max));
        assert!(!sum.compatible_with(&dim));
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(check_field_name("9lives").is_err());
        assert!(check_field_name("re venue").is_err());
        assert!(check_field_name("revenue_2").is_ok());
    }

    #[test]
    fn test_weighted_column_names() {
        let m = Metric::new("sale_size", DataType::Float, AggregationType::Mean)
            .with_weighting_metric("quantity");
        let (num, den) = m.weighted_column_names();
        assert_eq!(num, "sale_size_weighting_metric_numerator");
        assert_eq!(den, "sale_size_weighting_metric_denominator");
    }

    #[test]
    fn test_formula_dimension_criteria_disallowed() {
        let fd = Field::FormulaDimension(FormulaDimension::new("d", "{a}||{b}"));
        assert!(!fd.criteria_allowed());
        let d = Field::Dimension(Dimension::new("d", DataType::String));
        assert!(d.criteria_allowed());
    }
}
