//! The field model: the canonical catalogue of metrics and dimensions,
//! formula composition and post-aggregation technicals.

pub mod field;
pub mod formula;
pub mod technical;
pub mod types;

pub use field::{
    check_field_name, dimension_from_config, fields_from_metric_config, AdHocField, Dimension,
    Field, FieldRegistry, FormulaDimension, FormulaMetric, Metric, WEIGHTED_DENOMINATOR_SUFFIX,
    WEIGHTED_NUMERATOR_SUFFIX,
};
pub use formula::{
    check_allowed_sql, check_cycles, expand_formula, parse_refs, substitute, ExpandedFormula,
    FieldResolver, MAX_FORMULA_DEPTH,
};
pub use technical::{Technical, TechnicalMode, TechnicalOutput, TechnicalType};
pub use types::{AggregationType, DataType, FieldType};
