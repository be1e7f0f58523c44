//! Core types for the field model.

use serde::{Deserialize, Serialize};

/// Field kind: numeric measure or grouping field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Metric,
    Dimension,
}

/// Logical data types carried by fields and columns.
///
/// Intentionally small: these drive combined-layer column declarations
/// and type-conversion eligibility, not full DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Float,
    Decimal,
    Bool,
    Date,
    Datetime,
}

impl DataType {
    /// Parse a type string like "bigint" or "varchar(255)".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let base = s.split('(').next().unwrap_or("");
        match base {
            "string" | "text" | "varchar" | "char" | "nvarchar" => Some(DataType::String),
            "int" | "integer" | "bigint" | "smallint" | "tinyint" => Some(DataType::Integer),
            "float" | "double" | "real" => Some(DataType::Float),
            "decimal" | "numeric" => Some(DataType::Decimal),
            "bool" | "boolean" => Some(DataType::Bool),
            "date" => Some(DataType::Date),
            "datetime" | "timestamp" => Some(DataType::Datetime),
            _ => None,
        }
    }

    /// SQLite column affinity used by the combined layer.
    pub fn sqlite_type(&self) -> &'static str {
        match self {
            DataType::String | DataType::Date | DataType::Datetime => "TEXT",
            DataType::Integer | DataType::Bool => "BIGINT",
            DataType::Float | DataType::Decimal => "DOUBLE",
        }
    }

    /// Whether date-part type conversions apply to this type.
    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Datetime)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::Float | DataType::Decimal
        )
    }
}

/// Aggregation applied to a metric at the datasource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Mean,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl AggregationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Some(AggregationType::Sum),
            "mean" | "avg" => Some(AggregationType::Mean),
            "count" => Some(AggregationType::Count),
            "count_distinct" => Some(AggregationType::CountDistinct),
            "min" => Some(AggregationType::Min),
            "max" => Some(AggregationType::Max),
            _ => None,
        }
    }

    /// SQL aggregate function name (COUNT DISTINCT is handled by the
    /// expression builder's `distinct` flag).
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregationType::Sum => "SUM",
            AggregationType::Mean => "AVG",
            AggregationType::Count | AggregationType::CountDistinct => "COUNT",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
        }
    }

    /// How partial aggregates merge across rollup constituents: counts
    /// become sums of per-group counts, means are recomputed by the
    /// rollup pass, the rest keep their own function.
    pub fn rollup_merge(&self) -> AggregationType {
        match self {
            AggregationType::Count | AggregationType::CountDistinct => AggregationType::Sum,
            other => *other,
        }
    }
}

impl std::fmt::Display for AggregationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregationType::Sum => "sum",
            AggregationType::Mean => "mean",
            AggregationType::Count => "count",
            AggregationType::CountDistinct => "count_distinct",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_parse() {
        assert_eq!(DataType::parse("bigint"), Some(DataType::Integer));
        assert_eq!(DataType::parse("varchar(255)"), Some(DataType::String));
        assert_eq!(DataType::parse(" DateTime "), Some(DataType::Datetime));
        assert_eq!(DataType::parse("blob"), None);
    }

    #[test]
    fn test_sqlite_affinity() {
        assert_eq!(DataType::Date.sqlite_type(), "TEXT");
        assert_eq!(DataType::Integer.sqlite_type(), "BIGINT");
        assert_eq!(DataType::Decimal.sqlite_type(), "DOUBLE");
    }

    #[test]
    fn test_aggregation_parse_and_display() {
        assert_eq!(
            AggregationType::parse("count_distinct"),
            Some(AggregationType::CountDistinct)
        );
        assert_eq!(AggregationType::parse("avg"), Some(AggregationType::Mean));
        assert_eq!(AggregationType::Mean.to_string(), "mean");
    }

    #[test]
    fn test_rollup_merge() {
        assert_eq!(
            AggregationType::CountDistinct.rollup_merge(),
            AggregationType::Sum
        );
        assert_eq!(AggregationType::Min.rollup_merge(), AggregationType::Min);
    }
}
