//! Unified error types for the analytics core.
//!
//! One enum covers the load-time, planning and execution failure kinds the
//! caller can observe. Messages name the field, table or datasource at
//! fault; the core never silently substitutes a different field or grain.

use std::collections::BTreeSet;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A metric or dimension definition is malformed.
    #[error("Invalid field config for '{name}': {reason}")]
    InvalidFieldConfig { name: String, reason: String },

    /// A datasource (table/column/connection) definition is malformed.
    #[error("Invalid datasource config for '{datasource}': {reason}")]
    InvalidDataSourceConfig { datasource: String, reason: String },

    /// The warehouse config is malformed at the top level.
    #[error("Invalid warehouse config: {0}")]
    InvalidWarehouseConfig(String),

    /// The planner cannot satisfy every requested metric at the grain.
    #[error("Unsupported grain {grain:?}: no datasource can satisfy {metrics:?}")]
    UnsupportedGrain {
        metrics: Vec<String>,
        grain: BTreeSet<String>,
    },

    /// A formula field's transitive expansion exceeded the depth bound.
    #[error("Max formula depth exceeded while expanding '{0}'")]
    MaxFormulaDepth(String),

    /// Formula fields form a reference cycle.
    #[error("Cyclic formula reference: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A formula or ds_formula contains statement-level SQL.
    #[error("Formula contains disallowed sql: {0}")]
    DisallowedSql(String),

    /// A technical string or object could not be parsed.
    #[error("Invalid technical '{0}': {1}")]
    InvalidTechnical(String, String),

    /// A single datasource query exceeded its timeout.
    #[error("Datasource query timed out after {seconds}s on '{datasource}'")]
    DataSourceQueryTimeout { datasource: String, seconds: u64 },

    /// A datasource query failed; wraps the underlying SQL error text.
    #[error("Datasource query failed on '{datasource}': {message}")]
    FailedExecution { datasource: String, message: String },

    /// Cancellation was requested and honored.
    #[error("Report killed")]
    ReportKilled,

    /// The requested operation is not supported (e.g. criteria on a
    /// formula dimension).
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A saved report spec id does not exist.
    #[error("Unknown report id: {0}")]
    InvalidReportId(i64),

    /// A saved warehouse id does not exist.
    #[error("Unknown warehouse id: {0}")]
    InvalidWarehouseId(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl Error {
    pub(crate) fn field_config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidFieldConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn ds_config(datasource: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidDataSourceConfig {
            datasource: datasource.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_grain_message() {
        let err = Error::UnsupportedGrain {
            metrics: vec!["leads".into()],
            grain: ["sale_id".to_string()].into_iter().collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("leads"));
        assert!(msg.contains("sale_id"));
    }

    #[test]
    fn test_cyclic_dependency_message() {
        let err = Error::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cyclic formula reference: a -> b -> a");
    }
}
