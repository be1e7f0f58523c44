//! # stratum
//!
//! A multi-source semantic analytics core. Reports are declared in
//! business terms (metrics, dimensions, criteria); stratum plans one or
//! more SQL queries against heterogeneous backing databases,
//! materializes their results into a request-scoped SQLite scratch
//! layer, and finishes with rollups, technicals, ordering and pivot.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use stratum::prelude::*;
//!
//! let config = WarehouseConfig::from_file("warehouse.yaml")?;
//! let warehouse = Warehouse::from_config("demo", &config)?;
//!
//! let params: ReportParams = serde_json::from_value(serde_json::json!({
//!     "metrics": ["revenue", "leads", "sales"],
//!     "dimensions": ["partner_name"],
//!     "rollup": "totals",
//! }))?;
//! let result = warehouse.execute(params)?;
//! println!("{:?}", result.display_frame());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Report(metrics, dimensions, criteria)
//!        │
//!        ▼
//!    Planner ── consults ──► Field Registry + Schema Graph
//!        │
//!        ▼
//!    Executor ── one SQL query per chosen table set, per datasource
//!        │
//!        ▼
//!    Combined Layer ── scratch SQLite: join on grain, formulas,
//!        │              rollups, technicals, ordering, pivot
//!        ▼
//!    ReportResult
//! ```

pub mod combined;
pub mod config;
pub mod datasource;
pub mod error;
pub mod executor;
pub mod frame;
pub mod metadata;
pub mod model;
pub mod planner;
pub mod report;
pub mod schema;
pub mod sql;
pub mod warehouse;

pub use error::{Error, Result};
pub use warehouse::Warehouse;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::combined::{OrderBy, Rollup, RowFilter};
    pub use crate::config::{Settings, WarehouseConfig};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, Value, ROLLUP_DISPLAY_LABEL, ROLLUP_MARKER};
    pub use crate::model::{AggregationType, DataType, Field, FieldType, Technical};
    pub use crate::report::{
        Criterion, DimensionRequest, ExecutionState, MetricRequest, Report, ReportParams,
        ReportResult,
    };
    pub use crate::warehouse::Warehouse;
}
