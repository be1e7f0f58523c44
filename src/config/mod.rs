//! Configuration: process-global settings and the warehouse config model.

pub mod settings;
pub mod warehouse;

pub use settings::{QueryMode, Settings, GLOBAL_SETTINGS};
pub use warehouse::{
    AggregationConfig, AggregationVariantConfig, ColumnConfig, ConnectConfig, DataSourceConfig,
    DimensionConfig, DivisorsConfig, FieldBindingConfig, MetricConfig, TableConfig,
    TechnicalConfig, WarehouseConfig,
};
