//! DataSources: a connection descriptor, an overlay field registry, the
//! set of physical tables and the join graph over them.

pub mod connect;

pub use connect::{register_connector, Connector, ResolvedConnection, SqlConnection};

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ConnectConfig, DataSourceConfig, Settings};
use crate::error::{Error, Result};
use crate::model::field::{Dimension, Field, FieldRegistry, Metric};
use crate::model::formula::FieldResolver;
use crate::model::types::{AggregationType, DataType};
use crate::schema::graph::{NeighborTable, SchemaGraph, TableSet};
use crate::schema::table::{ColumnBinding, Table, TableType};
use crate::sql::dialect::SqlDialect;
use crate::sql::{Dialect, TimePart};

/// One backing database: its tables, field overlay and dialect.
#[derive(Debug)]
pub struct DataSource {
    pub name: String,
    pub connect: ResolvedConnection,
    pub dialect: Dialect,
    /// Overlay registry; adds to / shadows the warehouse registry.
    pub registry: FieldRegistry,
    pub tables: BTreeMap<String, Table>,
    pub priority: i32,
    graph: SchemaGraph,
}

impl DataSource {
    /// Build from config: resolve the connection, apply field overlays,
    /// load tables, synthesize `create_fields` and type-conversion
    /// fields, then build and validate the join graph.
    pub fn from_config(
        name: &str,
        cfg: &DataSourceConfig,
        settings: &Settings,
        warehouse_registry: &FieldRegistry,
    ) -> Result<Self> {
        let connect = match &cfg.connect {
            ConnectConfig::Url(url) => {
                ResolvedConnection::Url(settings.interpolate_url(name, url))
            }
            ConnectConfig::Func { func, params } => ResolvedConnection::Func {
                func: func.clone(),
                params: params.clone(),
            },
        };
        let dialect = connect
            .dialect()
            .map_err(|e| Error::ds_config(name, e.to_string()))?;

        let mut registry = FieldRegistry::new();
        for metric_cfg in &cfg.metrics {
            registry.add_metric_config(metric_cfg)?;
        }
        for dim_cfg in &cfg.dimensions {
            registry.add_dimension_config(dim_cfg)?;
        }

        // Overlay definitions may shadow warehouse fields only when
        // compatible.
        for field in registry.fields() {
            if let Some(global) = warehouse_registry.get(field.name()) {
                if !global.compatible_with(field) {
                    return Err(Error::ds_config(
                        name,
                        format!(
                            "field '{}' shadows an incompatible warehouse definition",
                            field.name()
                        ),
                    ));
                }
            }
        }

        let mut tables = BTreeMap::new();
        for (table_name, table_cfg) in &cfg.tables {
            let mut table = Table::from_config(table_name, table_cfg)?;
            if table_cfg.create_fields {
                create_fields_for_table(&mut table, &mut registry, warehouse_registry)?;
            }
            add_conversion_fields(&mut table, dialect, &mut registry, warehouse_registry)?;
            table.check_primary_key()?;
            tables.insert(table_name.clone(), table);
        }

        // Every binding must resolve to a known field.
        for table in tables.values() {
            for column in table.columns.values() {
                for field_name in column.bindings.keys() {
                    if !registry.has(field_name) && !warehouse_registry.has(field_name) {
                        return Err(Error::ds_config(
                            name,
                            format!(
                                "column '{}.{}' binds unknown field '{}'",
                                table.name, column.name, field_name
                            ),
                        ));
                    }
                }
            }
        }

        let graph = SchemaGraph::build(name, &tables)?;

        Ok(Self {
            name: name.to_string(),
            connect,
            dialect,
            registry,
            tables,
            priority: cfg.priority.unwrap_or(0),
            graph,
        })
    }

    /// Open a fresh connection for query execution.
    pub fn open_connection(&self) -> Result<Box<dyn SqlConnection>> {
        self.connect.open(&self.name)
    }

    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn metric_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables
            .values()
            .filter(|t| t.table_type == TableType::Metric)
    }

    pub fn dimension_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables
            .values()
            .filter(|t| t.table_type == TableType::Dimension)
    }

    /// Tables with a column bound to `field`, optionally restricted by
    /// table type, in deterministic priority/name order.
    pub fn tables_with_field(&self, field: &str, table_type: Option<TableType>) -> Vec<&Table> {
        let mut out: Vec<&Table> = self
            .tables
            .values()
            .filter(|t| t.has_field(field))
            .filter(|t| table_type.map(|tt| t.table_type == tt).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub fn find_neighbor_tables(&self, table: &str) -> Vec<NeighborTable> {
        self.graph.find_neighbor_tables(table)
    }

    pub fn find_descendent_tables(&self, table: &str) -> Vec<String> {
        self.graph.find_descendent_tables(table)
    }

    /// Candidate table sets producing `grain` from `table`.
    pub fn find_possible_table_sets(
        &self,
        table: &Table,
        grain: &BTreeSet<String>,
        target_fields: &BTreeSet<String>,
        settings: &Settings,
    ) -> Vec<TableSet> {
        self.graph.find_possible_table_sets(
            &self.name,
            table,
            grain,
            target_fields,
            settings.datasource_max_joins,
            settings.datasource_max_join_candidates,
            &self.tables,
        )
    }
}

impl FieldResolver for DataSource {
    fn resolve_field(&self, name: &str) -> Option<&Field> {
        self.registry.get(name)
    }
}

/// `create_fields`: bind a same-named field to every column with no
/// explicit bindings, creating the field in the overlay registry when
/// it is not already known. Numeric columns of metric tables become sum
/// metrics; primary-key and non-numeric columns become dimensions.
fn create_fields_for_table(
    table: &mut Table,
    registry: &mut FieldRegistry,
    warehouse_registry: &FieldRegistry,
) -> Result<()> {
    let numeric_metric = table.table_type == TableType::Metric;
    let primary_key = table.primary_key.clone();
    for column in table.columns.values_mut() {
        if !column.bindings.is_empty() {
            continue;
        }
        let field_name = column.name.clone();
        column
            .bindings
            .insert(field_name.clone(), ColumnBinding::default());

        if registry.has(&field_name) || warehouse_registry.has(&field_name) {
            continue;
        }
        let data_type = column.data_type.unwrap_or(DataType::String);
        let is_key = primary_key.contains(&field_name);
        let field = if numeric_metric && data_type.is_numeric() && !is_key {
            Field::Metric(Metric::new(&field_name, data_type, AggregationType::Sum))
        } else {
            Field::Dimension(Dimension::new(&field_name, data_type))
        };
        registry.insert(field, false)?;
    }
    Ok(())
}

/// Register derived date-part dimensions for temporal columns with
/// `allow_type_conversions`.
fn add_conversion_fields(
    table: &mut Table,
    dialect: Dialect,
    registry: &mut FieldRegistry,
    warehouse_registry: &FieldRegistry,
) -> Result<()> {
    if !dialect.supports_type_conversions() {
        return Ok(());
    }

    let bare_name = table.bare_name().to_string();
    let columns: Vec<String> = table.columns.keys().cloned().collect();
    for col_name in columns {
        let (prefix, data_type, disabled) = {
            let column = &table.columns[&col_name];
            if !column.allow_type_conversions {
                continue;
            }
            let Some(data_type) = column.data_type else {
                continue;
            };
            if !data_type.is_temporal() {
                continue;
            }
            let prefix = column.type_conversion_prefix.clone().unwrap_or_else(|| {
                // Default prefix comes from the column's first bound
                // dimension, falling back to the column name.
                column
                    .bindings
                    .keys()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| column.name.clone())
                    + "_"
            });
            (prefix, data_type, column.disabled_type_conversions.clone())
        };
        let fullname = format!("{}.{}", bare_name, col_name);

        for &part in TimePart::all() {
            if disabled.contains(part.suffix()) {
                continue;
            }
            if part.requires_time() && data_type == DataType::Date {
                continue;
            }
            let field_name = format!("{}{}", prefix, part.suffix());
            let field_type = match part {
                TimePart::Date => DataType::Date,
                _ => DataType::Integer,
            };

            if !registry.has(&field_name) && !warehouse_registry.has(&field_name) {
                registry.insert(
                    Field::Dimension(Dimension::new(&field_name, field_type)),
                    false,
                )?;
            }

            let column = table
                .columns
                .get_mut(&col_name)
                .expect("column disappeared during conversion setup");
            column.bindings.entry(field_name).or_insert(ColumnBinding {
                ds_formula: Some(dialect.time_part_sql(part, &fullname)),
                ds_criteria_conversions: BTreeMap::new(),
                required_grain: None,
                converted_part: Some(part),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds_config() -> DataSourceConfig {
        serde_json::from_str(
            r#"{
                "connect": "sqlite://:memory:",
                "dimensions": [{"name": "sale_date", "type": "datetime"}],
                "tables": {
                    "main.sales": {
                        "type": "metric",
                        "primary_key": ["sale_id"],
                        "columns": {
                            "id": {"fields": ["sale_id"]},
                            "revenue": {"fields": ["revenue"]},
                            "created_at": {
                                "fields": ["sale_date"],
                                "type": "datetime",
                                "allow_type_conversions": true,
                                "disabled_type_conversions": ["minute"]
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    fn warehouse_registry() -> FieldRegistry {
        let mut reg = FieldRegistry::new();
        reg.insert(
            Field::Metric(Metric::new("revenue", DataType::Float, AggregationType::Sum)),
            false,
        )
        .unwrap();
        reg.insert(
            Field::Dimension(Dimension::new("sale_id", DataType::Integer)),
            false,
        )
        .unwrap();
        reg
    }

    #[test]
    fn test_conversion_fields_registered() {
        let ds = DataSource::from_config(
            "main",
            &ds_config(),
            &Settings::default(),
            &warehouse_registry(),
        )
        .unwrap();

        let table = ds.get_table("main.sales").unwrap();
        let column = &table.columns["created_at"];
        let binding = column.binding("sale_date_year").unwrap();
        assert_eq!(binding.converted_part, Some(TimePart::Year));
        assert_eq!(
            binding.ds_formula.as_deref(),
            Some("CAST(STRFTIME('%Y', sales.created_at) AS INTEGER)")
        );
        assert!(ds.registry.has("sale_date_month"));
        // Disabled part is skipped.
        assert!(!ds.registry.has("sale_date_minute"));
        assert!(column.binding("sale_date_minute").is_none());
    }

    #[test]
    fn test_unknown_bound_field_rejected() {
        let mut cfg = ds_config();
        let table = cfg.tables.get_mut("main.sales").unwrap();
        table.columns.insert(
            "mystery".into(),
            serde_json::from_str(r#"{"fields": ["unknown_field"]}"#).unwrap(),
        );
        let err = DataSource::from_config(
            "main",
            &cfg,
            &Settings::default(),
            &warehouse_registry(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown_field"));
    }

    #[test]
    fn test_incompatible_shadow_rejected() {
        let mut cfg = ds_config();
        cfg.metrics = vec![serde_json::from_str(
            r#"{"name": "revenue", "type": "float", "aggregation": "max"}"#,
        )
        .unwrap()];
        let err = DataSource::from_config(
            "main",
            &cfg,
            &Settings::default(),
            &warehouse_registry(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("shadows"));
    }

    #[test]
    fn test_create_fields() {
        let cfg: DataSourceConfig = serde_json::from_str(
            r#"{
                "connect": "sqlite://:memory:",
                "tables": {
                    "main.facts": {
                        "type": "metric",
                        "create_fields": true,
                        "primary_key": ["row_id"],
                        "columns": {
                            "row_id": {"type": "integer"},
                            "amount": {"type": "float"},
                            "label": {}
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        let ds = DataSource::from_config(
            "main",
            &cfg,
            &Settings::default(),
            &FieldRegistry::new(),
        )
        .unwrap();
        let amount = ds.registry.get("amount").unwrap();
        assert_eq!(amount.aggregation(), Some(AggregationType::Sum));
        let label = ds.registry.get("label").unwrap();
        assert!(label.is_dimension());
        // Primary key columns become dimensions even when numeric.
        assert!(ds.registry.get("row_id").unwrap().is_dimension());
    }
}
