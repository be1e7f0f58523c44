//! Physical tables, their columns and the column -> field bindings.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{ColumnConfig, FieldBindingConfig, TableConfig};
use crate::error::{Error, Result};
use crate::model::formula::check_allowed_sql;
use crate::model::types::DataType;
use crate::sql::TimePart;

/// Whether a table anchors metrics or only provides dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Metric,
    Dimension,
}

impl TableType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "metric" => Some(TableType::Metric),
            "dimension" => Some(TableType::Dimension),
            _ => None,
        }
    }
}

/// One field a column can produce, with optional datasource formula and
/// per-operator criteria rewrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnBinding {
    /// Expression in the source dialect used instead of the bare column.
    pub ds_formula: Option<String>,
    /// Operator -> replacement predicate template (`{value}` placeholder).
    pub ds_criteria_conversions: BTreeMap<String, String>,
    /// Extra grain requirement declared at the binding level.
    pub required_grain: Option<Vec<String>>,
    /// Set when this binding was synthesized by type conversion; the
    /// planner uses it for invertible criteria rewrites.
    pub converted_part: Option<TimePart>,
}

/// A physical column and the set of fields it can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: Option<DataType>,
    /// Field name -> binding.
    pub bindings: BTreeMap<String, ColumnBinding>,
    pub allow_type_conversions: bool,
    pub type_conversion_prefix: Option<String>,
    pub disabled_type_conversions: BTreeSet<String>,
}

impl Column {
    pub fn from_config(table: &str, name: &str, cfg: &ColumnConfig) -> Result<Self> {
        let mut bindings = BTreeMap::new();
        for field in &cfg.fields {
            let (field_name, binding) = match field {
                FieldBindingConfig::Name(n) => (n.clone(), ColumnBinding::default()),
                FieldBindingConfig::Full {
                    name,
                    ds_formula,
                    ds_criteria_conversions,
                    required_grain,
                } => {
                    if let Some(formula) = ds_formula {
                        check_allowed_sql(formula)?;
                    }
                    (
                        name.clone(),
                        ColumnBinding {
                            ds_formula: ds_formula.clone(),
                            ds_criteria_conversions: ds_criteria_conversions.clone(),
                            required_grain: required_grain.clone(),
                            converted_part: None,
                        },
                    )
                }
            };
            if bindings.insert(field_name.clone(), binding).is_some() {
                return Err(Error::ds_config(
                    table,
                    format!("column '{}' binds field '{}' twice", name, field_name),
                ));
            }
        }

        let data_type = match &cfg.data_type {
            Some(s) => Some(DataType::parse(s).ok_or_else(|| {
                Error::ds_config(table, format!("column '{}': unknown type '{}'", name, s))
            })?),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            data_type,
            bindings,
            allow_type_conversions: cfg.allow_type_conversions,
            type_conversion_prefix: cfg.type_conversion_prefix.clone(),
            disabled_type_conversions: cfg.disabled_type_conversions.iter().cloned().collect(),
        })
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.bindings.contains_key(field)
    }

    pub fn binding(&self, field: &str) -> Option<&ColumnBinding> {
        self.bindings.get(field)
    }
}

/// A physical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Fully qualified name, e.g. `main.sales`.
    pub name: String,
    pub table_type: TableType,
    /// Parent table FQN; children may join upward to it.
    pub parent: Option<String>,
    /// Tables sharing this table's primary key.
    pub siblings: Vec<String>,
    /// Ordered dimension names forming the primary key.
    pub primary_key: Vec<String>,
    /// Dimensions on the table that are not at PK granularity.
    pub incomplete_dimensions: BTreeSet<String>,
    pub priority: i32,
    pub use_full_column_names: bool,
    pub prefix_with: Option<String>,
    pub columns: BTreeMap<String, Column>,
}

impl Table {
    pub fn from_config(name: &str, cfg: &TableConfig) -> Result<Self> {
        let table_type = TableType::parse(&cfg.table_type).ok_or_else(|| {
            Error::ds_config(name, format!("unknown table type '{}'", cfg.table_type))
        })?;

        let mut columns = BTreeMap::new();
        for (col_name, col_cfg) in &cfg.columns {
            columns.insert(col_name.clone(), Column::from_config(name, col_name, col_cfg)?);
        }

        Ok(Self {
            name: name.to_string(),
            table_type,
            parent: cfg.parent.clone(),
            siblings: cfg.siblings.clone(),
            primary_key: cfg.primary_key.clone(),
            incomplete_dimensions: cfg.incomplete_dimensions.iter().cloned().collect(),
            priority: cfg.priority,
            use_full_column_names: cfg.use_full_column_names,
            prefix_with: cfg.prefix_with.clone(),
            columns,
        })
    }

    /// Every primary key field must be bound to some column. Checked
    /// after field synthesis (`create_fields`, type conversions).
    pub fn check_primary_key(&self) -> Result<()> {
        for pk_field in &self.primary_key {
            if !self.has_field(pk_field) {
                return Err(Error::ds_config(
                    &self.name,
                    format!("primary key field '{}' is not bound to any column", pk_field),
                ));
            }
        }
        Ok(())
    }

    /// Bare table name without the schema part, as used in column
    /// references inside queries.
    pub fn bare_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// `table.column` reference text for ds_formula interpolation.
    pub fn column_fullname(&self, column: &str) -> String {
        format!("{}.{}", self.bare_name(), column)
    }

    /// All fields bound to any column of this table.
    pub fn fields(&self) -> BTreeSet<String> {
        self.columns
            .values()
            .flat_map(|c| c.bindings.keys().cloned())
            .collect()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.columns.values().any(|c| c.has_field(field))
    }

    /// Columns bound to `field`, in deterministic name order.
    pub fn columns_with_field(&self, field: &str) -> Vec<&Column> {
        self.columns.values().filter(|c| c.has_field(field)).collect()
    }

    /// Whether this table provides `dimension` at primary-key grain:
    /// the dimension is bound here and is either part of the PK, a pure
    /// dimension table's column, or not declared incomplete.
    pub fn provides_dimension(&self, dimension: &str) -> bool {
        if !self.has_field(dimension) {
            return false;
        }
        self.primary_key.iter().any(|pk| pk == dimension)
            || self.table_type == TableType::Dimension
            || !self.incomplete_dimensions.contains(dimension)
    }

    /// The subset of `grain` this table provides directly.
    pub fn provided_dimensions<'a>(
        &self,
        grain: &'a BTreeSet<String>,
    ) -> BTreeSet<&'a String> {
        grain.iter().filter(|d| self.provides_dimension(d)).collect()
    }
}
