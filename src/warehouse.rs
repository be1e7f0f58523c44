//! The Warehouse: global field registry plus the ordered datasources.
//!
//! Built once from a [`WarehouseConfig`]; read-mostly afterwards. The
//! only mutations are the administrative [`Warehouse::add_metric`] /
//! [`Warehouse::add_dimension`] calls, which re-validate consistency.

use std::collections::BTreeSet;

use crate::config::{DimensionConfig, MetricConfig, Settings, WarehouseConfig};
use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::model::field::{Field, FieldRegistry};
use crate::model::formula::{self, FieldResolver};
use crate::model::types::FieldType;
use crate::report::{Report, ReportParams, ReportResult};

#[derive(Debug)]
pub struct Warehouse {
    pub name: String,
    /// Global field registry; datasource overlays may shadow it only
    /// compatibly.
    pub registry: FieldRegistry,
    /// Priority order: earlier datasources win ties.
    pub datasources: Vec<DataSource>,
    pub settings: Settings,
    /// Metadata-store row id once saved.
    pub id: Option<i64>,
}

impl Warehouse {
    /// Build from config with explicit settings (tests and embedders);
    /// [`Warehouse::from_config`] uses the process environment.
    pub fn from_config_with_settings(
        name: &str,
        config: &WarehouseConfig,
        settings: Settings,
    ) -> Result<Self> {
        let mut registry = FieldRegistry::new();
        for metric_cfg in &config.metrics {
            registry.add_metric_config(metric_cfg)?;
        }
        for dim_cfg in &config.dimensions {
            registry.add_dimension_config(dim_cfg)?;
        }

        if config.datasources.is_empty() {
            return Err(Error::InvalidWarehouseConfig(
                "at least one datasource is required".into(),
            ));
        }

        let mut datasources = Vec::new();
        for (ds_name, ds_cfg) in &config.datasources {
            datasources.push(DataSource::from_config(ds_name, ds_cfg, &settings, &registry)?);
        }
        // Priority order; the BTreeMap already fixed name order for ties.
        datasources.sort_by_key(|ds| ds.priority);

        let warehouse = Self {
            name: name.to_string(),
            registry,
            datasources,
            settings,
            id: None,
        };
        warehouse.check_consistency()?;
        Ok(warehouse)
    }

    pub fn from_config(name: &str, config: &WarehouseConfig) -> Result<Self> {
        Self::from_config_with_settings(
            name,
            config,
            crate::config::settings::GLOBAL_SETTINGS.clone(),
        )
    }

    pub fn datasource(&self, name: &str) -> Option<&DataSource> {
        self.datasources.iter().find(|ds| ds.name == name)
    }

    /// Resolve a field: global registry first, then datasource overlays
    /// in priority order.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        if let Some(field) = self.registry.get(name) {
            return Some(field);
        }
        self.datasources
            .iter()
            .find_map(|ds| ds.registry.get(name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    pub fn get_metric(&self, name: &str) -> Result<&Field> {
        match self.get_field(name) {
            Some(field) if field.is_metric() => Ok(field),
            Some(_) => Err(Error::field_config(name, "field is not a metric")),
            None => Err(Error::field_config(name, "unknown metric")),
        }
    }

    pub fn get_dimension(&self, name: &str) -> Result<&Field> {
        match self.get_field(name) {
            Some(field) if field.is_dimension() => Ok(field),
            Some(_) => Err(Error::field_config(name, "field is not a dimension")),
            None => Err(Error::field_config(name, "unknown dimension")),
        }
    }

    pub fn metric_names(&self) -> Vec<&str> {
        let mut names: BTreeSet<&str> = self.registry.metric_names().into_iter().collect();
        for ds in &self.datasources {
            names.extend(ds.registry.metric_names());
        }
        names.into_iter().collect()
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        let mut names: BTreeSet<&str> = self.registry.dimension_names().into_iter().collect();
        for ds in &self.datasources {
            names.extend(ds.registry.dimension_names());
        }
        names.into_iter().collect()
    }

    /// Administrative: add a metric to the global registry. The
    /// registry is left untouched when the addition breaks consistency.
    pub fn add_metric(&mut self, cfg: &MetricConfig) -> Result<()> {
        let backup = self.registry.clone();
        let applied = match self.registry.add_metric_config(cfg) {
            Ok(()) => self.check_consistency(),
            Err(e) => Err(e),
        };
        if applied.is_err() {
            self.registry = backup;
        }
        applied
    }

    /// Administrative: add a dimension to the global registry. The
    /// registry is left untouched when the addition breaks consistency.
    pub fn add_dimension(&mut self, cfg: &DimensionConfig) -> Result<()> {
        let backup = self.registry.clone();
        let applied = match self.registry.add_dimension_config(cfg) {
            Ok(()) => self.check_consistency(),
            Err(e) => Err(e),
        };
        if applied.is_err() {
            self.registry = backup;
        }
        applied
    }

    /// Warehouse-wide invariants: no formula cycles, formulas expand
    /// within the depth bound to known leaves of the right kinds, and
    /// weighting/required-grain references resolve.
    pub fn check_consistency(&self) -> Result<()> {
        let all_fields = || {
            self.registry
                .fields()
                .chain(self.datasources.iter().flat_map(|ds| ds.registry.fields()))
        };

        formula::check_cycles(all_fields(), self)?;

        for field in all_fields() {
            if let Some(body) = field.formula() {
                let expanded = formula::expand_formula(field.name(), body, self)?;
                match field.field_type() {
                    FieldType::Metric => {
                        let has_metric_leaf = expanded.leaves.iter().any(|leaf| {
                            self.get_field(leaf).map(|f| f.is_metric()).unwrap_or(false)
                        });
                        if !has_metric_leaf {
                            return Err(Error::field_config(
                                field.name(),
                                "formula metric must resolve to at least one metric",
                            ));
                        }
                    }
                    FieldType::Dimension => {
                        for leaf in &expanded.leaves {
                            if self.get_field(leaf).map(|f| f.is_metric()).unwrap_or(false) {
                                return Err(Error::field_config(
                                    field.name(),
                                    format!("formula dimension references metric '{}'", leaf),
                                ));
                            }
                        }
                    }
                }
            }

            if let Some(weighting) = field.weighting_metric() {
                match self.get_field(weighting) {
                    Some(w) if w.is_metric() => {}
                    _ => {
                        return Err(Error::field_config(
                            field.name(),
                            format!("weighting metric '{}' is not a known metric", weighting),
                        ));
                    }
                }
            }

            if let Some(required) = field.required_grain() {
                for dim in required {
                    match self.get_field(dim) {
                        Some(f) if f.is_dimension() => {}
                        _ => {
                            return Err(Error::field_config(
                                field.name(),
                                format!("required_grain names unknown dimension '{}'", dim),
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

impl Warehouse {
    /// Execute a report against this warehouse.
    pub fn execute(&self, params: ReportParams) -> Result<ReportResult> {
        Report::new(self, params)?.execute()
    }

    /// Persist this warehouse's descriptor in the metadata store.
    pub fn save(&mut self, name: &str, config_url: &str) -> Result<i64> {
        let store = MetadataStore::open(&self.settings.db_url)?;
        let id = store.save_warehouse(name, config_url)?;
        self.id = Some(id);
        Ok(id)
    }

    /// Persist a report spec; params are stored verbatim.
    pub fn save_report(&self, params: &ReportParams) -> Result<i64> {
        let store = MetadataStore::open(&self.settings.db_url)?;
        store.save_report(self.id.unwrap_or(0), params)
    }

    /// Execute a saved report spec.
    pub fn execute_id(&self, spec_id: i64) -> Result<ReportResult> {
        let store = MetadataStore::open(&self.settings.db_url)?;
        let saved = store.load_report(spec_id)?;
        self.execute(saved.params)
    }

    /// Delete a saved report spec.
    pub fn delete_report(&self, spec_id: i64) -> Result<()> {
        let store = MetadataStore::open(&self.settings.db_url)?;
        store.delete_report(spec_id)
    }
}

impl FieldResolver for Warehouse {
    fn resolve_field(&self, name: &str) -> Option<&Field> {
        self.get_field(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WarehouseConfig {
        WarehouseConfig::from_json(
            r#"{
                "metrics": [
                    {"name": "revenue", "type": "float", "aggregation": "sum"},
                    {"name": "leads", "type": "integer", "aggregation": "count_distinct"},
                    {"name": "rpl", "formula": "{revenue}/{leads}", "rounding": 2}
                ],
                "dimensions": [
                    {"name": "lead_id", "type": "integer"},
                    {"name": "partner_name", "type": "string"}
                ],
                "datasources": {
                    "main": {
                        "connect": "sqlite://:memory:",
                        "tables": {
                            "main.leads": {
                                "type": "metric",
                                "primary_key": ["lead_id"],
                                "columns": {
                                    "id": {"fields": ["lead_id", "leads"]},
                                    "revenue": {"fields": ["revenue"]},
                                    "partner": {"fields": ["partner_name"]}
                                }
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let wh =
            Warehouse::from_config_with_settings("test", &config(), Settings::default()).unwrap();
        assert!(wh.get_field("revenue").unwrap().is_metric());
        assert!(wh.get_field("partner_name").unwrap().is_dimension());
        assert_eq!(wh.get_field("rpl").unwrap().formula(), Some("{revenue}/{leads}"));
        assert!(wh.get_field("nope").is_none());
        assert!(wh.get_metric("partner_name").is_err());
    }

    #[test]
    fn test_formula_cycle_fatal_at_build() {
        let mut cfg = config();
        cfg.metrics.push(
            serde_json::from_str(r#"{"name": "a", "formula": "{b}+1"}"#).unwrap(),
        );
        cfg.metrics.push(
            serde_json::from_str(r#"{"name": "b", "formula": "{a}+1"}"#).unwrap(),
        );
        let err =
            Warehouse::from_config_with_settings("test", &cfg, Settings::default()).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)));
    }

    #[test]
    fn test_formula_metric_needs_metric_leaf() {
        let mut cfg = config();
        cfg.metrics.push(
            serde_json::from_str(r#"{"name": "dims_only", "formula": "{partner_name}"}"#)
                .unwrap(),
        );
        let err =
            Warehouse::from_config_with_settings("test", &cfg, Settings::default()).unwrap_err();
        assert!(err.to_string().contains("at least one metric"));
    }

    #[test]
    fn test_add_metric_revalidates() {
        let mut wh =
            Warehouse::from_config_with_settings("test", &config(), Settings::default()).unwrap();
        let ok: MetricConfig =
            serde_json::from_str(r#"{"name": "rpl_squared", "formula": "{rpl}*{rpl}"}"#).unwrap();
        wh.add_metric(&ok).unwrap();
        assert!(wh.has_field("rpl_squared"));

        let bad: MetricConfig =
            serde_json::from_str(r#"{"name": "broken", "formula": "{missing}*2"}"#).unwrap();
        assert!(wh.add_metric(&bad).is_err());
    }

    #[test]
    fn test_no_datasources_rejected() {
        let cfg = WarehouseConfig::from_json(r#"{"metrics": [], "dimensions": []}"#).unwrap();
        assert!(Warehouse::from_config_with_settings("t", &cfg, Settings::default()).is_err());
    }
}
