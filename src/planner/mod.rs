//! The grain-satisfaction planner.
//!
//! Given requested metrics, dimensions and criteria, the planner
//! expands formula fields to their leaves, derives the grain, finds
//! candidate table sets per leaf metric across all datasources, and
//! selects a minimal set of datasource queries with a greedy cover.

pub mod plan;

pub use plan::{compile_query, DataSourceQuery, PlanColumn, PlanColumnKind};

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::model::field::{Field, FieldRegistry};
use crate::model::formula::{self, ExpandedFormula, FieldResolver};
use crate::report::criteria::Criterion;
use crate::schema::graph::TableSet;
use crate::schema::table::TableType;
use crate::warehouse::Warehouse;

/// Field resolution for one report: ad-hoc fields shadow the warehouse
/// scopes.
pub struct ReportScope<'a> {
    pub warehouse: &'a Warehouse,
    pub adhoc: FieldRegistry,
}

impl<'a> ReportScope<'a> {
    pub fn new(warehouse: &'a Warehouse) -> Self {
        Self {
            warehouse,
            adhoc: FieldRegistry::new(),
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.adhoc.get(name).or_else(|| self.warehouse.get_field(name))
    }
}

impl FieldResolver for ReportScope<'_> {
    fn resolve_field(&self, name: &str) -> Option<&Field> {
        self.get_field(name)
    }
}

/// A requested output field: a leaf passthrough or a formula over
/// leaves, evaluated at the combined layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub expanded: Option<ExpandedFormula>,
}

/// The full execution plan for a report.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub queries: Vec<DataSourceQuery>,
    pub grain: BTreeSet<String>,
    /// Leaf metrics to materialize, in derivation order (includes
    /// weighting metrics pulled in as forced dependencies).
    pub leaf_metrics: Vec<String>,
    /// Requested metrics in request order.
    pub metrics: Vec<OutputField>,
    /// Requested dimensions in request order.
    pub dimensions: Vec<OutputField>,
}

/// One candidate assignment for a leaf metric.
#[derive(Debug, Clone)]
struct Candidate {
    /// Index of the datasource in warehouse priority order.
    ds_index: usize,
    table_priority: i32,
    /// Table the metric's column actually lives on (anchor or sibling).
    binder_table: String,
    table_set: TableSet,
}

/// Key grouping metrics that share one datasource query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueryKey {
    ds_index: usize,
    anchor: String,
    join: Option<crate::schema::graph::Join>,
}

#[derive(Debug)]
struct QueryDraft {
    table_set: TableSet,
    metrics: Vec<String>,
    sibling_tables: Vec<String>,
}

fn draft_size(drafts: &BTreeMap<QueryKey, QueryDraft>, candidate: &Candidate) -> usize {
    let key = QueryKey {
        ds_index: candidate.ds_index,
        anchor: candidate.table_set.ds_table.clone(),
        join: candidate.table_set.join.clone(),
    };
    drafts.get(&key).map(|d| d.metrics.len()).unwrap_or(0)
}

pub struct Planner<'a> {
    scope: &'a ReportScope<'a>,
}

impl<'a> Planner<'a> {
    pub fn new(scope: &'a ReportScope<'a>) -> Self {
        Self { scope }
    }

    /// Plan a report. `metrics` and `dimensions` are requested names
    /// (ad-hoc fields already registered in the scope); criteria have
    /// subreport operators resolved.
    pub fn plan(
        &self,
        metrics: &[String],
        dimensions: &[String],
        criteria: &[Criterion],
    ) -> Result<Plan> {
        if metrics.is_empty() && dimensions.is_empty() {
            return Err(Error::UnsupportedOperation(
                "a report needs at least one metric or dimension".into(),
            ));
        }

        let (outputs_m, leaf_metrics, mut grain) = self.expand_metrics(metrics)?;
        let outputs_d = self.expand_dimensions(dimensions, &mut grain)?;
        self.check_criteria(criteria, &mut grain)?;

        let queries = if leaf_metrics.is_empty() {
            self.plan_pure_dimensions(&grain, criteria)?
        } else {
            self.plan_metrics(&leaf_metrics, &grain, criteria)?
        };

        Ok(Plan {
            queries,
            grain,
            leaf_metrics,
            metrics: outputs_m,
            dimensions: outputs_d,
        })
    }

    /// Expand requested metrics: formula metrics contribute their
    /// metric leaves (and dimension leaves to the grain); weighted
    /// leaves force their weighting metric in as well.
    fn expand_metrics(
        &self,
        requested: &[String],
    ) -> Result<(Vec<OutputField>, Vec<String>, BTreeSet<String>)> {
        let mut outputs = Vec::new();
        let mut leaves: Vec<String> = Vec::new();
        let mut grain = BTreeSet::new();

        let mut push_leaf = |name: &str, leaves: &mut Vec<String>| {
            if !leaves.iter().any(|l| l == name) {
                leaves.push(name.to_string());
            }
        };

        for name in requested {
            let field = self
                .scope
                .get_field(name)
                .ok_or_else(|| Error::field_config(name, "unknown metric"))?;
            if !field.is_metric() {
                return Err(Error::field_config(name, "field is not a metric"));
            }

            match field.formula() {
                Some(body) => {
                    let expanded = formula::expand_formula(name, body, self.scope)?;
                    for leaf in &expanded.leaves {
                        let leaf_field = self
                            .scope
                            .get_field(leaf)
                            .ok_or_else(|| Error::field_config(leaf, "unknown field"))?;
                        if leaf_field.is_metric() {
                            push_leaf(leaf, &mut leaves);
                        } else {
                            grain.insert(leaf.clone());
                        }
                    }
                    outputs.push(OutputField {
                        name: name.clone(),
                        expanded: Some(expanded),
                    });
                }
                None => {
                    push_leaf(name, &mut leaves);
                    outputs.push(OutputField {
                        name: name.clone(),
                        expanded: None,
                    });
                }
            }
        }

        // Weighting metrics ride along as forced dependencies.
        let mut forced = Vec::new();
        for leaf in &leaves {
            if let Some(weighting) = self
                .scope
                .get_field(leaf)
                .and_then(|f| f.weighting_metric())
            {
                forced.push(weighting.to_string());
            }
        }
        for weighting in forced {
            push_leaf(&weighting, &mut leaves);
        }

        Ok((outputs, leaves, grain))
    }

    fn expand_dimensions(
        &self,
        requested: &[String],
        grain: &mut BTreeSet<String>,
    ) -> Result<Vec<OutputField>> {
        let mut outputs = Vec::new();
        for name in requested {
            let field = self
                .scope
                .get_field(name)
                .ok_or_else(|| Error::field_config(name, "unknown dimension"))?;
            if !field.is_dimension() {
                return Err(Error::field_config(name, "field is not a dimension"));
            }
            match field.formula() {
                Some(body) => {
                    let expanded = formula::expand_formula(name, body, self.scope)?;
                    grain.extend(expanded.leaves.iter().cloned());
                    outputs.push(OutputField {
                        name: name.clone(),
                        expanded: Some(expanded),
                    });
                }
                None => {
                    grain.insert(name.clone());
                    outputs.push(OutputField {
                        name: name.clone(),
                        expanded: None,
                    });
                }
            }
        }
        Ok(outputs)
    }

    /// Criteria fields join the grain; formula dimensions and metrics
    /// are not filterable at the datasource layer.
    fn check_criteria(
        &self,
        criteria: &[Criterion],
        grain: &mut BTreeSet<String>,
    ) -> Result<()> {
        for criterion in criteria {
            if criterion.op.is_subreport() {
                return Err(Error::UnsupportedOperation(
                    "subreport criteria must be resolved before planning".into(),
                ));
            }
            let field = self
                .scope
                .get_field(&criterion.field)
                .ok_or_else(|| Error::field_config(&criterion.field, "unknown criteria field"))?;
            if !field.criteria_allowed() {
                return Err(Error::UnsupportedOperation(format!(
                    "criteria on formula dimension '{}'",
                    criterion.field
                )));
            }
            if !field.is_dimension() {
                return Err(Error::UnsupportedOperation(format!(
                    "criteria field '{}' is not a dimension (use row_filters for metrics)",
                    criterion.field
                )));
            }
            grain.insert(criterion.field.clone());
        }
        Ok(())
    }

    /// Candidate table sets for one leaf metric across all datasources,
    /// in deterministic priority order.
    fn candidates_for_metric(&self, metric: &str, grain: &BTreeSet<String>) -> Vec<Candidate> {
        let warehouse = self.scope.warehouse;
        let settings = &warehouse.settings;
        let field = self.scope.get_field(metric);
        let weighting = field.and_then(|f| f.weighting_metric());

        // required_grain prunes candidates wholesale.
        if let Some(required) = field.and_then(|f| f.required_grain()) {
            if !required.iter().all(|d| grain.contains(d)) {
                return Vec::new();
            }
        }

        let mut target_fields: BTreeSet<String> = [metric.to_string()].into();
        if let Some(weighting) = weighting {
            target_fields.insert(weighting.to_string());
        }

        let mut out = Vec::new();
        for (ds_index, ds) in warehouse.datasources.iter().enumerate() {
            for anchor in ds.metric_tables() {
                // The metric may live on the anchor or on a declared
                // sibling, which shares the primary key.
                let binder = if anchor.has_field(metric) {
                    Some(anchor.name.clone())
                } else {
                    anchor
                        .siblings
                        .iter()
                        .find(|s| {
                            ds.get_table(s.as_str())
                                .map(|t| t.has_field(metric))
                                .unwrap_or(false)
                        })
                        .cloned()
                };
                let Some(binder) = binder else { continue };
                if let Some(weighting) = weighting {
                    let binder_table = ds.get_table(&binder).expect("binder table exists");
                    if !binder_table.has_field(weighting) {
                        continue;
                    }
                }

                for table_set in
                    ds.find_possible_table_sets(anchor, grain, &target_fields, settings)
                {
                    out.push(Candidate {
                        ds_index,
                        table_priority: anchor.priority,
                        binder_table: binder.clone(),
                        table_set,
                    });
                }
            }
        }

        out.sort_by(|a, b| {
            a.table_set
                .join_count()
                .cmp(&b.table_set.join_count())
                .then_with(|| a.ds_index.cmp(&b.ds_index))
                .then_with(|| a.table_priority.cmp(&b.table_priority))
                .then_with(|| a.table_set.ds_table.cmp(&b.table_set.ds_table))
                .then_with(|| a.table_set.join.cmp(&b.table_set.join))
        });
        out
    }

    /// Greedy cover: rarest metric first, each assigned to the
    /// candidate query already covering the most metrics.
    fn plan_metrics(
        &self,
        leaf_metrics: &[String],
        grain: &BTreeSet<String>,
        criteria: &[Criterion],
    ) -> Result<Vec<DataSourceQuery>> {
        let mut candidates: BTreeMap<&str, Vec<Candidate>> = BTreeMap::new();
        let mut unsatisfiable = Vec::new();
        for metric in leaf_metrics {
            let found = self.candidates_for_metric(metric, grain);
            if found.is_empty() {
                unsatisfiable.push(metric.clone());
            }
            candidates.insert(metric.as_str(), found);
        }
        if !unsatisfiable.is_empty() {
            return Err(Error::UnsupportedGrain {
                metrics: unsatisfiable,
                grain: grain.clone(),
            });
        }

        // Rarest first; stable, so derivation order breaks ties.
        let mut order: Vec<&String> = leaf_metrics.iter().collect();
        order.sort_by_key(|m| candidates[m.as_str()].len());

        let mut drafts: BTreeMap<QueryKey, QueryDraft> = BTreeMap::new();
        for metric in order {
            let options = &candidates[metric.as_str()];
            // Most already-assigned metrics wins; ties keep the
            // pre-sorted candidate order (fewest joins, datasource
            // priority, table priority).
            let mut chosen = &options[0];
            let mut best_shared = draft_size(&drafts, chosen);
            for candidate in &options[1..] {
                let shared = draft_size(&drafts, candidate);
                if shared > best_shared {
                    chosen = candidate;
                    best_shared = shared;
                }
            }

            let key = QueryKey {
                ds_index: chosen.ds_index,
                anchor: chosen.table_set.ds_table.clone(),
                join: chosen.table_set.join.clone(),
            };
            let draft = drafts.entry(key).or_insert_with(|| QueryDraft {
                table_set: chosen.table_set.clone(),
                metrics: Vec::new(),
                sibling_tables: Vec::new(),
            });
            draft.metrics.push(metric.clone());
            if chosen.binder_table != chosen.table_set.ds_table
                && !draft.sibling_tables.contains(&chosen.binder_table)
            {
                draft.sibling_tables.push(chosen.binder_table.clone());
            }
        }

        let warehouse = self.scope.warehouse;
        let mut queries = Vec::new();
        for (key, draft) in &drafts {
            let ds = &warehouse.datasources[key.ds_index];
            queries.push(compile_query(
                self.scope,
                ds,
                &draft.table_set,
                &draft.sibling_tables,
                &draft.metrics,
                grain,
                criteria,
            )?);
        }
        Ok(queries)
    }

    /// Pure-dimension report: one query against the smallest table set
    /// covering the grain.
    fn plan_pure_dimensions(
        &self,
        grain: &BTreeSet<String>,
        criteria: &[Criterion],
    ) -> Result<Vec<DataSourceQuery>> {
        let warehouse = self.scope.warehouse;
        let settings = &warehouse.settings;

        // Rank every covering table set: fewest joins, dimension tables
        // ahead of metric tables, then datasource/table priority.
        let mut best: Option<((usize, usize, usize, i32, String), usize, TableSet)> = None;
        for (ds_index, ds) in warehouse.datasources.iter().enumerate() {
            for table in ds.tables.values() {
                for table_set in
                    ds.find_possible_table_sets(table, grain, &BTreeSet::new(), settings)
                {
                    let dim_rank = match table.table_type {
                        TableType::Dimension => 0,
                        TableType::Metric => 1,
                    };
                    let rank = (
                        table_set.join_count(),
                        dim_rank,
                        ds_index,
                        table.priority,
                        table_set.ds_table.clone(),
                    );
                    if best.as_ref().map(|(r, _, _)| rank < *r).unwrap_or(true) {
                        best = Some((rank, ds_index, table_set));
                    }
                }
            }
        }

        let Some((_, ds_index, table_set)) = best else {
            return Err(Error::UnsupportedGrain {
                metrics: Vec::new(),
                grain: grain.clone(),
            });
        };
        let ds = &warehouse.datasources[ds_index];
        Ok(vec![compile_query(
            self.scope,
            ds,
            &table_set,
            &[],
            &[],
            grain,
            criteria,
        )?])
    }
}
