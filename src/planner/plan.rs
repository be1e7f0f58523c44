//! Compilation of a chosen table set into one datasource SELECT.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::model::field::Field;
use crate::model::formula::FieldResolver;
use crate::model::types::{AggregationType, DataType};
use crate::report::criteria::{CriteriaOperator, Criterion};
use crate::schema::graph::TableSet;
use crate::schema::table::{Column, ColumnBinding, Table};
use crate::sql::{
    self, count, count_distinct, raw, table_col, Dialect, Expr, ExprExt, Join as SqlJoin, Query,
    SelectExpr, TableRef, TimePart,
};

static CONTAINS_AGGREGATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(sum|count|avg|min|max)\s*\(").unwrap());

/// How the combined layer ingests one output column of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanColumnKind {
    Dimension,
    Metric(AggregationType),
    WeightedNumerator,
    WeightedDenominator,
}

/// One output column of a datasource query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanColumn {
    /// Combined-layer column name (the select alias).
    pub name: String,
    /// The field this column carries.
    pub field: String,
    pub kind: PlanColumnKind,
    pub data_type: DataType,
}

/// A compiled per-datasource query plan.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceQuery {
    pub datasource: String,
    pub dialect: Dialect,
    pub table_set: TableSet,
    /// Leaf metrics this query covers, in assignment order.
    pub metrics: Vec<String>,
    /// Grain dimensions, sorted.
    pub dimensions: Vec<String>,
    pub schema: Vec<PlanColumn>,
    pub sql: String,
}

impl DataSourceQuery {
    /// Columns of `kind == Dimension`, in schema order.
    pub fn dimension_columns(&self) -> Vec<&PlanColumn> {
        self.schema
            .iter()
            .filter(|c| c.kind == PlanColumnKind::Dimension)
            .collect()
    }
}

/// Compile one query: anchor table, sibling joins for metrics living on
/// siblings, the grain join chain, select list, criteria and grouping.
#[allow(clippy::too_many_arguments)]
pub fn compile_query(
    resolver: &dyn FieldResolver,
    ds: &DataSource,
    table_set: &TableSet,
    sibling_tables: &[String],
    metrics: &[String],
    grain: &BTreeSet<String>,
    criteria: &[Criterion],
) -> Result<DataSourceQuery> {
    let anchor = ds.get_table(&table_set.ds_table).ok_or_else(|| {
        Error::ds_config(&ds.name, format!("unknown table '{}'", table_set.ds_table))
    })?;

    // Defensive required-grain re-validation.
    for metric in metrics {
        if let Some(field) = resolver.resolve_field(metric) {
            if let Some(required) = field.required_grain() {
                if !required.iter().all(|d| grain.contains(d)) {
                    return Err(Error::UnsupportedGrain {
                        metrics: vec![metric.clone()],
                        grain: grain.clone(),
                    });
                }
            }
        }
    }

    // Tables participating, anchor first; used for binding lookup order.
    let mut table_order: Vec<&Table> = vec![anchor];
    for name in sibling_tables {
        if let Some(table) = ds.get_table(name) {
            table_order.push(table);
        }
    }
    if let Some(join) = &table_set.join {
        for name in join.tables() {
            if let Some(table) = ds.get_table(name) {
                if !table_order.iter().any(|t| t.name == table.name) {
                    table_order.push(table);
                }
            }
        }
    }

    let mut query = Query::new().from(TableRef::from_fqn(&anchor.name));
    if let Some(prefix) = &anchor.prefix_with {
        query = query.prefix_with(prefix);
    }

    // Sibling tables join on the shared primary key.
    for name in sibling_tables {
        let sibling = ds
            .get_table(name)
            .ok_or_else(|| Error::ds_config(&ds.name, format!("unknown sibling '{}'", name)))?;
        let on = join_predicate(anchor, sibling, &anchor.primary_key, &ds.name)?;
        query = query.join(SqlJoin::inner(TableRef::from_fqn(name), on));
    }

    // Grain join chain.
    if let Some(join) = &table_set.join {
        for part in &join.parts {
            let from = ds.get_table(&part.from_table).ok_or_else(|| {
                Error::ds_config(&ds.name, format!("unknown table '{}'", part.from_table))
            })?;
            let to = ds.get_table(&part.to_table).ok_or_else(|| {
                Error::ds_config(&ds.name, format!("unknown table '{}'", part.to_table))
            })?;
            let on = join_predicate(from, to, &part.join_fields, &ds.name)?;
            query = query.join(SqlJoin::inner(TableRef::from_fqn(&part.to_table), on));
        }
    }

    let mut schema = Vec::new();
    let mut group_exprs = Vec::new();

    // Dimensions first, in sorted grain order.
    for dimension in grain {
        let (table, column, binding) =
            find_binding(&table_order, dimension).ok_or_else(|| {
                Error::UnsupportedGrain {
                    metrics: metrics.to_vec(),
                    grain: grain.clone(),
                }
            })?;
        let expr = dimension_expr(table, column, binding);
        let alias = combined_column_name(&ds.name, table, dimension);
        let data_type = resolver
            .resolve_field(dimension)
            .map(|f| f.data_type())
            .unwrap_or(DataType::String);
        group_exprs.push(expr.clone());
        query = query.select_expr(SelectExpr::new(expr).with_alias(&alias));
        schema.push(PlanColumn {
            name: alias,
            field: dimension.clone(),
            kind: PlanColumnKind::Dimension,
            data_type,
        });
    }

    // Metrics, in assignment order.
    for metric in metrics {
        let field = resolver.resolve_field(metric).ok_or_else(|| {
            Error::field_config(metric, "unknown metric at compile time")
        })?;
        let (table, column, binding) = find_binding(&table_order, metric).ok_or_else(|| {
            Error::ds_config(
                &ds.name,
                format!("metric '{}' has no column in the chosen tables", metric),
            )
        })?;

        match field.weighting_metric() {
            Some(weighting) => {
                let (w_table, w_column, w_binding) = find_binding(&table_order, weighting)
                    .ok_or_else(|| {
                        Error::ds_config(
                            &ds.name,
                            format!(
                                "weighting metric '{}' is not available alongside '{}'",
                                weighting, metric
                            ),
                        )
                    })?;
                let value = base_expr(table, column, binding);
                let weight = base_expr(w_table, w_column, w_binding);
                // 1.0 multiplication keeps integer-typed columns from
                // rounding under integer division dialects.
                let numerator = sql::sum(raw("1.0").mul(value).mul(weight.clone()));
                let denominator = sql::sum(weight);
                let base = combined_column_name(&ds.name, table, metric);
                let num_alias = format!(
                    "{}{}",
                    base,
                    crate::model::field::WEIGHTED_NUMERATOR_SUFFIX
                );
                let den_alias = format!(
                    "{}{}",
                    base,
                    crate::model::field::WEIGHTED_DENOMINATOR_SUFFIX
                );
                query = query
                    .select_expr(SelectExpr::new(numerator).with_alias(&num_alias))
                    .select_expr(SelectExpr::new(denominator).with_alias(&den_alias));
                schema.push(PlanColumn {
                    name: num_alias,
                    field: metric.clone(),
                    kind: PlanColumnKind::WeightedNumerator,
                    data_type: DataType::Float,
                });
                schema.push(PlanColumn {
                    name: den_alias,
                    field: metric.clone(),
                    kind: PlanColumnKind::WeightedDenominator,
                    data_type: DataType::Float,
                });
            }
            None => {
                let aggregation = field.aggregation().unwrap_or(AggregationType::Sum);
                let expr = metric_expr(field, table, column, binding, aggregation);
                let alias = combined_column_name(&ds.name, table, metric);
                query = query.select_expr(SelectExpr::new(expr).with_alias(&alias));
                schema.push(PlanColumn {
                    name: alias,
                    field: metric.clone(),
                    kind: PlanColumnKind::Metric(aggregation),
                    data_type: field.data_type(),
                });
            }
        }
    }

    // Criteria; every criterion field is part of the grain.
    for criterion in criteria {
        let (table, column, binding) =
            find_binding(&table_order, &criterion.field).ok_or_else(|| {
                Error::UnsupportedGrain {
                    metrics: metrics.to_vec(),
                    grain: grain.clone(),
                }
            })?;
        query = query.filter(criterion_predicate(criterion, table, column, binding)?);
    }

    if !group_exprs.is_empty() {
        query = query.group_by(group_exprs);
    }

    let sql = query.to_sql(ds.dialect);
    tracing::debug!(datasource = %ds.name, %sql, "compiled datasource query");

    Ok(DataSourceQuery {
        datasource: ds.name.clone(),
        dialect: ds.dialect,
        table_set: table_set.clone(),
        metrics: metrics.to_vec(),
        dimensions: grain.iter().cloned().collect(),
        schema,
        sql,
    })
}

/// Combined-layer column name for a field produced by `table`.
pub fn combined_column_name(datasource: &str, table: &Table, field: &str) -> String {
    if table.use_full_column_names {
        format!("{}_{}_{}", datasource, table.name.replace('.', "_"), field)
    } else {
        field.to_string()
    }
}

/// Locate the binding for `field` among the participating tables,
/// preferring tables that provide it at PK grain.
fn find_binding<'a>(
    tables: &[&'a Table],
    field: &str,
) -> Option<(&'a Table, &'a Column, &'a ColumnBinding)> {
    let lookup = |require_grain: bool| {
        tables.iter().find_map(|table| {
            if require_grain && !table.provides_dimension(field) {
                return None;
            }
            table.columns.values().find_map(|column| {
                column
                    .binding(field)
                    .map(|binding| (*table, column, binding))
            })
        })
    };
    lookup(true).or_else(|| lookup(false))
}

fn join_predicate(from: &Table, to: &Table, fields: &[String], ds: &str) -> Result<Expr> {
    let mut predicate: Option<Expr> = None;
    for field in fields {
        let from_col = from
            .columns_with_field(field)
            .first()
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                Error::ds_config(
                    ds,
                    format!("table '{}' lacks join field '{}'", from.name, field),
                )
            })?;
        let to_col = to
            .columns_with_field(field)
            .first()
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                Error::ds_config(
                    ds,
                    format!("table '{}' lacks join field '{}'", to.name, field),
                )
            })?;
        let clause =
            table_col(from.bare_name(), &from_col).eq(table_col(to.bare_name(), &to_col));
        predicate = Some(match predicate {
            Some(existing) => existing.and(clause),
            None => clause,
        });
    }
    predicate.ok_or_else(|| {
        Error::ds_config(
            ds,
            format!("join between '{}' and '{}' has no fields", from.name, to.name),
        )
    })
}

/// Bare value expression for a binding (no aggregation applied).
fn base_expr(table: &Table, column: &Column, binding: &ColumnBinding) -> Expr {
    match &binding.ds_formula {
        Some(formula) => raw(format!("({})", formula)),
        None => table_col(table.bare_name(), &column.name),
    }
}

fn dimension_expr(table: &Table, column: &Column, binding: &ColumnBinding) -> Expr {
    base_expr(table, column, binding)
}

/// Aggregated metric expression: the declared ds_formula wins, and a
/// ds_formula that already aggregates is emitted as-is.
fn metric_expr(
    field: &Field,
    table: &Table,
    column: &Column,
    binding: &ColumnBinding,
    aggregation: AggregationType,
) -> Expr {
    if let Some(formula) = &binding.ds_formula {
        if CONTAINS_AGGREGATION.is_match(formula) {
            return raw(format!("({})", formula));
        }
    }
    let base = base_expr(table, column, binding);
    let aggregated = match aggregation {
        AggregationType::Sum => sql::sum(base),
        AggregationType::Mean => sql::avg(base),
        AggregationType::Count => count(base),
        AggregationType::CountDistinct => count_distinct(base),
        AggregationType::Min => sql::min(base),
        AggregationType::Max => sql::max(base),
    };
    match field.ifnull() {
        Some(default) => sql::ifnull(aggregated, sql::lit_float(default)),
        None => aggregated,
    }
}

/// Criterion -> WHERE predicate, honoring declared per-operator
/// conversions and the invertible year rewrite for converted columns.
fn criterion_predicate(
    criterion: &Criterion,
    table: &Table,
    column: &Column,
    binding: &ColumnBinding,
) -> Result<Expr> {
    if let Some(template) = binding.ds_criteria_conversions.get(criterion.op.as_str()) {
        return Ok(raw(template.replace("{value}", &criterion.value_sql_text())).paren());
    }

    if binding.converted_part == Some(TimePart::Year) {
        if let Some(year) = criterion.value.as_i64() {
            let base = table_col(table.bare_name(), &column.name);
            let start = sql::lit_str(&format!("{:04}-01-01", year));
            let next = sql::lit_str(&format!("{:04}-01-01", year + 1));
            // Range predicates on the raw column preserve index use.
            let rewritten = match criterion.op {
                CriteriaOperator::Eq => {
                    Some(base.clone().gte(start).and(base.lt(next)).paren())
                }
                CriteriaOperator::Gt => Some(base.gte(next)),
                CriteriaOperator::Gte => Some(base.gte(start)),
                CriteriaOperator::Lt => Some(base.lt(start)),
                CriteriaOperator::Lte => Some(base.lt(next)),
                _ => None,
            };
            if let Some(expr) = rewritten {
                return Ok(expr);
            }
        }
    }

    criterion.to_predicate(base_expr(table, column, binding))
}
