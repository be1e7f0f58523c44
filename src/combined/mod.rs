//! The combined layer: a request-scoped in-memory SQLite database that
//! stitches per-datasource results into the final frame.
//!
//! Each datasource plan loads into its own table keyed on the grain
//! columns. One SQL pass merges them (full outer join semantics,
//! emulated over a key-ring union since SQLite lacks FULL OUTER JOIN),
//! coalesces leaf metrics, reconstructs weighted means and evaluates
//! formula fields. Row filters, technicals, rollups, rounding, ordering,
//! limit and pivot run in memory afterwards.

pub mod rollup;

pub use rollup::Rollup;

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::model::field::{
    WEIGHTED_DENOMINATOR_SUFFIX, WEIGHTED_NUMERATOR_SUFFIX,
};
use crate::model::formula;
use crate::model::technical::{TechnicalMode, TechnicalOutput};
use crate::model::types::AggregationType;
use crate::planner::{Plan, PlanColumn, PlanColumnKind, ReportScope};
use crate::sql::dialect::SqlDialect;
use crate::sql::{Dialect, SortDir};

/// Quote an identifier for the combined-layer dialect.
fn q(name: &str) -> String {
    Dialect::Sqlite.quote_identifier(name)
}

/// A post-combine row filter (subset of criteria operators, applied to
/// the final frame).
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub field: String,
    pub op: RowFilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilterOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    In,
    NotIn,
}

impl RowFilterOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            ">" => Some(RowFilterOp::Gt),
            ">=" => Some(RowFilterOp::Gte),
            "<" => Some(RowFilterOp::Lt),
            "<=" => Some(RowFilterOp::Lte),
            "=" | "==" => Some(RowFilterOp::Eq),
            "!=" => Some(RowFilterOp::Ne),
            "in" => Some(RowFilterOp::In),
            "not in" => Some(RowFilterOp::NotIn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RowFilterOp::Gt => ">",
            RowFilterOp::Gte => ">=",
            RowFilterOp::Lt => "<",
            RowFilterOp::Lte => "<=",
            RowFilterOp::Eq => "==",
            RowFilterOp::Ne => "!=",
            RowFilterOp::In => "in",
            RowFilterOp::NotIn => "not in",
        }
    }
}

impl RowFilter {
    fn matches(&self, value: &Value) -> bool {
        let json_eq = |json: &serde_json::Value| match (json, value) {
            (serde_json::Value::String(s), v) => v.as_str() == Some(s.as_str()),
            (serde_json::Value::Number(n), v) => {
                matches!((n.as_f64(), v.as_f64()), (Some(a), Some(b)) if a == b)
            }
            (serde_json::Value::Bool(b), Value::Bool(v)) => b == v,
            (serde_json::Value::Null, Value::Null) => true,
            _ => false,
        };
        let cmp = |f: fn(f64, f64) -> bool| {
            matches!(
                (value.as_f64(), self.value.as_f64()),
                (Some(a), Some(b)) if f(a, b)
            )
        };
        match self.op {
            RowFilterOp::Gt => cmp(|a, b| a > b),
            RowFilterOp::Gte => cmp(|a, b| a >= b),
            RowFilterOp::Lt => cmp(|a, b| a < b),
            RowFilterOp::Lte => cmp(|a, b| a <= b),
            RowFilterOp::Eq => json_eq(&self.value),
            RowFilterOp::Ne => !json_eq(&self.value),
            RowFilterOp::In => self
                .value
                .as_array()
                .map(|items| items.iter().any(json_eq))
                .unwrap_or(false),
            RowFilterOp::NotIn => self
                .value
                .as_array()
                .map(|items| !items.iter().any(json_eq))
                .unwrap_or(false),
        }
    }
}

impl Serialize for RowFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.field, self.op.as_str(), &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RowFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (field, op, value): (String, String, serde_json::Value) =
            Deserialize::deserialize(deserializer)?;
        let op = RowFilterOp::parse(&op)
            .ok_or_else(|| D::Error::custom(format!("unknown row filter operator '{}'", op)))?;
        Ok(RowFilter { field, op, value })
    }
}

/// A final ordering key: field name plus direction. Serialized as a
/// bare name (ascending) or a `[name, "desc"]` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub dir: SortDir,
}

impl Serialize for OrderBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.dir {
            SortDir::Asc => self.field.serialize(serializer),
            SortDir::Desc => (&self.field, "desc").serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OrderBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match raw {
            serde_json::Value::String(field) => Ok(OrderBy {
                field,
                dir: SortDir::Asc,
            }),
            serde_json::Value::Array(items) if items.len() == 2 => {
                let field = items[0]
                    .as_str()
                    .ok_or_else(|| D::Error::custom("order_by field must be a string"))?
                    .to_string();
                let dir = match items[1].as_str() {
                    Some("asc") => SortDir::Asc,
                    Some("desc") => SortDir::Desc,
                    _ => return Err(D::Error::custom("order_by direction must be asc or desc")),
                };
                Ok(OrderBy { field, dir })
            }
            _ => Err(D::Error::custom(
                "order_by entries are names or [name, direction] pairs",
            )),
        }
    }
}

/// The stitched output of the combined layer.
#[derive(Debug)]
pub struct CombinedOutput {
    pub frame: Frame,
    pub rollup_rows: Vec<usize>,
    pub warnings: Vec<String>,
}

/// Finishing passes requested by the report.
#[derive(Debug, Default)]
pub struct FinishSpec<'a> {
    pub rollup: Option<Rollup>,
    pub row_filters: &'a [RowFilter],
    pub order_by: &'a [OrderBy],
    pub limit: Option<usize>,
    pub pivot: &'a [String],
}

/// The request-scoped scratch database.
pub struct CombinedLayer<'a> {
    scope: &'a ReportScope<'a>,
    plan: &'a Plan,
    conn: rusqlite::Connection,
    warnings: Vec<String>,
    /// (plan index, schema) of each loaded plan table.
    loaded: Vec<(usize, Vec<PlanColumn>)>,
}

impl<'a> CombinedLayer<'a> {
    pub fn new(scope: &'a ReportScope<'a>, plan: &'a Plan) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Ok(Self {
            scope,
            plan,
            conn,
            warnings: Vec::new(),
            loaded: Vec::new(),
        })
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Load one plan's result frame into its own table, in chunks.
    pub fn load(
        &mut self,
        plan_index: usize,
        schema: &[PlanColumn],
        frame: &Frame,
        chunk_size: usize,
    ) -> Result<()> {
        let table = format!("p{}", plan_index);

        let column_defs: Vec<String> = schema
            .iter()
            .map(|col| format!("{} {}", q(&col.name), col.data_type.sqlite_type()))
            .collect();
        self.conn.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            q(&table),
            column_defs.join(", ")
        ))?;

        let dim_cols: Vec<&PlanColumn> = schema
            .iter()
            .filter(|c| c.kind == PlanColumnKind::Dimension)
            .collect();
        if !dim_cols.is_empty() {
            let index_cols: Vec<String> = dim_cols.iter().map(|c| q(&c.name)).collect();
            self.conn.execute_batch(&format!(
                "CREATE INDEX {} ON {} ({})",
                q(&format!("idx_{}_dims", table)),
                q(&table),
                index_cols.join(", ")
            ))?;
        }

        // Frame columns arrive under the plan's select aliases.
        let source_indices: Vec<usize> = schema
            .iter()
            .map(|col| {
                frame.column_index(&col.name).ok_or_else(|| {
                    Error::FailedExecution {
                        datasource: "combined".into(),
                        message: format!("plan result is missing column '{}'", col.name),
                    }
                })
            })
            .collect::<Result<_>>()?;

        let placeholders: Vec<&str> = schema.iter().map(|_| "?").collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            q(&table),
            schema.iter().map(|c| q(&c.name)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );

        for chunk in frame.rows.chunks(chunk_size.max(1)) {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(&insert_sql)?;
                for row in chunk {
                    let params: Vec<rusqlite::types::Value> = source_indices
                        .iter()
                        .map(|&i| bind_value(&row[i]))
                        .collect();
                    stmt.execute(rusqlite::params_from_iter(params))?;
                }
            }
            tx.commit()?;
        }

        self.loaded.push((plan_index, schema.to_vec()));
        Ok(())
    }

    /// Merge the loaded tables, evaluate the final SQL, and run the
    /// in-memory finishing passes.
    pub fn finish(mut self, spec: &FinishSpec<'_>) -> Result<CombinedOutput> {
        let dims: Vec<String> = self
            .plan
            .dimensions
            .iter()
            .map(|d| d.name.clone())
            .collect();

        if self.loaded.is_empty() {
            // Nothing loaded (allow_partial with every plan failed).
            let mut columns = dims.clone();
            columns.extend(self.plan.metrics.iter().map(|m| m.name.clone()));
            return Ok(CombinedOutput {
                frame: Frame::new(columns),
                rollup_rows: Vec::new(),
                warnings: self.warnings,
            });
        }

        self.build_combined_table()?;
        let (mut frame, hidden) = self.final_select()?;

        if !spec.row_filters.is_empty() {
            apply_row_filters(&mut frame, spec.row_filters)?;
        }

        self.apply_technicals(&mut frame, &dims)?;

        if let Some(mode) = spec.rollup {
            rollup::apply_rollup(
                &mut frame,
                mode,
                &dims,
                &self.plan.metrics,
                self.scope,
                &self.conn,
            )?;
        }

        self.apply_rounding(&mut frame);

        let default_order: Vec<OrderBy> = dims
            .iter()
            .map(|d| OrderBy {
                field: d.clone(),
                dir: SortDir::Asc,
            })
            .collect();
        let order = if spec.order_by.is_empty() {
            &default_order[..]
        } else {
            spec.order_by
        };
        self.sort_frame(&mut frame, order);

        if let Some(limit) = spec.limit {
            frame.rows.truncate(limit);
        }

        drop_columns(&mut frame, &hidden);

        if !spec.pivot.is_empty() {
            frame = apply_pivot(&frame, spec.pivot, &dims)?;
        }

        let rollup_rows = (0..frame.len())
            .filter(|&i| frame.rows[i].iter().any(|v| v.is_rollup()))
            .collect();

        Ok(CombinedOutput {
            frame,
            rollup_rows,
            warnings: self.warnings,
        })
    }

    /// Create the `combined` table: one row per full-grain key with
    /// every leaf metric merged across plan tables.
    fn build_combined_table(&mut self) -> Result<()> {
        let grain: Vec<&String> = self.plan.grain.iter().collect();
        let tables: Vec<String> = self
            .loaded
            .iter()
            .map(|(i, _)| format!("p{}", i))
            .collect();

        // Per-table lookup of the column carrying a field.
        let column_of = |loaded: &(usize, Vec<PlanColumn>),
                         field: &str,
                         kind_filter: &dyn Fn(&PlanColumnKind) -> bool|
         -> Option<String> {
            loaded
                .1
                .iter()
                .find(|c| c.field == field && kind_filter(&c.kind))
                .map(|c| c.name.clone())
        };

        let mut select_parts: Vec<String> = Vec::new();
        let mut group_parts: Vec<String> = Vec::new();
        let from_clause: String;

        if grain.is_empty() {
            // Metrics-only report: each table holds one aggregate row.
            from_clause = tables
                .iter()
                .enumerate()
                .map(|(pos, t)| {
                    if pos == 0 {
                        format!("{} ", q(t))
                    } else {
                        format!("CROSS JOIN {} ", q(t))
                    }
                })
                .collect::<String>()
                .trim_end()
                .to_string();
        } else if tables.len() == 1 {
            from_clause = q(&tables[0]);
            for dim in &grain {
                let col = column_of(&self.loaded[0], dim, &|k| {
                    *k == PlanColumnKind::Dimension
                })
                .expect("plan covers its grain");
                select_parts.push(format!("{}.{} AS {}", q(&tables[0]), q(&col), q(dim)));
                group_parts.push(format!("{}.{}", q(&tables[0]), q(&col)));
            }
        } else {
            // Key ring: the distinct union of every table's grain keys,
            // left-joined back to each table. This emulates the FULL
            // OUTER JOIN SQLite lacks.
            self.warnings.push("FULL OUTER JOIN emulated".into());
            let keyring_selects: Vec<String> = self
                .loaded
                .iter()
                .zip(&tables)
                .map(|(loaded, table)| {
                    let cols: Vec<String> = grain
                        .iter()
                        .map(|dim| {
                            let col = column_of(loaded, dim, &|k| {
                                *k == PlanColumnKind::Dimension
                            })
                            .expect("plan covers its grain");
                            format!("{}.{} AS {}", q(table), q(&col), q(dim))
                        })
                        .collect();
                    format!("SELECT {} FROM {}", cols.join(", "), q(table))
                })
                .collect();
            let mut from = format!("({}) AS k", keyring_selects.join(" UNION "));
            for (loaded, table) in self.loaded.iter().zip(&tables) {
                let on: Vec<String> = grain
                    .iter()
                    .map(|dim| {
                        let col = column_of(loaded, dim, &|k| {
                            *k == PlanColumnKind::Dimension
                        })
                        .expect("plan covers its grain");
                        // IS matches NULL keys too.
                        format!("k.{} IS {}.{}", q(dim), q(table), q(&col))
                    })
                    .collect();
                from.push_str(&format!(
                    " LEFT OUTER JOIN {} ON {}",
                    q(table),
                    on.join(" AND ")
                ));
            }
            from_clause = from;
            for dim in &grain {
                select_parts.push(format!("k.{0} AS {0}", q(dim)));
                group_parts.push(format!("k.{}", q(dim)));
            }
        }

        // Leaf metric columns, coalesced across the plan tables that
        // carry them.
        for leaf in &self.plan.leaf_metrics {
            let field = self.scope.get_field(leaf);
            let weighted = field.map(|f| f.weighting_metric().is_some()).unwrap_or(false);

            if weighted {
                for (suffix, kind) in [
                    (WEIGHTED_NUMERATOR_SUFFIX, PlanColumnKind::WeightedNumerator),
                    (
                        WEIGHTED_DENOMINATOR_SUFFIX,
                        PlanColumnKind::WeightedDenominator,
                    ),
                ] {
                    let exprs: Vec<String> = self
                        .loaded
                        .iter()
                        .zip(&tables)
                        .filter_map(|(loaded, table)| {
                            column_of(loaded, leaf, &|k| *k == kind)
                                .map(|col| format!("{}.{}", q(table), q(&col)))
                        })
                        .collect();
                    let merged = coalesce_sql(&exprs);
                    select_parts.push(format!(
                        "SUM({}) AS {}",
                        merged,
                        q(&format!("{}{}", leaf, suffix))
                    ));
                }
                continue;
            }

            let aggregation = field
                .and_then(|f| f.aggregation())
                .unwrap_or(AggregationType::Sum);
            let exprs: Vec<String> = self
                .loaded
                .iter()
                .zip(&tables)
                .filter_map(|(loaded, table)| {
                    column_of(loaded, leaf, &|k| matches!(k, PlanColumnKind::Metric(_)))
                        .map(|col| format!("{}.{}", q(table), q(&col)))
                })
                .collect();
            if exprs.is_empty() {
                // allow_partial: the covering plan failed; surface NULL.
                select_parts.push(format!("NULL AS {}", q(leaf)));
                continue;
            }
            let merged = format!("{}({})", merge_fn(aggregation), coalesce_sql(&exprs));
            let with_default = match field.and_then(|f| f.ifnull()) {
                Some(default) => format!("IFNULL({}, {})", merged, default),
                None => merged,
            };
            select_parts.push(format!("{} AS {}", with_default, q(leaf)));
        }

        let mut sql = format!(
            "CREATE TEMP TABLE combined AS SELECT {} FROM {}",
            select_parts.join(", "),
            from_clause
        );
        if !group_parts.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_parts.join(", ")));
        }
        tracing::debug!(%sql, "building combined table");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// The final SELECT over `combined`: requested dimensions and
    /// metrics in request order, plus hidden helper columns. Returns
    /// the frame and the hidden column names.
    fn final_select(&mut self) -> Result<(Frame, Vec<String>)> {
        let mut select_parts: Vec<String> = Vec::new();
        let mut group_parts: Vec<String> = Vec::new();
        let mut order_parts: Vec<String> = Vec::new();
        let mut hidden: Vec<String> = Vec::new();

        for dim in &self.plan.dimensions {
            let expr = match &dim.expanded {
                Some(expanded) => formula::substitute(&expanded.body, |leaf| q(leaf)),
                None => q(&dim.name),
            };
            select_parts.push(format!("{} AS {}", expr, q(&dim.name)));
            group_parts.push(expr);
            order_parts.push(format!("{} ASC", q(&dim.name)));
        }

        let leaf_agg = |leaf: &str| -> String {
            let field = self.scope.get_field(leaf);
            if field.map(|f| f.weighting_metric().is_some()).unwrap_or(false) {
                let num = q(&format!("{}{}", leaf, WEIGHTED_NUMERATOR_SUFFIX));
                let den = q(&format!("{}{}", leaf, WEIGHTED_DENOMINATOR_SUFFIX));
                format!("(1.0 * SUM({})) / NULLIF(SUM({}), 0)", num, den)
            } else if field.map(|f| f.is_metric()).unwrap_or(false) {
                let aggregation = field
                    .and_then(|f| f.aggregation())
                    .unwrap_or(AggregationType::Sum);
                format!("{}({})", merge_fn(aggregation), q(leaf))
            } else {
                // Dimension leaf referenced by a formula metric.
                q(leaf)
            }
        };

        let mut selected_metrics: Vec<String> = Vec::new();
        for metric in &self.plan.metrics {
            let expr = match &metric.expanded {
                Some(expanded) => formula::substitute(&expanded.body, |leaf| leaf_agg(leaf)),
                None => leaf_agg(&metric.name),
            };
            select_parts.push(format!("{} AS {}", expr, q(&metric.name)));
            selected_metrics.push(metric.name.clone());
        }

        // Hidden helpers: unrequested leaves, and weighted sums for
        // rollup reconstruction.
        for leaf in &self.plan.leaf_metrics {
            if !selected_metrics.iter().any(|m| m == leaf) {
                select_parts.push(format!("{} AS {}", leaf_agg(leaf), q(leaf)));
                hidden.push(leaf.clone());
            }
            let weighted = self
                .scope
                .get_field(leaf)
                .map(|f| f.weighting_metric().is_some())
                .unwrap_or(false);
            if weighted {
                for suffix in [WEIGHTED_NUMERATOR_SUFFIX, WEIGHTED_DENOMINATOR_SUFFIX] {
                    let name = format!("{}{}", leaf, suffix);
                    select_parts.push(format!("SUM({0}) AS {0}", q(&name)));
                    hidden.push(name);
                }
            }
        }

        let mut sql = format!("SELECT {} FROM combined", select_parts.join(", "));
        if !group_parts.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_parts.join(", ")));
        }
        if !order_parts.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_parts.join(", ")));
        }
        tracing::debug!(%sql, "combined final select");

        let frame = read_frame(&self.conn, &sql)?;
        Ok((frame, hidden))
    }

    /// Technicals run per requested metric, partitioned by all index
    /// dimensions but the last in `group` mode.
    fn apply_technicals(&self, frame: &mut Frame, dims: &[String]) -> Result<()> {
        for metric in &self.plan.metrics {
            let Some(technical) = self
                .scope
                .get_field(&metric.name)
                .and_then(|f| f.technical().cloned())
            else {
                continue;
            };
            let Some(col_idx) = frame.column_index(&metric.name) else {
                continue;
            };

            let partition_width = match technical.mode {
                TechnicalMode::Group if dims.len() > 1 => dims.len() - 1,
                _ => 0,
            };

            // Rows are sorted by the index dimensions, so partitions
            // are contiguous runs.
            let mut new_col: Vec<Value> = Vec::with_capacity(frame.len());
            let mut bounds: Option<(Vec<Value>, Vec<Value>)> = None;
            let mut start = 0;
            while start < frame.len() {
                let key = &frame.rows[start][..partition_width];
                let mut end = start;
                while end < frame.len() && &frame.rows[end][..partition_width] == key {
                    end += 1;
                }
                let values: Vec<Value> = (start..end)
                    .map(|i| frame.rows[i][col_idx].clone())
                    .collect();
                match technical.apply(&values) {
                    TechnicalOutput::Replace(out) => new_col.extend(out),
                    TechnicalOutput::Bounds { lower, upper } => {
                        new_col.extend(values);
                        let (all_lower, all_upper) =
                            bounds.get_or_insert_with(|| (Vec::new(), Vec::new()));
                        all_lower.extend(lower);
                        all_upper.extend(upper);
                    }
                }
                start = end;
            }

            frame.set_column(&metric.name, new_col);
            if let Some((lower, upper)) = bounds {
                frame.push_column(format!("{}_lower", metric.name), lower);
                frame.push_column(format!("{}_upper", metric.name), upper);
            }
        }
        Ok(())
    }

    /// Metric rounding, applied after technicals and rollups.
    fn apply_rounding(&self, frame: &mut Frame) {
        for metric in &self.plan.metrics {
            let Some(decimals) = self
                .scope
                .get_field(&metric.name)
                .and_then(|f| f.rounding())
            else {
                continue;
            };
            for name in [
                metric.name.clone(),
                format!("{}_lower", metric.name),
                format!("{}_upper", metric.name),
            ] {
                if let Some(col_idx) = frame.column_index(&name) {
                    for row in &mut frame.rows {
                        if let Some(v) = row[col_idx].as_f64() {
                            row[col_idx] = Value::Float(round_to(v, decimals));
                        }
                    }
                }
            }
        }
    }

    /// Stable sort honoring declared dimension value orderings; the
    /// rollup marker compares greater than every ordinary value.
    fn sort_frame(&self, frame: &mut Frame, order: &[OrderBy]) {
        struct Key {
            col: usize,
            dir: SortDir,
            value_rank: Option<BTreeMap<String, usize>>,
        }

        let keys: Vec<Key> = order
            .iter()
            .filter_map(|o| {
                frame.column_index(&o.field).map(|col| Key {
                    col,
                    dir: o.dir,
                    value_rank: self
                        .scope
                        .get_field(&o.field)
                        .and_then(|f| f.dimension_values())
                        .map(|values| {
                            values
                                .iter()
                                .enumerate()
                                .map(|(i, v)| (v.clone(), i))
                                .collect()
                        }),
                })
            })
            .collect();

        frame.rows.sort_by(|a, b| {
            for key in &keys {
                let (left, right) = (&a[key.col], &b[key.col]);
                let ord = match &key.value_rank {
                    Some(ranks) if !left.is_rollup() && !right.is_rollup() => {
                        let lr = left.as_str().and_then(|s| ranks.get(s));
                        let rr = right.as_str().and_then(|s| ranks.get(s));
                        match (lr, rr) {
                            (Some(l), Some(r)) => l.cmp(r),
                            _ => left.sort_cmp(right),
                        }
                    }
                    _ => left.sort_cmp(right),
                };
                let ord = match key.dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
}

fn coalesce_sql(exprs: &[String]) -> String {
    match exprs.len() {
        0 => "NULL".to_string(),
        1 => exprs[0].clone(),
        _ => format!("COALESCE({})", exprs.join(", ")),
    }
}

fn merge_fn(aggregation: AggregationType) -> &'static str {
    match aggregation.rollup_merge() {
        AggregationType::Sum => "SUM",
        AggregationType::Mean => "AVG",
        AggregationType::Min => "MIN",
        AggregationType::Max => "MAX",
        AggregationType::Count | AggregationType::CountDistinct => "SUM",
    }
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(i) => rusqlite::types::Value::Integer(*i),
        Value::Float(f) => rusqlite::types::Value::Real(*f),
        Value::Str(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Rollup => rusqlite::types::Value::Text(crate::frame::ROLLUP_MARKER.to_string()),
    }
}

fn read_frame(conn: &rusqlite::Connection, sql: &str) -> Result<Frame> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();
    let mut frame = Frame::new(columns);
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(column_count);
        for i in 0..column_count {
            out.push(match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => Value::Null,
                rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                rusqlite::types::ValueRef::Text(v) => {
                    Value::Str(String::from_utf8_lossy(v).into_owned())
                }
                rusqlite::types::ValueRef::Blob(_) => Value::Null,
            });
        }
        frame.push_row(out);
    }
    Ok(frame)
}

fn apply_row_filters(frame: &mut Frame, filters: &[RowFilter]) -> Result<()> {
    let mut keyed: Vec<(usize, &RowFilter)> = Vec::new();
    for filter in filters {
        let col = frame.column_index(&filter.field).ok_or_else(|| {
            Error::UnsupportedOperation(format!(
                "row filter field '{}' is not in the result",
                filter.field
            ))
        })?;
        keyed.push((col, filter));
    }
    frame
        .rows
        .retain(|row| keyed.iter().all(|(col, filter)| filter.matches(&row[*col])));
    Ok(())
}

fn drop_columns(frame: &mut Frame, names: &[String]) {
    let keep: Vec<usize> = (0..frame.columns.len())
        .filter(|&i| !names.contains(&frame.columns[i]))
        .collect();
    if keep.len() == frame.columns.len() {
        return;
    }
    frame.columns = keep.iter().map(|&i| frame.columns[i].clone()).collect();
    for row in &mut frame.rows {
        *row = keep.iter().map(|&i| row[i].clone()).collect();
    }
}

/// Rotate the named dimensions into columns. New value columns are
/// named `{metric}_{pivot value}`; rollup markers render as the display
/// label.
fn apply_pivot(frame: &Frame, pivot: &[String], dims: &[String]) -> Result<Frame> {
    let pivot_idx: Vec<usize> = pivot
        .iter()
        .map(|p| {
            if !dims.contains(p) {
                return Err(Error::UnsupportedOperation(format!(
                    "pivot field '{}' is not a report dimension",
                    p
                )));
            }
            frame
                .column_index(p)
                .ok_or_else(|| Error::UnsupportedOperation(format!("unknown pivot field '{}'", p)))
        })
        .collect::<Result<_>>()?;

    let keep_dims: Vec<usize> = dims
        .iter()
        .filter(|d| !pivot.contains(d))
        .filter_map(|d| frame.column_index(d))
        .collect();
    let value_cols: Vec<usize> = (0..frame.columns.len())
        .filter(|i| !pivot_idx.contains(i) && !keep_dims.contains(i))
        .collect();

    // Pivot combos in first-appearance order.
    let mut combos: Vec<Vec<String>> = Vec::new();
    for row in &frame.rows {
        let combo: Vec<String> = pivot_idx
            .iter()
            .map(|&i| display_cell(&row[i]))
            .collect();
        if !combos.contains(&combo) {
            combos.push(combo);
        }
    }

    let mut columns: Vec<String> = keep_dims
        .iter()
        .map(|&i| frame.columns[i].clone())
        .collect();
    for combo in &combos {
        for &v in &value_cols {
            columns.push(format!("{}_{}", frame.columns[v], combo.join("_")));
        }
    }

    let mut out = Frame::new(columns);
    let mut row_keys: Vec<Vec<Value>> = Vec::new();
    for row in &frame.rows {
        let key: Vec<Value> = keep_dims.iter().map(|&i| row[i].clone()).collect();
        let row_pos = match row_keys.iter().position(|k| *k == key) {
            Some(pos) => pos,
            None => {
                row_keys.push(key.clone());
                let width = out.columns.len();
                let mut fresh = key;
                fresh.resize(width, Value::Null);
                out.rows.push(fresh);
                out.rows.len() - 1
            }
        };
        let combo: Vec<String> = pivot_idx
            .iter()
            .map(|&i| display_cell(&row[i]))
            .collect();
        let combo_pos = combos.iter().position(|c| *c == combo).expect("combo seen");
        for (offset, &v) in value_cols.iter().enumerate() {
            let col = keep_dims.len() + combo_pos * value_cols.len() + offset;
            out.rows[row_pos][col] = row[v].clone();
        }
    }
    Ok(out)
}

fn display_cell(value: &Value) -> String {
    if value.is_rollup() {
        crate::frame::ROLLUP_DISPLAY_LABEL.to_string()
    } else {
        value.to_string()
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
