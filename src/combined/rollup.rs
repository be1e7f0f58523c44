//! Rollup rows over the final combined frame.
//!
//! Subtotals are always aggregated from the original (finest) rows, so
//! nested levels never double count. Collapsed dimension cells carry
//! the in-band rollup marker.

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::model::field::Field;
use crate::model::formula;
use crate::model::types::AggregationType;
use crate::planner::{OutputField, ReportScope};

/// Requested rollup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    /// A single grand-total row.
    Totals,
    /// Subtotals at every grain prefix plus the grand total.
    All,
    /// Subtotals at the `n` deepest grain levels; includes the grand
    /// total only when `n` equals the number of dimensions.
    Levels(usize),
}

impl Rollup {
    /// Prefix lengths to aggregate at, for `dims` dimensions. Prefix 0
    /// is the grand total.
    fn prefix_lengths(&self, dims: usize) -> Vec<usize> {
        if dims == 0 {
            return Vec::new();
        }
        let levels = match self {
            Rollup::Totals => return vec![0],
            Rollup::All => dims,
            Rollup::Levels(n) => (*n).min(dims),
        };
        // The k deepest levels collapse down to prefix length dims - k.
        (dims - levels..dims).rev().collect()
    }
}

impl Serialize for Rollup {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Rollup::Totals => serializer.serialize_str("totals"),
            Rollup::All => serializer.serialize_str("all"),
            Rollup::Levels(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Rollup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match &raw {
            serde_json::Value::String(s) => match s.to_lowercase().as_str() {
                "totals" => Ok(Rollup::Totals),
                "all" => Ok(Rollup::All),
                other => Err(D::Error::custom(format!("unknown rollup '{}'", other))),
            },
            serde_json::Value::Number(n) => n
                .as_u64()
                .filter(|n| *n > 0)
                .map(|n| Rollup::Levels(n as usize))
                .ok_or_else(|| D::Error::custom("rollup level must be a positive integer")),
            _ => Err(D::Error::custom("rollup must be 'totals', 'all' or an integer")),
        }
    }
}

/// How one frame column aggregates into a rollup row.
enum ColumnAggregation<'a> {
    /// Plain metric column, by its own aggregation.
    Plain(AggregationType),
    /// Weighted mean: reconstructed from the hidden numerator and
    /// denominator columns.
    Weighted { num: usize, den: usize },
    /// Formula metric: re-evaluated over its aggregated leaves.
    Formula(&'a formula::ExpandedFormula),
    /// Collapsed dimension or unaggregatable cell.
    Marker,
}

/// Append rollup rows to `frame`.
///
/// `dims` are the frame's index columns; `metrics` the requested metric
/// outputs. Hidden helper columns (leaf metrics, weighted
/// numerator/denominator sums) aggregate alongside so nested levels and
/// weighted means stay reconstructible. `conn` evaluates formula bodies
/// over aggregated leaves.
pub fn apply_rollup(
    frame: &mut Frame,
    rollup: Rollup,
    dims: &[String],
    metrics: &[OutputField],
    scope: &ReportScope<'_>,
    conn: &rusqlite::Connection,
) -> Result<()> {
    if dims.is_empty() || frame.is_empty() {
        return Ok(());
    }

    let dim_count = dims.len();
    let prefixes = rollup.prefix_lengths(dim_count);
    if prefixes.is_empty() {
        return Ok(());
    }

    // Resolve each non-dimension column's aggregation strategy once.
    let mut strategies: Vec<(usize, ColumnAggregation<'_>)> = Vec::new();
    for (col_idx, column) in frame.columns.iter().enumerate() {
        if col_idx < dim_count {
            continue;
        }
        let output = metrics.iter().find(|m| &m.name == column);
        let strategy = column_strategy(frame, column, output, scope);
        strategies.push((col_idx, strategy));
    }

    let original_rows: Vec<usize> = (0..frame.len())
        .filter(|&i| !frame.rows[i].iter().any(|v| v.is_rollup()))
        .collect();

    let mut new_rows = Vec::new();
    for &prefix in &prefixes {
        // Group original rows by the first `prefix` dimension values.
        let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
        for &row_idx in &original_rows {
            let key: Vec<String> = frame.rows[row_idx][..prefix]
                .iter()
                .map(|v| v.to_string())
                .collect();
            groups.entry(key).or_default().push(row_idx);
        }

        for rows in groups.values() {
            let mut out = Vec::with_capacity(frame.columns.len());
            // Index cells: kept prefix values then markers.
            for d in 0..dim_count {
                if d < prefix {
                    out.push(frame.rows[rows[0]][d].clone());
                } else {
                    out.push(Value::Rollup);
                }
            }
            // Metric cells.
            for (col_idx, strategy) in &strategies {
                let value = aggregate_column(frame, rows, *col_idx, strategy, scope, conn)?;
                out.push(value);
            }
            new_rows.push(out);
        }
    }

    frame.rows.extend(new_rows);
    Ok(())
}

fn column_strategy<'a>(
    frame: &Frame,
    column: &str,
    output: Option<&'a OutputField>,
    scope: &'a ReportScope<'_>,
) -> ColumnAggregation<'a> {
    if let Some(OutputField {
        expanded: Some(expanded),
        ..
    }) = output
    {
        return ColumnAggregation::Formula(expanded);
    }

    let Some(field) = scope.get_field(column) else {
        // Technical companion columns (boll bounds) and other derived
        // columns have no aggregation.
        return ColumnAggregation::Marker;
    };
    match field {
        Field::Metric(m) if m.weighting_metric.is_some() => {
            let (num_name, den_name) = m.weighted_column_names();
            match (frame.column_index(&num_name), frame.column_index(&den_name)) {
                (Some(num), Some(den)) => ColumnAggregation::Weighted { num, den },
                _ => ColumnAggregation::Plain(AggregationType::Mean),
            }
        }
        Field::Metric(m) => ColumnAggregation::Plain(m.aggregation),
        // A formula column without a recorded expansion (saved-spec
        // edge) degrades to summing its values.
        Field::FormulaMetric(_) | Field::AdHoc(_) => {
            ColumnAggregation::Plain(AggregationType::Sum)
        }
        _ => ColumnAggregation::Marker,
    }
}

fn aggregate_column(
    frame: &Frame,
    rows: &[usize],
    col_idx: usize,
    strategy: &ColumnAggregation<'_>,
    scope: &ReportScope<'_>,
    conn: &rusqlite::Connection,
) -> Result<Value> {
    match strategy {
        ColumnAggregation::Marker => Ok(Value::Null),
        ColumnAggregation::Plain(aggregation) => {
            Ok(aggregate_values(frame, rows, col_idx, *aggregation))
        }
        ColumnAggregation::Weighted { num, den } => {
            let num_sum = sum_values(frame, rows, *num);
            let den_sum = sum_values(frame, rows, *den);
            Ok(match (num_sum, den_sum) {
                (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
                // Zero weight sum yields NULL, matching the SQL
                // NULLIF reconstruction.
                _ => Value::Null,
            })
        }
        ColumnAggregation::Formula(expanded) => {
            let mut leaf_values: BTreeMap<&str, Value> = BTreeMap::new();
            for leaf in &expanded.leaves {
                let value = match frame.column_index(leaf) {
                    Some(leaf_idx) => {
                        let aggregation = scope
                            .get_field(leaf)
                            .and_then(|f| f.aggregation())
                            .unwrap_or(AggregationType::Sum);
                        match scope.get_field(leaf).and_then(|f| {
                            f.weighting_metric().map(|_| ())
                        }) {
                            Some(()) => {
                                // Weighted leaf: reconstruct from its
                                // hidden sums when present.
                                weighted_leaf_value(frame, rows, leaf, scope)
                            }
                            None => aggregate_values(frame, rows, leaf_idx, aggregation),
                        }
                    }
                    None => Value::Null,
                };
                leaf_values.insert(leaf, value);
            }
            eval_formula(conn, &expanded.body, &leaf_values)
        }
    }
}

fn weighted_leaf_value(
    frame: &Frame,
    rows: &[usize],
    leaf: &str,
    scope: &ReportScope<'_>,
) -> Value {
    if let Some(Field::Metric(m)) = scope.get_field(leaf) {
        let (num_name, den_name) = m.weighted_column_names();
        if let (Some(num), Some(den)) =
            (frame.column_index(&num_name), frame.column_index(&den_name))
        {
            if let (Some(n), Some(d)) = (sum_values(frame, rows, num), sum_values(frame, rows, den))
            {
                if d != 0.0 {
                    return Value::Float(n / d);
                }
            }
            return Value::Null;
        }
    }
    Value::Null
}

fn sum_values(frame: &Frame, rows: &[usize], col_idx: usize) -> Option<f64> {
    let mut sum = 0.0;
    let mut any = false;
    for &row_idx in rows {
        if let Some(v) = frame.rows[row_idx][col_idx].as_f64() {
            sum += v;
            any = true;
        }
    }
    any.then_some(sum)
}

fn aggregate_values(
    frame: &Frame,
    rows: &[usize],
    col_idx: usize,
    aggregation: AggregationType,
) -> Value {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|&row_idx| frame.rows[row_idx][col_idx].as_f64())
        .collect();
    if values.is_empty() {
        return Value::Null;
    }
    match aggregation.rollup_merge() {
        AggregationType::Sum => Value::Float(values.iter().sum()),
        AggregationType::Mean => {
            Value::Float(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregationType::Min => Value::Float(values.iter().cloned().fold(f64::MAX, f64::min)),
        AggregationType::Max => Value::Float(values.iter().cloned().fold(f64::MIN, f64::max)),
        // Count kinds merged to Sum above.
        AggregationType::Count | AggregationType::CountDistinct => {
            Value::Float(values.iter().sum())
        }
    }
}

/// Evaluate a formula body over aggregated leaf values with one tiny
/// SELECT on the combined-layer connection.
fn eval_formula(
    conn: &rusqlite::Connection,
    body: &str,
    leaves: &BTreeMap<&str, Value>,
) -> Result<Value> {
    let sql = format!(
        "SELECT {}",
        formula::substitute(body, |name| match leaves.get(name) {
            Some(Value::Int(i)) => i.to_string(),
            Some(Value::Float(f)) => format!("{:?}", f),
            Some(Value::Str(s)) => format!("'{}'", s.replace('\'', "''")),
            Some(Value::Bool(b)) => if *b { "1".into() } else { "0".into() },
            _ => "NULL".into(),
        })
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let row = rows
        .next()?
        .ok_or_else(|| Error::UnsupportedOperation("formula evaluation returned no row".into()))?;
    Ok(match row.get_ref(0)? {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::Int(i),
        rusqlite::types::ValueRef::Real(f) => Value::Float(f),
        rusqlite::types::ValueRef::Text(t) => Value::Str(String::from_utf8_lossy(t).into_owned()),
        rusqlite::types::ValueRef::Blob(_) => Value::Null,
    })
}
