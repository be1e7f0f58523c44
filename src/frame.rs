//! Tabular interchange type shared by the executor, the combined layer and
//! the report result.
//!
//! A [`Frame`] is row-major: a list of column names plus rows of [`Value`]
//! cells. Rollup rows carry [`Value::Rollup`] in their collapsed dimension
//! cells; it renders as U+10FFFF and sorts after every ordinary value so
//! subtotal rows land last within their level.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// In-band rollup marker character (the last Unicode code point).
pub const ROLLUP_MARKER: char = '\u{10FFFF}';

/// Token substituted for the rollup marker in display projections.
pub const ROLLUP_DISPLAY_LABEL: &str = "Totals";

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Rollup marker for a collapsed dimension cell.
    Rollup,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_rollup(&self) -> bool {
        matches!(self, Value::Rollup)
    }

    /// Numeric view; integers widen to f64, everything else is None.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering used by the final sort pass: NULL first, then ordinary
    /// values, rollup markers last.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Rollup, Rollup) => Ordering::Equal,
            (Rollup, _) => Ordering::Greater,
            (_, Rollup) => Ordering::Less,
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            _ => {
                let (a, b) = (self.as_f64(), other.as_f64());
                match (a, b) {
                    (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                    // Mixed types: compare by rendered text for stability.
                    _ => self.to_string().cmp(&other.to_string()),
                }
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) | (Rollup, Rollup) => true,
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Rollup => write!(f, "{}", ROLLUP_MARKER),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A row-major table of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Append a column, filling existing rows from `values`.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows.len());
        self.columns.push(name.into());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    /// Overwrite an existing column's values in place.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        let idx = self
            .column_index(name)
            .unwrap_or_else(|| panic!("no such column: {}", name));
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    /// Stable sort by the named columns with per-column direction
    /// (`true` = ascending). Rollup markers sort after ordinary values.
    pub fn sort_by(&mut self, keys: &[(String, bool)]) {
        let idxs: Vec<(usize, bool)> = keys
            .iter()
            .filter_map(|(name, asc)| self.column_index(name).map(|i| (i, *asc)))
            .collect();
        self.rows.sort_by(|a, b| {
            for (i, asc) in &idxs {
                let ord = a[*i].sort_cmp(&b[*i]);
                let ord = if *asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}
