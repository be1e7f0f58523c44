//! The report result: final frame, rollup bookkeeping, timings and
//! warnings.

use serde::{Deserialize, Serialize};

use crate::executor::QueryTiming;
use crate::frame::{Frame, Value, ROLLUP_DISPLAY_LABEL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResult {
    /// Dimensions as index columns, metrics as value columns.
    pub frame: Frame,
    /// Indices of rollup rows in `frame`.
    pub rollup_rows: Vec<usize>,
    /// Per-datasource query timings, in plan order.
    pub timings: Vec<QueryTiming>,
    pub warnings: Vec<String>,
    /// Wall-clock duration of the whole report.
    pub duration_seconds: f64,
}

impl ReportResult {
    pub fn is_rollup_row(&self, index: usize) -> bool {
        self.rollup_rows.contains(&index)
    }

    /// Rows that are not rollup subtotals.
    pub fn data_rows(&self) -> impl Iterator<Item = &Vec<Value>> {
        self.frame
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.rollup_rows.contains(i))
            .map(|(_, row)| row)
    }

    /// Display projection: rollup markers replaced with the `Totals`
    /// label.
    pub fn display_frame(&self) -> Frame {
        let mut frame = self.frame.clone();
        for row in &mut frame.rows {
            for cell in row.iter_mut() {
                if cell.is_rollup() {
                    *cell = Value::Str(ROLLUP_DISPLAY_LABEL.to_string());
                }
            }
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_frame_replaces_marker() {
        let mut frame = Frame::new(vec!["partner".into(), "sales".into()]);
        frame.push_row(vec!["A".into(), Value::Int(11)]);
        frame.push_row(vec![Value::Rollup, Value::Int(18)]);
        let result = ReportResult {
            frame,
            rollup_rows: vec![1],
            timings: Vec::new(),
            warnings: Vec::new(),
            duration_seconds: 0.0,
        };
        let display = result.display_frame();
        assert_eq!(display.rows[1][0], Value::Str("Totals".into()));
        assert!(result.is_rollup_row(1));
        assert_eq!(result.data_rows().count(), 1);
    }
}
