//! DuckDB dialect.

use super::{SqlDialect, TimePart};

#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn time_part_sql(&self, part: TimePart, column: &str) -> String {
        let extract = |unit: &str| format!("CAST(EXTRACT({} FROM {}) AS INTEGER)", unit, column);
        match part {
            TimePart::Year => extract("YEAR"),
            TimePart::Quarter => extract("QUARTER"),
            TimePart::Month => extract("MONTH"),
            TimePart::Day => extract("DAY"),
            TimePart::DayOfWeek => extract("DOW"),
            TimePart::Hour => extract("HOUR"),
            TimePart::Minute => extract("MINUTE"),
            TimePart::Date => format!("CAST({} AS DATE)", column),
        }
    }
}
