//! PostgreSQL dialect.

use super::{SqlDialect, TimePart};

#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn supports_kill(&self) -> bool {
        true
    }

    fn kill_sql(&self, connection_id: &str) -> Option<String> {
        Some(format!("SELECT pg_cancel_backend({})", connection_id))
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
