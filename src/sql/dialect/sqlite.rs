//! SQLite dialect.
//!
//! Also the combined-layer dialect: the scratch database is an
//! in-memory SQLite instance, so combined-layer SQL renders through
//! this implementation.

use super::{SqlDialect, TimePart};

#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn format_bool(&self, b: bool) -> &'static str {
        if b {
            "1"
        } else {
            "0"
        }
    }

    // Older SQLite lacks FULL OUTER JOIN; the combined layer emulates it
    // and attaches a warning.
    fn supports_full_outer_join(&self) -> bool {
        false
    }

    fn time_part_sql(&self, part: TimePart, column: &str) -> String {
        match part {
            TimePart::Year => format!("CAST(STRFTIME('%Y', {}) AS INTEGER)", column),
            TimePart::Quarter => {
                format!("((CAST(STRFTIME('%m', {}) AS INTEGER) + 2) / 3)", column)
            }
            TimePart::Month => format!("CAST(STRFTIME('%m', {}) AS INTEGER)", column),
            TimePart::Day => format!("CAST(STRFTIME('%d', {}) AS INTEGER)", column),
            TimePart::DayOfWeek => format!("CAST(STRFTIME('%w', {}) AS INTEGER)", column),
            TimePart::Hour => format!("CAST(STRFTIME('%H', {}) AS INTEGER)", column),
            TimePart::Minute => format!("CAST(STRFTIME('%M', {}) AS INTEGER)", column),
            TimePart::Date => format!("DATE({})", column),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_parts() {
        assert_eq!(
            Sqlite.time_part_sql(TimePart::Year, "sales.created_at"),
            "CAST(STRFTIME('%Y', sales.created_at) AS INTEGER)"
        );
        assert_eq!(
            Sqlite.time_part_sql(TimePart::Date, "created_at"),
            "DATE(created_at)"
        );
    }
}
