//! MySQL dialect.

use super::{SqlDialect, TimePart};

#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn format_bool(&self, b: bool) -> &'static str {
        if b {
            "1"
        } else {
            "0"
        }
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }

    fn supports_kill(&self) -> bool {
        true
    }

    fn kill_sql(&self, connection_id: &str) -> Option<String> {
        Some(format!("KILL {}", connection_id))
    }

    fn time_part_sql(&self, part: TimePart, column: &str) -> String {
        match part {
            TimePart::Year => format!("YEAR({})", column),
            TimePart::Quarter => format!("QUARTER({})", column),
            TimePart::Month => format!("MONTH({})", column),
            TimePart::Day => format!("DAYOFMONTH({})", column),
            TimePart::DayOfWeek => format!("DAYOFWEEK({})", column),
            TimePart::Hour => format!("HOUR({})", column),
            TimePart::Minute => format!("MINUTE({})", column),
            TimePart::Date => format!("DATE({})", column),
        }
    }
}
