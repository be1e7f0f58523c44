//! SQL dialect definitions.
//!
//! Each dialect implements [`SqlDialect`] to carry its syntax rules
//! (identifier quoting, boolean literals) and its capability descriptor:
//! whether in-flight queries can be killed, whether date-part type
//! conversions are available, and the conversion vocabulary itself.

mod duckdb;
mod mysql;
mod postgres;
mod sqlite;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

/// Date/datetime parts a temporal column can be converted to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TimePart {
    Year,
    Quarter,
    Month,
    Day,
    DayOfWeek,
    Hour,
    Minute,
    Date,
}

impl TimePart {
    /// All parts, in the order conversion fields are registered.
    pub fn all() -> &'static [TimePart] {
        &[
            TimePart::Year,
            TimePart::Quarter,
            TimePart::Month,
            TimePart::Day,
            TimePart::DayOfWeek,
            TimePart::Hour,
            TimePart::Minute,
            TimePart::Date,
        ]
    }

    /// Field-name suffix for the derived dimension.
    pub fn suffix(&self) -> &'static str {
        match self {
            TimePart::Year => "year",
            TimePart::Quarter => "quarter",
            TimePart::Month => "month",
            TimePart::Day => "day",
            TimePart::DayOfWeek => "day_of_week",
            TimePart::Hour => "hour",
            TimePart::Minute => "minute",
            TimePart::Date => "date",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        TimePart::all().iter().copied().find(|p| p.suffix() == s)
    }

    /// Parts that only make sense for datetime (not plain date) columns.
    pub fn requires_time(&self) -> bool {
        matches!(self, TimePart::Hour | TimePart::Minute)
    }
}

/// Dialect behavior and capability descriptor.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging and config matching.
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column, alias).
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Quote a string literal.
    fn quote_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    /// Format a boolean literal.
    fn format_bool(&self, b: bool) -> &'static str {
        if b {
            "true"
        } else {
            "false"
        }
    }

    /// Whether this dialect supports FULL OUTER JOIN natively.
    fn supports_full_outer_join(&self) -> bool {
        true
    }

    /// Whether in-flight queries can be cancelled server-side.
    fn supports_kill(&self) -> bool {
        false
    }

    /// Statement that cancels the query running on `connection_id`, if
    /// the dialect supports it.
    fn kill_sql(&self, connection_id: &str) -> Option<String> {
        let _ = connection_id;
        None
    }

    /// Whether date-part type conversions are available.
    fn supports_type_conversions(&self) -> bool {
        true
    }

    /// SQL expression extracting `part` from a temporal column
    /// expression.
    fn time_part_sql(&self, part: TimePart, column: &str) -> String;
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    MySql,
    DuckDb,
}

impl Dialect {
    /// Resolve a dialect from a name or connection-URL scheme.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Dialect::Sqlite),
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "mysql" => Some(Dialect::MySql),
            "duckdb" => Some(Dialect::DuckDb),
            _ => None,
        }
    }

    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Sqlite => &Sqlite,
            Dialect::Postgres => &Postgres,
            Dialect::MySql => &MySql,
            Dialect::DuckDb => &DuckDb,
        }
    }
}

impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn supports_full_outer_join(&self) -> bool {
        self.dialect().supports_full_outer_join()
    }

    fn supports_kill(&self) -> bool {
        self.dialect().supports_kill()
    }

    fn kill_sql(&self, connection_id: &str) -> Option<String> {
        self.dialect().kill_sql(connection_id)
    }

    fn supports_type_conversions(&self) -> bool {
        self.dialect().supports_type_conversions()
    }

    fn time_part_sql(&self, part: TimePart, column: &str) -> String {
        self.dialect().time_part_sql(part, column)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Dialect::parse("sqlite"), Some(Dialect::Sqlite));
        assert_eq!(Dialect::parse("postgresql"), Some(Dialect::Postgres));
        assert_eq!(Dialect::parse("oracle"), None);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(Dialect::Sqlite.quote_identifier("users"), "\"users\"");
        assert_eq!(Dialect::MySql.quote_identifier("users"), "`users`");
        assert_eq!(
            Dialect::MySql.quote_identifier("weird`name"),
            "`weird``name`"
        );
    }

    #[test]
    fn test_bool_format() {
        assert_eq!(Dialect::Sqlite.format_bool(true), "1");
        assert_eq!(Dialect::Postgres.format_bool(true), "true");
        assert_eq!(Dialect::MySql.format_bool(false), "0");
    }

    #[test]
    fn test_kill_capability() {
        assert!(!Dialect::Sqlite.supports_kill());
        assert!(Dialect::MySql.supports_kill());
        assert_eq!(Dialect::MySql.kill_sql("42"), Some("KILL 42".into()));
        assert!(Dialect::Postgres
            .kill_sql("123")
            .unwrap()
            .contains("pg_cancel_backend"));
    }

    #[test]
    fn test_full_outer_join_support() {
        assert!(!Dialect::Sqlite.supports_full_outer_join());
        assert!(!Dialect::MySql.supports_full_outer_join());
        assert!(Dialect::Postgres.supports_full_outer_join());
        assert!(Dialect::DuckDb.supports_full_outer_join());
    }

    #[test]
    fn test_time_part_suffix_round_trip() {
        for part in TimePart::all() {
            assert_eq!(TimePart::from_suffix(part.suffix()), Some(*part));
        }
    }
}
