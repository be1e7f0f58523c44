//! Connections and the connector registry.
//!
//! A datasource's `connect` entry is either a URL (scheme selects the
//! connector, `{var}` placeholders interpolate from
//! `DATASOURCE_CONTEXTS`) or a `{func, params}` object naming a
//! registered connector. The `sqlite` connector is built in; embedders
//! register others with [`register_connector`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rusqlite::types::ValueRef;

use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::sql::Dialect;

/// A live connection to a backing database.
pub trait SqlConnection: Send {
    /// Run a query and collect its full result.
    fn run(&mut self, sql: &str) -> Result<Frame>;

    /// Server-side id used by the dialect's kill statement, if any.
    fn connection_id(&self) -> Option<String> {
        None
    }

    /// Best-effort cancel handle callable from another thread.
    fn interrupt_handle(&self) -> Option<Box<dyn Fn() + Send>> {
        None
    }
}

/// Creates connections for one URL scheme / connector name.
pub trait Connector: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn connect(
        &self,
        url: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Box<dyn SqlConnection>>;
}

static CONNECTORS: Lazy<RwLock<BTreeMap<String, Arc<dyn Connector>>>> = Lazy::new(|| {
    let mut map: BTreeMap<String, Arc<dyn Connector>> = BTreeMap::new();
    map.insert("sqlite".to_string(), Arc::new(SqliteConnector));
    RwLock::new(map)
});

/// Register (or replace) a connector under a scheme / func name.
pub fn register_connector(name: &str, connector: Arc<dyn Connector>) {
    CONNECTORS
        .write()
        .expect("connector registry poisoned")
        .insert(name.to_string(), connector);
}

pub fn get_connector(name: &str) -> Option<Arc<dyn Connector>> {
    CONNECTORS
        .read()
        .expect("connector registry poisoned")
        .get(name)
        .cloned()
}

/// A datasource's resolved connection descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedConnection {
    Url(String),
    Func {
        func: String,
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl ResolvedConnection {
    /// The connector name: URL scheme or func name.
    pub fn connector_name(&self) -> Result<&str> {
        match self {
            ResolvedConnection::Url(url) => url
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .ok_or_else(|| {
                    Error::ds_config("connect", format!("connection url has no scheme: {}", url))
                }),
            ResolvedConnection::Func { func, .. } => Ok(func),
        }
    }

    pub fn dialect(&self) -> Result<Dialect> {
        let name = self.connector_name()?;
        if let Some(connector) = get_connector(name) {
            return Ok(connector.dialect());
        }
        Dialect::parse(name)
            .ok_or_else(|| Error::ds_config("connect", format!("unknown dialect '{}'", name)))
    }

    /// Open a connection through the registered connector.
    pub fn open(&self, datasource: &str) -> Result<Box<dyn SqlConnection>> {
        let name = self.connector_name()?;
        let connector = get_connector(name).ok_or_else(|| {
            Error::ds_config(datasource, format!("no connector registered for '{}'", name))
        })?;
        match self {
            ResolvedConnection::Url(url) => connector.connect(url, &BTreeMap::new()),
            ResolvedConnection::Func { params, .. } => connector.connect("", params),
        }
    }
}

// =============================================================================
// SQLite connector
// =============================================================================

#[derive(Debug)]
struct SqliteConnector;

impl Connector for SqliteConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(
        &self,
        url: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Box<dyn SqlConnection>> {
        let path = if url.is_empty() {
            params
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::ds_config("sqlite", "connector params require a 'path' entry")
                })?
                .to_string()
        } else {
            sqlite_path_from_url(url)
        };

        let conn = if path.is_empty() || path == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(&path)?
        };
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// `sqlite:///abs/path.db`, `sqlite://rel.db` or `sqlite://:memory:`.
fn sqlite_path_from_url(url: &str) -> String {
    let rest = url.strip_prefix("sqlite://").unwrap_or(url);
    rest.to_string()
}

struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqlConnection for SqliteConnection {
    fn run(&mut self, sql: &str) -> Result<Frame> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();

        let mut frame = Frame::new(columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut out = Vec::with_capacity(column_count);
            for i in 0..column_count {
                out.push(match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Int(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(v) => Value::Str(String::from_utf8_lossy(v).into_owned()),
                    ValueRef::Blob(v) => Value::Str(String::from_utf8_lossy(v).into_owned()),
                });
            }
            frame.push_row(out);
        }
        Ok(frame)
    }

    fn interrupt_handle(&self) -> Option<Box<dyn Fn() + Send>> {
        let handle = self.conn.get_interrupt_handle();
        Some(Box::new(move || handle.interrupt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_url_forms() {
        assert_eq!(sqlite_path_from_url("sqlite:///tmp/x.db"), "/tmp/x.db");
        assert_eq!(sqlite_path_from_url("sqlite://x.db"), "x.db");
        assert_eq!(sqlite_path_from_url("sqlite://:memory:"), ":memory:");
    }

    #[test]
    fn test_connector_name_and_dialect() {
        let c = ResolvedConnection::Url("sqlite:///tmp/x.db".into());
        assert_eq!(c.connector_name().unwrap(), "sqlite");
        assert_eq!(c.dialect().unwrap(), Dialect::Sqlite);

        let c = ResolvedConnection::Url("mysql://h/db".into());
        assert_eq!(c.dialect().unwrap(), Dialect::MySql);

        let c = ResolvedConnection::Url("no-scheme".into());
        assert!(c.connector_name().is_err());
    }

    #[test]
    fn test_memory_roundtrip() {
        let c = ResolvedConnection::Url("sqlite://:memory:".into());
        let mut conn = c.open("test").unwrap();
        let frame = conn.run("SELECT 1 AS one, 'x' AS s, NULL AS n").unwrap();
        assert_eq!(frame.columns, vec!["one", "s", "n"]);
        assert_eq!(frame.rows[0][0], Value::Int(1));
        assert_eq!(frame.rows[0][1], Value::Str("x".into()));
        assert!(frame.rows[0][2].is_null());
    }
}
