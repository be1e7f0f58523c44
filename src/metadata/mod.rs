//! The metadata store: saved warehouses and report specs.
//!
//! A small SQLite database with two tables. Report params are stored
//! verbatim as JSON; execution always recomputes the plan.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use rusqlite::OptionalExtension;

use crate::error::{Error, Result};
use crate::report::ReportParams;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS warehouses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    config_url TEXT NOT NULL,
    params_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    warehouse_id INTEGER NOT NULL,
    params_json TEXT NOT NULL
);
";

/// A saved warehouse row.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedWarehouse {
    pub id: i64,
    pub name: String,
    pub config_url: String,
    pub params_hash: String,
}

/// A saved report spec.
#[derive(Debug, Clone)]
pub struct SavedReport {
    pub id: i64,
    pub warehouse_id: i64,
    pub params: ReportParams,
}

pub struct MetadataStore {
    conn: Mutex<rusqlite::Connection>,
}

impl MetadataStore {
    /// Open (and bootstrap) the store at a `sqlite://` URL or plain
    /// path; `:memory:` is accepted for tests.
    pub fn open(db_url: &str) -> Result<Self> {
        let path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
        let conn = if path == ":memory:" || path.is_empty() {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save_warehouse(&self, name: &str, config_url: &str) -> Result<i64> {
        let params_hash = content_hash(&(name, config_url));
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO warehouses (name, config_url, params_hash) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, config_url, params_hash],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_warehouse(&self, id: i64) -> Result<SavedWarehouse> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.query_row(
            "SELECT id, name, config_url, params_hash FROM warehouses WHERE id = ?1",
            [id],
            |row| {
                Ok(SavedWarehouse {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    config_url: row.get(2)?,
                    params_hash: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(Error::InvalidWarehouseId(id))
    }

    pub fn save_report(&self, warehouse_id: i64, params: &ReportParams) -> Result<i64> {
        let params_json = serde_json::to_string(params)?;
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO reports (warehouse_id, params_json) VALUES (?1, ?2)",
            rusqlite::params![warehouse_id, params_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_report(&self, id: i64) -> Result<SavedReport> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, warehouse_id, params_json FROM reports WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or(Error::InvalidReportId(id))?;
        Ok(SavedReport {
            id: row.0,
            warehouse_id: row.1,
            params: serde_json::from_str(&row.2)?,
        })
    }

    pub fn delete_report(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let deleted = conn.execute("DELETE FROM reports WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::InvalidReportId(id));
        }
        Ok(())
    }
}

fn content_hash<T: Hash>(value: &T) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
