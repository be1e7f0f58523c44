//! Environment-driven global configuration.
//!
//! Settings are read once at startup from `STRATUM_*` environment
//! variables into an immutable record. A warehouse carries a copy, so
//! tests can construct custom settings without touching the process
//! environment.
//!
//! Recognized keys:
//!
//! | Key | Default |
//! |-----|---------|
//! | `STRATUM_DEBUG` | false |
//! | `STRATUM_LOG_LEVEL` | "info" |
//! | `STRATUM_LOAD_TABLE_CHUNK_SIZE` | 1000 |
//! | `STRATUM_DB_URL` | "sqlite://stratum.db" |
//! | `STRATUM_ADHOC_DATASOURCE_DIRECTORY` | "/tmp/stratum" |
//! | `STRATUM_DATASOURCE_QUERY_MODE` | "sequential" |
//! | `STRATUM_DATASOURCE_QUERY_TIMEOUT` | none |
//! | `STRATUM_DATASOURCE_QUERY_WORKERS` | 4 |
//! | `STRATUM_DATASOURCE_MAX_JOINS` | 5 |
//! | `STRATUM_DATASOURCE_MAX_JOIN_CANDIDATES` | 25 |
//! | `STRATUM_DATASOURCE_CONTEXTS` | {} |
//!
//! `STRATUM_DATASOURCE_CONTEXTS` is a JSON object of per-datasource
//! variable bags used for connection-URL interpolation, e.g.
//! `{"mydb": {"user": "analyst", "host": "db1"}}`.

use std::collections::HashMap;
use std::env;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "STRATUM_";

/// How datasource query plans are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Sequential,
    Multithread,
}

impl QueryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Some(QueryMode::Sequential),
            "multithread" => Some(QueryMode::Multithread),
            _ => None,
        }
    }
}

/// Immutable global settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub debug: bool,
    pub log_level: String,
    /// Rows per bulk insert into the combined layer.
    pub load_table_chunk_size: usize,
    /// Metadata store URL (report/warehouse specs).
    pub db_url: String,
    /// Directory for ad-hoc datasource files.
    pub adhoc_datasource_directory: String,
    pub datasource_query_mode: QueryMode,
    /// Per-query timeout in seconds; None disables.
    pub datasource_query_timeout: Option<u64>,
    /// Worker pool size for multithread mode.
    pub datasource_query_workers: usize,
    /// Upper bound on the number of joins in a single table set.
    pub datasource_max_joins: usize,
    /// Cap on distinct join covers considered per table/grain pair.
    pub datasource_max_join_candidates: usize,
    /// Per-datasource variable bags for connection-URL interpolation.
    pub datasource_contexts: HashMap<String, HashMap<String, String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".into(),
            load_table_chunk_size: 1000,
            db_url: "sqlite://stratum.db".into(),
            adhoc_datasource_directory: "/tmp/stratum".into(),
            datasource_query_mode: QueryMode::Sequential,
            datasource_query_timeout: None,
            datasource_query_workers: 4,
            datasource_max_joins: 5,
            datasource_max_join_candidates: 25,
            datasource_contexts: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `STRATUM_*` environment variables, falling back
    /// to defaults for unset keys. Unparseable values fall back with a
    /// warning rather than failing startup.
    pub fn from_env() -> Self {
        let mut s = Settings::default();

        if let Some(v) = get_env("DEBUG") {
            s.debug = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get_env("LOG_LEVEL") {
            s.log_level = v;
        }
        if let Some(v) = parse_env::<usize>("LOAD_TABLE_CHUNK_SIZE") {
            s.load_table_chunk_size = v.max(1);
        }
        if let Some(v) = get_env("DB_URL") {
            s.db_url = v;
        }
        if let Some(v) = get_env("ADHOC_DATASOURCE_DIRECTORY") {
            s.adhoc_datasource_directory = v;
        }
        if let Some(v) = get_env("DATASOURCE_QUERY_MODE") {
            match QueryMode::parse(&v) {
                Some(mode) => s.datasource_query_mode = mode,
                None => tracing::warn!(value = %v, "unrecognized datasource query mode"),
            }
        }
        if let Some(v) = parse_env::<u64>("DATASOURCE_QUERY_TIMEOUT") {
            s.datasource_query_timeout = Some(v);
        }
        if let Some(v) = parse_env::<usize>("DATASOURCE_QUERY_WORKERS") {
            s.datasource_query_workers = v.max(1);
        }
        if let Some(v) = parse_env::<usize>("DATASOURCE_MAX_JOINS") {
            s.datasource_max_joins = v.max(1);
        }
        if let Some(v) = parse_env::<usize>("DATASOURCE_MAX_JOIN_CANDIDATES") {
            s.datasource_max_join_candidates = v.max(1);
        }
        if let Some(v) = get_env("DATASOURCE_CONTEXTS") {
            match serde_json::from_str(&v) {
                Ok(contexts) => s.datasource_contexts = contexts,
                Err(err) => tracing::warn!(%err, "failed to parse STRATUM_DATASOURCE_CONTEXTS"),
            }
        }

        s
    }

    /// Interpolate `{var}` placeholders in a connection URL from the
    /// named datasource's context bag. Unknown placeholders are left
    /// untouched.
    pub fn interpolate_url(&self, datasource: &str, url: &str) -> String {
        let Some(ctx) = self.datasource_contexts.get(datasource) else {
            return url.to_string();
        };
        let mut out = url.to_string();
        for (key, value) in ctx {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }
}

/// Process-wide settings, loaded once from the environment.
pub static GLOBAL_SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

fn get_env(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            None
        }
    }
}
