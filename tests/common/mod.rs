//! Shared fixtures: the `partners -> campaigns -> leads -> sales`
//! sample schema in a throwaway SQLite file, plus its warehouse config.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use stratum::config::{Settings, WarehouseConfig};
use stratum::warehouse::Warehouse;
use tempfile::TempDir;

/// (id, lead_id, revenue, quantity) per sale; the sale date is
/// `2020-02-{id:02}`.
pub const SALES: &[(i64, i64, f64, i64)] = &[
    // Campaign 1A (leads 1, 2): 5 sales, 83.0 revenue
    (1, 1, 20.0, 2),
    (2, 1, 20.0, 1),
    (3, 2, 20.0, 1),
    (4, 2, 13.0, 1),
    (5, 2, 10.0, 1),
    // Campaign 2A (leads 3, 4): 6 sales, 82.0 revenue
    (6, 3, 20.0, 1),
    (7, 3, 20.0, 1),
    (8, 3, 10.0, 1),
    (9, 4, 10.0, 1),
    (10, 4, 11.0, 1),
    (11, 4, 11.0, 1),
    // Campaign 1B (leads 5, 6): 2 sales, 19.0 revenue
    (12, 5, 10.0, 1),
    (13, 6, 9.0, 1),
    // Campaign 1C (lead 7): 5 sales, 118.5 revenue
    (14, 7, 30.0, 2),
    (15, 7, 30.0, 1),
    (16, 7, 30.0, 1),
    (17, 7, 18.5, 1),
    (18, 7, 10.0, 1),
];

pub fn sale_date(id: i64) -> String {
    format!("2020-02-{:02}", id)
}

/// Create the sample database file and return its path.
pub fn sample_database(dir: &Path) -> PathBuf {
    let path = dir.join("sample.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "
        CREATE TABLE partners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE campaigns (
            id INTEGER PRIMARY KEY,
            partner_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE leads (
            id INTEGER PRIMARY KEY,
            campaign_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE sales (
            id INTEGER PRIMARY KEY,
            lead_id INTEGER NOT NULL,
            item TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            revenue DOUBLE NOT NULL,
            created_at TEXT NOT NULL
        );

        INSERT INTO partners VALUES
            (1, 'Partner A', '2019-01-01'),
            (2, 'Partner B', '2019-02-01'),
            (3, 'Partner C', '2019-03-01');

        INSERT INTO campaigns VALUES
            (1, 1, 'Campaign 1A', '2019-04-01'),
            (2, 1, 'Campaign 2A', '2019-05-01'),
            (3, 2, 'Campaign 1B', '2019-06-01'),
            (4, 3, 'Campaign 1C', '2019-07-01');

        INSERT INTO leads VALUES
            (1, 1, 'Lead 1', '2019-08-01'),
            (2, 1, 'Lead 2', '2019-08-02'),
            (3, 2, 'Lead 3', '2019-08-03'),
            (4, 2, 'Lead 4', '2019-08-04'),
            (5, 3, 'Lead 5', '2019-08-05'),
            (6, 3, 'Lead 6', '2019-08-06'),
            (7, 4, 'Lead 7', '2019-08-07');
        ",
    )
    .unwrap();

    let mut stmt = conn
        .prepare("INSERT INTO sales VALUES (?1, ?2, ?3, ?4, ?5, ?6)")
        .unwrap();
    for (id, lead_id, revenue, quantity) in SALES {
        stmt.execute(rusqlite::params![
            id,
            lead_id,
            format!("Item {}", id),
            quantity,
            revenue,
            sale_date(*id),
        ])
        .unwrap();
    }
    path
}

pub fn sample_config(db_path: &Path) -> WarehouseConfig {
    let yaml = format!(
        r#"
metrics:
  - name: revenue
    type: float
    aggregation: sum
    divisors:
      metrics: [leads]
      rounding: 2
  - name: revenue_rg
    type: float
    aggregation: sum
    required_grain: [campaign_name]
  - name: leads
    type: integer
    aggregation: count_distinct
  - name: sales
    type: integer
    aggregation: count_distinct
  - name: quantity
    type: integer
    aggregation: sum
  - name: sale_size
    type: float
    aggregation: mean
    weighting_metric: quantity
    rounding: 2
  - name: rpl
    formula: "{{revenue}}/{{leads}}"
    rounding: 2
  - name: revenue_ma_5
    formula: "{{revenue}}"
    technical: "mean(5)"
    rounding: 2
dimensions:
  - name: partner_id
    type: integer
  - name: partner_name
    type: string
  - name: campaign_id
    type: integer
  - name: campaign_name
    type: string
  - name: lead_id
    type: integer
  - name: lead_name
    type: string
  - name: sale_id
    type: integer
  - name: sale_date
    type: datetime
  - name: partner_label
    formula: "{{partner_name}} || ' (partner)'"
datasources:
  main:
    connect: "sqlite://{db_path}"
    tables:
      main.partners:
        type: dimension
        primary_key: [partner_id]
        columns:
          id:
            fields: [partner_id]
            type: integer
          name:
            fields: [partner_name]
      main.campaigns:
        type: dimension
        parent: main.partners
        primary_key: [campaign_id]
        columns:
          id:
            fields: [campaign_id]
            type: integer
          partner_id:
            fields: [partner_id]
            type: integer
          name:
            fields: [campaign_name]
      main.leads:
        type: metric
        parent: main.campaigns
        primary_key: [lead_id]
        columns:
          id:
            fields:
              - lead_id
              - name: leads
                ds_formula: "COUNT(DISTINCT leads.id)"
            type: integer
          campaign_id:
            fields: [campaign_id]
            type: integer
          name:
            fields: [lead_name]
      main.sales:
        type: metric
        parent: main.leads
        primary_key: [sale_id]
        columns:
          id:
            fields:
              - sale_id
              - name: sales
                ds_formula: "COUNT(DISTINCT sales.id)"
            type: integer
          lead_id:
            fields: [lead_id]
            type: integer
          quantity:
            fields: [quantity]
            type: integer
          revenue:
            fields: [revenue, revenue_rg, sale_size]
            type: float
          created_at:
            fields: [sale_date]
            type: datetime
            allow_type_conversions: true
"#,
        db_path = db_path.display()
    );
    WarehouseConfig::from_yaml(&yaml).unwrap()
}

pub fn sample_settings() -> Settings {
    Settings {
        db_url: "sqlite://:memory:".into(),
        ..Settings::default()
    }
}

/// A fully built warehouse over a throwaway database. Keep the TempDir
/// alive for the duration of the test.
pub fn sample_warehouse() -> (TempDir, Warehouse) {
    let dir = TempDir::new().unwrap();
    let db_path = sample_database(dir.path());
    let config = sample_config(&db_path);
    let warehouse =
        Warehouse::from_config_with_settings("sample", &config, sample_settings()).unwrap();
    (dir, warehouse)
}

pub fn sample_warehouse_with_settings(settings: Settings) -> (TempDir, Warehouse) {
    let dir = TempDir::new().unwrap();
    let db_path = sample_database(dir.path());
    let config = sample_config(&db_path);
    let warehouse =
        Warehouse::from_config_with_settings("sample", &config, settings).unwrap();
    (dir, warehouse)
}
