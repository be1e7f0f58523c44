//! Planner behavior: grain satisfaction, query covers, determinism and
//! bounds.

mod common;

use common::{sample_config, sample_database, sample_settings};
use std::collections::BTreeSet;
use stratum::config::Settings;
use stratum::error::Error;
use stratum::planner::{Planner, ReportScope};
use stratum::report::Criterion;
use stratum::warehouse::Warehouse;
use tempfile::TempDir;

fn warehouse_with(settings: Settings) -> (TempDir, Warehouse) {
    let dir = TempDir::new().unwrap();
    let db_path = sample_database(dir.path());
    let config = sample_config(&db_path);
    let warehouse = Warehouse::from_config_with_settings("sample", &config, settings).unwrap();
    (dir, warehouse)
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_metrics_sharing_a_table_share_a_query() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let plan = planner
        .plan(
            &names(&["sales", "revenue"]),
            &names(&["partner_name"]),
            &[],
        )
        .unwrap();

    // Both metrics live on main.sales with the same join chain.
    assert_eq!(plan.queries.len(), 1);
    let query = &plan.queries[0];
    assert_eq!(query.table_set.ds_table, "main.sales");
    assert_eq!(query.metrics, vec!["sales".to_string(), "revenue".to_string()]);
    assert_eq!(query.table_set.join.as_ref().unwrap().len(), 3);
}

#[test]
fn test_metrics_on_different_tables_split_queries() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let plan = planner
        .plan(
            &names(&["sales", "leads", "revenue"]),
            &names(&["partner_name"]),
            &[],
        )
        .unwrap();

    assert_eq!(plan.queries.len(), 2);
    let anchors: Vec<&str> = plan
        .queries
        .iter()
        .map(|q| q.table_set.ds_table.as_str())
        .collect();
    assert_eq!(anchors, vec!["main.leads", "main.sales"]);
}

#[test]
fn test_grain_includes_criteria_and_formula_deps() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let criteria =
        vec![Criterion::new("campaign_name", "=", serde_json::json!("Campaign 1A")).unwrap()];
    let plan = planner
        .plan(&names(&["rpl"]), &names(&["partner_name"]), &criteria)
        .unwrap();

    let expected: BTreeSet<String> = ["partner_name", "campaign_name"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(plan.grain, expected);
    // rpl expands to its leaves (in leaf-set order).
    assert_eq!(
        plan.leaf_metrics,
        vec!["leads".to_string(), "revenue".to_string()]
    );
    // Every datasource query groups by the full grain.
    for query in &plan.queries {
        assert!(query.sql.contains("GROUP BY"));
        assert_eq!(query.dimensions, names(&["campaign_name", "partner_name"]));
    }
}

#[test]
fn test_plan_determinism() {
    let settings = sample_settings();
    let (_dir, warehouse) = warehouse_with(settings.clone());

    let build = |warehouse: &Warehouse| {
        let scope = ReportScope::new(warehouse);
        let planner = Planner::new(&scope);
        let plan = planner
            .plan(
                &names(&["sales", "leads", "revenue", "rpl"]),
                &names(&["partner_name", "campaign_name"]),
                &[],
            )
            .unwrap();
        plan.queries
            .iter()
            .map(|q| q.sql.clone())
            .collect::<Vec<_>>()
    };

    let first = build(&warehouse);
    for _ in 0..5 {
        assert_eq!(build(&warehouse), first);
    }
}

#[test]
fn test_max_joins_exceeded_is_unsupported_grain() {
    let settings = Settings {
        datasource_max_joins: 2,
        db_url: "sqlite://:memory:".into(),
        ..Settings::default()
    };
    let (_dir, warehouse) = warehouse_with(settings);
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    // partner_name is three joins from main.sales.
    let err = planner
        .plan(&names(&["revenue"]), &names(&["partner_name"]), &[])
        .unwrap_err();
    match err {
        Error::UnsupportedGrain { metrics, .. } => {
            assert_eq!(metrics, vec!["revenue".to_string()]);
        }
        other => panic!("expected UnsupportedGrain, got {other}"),
    }

    // leads only needs two joins, so it still plans.
    let plan = planner
        .plan(&names(&["leads"]), &names(&["partner_name"]), &[])
        .unwrap();
    assert_eq!(plan.queries.len(), 1);
}

#[test]
fn test_year_criteria_rewritten_to_range() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let criteria = vec![Criterion::new("sale_date_year", "=", serde_json::json!(2020)).unwrap()];
    let plan = planner
        .plan(&names(&["revenue"]), &names(&["sale_date_year"]), &criteria)
        .unwrap();

    let sql = &plan.queries[0].sql;
    // The filter targets the raw column as a range, preserving index
    // use; the select list still carries the conversion expression.
    assert!(sql.contains(">= '2020-01-01'"), "sql: {}", sql);
    assert!(sql.contains("< '2021-01-01'"), "sql: {}", sql);
    assert!(sql.contains("STRFTIME"), "sql: {}", sql);
}

#[test]
fn test_weighted_metric_emits_numerator_and_denominator() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let plan = planner
        .plan(&names(&["sale_size"]), &names(&["partner_name"]), &[])
        .unwrap();

    let sql = &plan.queries[0].sql;
    assert!(
        sql.contains("sale_size_weighting_metric_numerator"),
        "sql: {}",
        sql
    );
    assert!(
        sql.contains("sale_size_weighting_metric_denominator"),
        "sql: {}",
        sql
    );
    // The weighting metric rides along as a forced dependency.
    assert!(plan.leaf_metrics.contains(&"quantity".to_string()));
}

#[test]
fn test_unknown_field_errors() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    assert!(planner
        .plan(&names(&["no_such_metric"]), &names(&["partner_name"]), &[])
        .is_err());
    assert!(planner
        .plan(&names(&["revenue"]), &names(&["no_such_dim"]), &[])
        .is_err());
    // A metric name in dimension position is rejected.
    assert!(planner
        .plan(&names(&["revenue"]), &names(&["leads"]), &[])
        .is_err());
    // An empty report is rejected.
    assert!(planner.plan(&[], &[], &[]).is_err());
}

#[test]
fn test_criteria_on_metric_rejected() {
    let (_dir, warehouse) = warehouse_with(sample_settings());
    let scope = ReportScope::new(&warehouse);
    let planner = Planner::new(&scope);

    let criteria = vec![Criterion::new("revenue", ">", serde_json::json!(100)).unwrap()];
    let err = planner
        .plan(&names(&["leads"]), &names(&["partner_name"]), &criteria)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));
}
