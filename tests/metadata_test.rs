//! Saved report specs: save, execute by id, delete.

mod common;

use common::{sample_config, sample_database, sample_settings};
use serde_json::json;
use stratum::config::Settings;
use stratum::error::Error;
use stratum::report::ReportParams;
use stratum::warehouse::Warehouse;
use tempfile::TempDir;

fn build_with_metadata() -> (TempDir, Warehouse) {
    let dir = TempDir::new().unwrap();
    let db_path = sample_database(dir.path());
    let config = sample_config(&db_path);
    let settings = Settings {
        db_url: format!("sqlite://{}", dir.path().join("meta.db").display()),
        ..sample_settings()
    };
    let warehouse = Warehouse::from_config_with_settings("sample", &config, settings).unwrap();
    (dir, warehouse)
}

#[test]
fn test_save_execute_delete_round_trip() {
    let (_dir, mut warehouse) = build_with_metadata();

    let warehouse_id = warehouse.save("sample", "file:///tmp/sample.yaml").unwrap();
    assert_eq!(warehouse.id, Some(warehouse_id));

    let params: ReportParams = serde_json::from_value(json!({
        "metrics": ["sales", "leads", "revenue"],
        "dimensions": ["partner_name"],
        "rollup": "totals"
    }))
    .unwrap();

    let spec_id = warehouse.save_report(&params).unwrap();

    // Executing the saved spec matches executing the params directly.
    let direct = warehouse.execute(params.clone()).unwrap();
    let saved = warehouse.execute_id(spec_id).unwrap();
    assert_eq!(saved.frame, direct.frame);
    assert_eq!(saved.rollup_rows, direct.rollup_rows);

    warehouse.delete_report(spec_id).unwrap();
    assert!(matches!(
        warehouse.execute_id(spec_id),
        Err(Error::InvalidReportId(_))
    ));
}

#[test]
fn test_saved_subreport_reference() {
    let (_dir, warehouse) = build_with_metadata();

    // Save the subreport spec, then reference it by id from criteria.
    let sub: ReportParams = serde_json::from_value(json!({
        "dimensions": ["partner_name"],
        "metrics": ["revenue"],
        "row_filters": [["revenue", ">=", 100]]
    }))
    .unwrap();
    let sub_id = warehouse.save_report(&sub).unwrap();

    let result = warehouse
        .execute(
            serde_json::from_value(json!({
                "metrics": ["leads"],
                "dimensions": ["partner_name"],
                "criteria": [["partner_name", "in report", sub_id]]
            }))
            .unwrap(),
        )
        .unwrap();
    assert_eq!(result.frame.len(), 2);
}
