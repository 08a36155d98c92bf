//! Binary-level tests for commands that need no database
#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn geoload(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("geoload").unwrap();
    cmd.current_dir(dir.path())
        .env("SOURCE_DATA_DIR", dir.path().join("source"))
        .env("CHUNKS_DIR", dir.path().join("chunks"))
        .env("REPORTS_DIR", dir.path().join("reports"))
        .env("PIPELINE_STATUS_FILE", dir.path().join("pipeline_status.json"))
        .env("LOG_LEVEL", "warn");
    cmd
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("geoload")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chunk"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_inventory_writes_csv() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(
        source.join("Vermont.geojson"),
        r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":null,"properties":{}},{"type":"Feature","geometry":null,"properties":{}}]}"#,
    )
    .unwrap();

    geoload(&dir)
        .arg("inventory")
        .assert()
        .success()
        .stdout(predicate::str::contains("Vermont"));

    let csv = std::fs::read_to_string(dir.path().join("reports").join("source_inventory.csv")).unwrap();
    assert!(csv.starts_with("region,file_path,feature_count,file_size_mb"));
    assert!(csv.contains("Vermont,"));
    assert!(csv.contains(",2,"));
}

#[test]
fn test_status_without_history() {
    let dir = TempDir::new().unwrap();
    geoload(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pipeline status recorded yet."));
}

#[test]
fn test_dry_run_lists_pending_regions() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("pipeline_status.json"),
        r#"{"Delaware": {"region": "Delaware", "status": "completed", "updated_at": "2026-01-01T00:00:00Z"}}"#,
    )
    .unwrap();

    geoload(&dir)
        .args(["run", "--test", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Skipping (completed): Delaware"))
        .stdout(predicate::str::contains("Would process RhodeIsland (currently new)"))
        .stdout(predicate::str::contains("Would process Vermont (currently new)"));
}

#[test]
fn test_invalid_policy_is_rejected() {
    let dir = TempDir::new().unwrap();
    geoload(&dir)
        .env("GEOMETRY_POLICY", "sometimes")
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}
