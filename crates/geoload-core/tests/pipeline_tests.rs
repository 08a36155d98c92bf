//! End-to-end pipeline runs against in-memory collaborators
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{bow_tie, feature, regions, square, write_source, write_squares, Harness};
use geoload_core::config::{ChunkFailurePolicy, GeometryPolicy};
use geoload_core::fetch::LocalDirFetcher;
use geoload_core::ledger::{ChunkStatus, ProgressLedger, SUPERSEDED_MESSAGE};
use geoload_core::manifest::Manifest;
use geoload_core::memory::{MemoryInventory, MemoryLedger, MemoryStore};
use geoload_core::status::{JsonFileStatusStore, StatusStore};
use geoload_core::store::DestinationStore;
use geoload_core::validator::{write_report_csv, Validator};
use geoload_core::{
    Collaborators, LoadError, PipelineSettings, RegionOrchestrator, RegionStatus, RunMode,
};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn test_full_run_loads_every_chunk() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 130);

    let summary = harness
        .orchestrator()
        .run(&regions(&["Vermont"]), RunMode::Full)
        .await
        .unwrap();

    assert!(summary.all_completed());
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].status, RegionStatus::Completed);
    assert_eq!(summary.outcomes[0].total_features, Some(130));

    let manifest = Manifest::load(&harness.chunks_dir(), "Vermont").unwrap();
    let sizes: Vec<u64> = manifest.chunks.iter().map(|c| c.features).collect();
    assert_eq!(sizes, vec![50, 50, 30]);

    assert_eq!(harness.store.count_region("Vermont").await.unwrap(), 130);
    assert_eq!(
        harness.ledger.completed_chunks("Vermont").await.unwrap(),
        BTreeSet::from([1, 2, 3])
    );

    let record = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Completed);
    assert_eq!(record.total_chunks, Some(3));
    assert!(record.completed_at.is_some());
    assert!(record.last_error.is_none());

    let upserts = harness.inventory.upserts().await;
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].0, "Vermont");
    assert_eq!(upserts[0].1, 130);
}

#[tokio::test]
async fn test_status_history_follows_lifecycle() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Delaware", 60);

    harness
        .orchestrator()
        .run(&regions(&["Delaware"]), RunMode::Full)
        .await
        .unwrap();

    use RegionStatus::*;
    assert_eq!(
        harness.status.history("Delaware").await,
        vec![Cleaning, Fetching, Chunking, Uploading, Validating, Completed]
    );
}

#[tokio::test]
async fn test_resume_loads_only_remaining_chunks() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 130);
    harness.store.fail_chunk("Vermont", 2).await;

    let summary = harness
        .orchestrator()
        .run(&regions(&["Vermont"]), RunMode::Full)
        .await
        .unwrap();
    assert!(!summary.all_completed());
    assert_eq!(summary.failed().count(), 1);

    let record = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Failed);
    assert!(record.last_error.as_deref().unwrap().contains("Chunk 2"));
    assert_eq!(
        harness.store.insert_log().await,
        vec![("Vermont".to_string(), 1)]
    );

    harness.store.clear_failures().await;
    let summary = harness
        .orchestrator()
        .run(&regions(&["Vermont"]), RunMode::Resume)
        .await
        .unwrap();
    assert!(summary.all_completed());

    // chunk 1 is not reloaded
    let log: Vec<u32> = harness
        .store
        .insert_log()
        .await
        .into_iter()
        .map(|(_, chunk)| chunk)
        .collect();
    assert_eq!(log, vec![1, 2, 3]);
    assert_eq!(harness.store.count_region("Vermont").await.unwrap(), 130);

    let statuses: Vec<(u32, ChunkStatus)> = harness
        .ledger
        .entries("Vermont")
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.chunk_number, e.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (1, ChunkStatus::Completed),
            (2, ChunkStatus::Failed),
            (2, ChunkStatus::Completed),
            (3, ChunkStatus::Completed),
        ]
    );

    let tallies = harness.ledger.tallies().await.unwrap();
    assert_eq!(tallies["Vermont"].completed, 3);
    assert_eq!(tallies["Vermont"].failed, 1);
}

#[tokio::test]
async fn test_resume_supersedes_interrupted_attempt() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "RhodeIsland", 100);
    harness.store.fail_chunk("RhodeIsland", 2).await;

    harness
        .orchestrator()
        .run(&regions(&["RhodeIsland"]), RunMode::Full)
        .await
        .unwrap();
    harness.store.clear_failures().await;

    // a crash mid-chunk leaves a loading row behind
    harness.ledger.begin("RhodeIsland", 2, 50).await.unwrap();

    harness
        .orchestrator()
        .run(&regions(&["RhodeIsland"]), RunMode::Resume)
        .await
        .unwrap();

    let entries = harness.ledger.entries("RhodeIsland").await.unwrap();
    assert!(entries.iter().all(|e| e.status != ChunkStatus::Loading));
    let superseded = entries
        .iter()
        .filter(|e| e.error_message.as_deref() == Some(SUPERSEDED_MESSAGE))
        .count();
    assert_eq!(superseded, 1);
    assert_eq!(harness.store.count_region("RhodeIsland").await.unwrap(), 100);
}

#[tokio::test]
async fn test_full_rerun_after_failure_starts_clean() {
    let harness = Harness::new(40);
    write_squares(&harness.source_dir(), "Delaware", 100);
    harness.store.fail_chunk("Delaware", 3).await;

    harness
        .orchestrator()
        .run(&regions(&["Delaware"]), RunMode::Full)
        .await
        .unwrap();
    assert_eq!(
        harness.ledger.completed_chunks("Delaware").await.unwrap().len(),
        2
    );

    harness.store.clear_failures().await;
    harness
        .orchestrator()
        .run(&regions(&["Delaware"]), RunMode::Full)
        .await
        .unwrap();

    // cleaning dropped the earlier attempts
    let entries = harness.ledger.entries("Delaware").await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == ChunkStatus::Completed));
    assert_eq!(harness.store.count_region("Delaware").await.unwrap(), 100);
}

#[tokio::test]
async fn test_zero_feature_region_completes() {
    let harness = Harness::new(50);
    write_source(&harness.source_dir(), "Empty", Vec::new());

    let summary = harness
        .orchestrator()
        .run(&regions(&["Empty"]), RunMode::Full)
        .await
        .unwrap();
    assert!(summary.all_completed());

    let record = harness.status.get("Empty").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Completed);
    assert_eq!(record.total_features, Some(0));
    assert_eq!(record.total_chunks, Some(0));

    use RegionStatus::*;
    assert_eq!(
        harness.status.history("Empty").await,
        vec![Cleaning, Fetching, Chunking, Completed]
    );
    assert!(harness.store.insert_log().await.is_empty());
    assert_eq!(harness.inventory.upserts().await[0].1, 0);
}

#[tokio::test]
async fn test_completed_region_is_skipped() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 20);
    let targets = regions(&["Vermont"]);

    harness.orchestrator().run(&targets, RunMode::Full).await.unwrap();
    let inserts = harness.store.insert_log().await.len();

    let summary = harness.orchestrator().run(&targets, RunMode::Full).await.unwrap();
    assert!(summary.outcomes.is_empty());
    assert_eq!(summary.skipped, targets);
    assert!(summary.all_completed());
    assert_eq!(harness.store.insert_log().await.len(), inserts);
}

#[tokio::test]
async fn test_plan_reports_without_side_effects() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 10);
    let orchestrator = harness.orchestrator();
    orchestrator
        .run(&regions(&["Vermont"]), RunMode::Full)
        .await
        .unwrap();

    let plan = orchestrator
        .plan(&regions(&["Vermont", "Ohio", "Vermont"]))
        .await
        .unwrap();
    assert_eq!(plan.completed, vec!["Vermont"]);
    assert_eq!(plan.pending, vec![("Ohio".to_string(), RegionStatus::New)]);
    assert!(harness.status.get("Ohio").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_source_fails_at_fetching() {
    let harness = Harness::new(50);
    std::fs::create_dir_all(harness.source_dir()).unwrap();

    let summary = harness
        .orchestrator()
        .run(&regions(&["Ohio"]), RunMode::Full)
        .await
        .unwrap();
    assert_eq!(summary.outcomes[0].status, RegionStatus::Failed);

    use RegionStatus::*;
    assert_eq!(harness.status.history("Ohio").await, vec![Cleaning, Fetching, Failed]);
    let record = harness.status.get("Ohio").await.unwrap().unwrap();
    assert!(record.failed_at.is_some());
    assert!(record.last_error.unwrap().contains("Ohio"));
}

#[tokio::test]
async fn test_resume_without_manifest_fails() {
    let harness = Harness::new(50);
    let err = harness
        .orchestrator()
        .resume_region("Texas")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::ManifestMissing { .. }));

    let record = harness.status.get("Texas").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Failed);
}

#[tokio::test]
async fn test_failed_resume_records_newest_cause() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 130);
    harness.store.fail_chunk("Vermont", 2).await;

    harness.orchestrator().process_region("Vermont").await.unwrap_err();
    let first = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(first.status, RegionStatus::Failed);
    assert!(first.last_error.as_deref().unwrap().contains("Chunk 2"));

    std::fs::remove_file(
        geoload_core::manifest::region_dir(&harness.chunks_dir(), "Vermont")
            .join(geoload_core::manifest::MANIFEST_FILE),
    )
    .unwrap();
    let err = harness
        .orchestrator()
        .resume_region("Vermont")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::ManifestMissing { .. }));

    let record = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Failed);
    assert!(record.last_error.as_deref().unwrap().starts_with("No manifest for Vermont"));
    assert!(record.failed_at.unwrap() >= first.failed_at.unwrap());
}

#[tokio::test]
async fn test_malformed_source_fails_instead_of_completing_empty() {
    let harness = Harness::new(50);
    std::fs::create_dir_all(harness.source_dir()).unwrap();
    // unbalanced brackets in a member ahead of the features array
    std::fs::write(
        harness.source_dir().join("Maine.geojson"),
        r#"{"crs":{"x":[1},"features":[{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{}}]}}"#,
    )
    .unwrap();

    let err = harness
        .orchestrator()
        .process_region("Maine")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Parse { .. }));

    use RegionStatus::*;
    assert_eq!(
        harness.status.history("Maine").await,
        vec![Cleaning, Fetching, Chunking, Failed]
    );
    assert_eq!(harness.store.count_region("Maine").await.unwrap(), 0);
}

#[tokio::test]
async fn test_count_mismatch_records_discrepancy() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 80);
    harness.store.skew_count("Vermont", -5).await;

    let err = harness
        .orchestrator()
        .process_region("Vermont")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::CountMismatch { expected: 80, observed: 75, missing: 5, .. }
    ));

    let record = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Failed);
    assert_eq!(record.discrepancy, Some(5));
    assert!(harness.inventory.upserts().await.is_empty());
}

#[tokio::test]
async fn test_continue_policy_surfaces_shortfall_at_validation() {
    let mut harness = Harness::new(50);
    harness.chunk_failure_policy = ChunkFailurePolicy::Continue;
    write_squares(&harness.source_dir(), "Vermont", 130);
    harness.store.fail_chunk("Vermont", 2).await;

    let err = harness
        .orchestrator()
        .process_region("Vermont")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::CountMismatch { missing: 50, .. }));
    assert_eq!(
        harness.store.chunks_present("Vermont").await,
        BTreeSet::from([1, 3])
    );

    let record = harness.status.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.discrepancy, Some(50));
}

#[tokio::test]
async fn test_abort_policy_stops_at_first_failure() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 130);
    harness.store.fail_chunk("Vermont", 2).await;

    let err = harness
        .orchestrator()
        .process_region("Vermont")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::ChunkLoad { chunk: 2, .. }));
    assert_eq!(
        harness.store.chunks_present("Vermont").await,
        BTreeSet::from([1])
    );
}

#[tokio::test]
async fn test_geometry_policy() {
    let features = vec![
        feature(square(0), 0),
        feature(bow_tie(), 1),
        feature(square(2), 2),
    ];

    let mut strict = Harness::new(10);
    strict.geometry_policy = GeometryPolicy::Strict;
    write_source(&strict.source_dir(), "Delaware", features.clone());
    let err = strict
        .orchestrator()
        .process_region("Delaware")
        .await
        .unwrap_err();
    match err {
        LoadError::ChunkLoad { source, .. } => {
            assert!(matches!(*source, LoadError::GeometryRejected { invalid: 1, .. }))
        }
        other => panic!("unexpected error: {other}"),
    }

    let permissive = Harness::new(10);
    write_source(&permissive.source_dir(), "Delaware", features);
    let record = permissive
        .orchestrator()
        .process_region("Delaware")
        .await
        .unwrap();
    assert_eq!(record.status, RegionStatus::Completed);
    assert_eq!(permissive.store.count_region("Delaware").await.unwrap(), 3);
}

#[tokio::test]
async fn test_null_geometry_fails_chunk() {
    let harness = Harness::new(10);
    let features = vec![feature(square(0), 0), feature(serde_json::Value::Null, 1)];
    write_source(&harness.source_dir(), "Vermont", features);

    let err = harness
        .orchestrator()
        .process_region("Vermont")
        .await
        .unwrap_err();
    match err {
        LoadError::ChunkLoad { source, .. } => {
            assert!(matches!(*source, LoadError::MalformedGeometry { index: 1, .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_regions_processed_concurrently() {
    let mut harness = Harness::new(25);
    harness.region_concurrency = 3;
    for (region, count) in [("Delaware", 60), ("RhodeIsland", 45), ("Vermont", 10)] {
        write_squares(&harness.source_dir(), region, count);
    }

    let summary = harness
        .orchestrator()
        .run(&regions(&["Delaware", "RhodeIsland", "Vermont"]), RunMode::Full)
        .await
        .unwrap();
    assert!(summary.all_completed());
    assert_eq!(summary.outcomes.len(), 3);

    let counts = harness.store.count_by_region().await.unwrap();
    assert_eq!(counts["Delaware"], 60);
    assert_eq!(counts["RhodeIsland"], 45);
    assert_eq!(counts["Vermont"], 10);
}

#[tokio::test]
async fn test_validator_reconciles_after_run() {
    let harness = Harness::new(50);
    write_squares(&harness.source_dir(), "Vermont", 130);
    harness.inventory.set_expected("Vermont", 130).await;
    harness.inventory.set_expected("Ohio", 25).await;

    harness
        .orchestrator()
        .run(&regions(&["Vermont"]), RunMode::Full)
        .await
        .unwrap();

    let validator = Validator::new(
        harness.store.clone(),
        harness.ledger.clone(),
        harness.inventory.clone(),
    );
    let report = validator.reconcile().await.unwrap();
    assert_eq!(report.summary.regions, 2);
    assert_eq!(report.summary.regions_matched, 1);
    assert_eq!(report.summary.total_expected, 155);
    assert_eq!(report.summary.total_observed, 130);

    // mismatches sort first
    assert_eq!(report.rows[0].region, "Ohio");
    assert_eq!(report.rows[0].missing, Some(25));
    assert!(report.rows[1].matched);
    assert_eq!(report.rows[1].chunks_completed, 3);

    let region = validator.reconcile_region("Vermont").await.unwrap();
    assert_eq!(region.percent_complete, Some(100.0));

    let integrity = validator.integrity().await.unwrap();
    assert!(integrity.is_clean());
    assert_eq!(integrity.snapshot.total_rows, 130);

    let csv_path = harness.dir.path().join("reports").join("validation.csv");
    std::fs::create_dir_all(csv_path.parent().unwrap()).unwrap();
    write_report_csv(&csv_path, &report.rows).unwrap();
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert!(csv.starts_with(
        "region,expected,observed,match,missing,percent_complete,chunks_completed,chunks_failed"
    ));
}

fn json_collaborators(
    status: Arc<JsonFileStatusStore>,
    source_dir: &std::path::Path,
) -> Collaborators {
    let inventory = Arc::new(MemoryInventory::new());
    Collaborators {
        status,
        fetcher: Arc::new(LocalDirFetcher::new(source_dir)),
        store: Arc::new(MemoryStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
        catalog: inventory,
    }
}

#[tokio::test]
async fn test_json_status_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let source_dir = dir.path().join("source");
    let status_path = dir.path().join("state").join("pipeline_status.json");
    write_squares(&source_dir, "Vermont", 12);

    let orchestrator = RegionOrchestrator::new(
        json_collaborators(Arc::new(JsonFileStatusStore::new(&status_path)), &source_dir),
        PipelineSettings::new(dir.path().join("chunks"), 5),
    );
    orchestrator
        .run(&regions(&["Vermont"]), RunMode::Full)
        .await
        .unwrap();

    let reopened = JsonFileStatusStore::new(&status_path);
    let record = reopened.get("Vermont").await.unwrap().unwrap();
    assert_eq!(record.status, RegionStatus::Completed);
    assert_eq!(record.total_chunks, Some(3));
    assert!(!status_path.with_extension("json.tmp").exists());
}

#[tokio::test]
async fn test_unknown_status_blocks_run() {
    let dir = tempfile::TempDir::new().unwrap();
    let status_path = dir.path().join("pipeline_status.json");
    std::fs::write(
        &status_path,
        r#"{"Ohio": {"region": "Ohio", "status": "exploded", "updated_at": "2026-01-01T00:00:00Z"}}"#,
    )
    .unwrap();

    let orchestrator = RegionOrchestrator::new(
        json_collaborators(
            Arc::new(JsonFileStatusStore::new(&status_path)),
            &dir.path().join("source"),
        ),
        PipelineSettings::new(dir.path().join("chunks"), 5),
    );
    let err = orchestrator
        .run(&regions(&["Ohio"]), RunMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::UnknownStatus(ref s) if s == "exploded"));
}
