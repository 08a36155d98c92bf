//! Read-only reconciliation of expected, ledger and store counts
//!
//! Region rows join the inventory's expected totals against store counts and
//! ledger tallies; the global summary sums those rows. Integrity spot checks
//! report store-wide geometry problems without repairing anything.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DEFAULT_SRID;
use crate::error::Result;
use crate::inventory::InventorySource;
use crate::ledger::{ChunkTally, ProgressLedger};
use crate::store::{DestinationStore, IntegritySnapshot};

/// Geometry type every stored footprint is expected to have
pub const EXPECTED_GEOMETRY_TYPE: &str = "POLYGON";

/// Reconciliation of one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionReconciliation {
    pub region: String,
    /// None when the region is absent from the inventory
    pub expected: Option<u64>,
    pub observed: u64,
    #[serde(rename = "match")]
    pub matched: bool,
    /// expected − observed; negative when the store holds more than expected
    pub missing: Option<i64>,
    pub percent_complete: Option<f64>,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
}

impl RegionReconciliation {
    pub fn new(region: &str, expected: Option<u64>, observed: u64, tally: ChunkTally) -> Self {
        let missing = expected.map(|e| e as i64 - observed as i64);
        let percent_complete = expected.map(|e| percent(observed, e));
        Self {
            region: region.to_string(),
            expected,
            observed,
            matched: expected == Some(observed),
            missing,
            percent_complete,
            chunks_completed: tally.completed,
            chunks_failed: tally.failed,
        }
    }
}

/// observed / expected as a percentage with two decimals
///
/// Nothing expected counts as fully complete; the row's `match` still
/// flags any unexpected rows.
fn percent(observed: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 100.0;
    }
    (observed as f64 / expected as f64 * 10_000.0).round() / 100.0
}

/// Totals across all region rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub regions: usize,
    pub regions_matched: usize,
    pub total_expected: u64,
    pub total_observed: u64,
    pub percent_complete: f64,
    /// Regions whose row does not match, in report order
    pub mismatched: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Mismatches first, then by region name
    pub rows: Vec<RegionReconciliation>,
    pub summary: GlobalSummary,
}

/// Outer-join expected counts, store counts and ledger tallies
pub fn reconcile_counts(
    expected: &BTreeMap<String, u64>,
    observed: &BTreeMap<String, u64>,
    tallies: &BTreeMap<String, ChunkTally>,
) -> Vec<RegionReconciliation> {
    let regions: BTreeSet<&String> = expected
        .keys()
        .chain(observed.keys())
        .chain(tallies.keys())
        .collect();

    let mut rows: Vec<RegionReconciliation> = regions
        .into_iter()
        .map(|region| {
            RegionReconciliation::new(
                region,
                expected.get(region).copied(),
                observed.get(region).copied().unwrap_or(0),
                tallies.get(region).copied().unwrap_or_default(),
            )
        })
        .collect();

    rows.sort_by(|a, b| {
        a.matched
            .cmp(&b.matched)
            .then_with(|| a.region.cmp(&b.region))
    });
    rows
}

pub fn summarize(rows: &[RegionReconciliation]) -> GlobalSummary {
    let total_expected: u64 = rows.iter().filter_map(|r| r.expected).sum();
    let total_observed: u64 = rows.iter().map(|r| r.observed).sum();
    GlobalSummary {
        regions: rows.len(),
        regions_matched: rows.iter().filter(|r| r.matched).count(),
        total_expected,
        total_observed,
        percent_complete: percent(total_observed, total_expected),
        mismatched: rows
            .iter()
            .filter(|r| !r.matched)
            .map(|r| r.region.clone())
            .collect(),
    }
}

/// Write the region rows as CSV, replacing `path` atomically
pub fn write_report_csv(path: &Path, rows: &[RegionReconciliation]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A spot-check problem found in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityFinding {
    NullGeometries { count: u64 },
    InvalidGeometries { count: u64 },
    EmptyRegionLabels { count: u64 },
    UnexpectedSrids { found: Vec<i32> },
    UnexpectedGeometryTypes { found: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub snapshot: IntegritySnapshot,
    pub findings: Vec<IntegrityFinding>,
}

impl IntegrityReport {
    pub fn from_snapshot(snapshot: IntegritySnapshot, expected_srid: i32) -> Self {
        let mut findings = Vec::new();
        if snapshot.null_geometries > 0 {
            findings.push(IntegrityFinding::NullGeometries {
                count: snapshot.null_geometries,
            });
        }
        if snapshot.invalid_geometries > 0 {
            findings.push(IntegrityFinding::InvalidGeometries {
                count: snapshot.invalid_geometries,
            });
        }
        if snapshot.empty_region_labels > 0 {
            findings.push(IntegrityFinding::EmptyRegionLabels {
                count: snapshot.empty_region_labels,
            });
        }
        if snapshot.srids.iter().any(|s| *s != expected_srid) {
            findings.push(IntegrityFinding::UnexpectedSrids {
                found: snapshot.srids.clone(),
            });
        }
        if snapshot
            .geometry_types
            .iter()
            .any(|t| !t.eq_ignore_ascii_case(EXPECTED_GEOMETRY_TYPE))
        {
            findings.push(IntegrityFinding::UnexpectedGeometryTypes {
                found: snapshot.geometry_types.clone(),
            });
        }
        Self { snapshot, findings }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

pub struct Validator {
    store: Arc<dyn DestinationStore>,
    ledger: Arc<dyn ProgressLedger>,
    inventory: Arc<dyn InventorySource>,
    expected_srid: i32,
}

impl Validator {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        ledger: Arc<dyn ProgressLedger>,
        inventory: Arc<dyn InventorySource>,
    ) -> Self {
        Self {
            store,
            ledger,
            inventory,
            expected_srid: DEFAULT_SRID,
        }
    }

    pub fn with_expected_srid(mut self, srid: i32) -> Self {
        self.expected_srid = srid;
        self
    }

    /// Region and global reconciliation
    pub async fn reconcile(&self) -> Result<ValidationReport> {
        let expected = self.inventory.expected_counts().await?;
        let observed = self.store.count_by_region().await?;
        let tallies = self.ledger.tallies().await?;

        let rows = reconcile_counts(&expected, &observed, &tallies);
        let summary = summarize(&rows);

        info!(
            regions = summary.regions,
            matched = summary.regions_matched,
            total_expected = summary.total_expected,
            total_observed = summary.total_observed,
            percent_complete = summary.percent_complete,
            "Validation summary"
        );
        for row in rows.iter().filter(|r| !r.matched) {
            warn!(
                region = %row.region,
                expected = ?row.expected,
                observed = row.observed,
                missing = ?row.missing,
                chunks_failed = row.chunks_failed,
                "Region discrepancy"
            );
        }

        Ok(ValidationReport { rows, summary })
    }

    /// Reconcile a single region against the inventory
    pub async fn reconcile_region(&self, region: &str) -> Result<RegionReconciliation> {
        let expected = self.inventory.expected_counts().await?.get(region).copied();
        let observed = self.store.count_region(region).await?;
        let tally = self
            .ledger
            .tallies()
            .await?
            .get(region)
            .copied()
            .unwrap_or_default();
        Ok(RegionReconciliation::new(region, expected, observed, tally))
    }

    /// Store-wide spot checks
    pub async fn integrity(&self) -> Result<IntegrityReport> {
        let snapshot = self.store.integrity_snapshot().await?;
        let report = IntegrityReport::from_snapshot(snapshot, self.expected_srid);
        for finding in &report.findings {
            warn!(?finding, "Integrity check");
        }
        info!(
            total_rows = report.snapshot.total_rows,
            findings = report.findings.len(),
            "Integrity checks done"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_reconcile_counts() {
        let expected = map(&[("Delaware", 130), ("Vermont", 50), ("Ohio", 10)]);
        let observed = map(&[("Delaware", 130), ("Vermont", 40), ("Texas", 5)]);
        let tallies = BTreeMap::from([(
            "Vermont".to_string(),
            ChunkTally {
                completed: 1,
                failed: 1,
            },
        )]);

        let rows = reconcile_counts(&expected, &observed, &tallies);
        let order: Vec<&str> = rows.iter().map(|r| r.region.as_str()).collect();
        assert_eq!(order, vec!["Ohio", "Texas", "Vermont", "Delaware"]);

        let vermont = &rows[2];
        assert!(!vermont.matched);
        assert_eq!(vermont.missing, Some(10));
        assert_eq!(vermont.percent_complete, Some(80.0));
        assert_eq!(vermont.chunks_failed, 1);

        let texas = &rows[1];
        assert_eq!(texas.expected, None);
        assert!(!texas.matched);

        let delaware = &rows[3];
        assert!(delaware.matched);
        assert_eq!(delaware.missing, Some(0));
        assert_eq!(delaware.percent_complete, Some(100.0));

        let summary = summarize(&rows);
        assert_eq!(summary.total_expected, 190);
        assert_eq!(summary.total_observed, 175);
        assert_eq!(summary.regions_matched, 1);
        assert_eq!(summary.mismatched, vec!["Ohio", "Texas", "Vermont"]);
        assert_eq!(summary.percent_complete, 92.11);
    }

    #[test]
    fn test_overload_is_flagged_with_negative_missing() {
        let row = RegionReconciliation::new("Ohio", Some(10), 12, ChunkTally::default());
        assert!(!row.matched);
        assert_eq!(row.missing, Some(-2));
        assert_eq!(row.percent_complete, Some(120.0));
    }

    #[test]
    fn test_zero_expected_zero_observed_matches() {
        let row = RegionReconciliation::new("Empty", Some(0), 0, ChunkTally::default());
        assert!(row.matched);
        assert_eq!(row.percent_complete, Some(100.0));
    }

    #[test]
    fn test_integrity_findings() {
        let clean = IntegrityReport::from_snapshot(
            IntegritySnapshot {
                total_rows: 3,
                srids: vec![4326],
                geometry_types: vec!["POLYGON".into()],
                ..Default::default()
            },
            4326,
        );
        assert!(clean.is_clean());

        let dirty = IntegrityReport::from_snapshot(
            IntegritySnapshot {
                total_rows: 3,
                null_geometries: 1,
                empty_region_labels: 2,
                srids: vec![3857, 4326],
                geometry_types: vec!["MULTIPOLYGON".into(), "POLYGON".into()],
                ..Default::default()
            },
            4326,
        );
        assert_eq!(dirty.findings.len(), 4);
        assert!(dirty
            .findings
            .contains(&IntegrityFinding::UnexpectedSrids { found: vec![3857, 4326] }));
    }

    #[test]
    fn test_write_report_csv() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports/validation_report.csv");
        let rows = vec![RegionReconciliation::new(
            "Delaware",
            Some(130),
            130,
            ChunkTally {
                completed: 3,
                failed: 0,
            },
        )];
        write_report_csv(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "region,expected,observed,match,missing,percent_complete,chunks_completed,chunks_failed"
        );
        assert_eq!(lines.next().unwrap(), "Delaware,130,130,true,0,100.0,3,0");
    }
}
