// =============================================================================
// Chart History — rolling P&L snapshots for the dashboard chart
// =============================================================================
//
// One snapshot per minute, persisted to `chart-history.json`. The series is
// capped at 10,080 entries (7 days at 1/min); on overflow the oldest fifth
// is downsampled to every fifth point so long-running books keep a coarse
// tail instead of losing it.
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state_store::{read_json_or_default, write_json_atomic};
use crate::types::now_ms;

const CHART_FILE: &str = "chart-history.json";

/// 7 days at one snapshot per minute.
const MAX_SNAPSHOTS: usize = 10_080;

/// Fraction of the series downsampled on overflow.
const DOWNSAMPLE_FRACTION: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSnapshot {
    pub timestamp: i64,
    pub pnl: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChartFile {
    #[serde(default)]
    snapshots: Vec<ChartSnapshot>,
}

/// Persistent snapshot series, bounded by downsampling.
pub struct ChartHistory {
    path: PathBuf,
    inner: Mutex<ChartFile>,
}

impl ChartHistory {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(CHART_FILE);
        let file: ChartFile = read_json_or_default(&path)?;
        debug!(snapshots = file.snapshots.len(), "chart history loaded");
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// Append a snapshot, enforcing the cap.
    pub fn record(&self, realized_pnl: f64, unrealized_pnl: f64, balance: f64) {
        let mut file = self.inner.lock();
        file.snapshots.push(ChartSnapshot {
            timestamp: now_ms(),
            pnl: realized_pnl + unrealized_pnl,
            realized_pnl,
            unrealized_pnl,
            balance,
        });

        if file.snapshots.len() > MAX_SNAPSHOTS {
            Self::downsample(&mut file.snapshots);
        }

        if let Err(e) = write_json_atomic(&self.path, &*file) {
            warn!(error = %e, "failed to persist chart history");
        }
    }

    /// Thin the oldest fifth of the series to every fifth point.
    fn downsample(snapshots: &mut Vec<ChartSnapshot>) {
        let cutoff = snapshots.len() / DOWNSAMPLE_FRACTION;
        let old: Vec<ChartSnapshot> = snapshots
            .drain(..cutoff)
            .enumerate()
            .filter(|(i, _)| i % DOWNSAMPLE_FRACTION == 0)
            .map(|(_, s)| s)
            .collect();

        let kept = old.len();
        let mut merged = old;
        merged.append(snapshots);
        *snapshots = merged;

        debug!(kept, total = snapshots.len(), "chart history downsampled");
    }

    pub fn snapshots(&self) -> Vec<ChartSnapshot> {
        self.inner.lock().snapshots.clone()
    }
}

impl std::fmt::Debug for ChartHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartHistory")
            .field("snapshots", &self.inner.lock().snapshots.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> (ChartHistory, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-chart-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let history = ChartHistory::open(&dir).unwrap();
        (history, dir)
    }

    #[test]
    fn record_appends_combined_pnl() {
        let (history, dir) = history();
        history.record(10.0, -2.5, 1_007.5);
        let snaps = history.snapshots();
        assert_eq!(snaps.len(), 1);
        assert!((snaps[0].pnl - 7.5).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn downsample_thins_oldest_fifth() {
        let mut snapshots: Vec<ChartSnapshot> = (0..1_000)
            .map(|i| ChartSnapshot {
                timestamp: i,
                pnl: i as f64,
                realized_pnl: 0.0,
                unrealized_pnl: 0.0,
                balance: 0.0,
            })
            .collect();

        ChartHistory::downsample(&mut snapshots);

        // Oldest 200 thinned to 40, newest 800 untouched.
        assert_eq!(snapshots.len(), 840);
        assert_eq!(snapshots[0].timestamp, 0);
        assert_eq!(snapshots[1].timestamp, 5);
        assert_eq!(snapshots[40].timestamp, 200);
        assert_eq!(snapshots.last().unwrap().timestamp, 999);
    }

    #[test]
    fn series_stays_bounded() {
        let mut snapshots: Vec<ChartSnapshot> = (0..(MAX_SNAPSHOTS + 1) as i64)
            .map(|i| ChartSnapshot {
                timestamp: i,
                pnl: 0.0,
                realized_pnl: 0.0,
                unrealized_pnl: 0.0,
                balance: 0.0,
            })
            .collect();
        ChartHistory::downsample(&mut snapshots);
        assert!(snapshots.len() < MAX_SNAPSHOTS);
    }

    #[test]
    fn persists_across_reopen() {
        let (history, dir) = history();
        history.record(1.0, 0.0, 100.0);
        drop(history);
        let history = ChartHistory::open(&dir).unwrap();
        assert_eq!(history.snapshots().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
