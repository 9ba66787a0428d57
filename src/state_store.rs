// =============================================================================
// State Store — persisted seen-trade sets, exposure ledger, and live positions
// =============================================================================
//
// A small key-value store over JSON files in the data directory:
//
//   state.json     — {seenTradeIds, dailyVolume, marketExposure,
//                     lastPollTimestamp}
//   positions.json — live holdings keyed by token id
//
// Writes are journaled: serialize to a sibling `.tmp`, fsync, atomic rename.
// Reads tolerate missing files by returning empty defaults.
//
// The exposure ledger distinguishes *committed* exposure (persisted) from
// *reserved* exposure (in-memory, taken when the risk gate allows a trade and
// settled when the executor finishes). Projections used by the risk checks
// always include reservations so queued orders cannot over-commit the caps.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{now_ms, Position, Side};

/// Seen-trade entries older than this are evicted.
const SEEN_MAX_AGE_MS: i64 = 7 * 24 * 3_600 * 1_000;
/// Per-wallet cap on the in-memory (and persisted) seen working set.
const SEEN_MAX_ENTRIES: usize = 1_000;

const STATE_FILE: &str = "state.json";
const POSITIONS_FILE: &str = "positions.json";

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyVolume {
    #[serde(default)]
    date: String,
    #[serde(default)]
    total_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    #[serde(default)]
    seen_trade_ids: HashMap<String, Vec<String>>,
    #[serde(default)]
    daily_volume: DailyVolume,
    #[serde(default)]
    market_exposure: HashMap<String, f64>,
    #[serde(default)]
    last_poll_timestamp: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedPositions {
    #[serde(default)]
    positions: HashMap<String, Position>,
}

// =============================================================================
// In-memory state
// =============================================================================

/// Per-wallet seen set with O(1) membership and age/size-ordered eviction.
#[derive(Debug, Default)]
struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<(String, i64)>,
}

impl SeenSet {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Insert an id; returns false if it was already present.
    fn insert(&mut self, id: &str, now: i64) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back((id.to_string(), now));
        self.evict(now);
        true
    }

    fn evict(&mut self, now: i64) {
        while let Some((id, at)) = self.order.front() {
            let too_old = now - at > SEEN_MAX_AGE_MS;
            let too_many = self.order.len() > SEEN_MAX_ENTRIES;
            if too_old || too_many {
                self.ids.remove(id);
                self.order.pop_front();
            } else {
                break;
            }
        }
    }

    fn to_vec(&self) -> Vec<String> {
        self.order.iter().map(|(id, _)| id.clone()).collect()
    }
}

struct Inner {
    state: PersistedState,
    seen: HashMap<String, SeenSet>,
    positions: HashMap<String, Position>,
    /// In-flight reservations per condition id ("" for unknown markets).
    reserved_market: HashMap<String, f64>,
    reserved_daily: f64,
}

// =============================================================================
// Store
// =============================================================================

/// Disk-backed engine state. All mutation serializes through one write lock;
/// readers get value snapshots.
pub struct StateStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open (or initialize) the store under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;

        let state: PersistedState = read_json_or_default(&dir.join(STATE_FILE))?;
        let persisted_positions: PersistedPositions =
            read_json_or_default(&dir.join(POSITIONS_FILE))?;

        // Entries loaded from disk carry no timestamps; stamp them at load so
        // age-based eviction starts counting from this session.
        let now = now_ms();
        let mut seen = HashMap::new();
        for (wallet, ids) in &state.seen_trade_ids {
            let mut set = SeenSet::default();
            for id in ids {
                set.insert(id, now);
            }
            seen.insert(wallet.clone(), set);
        }

        info!(
            dir = %dir.display(),
            wallets = seen.len(),
            positions = persisted_positions.positions.len(),
            "state store opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                state,
                seen,
                positions: persisted_positions.positions,
                reserved_market: HashMap::new(),
                reserved_daily: 0.0,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Seen-trade sets
    // -------------------------------------------------------------------------

    pub fn has_seen(&self, wallet: &str, trade_id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .seen
            .get(&wallet.to_lowercase())
            .map(|s| s.contains(trade_id))
            .unwrap_or(false)
    }

    /// Record a trade id for a wallet. Idempotent; persists on change.
    pub fn mark_seen(&self, wallet: &str, trade_id: &str) -> Result<()> {
        let wallet = wallet.to_lowercase();
        let mut inner = self.inner.lock();
        let changed = inner
            .seen
            .entry(wallet.clone())
            .or_default()
            .insert(trade_id, now_ms());
        if changed {
            let ids = inner.seen[&wallet].to_vec();
            inner.state.seen_trade_ids.insert(wallet, ids);
            self.write_state(&inner.state)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exposure ledger
    // -------------------------------------------------------------------------

    /// Committed + reserved exposure for a market.
    pub fn market_exposure(&self, condition_id: &str) -> f64 {
        let mut inner = self.inner.lock();
        Self::maybe_roll_date(&mut inner.state);
        inner.state.market_exposure.get(condition_id).copied().unwrap_or(0.0)
            + inner.reserved_market.get(condition_id).copied().unwrap_or(0.0)
    }

    /// Committed + reserved volume for the current local date.
    pub fn daily_volume(&self) -> f64 {
        let mut inner = self.inner.lock();
        Self::maybe_roll_date(&mut inner.state);
        inner.state.daily_volume.total_usd + inner.reserved_daily
    }

    /// Take a tentative reservation for an allowed trade. The reservation is
    /// settled by `commit_exposure` or `release_exposure`.
    pub fn reserve_exposure(&self, condition_id: Option<&str>, usd: f64) {
        let mut inner = self.inner.lock();
        let key = condition_id.unwrap_or("").to_string();
        *inner.reserved_market.entry(key).or_insert(0.0) += usd;
        inner.reserved_daily += usd;
    }

    /// Convert a reservation into committed exposure and daily volume.
    /// BUYs increase per-market exposure; SELLs decrease it (never below 0);
    /// both sides count toward daily volume.
    pub fn commit_exposure(&self, condition_id: Option<&str>, usd: f64, side: Side) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::maybe_roll_date(&mut inner.state);
        Self::drop_reservation(&mut inner, condition_id, usd);

        if let Some(cond) = condition_id {
            let entry = inner
                .state
                .market_exposure
                .entry(cond.to_string())
                .or_insert(0.0);
            match side {
                Side::Buy => *entry += usd,
                Side::Sell => *entry = (*entry - usd).max(0.0),
            }
        }
        inner.state.daily_volume.total_usd += usd;
        self.write_state(&inner.state)
    }

    /// Release a reservation after a failed or skipped execution.
    pub fn release_exposure(&self, condition_id: Option<&str>, usd: f64) {
        let mut inner = self.inner.lock();
        Self::drop_reservation(&mut inner, condition_id, usd);
    }

    fn drop_reservation(inner: &mut Inner, condition_id: Option<&str>, usd: f64) {
        let key = condition_id.unwrap_or("");
        if let Some(r) = inner.reserved_market.get_mut(key) {
            *r = (*r - usd).max(0.0);
            if *r == 0.0 {
                inner.reserved_market.remove(key);
            }
        }
        inner.reserved_daily = (inner.reserved_daily - usd).max(0.0);
    }

    /// Zero the daily counter when the local date changes.
    fn maybe_roll_date(state: &mut PersistedState) {
        let today = Local::now().format("%Y-%m-%d").to_string();
        if state.daily_volume.date != today {
            if !state.daily_volume.date.is_empty() {
                info!(
                    old_date = %state.daily_volume.date,
                    new_date = %today,
                    "date rolled — resetting daily volume"
                );
            }
            state.daily_volume.date = today;
            state.daily_volume.total_usd = 0.0;
        }
    }

    // -------------------------------------------------------------------------
    // Poll cursors
    // -------------------------------------------------------------------------

    pub fn last_poll_ts(&self, wallet: &str) -> Option<i64> {
        self.inner
            .lock()
            .state
            .last_poll_timestamp
            .get(&wallet.to_lowercase())
            .copied()
    }

    pub fn set_last_poll_ts(&self, wallet: &str, ts_ms: i64) {
        let mut inner = self.inner.lock();
        inner
            .state
            .last_poll_timestamp
            .insert(wallet.to_lowercase(), ts_ms);
        // Cursor updates are frequent and harmless to lose; flushed with the
        // next durable write.
    }

    // -------------------------------------------------------------------------
    // Live positions
    // -------------------------------------------------------------------------

    pub fn snapshot_positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    pub fn position(&self, token_id: &str) -> Option<Position> {
        self.inner.lock().positions.get(token_id).cloned()
    }

    /// Shares currently held in a token (0 when unknown).
    pub fn held_shares(&self, token_id: &str) -> f64 {
        self.inner
            .lock()
            .positions
            .get(token_id)
            .map(|p| p.shares)
            .unwrap_or(0.0)
    }

    /// Insert or replace a position record and persist.
    pub fn upsert_position(&self, position: Position) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .positions
            .insert(position.token_id.clone(), position);
        self.write_positions(&inner.positions)
    }

    /// Apply an executed fill to the live holdings.
    pub fn apply_fill(&self, token_id: &str, side: Side, shares: f64, price: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        match side {
            Side::Buy => {
                inner
                    .positions
                    .entry(token_id.to_string())
                    .and_modify(|p| p.apply_buy(shares, price))
                    .or_insert_with(|| Position::open(token_id, shares, price));
            }
            Side::Sell => {
                if let Some(p) = inner.positions.get_mut(token_id) {
                    p.apply_sell(shares, price);
                    if !p.is_open() {
                        inner.positions.remove(token_id);
                    }
                } else {
                    warn!(token_id, "SELL fill for unknown position — ignoring");
                }
            }
        }
        self.write_positions(&inner.positions)
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Force both files to disk (used on supervisor stop).
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.write_state(&inner.state)?;
        self.write_positions(&inner.positions)?;
        debug!("state store flushed");
        Ok(())
    }

    fn write_state(&self, state: &PersistedState) -> Result<()> {
        write_json_atomic(&self.dir.join(STATE_FILE), state)
    }

    fn write_positions(&self, positions: &HashMap<String, Position>) -> Result<()> {
        let wire = PersistedPositions {
            positions: positions.clone(),
        };
        write_json_atomic(&self.dir.join(POSITIONS_FILE), &wire)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateStore")
            .field("dir", &self.dir)
            .field("wallets", &inner.seen.len())
            .field("positions", &inner.positions.len())
            .finish()
    }
}

// =============================================================================
// JSON file helpers
// =============================================================================

/// Read a JSON file, returning the type's default when the file is missing.
pub fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Journaled write: serialize to `<path>.tmp`, fsync, atomic rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (StateStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-store-{}", uuid::Uuid::new_v4()));
        let store = StateStore::open(&dir).unwrap();
        (store, dir)
    }

    #[test]
    fn mark_seen_is_idempotent_and_persists() {
        let (store, dir) = temp_store();
        assert!(!store.has_seen("0xABC", "t1"));
        store.mark_seen("0xABC", "t1").unwrap();
        assert!(store.has_seen("0xabc", "t1"));
        // Second mark is a no-op.
        store.mark_seen("0xabc", "t1").unwrap();

        // Reload from disk.
        drop(store);
        let store = StateStore::open(&dir).unwrap();
        assert!(store.has_seen("0xabc", "t1"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn seen_set_caps_working_set() {
        let mut set = SeenSet::default();
        let now = now_ms();
        for i in 0..(SEEN_MAX_ENTRIES + 50) {
            set.insert(&format!("id-{i}"), now);
        }
        assert!(set.order.len() <= SEEN_MAX_ENTRIES);
        // The oldest entries fell out; the newest survive.
        assert!(!set.contains("id-0"));
        assert!(set.contains(&format!("id-{}", SEEN_MAX_ENTRIES + 49)));
    }

    #[test]
    fn seen_set_evicts_by_age() {
        let mut set = SeenSet::default();
        let old = now_ms() - SEEN_MAX_AGE_MS - 1_000;
        set.insert("stale", old);
        set.insert("fresh", now_ms());
        assert!(!set.contains("stale"));
        assert!(set.contains("fresh"));
    }

    #[test]
    fn reservation_commit_and_release() {
        let (store, dir) = temp_store();

        store.reserve_exposure(Some("cond-1"), 10.0);
        assert_eq!(store.market_exposure("cond-1"), 10.0);
        assert_eq!(store.daily_volume(), 10.0);

        // Release returns the ledger to its prior state.
        store.release_exposure(Some("cond-1"), 10.0);
        assert_eq!(store.market_exposure("cond-1"), 0.0);
        assert_eq!(store.daily_volume(), 0.0);

        // Commit moves the reservation into persisted exposure.
        store.reserve_exposure(Some("cond-1"), 10.0);
        store.commit_exposure(Some("cond-1"), 10.0, Side::Buy).unwrap();
        assert_eq!(store.market_exposure("cond-1"), 10.0);
        assert_eq!(store.daily_volume(), 10.0);

        // A SELL reduces market exposure but still counts as volume.
        store.reserve_exposure(Some("cond-1"), 4.0);
        store.commit_exposure(Some("cond-1"), 4.0, Side::Sell).unwrap();
        assert_eq!(store.market_exposure("cond-1"), 6.0);
        assert_eq!(store.daily_volume(), 14.0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn sell_exposure_never_goes_negative() {
        let (store, dir) = temp_store();
        store.reserve_exposure(Some("cond-2"), 5.0);
        store.commit_exposure(Some("cond-2"), 5.0, Side::Sell).unwrap();
        assert_eq!(store.market_exposure("cond-2"), 0.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn apply_fill_tracks_positions() {
        let (store, dir) = temp_store();

        store.apply_fill("tok-1", Side::Buy, 100.0, 0.40).unwrap();
        let pos = store.position("tok-1").unwrap();
        assert_eq!(pos.shares, 100.0);
        assert!((pos.avg_entry_price - 0.40).abs() < 1e-9);
        assert!((pos.total_cost - 40.0).abs() < 1e-9);

        // Averaging in at a higher price.
        store.apply_fill("tok-1", Side::Buy, 100.0, 0.60).unwrap();
        let pos = store.position("tok-1").unwrap();
        assert_eq!(pos.shares, 200.0);
        assert!((pos.avg_entry_price - 0.50).abs() < 1e-9);

        // Selling to zero removes the position.
        store.apply_fill("tok-1", Side::Sell, 200.0, 0.55).unwrap();
        assert!(store.position("tok-1").is_none());
        assert_eq!(store.held_shares("tok-1"), 0.0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_files_read_as_defaults() {
        let dir = std::env::temp_dir().join(format!("mirror-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let state: PersistedState = read_json_or_default(&dir.join("nope.json")).unwrap();
        assert!(state.seen_trade_ids.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
