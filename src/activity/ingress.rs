// =============================================================================
// Ingress Gate — single deduplication funnel in front of the supervisor
// =============================================================================
//
// Both activity sources route through this gate; nothing else dedups. Policy
// per trade id:
//   1. in the in-memory recent map (30 s TTL)      → drop
//   2. in the persisted seen set for the wallet    → drop, remember recently
//   3. otherwise                                   → remember, persist, pass
//
// The recent map is bounded: expired entries are purged on every touch, and
// on overflow beyond the cap the oldest entries go first.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::state_store::StateStore;

/// How long a trade id stays in the recent map.
const RECENT_TTL: Duration = Duration::from_secs(30);
/// Hard cap on the recent map.
const RECENT_CAP: usize = 100;

struct RecentMap {
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl RecentMap {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|at| now.duration_since(*at) >= RECENT_TTL)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
        // Overflow beyond the cap evicts the oldest survivors too.
        while self.order.len() > RECENT_CAP {
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, key: String, now: Instant) {
        if self.entries.insert(key.clone(), now).is_none() {
            self.order.push_back(key);
        }
        self.purge(now);
    }
}

/// The only place duplicate suppression happens.
pub struct DedupGate {
    recent: Mutex<RecentMap>,
    store: Arc<StateStore>,
}

impl DedupGate {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            recent: Mutex::new(RecentMap::new()),
            store,
        }
    }

    /// Returns true when the trade id has not been seen before; marks it seen
    /// (in memory and persisted) as a side effect.
    pub fn admit(&self, wallet: &str, trade_id: &str) -> Result<bool> {
        let now = Instant::now();

        {
            let mut recent = self.recent.lock();
            recent.purge(now);

            if recent.contains(trade_id) {
                debug!(trade_id, "duplicate dropped (recent map)");
                return Ok(false);
            }

            if self.store.has_seen(wallet, trade_id) {
                recent.insert(trade_id.to_string(), now);
                debug!(trade_id, "duplicate dropped (seen set)");
                return Ok(false);
            }

            recent.insert(trade_id.to_string(), now);
        }

        self.store.mark_seen(wallet, trade_id)?;
        Ok(true)
    }
}

impl std::fmt::Debug for DedupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGate")
            .field("recent", &self.recent.lock().entries.len())
            .finish()
    }
}
