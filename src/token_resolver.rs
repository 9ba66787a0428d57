// =============================================================================
// Token Resolver — (condition id | slug, outcome) → CLOB token id
// =============================================================================
//
// Resolution policy, first hit wins:
//   1. A signal already carrying a long (>20 char) token id is accepted as-is.
//   2. condition id + outcome, against the cache and then the gamma catalog.
//   3. market slug + outcome, same order.
//   4. Unresolved — the caller skips the signal with `unresolved_token`.
//
// Cache: in-memory market records with a 24-hour TTL, backed by a durable
// `token-cache.json` map so a restart does not refetch the whole catalog.
// A stale entry whose refresh fails is still served, with a warning.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::polymarket::{MarketInfo, PolymarketClient};
use crate::state_store::{read_json_or_default, write_json_atomic};
use crate::types::{now_ms, Signal};

/// Cache entries older than this are refreshed on next use.
const CACHE_TTL_MS: i64 = 24 * 3_600 * 1_000;

/// A token id this long is assumed to already be a CLOB token id.
const TOKEN_ID_MIN_LEN: usize = 20;

const CACHE_FILE: &str = "token-cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedMarket {
    #[serde(flatten)]
    market: MarketInfo,
    #[serde(rename = "fetchedAt")]
    fetched_at_ms: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenCacheFile {
    #[serde(default)]
    tokens: HashMap<String, CachedMarket>,
    #[serde(default)]
    last_updated: i64,
}

#[derive(Default)]
struct CacheInner {
    by_condition: HashMap<String, CachedMarket>,
    /// slug → condition id, maintained alongside the primary map.
    slug_index: HashMap<String, String>,
}

/// Maps market identifiers to tradable token ids, with reverse lookup for the
/// control loops.
pub struct TokenResolver {
    client: Arc<PolymarketClient>,
    path: PathBuf,
    inner: RwLock<CacheInner>,
}

impl TokenResolver {
    /// Open the resolver, loading the durable cache from the data directory.
    pub fn open(client: Arc<PolymarketClient>, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(CACHE_FILE);
        let file: TokenCacheFile = read_json_or_default(&path)?;

        let mut inner = CacheInner::default();
        for (condition_id, cached) in file.tokens {
            if !cached.market.slug.is_empty() {
                inner
                    .slug_index
                    .insert(cached.market.slug.to_lowercase(), condition_id.clone());
            }
            inner.by_condition.insert(condition_id, cached);
        }

        debug!(
            path = %path.display(),
            markets = inner.by_condition.len(),
            "token cache loaded"
        );

        Ok(Self {
            client,
            path,
            inner: RwLock::new(inner),
        })
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Resolve the token id a signal should trade. `Ok(None)` means
    /// unresolved and the signal is skipped.
    pub async fn resolve(&self, signal: &Signal) -> Result<Option<String>> {
        // 1. Already a token id.
        if signal.token_id.len() > TOKEN_ID_MIN_LEN {
            return Ok(Some(signal.token_id.clone()));
        }

        let Some(outcome) = signal.outcome else {
            debug!(trade_id = %signal.trade_id, "no outcome on signal — unresolved");
            return Ok(None);
        };
        let outcome_label = outcome.to_string();

        // 2. condition id + outcome.
        if let Some(condition_id) = signal.condition_id.as_deref() {
            if let Some(market) = self.market_for_condition(condition_id).await? {
                if let Some(token) = market.token_for(&outcome_label) {
                    return Ok(Some(token.to_string()));
                }
            }
        }

        // 3. slug + outcome.
        if let Some(slug) = signal.market_slug.as_deref() {
            if let Some(market) = self.market_for_slug(slug).await? {
                if let Some(token) = market.token_for(&outcome_label) {
                    return Ok(Some(token.to_string()));
                }
            }
        }

        Ok(None)
    }

    /// Market record for a condition id, from cache or the catalog.
    pub async fn market_for_condition(&self, condition_id: &str) -> Result<Option<MarketInfo>> {
        if let Some(cached) = self.fresh_cached(condition_id) {
            return Ok(Some(cached));
        }

        match self.client.get_market_by_condition(condition_id).await {
            Ok(Some(market)) => {
                self.insert(market.clone());
                Ok(Some(market))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // Serve a stale entry rather than dropping the signal on a
                // transient catalog failure.
                if let Some(stale) = self.any_cached(condition_id) {
                    warn!(condition_id, error = %e, "catalog refresh failed — serving stale entry");
                    Ok(Some(stale))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Market record for a slug, from cache or the catalog.
    pub async fn market_for_slug(&self, slug: &str) -> Result<Option<MarketInfo>> {
        let slug_key = slug.to_lowercase();
        let condition_id = self.inner.read().slug_index.get(&slug_key).cloned();
        if let Some(condition_id) = condition_id {
            if let Some(cached) = self.fresh_cached(&condition_id) {
                return Ok(Some(cached));
            }
        }

        match self.client.get_market_by_slug(slug).await {
            Ok(Some(market)) => {
                self.insert(market.clone());
                Ok(Some(market))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                let stale = {
                    let inner = self.inner.read();
                    inner
                        .slug_index
                        .get(&slug_key)
                        .and_then(|cond| inner.by_condition.get(cond))
                        .map(|c| c.market.clone())
                };
                if let Some(stale) = stale {
                    warn!(slug, error = %e, "catalog refresh failed — serving stale entry");
                    Ok(Some(stale))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Reverse lookup: which cached market does a token id belong to.
    pub fn market_for_token(&self, token_id: &str) -> Option<MarketInfo> {
        let inner = self.inner.read();
        inner
            .by_condition
            .values()
            .find(|c| c.market.clob_token_ids.iter().any(|t| t == token_id))
            .map(|c| c.market.clone())
    }

    // -------------------------------------------------------------------------
    // Cache internals
    // -------------------------------------------------------------------------

    fn fresh_cached(&self, condition_id: &str) -> Option<MarketInfo> {
        let inner = self.inner.read();
        let cached = inner.by_condition.get(condition_id)?;
        if now_ms() - cached.fetched_at_ms <= CACHE_TTL_MS {
            Some(cached.market.clone())
        } else {
            None
        }
    }

    fn any_cached(&self, condition_id: &str) -> Option<MarketInfo> {
        self.inner
            .read()
            .by_condition
            .get(condition_id)
            .map(|c| c.market.clone())
    }

    /// Insert a market record and persist the durable map (best-effort).
    pub fn insert(&self, market: MarketInfo) {
        {
            let mut inner = self.inner.write();
            if !market.slug.is_empty() {
                inner
                    .slug_index
                    .insert(market.slug.to_lowercase(), market.condition_id.clone());
            }
            inner.by_condition.insert(
                market.condition_id.clone(),
                CachedMarket {
                    market,
                    fetched_at_ms: now_ms(),
                },
            );
        }
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist token cache");
        }
    }

    fn persist(&self) -> Result<()> {
        let inner = self.inner.read();
        let file = TokenCacheFile {
            tokens: inner.by_condition.clone(),
            last_updated: now_ms(),
        };
        write_json_atomic(&self.path, &file)
    }
}

impl std::fmt::Debug for TokenResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResolver")
            .field("path", &self.path)
            .field("markets", &self.inner.read().by_condition.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityType, Outcome, Side};

    fn test_resolver() -> (TokenResolver, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-resolver-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let client = Arc::new(PolymarketClient::new(None, None));
        let resolver = TokenResolver::open(client, &dir).unwrap();
        (resolver, dir)
    }

    fn market() -> MarketInfo {
        serde_json::from_value(serde_json::json!({
            "conditionId": "0xcond",
            "slug": "will-it-rain",
            "question": "Will it rain?",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["11111111111111111111111", "22222222222222222222222"],
            "outcomePrices": ["0.62", "0.38"]
        }))
        .unwrap()
    }

    fn signal() -> Signal {
        Signal {
            target_wallet: "0xabc".to_string(),
            trade_id: "t1".to_string(),
            timestamp_ms: 0,
            token_id: String::new(),
            condition_id: Some("0xcond".to_string()),
            market_slug: Some("will-it-rain".to_string()),
            market_title: None,
            side: Side::Buy,
            price: 0.5,
            size_shares: Some(10.0),
            notional_usd: Some(5.0),
            outcome: Some(Outcome::Yes),
            activity_type: ActivityType::Trade,
        }
    }

    #[tokio::test]
    async fn long_token_id_passes_through() {
        let (resolver, dir) = test_resolver();
        let mut sig = signal();
        sig.token_id = "33333333333333333333333".to_string();
        let resolved = resolver.resolve(&sig).await.unwrap();
        assert_eq!(resolved.as_deref(), Some("33333333333333333333333"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn cached_condition_resolves_outcome_token() {
        let (resolver, dir) = test_resolver();
        resolver.insert(market());
        let resolved = resolver.resolve(&signal()).await.unwrap();
        assert_eq!(resolved.as_deref(), Some("11111111111111111111111"));

        let mut no_sig = signal();
        no_sig.outcome = Some(Outcome::No);
        let resolved = resolver.resolve(&no_sig).await.unwrap();
        assert_eq!(resolved.as_deref(), Some("22222222222222222222222"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_outcome_is_unresolved() {
        let (resolver, dir) = test_resolver();
        resolver.insert(market());
        let mut sig = signal();
        sig.outcome = None;
        assert!(resolver.resolve(&sig).await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reverse_lookup_finds_market() {
        let (resolver, dir) = test_resolver();
        resolver.insert(market());
        let found = resolver.market_for_token("22222222222222222222222").unwrap();
        assert_eq!(found.condition_id, "0xcond");
        assert!(resolver.market_for_token("unknown").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn durable_cache_survives_reopen() {
        let (resolver, dir) = test_resolver();
        resolver.insert(market());
        drop(resolver);

        let client = Arc::new(PolymarketClient::new(None, None));
        let resolver = TokenResolver::open(client, &dir).unwrap();
        assert!(resolver.market_for_token("11111111111111111111111").is_some());
        let _ = std::fs::remove_dir_all(dir);
    }
}
