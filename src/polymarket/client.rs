// =============================================================================
// Polymarket API Client — data API, gamma catalog, and signed CLOB requests
// =============================================================================
//
// Three upstream hosts behind one client:
//   data-api  — recent wallet activity and positions (public)
//   gamma-api — market catalog lookups by condition id or slug (public)
//   clob      — balance, market params, and order submission (L2-signed)
//
// SECURITY: the CLOB secret is never logged or serialized. Signed requests
// carry the POLY_* header set; the signature is HMAC-SHA256 over
// `timestamp + method + path + body` with the base64-decoded secret,
// URL-safe base64 encoded.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::OrderRequest;

type HmacSha256 = Hmac<Sha256>;

/// Per-request deadline for every upstream call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

pub const DATA_API_HOST: &str = "https://data-api.polymarket.com";
pub const GAMMA_API_HOST: &str = "https://gamma-api.polymarket.com";
pub const CLOB_HOST: &str = "https://clob.polymarket.com";

// =============================================================================
// Credentials
// =============================================================================

/// CLOB L2 API credentials.
#[derive(Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl ClobCredentials {
    /// Read credentials from the environment; `None` when any part is absent.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("POLYMARKET_CLOB_API_KEY").ok()?;
        let secret = std::env::var("POLYMARKET_CLOB_SECRET").ok()?;
        let passphrase = std::env::var("POLYMARKET_CLOB_PASSPHRASE").ok()?;

        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }

        Some(Self {
            api_key,
            secret,
            passphrase,
        })
    }
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

/// One record from `GET /activity?user=…`. The same shape arrives over the
/// live-activity stream, so the normalizer handles both sources uniformly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawActivity {
    /// Wallet the activity belongs to. The stream calls it `proxyWallet`.
    #[serde(rename = "proxyWallet", alias = "user", default)]
    pub proxy_wallet: String,

    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<String>,

    /// Seconds or milliseconds; the normalizer canonicalizes.
    #[serde(default)]
    pub timestamp: i64,

    /// CLOB token id of the traded outcome.
    #[serde(default)]
    pub asset: String,

    #[serde(rename = "conditionId", default)]
    pub condition_id: Option<String>,

    #[serde(default)]
    pub slug: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub side: Option<String>,

    #[serde(default, deserialize_with = "de_f64_loose")]
    pub price: f64,

    #[serde(default, deserialize_with = "de_f64_loose")]
    pub size: f64,

    #[serde(default)]
    pub outcome: Option<String>,

    /// TRADE, SPLIT, MERGE, REDEEM, REWARD, CONVERSION, MAKER_REBATE, …
    #[serde(rename = "type", default)]
    pub activity_type: String,
}

/// One market from the gamma catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    #[serde(rename = "conditionId", default)]
    pub condition_id: String,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub question: Option<String>,

    #[serde(rename = "endDate", alias = "endDateIso", default)]
    pub end_date: Option<String>,

    #[serde(default)]
    pub active: Option<bool>,

    #[serde(default)]
    pub closed: Option<bool>,

    /// Outcome labels, index-aligned with `clob_token_ids` and
    /// `outcome_prices`. Gamma sometimes returns these arrays JSON-encoded as
    /// a single string.
    #[serde(default, deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,

    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,

    #[serde(rename = "outcomePrices", default, deserialize_with = "de_string_vec")]
    pub outcome_prices: Vec<String>,
}

impl MarketInfo {
    /// Token id for an outcome label (case-insensitive).
    pub fn token_for(&self, outcome: &str) -> Option<&str> {
        let idx = self
            .outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case(outcome))?;
        self.clob_token_ids.get(idx).map(String::as_str)
    }

    /// Current catalog price for a token id, when present.
    pub fn price_for_token(&self, token_id: &str) -> Option<f64> {
        let idx = self.clob_token_ids.iter().position(|t| t == token_id)?;
        self.outcome_prices.get(idx)?.parse().ok()
    }

    /// Outcome label a token id belongs to.
    pub fn outcome_for_token(&self, token_id: &str) -> Option<&str> {
        let idx = self.clob_token_ids.iter().position(|t| t == token_id)?;
        self.outcomes.get(idx).map(String::as_str)
    }

    /// Resolution timestamp in ms, parsed from `endDate`.
    pub fn end_date_ms(&self) -> Option<i64> {
        let raw = self.end_date.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.timestamp_millis())
            .ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.unwrap_or(false)
    }
}

/// Per-market order parameters fetched before submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    pub tick_size: f64,
    pub neg_risk: bool,
    pub fee_rate_bps: f64,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            tick_size: 0.01,
            neg_risk: false,
            fee_rate_bps: 0.0,
        }
    }
}

/// Order payload posted to the CLOB.
#[derive(Debug, Serialize)]
struct ClobOrderPayload {
    #[serde(rename = "tokenID")]
    token_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "timeInForce")]
    time_in_force: String,
    #[serde(rename = "negRisk")]
    neg_risk: bool,
    #[serde(rename = "feeRateBps")]
    fee_rate_bps: String,
}

/// Response from the CLOB order endpoint. Field names vary across response
/// shapes; aliases cover the observed variants.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClobOrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id", default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "errorMsg", alias = "error", default)]
    pub error_msg: Option<String>,
    #[serde(rename = "filledSize", alias = "filled_size", default)]
    pub filled_size: Option<String>,
    #[serde(rename = "avgPrice", alias = "avg_price", default)]
    pub avg_price: Option<String>,
}

// =============================================================================
// Deserialization helpers
// =============================================================================

/// Parse a JSON value that may be a string or a number into `f64`.
fn de_f64_loose<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Parse an array that gamma may return either as a JSON array or as a
/// JSON-encoded string (e.g. `"[\"Yes\",\"No\"]"`).
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        Value::Null => Ok(Vec::new()),
        _ => Ok(Vec::new()),
    }
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for all upstream Polymarket surfaces.
#[derive(Clone)]
pub struct PolymarketClient {
    http: reqwest::Client,
    data_host: String,
    gamma_host: String,
    clob_host: String,
    creds: Option<ClobCredentials>,
    wallet_address: Option<String>,
}

impl PolymarketClient {
    pub fn new(creds: Option<ClobCredentials>, wallet_address: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!(
            has_creds = creds.is_some(),
            has_wallet = wallet_address.is_some(),
            "PolymarketClient initialised"
        );

        Self {
            http,
            data_host: DATA_API_HOST.to_string(),
            gamma_host: GAMMA_API_HOST.to_string(),
            clob_host: CLOB_HOST.to_string(),
            creds,
            wallet_address,
        }
    }

    /// True when L2 credentials and a wallet address are both configured.
    pub fn has_credentials(&self) -> bool {
        self.creds.is_some() && self.wallet_address.is_some()
    }

    // -------------------------------------------------------------------------
    // Data API
    // -------------------------------------------------------------------------

    /// GET /activity?user=<addr>&limit=<n> — recent activity for one wallet.
    #[instrument(skip(self), name = "polymarket::get_activity")]
    pub async fn get_activity(&self, wallet: &str, limit: u32) -> Result<Vec<RawActivity>> {
        let url = format!("{}/activity", self.data_host);
        let limit_param = limit.to_string();

        let resp = self
            .http
            .get(&url)
            .query(&[("user", wallet), ("limit", limit_param.as_str())])
            .send()
            .await
            .context("GET /activity request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("GET /activity returned {status}: {body}");
        }

        let records: Vec<RawActivity> = resp
            .json()
            .await
            .context("failed to parse activity response")?;

        debug!(wallet, count = records.len(), "activity fetched");
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Gamma catalog
    // -------------------------------------------------------------------------

    /// GET /markets?condition_ids=<id> — market lookup by condition id.
    #[instrument(skip(self), name = "polymarket::market_by_condition")]
    pub async fn get_market_by_condition(&self, condition_id: &str) -> Result<Option<MarketInfo>> {
        self.gamma_lookup(&[("condition_ids", condition_id), ("limit", "1")])
            .await
    }

    /// GET /markets?slug=<slug> — market lookup by slug.
    #[instrument(skip(self), name = "polymarket::market_by_slug")]
    pub async fn get_market_by_slug(&self, slug: &str) -> Result<Option<MarketInfo>> {
        self.gamma_lookup(&[("slug", slug), ("limit", "1")]).await
    }

    async fn gamma_lookup(&self, query: &[(&str, &str)]) -> Result<Option<MarketInfo>> {
        let url = format!("{}/markets", self.gamma_host);

        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .context("gamma markets request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("gamma /markets returned {status}: {body}");
        }

        let body = resp.text().await.context("gamma markets body read failed")?;
        let markets: Vec<MarketInfo> = serde_json::from_str(&body).map_err(|e| {
            warn!(
                error = %e,
                body_preview = %body.chars().take(300).collect::<String>(),
                "gamma JSON parse failed"
            );
            anyhow::anyhow!("gamma markets json parse: {e}")
        })?;

        Ok(markets.into_iter().next())
    }

    // -------------------------------------------------------------------------
    // CLOB (signed)
    // -------------------------------------------------------------------------

    /// GET /balance-allowance — collateral balance in USD.
    #[instrument(skip(self), name = "polymarket::get_balance")]
    pub async fn get_balance(&self) -> Result<f64> {
        let path = "/balance-allowance?signature_type=2";
        let headers = self.auth_headers("GET", path, "")?;
        let url = format!("{}{}", self.clob_host, path);

        let mut request = self.http.get(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let resp = request.send().await.context("balance request failed")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("balance request returned {status}: {body}");
        }

        // {"balance": "123450000", "allowance": …} — balance is USDC wei
        // (6 decimals) when it arrives as a string.
        let parsed: Value = serde_json::from_str(&body).context("balance json parse")?;
        let balance = match parsed.get("balance") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse::<f64>().map(|v| v / 1_000_000.0).unwrap_or(0.0),
            _ => {
                warn!(body = %body, "could not parse balance response");
                0.0
            }
        };

        debug!(balance, "balance fetched");
        Ok(balance)
    }

    /// Fetch tick size and neg-risk flag for a token.
    #[instrument(skip(self), name = "polymarket::market_params")]
    pub async fn get_market_params(&self, token_id: &str) -> Result<MarketParams> {
        let tick: Value = self
            .http
            .get(format!("{}/tick-size", self.clob_host))
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("tick-size request failed")?
            .json()
            .await
            .context("tick-size json parse")?;

        let neg: Value = self
            .http
            .get(format!("{}/neg-risk", self.clob_host))
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("neg-risk request failed")?
            .json()
            .await
            .context("neg-risk json parse")?;

        let tick_size = tick
            .get("minimum_tick_size")
            .and_then(Value::as_f64)
            .unwrap_or(0.01);
        let neg_risk = neg.get("neg_risk").and_then(Value::as_bool).unwrap_or(false);

        Ok(MarketParams {
            tick_size,
            neg_risk,
            fee_rate_bps: 0.0,
        })
    }

    /// POST /order — submit a marketable limit order.
    #[instrument(skip(self, request, params), name = "polymarket::place_order")]
    pub async fn place_order(
        &self,
        request: &OrderRequest,
        params: &MarketParams,
    ) -> Result<ClobOrderResponse> {
        let payload = ClobOrderPayload {
            token_id: request.token_id.clone(),
            price: format!("{:.2}", request.price),
            size: format!("{:.2}", request.size_shares),
            side: request.side.to_string(),
            order_type: "LIMIT".to_string(),
            time_in_force: request.time_in_force.clone(),
            neg_risk: params.neg_risk,
            fee_rate_bps: format!("{}", params.fee_rate_bps),
        };

        let body = serde_json::to_string(&payload).context("failed to serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        debug!(
            token_id = %request.token_id,
            side = %request.side,
            price = request.price,
            size = request.size_shares,
            "submitting CLOB order"
        );

        let url = format!("{}{}", self.clob_host, path);
        let mut req = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in headers {
            req = req.header(&key, &value);
        }

        let resp = req.send().await.context("POST /order request failed")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("POST /order returned {status}: {text}");
        }

        let parsed: ClobOrderResponse =
            serde_json::from_str(&text).context("failed to parse order response")?;
        Ok(parsed)
    }

    /// POST /redeem — request redemption of winning outcome tokens.
    #[instrument(skip(self), name = "polymarket::redeem")]
    pub async fn redeem(&self, condition_id: &str) -> Result<()> {
        let body = serde_json::json!({ "conditionId": condition_id }).to_string();
        let path = "/redeem";
        let headers = self.auth_headers("POST", path, &body)?;

        let url = format!("{}{}", self.clob_host, path);
        let mut req = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in headers {
            req = req.header(&key, &value);
        }

        let resp = req.send().await.context("POST /redeem request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("POST /redeem returned {status}: {text}");
        }

        debug!(condition_id, "redemption requested");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // L2 signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 over `timestamp + method + path + body`, URL-safe base64.
    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let creds = self
            .creds
            .as_ref()
            .context("CLOB credentials not configured")?;

        let message = format!("{timestamp}{method}{path}{body}");

        // Secrets arrive base64-encoded in one of several alphabets.
        let secret_bytes = URL_SAFE
            .decode(&creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&creds.secret))
            .or_else(|_| BASE64.decode(&creds.secret))
            .context("failed to decode CLOB secret")?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .context("HMAC accepts any key size")?;
        mac.update(message.as_bytes());

        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// Build the POLY_* header set for a signed request.
    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let creds = self
            .creds
            .as_ref()
            .context("CLOB credentials not configured")?;
        let wallet = self
            .wallet_address
            .clone()
            .context("wallet address not configured")?;

        // Timestamp in seconds, not milliseconds.
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;

        Ok(vec![
            ("POLY_ADDRESS".to_string(), wallet),
            ("POLY_API_KEY".to_string(), creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), creds.passphrase.clone()),
        ])
    }
}

impl std::fmt::Debug for PolymarketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketClient")
            .field("data_host", &self.data_host)
            .field("gamma_host", &self.gamma_host)
            .field("clob_host", &self.clob_host)
            .field("has_creds", &self.creds.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn client_with_creds() -> PolymarketClient {
        PolymarketClient::new(
            Some(ClobCredentials {
                api_key: "key".to_string(),
                secret: URL_SAFE.encode(b"super-secret-bytes"),
                passphrase: "phrase".to_string(),
            }),
            Some("0xabcdef0123456789abcdef0123456789abcdef01".to_string()),
        )
    }

    #[test]
    fn raw_activity_parses_string_numbers() {
        let json = r#"{
            "proxyWallet": "0xABC",
            "transactionHash": "0xdead",
            "timestamp": 1700000000,
            "asset": "12345678901234567890123",
            "conditionId": "0xcond",
            "slug": "will-it-rain",
            "side": "BUY",
            "price": "0.42",
            "size": "100.5",
            "outcome": "Yes",
            "type": "TRADE"
        }"#;
        let act: RawActivity = serde_json::from_str(json).unwrap();
        assert_eq!(act.proxy_wallet, "0xABC");
        assert!((act.price - 0.42).abs() < 1e-9);
        assert!((act.size - 100.5).abs() < 1e-9);
        assert_eq!(act.activity_type, "TRADE");
    }

    #[test]
    fn raw_activity_accepts_user_alias_and_numeric_price() {
        let json = r#"{"user":"0xdef","timestamp":1700000000000,"asset":"t","price":0.7,"size":10,"type":"SPLIT"}"#;
        let act: RawActivity = serde_json::from_str(json).unwrap();
        assert_eq!(act.proxy_wallet, "0xdef");
        assert!((act.price - 0.7).abs() < 1e-9);
        assert!(act.side.is_none());
    }

    #[test]
    fn market_info_parses_string_encoded_arrays() {
        let json = r#"{
            "conditionId": "0xcond",
            "slug": "will-it-rain",
            "question": "Will it rain?",
            "endDate": "2026-12-31T00:00:00Z",
            "active": true,
            "closed": false,
            "outcomes": "[\"Yes\",\"No\"]",
            "clobTokenIds": "[\"111\",\"222\"]",
            "outcomePrices": "[\"0.62\",\"0.38\"]"
        }"#;
        let market: MarketInfo = serde_json::from_str(json).unwrap();
        assert_eq!(market.outcomes, vec!["Yes", "No"]);
        assert_eq!(market.token_for("yes"), Some("111"));
        assert_eq!(market.token_for("NO"), Some("222"));
        assert_eq!(market.price_for_token("111"), Some(0.62));
        assert_eq!(market.outcome_for_token("222"), Some("No"));
        assert!(market.end_date_ms().is_some());
        assert!(!market.is_closed());
    }

    #[test]
    fn market_info_tolerates_plain_arrays() {
        let json = r#"{
            "conditionId": "0xcond",
            "slug": "s",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["a", "b"],
            "outcomePrices": ["1.0", "0.0"]
        }"#;
        let market: MarketInfo = serde_json::from_str(json).unwrap();
        assert_eq!(market.price_for_token("a"), Some(1.0));
    }

    #[test]
    fn signature_is_deterministic_and_body_sensitive() {
        let client = client_with_creds();
        let a = client.sign_request("POST", "/order", "{\"x\":1}", 1_700_000_000).unwrap();
        let b = client.sign_request("POST", "/order", "{\"x\":1}", 1_700_000_000).unwrap();
        let c = client.sign_request("POST", "/order", "{\"x\":2}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_empty());
    }

    #[test]
    fn auth_headers_carry_poly_set() {
        let client = client_with_creds();
        let headers = client.auth_headers("GET", "/balance-allowance", "").unwrap();
        let names: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"POLY_ADDRESS"));
        assert!(names.contains(&"POLY_API_KEY"));
        assert!(names.contains(&"POLY_SIGNATURE"));
        assert!(names.contains(&"POLY_TIMESTAMP"));
        assert!(names.contains(&"POLY_PASSPHRASE"));
    }

    #[test]
    fn order_payload_uses_two_decimal_strings() {
        let request = OrderRequest {
            token_id: "tok".to_string(),
            side: Side::Buy,
            price: 0.505,
            size_shares: 2.0,
            usd: 1.01,
            time_in_force: "GTC".to_string(),
        };
        let payload = ClobOrderPayload {
            token_id: request.token_id.clone(),
            price: format!("{:.2}", request.price),
            size: format!("{:.2}", request.size_shares),
            side: request.side.to_string(),
            order_type: "LIMIT".to_string(),
            time_in_force: request.time_in_force.clone(),
            neg_risk: false,
            fee_rate_bps: "0".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"tokenID\":\"tok\""));
        assert!(json.contains("\"price\":\"0.51\""));
        assert!(json.contains("\"size\":\"2.00\""));
        assert!(json.contains("\"side\":\"BUY\""));
    }

    #[test]
    fn missing_creds_fail_signing() {
        let client = PolymarketClient::new(None, None);
        assert!(!client.has_credentials());
        assert!(client.sign_request("GET", "/x", "", 0).is_err());
    }
}
