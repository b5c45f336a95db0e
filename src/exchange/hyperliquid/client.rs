//! Production venue adapter: REST gateway over the info and exchange
//! endpoints.
//!
//! The read surface (`/info`) is unauthenticated JSON POSTs; the write
//! surface (`/exchange`) carries an HMAC-SHA256 signature over the action
//! payload and nonce. Venue metadata (size decimals, asset ids, spot
//! symbols) is fetched once at startup by [`HyperliquidGateway::load_meta`]
//! and cached; the engine refuses to start without it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::types::*;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::{
    Balances, OrderLeg, OrderOutcome, OrderReport, OrderStatusKind, OrderStatusReport, PriceQuote,
    PositionSide, VenuePosition,
};

/// Spot asset ids live in a separate namespace above the perp ids.
const SPOT_ASSET_OFFSET: u32 = 10_000;
/// USDC's token index in spot meta.
const USDC_TOKEN_INDEX: u32 = 0;

/// Venue metadata resolved at startup.
#[derive(Debug, Default, Clone)]
struct MetaCache {
    /// Coin -> size decimals (perp universe).
    sz_decimals: HashMap<String, u32>,
    /// Coin -> perp asset id (index in universe).
    perp_assets: HashMap<String, u32>,
    /// Coin -> venue-internal spot symbol (e.g. "@107").
    spot_symbols: HashMap<String, String>,
    /// Coin -> spot asset id for order placement.
    spot_assets: HashMap<String, u32>,
}

/// REST gateway to the venue.
pub struct HyperliquidGateway {
    http: Client,
    base_url: String,
    wallet_address: String,
    api_secret: String,
    meta: RwLock<Option<MetaCache>>,
}

impl HyperliquidGateway {
    /// `api_secret` may be empty for read-only / dry-run operation; any
    /// write call will then fail loudly instead of sending unsigned junk.
    pub fn new(base_url: &str, wallet_address: &str, api_secret: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            wallet_address: wallet_address.to_string(),
            api_secret: api_secret.to_string(),
            meta: RwLock::new(None),
        })
    }

    /// Fetch and cache venue meta. Must run before any trading call.
    #[instrument(skip(self))]
    pub async fn load_meta(&self) -> Result<()> {
        let (meta, _): MetaAndAssetCtxsResponse =
            self.info(&InfoRequest::MetaAndAssetCtxs).await?;
        let spot_meta: SpotMeta = self.info(&InfoRequest::SpotMeta).await?;

        let cache = build_meta_cache(&meta, &spot_meta);
        info!(
            perp_assets = cache.perp_assets.len(),
            spot_pairs = cache.spot_symbols.len(),
            "Venue meta loaded"
        );
        *self.meta.write().await = Some(cache);
        Ok(())
    }

    async fn info<T: DeserializeOwned>(&self, request: &InfoRequest) -> Result<T> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Failed to send info request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Venue info error {status}: {body}");
        }

        response.json().await.context("Failed to parse info response")
    }

    async fn exchange(&self, action: serde_json::Value) -> Result<ExchangeResponse> {
        if self.api_secret.is_empty() {
            bail!("API secret not configured; cannot sign exchange request");
        }

        let nonce = Self::timestamp_ms();
        let signature = self.sign(&action.to_string(), nonce);
        let request = ExchangeRequest {
            action,
            nonce,
            signature,
        };

        let url = format!("{}/exchange", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send exchange request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Venue exchange error {status}: {body}");
        }

        response
            .json()
            .await
            .context("Failed to parse exchange response")
    }

    /// HMAC-SHA256 over the serialized action and nonce.
    fn sign(&self, payload: &str, nonce: u64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        mac.update(nonce.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    async fn asset_id(&self, coin: &str, leg: OrderLeg) -> Result<u32> {
        let meta = self.meta.read().await;
        let cache = meta
            .as_ref()
            .context("Venue meta not loaded; call load_meta first")?;
        match leg {
            OrderLeg::Perp => cache
                .perp_assets
                .get(coin)
                .copied()
                .with_context(|| format!("{coin} is not a listed perpetual")),
            OrderLeg::Spot => cache
                .spot_assets
                .get(coin)
                .copied()
                .with_context(|| format!("{coin} has no spot listing")),
        }
    }

    async fn asset_ctx(&self, coin: &str) -> Result<AssetCtx> {
        let (meta, ctxs): MetaAndAssetCtxsResponse =
            self.info(&InfoRequest::MetaAndAssetCtxs).await?;
        meta.universe
            .iter()
            .zip(ctxs)
            .find(|(m, _)| m.name == coin)
            .map(|(_, c)| c)
            .with_context(|| format!("{coin} not in perp universe"))
    }

    async fn best_bid_ask(&self, symbol: &str) -> Result<(Decimal, Decimal)> {
        let book: L2BookResponse = self
            .info(&InfoRequest::L2Book {
                coin: symbol.to_string(),
            })
            .await?;
        let bid = book.levels[0].first().map(|l| l.px).unwrap_or(Decimal::ZERO);
        let ask = book.levels[1].first().map(|l| l.px).unwrap_or(Decimal::ZERO);
        Ok((bid, ask))
    }
}

#[async_trait]
impl ExchangeGateway for HyperliquidGateway {
    async fn place_order(
        &self,
        coin: &str,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
        cloid: &str,
    ) -> Result<OrderReport> {
        let asset = self.asset_id(coin, leg).await?;

        let action = json!({
            "type": "order",
            "orders": [{
                "a": asset,
                "b": is_buy,
                "p": price.normalize().to_string(),
                "s": size.normalize().to_string(),
                "r": false,
                "t": { "limit": { "tif": "Ioc" } },
                "c": format!("0x{cloid}"),
            }],
            "grouping": "na",
        });

        debug!(%coin, %leg, is_buy, %size, %price, %cloid, "Placing order");
        let response = self.exchange(action).await?;
        Ok(parse_order_response(&response))
    }

    async fn cancel_order(&self, coin: &str, cloid: &str) -> Result<bool> {
        // The contract does not say which leg the cloid belongs to; try
        // the perp asset first and fall back to the spot listing.
        let asset = match self.asset_id(coin, OrderLeg::Perp).await {
            Ok(asset) => asset,
            Err(_) => self.asset_id(coin, OrderLeg::Spot).await?,
        };

        let action = json!({
            "type": "cancelByCloid",
            "cancels": [{ "asset": asset, "cloid": format!("0x{cloid}") }],
        });

        let response = self.exchange(action).await?;
        Ok(response.status == "ok")
    }

    async fn query_order_status(&self, _coin: &str, cloid: &str) -> Result<OrderStatusReport> {
        let response: OrderStatusResponse = self
            .info(&InfoRequest::OrderStatus {
                user: self.wallet_address.clone(),
                oid: format!("0x{cloid}"),
            })
            .await?;
        Ok(map_order_status(&response))
    }

    async fn get_prices(&self, coin: &str) -> Result<PriceQuote> {
        let spot_symbol = self.resolve_spot_symbol(coin).await?;
        let ((spot_bid, spot_ask), (perp_bid, perp_ask)) =
            tokio::try_join!(self.best_bid_ask(&spot_symbol), self.best_bid_ask(coin))?;

        Ok(PriceQuote {
            spot_bid,
            spot_ask,
            perp_bid,
            perp_ask,
        })
    }

    async fn get_balances(&self) -> Result<Balances> {
        let spot_request = InfoRequest::SpotClearinghouseState {
            user: self.wallet_address.clone(),
        };
        let perp_request = InfoRequest::ClearinghouseState {
            user: self.wallet_address.clone(),
        };
        let (spot, perp): (SpotClearinghouseState, ClearinghouseState) =
            tokio::try_join!(self.info(&spot_request), self.info(&perp_request))?;

        let spot_usdc = spot
            .balances
            .iter()
            .filter(|b| b.coin == "USDC")
            .map(|b| b.total)
            .sum();

        Ok(Balances {
            spot_usdc,
            perp_margin: perp.withdrawable,
        })
    }

    async fn get_positions(&self) -> Result<HashMap<String, VenuePosition>> {
        let state: ClearinghouseState = self
            .info(&InfoRequest::ClearinghouseState {
                user: self.wallet_address.clone(),
            })
            .await?;

        let mut positions = HashMap::new();
        for entry in state.asset_positions {
            let pos = entry.position;
            if pos.szi == Decimal::ZERO {
                continue;
            }
            positions.insert(
                pos.coin.clone(),
                VenuePosition {
                    size: pos.szi.abs(),
                    side: if pos.szi < Decimal::ZERO {
                        PositionSide::Short
                    } else {
                        PositionSide::Long
                    },
                    entry_price: pos.entry_px.unwrap_or_default(),
                    liquidation_price: pos.liquidation_px.unwrap_or_default(),
                    unrealized_pnl: pos.unrealized_pnl.unwrap_or_default(),
                },
            );
        }
        Ok(positions)
    }

    async fn get_funding_rate(&self, coin: &str) -> Result<Decimal> {
        Ok(self.asset_ctx(coin).await?.funding)
    }

    async fn get_volume_24h(&self, coin: &str) -> Result<Decimal> {
        Ok(self.asset_ctx(coin).await?.day_ntl_vlm)
    }

    async fn resolve_spot_symbol(&self, coin: &str) -> Result<String> {
        let meta = self.meta.read().await;
        let cache = meta
            .as_ref()
            .context("Venue meta not loaded; call load_meta first")?;
        cache
            .spot_symbols
            .get(coin)
            .cloned()
            .with_context(|| format!("{coin} is not listed for spot trading"))
    }

    async fn size_decimals(&self, coin: &str) -> Result<u32> {
        let meta = self.meta.read().await;
        let cache = meta
            .as_ref()
            .context("Venue meta not loaded; call load_meta first")?;
        cache
            .sz_decimals
            .get(coin)
            .copied()
            .with_context(|| format!("{coin} is not a listed perpetual"))
    }
}

/// Index perp and spot meta into the lookup tables the gateway needs.
fn build_meta_cache(meta: &Meta, spot_meta: &SpotMeta) -> MetaCache {
    let mut cache = MetaCache::default();

    for (index, asset) in meta.universe.iter().enumerate() {
        cache
            .sz_decimals
            .insert(asset.name.clone(), asset.sz_decimals);
        cache.perp_assets.insert(asset.name.clone(), index as u32);
    }

    let token_names: HashMap<u32, &str> = spot_meta
        .tokens
        .iter()
        .map(|t| (t.index, t.name.as_str()))
        .collect();

    // Only USDC-quoted pairs can hedge the perp leg.
    for pair in &spot_meta.universe {
        if pair.tokens[1] != USDC_TOKEN_INDEX {
            continue;
        }
        if let Some(base) = token_names.get(&pair.tokens[0]) {
            cache
                .spot_symbols
                .insert(base.to_string(), pair.name.clone());
            cache
                .spot_assets
                .insert(base.to_string(), SPOT_ASSET_OFFSET + pair.index);
        }
    }

    cache
}

/// Collapse an exchange response into the gateway's order report.
fn parse_order_response(response: &ExchangeResponse) -> OrderReport {
    if response.status != "ok" {
        return OrderReport::failed(format!("venue status: {}", response.status));
    }

    let statuses = response
        .response
        .as_ref()
        .and_then(|r| r.data.as_ref())
        .map(|d| d.statuses.as_slice())
        .unwrap_or_default();

    match statuses.first() {
        Some(OrderStatusResult::Filled(filled)) => {
            OrderReport::filled(filled.total_sz, filled.avg_px)
        }
        Some(OrderStatusResult::Resting(_)) => OrderReport {
            status: OrderOutcome::Open,
            filled_size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            error: None,
        },
        Some(OrderStatusResult::Error(error)) => OrderReport::failed(error.clone()),
        None => OrderReport::failed("Unknown response format"),
    }
}

/// Map the order-status endpoint onto the gateway's status kinds. The
/// fill is `origSz - sz`, so a partially filled then cancelled IOC still
/// reports its real fill.
fn map_order_status(response: &OrderStatusResponse) -> OrderStatusReport {
    let Some(entry) = response.order.as_ref().filter(|_| response.status == "order") else {
        return OrderStatusReport {
            status: OrderStatusKind::Unknown,
            filled_size: Decimal::ZERO,
        };
    };

    let filled = entry.order.orig_sz - entry.order.sz;
    let status = match entry.status.as_str() {
        _ if filled > Decimal::ZERO => OrderStatusKind::Filled,
        "open" => OrderStatusKind::Open,
        "canceled" | "marginCanceled" | "rejected" => OrderStatusKind::Canceled,
        "filled" => OrderStatusKind::Filled,
        _ => OrderStatusKind::Unknown,
    };

    OrderStatusReport {
        status,
        filled_size: filled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_meta() -> (Meta, SpotMeta) {
        let meta: Meta = serde_json::from_str(
            r#"{
                "universe": [
                    {"name": "BTC", "szDecimals": 5, "maxLeverage": 50},
                    {"name": "HYPE", "szDecimals": 2, "maxLeverage": 10}
                ]
            }"#,
        )
        .unwrap();
        let spot_meta: SpotMeta = serde_json::from_str(
            r#"{
                "universe": [
                    {"name": "PURR/USDC", "tokens": [1, 0], "index": 0},
                    {"name": "@107", "tokens": [2, 0], "index": 107},
                    {"name": "@200", "tokens": [2, 3], "index": 200}
                ],
                "tokens": [
                    {"name": "USDC", "index": 0, "szDecimals": 8},
                    {"name": "PURR", "index": 1, "szDecimals": 0},
                    {"name": "HYPE", "index": 2, "szDecimals": 2},
                    {"name": "USDT", "index": 3, "szDecimals": 8}
                ]
            }"#,
        )
        .unwrap();
        (meta, spot_meta)
    }

    #[test]
    fn test_build_meta_cache() {
        let (meta, spot_meta) = sample_meta();
        let cache = build_meta_cache(&meta, &spot_meta);

        assert_eq!(cache.sz_decimals["HYPE"], 2);
        assert_eq!(cache.perp_assets["BTC"], 0);
        assert_eq!(cache.perp_assets["HYPE"], 1);
        assert_eq!(cache.spot_symbols["HYPE"], "@107");
        assert_eq!(cache.spot_assets["HYPE"], 10_107);
        // The HYPE/USDT pair is not USDC-quoted and must not shadow @107.
        assert_eq!(cache.spot_symbols.get("USDC"), None);
        assert_eq!(cache.spot_symbols["PURR"], "PURR/USDC");
    }

    #[test]
    fn test_parse_order_response_filled() {
        let response: ExchangeResponse = serde_json::from_str(
            r#"{
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"filled": {"totalSz": "9.95", "avgPx": "10.04", "oid": 1}}
                ]}}
            }"#,
        )
        .unwrap();
        let report = parse_order_response(&response);
        assert_eq!(report.status, OrderOutcome::Filled);
        assert_eq!(report.filled_size, dec!(9.95));
        assert_eq!(report.avg_price, dec!(10.04));
    }

    #[test]
    fn test_parse_order_response_error_and_resting() {
        let response: ExchangeResponse = serde_json::from_str(
            r#"{
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"error": "Insufficient margin"}
                ]}}
            }"#,
        )
        .unwrap();
        let report = parse_order_response(&response);
        assert_eq!(report.status, OrderOutcome::Failed);
        assert_eq!(report.error.as_deref(), Some("Insufficient margin"));

        let response: ExchangeResponse = serde_json::from_str(
            r#"{
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"resting": {"oid": 5}}
                ]}}
            }"#,
        )
        .unwrap();
        assert_eq!(parse_order_response(&response).status, OrderOutcome::Open);
    }

    #[test]
    fn test_parse_order_response_rejected_status() {
        let response: ExchangeResponse =
            serde_json::from_str(r#"{"status": "err"}"#).unwrap();
        let report = parse_order_response(&response);
        assert_eq!(report.status, OrderOutcome::Failed);
    }

    #[test]
    fn test_map_order_status_partial_ioc_counts_as_filled() {
        let response: OrderStatusResponse = serde_json::from_str(
            r#"{
                "status": "order",
                "order": {
                    "status": "canceled",
                    "order": {"origSz": "10.0", "sz": "4.0"}
                }
            }"#,
        )
        .unwrap();
        let report = map_order_status(&response);
        assert_eq!(report.status, OrderStatusKind::Filled);
        assert_eq!(report.filled_size, dec!(6.0));
    }

    #[test]
    fn test_map_order_status_kinds() {
        let open: OrderStatusResponse = serde_json::from_str(
            r#"{"status": "order", "order": {"status": "open", "order": {"origSz": "10.0", "sz": "10.0"}}}"#,
        )
        .unwrap();
        assert_eq!(map_order_status(&open).status, OrderStatusKind::Open);

        let canceled: OrderStatusResponse = serde_json::from_str(
            r#"{"status": "order", "order": {"status": "canceled", "order": {"origSz": "10.0", "sz": "10.0"}}}"#,
        )
        .unwrap();
        assert_eq!(map_order_status(&canceled).status, OrderStatusKind::Canceled);

        let unknown: OrderStatusResponse =
            serde_json::from_str(r#"{"status": "unknownOid"}"#).unwrap();
        assert_eq!(map_order_status(&unknown).status, OrderStatusKind::Unknown);
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_live_meta_load() {
        let gateway =
            HyperliquidGateway::new("https://api.hyperliquid.xyz", "0x0", "").unwrap();
        gateway.load_meta().await.unwrap();
        assert!(gateway.size_decimals("BTC").await.unwrap() <= 6);
    }
}
