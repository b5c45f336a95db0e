//! Type definitions for the venue's info and exchange endpoints.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Request body for the `/info` endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum InfoRequest {
    /// Perp metadata plus live asset contexts (funding, volume, prices).
    #[serde(rename = "metaAndAssetCtxs")]
    MetaAndAssetCtxs,

    /// Spot pair and token metadata.
    #[serde(rename = "spotMeta")]
    SpotMeta,

    /// Order book snapshot for one symbol.
    #[serde(rename = "l2Book")]
    L2Book { coin: String },

    /// Perp account state: positions and margin.
    #[serde(rename = "clearinghouseState")]
    ClearinghouseState { user: String },

    /// Spot account state: token balances.
    #[serde(rename = "spotClearinghouseState")]
    SpotClearinghouseState { user: String },

    /// Status of a single order by oid or client order id.
    #[serde(rename = "orderStatus")]
    OrderStatus { user: String, oid: String },
}

/// Response from `metaAndAssetCtxs`: `(Meta, Vec<AssetCtx>)`.
pub type MetaAndAssetCtxsResponse = (Meta, Vec<AssetCtx>);

/// Perp universe metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub universe: Vec<AssetMeta>,
}

/// Metadata for one perp asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub name: String,
    pub sz_decimals: u32,
    pub max_leverage: u8,
}

/// Live context for one perp asset. Indexes align with `Meta::universe`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCtx {
    /// Hourly funding rate.
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub funding: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub open_interest: Decimal,
    /// Daily notional volume, the liquidity proxy.
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub day_ntl_vlm: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub mark_px: Decimal,
}

/// Spot metadata: pairs plus the tokens they trade.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotMeta {
    pub universe: Vec<SpotPairMeta>,
    pub tokens: Vec<SpotTokenMeta>,
}

/// One spot trading pair. `tokens` holds `[base_index, quote_index]`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotPairMeta {
    pub name: String,
    pub tokens: [u32; 2],
    pub index: u32,
}

/// One spot token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotTokenMeta {
    pub name: String,
    pub index: u32,
    pub sz_decimals: u32,
}

/// Order book snapshot: `levels[0]` bids, `levels[1]` asks, best first.
#[derive(Debug, Clone, Deserialize)]
pub struct L2BookResponse {
    pub coin: String,
    pub time: i64,
    pub levels: [Vec<L2Level>; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct L2Level {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub sz: Decimal,
}

/// Perp account state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
    /// Margin available for new positions.
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub withdrawable: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetPosition {
    pub position: PerpPositionData,
}

/// One perp position. `szi` is signed: negative means short.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpPositionData {
    pub coin: String,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub szi: Decimal,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub entry_px: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub liquidation_px: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub unrealized_pnl: Option<Decimal>,
}

/// Spot account state.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotClearinghouseState {
    #[serde(default)]
    pub balances: Vec<SpotBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotBalance {
    pub coin: String,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub total: Decimal,
}

/// Response from the `orderStatus` info request.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatusResponse {
    pub status: String,
    #[serde(default)]
    pub order: Option<OrderStatusEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatusEntry {
    pub status: String,
    pub order: OrderStatusDetail,
}

/// The venue reports original and remaining size; the fill is the
/// difference, which is what makes this endpoint authoritative for
/// post-timeout recovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusDetail {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub orig_sz: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub sz: Decimal,
}

// ==================== Exchange (write) endpoint ====================

/// Signed request body for the `/exchange` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRequest {
    pub action: serde_json::Value,
    pub nonce: u64,
    pub signature: String,
}

/// Response from the `/exchange` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    pub status: String,
    #[serde(default)]
    pub response: Option<ExchangeResponseBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponseBody {
    #[serde(default)]
    pub data: Option<ExchangeResponseData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponseData {
    #[serde(default)]
    pub statuses: Vec<OrderStatusResult>,
}

/// Per-order outcome inside an exchange response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatusResult {
    Filled(FilledStatus),
    Resting(RestingStatus),
    Error(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledStatus {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub total_sz: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub avg_px: Decimal,
    pub oid: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestingStatus {
    pub oid: u64,
}

// Custom deserializers for the venue's string-encoded decimals.

fn deserialize_decimal_str<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse::<Decimal>().map_err(serde::de::Error::custom)
}

/// Handles both null values and missing fields.
fn deserialize_decimal_str_option_null<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<Option<String>> = Option::deserialize(deserializer)?;
    match opt {
        Some(Some(s)) if !s.is_empty() => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_request_serialization() {
        let req = InfoRequest::MetaAndAssetCtxs;
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"type":"metaAndAssetCtxs"}"#
        );

        let req = InfoRequest::L2Book {
            coin: "@107".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"type":"l2Book","coin":"@107"}"#
        );

        let req = InfoRequest::OrderStatus {
            user: "0xabc".to_string(),
            oid: "0xdeadbeef".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"orderStatus""#));
        assert!(json.contains(r#""oid":"0xdeadbeef""#));
    }

    #[test]
    fn test_deserialize_clearinghouse_state() {
        let json = r#"{
            "assetPositions": [
                {
                    "position": {
                        "coin": "HYPE",
                        "szi": "-10.0",
                        "entryPx": "12.5",
                        "liquidationPx": "25.1",
                        "unrealizedPnl": "-1.2"
                    },
                    "type": "oneWay"
                }
            ],
            "withdrawable": "250.75"
        }"#;

        let state: ClearinghouseState = serde_json::from_str(json).unwrap();
        assert_eq!(state.withdrawable.to_string(), "250.75");
        assert_eq!(state.asset_positions.len(), 1);
        let pos = &state.asset_positions[0].position;
        assert_eq!(pos.szi.to_string(), "-10.0");
        assert_eq!(pos.entry_px.unwrap().to_string(), "12.5");
    }

    #[test]
    fn test_deserialize_null_liquidation_price() {
        let json = r#"{
            "coin": "HYPE",
            "szi": "-1.0",
            "entryPx": "12.5",
            "liquidationPx": null,
            "unrealizedPnl": "0.0"
        }"#;
        let pos: PerpPositionData = serde_json::from_str(json).unwrap();
        assert!(pos.liquidation_px.is_none());
    }

    #[test]
    fn test_deserialize_order_statuses() {
        let json = r#"{
            "status": "ok",
            "response": {
                "type": "order",
                "data": {
                    "statuses": [
                        {"filled": {"totalSz": "9.95", "avgPx": "10.04", "oid": 77}},
                        {"resting": {"oid": 78}},
                        {"error": "Insufficient margin"}
                    ]
                }
            }
        }"#;

        let response: ExchangeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, "ok");
        let statuses = response.response.unwrap().data.unwrap().statuses;
        assert_eq!(statuses.len(), 3);
        match &statuses[0] {
            OrderStatusResult::Filled(filled) => {
                assert_eq!(filled.total_sz.to_string(), "9.95");
                assert_eq!(filled.avg_px.to_string(), "10.04");
            }
            other => panic!("expected filled, got {other:?}"),
        }
        assert!(matches!(statuses[1], OrderStatusResult::Resting(_)));
        assert!(matches!(statuses[2], OrderStatusResult::Error(_)));
    }

    #[test]
    fn test_deserialize_spot_meta() {
        let json = r#"{
            "universe": [
                {"name": "PURR/USDC", "tokens": [1, 0], "index": 0},
                {"name": "@107", "tokens": [2, 0], "index": 107}
            ],
            "tokens": [
                {"name": "USDC", "index": 0, "szDecimals": 8},
                {"name": "PURR", "index": 1, "szDecimals": 0},
                {"name": "HYPE", "index": 2, "szDecimals": 2}
            ]
        }"#;

        let meta: SpotMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.universe.len(), 2);
        assert_eq!(meta.tokens[2].name, "HYPE");
        assert_eq!(meta.universe[1].tokens, [2, 0]);
    }
}
