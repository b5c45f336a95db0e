//! Live price feed: best-bid/offer subscriptions over the venue websocket.
//!
//! Each coin needs two subscriptions, one for the perp book (the coin name)
//! and one for the resolved spot symbol. The two halves are merged into a
//! [`CoinTick`] which is only emitted once both books have been seen, so
//! consumers never observe a half-priced coin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{CoinTick, OrderLeg, PriceTick};

/// Control surface the watchdog uses on the feed.
#[async_trait]
pub trait FeedControl: Send + Sync {
    /// Tear down and re-dial the websocket. `Ok(true)` means the feed is
    /// streaming again.
    async fn reconnect(&self) -> Result<bool>;
}

/// One coin's pair of book subscriptions.
#[derive(Debug, Clone)]
pub struct FeedSubscription {
    pub coin: String,
    /// Venue-internal spot symbol resolved at startup (e.g. `"@107"`).
    pub spot_symbol: String,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BboData {
    coin: String,
    time: i64,
    /// `[best_bid, best_ask]`; a side can be missing on an empty book.
    bbo: [Option<BboLevel>; 2],
}

#[derive(Debug, Deserialize)]
struct BboLevel {
    #[serde(with = "rust_decimal::serde::str")]
    px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    sz: Decimal,
}

#[derive(Debug, Default, Clone, Copy)]
struct HalfBooks {
    spot: Option<(Decimal, Decimal)>,
    perp: Option<(Decimal, Decimal)>,
    time_ms: i64,
}

type BookMap = HashMap<String, HalfBooks>;
type SymbolMap = HashMap<String, (String, OrderLeg)>;

/// Websocket price feed with watchdog-driven reconnect.
pub struct PriceFeed {
    url: String,
    subscriptions: Vec<FeedSubscription>,
    tx: mpsc::Sender<CoinTick>,
    /// Symbol on the wire -> (coin, which leg's book it is).
    symbols: Arc<SymbolMap>,
    books: Arc<StdMutex<BookMap>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PriceFeed {
    pub fn new(url: String, subscriptions: Vec<FeedSubscription>, tx: mpsc::Sender<CoinTick>) -> Self {
        let mut symbols: SymbolMap = HashMap::new();
        for sub in &subscriptions {
            symbols.insert(sub.coin.clone(), (sub.coin.clone(), OrderLeg::Perp));
            symbols.insert(sub.spot_symbol.clone(), (sub.coin.clone(), OrderLeg::Spot));
        }

        Self {
            url,
            subscriptions,
            tx,
            symbols: Arc::new(symbols),
            books: Arc::new(StdMutex::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }

    /// Dial the venue, subscribe to every book, and spawn the reader task.
    /// Any previous reader is aborted first, so this doubles as reconnect.
    pub async fn connect(&self) -> Result<()> {
        info!(url = %self.url, "Connecting price feed");

        let (ws, _) = connect_async(&self.url)
            .await
            .context("Failed to connect to venue websocket")?;
        let (mut write, read) = ws.split();

        for sub in &self.subscriptions {
            for symbol in [&sub.coin, &sub.spot_symbol] {
                let request = json!({
                    "method": "subscribe",
                    "subscription": { "type": "bbo", "coin": symbol },
                });
                write
                    .send(Message::Text(request.to_string().into()))
                    .await
                    .context("Failed to send subscription")?;
            }
        }

        let tx = self.tx.clone();
        let symbols = self.symbols.clone();
        let books = self.books.clone();
        let handle = tokio::spawn(async move {
            let mut read = read;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(tick) = parse_and_merge(&text, &symbols, &books) {
                            if tx.send(tick).await.is_err() {
                                warn!("Tick receiver dropped, stopping reader");
                                return;
                            }
                        }
                    }
                    Ok(Message::Ping(_)) => {
                        // Pong is handled by tungstenite.
                        debug!("Feed ping");
                    }
                    Ok(Message::Close(_)) => {
                        info!("Feed closed by venue");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Feed error");
                        return;
                    }
                    _ => {}
                }
            }
        });

        let mut reader = self.reader.lock().await;
        if let Some(old) = reader.replace(handle) {
            old.abort();
        }

        Ok(())
    }
}

#[async_trait]
impl FeedControl for PriceFeed {
    async fn reconnect(&self) -> Result<bool> {
        self.connect().await?;
        Ok(true)
    }
}

/// Parse one websocket frame and fold it into the per-coin books. Returns
/// a tick once the coin has both halves.
fn parse_and_merge(
    text: &str,
    symbols: &SymbolMap,
    books: &StdMutex<BookMap>,
) -> Option<CoinTick> {
    let envelope: WsEnvelope = serde_json::from_str(text).ok()?;
    if envelope.channel != "bbo" {
        return None;
    }
    let data: BboData = serde_json::from_value(envelope.data).ok()?;

    let (coin, leg) = symbols.get(&data.coin)?.clone();
    let bid = data.bbo[0].as_ref().filter(|l| l.sz > Decimal::ZERO)?.px;
    let ask = data.bbo[1].as_ref().filter(|l| l.sz > Decimal::ZERO)?.px;

    let mut books = books.lock().expect("book map poisoned");
    let entry = books.entry(coin.clone()).or_default();
    match leg {
        OrderLeg::Spot => entry.spot = Some((bid, ask)),
        OrderLeg::Perp => entry.perp = Some((bid, ask)),
    }
    entry.time_ms = data.time;

    let (spot_bid, spot_ask) = entry.spot?;
    let (perp_bid, perp_ask) = entry.perp?;
    Some(CoinTick {
        coin,
        tick: PriceTick {
            spot_bid,
            spot_ask,
            perp_bid,
            perp_ask,
            time_ms: entry.time_ms,
        },
    })
}
