//! Cold-path event logging: bounded queue + append-only SQLite store.
//!
//! The hot path calls [`EventLog::log`], which only pushes onto an in-memory
//! queue and never blocks. A consumer task drains the queue into the
//! `events` table. The store is written for the dashboard and analysis;
//! restart semantics never read it back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Default capacity of the in-memory queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A structured event headed for the cold path.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

struct EventQueue {
    buf: Mutex<VecDeque<LogEvent>>,
    notify: Notify,
    capacity: usize,
}

/// Cloneable non-blocking handle used by the hot path.
#[derive(Clone)]
pub struct EventLog {
    queue: Arc<EventQueue>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Arc::new(EventQueue {
                buf: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    /// Enqueue an event. Never blocks; on overflow the oldest event is
    /// dropped with a warning so the hot path keeps moving.
    pub fn log(&self, kind: &str, data: Value) {
        let event = LogEvent {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
        };

        {
            let mut buf = self.queue.buf.lock().expect("event queue poisoned");
            if buf.len() >= self.queue.capacity {
                buf.pop_front();
                warn!(kind = %event.kind, "Event queue full, dropping oldest event");
            }
            buf.push_back(event);
        }
        self.queue.notify.notify_one();
    }

    pub fn log_position_open(
        &self,
        coin: &str,
        size: Decimal,
        size_usd: Decimal,
        entry_spot: Decimal,
        entry_perp: Decimal,
    ) {
        self.log(
            "position_open",
            json!({
                "coin": coin,
                "size": size,
                "size_usd": size_usd,
                "entry_spot": entry_spot,
                "entry_perp": entry_perp,
            }),
        );
    }

    pub fn log_position_close(&self, coin: &str, reason: &str) {
        self.log("position_close", json!({ "coin": coin, "reason": reason }));
    }

    pub fn log_trade(
        &self,
        coin: &str,
        side: &str,
        market: &str,
        size: Decimal,
        price: Decimal,
        cloid: &str,
    ) {
        self.log(
            "trade",
            json!({
                "coin": coin,
                "side": side,
                "market": market,
                "size": size,
                "price": price,
                "cloid": cloid,
            }),
        );
    }

    pub fn log_funding(&self, coin: &str, amount: Decimal, rate: Decimal, size: Decimal) {
        self.log(
            "funding",
            json!({ "coin": coin, "amount": amount, "rate": rate, "size": size }),
        );
    }

    pub fn log_rebalance(&self, coin: &str, percentage: Decimal, margin_ratio: Decimal) {
        self.log(
            "rebalance",
            json!({ "coin": coin, "percentage": percentage, "margin_ratio": margin_ratio }),
        );
    }

    pub fn log_panic_close(&self, coin: &str, closed: bool) {
        self.log("panic_close", json!({ "coin": coin, "closed": closed }));
    }

    pub fn log_critical(&self, context: &str, detail: &str) {
        self.log("critical", json!({ "context": context, "detail": detail }));
    }

    /// Take everything currently queued (consumer side).
    fn drain(&self) -> Vec<LogEvent> {
        let mut buf = self.queue.buf.lock().expect("event queue poisoned");
        buf.drain(..).collect()
    }

    async fn wait_for_events(&self) {
        self.queue.notify.notified().await;
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<LogEvent> {
        self.queue.buf.lock().expect("event queue poisoned").iter().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only SQLite event store.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open event store at {:?}", db_path.as_ref()))?;
        let store = Self { conn };
        store.init_schema()?;
        info!("Event store ready at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
                CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
                "#,
            )
            .context("Failed to initialize event store schema")?;
        Ok(())
    }

    pub fn append(&self, event: &LogEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO events (timestamp, kind, payload) VALUES (?1, ?2, ?3)",
                params![
                    event.timestamp.to_rfc3339(),
                    event.kind,
                    event.data.to_string()
                ],
            )
            .context("Failed to append event")?;
        Ok(())
    }

    pub fn count(&self, kind: &str) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE kind = ?1",
                params![kind],
                |row| row.get(0),
            )
            .context("Failed to count events")?;
        Ok(count)
    }
}

/// Drain the queue into the store until shutdown, then flush what remains.
pub async fn run_consumer(log: EventLog, store: EventStore, mut shutdown: watch::Receiver<bool>) {
    info!("Event consumer started");
    loop {
        tokio::select! {
            _ = log.wait_for_events() => {
                for event in log.drain() {
                    if let Err(e) = store.append(&event) {
                        error!(kind = %event.kind, error = %e, "Failed to persist event");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Final flush so nothing enqueued before shutdown is lost.
    let remaining = log.drain();
    debug!(count = remaining.len(), "Flushing event queue on shutdown");
    for event in &remaining {
        if let Err(e) = store.append(event) {
            error!(kind = %event.kind, error = %e, "Failed to persist event during flush");
        }
    }
    info!("Event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_queue_preserves_order() {
        let log = EventLog::new();
        log.log("a", json!({"n": 1}));
        log.log("b", json!({"n": 2}));
        log.log("c", json!({"n": 3}));

        let drained = log.drain();
        let kinds: Vec<&str> = drained.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let log = EventLog::with_capacity(2);
        log.log("first", json!({}));
        log.log("second", json!({}));
        log.log("third", json!({}));

        let drained = log.drain();
        let kinds: Vec<&str> = drained.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["second", "third"]);
    }

    #[test]
    fn test_store_append_and_count() {
        let store = EventStore::open_in_memory().unwrap();
        let event = LogEvent {
            kind: "trade".into(),
            data: json!({"coin": "HYPE", "size": "10"}),
            timestamp: Utc::now(),
        };
        store.append(&event).unwrap();
        store.append(&event).unwrap();
        assert_eq!(store.count("trade").unwrap(), 2);
        assert_eq!(store.count("funding").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consumer_drains_on_shutdown() {
        let log = EventLog::new();
        let store = EventStore::open_in_memory().unwrap();
        let (tx, rx) = watch::channel(false);

        log.log_funding("HYPE", dec!(0.05), dec!(0.0001), dec!(10));
        log.log_trade("HYPE", "buy", "spot", dec!(10), dec!(10.0), "abc");

        tx.send(true).unwrap();
        run_consumer(log.clone(), store, rx).await;
        assert!(log.queued().is_empty());
    }
}
