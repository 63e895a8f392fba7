//! Coinbase streaming adapter
//!
//! Subscribes to the `matches` channel of the exchange websocket feed and
//! normalizes fills into price updates. Coinbase lists native USD markets,
//! so declared pairs map directly to `BASE-QUOTE` product ids.

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{FeedError, FeedResult};
use crate::models::{now_ms, FeedCategory, PriceUpdate};

use super::{AdapterCapabilities, AdapterEvent, ExchangeAdapter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SOURCE: &str = "coinbase";
const DEFAULT_ENDPOINT: &str = "wss://ws-feed.exchange.coinbase.com";
/// Confidence assigned to venue fills
const MATCH_CONFIDENCE: f64 = 0.9;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

struct Inner {
    endpoint: String,
    connected: AtomicBool,
    events: broadcast::Sender<AdapterEvent>,
    /// Product id (`BTC-USD`) to declared pair name (`BTC/USD`)
    product_map: RwLock<HashMap<String, String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Coinbase websocket driver
pub struct CoinbaseAdapter {
    inner: Arc<Inner>,
    session_cancel: Mutex<Option<CancellationToken>>,
}

impl Inner {
    /// Install a fresh outbound channel and mark the transport up
    fn begin_session(&self) -> mpsc::UnboundedReceiver<Message> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        self.connected.store(true, Ordering::Release);
        let _ = self.events.send(AdapterEvent::Connected {
            source: SOURCE.to_string(),
        });
        out_rx
    }
}

impl CoinbaseAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Endpoint override, used by tests against a local server
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                connected: AtomicBool::new(false),
                events,
                product_map: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
            }),
            session_cancel: Mutex::new(None),
        }
    }

    fn send_channel_request(&self, kind: &str, product_ids: Vec<String>) -> FeedResult<()> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let payload = serde_json::json!({
            "type": kind,
            "channels": [{ "name": "matches", "product_ids": product_ids }],
        });
        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(payload.to_string()))
                .map_err(|_| FeedError::SourceTransient {
                    source_name: SOURCE.to_string(),
                    reason: "connection task gone".to_string(),
                }),
            None => Err(FeedError::SourceTransient {
                source_name: SOURCE.to_string(),
                reason: "not connected".to_string(),
            }),
        }
    }
}

impl Default for CoinbaseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    fn name(&self) -> &str {
        SOURCE
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            rest: false,
            volume: true,
            categories: vec![FeedCategory::Crypto],
        }
    }

    async fn connect(&self) -> FeedResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let ws = open_stream(&self.inner.endpoint).await?;
        let cancel = CancellationToken::new();
        *self.session_cancel.lock() = Some(cancel.clone());
        // Session state is live before this returns, so a subscribe on the
        // heels of connect cannot race the reader task
        let outgoing = self.inner.begin_session();
        spawn_session(self.inner.clone(), ws, outgoing, cancel);
        Ok(())
    }

    async fn disconnect(&self) -> FeedResult<()> {
        if let Some(cancel) = self.session_cancel.lock().take() {
            cancel.cancel();
        }
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            let _ = self.inner.events.send(AdapterEvent::Disconnected {
                source: SOURCE.to_string(),
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut product_ids = Vec::with_capacity(symbols.len());
        {
            let mut map = self.inner.product_map.write();
            for pair in symbols {
                let product = product_id(pair);
                product_ids.push(product.clone());
                map.insert(product, pair.clone());
            }
        }
        self.send_channel_request("subscribe", product_ids)
    }

    async fn unsubscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut product_ids = Vec::with_capacity(symbols.len());
        {
            let mut map = self.inner.product_map.write();
            for pair in symbols {
                let product = product_id(pair);
                map.remove(&product);
                product_ids.push(product);
            }
        }
        self.send_channel_request("unsubscribe", product_ids)
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}

async fn open_stream(endpoint: &str) -> FeedResult<WsStream> {
    let (ws, _) = connect_async(endpoint)
        .await
        .map_err(|e| FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: e.to_string(),
        })?;
    Ok(ws)
}

fn spawn_session(
    inner: Arc<Inner>,
    ws: WsStream,
    outgoing: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut result = drive(&inner, ws, outgoing, &cancel).await;

        if let Err(first) = &result {
            if !cancel.is_cancelled() {
                tracing::warn!(
                    source = SOURCE,
                    error = %first,
                    "Stream failed, attempting immediate reconnect"
                );
                match open_stream(&inner.endpoint).await {
                    Ok(ws) => {
                        let outgoing = inner.begin_session();
                        result = drive(&inner, ws, outgoing, &cancel).await;
                    }
                    Err(e) => result = Err(e.to_string()),
                }
            }
        }

        inner.connected.store(false, Ordering::Release);
        *inner.outbound.lock() = None;
        if let Err(reason) = result {
            if !cancel.is_cancelled() {
                let _ = inner.events.send(AdapterEvent::Disconnected {
                    source: SOURCE.to_string(),
                    reason,
                });
            }
        }
    });
}

async fn drive(
    inner: &Arc<Inner>,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let (mut write, mut read) = ws.split();

    let product_ids: Vec<String> = inner.product_map.read().keys().cloned().collect();
    if !product_ids.is_empty() {
        let payload = serde_json::json!({
            "type": "subscribe",
            "channels": [{ "name": "matches", "product_ids": product_ids }],
        });
        write
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| e.to_string())?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            outgoing = out_rx.recv() => match outgoing {
                Some(msg) => write.send(msg).await.map_err(|e| e.to_string())?,
                None => return Ok(()),
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_text(inner, &text),
                Some(Ok(Message::Ping(payload))) => {
                    write.send(Message::Pong(payload)).await.map_err(|e| e.to_string())?;
                }
                Some(Ok(Message::Close(_))) => return Err("server closed connection".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.to_string()),
                None => return Err("stream ended".to_string()),
            }
        }
    }
}

fn handle_text(inner: &Arc<Inner>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return,
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("match") | Some("last_match") => {
            let pair = value
                .get("product_id")
                .and_then(|p| p.as_str())
                .and_then(|p| inner.product_map.read().get(p).cloned());
            if let Some(update) = pair.and_then(|p| normalize(&value, &p)) {
                let _ = inner.events.send(AdapterEvent::PriceUpdate(update));
            }
        }
        Some("error") => {
            // Per-symbol subscription rejections arrive as error frames
            let reason = value
                .get("reason")
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("subscription error")
                .to_string();
            let symbol = value
                .get("product_id")
                .and_then(|p| p.as_str())
                .unwrap_or("")
                .replace('-', "/");
            tracing::warn!(source = SOURCE, symbol = %symbol, reason = %reason, "Subscription dropped");
            let _ = inner.events.send(AdapterEvent::SubscriptionDropped {
                source: SOURCE.to_string(),
                symbol,
                reason,
            });
        }
        _ => {}
    }
}

/// Product id for a declared pair
fn product_id(pair: &str) -> String {
    pair.replace('/', "-")
}

/// Decode one match message into a normalized update for `pair`
fn normalize(value: &serde_json::Value, pair: &str) -> Option<PriceUpdate> {
    let price = value
        .get("price")
        .and_then(|p| p.as_str())
        .and_then(|p| p.parse::<f64>().ok())?;
    let size = value
        .get("size")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse::<f64>().ok());
    let timestamp_ms = value
        .get("time")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(now_ms);

    let update = PriceUpdate {
        symbol: pair.to_string(),
        price,
        timestamp_ms,
        source: SOURCE.to_string(),
        confidence: MATCH_CONFIDENCE,
        volume: size,
    };
    update.is_well_formed().then_some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn match_payload() -> serde_json::Value {
        serde_json::json!({
            "type": "match",
            "product_id": "BTC-USD",
            "price": "50100.25",
            "size": "0.5",
            "time": "2023-11-14T22:13:20.000Z",
        })
    }

    #[test]
    fn test_normalize_match() {
        let update = normalize(&match_payload(), "BTC/USD").unwrap();
        assert_eq!(update.symbol, "BTC/USD");
        assert_eq!(update.price, 50100.25);
        assert_eq!(update.source, "coinbase");
        assert_eq!(update.volume, Some(0.5));
        assert_eq!(update.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_normalize_rejects_bad_price() {
        let mut payload = match_payload();
        payload["price"] = serde_json::json!("not-a-number");
        assert!(normalize(&payload, "BTC/USD").is_none());
    }

    #[test]
    fn test_product_id_mapping() {
        assert_eq!(product_id("BTC/USD"), "BTC-USD");
        assert_eq!(product_id("ETH/EUR"), "ETH-EUR");
    }
}
