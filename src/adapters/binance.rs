//! Binance streaming adapter
//!
//! Connects to the combined trade stream, decodes `@trade` events, and
//! normalizes them into price updates. Pairs quoted in USD are served from
//! the venue's USDT market at 1:1; the normalized symbol is always the
//! declared pair name.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{FeedError, FeedResult};
use crate::models::{now_ms, FeedCategory, PriceUpdate};

use super::{AdapterCapabilities, AdapterEvent, ExchangeAdapter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SOURCE: &str = "binance";
const DEFAULT_ENDPOINT: &str = "wss://stream.binance.com:9443/ws";
/// Confidence assigned to venue trade prints
const TRADE_CONFIDENCE: f64 = 0.95;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

struct Inner {
    endpoint: String,
    connected: AtomicBool,
    events: broadcast::Sender<AdapterEvent>,
    /// Venue symbol (`BTCUSDT`) to declared pair name (`BTC/USD`)
    symbol_map: RwLock<HashMap<String, String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    request_id: AtomicU64,
}

/// Binance websocket driver
pub struct BinanceAdapter {
    inner: Arc<Inner>,
    session_cancel: Mutex<Option<CancellationToken>>,
}

impl BinanceAdapter {
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
                symbol_map: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                request_id: AtomicU64::new(1),
            }),
            session_cancel: Mutex::new(None),
        }
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for BinanceAdapter {
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
        let mut streams = Vec::with_capacity(symbols.len());
        {
            let mut map = self.inner.symbol_map.write();
            for pair in symbols {
                let venue_symbol = venue_symbol(pair);
                streams.push(format!("{}@trade", venue_symbol.to_ascii_lowercase()));
                map.insert(venue_symbol, pair.clone());
            }
        }
        self.send_request("SUBSCRIBE", streams)
    }

    async fn unsubscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut streams = Vec::with_capacity(symbols.len());
        {
            let mut map = self.inner.symbol_map.write();
            for pair in symbols {
                let venue_symbol = venue_symbol(pair);
                streams.push(format!("{}@trade", venue_symbol.to_ascii_lowercase()));
                map.remove(&venue_symbol);
            }
        }
        self.send_request("UNSUBSCRIBE", streams)
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
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

impl BinanceAdapter {
    fn send_request(&self, method: &str, streams: Vec<String>) -> FeedResult<()> {
        if streams.is_empty() {
            return Ok(());
        }
        let id = self.inner.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({
            "method": method,
            "params": streams,
            "id": id,
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

        // One immediate reconnect attempt; sustained failure is recovery's job.
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

/// Run one websocket session to completion
///
/// Returns `Ok(())` on client-initiated teardown and `Err(reason)` on any
/// transport failure.
async fn drive(
    inner: &Arc<Inner>,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let (mut write, mut read) = ws.split();

    // Re-establish subscriptions held across reconnects
    let streams: Vec<String> = inner
        .symbol_map
        .read()
        .keys()
        .map(|s| format!("{}@trade", s.to_ascii_lowercase()))
        .collect();
    if !streams.is_empty() {
        let payload = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": inner.request_id.fetch_add(1, Ordering::Relaxed),
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
                Some(Ok(Message::Text(text))) => {
                    let pair = {
                        let map = inner.symbol_map.read();
                        trade_symbol(&text).and_then(|s| map.get(&s).cloned())
                    };
                    if let Some(update) = pair.and_then(|p| normalize(&text, &p)) {
                        let _ = inner.events.send(AdapterEvent::PriceUpdate(update));
                    }
                }
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

/// Venue symbol for a declared pair; USD pairs trade on the USDT market
fn venue_symbol(pair: &str) -> String {
    let mut parts = pair.split('/');
    let base = parts.next().unwrap_or(pair);
    let quote = parts.next().unwrap_or("");
    let venue_quote = if quote == "USD" { "USDT" } else { quote };
    format!("{}{}", base, venue_quote)
}

/// Venue symbol embedded in a trade payload
fn trade_symbol(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let payload = value.get("data").unwrap_or(&value);
    payload
        .get("s")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

/// Decode one trade payload into a normalized update for `pair`
///
/// Pure; returns `None` for anything that is not a well-formed trade event.
fn normalize(text: &str, pair: &str) -> Option<PriceUpdate> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let payload = value.get("data").unwrap_or(&value);

    if payload.get("e").and_then(|e| e.as_str()) != Some("trade") {
        return None;
    }

    let price = payload
        .get("p")
        .and_then(|p| p.as_str())
        .and_then(|p| p.parse::<f64>().ok())?;
    let quantity = payload
        .get("q")
        .and_then(|q| q.as_str())
        .and_then(|q| q.parse::<f64>().ok());
    let timestamp_ms = payload
        .get("T")
        .and_then(|t| t.as_i64())
        .or_else(|| payload.get("E").and_then(|t| t.as_i64()))
        .unwrap_or_else(now_ms);

    let update = PriceUpdate {
        symbol: pair.to_string(),
        price,
        timestamp_ms,
        source: SOURCE.to_string(),
        confidence: TRADE_CONFIDENCE,
        volume: quantity,
    };
    update.is_well_formed().then_some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRADE: &str = r#"{"e":"trade","E":1700000000100,"s":"BTCUSDT","t":1,"p":"50000.10","q":"0.25","T":1700000000000}"#;

    #[test]
    fn test_normalize_trade() {
        let update = normalize(TRADE, "BTC/USD").unwrap();
        assert_eq!(update.symbol, "BTC/USD");
        assert_eq!(update.price, 50000.10);
        assert_eq!(update.timestamp_ms, 1_700_000_000_000);
        assert_eq!(update.source, "binance");
        assert_eq!(update.volume, Some(0.25));
    }

    #[test]
    fn test_normalize_combined_stream_payload() {
        let wrapped = format!(r#"{{"stream":"btcusdt@trade","data":{}}}"#, TRADE);
        assert_eq!(trade_symbol(&wrapped).as_deref(), Some("BTCUSDT"));
        assert!(normalize(&wrapped, "BTC/USD").is_some());
    }

    #[test]
    fn test_normalize_rejects_non_trade() {
        let payload = r#"{"e":"24hrTicker","s":"BTCUSDT","p":"1.0"}"#;
        assert!(normalize(payload, "BTC/USD").is_none());
        assert!(normalize("not json", "BTC/USD").is_none());
    }

    #[test]
    fn test_normalize_rejects_bad_price() {
        let payload = r#"{"e":"trade","s":"BTCUSDT","p":"-5","q":"1","T":1700000000000}"#;
        assert!(normalize(payload, "BTC/USD").is_none());
    }

    #[test]
    fn test_usd_pairs_use_usdt_market() {
        assert_eq!(venue_symbol("BTC/USD"), "BTCUSDT");
        assert_eq!(venue_symbol("ETH/USDC"), "ETHUSDC");
    }

    #[test]
    fn test_capabilities() {
        let adapter = BinanceAdapter::new();
        let caps = adapter.capabilities();
        assert!(caps.streaming);
        assert!(caps.volume);
        assert!(!caps.rest);
    }
}
