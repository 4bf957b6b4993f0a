//! Transport adapter: publish signed events to a set of relays, subscribe
//! with filters, and deliver matching events. The core is transport-agnostic;
//! `RelayTransport` is the default implementation this crate ships so it is
//! usable standalone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RelayTransportConfig;
use crate::error::TransportError;

/// A kind-24133 wire event. This is the only kind this core ever builds
/// or consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    pub kind: u16,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    pub tags: Vec<Vec<String>>,
    pub id: String,
    pub sig: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A subscription filter. `since` is seconds, matching the Nostr wire
/// convention used for `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: Vec<u16>,
    #[serde(rename = "#p")]
    pub p_tags: Vec<String>,
    pub since: u64,
}

/// Validate a relay URL must be non-empty and `ws://`/`wss://`.
pub fn validate_relay_url(url: &str) -> Result<(), TransportError> {
    if url.is_empty() {
        return Err(TransportError::PublishFailed("relay url cannot be empty".into()));
    }
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(TransportError::PublishFailed(
            "relay url must start with ws:// or wss://".into(),
        ));
    }
    Ok(())
}

/// Trim, lowercase, and strip one trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();
    if normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}

pub fn normalize_and_dedupe(urls: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        let normalized = normalize_relay_url(url);
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

pub type EventHandler = Box<dyn Fn(RelayEvent) + Send + Sync>;
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Minimal interface the queue needs from any relay library.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once at least one relay acknowledges, or fails with the
    /// aggregated error if every relay rejected the event. Failing with no
    /// relays at all must be `TransportError::NoRelays`, a condition the
    /// queue recognizes by discriminant.
    async fn publish(&self, relays: &[String], event: RelayEvent) -> Result<(), TransportError>;

    /// Returns an unsubscribe callable. Subscribing with no relays warns
    /// and returns a no-op unsubscribe.
    async fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
        handler: EventHandler,
    ) -> Unsubscribe;
}

/// One outbound frame queued for a relay connection.
#[derive(Debug, Clone)]
enum Frame {
    Event(RelayEvent),
    Req(String, Filter),
    Close(String),
}

/// Default `Transport`, grounded on the one-websocket-per-relay,
/// best-effort-fan-out design: publish succeeds if any relay accepts,
/// subscriptions are rebuilt by closing the previous handle first.
pub struct RelayTransport {
    config: RelayTransportConfig,
    connections: async_lock::Mutex<HashMap<String, Arc<native::RelayConnection>>>,
}

impl Default for RelayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayTransport {
    pub fn new() -> Self {
        Self::with_config(RelayTransportConfig::default())
    }

    pub fn with_config(config: RelayTransportConfig) -> Self {
        Self {
            config,
            connections: async_lock::Mutex::new(HashMap::new()),
        }
    }

    async fn connection_for(&self, url: &str) -> Arc<native::RelayConnection> {
        let normalized = normalize_relay_url(url);
        let queue_capacity = self.config.send_queue_capacity;
        let connect_timeout_ms = self.config.connect_timeout_ms;
        let mut connections = self.connections.lock().await;
        connections
            .entry(normalized.clone())
            .or_insert_with(|| {
                Arc::new(native::RelayConnection::with_connect_timeout(
                    normalized,
                    queue_capacity,
                    connect_timeout_ms,
                ))
            })
            .clone()
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn publish(&self, relays: &[String], event: RelayEvent) -> Result<(), TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }

        let mut last_err = None;
        let mut any_ok = false;
        for relay in normalize_and_dedupe(relays) {
            let conn = self.connection_for(&relay).await;
            match conn.send(Frame::Event(event.clone())).await {
                Ok(()) => any_ok = true,
                Err(e) => last_err = Some(e),
            }
        }

        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or(TransportError::PublishFailed("no relays accepted".into())))
        }
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
        handler: EventHandler,
    ) -> Unsubscribe {
        if relays.is_empty() {
            tracing::warn!("subscribe called with no relays; returning a no-op unsubscribe");
            return Box::new(|| {});
        }

        let sub_id = uuid::Uuid::new_v4().to_string();
        let handler = Arc::new(handler);
        let mut conns = Vec::new();

        for relay in normalize_and_dedupe(relays) {
            let conn = self.connection_for(&relay).await;
            conn.register_handler(sub_id.clone(), handler.clone()).await;
            let _ = conn.send(Frame::Req(sub_id.clone(), filter.clone())).await;
            conns.push(conn);
        }

        let sub_id_for_close = sub_id.clone();
        Box::new(move || {
            for conn in conns {
                conn.close_sub_detached(sub_id_for_close.clone());
            }
        })
    }
}

/// Native (non-wasm32) relay connection: reconnect-on-failure WebSocket,
/// bounded outbound queue, best-effort delivery.
#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    pub struct RelayConnection {
        url: String,
        sender: mpsc::Sender<Frame>,
        connected: Arc<AtomicBool>,
        handlers: Arc<async_lock::Mutex<HashMap<String, Arc<EventHandler>>>>,
    }

    impl RelayConnection {
        pub fn new(url: String, queue_capacity: usize) -> Self {
            Self::with_connect_timeout(url, queue_capacity, 10_000)
        }

        pub fn with_connect_timeout(url: String, queue_capacity: usize, connect_timeout_ms: u64) -> Self {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let connected = Arc::new(AtomicBool::new(false));
            let handlers: Arc<async_lock::Mutex<HashMap<String, Arc<EventHandler>>>> =
                Arc::new(async_lock::Mutex::new(HashMap::new()));

            tokio::spawn(Self::drive(
                url.clone(),
                rx,
                connected.clone(),
                handlers.clone(),
                connect_timeout_ms,
            ));

            Self {
                url,
                sender: tx,
                connected,
                handlers,
            }
        }

        pub async fn register_handler(&self, sub_id: String, handler: Arc<EventHandler>) {
            self.handlers.lock().await.insert(sub_id, handler);
        }

        pub fn close_sub_detached(&self, sub_id: String) {
            let handlers = self.handlers.clone();
            let sender = self.sender.clone();
            tokio::spawn(async move {
                handlers.lock().await.remove(&sub_id);
                let _ = sender.send(Frame::Close(sub_id)).await;
            });
        }

        pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.sender
                .send(frame)
                .await
                .map_err(|_| TransportError::RelayNotConnected(self.url.clone()))?;
            Ok(())
        }

        async fn drive(
            url: String,
            mut rx: mpsc::Receiver<Frame>,
            connected: Arc<AtomicBool>,
            handlers: Arc<async_lock::Mutex<HashMap<String, Arc<EventHandler>>>>,
            connect_timeout_ms: u64,
        ) {
            loop {
                let attempt = tokio::time::timeout(
                    std::time::Duration::from_millis(connect_timeout_ms),
                    tokio_tungstenite::connect_async(&url),
                )
                .await;
                let ws = match attempt {
                    Ok(Ok((ws, _))) => ws,
                    Ok(Err(e)) => {
                        tracing::warn!("relay {url} connect failed: {e}");
                        connected.store(false, Ordering::Relaxed);
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!("relay {url} connect timed out after {connect_timeout_ms}ms");
                        connected.store(false, Ordering::Relaxed);
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                };
                connected.store(true, Ordering::Relaxed);
                let (mut sink, mut stream) = ws.split();

                loop {
                    tokio::select! {
                        frame = rx.recv() => {
                            match frame {
                                None => return,
                                Some(frame) => {
                                    let text = match &frame {
                                        Frame::Event(event) => {
                                            serde_json::json!(["EVENT", event]).to_string()
                                        }
                                        Frame::Req(sub_id, filter) => {
                                            serde_json::json!(["REQ", sub_id, filter]).to_string()
                                        }
                                        Frame::Close(sub_id) => {
                                            serde_json::json!(["CLOSE", sub_id]).to_string()
                                        }
                                    };
                                    if sink.send(Message::Text(text)).await.is_err() {
                                        connected.store(false, Ordering::Relaxed);
                                        break;
                                    }
                                }
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    Self::dispatch_incoming(&text, &handlers).await;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::warn!("relay {url} read error: {e}");
                                    connected.store(false, Ordering::Relaxed);
                                    break;
                                }
                                None => {
                                    connected.store(false, Ordering::Relaxed);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        async fn dispatch_incoming(
            text: &str,
            handlers: &async_lock::Mutex<HashMap<String, Arc<EventHandler>>>,
        ) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
                return;
            };
            let Some(array) = value.as_array() else {
                return;
            };
            if array.len() < 3 || array[0].as_str() != Some("EVENT") {
                return;
            }
            let Some(sub_id) = array[1].as_str() else {
                return;
            };
            let Ok(event) = serde_json::from_value::<RelayEvent>(array[2].clone()) else {
                return;
            };

            let handlers = handlers.lock().await;
            if let Some(handler) = handlers.get(sub_id) {
                handler(event);
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod native {
    use super::*;

    /// wasm32 relay connection backed by `gloo_net`'s WebSocket; the queue
    /// and handler-registry shape mirrors the native implementation.
    pub struct RelayConnection {
        url: String,
        handlers: Arc<async_lock::Mutex<HashMap<String, Arc<EventHandler>>>>,
        outbox: Arc<async_lock::Mutex<Vec<Frame>>>,
    }

    impl RelayConnection {
        pub fn new(url: String, _queue_capacity: usize) -> Self {
            Self {
                url,
                handlers: Arc::new(async_lock::Mutex::new(HashMap::new())),
                outbox: Arc::new(async_lock::Mutex::new(Vec::new())),
            }
        }

        pub fn with_connect_timeout(url: String, queue_capacity: usize, _connect_timeout_ms: u64) -> Self {
            Self::new(url, queue_capacity)
        }

        pub async fn register_handler(&self, sub_id: String, handler: Arc<EventHandler>) {
            self.handlers.lock().await.insert(sub_id, handler);
        }

        pub fn close_sub_detached(&self, sub_id: String) {
            let handlers = self.handlers.clone();
            wasm_bindgen_futures::spawn_local(async move {
                handlers.lock().await.remove(&sub_id);
            });
        }

        pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.outbox.lock().await.push(frame);
            tracing::debug!("queued frame for relay {}", self.url);
            Ok(())
        }
    }
}
