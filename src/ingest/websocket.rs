use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::core::utils::shorten_pubkey;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the per-address log subscriptions
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Full websocket URL including the API key
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// Base delay for reconnect backoff
    pub base_backoff: Duration,
    /// Cap for reconnect backoff
    pub max_backoff: Duration,
    /// Commitment level for logsSubscribe
    pub commitment: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "wss://mainnet.helius-rpc.com".to_string(),
            connect_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            commitment: "finalized".to_string(),
        }
    }
}

/// JSON-RPC request for Solana WebSocket subscriptions
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// JSON-RPC response from Solana WebSocket
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// WebSocket notification from Solana RPC
#[derive(Debug, Deserialize)]
pub struct WebSocketNotification {
    pub method: String,
    pub params: WebSocketNotificationParams,
}

/// Parameters for WebSocket notifications
#[derive(Debug, Deserialize)]
pub struct WebSocketNotificationParams {
    pub subscription: u64,
    pub result: Value,
}

/// A transaction that mentioned a watched address
#[derive(Debug, Clone)]
pub struct LogNotification {
    pub wallet_name: String,
    pub address: String,
    pub signature: String,
    pub logs: Vec<String>,
    pub failed: bool,
    /// Notification value as received, for the audit trail
    pub raw: Value,
}

impl LogNotification {
    /// Coarse instruction names found in the program logs
    pub fn instruction_hints(&self) -> BTreeSet<&'static str> {
        let mut hints = BTreeSet::new();
        for log in &self.logs {
            if !log.contains("Instruction:") {
                continue;
            }
            if log.contains("Transfer") {
                hints.insert("Transfer");
            } else if log.contains("Swap") {
                hints.insert("Swap");
            } else if log.contains("MintTo") {
                hints.insert("MintTo");
            } else if log.contains("Burn") {
                hints.insert("Burn");
            }
        }
        hints
    }
}

/// Runtime requests to the subscription manager
#[derive(Debug, Clone)]
pub enum SubscriptionCommand {
    Watch { name: String, address: String },
}

/// Reconnect delay: base * 2^retry, capped
pub fn backoff_delay(base: Duration, retry: u32, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(max)).unwrap_or(max)
}

/// Extracts a log notification from a raw websocket text frame
pub fn parse_log_notification(text: &str, wallet_name: &str, address: &str) -> Option<LogNotification> {
    let notification: WebSocketNotification = serde_json::from_str(text).ok()?;
    if notification.method != "logsNotification" {
        return None;
    }
    let value = notification.params.result.get("value")?.clone();
    let signature = value.get("signature")?.as_str()?.to_string();
    let logs = value
        .get("logs")
        .and_then(|l| l.as_array())
        .map(|arr| arr.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let failed = value.get("err").map(|e| !e.is_null()).unwrap_or(false);

    Some(LogNotification {
        wallet_name: wallet_name.to_string(),
        address: address.to_string(),
        signature,
        logs,
        failed,
        raw: value,
    })
}

enum StreamEnd {
    Closed,
    Shutdown,
}

/// Keeps one logsSubscribe connection per watched address alive
pub struct SubscriptionManager {
    config: WebSocketConfig,
    notification_sender: mpsc::UnboundedSender<LogNotification>,
    shutdown: broadcast::Sender<()>,
    /// address -> connection task
    connections: DashMap<String, JoinHandle<()>>,
}

impl SubscriptionManager {
    pub fn new(
        config: WebSocketConfig,
        notification_sender: mpsc::UnboundedSender<LogNotification>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            notification_sender,
            shutdown,
            connections: DashMap::new(),
        }
    }

    /// Starts watching `address`. Already-watched addresses are left alone.
    pub fn watch(&self, name: &str, address: &str) -> bool {
        if address.is_empty() || self.connections.contains_key(address) {
            return false;
        }
        let task = tokio::spawn(connection_loop(
            name.to_string(),
            address.to_string(),
            self.config.clone(),
            self.notification_sender.clone(),
            self.shutdown.subscribe(),
        ));
        self.connections.insert(address.to_string(), task);
        info!("👁️ Watching {} ({})", name, shorten_pubkey(address));
        true
    }

    /// Serves runtime watch requests until shutdown, then tears down every connection
    #[instrument(skip_all)]
    pub async fn run(&self, mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SubscriptionCommand::Watch { name, address }) => {
                        self.watch(&name, &address);
                    }
                    None => {
                        debug!("Subscription command channel closed");
                        let _ = shutdown.recv().await;
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        for entry in self.connections.iter() {
            entry.value().abort();
        }
        info!("🛑 Closed {} websocket subscriptions", self.connections.len());
        Ok(())
    }
}

#[instrument(skip(config, sender, shutdown))]
async fn connection_loop(
    name: String,
    address: String,
    config: WebSocketConfig,
    sender: mpsc::UnboundedSender<LogNotification>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut retry: u32 = 0;

    loop {
        match connect_and_subscribe(&config, &address).await {
            Ok(ws) => {
                retry = 0;
                match stream_notifications(ws, &config, &name, &address, &sender, &mut shutdown).await {
                    StreamEnd::Shutdown => return,
                    StreamEnd::Closed => {
                        error!("Connection closed for {}, reconnecting...", name);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to connect for {}", name);
            }
        }

        if sender.is_closed() {
            return;
        }

        let delay = backoff_delay(config.base_backoff, retry, config.max_backoff);
        retry = retry.saturating_add(1);
        debug!("Reconnecting {} in {:?}", name, delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
    }
}

async fn connect_and_subscribe(config: &WebSocketConfig, address: &str) -> Result<WsStream> {
    let parsed = Url::parse(&config.url).context("Failed to parse WebSocket URL")?;
    debug!("Connecting to {}://{} for {}", parsed.scheme(), parsed.host_str().unwrap_or(""), address);

    let (mut ws, response) = timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .context("Connection timeout")?
        .context("Failed to connect to WebSocket")?;
    debug!("Connected (HTTP {})", response.status());

    let subscribe = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: 1,
        method: "logsSubscribe".to_string(),
        params: serde_json::json!([
            { "mentions": [address] },
            { "commitment": config.commitment }
        ]),
    };
    let message = serde_json::to_string(&subscribe).context("Failed to serialize logsSubscribe")?;
    ws.send(Message::Text(message))
        .await
        .context("Failed to send logsSubscribe")?;
    Ok(ws)
}

async fn stream_notifications(
    ws: WsStream,
    config: &WebSocketConfig,
    name: &str,
    address: &str,
    sender: &mpsc::UnboundedSender<LogNotification>,
    shutdown: &mut broadcast::Receiver<()>,
) -> StreamEnd {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let mut keepalive = tokio::time::interval(config.ping_interval);
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(Vec::new())).await {
                    warn!(error = %e, "Keepalive ping failed for {}", name);
                    return StreamEnd::Closed;
                }
            }
            _ = shutdown.recv() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                return StreamEnd::Shutdown;
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(notification) = parse_log_notification(&text, name, address) {
                        debug!(
                            signature = %notification.signature,
                            hints = ?notification.instruction_hints(),
                            "Log notification for {}", name
                        );
                        if sender.send(notification).is_err() {
                            return StreamEnd::Shutdown;
                        }
                    } else if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&text) {
                        if let Some(err) = response.error {
                            error!("JSON-RPC error for {}: {} - {}", name, err.code, err.message);
                        } else if let (Some(id), Some(result)) = (response.id, response.result) {
                            info!("📡 Subscription confirmed for {}: request_id={}, subscription={}", name, id, result);
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket closed for {}: {:?}", name, frame);
                    return StreamEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket receive error for {}", name);
                    return StreamEnd::Closed;
                }
                None => return StreamEnd::Closed,
            }
        }
    }
}
