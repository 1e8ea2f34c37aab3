//! Signaling Transport - zwei redundante Kanäle
//!
//! Primärpfad ist ein Request/Response-Kanal (HTTP), Fallback ist der
//! Push-Kanal (WebSocket). Schlagen beide fehl, bekommt der Aufrufer
//! `DeliveryFailed` - die State Machine behandelt das als
//! session-fatalen Fehler statt endlos weiterzuprobieren.
//!
//! Eingehende Frames werden hier nur geparst und klassifiziert und dann
//! unverändert an genau einen registrierten Handler weitergereicht; der
//! Transport trifft keine fachlichen Entscheidungen.

use super::messages::{parse_inbound, InboundSignal, OutboundControl, SignalingMessage};
use crate::auth::CredentialProvider;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("No bearer credential available")]
    Unauthenticated,

    #[error("Request channel failed: {0}")]
    RequestFailed(String),

    #[error("Push channel failed: {0}")]
    PushFailed(String),

    #[error("Push channel not connected")]
    NotConnected,

    #[error("Signaling delivery failed on both channels: {0}")]
    DeliveryFailed(String),
}

// ============================================================================
// CHANNEL TRAITS
// ============================================================================

/// Ein Zustellversuch über den zuverlässigen Request/Response-Kanal
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn deliver(&self, token: &str, body: String) -> Result<(), TransportError>;
}

/// Der Push-/Event-Kanal: Fallback-Zustellung plus eingehende Frames
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn deliver(&self, body: String) -> Result<(), TransportError>;

    /// Gibt den Strom roher eingehender Frames heraus (einmalig)
    fn take_frames(&self) -> Option<mpsc::Receiver<String>>;
}

/// Ausgehende Seite des Transports, wie sie die State Machine sieht
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;
    async fn send_control(&self, control: OutboundControl) -> Result<(), TransportError>;
}

// ============================================================================
// SIGNALING TRANSPORT
// ============================================================================

/// Kombiniert Request- und Push-Kanal mit Fallback und begrenztem Retry
pub struct SignalingTransport {
    request: Arc<dyn RequestChannel>,
    push: Arc<dyn PushChannel>,
    credentials: Arc<dyn CredentialProvider>,
    /// Zusätzliche Versuche auf dem Primärpfad bevor der Fallback greift
    retry_limit: u32,
}

impl SignalingTransport {
    pub fn new(
        request: Arc<dyn RequestChannel>,
        push: Arc<dyn PushChannel>,
        credentials: Arc<dyn CredentialProvider>,
        retry_limit: u32,
    ) -> Self {
        Self {
            request,
            push,
            credentials,
            retry_limit,
        }
    }

    /// Registriert den (einzigen) Handler für eingehende Frames
    ///
    /// Parst und klassifiziert jeden Frame; fehlerhafte Umschläge werden
    /// mit einer Warnung verworfen, Keepalive-Pongs nicht weitergereicht.
    pub fn register_handler(&self, handler: mpsc::Sender<InboundSignal>) {
        let Some(mut frames) = self.push.take_frames() else {
            tracing::warn!("Inbound frame stream already taken, handler not registered");
            return;
        };

        tokio::spawn(async move {
            while let Some(raw) = frames.recv().await {
                match parse_inbound(&raw) {
                    Ok(InboundSignal::Pong) => {}
                    Ok(signal) => {
                        if handler.send(signal).await.is_err() {
                            tracing::info!("Inbound handler dropped, stopping dispatch");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Rejecting malformed inbound frame: {}", e);
                    }
                }
            }
        });
    }

    async fn send_body(&self, kind: &str, body: String) -> Result<(), TransportError> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(TransportError::Unauthenticated)?;

        let mut last_err: Option<TransportError> = None;
        for attempt in 0..=self.retry_limit {
            match self.request.deliver(&token, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Request channel attempt {} for {} failed: {}",
                        attempt + 1,
                        kind,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        // Fallback auf den Push-Kanal
        match self.push.deliver(body).await {
            Ok(()) => {
                tracing::info!("Delivered {} via push channel fallback", kind);
                Ok(())
            }
            Err(push_err) => {
                let request_err = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt".to_string());
                Err(TransportError::DeliveryFailed(format!(
                    "request: {}; push: {}",
                    request_err, push_err
                )))
            }
        }
    }
}

#[async_trait]
impl SignalingSender for SignalingTransport {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let body = serde_json::to_string(&message)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
        self.send_body(message.payload.kind(), body).await
    }

    async fn send_control(&self, control: OutboundControl) -> Result<(), TransportError> {
        let body = serde_json::to_string(&control)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
        self.send_body("control", body).await
    }
}

// ============================================================================
// HTTP REQUEST CHANNEL
// ============================================================================

/// Request/Response-Kanal über HTTP POST mit Bearer-Auth
pub struct HttpRequestChannel {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpRequestChannel {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl RequestChannel for HttpRequestChannel {
    async fn deliver(&self, token: &str, body: String) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::RequestFailed(format!(
                "server returned {}",
                response.status()
            )))
        }
    }
}

// ============================================================================
// WEBSOCKET PUSH CHANNEL
// ============================================================================

/// Push-Kanal über eine WebSocket-Verbindung
///
/// Lese- und Schreib-Seite laufen als eigene Tasks; ausgehende Frames
/// gehen über eine mpsc-Queue, eingehende landen im Frame-Strom den
/// `SignalingTransport::register_handler` konsumiert.
pub struct WebSocketPushChannel {
    outbound: mpsc::Sender<String>,
    frames: Mutex<Option<mpsc::Receiver<String>>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketPushChannel {
    /// Verbindet mit dem Push-Endpunkt
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        tracing::info!("Connecting push channel: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::PushFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (frame_tx, frame_rx) = mpsc::channel::<String>(100);
        let connected = Arc::new(AtomicBool::new(true));

        // Read-Task
        let connected_read = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if frame_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Push channel closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Push channel read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_read.store(false, Ordering::SeqCst);
        });

        // Write-Task
        let connected_write = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Push channel write error: {}", e);
                    connected_write.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            frames: Mutex::new(Some(frame_rx)),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Startet den Keepalive-Task gegen Idle-Timeouts des Servers
    pub fn start_keepalive(&self, interval: std::time::Duration) {
        let outbound = self.outbound.clone();
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !connected.load(Ordering::SeqCst) {
                    tracing::info!("Keepalive: push channel gone, stopping");
                    break;
                }
                if outbound
                    .send(r#"{"type":"ping"}"#.to_string())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl PushChannel for WebSocketPushChannel {
    async fn deliver(&self, body: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(body)
            .await
            .map_err(|e| TransportError::PushFailed(e.to_string()))
    }

    fn take_frames(&self) -> Option<mpsc::Receiver<String>> {
        self.frames.lock().take()
    }
}

// ============================================================================
// TESTS
// ============================================================================
