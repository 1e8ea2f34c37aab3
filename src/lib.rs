//! call-core - Session- und Signaling-Engine für Echtzeit-Anrufe
//!
//! Diese Bibliothek orchestriert Audio-/Video-Anrufe zwischen zwei
//! Teilnehmern: Session-Lebenszyklus, SDP Offer/Answer-Austausch,
//! ICE-Candidate-Weiterleitung und Verbindungs-Wiederherstellung.
//!
//! Einstiegspunkt ist der [`SessionManager`]: er verdrahtet Transport,
//! Media-Schicht, State Machine und Supervisor und bietet die
//! Anruf-Operationen als schmale Fassade an.
//!
//! ```no_run
//! use call_core::{SessionConfig, SessionManager, MediaKind};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new(
//!     "alice",
//!     "https://signal.example.org/api/signal".parse()?,
//!     "wss://signal.example.org/ws".parse()?,
//! );
//! let manager = SessionManager::connect(config).await?;
//! manager.set_token("bearer-token");
//!
//! let session = manager.initiate("bob", MediaKind::Audio).await?;
//! println!("Calling, session {}", session.id);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod media;
pub mod session;
pub mod signaling;

pub use auth::{CredentialProvider, StaticCredentials};
pub use media::{ConnectionHealth, MediaController, MediaEvent, WebRtcMediaController};
pub use session::{
    CallNotification, CallRole, CallSession, CallSessionEngine, CallStatus, MediaKind,
    NotificationEvent, NotificationSink, NullNotificationSink, ReconnectionSupervisor,
    SessionError, SessionEvent,
};
pub use signaling::{
    IceCandidate, InboundSignal, SessionDescription, SignalingMessage, SignalingTransport,
};

use signaling::{HttpRequestChannel, PushChannel, RequestChannel, WebSocketPushChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use url::Url;

// ============================================================================
// KONFIGURATION
// ============================================================================

/// TURN-Server-Zugangsdaten für restriktive Netze
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Konfiguration des [`SessionManager`]
#[derive(Clone)]
pub struct SessionConfig {
    /// Eigene Teilnehmer-Kennung
    pub local_participant: String,
    /// HTTP-Endpunkt für den primären Request/Response-Kanal
    pub request_endpoint: Url,
    /// WebSocket-Endpunkt für Push-Zustellung und Fallback
    pub push_endpoint: Url,
    /// Wie lange ein ausgehender Anruf klingeln darf
    pub ringing_timeout: Duration,
    /// Zusätzliche Zustellversuche auf dem Primärpfad
    pub retry_limit: u32,
    /// Intervall der WebSocket-Keepalive-Pings
    pub keepalive_interval: Duration,
    /// Optionaler TURN-Server zusätzlich zu den STUN-Defaults
    pub turn_server: Option<TurnServer>,
    /// Senke für Anruf-Benachrichtigungen (Default: Log-Senke)
    pub notification_sink: Arc<dyn NotificationSink>,
}

impl SessionConfig {
    pub fn new(
        local_participant: impl Into<String>,
        request_endpoint: Url,
        push_endpoint: Url,
    ) -> Self {
        Self {
            local_participant: local_participant.into(),
            request_endpoint,
            push_endpoint,
            ringing_timeout: Duration::from_secs(45),
            retry_limit: 1,
            keepalive_interval: Duration::from_secs(30),
            turn_server: None,
            notification_sink: Arc::new(NullNotificationSink),
        }
    }

    pub fn with_ringing_timeout(mut self, timeout: Duration) -> Self {
        self.ringing_timeout = timeout;
        self
    }

    pub fn with_retry_limit(mut self, retries: u32) -> Self {
        self.retry_limit = retries;
        self
    }

    pub fn with_turn_server(mut self, turn: TurnServer) -> Self {
        self.turn_server = Some(turn);
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = sink;
        self
    }
}

// ============================================================================
// SESSION MANAGER
// ============================================================================

/// Verdrahtet Transport, Media-Schicht, State Machine und Supervisor
///
/// Eine Instanz pro angemeldetem Benutzer; es gibt keinen globalen
/// Zustand, mehrere Manager können nebeneinander existieren (Tests,
/// Multi-Account).
pub struct SessionManager {
    engine: Arc<CallSessionEngine>,
    credentials: Arc<StaticCredentials>,
    push: Arc<WebSocketPushChannel>,
    media: Arc<WebRtcMediaController>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SessionManager {
    /// Baut alle Komponenten auf und verbindet den Push-Kanal
    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let credentials = Arc::new(StaticCredentials::unauthenticated());

        let push = Arc::new(WebSocketPushChannel::connect(&config.push_endpoint).await?);
        push.start_keepalive(config.keepalive_interval);

        let request = Arc::new(HttpRequestChannel::new(config.request_endpoint.clone()));
        let transport = Arc::new(SignalingTransport::new(
            Arc::clone(&request) as Arc<dyn RequestChannel>,
            Arc::clone(&push) as Arc<dyn PushChannel>,
            Arc::clone(&credentials) as Arc<dyn CredentialProvider>,
            config.retry_limit,
        ));

        let mut controller = WebRtcMediaController::new();
        if let Some(turn) = &config.turn_server {
            controller.add_turn_server(
                turn.url.clone(),
                turn.username.clone(),
                turn.credential.clone(),
            );
        }
        let media: Arc<WebRtcMediaController> = Arc::new(controller);

        let engine = Arc::new(CallSessionEngine::new(
            config.local_participant.clone(),
            Arc::clone(&media) as Arc<dyn MediaController>,
            Arc::clone(&transport) as Arc<dyn signaling::SignalingSender>,
            Arc::clone(&config.notification_sink),
            config.ringing_timeout,
        ));

        let mut tasks = Vec::new();

        // Eingehende Signale in die State Machine speisen
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundSignal>(64);
        transport.register_handler(inbound_tx);
        {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                while let Some(signal) = inbound_rx.recv().await {
                    if let Err(e) = engine.handle_inbound(signal).await {
                        tracing::warn!("Inbound signal rejected: {}", e);
                    }
                }
            }));
        }

        // Lokale Candidates und Remote-Track-Events weiterleiten
        {
            let engine = Arc::clone(&engine);
            let transport = Arc::clone(&transport);
            let mut media_events = media.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = match media_events.recv().await {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    match event {
                        MediaEvent::LocalCandidate(candidate) => {
                            let Some(session) = engine.session().await else {
                                continue;
                            };
                            if session.is_terminal() {
                                continue;
                            }
                            let message = SignalingMessage::ice_candidate(
                                session.id.clone(),
                                candidate,
                            )
                            .with_target(session.remote_participant().to_string());
                            if let Err(e) = signaling::SignalingSender::send(
                                transport.as_ref(),
                                message,
                            )
                            .await
                            {
                                tracing::warn!("Failed to deliver local candidate: {}", e);
                            }
                        }
                        MediaEvent::RemoteTrack { mime_type } => {
                            if let Some(session) = engine.session().await {
                                engine.emit(SessionEvent::RemoteStream {
                                    session_id: session.id,
                                    mime_type,
                                });
                            }
                        }
                        MediaEvent::HealthChanged(_) => {}
                    }
                }
            }));
        }

        // Supervisor für Verbindungsausfälle
        let supervisor = ReconnectionSupervisor::new(
            Arc::clone(&engine),
            Arc::clone(&media) as Arc<dyn MediaController>,
        );
        tasks.push(supervisor.spawn());

        Ok(Self {
            engine,
            credentials,
            push,
            media,
            tasks,
        })
    }

    /// Hinterlegt das Bearer-Token des Authentifizierungs-Kollaborateurs
    pub fn set_token(&self, token: impl Into<String>) {
        self.credentials.set_token(Some(token.into()));
    }

    pub fn is_connected(&self) -> bool {
        self.push.is_connected()
    }

    // ------------------------------------------------------------------
    // Anruf-Operationen (Durchreiche an die State Machine)
    // ------------------------------------------------------------------

    pub async fn initiate(
        &self,
        target: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<CallSession, SessionError> {
        self.engine.initiate(target, media_kind).await
    }

    pub async fn accept(&self, session_id: &str) -> Result<(), SessionError> {
        self.engine.accept(session_id).await
    }

    pub async fn reject(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        self.engine.reject(session_id, reason).await
    }

    pub async fn end(&self, session_id: Option<&str>) -> Result<(), SessionError> {
        self.engine.end(session_id).await
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.engine.session().await
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.engine.connection_health()
    }

    /// Der zuletzt empfangene Remote-Track der laufenden Session
    pub fn remote_track(&self) -> Option<Arc<webrtc::track::track_remote::TrackRemote>> {
        self.media.remote_track()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.engine.subscribe()
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.engine.set_audio_enabled(enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.engine.set_video_enabled(enabled)
    }

    pub fn set_speaker_routing(&self, speaker: bool) {
        self.engine.set_speaker_routing(speaker)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Tracing-Subscriber-Setup der Bibliothek
///
/// `RUST_LOG` übersteuert den Default (`info`, Engine-Module auf `debug`).
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,call_core=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
