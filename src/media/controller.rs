//! Media Session Controller
//!
//! Besitzt die lokalen Capture-Geräte und die Peer Connection für genau
//! eine Session. Die State Machine spricht nur gegen den
//! `MediaController`-Trait; `WebRtcMediaController` ist die produktive
//! Implementierung über die webrtc-Crate.

use super::devices::{DeviceError, MediaStreamBundle, SAMPLE_RATE};
use crate::session::MediaKind;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(#[from] DeviceError),

    #[error("Peer connection setup failed: {0}")]
    PeerConnectionSetupFailed(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("No active peer connection")]
    NoPeerConnection,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// CONNECTION HEALTH
// ============================================================================

/// Spiegelt den Zustand der unterliegenden Peer Connection
///
/// Einziger Input für den ReconnectionSupervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionHealth {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionHealth::Connecting,
            RTCPeerConnectionState::Connected => ConnectionHealth::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionHealth::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionHealth::Failed,
            RTCPeerConnectionState::Closed => ConnectionHealth::Closed,
            _ => ConnectionHealth::New,
        }
    }
}

/// Events aus der Media-Schicht
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// Lokal gesammelter ICE Candidate, muss zur Gegenseite
    LocalCandidate(IceCandidate),
    /// Verbindungszustand hat sich geändert
    HealthChanged(ConnectionHealth),
    /// Remote-Stream verfügbar (oder ersetzt)
    RemoteTrack { mime_type: String },
}

// ============================================================================
// MEDIA CONTROLLER TRAIT
// ============================================================================

/// Schnittstelle der Media-Schicht wie die State Machine sie sieht
#[async_trait]
pub trait MediaController: Send + Sync {
    /// Akquiriert lokale Capture-Geräte für die Session
    async fn acquire(&self, kind: MediaKind) -> Result<(), MediaError>;

    /// Baut die Peer Connection und hängt die lokalen Tracks an
    async fn create_peer_connection(&self) -> Result<(), MediaError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Wendet eine Remote Description (Offer oder Answer) an
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// Wendet einen ICE Candidate der Gegenseite an
    async fn apply_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Gibt Geräte und Peer Connection vollständig frei
    async fn release(&self);

    fn connection_health(&self) -> ConnectionHealth;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;

    fn set_audio_enabled(&self, enabled: bool) -> bool;

    fn set_video_enabled(&self, enabled: bool) -> bool;

    fn set_speaker_routing(&self, speaker: bool);
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// WEBRTC MEDIA CONTROLLER
// ============================================================================

/// Produktive Media-Schicht über der webrtc-Crate
pub struct WebRtcMediaController {
    bundle: Arc<Mutex<Option<MediaStreamBundle>>>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    media_kind: Mutex<Option<MediaKind>>,
    health: Arc<Mutex<ConnectionHealth>>,
    event_tx: broadcast::Sender<MediaEvent>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcMediaController {
    pub fn new() -> Self {
        Self::with_ice_servers(default_ice_servers())
    }

    pub fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            bundle: Arc::new(Mutex::new(None)),
            peer_connection: Mutex::new(None),
            media_kind: Mutex::new(None),
            health: Arc::new(Mutex::new(ConnectionHealth::New)),
            event_tx,
            ice_servers,
        }
    }

    /// Fügt TURN-Server Credentials zur festen ICE-Konfiguration hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }

    /// Der zuletzt empfangene Remote-Track, solange er noch lebt
    ///
    /// Für Embedder die das Remote-Audio selbst pumpen; nach `release`
    /// oder Wegfall des Tracks wieder `None`.
    pub fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        self.bundle.lock().as_ref().and_then(|b| b.remote_track())
    }

    fn current_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        self.peer_connection
            .lock()
            .clone()
            .ok_or(MediaError::NoPeerConnection)
    }

    /// Registriert die Event Handler auf der Peer Connection
    fn setup_peer_connection_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        // Connection State Handler
        let health = Arc::clone(&self.health);
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            let mapped = ConnectionHealth::from(s);
            *health.lock() = mapped;
            let _ = event_tx.send(MediaEvent::HealthChanged(mapped));
            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(MediaEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (Remote-Stream)
        let event_tx = self.event_tx.clone();
        let bundle = Arc::clone(&self.bundle);
        pc.on_track(Box::new(move |track, _, _| {
            let mime_type = track.codec().capability.mime_type.clone();
            tracing::info!("Received remote track: {}", mime_type);
            // Schwache Rückreferenz im Bundle hinterlegen
            match bundle.lock().as_ref() {
                Some(b) => b.set_remote_track(&track),
                None => tracing::warn!("Remote track arrived without acquired media"),
            }
            let _ = event_tx.send(MediaEvent::RemoteTrack { mime_type });
            Box::pin(async move {})
        }));
    }

    async fn attach_local_tracks(
        &self,
        pc: &Arc<RTCPeerConnection>,
        kind: MediaKind,
    ) -> Result<(), MediaError> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "call-core".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        if kind.has_video() {
            let video_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                "call-core".to_string(),
            ));

            pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        }

        Ok(())
    }
}

impl Default for WebRtcMediaController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaController for WebRtcMediaController {
    async fn acquire(&self, kind: MediaKind) -> Result<(), MediaError> {
        let mut bundle = MediaStreamBundle::new(kind.has_video())?;
        bundle.start_capture()?;
        bundle.start_playback()?;

        *self.bundle.lock() = Some(bundle);
        *self.media_kind.lock() = Some(kind);
        Ok(())
    }

    async fn create_peer_connection(&self) -> Result<(), MediaError> {
        // Media Engine mit Default-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::PeerConnectionSetupFailed(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::PeerConnectionSetupFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::PeerConnectionSetupFailed(e.to_string()))?,
        );

        self.setup_peer_connection_handlers(&pc);

        let kind = self.media_kind.lock().unwrap_or(MediaKind::Audio);
        self.attach_local_tracks(&pc, kind).await?;

        *self.health.lock() = ConnectionHealth::New;
        *self.peer_connection.lock() = Some(pc);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let pc = self.current_peer_connection()?;

        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = pc
            .create_offer(options)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let pc = self.current_peer_connection()?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let pc = self.current_peer_connection()?;

        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(remote)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }

    async fn apply_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let pc = self.current_peer_connection()?;
        let candidate = candidate.normalized();

        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|e| MediaError::WebRtc(e.to_string()))
    }

    async fn release(&self) {
        if let Some(mut bundle) = self.bundle.lock().take() {
            bundle.release();
        }

        if let Some(pc) = self.peer_connection.lock().take() {
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }

        *self.media_kind.lock() = None;
        *self.health.lock() = ConnectionHealth::Closed;
    }

    fn connection_health(&self) -> ConnectionHealth {
        *self.health.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_tx.subscribe()
    }

    fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.bundle
            .lock()
            .as_ref()
            .map(|b| b.set_audio_enabled(enabled))
            .unwrap_or(false)
    }

    fn set_video_enabled(&self, enabled: bool) -> bool {
        self.bundle
            .lock()
            .as_ref()
            .map(|b| b.set_video_enabled(enabled))
            .unwrap_or(false)
    }

    fn set_speaker_routing(&self, speaker: bool) {
        match self.bundle.lock().as_mut() {
            Some(bundle) => bundle.set_speaker_routing(speaker),
            None => tracing::warn!("Speaker routing requested without acquired media"),
        }
    }
}

impl std::fmt::Debug for WebRtcMediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMediaController")
            .field("health", &self.connection_health())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
