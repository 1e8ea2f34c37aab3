//! Call Session State Machine
//!
//! Das Herzstück der Engine: besitzt den Session-Lebenszyklus, validiert
//! Übergänge, treibt Offer/Answer-Erzeugung und koordiniert Media-Schicht,
//! Signaling-Transport und ICE-Puffer.
//!
//! Alle Übergänge laufen unter einem einzigen tokio-Mutex
//! (Single-Writer-Disziplin): ein laufender Übergang wird abgeschlossen
//! oder scheitert bevor der nächste Trigger verarbeitet wird; später
//! eintreffende Trigger warten am Lock statt verworfen zu werden.

use super::buffer::IceCandidateBuffer;
use super::notify::{CallNotification, NotificationEvent, NotificationSink};
use super::state::{CallSession, CallStatus, MediaKind};
use crate::media::{MediaController, MediaError};
use crate::signaling::{
    InboundSignal, OutboundControl, SessionDescription, SignalingMessage, SignalingPayload,
    SignalingSender, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Peer connection setup failed: {0}")]
    PeerConnectionSetupFailed(String),

    #[error("Signaling delivery failed: {0}")]
    SignalingDeliveryFailed(String),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Connection unrecoverable")]
    ConnectionUnrecoverable,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

impl From<MediaError> for SessionError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::DeviceUnavailable(d) => SessionError::DeviceUnavailable(d.to_string()),
            other => SessionError::PeerConnectionSetupFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unauthenticated => SessionError::Unauthenticated,
            other => SessionError::SignalingDeliveryFailed(other.to_string()),
        }
    }
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Typisierte Events der State Machine
///
/// Konsumenten abonnieren über einen Broadcast-Kanal statt sich in
/// freie Callback-Listen einzutragen.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        session_id: String,
        status: CallStatus,
    },
    RemoteStream {
        session_id: String,
        mime_type: String,
    },
    SessionFailed {
        session_id: String,
        error: String,
    },
}

// ============================================================================
// ENGINE STATE
// ============================================================================

/// Innerer, exklusiv gehaltener Zustand der State Machine
#[derive(Default)]
struct EngineState {
    session: Option<CallSession>,

    /// Offer das vor der lokalen Annahme eintraf (Responder-Rennen)
    pending_offer: Option<SessionDescription>,

    /// Lokale Annahme bereits erfolgt, Offer steht noch aus
    accepted: bool,

    /// Initiator: Offer raus, Answer noch nicht angewendet
    /// (gilt auch für ICE-Restart-Runden)
    awaiting_answer: bool,

    /// Gate für ICE Candidates - vorher wird gepuffert
    remote_description_set: bool,

    candidates: IceCandidateBuffer,

    ring_timer: Option<tokio::task::JoinHandle<()>>,
}

impl EngineState {
    /// Räumt alle Verhandlungs-Slots für eine frische Session
    fn reset_negotiation(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        self.pending_offer = None;
        self.accepted = false;
        self.awaiting_answer = false;
        self.remote_description_set = false;
        self.candidates.clear();
    }
}

// ============================================================================
// CALL SESSION ENGINE
// ============================================================================

/// Die Call Session State Machine
///
/// Genau eine nicht-terminale Session pro Instanz; ein neuer
/// Anrufversuch räumt terminale Reste implizit weg.
pub struct CallSessionEngine {
    state: Mutex<EngineState>,
    media: Arc<dyn MediaController>,
    signaling: Arc<dyn SignalingSender>,
    notifications: Arc<dyn NotificationSink>,
    event_tx: broadcast::Sender<SessionEvent>,
    local_participant: String,
    ringing_timeout: Duration,
}

impl CallSessionEngine {
    pub fn new(
        local_participant: String,
        media: Arc<dyn MediaController>,
        signaling: Arc<dyn SignalingSender>,
        notifications: Arc<dyn NotificationSink>,
        ringing_timeout: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Mutex::new(EngineState::default()),
            media,
            signaling,
            notifications,
            event_tx,
            local_participant,
            ringing_timeout,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Aktuelle Session (falls vorhanden), als Schnappschuss
    pub async fn session(&self) -> Option<CallSession> {
        self.state.lock().await.session.clone()
    }

    /// Verbindungszustand der unterliegenden Peer Connection
    pub fn connection_health(&self) -> crate::media::ConnectionHealth {
        self.media.connection_health()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // PUBLIC OPERATIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt zurück sobald das Offer verschickt ist (nicht erst bei
    /// Annahme). Existiert eine nicht-terminale Session, scheitert der
    /// Aufruf mit `AlreadyInCall` ohne sie anzufassen.
    pub async fn initiate(
        self: &Arc<Self>,
        target: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<CallSession, SessionError> {
        let target = target.into();
        let mut st = self.state.lock().await;

        if let Some(session) = &st.session {
            if !session.is_terminal() {
                return Err(SessionError::AlreadyInCall);
            }
        }

        // Terminale Reste wegräumen, frische Session anlegen
        st.reset_negotiation();
        let session_id = Uuid::new_v4().to_string();
        st.session = Some(CallSession::outbound(
            session_id.clone(),
            self.local_participant.clone(),
            target.clone(),
            media_kind,
        ));

        tracing::info!("Initiating {:?} call {} to {}", media_kind, session_id, target);

        if let Err(e) = self.media.acquire(media_kind).await {
            st.session = None;
            return Err(e.into());
        }

        if let Err(e) = self.media.create_peer_connection().await {
            self.media.release().await;
            st.session = None;
            return Err(e.into());
        }

        let offer = match self.media.create_offer(false).await {
            Ok(offer) => offer,
            Err(e) => {
                self.media.release().await;
                st.session = None;
                return Err(e.into());
            }
        };

        let message = SignalingMessage::offer(session_id.clone(), offer).with_target(target);
        if let Err(e) = self.signaling.send(message).await {
            self.media.release().await;
            self.set_status(&mut st, CallStatus::Failed);
            return Err(e.into());
        }

        st.awaiting_answer = true;
        self.set_status(&mut st, CallStatus::RingingOutbound);
        self.arm_ring_timer(&mut st, session_id);

        let Some(snapshot) = st.session.clone() else {
            return Err(SessionError::InvalidTransition(
                "session lost during setup".to_string(),
            ));
        };
        Ok(snapshot)
    }

    /// Registriert einen eingehenden Anruf (Invite-Signal)
    ///
    /// Eine bestehende nicht-terminale Session wird zuerst implizit
    /// beendet (last-incoming-wins).
    pub async fn handle_incoming(
        &self,
        session_id: impl Into<String>,
        caller: impl Into<String>,
        media_kind: MediaKind,
    ) {
        let session_id = session_id.into();
        let caller = caller.into();
        let mut st = self.state.lock().await;

        if let Some(existing) = st.session.clone() {
            if !existing.is_terminal() {
                // Erneut zugestelltes Invite derselben Session: No-op
                if existing.id == session_id {
                    tracing::debug!("Discarding duplicate invite for live session {}", session_id);
                    return;
                }
                tracing::info!(
                    "New incoming call {} replaces live session {}",
                    session_id,
                    existing.id
                );
                if existing.known_to_remote() {
                    if let Err(e) = self
                        .signaling
                        .send_control(OutboundControl::Hangup {
                            session_id: existing.id.clone(),
                        })
                        .await
                    {
                        tracing::warn!("Failed to hang up replaced session: {}", e);
                    }
                }
                self.media.release().await;
                self.set_status(&mut st, CallStatus::Ended);
                self.notify(&existing.id, NotificationEvent::Ended, existing.remote_participant());
            }
        }

        st.reset_negotiation();
        st.session = Some(CallSession::inbound(
            session_id.clone(),
            caller.clone(),
            self.local_participant.clone(),
            media_kind,
        ));

        tracing::info!("Incoming {:?} call {} from {}", media_kind, session_id, caller);

        let _ = self.event_tx.send(SessionEvent::StatusChanged {
            session_id: session_id.clone(),
            status: CallStatus::RingingInbound,
        });
        self.notify(&session_id, NotificationEvent::Incoming, &caller);
    }

    /// Nimmt einen eingehenden Anruf an
    ///
    /// Traf das Offer schon vor der Annahme ein, wird es sofort
    /// angewendet und mit einem Answer beantwortet; sonst wird die
    /// Annahme vermerkt und das Offer bei Eintreffen beantwortet.
    pub async fn accept(&self, session_id: &str) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;

        let (media_kind, valid) = match &st.session {
            Some(s) if s.id == session_id && s.status == CallStatus::RingingInbound => {
                (s.media_kind, !st.accepted)
            }
            _ => (MediaKind::Audio, false),
        };
        if !valid {
            return Err(SessionError::InvalidTransition(format!(
                "accept({}) requires an unaccepted ringing-inbound session",
                session_id
            )));
        }

        // Setup-Fehler lassen die Session im vorherigen Zustand
        self.media.acquire(media_kind).await?;
        if let Err(e) = self.media.create_peer_connection().await {
            self.media.release().await;
            return Err(e.into());
        }

        st.accepted = true;
        tracing::info!("Accepted call {}", session_id);

        if let Some(offer) = st.pending_offer.take() {
            self.answer_offer(&mut st, offer).await?;
        }

        Ok(())
    }

    /// Lehnt einen eingehenden Anruf ab
    pub async fn reject(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;

        let caller = match &st.session {
            Some(s) if s.id == session_id && s.status == CallStatus::RingingInbound => {
                s.caller.clone()
            }
            _ => {
                return Err(SessionError::InvalidTransition(format!(
                    "reject({}) requires a ringing-inbound session",
                    session_id
                )))
            }
        };

        if let Err(e) = self
            .signaling
            .send_control(OutboundControl::RejectCall {
                session_id: session_id.to_string(),
                reason,
            })
            .await
        {
            tracing::warn!("Failed to deliver reject: {}", e);
        }

        // Teilweise akquirierte Medien freigeben
        self.media.release().await;
        self.set_status(&mut st, CallStatus::Declined);
        self.notify(session_id, NotificationEvent::Declined, &caller);
        Ok(())
    }

    /// Beendet die aktuelle Session
    ///
    /// Gültig aus jedem nicht-terminalen Zustand. Die Gegenseite wird
    /// benachrichtigt wenn sie die Session bereits kennt.
    pub async fn end(&self, session_id: Option<&str>) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if !s.is_terminal() => s.clone(),
            _ => {
                return Err(SessionError::InvalidTransition(
                    "end() requires a live session".to_string(),
                ))
            }
        };
        if let Some(id) = session_id {
            if id != session.id {
                return Err(SessionError::InvalidTransition(format!(
                    "end({}) does not match live session {}",
                    id, session.id
                )));
            }
        }

        if session.known_to_remote() {
            if let Err(e) = self
                .signaling
                .send_control(OutboundControl::Hangup {
                    session_id: session.id.clone(),
                })
                .await
            {
                tracing::warn!("Failed to deliver hangup: {}", e);
            }
        }

        self.media.release().await;
        self.set_status(&mut st, CallStatus::Ended);
        self.notify(&session.id, NotificationEvent::Ended, session.remote_participant());
        Ok(())
    }

    /// Verarbeitet eine eingehende Signaling-Nachricht
    ///
    /// Duplikate und Nachrichten für terminale/fremde Sessions werden
    /// verworfen, nie als Fehler gemeldet.
    pub async fn on_signaling(&self, message: SignalingMessage) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if !s.is_terminal() => s.clone(),
            _ => {
                tracing::debug!(
                    "Discarding {} for absent/terminal session {}",
                    message.payload.kind(),
                    message.session_id
                );
                return Ok(());
            }
        };
        if message.session_id != session.id {
            tracing::debug!(
                "Discarding {} for unknown session {}",
                message.payload.kind(),
                message.session_id
            );
            return Ok(());
        }

        match message.payload {
            SignalingPayload::Offer(offer) => self.handle_offer(&mut st, &session, offer).await,
            SignalingPayload::Answer(answer) => self.handle_answer(&mut st, &session, answer).await,
            SignalingPayload::IceCandidate(candidate) => {
                if st.remote_description_set {
                    if let Err(e) = self.media.apply_ice_candidate(candidate).await {
                        tracing::warn!("Failed to apply ICE candidate: {}", e);
                    }
                } else {
                    st.candidates.enqueue(candidate);
                    tracing::debug!(
                        "Buffered ICE candidate ({} pending)",
                        st.candidates.len()
                    );
                }
                Ok(())
            }
        }
    }

    /// Dispatcht ein beliebiges eingehendes Signal
    pub async fn handle_inbound(&self, signal: InboundSignal) -> Result<(), SessionError> {
        match signal {
            InboundSignal::Invite {
                session_id,
                caller,
                media_kind,
            } => {
                self.handle_incoming(session_id, caller, media_kind).await;
                Ok(())
            }
            InboundSignal::Message(message) => self.on_signaling(message).await,
            InboundSignal::Rejected { session_id, reason } => {
                self.handle_remote_rejected(&session_id, reason).await;
                Ok(())
            }
            InboundSignal::Ended { session_id } => {
                self.handle_remote_ended(&session_id).await;
                Ok(())
            }
            InboundSignal::Pong => Ok(()),
        }
    }

    // ========================================================================
    // SUPERVISOR HOOKS
    // ========================================================================

    /// Stößt einen ICE-Restart an (nur Initiator, nur Active)
    ///
    /// Der Responder wartet passiv auf das Ersatz-Offer der Gegenseite.
    pub async fn ice_restart(&self) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if s.status == CallStatus::Active && s.is_initiator() => s.clone(),
            _ => {
                return Err(SessionError::InvalidTransition(
                    "ice restart requires an active initiator session".to_string(),
                ))
            }
        };

        tracing::info!("Issuing ICE restart offer for {}", session.id);
        let offer = self.media.create_offer(true).await?;
        let message = SignalingMessage::offer(session.id.clone(), offer)
            .with_target(session.remote_participant().to_string());

        if let Err(e) = self.signaling.send(message).await {
            // Signaling-Ausfall mitten im Anruf ist session-fatal
            self.fail_session(&mut st, &session.id, &e.to_string()).await;
            return Err(e.into());
        }

        st.awaiting_answer = true;
        Ok(())
    }

    /// Erzwingt das Ende der Session (z.B. `ConnectionUnrecoverable`)
    pub async fn force_end(&self, reason: &str) {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if !s.is_terminal() => s.clone(),
            _ => return,
        };

        tracing::warn!("Force-ending session {}: {}", session.id, reason);
        self.media.release().await;
        self.set_status(&mut st, CallStatus::Ended);
        let _ = self.event_tx.send(SessionEvent::SessionFailed {
            session_id: session.id.clone(),
            error: reason.to_string(),
        });
        self.notify(&session.id, NotificationEvent::Ended, session.remote_participant());
    }

    // ========================================================================
    // MEDIA CONTROLS (Durchreiche an die Media-Schicht)
    // ========================================================================

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.media.set_audio_enabled(enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.media.set_video_enabled(enabled)
    }

    pub fn set_speaker_routing(&self, speaker: bool) {
        self.media.set_speaker_routing(speaker)
    }

    // ========================================================================
    // PRIVATE: SIGNALING HANDLERS
    // ========================================================================

    async fn handle_offer(
        &self,
        st: &mut EngineState,
        session: &CallSession,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        if session.is_initiator() {
            tracing::debug!("Discarding offer on initiator session {}", session.id);
            return Ok(());
        }

        if session.status == CallStatus::Active {
            // ICE-Restart-Offer der Gegenseite: anwenden und beantworten
            tracing::info!("Applying ICE restart offer for {}", session.id);
            if let Err(e) = self.media.apply_remote_description(offer).await {
                self.fail_session(st, &session.id, &e.to_string()).await;
                return Err(e.into());
            }
            let answer = match self.media.create_answer().await {
                Ok(answer) => answer,
                Err(e) => {
                    self.fail_session(st, &session.id, &e.to_string()).await;
                    return Err(e.into());
                }
            };
            let message = SignalingMessage::answer(session.id.clone(), answer)
                .with_target(session.remote_participant().to_string());
            if let Err(e) = self.signaling.send(message).await {
                self.fail_session(st, &session.id, &e.to_string()).await;
                return Err(e.into());
            }
            return Ok(());
        }

        if st.remote_description_set || st.pending_offer.is_some() {
            tracing::debug!("Discarding duplicate offer for {}", session.id);
            return Ok(());
        }

        if st.accepted {
            // Annahme war zuerst da: sofort beantworten
            self.answer_offer(st, offer).await
        } else {
            // Offer vor Annahme: bis zum accept() aufheben
            st.pending_offer = Some(offer);
            tracing::debug!("Buffered offer for unaccepted session {}", session.id);
            Ok(())
        }
    }

    async fn handle_answer(
        &self,
        st: &mut EngineState,
        session: &CallSession,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        if !session.is_initiator() || !st.awaiting_answer {
            tracing::debug!("Discarding unexpected answer for {}", session.id);
            return Ok(());
        }

        st.awaiting_answer = false;
        if let Err(e) = self.media.apply_remote_description(answer).await {
            self.fail_session(st, &session.id, &e.to_string()).await;
            return Err(e.into());
        }

        if !st.remote_description_set {
            st.remote_description_set = true;
            self.flush_candidates(st).await;
        }

        if session.status == CallStatus::RingingOutbound {
            if let Some(timer) = st.ring_timer.take() {
                timer.abort();
            }
            self.set_status(st, CallStatus::Active);
            self.notify(&session.id, NotificationEvent::Accepted, session.remote_participant());
        }

        Ok(())
    }

    /// Wendet ein Offer an, flusht den Puffer und schickt genau ein Answer
    async fn answer_offer(
        &self,
        st: &mut EngineState,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        let session = match &st.session {
            Some(s) => s.clone(),
            None => return Ok(()),
        };

        if let Err(e) = self.media.apply_remote_description(offer).await {
            self.fail_session(st, &session.id, &e.to_string()).await;
            return Err(e.into());
        }
        st.remote_description_set = true;

        let answer = match self.media.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_session(st, &session.id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let message = SignalingMessage::answer(session.id.clone(), answer)
            .with_target(session.remote_participant().to_string());
        if let Err(e) = self.signaling.send(message).await {
            self.fail_session(st, &session.id, &e.to_string()).await;
            return Err(e.into());
        }

        // Erst nach dem Answer die gepufferten Candidates abspielen
        self.flush_candidates(st).await;

        self.set_status(st, CallStatus::Active);
        self.notify(&session.id, NotificationEvent::Accepted, session.remote_participant());
        Ok(())
    }

    /// Spielt gepufferte Candidates genau einmal in Empfangsreihenfolge ab
    async fn flush_candidates(&self, st: &mut EngineState) {
        let candidates = st.candidates.flush();
        if candidates.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} buffered ICE candidates", candidates.len());
        for candidate in candidates {
            if let Err(e) = self.media.apply_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // PRIVATE: REMOTE CONTROL SIGNALS
    // ========================================================================

    async fn handle_remote_rejected(&self, session_id: &str, reason: Option<String>) {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if s.id == session_id && !s.is_terminal() => s.clone(),
            _ => {
                tracing::debug!("Discarding reject for session {}", session_id);
                return;
            }
        };

        tracing::info!("Call {} rejected by remote (reason: {:?})", session_id, reason);
        self.media.release().await;
        self.set_status(&mut st, CallStatus::Declined);
        self.notify(session_id, NotificationEvent::Declined, session.remote_participant());
    }

    async fn handle_remote_ended(&self, session_id: &str) {
        let mut st = self.state.lock().await;

        let session = match &st.session {
            Some(s) if s.id == session_id && !s.is_terminal() => s.clone(),
            _ => {
                tracing::debug!("Discarding hangup for session {}", session_id);
                return;
            }
        };

        tracing::info!("Call {} ended by remote", session_id);
        self.media.release().await;
        self.set_status(&mut st, CallStatus::Ended);
        self.notify(session_id, NotificationEvent::Ended, session.remote_participant());
    }

    // ========================================================================
    // PRIVATE: HELPERS
    // ========================================================================

    /// Fataler Fehler während des Anrufs: Session direkt nach Failed
    async fn fail_session(&self, st: &mut EngineState, session_id: &str, error: &str) {
        tracing::error!("Session {} failed: {}", session_id, error);
        self.media.release().await;
        let participant = st
            .session
            .as_ref()
            .map(|s| s.remote_participant().to_string())
            .unwrap_or_default();
        self.set_status(st, CallStatus::Failed);
        let _ = self.event_tx.send(SessionEvent::SessionFailed {
            session_id: session_id.to_string(),
            error: error.to_string(),
        });
        self.notify(session_id, NotificationEvent::Ended, &participant);
    }

    /// Validierter Statuswechsel samt Event-Broadcast
    fn set_status(&self, st: &mut EngineState, status: CallStatus) {
        if let Some(timer) = st.ring_timer.take() {
            if status != CallStatus::RingingOutbound {
                timer.abort();
            } else {
                st.ring_timer = Some(timer);
            }
        }

        let Some(session) = st.session.as_mut() else {
            return;
        };
        let session_id = session.id.clone();
        if !session.transition(status) {
            // Interne Aufrufer prüfen vorab; das hier wäre ein Bug
            tracing::error!(
                "Rejected invalid transition {:?} -> {:?} for {}",
                session.status,
                status,
                session_id
            );
            return;
        }
        let _ = self.event_tx.send(SessionEvent::StatusChanged {
            session_id,
            status,
        });
    }

    fn notify(&self, session_id: &str, event: NotificationEvent, participant: &str) {
        self.notifications.notify(CallNotification {
            session_id: session_id.to_string(),
            event,
            participant: participant.to_string(),
        });
    }

    /// Startet den Klingel-Timeout für eine ausgehende Session
    fn arm_ring_timer(self: &Arc<Self>, st: &mut EngineState, session_id: String) {
        let engine = Arc::clone(self);
        let timeout = self.ringing_timeout;
        st.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.ring_timeout(&session_id).await;
        }));
    }

    /// Klingel-Timeout abgelaufen: Session scheitert, Medien werden frei
    async fn ring_timeout(&self, session_id: &str) {
        let mut st = self.state.lock().await;

        let still_ringing = matches!(
            &st.session,
            Some(s) if s.id == session_id && s.status == CallStatus::RingingOutbound
        );
        if !still_ringing {
            return;
        }

        tracing::info!("Ringing timeout for session {}", session_id);
        st.ring_timer = None;
        self.fail_session(&mut st, session_id, "ringing timeout").await;
    }
}

impl std::fmt::Debug for CallSessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionEngine")
            .field("local_participant", &self.local_participant)
            .field("ringing_timeout", &self.ringing_timeout)
            .finish()
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::media::{ConnectionHealth, MediaEvent};
    use crate::signaling::IceCandidate;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Media-Schicht für Tests: zeichnet alle Aufrufe auf
    pub struct MockMedia {
        pub fail_acquire: AtomicBool,
        pub acquired: AtomicBool,
        pub released: AtomicU32,
        pub offers_created: SyncMutex<Vec<bool>>,
        pub answers_created: AtomicU32,
        pub remote_descriptions: SyncMutex<Vec<SessionDescription>>,
        pub applied_candidates: SyncMutex<Vec<IceCandidate>>,
        pub health: SyncMutex<ConnectionHealth>,
        pub event_tx: broadcast::Sender<MediaEvent>,
    }

    impl MockMedia {
        pub fn new() -> Self {
            let (event_tx, _) = broadcast::channel(100);
            Self {
                fail_acquire: AtomicBool::new(false),
                acquired: AtomicBool::new(false),
                released: AtomicU32::new(0),
                offers_created: SyncMutex::new(Vec::new()),
                answers_created: AtomicU32::new(0),
                remote_descriptions: SyncMutex::new(Vec::new()),
                applied_candidates: SyncMutex::new(Vec::new()),
                health: SyncMutex::new(ConnectionHealth::New),
                event_tx,
            }
        }

        pub fn push_health(&self, health: ConnectionHealth) {
            *self.health.lock() = health;
            let _ = self.event_tx.send(MediaEvent::HealthChanged(health));
        }

        pub fn candidate_order(&self) -> Vec<String> {
            self.applied_candidates
                .lock()
                .iter()
                .map(|c| c.candidate.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl MediaController for MockMedia {
        async fn acquire(&self, _kind: MediaKind) -> Result<(), MediaError> {
            if self.fail_acquire.load(Ordering::SeqCst) {
                return Err(MediaError::DeviceUnavailable(
                    crate::media::DeviceError::NoInputDevice,
                ));
            }
            self.acquired.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn create_peer_connection(&self) -> Result<(), MediaError> {
            Ok(())
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
            let mut offers = self.offers_created.lock();
            offers.push(ice_restart);
            Ok(SessionDescription::offer(format!("offer-{}", offers.len())))
        }

        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            let n = self.answers_created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescription::answer(format!("answer-{}", n + 1)))
        }

        async fn apply_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), MediaError> {
            self.remote_descriptions.lock().push(desc);
            Ok(())
        }

        async fn apply_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            self.applied_candidates.lock().push(candidate);
            Ok(())
        }

        async fn release(&self) {
            self.acquired.store(false, Ordering::SeqCst);
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_health(&self) -> ConnectionHealth {
            *self.health.lock()
        }

        fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
            self.event_tx.subscribe()
        }

        fn set_audio_enabled(&self, enabled: bool) -> bool {
            self.acquired.load(Ordering::SeqCst) && enabled
        }

        fn set_video_enabled(&self, _enabled: bool) -> bool {
            false
        }

        fn set_speaker_routing(&self, _speaker: bool) {}
    }

    /// Signaling-Sender für Tests
    pub struct MockSignaling {
        pub fail_sends: AtomicBool,
        pub sent: SyncMutex<Vec<SignalingMessage>>,
        pub controls: SyncMutex<Vec<OutboundControl>>,
    }

    impl MockSignaling {
        pub fn new() -> Self {
            Self {
                fail_sends: AtomicBool::new(false),
                sent: SyncMutex::new(Vec::new()),
                controls: SyncMutex::new(Vec::new()),
            }
        }

        pub fn sent_answers(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|m| matches!(m.payload, SignalingPayload::Answer(_)))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl SignalingSender for MockSignaling {
        async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::DeliveryFailed("mock".to_string()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        async fn send_control(&self, control: OutboundControl) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::DeliveryFailed("mock".to_string()));
            }
            self.controls.lock().push(control);
            Ok(())
        }
    }

    /// Notification Sink für Tests
    #[derive(Default)]
    pub struct RecordingSink {
        pub notifications: SyncMutex<Vec<CallNotification>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, notification: CallNotification) {
            self.notifications.lock().push(notification);
        }
    }

    pub struct Harness {
        pub engine: Arc<CallSessionEngine>,
        pub media: Arc<MockMedia>,
        pub signaling: Arc<MockSignaling>,
        pub sink: Arc<RecordingSink>,
    }

    pub fn harness_with_timeout(ringing_timeout: Duration) -> Harness {
        let media = Arc::new(MockMedia::new());
        let signaling = Arc::new(MockSignaling::new());
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(CallSessionEngine::new(
            "me".to_string(),
            Arc::clone(&media) as Arc<dyn MediaController>,
            Arc::clone(&signaling) as Arc<dyn SignalingSender>,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            ringing_timeout,
        ));
        Harness {
            engine,
            media,
            signaling,
            sink,
        }
    }

    pub fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(45))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::signaling::IceCandidate;
    use std::sync::atomic::Ordering;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_scenario_a_outbound_call_lifecycle() {
        let h = harness();

        let session = h.engine.initiate("user-7", MediaKind::Video).await.unwrap();
        assert_eq!(session.status, CallStatus::RingingOutbound);
        assert_eq!(session.receiver, "user-7");
        assert!(session.is_initiator());

        // Genau ein Offer raus
        let sent = h.signaling.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].payload, SignalingPayload::Offer(_)));
        assert_eq!(sent[0].to_participant.as_deref(), Some("user-7"));

        // Answer kommt an -> Active
        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("remote-answer"),
            ))
            .await
            .unwrap();
        let live = h.engine.session().await.unwrap();
        assert_eq!(live.status, CallStatus::Active);
        assert!(live.answered_at.is_some());

        // Auflegen -> Ended, Hangup raus, Medien frei
        h.engine.end(None).await.unwrap();
        let done = h.engine.session().await.unwrap();
        assert_eq!(done.status, CallStatus::Ended);
        assert!(h
            .signaling
            .controls
            .lock()
            .iter()
            .any(|c| matches!(c, OutboundControl::Hangup { .. })));
        assert!(!h.media.acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_initiate_while_live_fails_without_mutation() {
        let h = harness();
        let first = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        let err = h.engine.initiate("user-8", MediaKind::Audio).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyInCall));

        // Bestehende Session bleibt unberührt
        let live = h.engine.session().await.unwrap();
        assert_eq!(live.id, first.id);
        assert_eq!(live.status, CallStatus::RingingOutbound);
        assert_eq!(h.signaling.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_device_unavailable_aborts_initiate() {
        let h = harness();
        h.media.fail_acquire.store(true, Ordering::SeqCst);

        let err = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));
        assert!(h.engine.session().await.is_none());
        assert!(h.signaling.sent.lock().is_empty());

        // Danach ist ein frischer Versuch möglich
        h.media.fail_acquire.store(false, Ordering::SeqCst);
        h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_failure_is_session_fatal() {
        let h = harness();
        h.signaling.fail_sends.store(true, Ordering::SeqCst);

        let err = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap_err();
        assert!(matches!(err, SessionError::SignalingDeliveryFailed(_)));
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Failed);
        assert!(!h.media.acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scenario_b_offer_before_accept() {
        let h = harness();
        h.engine.handle_incoming("sess-1", "user-3", MediaKind::Audio).await;

        // Offer trifft vor der Annahme ein
        h.engine
            .on_signaling(SignalingMessage::offer(
                "sess-1",
                SessionDescription::offer("remote-offer"),
            ))
            .await
            .unwrap();

        // Zwei Candidates landen im Puffer (noch keine Remote Description)
        h.engine
            .on_signaling(SignalingMessage::ice_candidate("sess-1", candidate(1)))
            .await
            .unwrap();
        h.engine
            .on_signaling(SignalingMessage::ice_candidate("sess-1", candidate(2)))
            .await
            .unwrap();
        assert!(h.media.candidate_order().is_empty());

        h.engine.accept("sess-1").await.unwrap();

        // Gepuffertes Offer angewendet, genau ein Answer raus
        assert_eq!(h.media.remote_descriptions.lock().len(), 1);
        assert_eq!(h.signaling.sent_answers(), 1);
        // Candidates in Empfangsreihenfolge geflusht
        assert_eq!(h.media.candidate_order(), vec!["candidate:1", "candidate:2"]);
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_accept_before_offer_sends_exactly_one_answer() {
        let h = harness();
        h.engine.handle_incoming("sess-1", "user-3", MediaKind::Audio).await;

        // Annahme vor dem Offer: Session klingelt weiter, kein Answer
        h.engine.accept("sess-1").await.unwrap();
        assert_eq!(h.signaling.sent_answers(), 0);
        assert_eq!(
            h.engine.session().await.unwrap().status,
            CallStatus::RingingInbound
        );

        // Offer trifft ein -> genau ein Answer, Session aktiv
        h.engine
            .on_signaling(SignalingMessage::offer(
                "sess-1",
                SessionDescription::offer("remote-offer"),
            ))
            .await
            .unwrap();
        assert_eq!(h.signaling.sent_answers(), 1);
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);

        // Dupliziertes Offer wird verworfen, kein zweites Answer
        h.engine
            .on_signaling(SignalingMessage::offer(
                "sess-1",
                SessionDescription::offer("remote-offer"),
            ))
            .await
            .unwrap();
        assert_eq!(h.signaling.sent_answers(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_discarded() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("a1"),
            ))
            .await
            .unwrap();
        assert_eq!(h.media.remote_descriptions.lock().len(), 1);

        // Zweites Answer: No-op, keine zweite Anwendung
        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("a2"),
            ))
            .await
            .unwrap();
        assert_eq!(h.media.remote_descriptions.lock().len(), 1);
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_candidates_never_applied_before_remote_description() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        h.engine
            .on_signaling(SignalingMessage::ice_candidate(session.id.clone(), candidate(1)))
            .await
            .unwrap();
        h.engine
            .on_signaling(SignalingMessage::ice_candidate(session.id.clone(), candidate(2)))
            .await
            .unwrap();
        assert!(h.media.candidate_order().is_empty());

        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("a"),
            ))
            .await
            .unwrap();

        // Nach der Remote Description: Puffer in Reihenfolge, dann direkt
        h.engine
            .on_signaling(SignalingMessage::ice_candidate(session.id.clone(), candidate(3)))
            .await
            .unwrap();
        assert_eq!(
            h.media.candidate_order(),
            vec!["candidate:1", "candidate:2", "candidate:3"]
        );
    }

    #[tokio::test]
    async fn test_reject_declines_and_notifies_remote() {
        let h = harness();
        h.engine.handle_incoming("sess-1", "user-3", MediaKind::Audio).await;

        h.engine.reject("sess-1", Some("busy".to_string())).await.unwrap();

        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Declined);
        assert!(h.signaling.controls.lock().iter().any(|c| matches!(
            c,
            OutboundControl::RejectCall { session_id, .. } if session_id == "sess-1"
        )));
        assert!(h
            .sink
            .notifications
            .lock()
            .iter()
            .any(|n| n.event == NotificationEvent::Declined));
    }

    #[tokio::test]
    async fn test_accept_on_outbound_session_is_invalid() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        let err = h.engine.accept(&session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        assert_eq!(
            h.engine.session().await.unwrap().status,
            CallStatus::RingingOutbound
        );
    }

    #[tokio::test]
    async fn test_last_incoming_wins_replaces_live_session() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();
        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("a"),
            ))
            .await
            .unwrap();
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);

        // Neuer eingehender Anruf verdrängt die aktive Session
        h.engine.handle_incoming("sess-2", "user-3", MediaKind::Audio).await;

        let live = h.engine.session().await.unwrap();
        assert_eq!(live.id, "sess-2");
        assert_eq!(live.status, CallStatus::RingingInbound);
        // Alte Session wurde per Hangup beendet
        assert!(h.signaling.controls.lock().iter().any(|c| matches!(
            c,
            OutboundControl::Hangup { session_id } if *session_id == session.id
        )));
    }

    #[tokio::test]
    async fn test_duplicate_invite_for_live_session_is_noop() {
        let h = harness();
        h.engine.handle_incoming("sess-1", "user-3", MediaKind::Audio).await;
        h.engine
            .on_signaling(SignalingMessage::offer(
                "sess-1",
                SessionDescription::offer("remote-offer"),
            ))
            .await
            .unwrap();

        // Doppelt zugestelltes Invite darf die Verhandlung nicht zurücksetzen
        h.engine.handle_incoming("sess-1", "user-3", MediaKind::Audio).await;

        // Kein Hangup an die Gegenseite, keine zweite Incoming-Notification
        assert!(h.signaling.controls.lock().is_empty());
        assert_eq!(
            h.sink
                .notifications
                .lock()
                .iter()
                .filter(|n| n.event == NotificationEvent::Incoming)
                .count(),
            1
        );

        // Das gepufferte Offer überlebt: accept liefert genau ein Answer
        h.engine.accept("sess-1").await.unwrap();
        assert_eq!(h.signaling.sent_answers(), 1);
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_post_terminal_signaling_is_discarded() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();
        h.engine.end(None).await.unwrap();

        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("late"),
            ))
            .await
            .unwrap();
        h.engine
            .on_signaling(SignalingMessage::ice_candidate(session.id.clone(), candidate(9)))
            .await
            .unwrap();

        assert!(h.media.remote_descriptions.lock().is_empty());
        assert!(h.media.candidate_order().is_empty());
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_ringing_timeout_fails_session_and_releases_media() {
        let h = harness_with_timeout(Duration::from_millis(30));
        h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let session = h.engine.session().await.unwrap();
        assert_eq!(session.status, CallStatus::Failed);
        // Keine Geräte-Handles mehr akquiriert
        assert!(!h.media.acquired.load(Ordering::SeqCst));

        // Danach ist ein frischer Anruf möglich
        let fresh = h.engine.initiate("user-8", MediaKind::Audio).await.unwrap();
        assert_eq!(fresh.status, CallStatus::RingingOutbound);
    }

    #[tokio::test]
    async fn test_remote_hangup_ends_session() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        h.engine
            .handle_inbound(InboundSignal::Ended {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Ended);
        assert!(!h.media.acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_remote_reject_declines_outbound_call() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();

        h.engine
            .handle_inbound(InboundSignal::Rejected {
                session_id: session.id.clone(),
                reason: Some("busy".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Declined);
    }

    #[tokio::test]
    async fn test_ice_restart_reoffers_with_flag() {
        let h = harness();
        let session = h.engine.initiate("user-7", MediaKind::Audio).await.unwrap();
        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("a"),
            ))
            .await
            .unwrap();

        h.engine.ice_restart().await.unwrap();

        let offers = h.media.offers_created.lock().clone();
        assert_eq!(offers, vec![false, true]);
        // Restart-Answer wird wieder erwartet und angewendet
        h.engine
            .on_signaling(SignalingMessage::answer(
                session.id.clone(),
                SessionDescription::answer("restart-answer"),
            ))
            .await
            .unwrap();
        assert_eq!(h.media.remote_descriptions.lock().len(), 2);
        assert_eq!(h.engine.session().await.unwrap().status, CallStatus::Active);
    }
}
