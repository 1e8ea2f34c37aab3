//! Call Session - Aggregat eines Anrufversuchs
//!
//! Genau eine nicht-terminale Session pro Prozess; der Status ist eine
//! einzige Enumeration, abgeleitete Prädikate werden berechnet und nie
//! redundant als Flags gespeichert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// MEDIA KIND / ROLE
// ============================================================================

/// Art des Anrufs: nur Audio oder Audio+Video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

/// Rolle in der Session - fest für die gesamte Lebensdauer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Initiator,
    Responder,
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Lebenszyklus-Status einer Session
///
/// "Idle" existiert nicht als Status: kein Session-Objekt heißt idle.
/// Terminale Status sind `Ended`, `Declined` und `Failed`; eine Session
/// wechselt niemals rückwärts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Lokal initiiert, Offer noch nicht verschickt
    Requesting,
    /// Offer verschickt, wartet auf Answer/Ablehnung
    RingingOutbound,
    /// Invite empfangen, wartet auf lokale Annahme/Ablehnung
    RingingInbound,
    /// Medienverbindung ausgehandelt
    Active,
    /// Regulär beendet
    Ended,
    /// Abgelehnt (lokal oder von der Gegenseite)
    Declined,
    /// Timeout oder fataler Fehler
    Failed,
}

impl CallStatus {
    /// Terminale Status erlauben keine weiteren Übergänge
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Declined | CallStatus::Failed
        )
    }

    /// Prüft ob der Übergang `self -> to` im Lebenszyklus erlaubt ist
    pub fn can_transition(&self, to: CallStatus) -> bool {
        use CallStatus::*;
        match (self, to) {
            (Requesting, RingingOutbound) => true,
            (Requesting, Failed) | (Requesting, Ended) => true,
            (RingingOutbound, Active) => true,
            (RingingOutbound, Declined) | (RingingOutbound, Failed) | (RingingOutbound, Ended) => {
                true
            }
            (RingingInbound, Active) => true,
            (RingingInbound, Declined) | (RingingInbound, Failed) | (RingingInbound, Ended) => true,
            (Active, Ended) | (Active, Failed) => true,
            _ => false,
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Aggregat-Wurzel eines Anrufversuchs
///
/// Wird von der State Machine erzeugt (bei `initiate` oder eingehendem
/// Invite) und bei terminalem Übergang nicht mehr verändert.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Opaque Session-ID (bei ausgehenden Anrufen lokal vergeben,
    /// bei eingehenden aus dem Invite übernommen)
    pub id: String,
    /// Identität des Anrufers
    pub caller: String,
    /// Identität des Angerufenen bzw. der Konversation
    pub receiver: String,
    /// Audio oder Audio+Video
    pub media_kind: MediaKind,
    /// Initiator oder Responder
    pub role: CallRole,
    /// Aktueller Lebenszyklus-Status
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Erzeugt eine ausgehende Session in `Requesting`
    pub fn outbound(id: String, caller: String, receiver: String, media_kind: MediaKind) -> Self {
        Self {
            id,
            caller,
            receiver,
            media_kind,
            role: CallRole::Initiator,
            status: CallStatus::Requesting,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        }
    }

    /// Erzeugt eine eingehende Session in `RingingInbound`
    pub fn inbound(id: String, caller: String, receiver: String, media_kind: MediaKind) -> Self {
        Self {
            id,
            caller,
            receiver,
            media_kind,
            role: CallRole::Responder,
            status: CallStatus::RingingInbound,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Initiator
    }

    /// Die Gegenseite dieser Session
    pub fn remote_participant(&self) -> &str {
        match self.role {
            CallRole::Initiator => &self.receiver,
            CallRole::Responder => &self.caller,
        }
    }

    /// Weiß die Gegenseite bereits von dieser Session?
    ///
    /// Bei `Requesting` ist noch kein Offer raus; alles ab
    /// `RingingOutbound` (bzw. jede eingehende Session) ist der
    /// Gegenseite bekannt.
    pub fn known_to_remote(&self) -> bool {
        match self.role {
            CallRole::Initiator => !matches!(self.status, CallStatus::Requesting),
            CallRole::Responder => true,
        }
    }

    /// Führt einen validierten Statusübergang aus
    ///
    /// Rückwärts- und sonstige unerlaubte Übergänge liefern `false`
    /// und lassen die Session unverändert.
    pub fn transition(&mut self, to: CallStatus) -> bool {
        if !self.status.can_transition(to) {
            return false;
        }
        self.status = to;
        match to {
            CallStatus::Active => self.answered_at = Some(Utc::now()),
            CallStatus::Ended | CallStatus::Declined | CallStatus::Failed => {
                self.ended_at = Some(Utc::now())
            }
            _ => {}
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================
