//! Message Types für das Signaling-Protokoll
//!
//! Beide Kanäle (Request/Response und Push) transportieren denselben
//! logischen Umschlag: `{sessionId, kind, payload, toParticipant?}`.
//! Eingehende Frames werden hier an der Transport-Grenze streng
//! validiert - fehlerhafte Umschläge werden früh abgelehnt statt
//! stromabwärts mit Feld-Raten weitergereicht.

use crate::session::MediaKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MessageError {
    #[error("Malformed signaling envelope: {0}")]
    MalformedEnvelope(String),
}

// ============================================================================
// SIGNALING ENVELOPE
// ============================================================================

/// Eine Session-Beschreibung (SDP) aus einem Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Typ einer Session-Beschreibung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Ein ICE Candidate wie er über die Leitung geht
///
/// Mindestens eines von `sdp_mid`/`sdp_mline_index` muss vorhanden sein.
/// Fehlen beide, wird beim Normalisieren `sdp_mline_index = 0` gesetzt
/// statt den Candidate abzulehnen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Stellt sicher, dass mindestens ein SDP-Zuordnungs-Hinweis existiert
    pub fn normalized(mut self) -> Self {
        if self.sdp_mid.is_none() && self.sdp_mline_index.is_none() {
            self.sdp_mline_index = Some(0);
        }
        self
    }
}

/// Payload eines Signaling-Umschlags, getaggt über `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum SignalingPayload {
    #[serde(rename = "offer")]
    Offer(SessionDescription),
    #[serde(rename = "answer")]
    Answer(SessionDescription),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidate),
}

impl SignalingPayload {
    /// Kurzname der Nachrichten-Art, für Logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::Offer(_) => "offer",
            SignalingPayload::Answer(_) => "answer",
            SignalingPayload::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Der Signaling-Umschlag
///
/// Unveränderlich nach dem Senden; empfangene Nachrichten werden
/// höchstens einmal angewendet (Duplikate verwirft die State Machine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub payload: SignalingPayload,
    #[serde(rename = "toParticipant", skip_serializing_if = "Option::is_none")]
    pub to_participant: Option<String>,
}

impl SignalingMessage {
    pub fn offer(session_id: impl Into<String>, desc: SessionDescription) -> Self {
        Self {
            session_id: session_id.into(),
            payload: SignalingPayload::Offer(desc),
            to_participant: None,
        }
    }

    pub fn answer(session_id: impl Into<String>, desc: SessionDescription) -> Self {
        Self {
            session_id: session_id.into(),
            payload: SignalingPayload::Answer(desc),
            to_participant: None,
        }
    }

    pub fn ice_candidate(session_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Self {
            session_id: session_id.into(),
            payload: SignalingPayload::IceCandidate(candidate.normalized()),
            to_participant: None,
        }
    }

    pub fn with_target(mut self, participant: impl Into<String>) -> Self {
        self.to_participant = Some(participant.into());
        self
    }
}

// ============================================================================
// OUTBOUND CONTROL MESSAGES
// ============================================================================

/// Call-Control-Nachrichten an die Gegenseite (neben Offer/Answer/ICE)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundControl {
    /// Eingehenden Anruf ablehnen
    RejectCall {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Anruf beenden
    Hangup {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl OutboundControl {
    pub fn session_id(&self) -> &str {
        match self {
            OutboundControl::RejectCall { session_id, .. } => session_id,
            OutboundControl::Hangup { session_id } => session_id,
        }
    }
}

// ============================================================================
// INBOUND FRAMES
// ============================================================================

/// Alle Frames die über den Push-Kanal hereinkommen können
///
/// Signaling-Umschläge tragen `kind`, Call-Control-Frames tragen `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    /// Eingehender Anruf (Invite)
    Invite {
        session_id: String,
        caller: String,
        media_kind: MediaKind,
    },

    /// Signaling-Nachricht (Offer/Answer/ICE Candidate)
    Message(SignalingMessage),

    /// Gegenseite hat abgelehnt
    Rejected {
        session_id: String,
        reason: Option<String>,
    },

    /// Gegenseite hat aufgelegt
    Ended { session_id: String },

    /// Keepalive-Antwort des Servers
    Pong,
}

/// Wire-Repräsentation der Call-Control-Frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    IncomingCall {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "fromParticipant")]
        caller: String,
        #[serde(rename = "mediaKind")]
        media_kind: MediaKind,
    },

    CallRejected {
        #[serde(rename = "sessionId")]
        session_id: String,
        reason: Option<String>,
    },

    CallEnded {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    Pong {},
}

/// Parst einen rohen Text-Frame in ein `InboundSignal`
///
/// Frames mit `kind`-Feld sind Signaling-Umschläge, Frames mit
/// `type`-Feld sind Call-Control. Alles andere ist ein Protokollfehler.
pub fn parse_inbound(text: &str) -> Result<InboundSignal, MessageError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| MessageError::MalformedEnvelope(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| MessageError::MalformedEnvelope("not a JSON object".to_string()))?;

    if obj.contains_key("kind") {
        let mut msg: SignalingMessage = serde_json::from_value(value)
            .map_err(|e| MessageError::MalformedEnvelope(e.to_string()))?;
        if let SignalingPayload::IceCandidate(candidate) = msg.payload {
            msg.payload = SignalingPayload::IceCandidate(candidate.normalized());
        }
        return Ok(InboundSignal::Message(msg));
    }

    let frame: ControlFrame = serde_json::from_value(value)
        .map_err(|e| MessageError::MalformedEnvelope(e.to_string()))?;

    Ok(match frame {
        ControlFrame::IncomingCall {
            session_id,
            caller,
            media_kind,
        } => InboundSignal::Invite {
            session_id,
            caller,
            media_kind,
        },
        ControlFrame::CallRejected { session_id, reason } => {
            InboundSignal::Rejected { session_id, reason }
        }
        ControlFrame::CallEnded { session_id } => InboundSignal::Ended { session_id },
        ControlFrame::Pong {} => InboundSignal::Pong,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer_envelope() {
        let text = r#"{
            "sessionId": "sess-1",
            "kind": "offer",
            "payload": { "type": "offer", "sdp": "v=0..." }
        }"#;

        let signal = parse_inbound(text).unwrap();
        match signal {
            InboundSignal::Message(msg) => {
                assert_eq!(msg.session_id, "sess-1");
                assert_eq!(
                    msg.payload,
                    SignalingPayload::Offer(SessionDescription::offer("v=0..."))
                );
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ice_candidate_without_hints_defaults_mline_index() {
        let text = r#"{
            "sessionId": "sess-1",
            "kind": "ice-candidate",
            "payload": { "candidate": "candidate:1 1 udp ..." }
        }"#;

        let signal = parse_inbound(text).unwrap();
        match signal {
            InboundSignal::Message(SignalingMessage {
                payload: SignalingPayload::IceCandidate(candidate),
                ..
            }) => {
                // Ohne sdpMid/sdpMLineIndex muss der sichere Default greifen
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.sdp_mid, None);
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ice_candidate_keeps_existing_hints() {
        let text = r#"{
            "sessionId": "sess-1",
            "kind": "ice-candidate",
            "payload": { "candidate": "candidate:1", "sdpMid": "0" }
        }"#;

        let signal = parse_inbound(text).unwrap();
        match signal {
            InboundSignal::Message(SignalingMessage {
                payload: SignalingPayload::IceCandidate(candidate),
                ..
            }) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, None);
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_envelope_is_rejected() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"kind": "bogus", "sessionId": "x"}"#).is_err());
        assert!(parse_inbound(r#"{"sessionId": "x"}"#).is_err());
        // Offer ohne SDP-Payload darf nicht durchrutschen
        assert!(parse_inbound(r#"{"sessionId": "x", "kind": "offer"}"#).is_err());
    }

    #[test]
    fn test_parse_incoming_call_frame() {
        let text = r#"{
            "type": "incoming_call",
            "sessionId": "sess-9",
            "fromParticipant": "user-3",
            "mediaKind": "audio"
        }"#;

        let signal = parse_inbound(text).unwrap();
        assert_eq!(
            signal,
            InboundSignal::Invite {
                session_id: "sess-9".to_string(),
                caller: "user-3".to_string(),
                media_kind: MediaKind::Audio,
            }
        );
    }

    #[test]
    fn test_outbound_envelope_serialization() {
        let msg = SignalingMessage::answer("sess-2", SessionDescription::answer("v=0..."))
            .with_target("user-7");

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sessionId"], "sess-2");
        assert_eq!(value["kind"], "answer");
        assert_eq!(value["payload"]["type"], "answer");
        assert_eq!(value["toParticipant"], "user-7");
    }

    #[test]
    fn test_outbound_control_serialization() {
        let reject = OutboundControl::RejectCall {
            session_id: "sess-3".to_string(),
            reason: Some("busy".to_string()),
        };

        let value = serde_json::to_value(&reject).unwrap();
        assert_eq!(value["type"], "reject_call");
        assert_eq!(value["sessionId"], "sess-3");
        assert_eq!(value["reason"], "busy");
    }
}
