//! Signaling Module - Nachrichtenaustausch mit der Gegenseite
//!
//! Dieses Modul verwaltet die Kommunikation über beide Kanäle:
//! - Typisierte Umschläge parsen und validieren
//! - Request/Response-Kanal mit Push-Fallback
//! - Eingehende Frames an den registrierten Handler weiterleiten
//!

mod messages;
mod transport;

pub use messages::{
    parse_inbound, IceCandidate, InboundSignal, MessageError, OutboundControl, SdpType,
    SessionDescription, SignalingMessage, SignalingPayload,
};
pub use transport::{
    HttpRequestChannel, PushChannel, RequestChannel, SignalingSender, SignalingTransport,
    TransportError, WebSocketPushChannel,
};
