//! Session Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul bündelt:
//! - Die Call Session State Machine (Übergänge, Offer/Answer-Rennen)
//! - Den ICE-Candidate-Puffer für frühe Candidates
//! - Den Reconnection Supervisor (ICE-Restart, Abbruchkriterium)
//! - Die Notification-Brücke zur Benutzeroberfläche

mod buffer;
mod engine;
mod notify;
mod reconnect;
mod state;

pub use buffer::IceCandidateBuffer;
pub use engine::{CallSessionEngine, SessionError, SessionEvent};
pub use notify::{CallNotification, NotificationEvent, NotificationSink, NullNotificationSink};
pub use reconnect::ReconnectionSupervisor;
pub use state::{CallRole, CallSession, CallStatus, MediaKind};
