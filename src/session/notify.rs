//! Call Notification Bridge
//!
//! Grenze zum Präsentations-Layer (Klingel-UI, Ton, Vibration).
//! Die Engine feuert Ereignisse und blockiert nie auf deren
//! Verarbeitung; Implementierungen müssen entsprechend schnell
//! zurückkehren oder selbst dispatchen.

use serde::Serialize;

/// Lebenszyklus-Ereignis für die Präsentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationEvent {
    Incoming,
    Accepted,
    Declined,
    Ended,
}

/// Ereignis an die Notification Bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallNotification {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub event: NotificationEvent,
    pub participant: String,
}

/// Senke für Präsentations-Ereignisse
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: CallNotification);
}

/// Senke die alle Ereignisse verwirft (für Embedder ohne Präsentation)
#[derive(Debug, Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn notify(&self, notification: CallNotification) {
        tracing::debug!(
            "Dropping call notification: {:?} for {}",
            notification.event,
            notification.session_id
        );
    }
}
