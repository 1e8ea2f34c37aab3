//! Reconnection Supervisor
//!
//! Beobachtet den Verbindungszustand der Media-Schicht und reagiert auf
//! Ausfälle: der erste `Failed`-Übergang einer Session löst genau einen
//! ICE-Restart aus (Initiator aktiv, Responder wartet passiv auf das
//! Ersatz-Offer), der zweite beendet die Session als unwiederbringlich.
//!
//! Der Fehlerzähler gehört zur jeweils aktuellen Session und wird durch
//! eine zwischenzeitliche Erholung NICHT zurückgesetzt: zwei Ausfälle im
//! selben Anruf sind das Abbruchkriterium, egal wie viel Zeit dazwischen
//! liegt. Beginnt eine neue Session, startet der Zähler bei null.

use super::engine::CallSessionEngine;
use crate::media::{ConnectionHealth, MediaController, MediaEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Überwacht Verbindungsausfälle und treibt die Wiederherstellung
pub struct ReconnectionSupervisor {
    engine: Arc<CallSessionEngine>,
    media: Arc<dyn MediaController>,
}

impl ReconnectionSupervisor {
    pub fn new(engine: Arc<CallSessionEngine>, media: Arc<dyn MediaController>) -> Self {
        Self { engine, media }
    }

    /// Startet die Überwachungsschleife als Hintergrund-Task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut events = self.media.subscribe();
        // Zähler nur für die aktuelle Session, alte Einträge fallen weg
        let mut failures: Option<(String, u32)> = None;

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Supervisor lagged, {} media events dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                MediaEvent::HealthChanged(ConnectionHealth::Failed) => {
                    self.handle_failure(&mut failures).await;
                }
                MediaEvent::HealthChanged(ConnectionHealth::Disconnected) => {
                    // Transient: ICE darf sich selbst fangen
                    tracing::debug!("Connection disconnected, waiting for ICE to recover");
                }
                MediaEvent::HealthChanged(health) => {
                    tracing::debug!("Connection health: {:?}", health);
                }
                _ => {}
            }
        }

        tracing::debug!("Reconnection supervisor stopped");
    }

    async fn handle_failure(&self, failures: &mut Option<(String, u32)>) {
        let session = match self.engine.session().await {
            Some(s) if !s.is_terminal() => s,
            _ => return,
        };

        let count = match failures {
            Some((id, count)) if *id == session.id => {
                *count += 1;
                *count
            }
            _ => {
                *failures = Some((session.id.clone(), 1));
                1
            }
        };
        tracing::warn!(
            "Connection failure #{} for session {}",
            count,
            session.id
        );

        if count == 1 {
            if session.is_initiator() {
                if let Err(e) = self.engine.ice_restart().await {
                    tracing::error!("ICE restart failed: {}", e);
                }
            } else {
                // Das Ersatz-Offer kommt vom Initiator
                tracing::info!("Awaiting ICE restart offer from remote for {}", session.id);
            }
        } else {
            self.engine.force_end("connection unrecoverable").await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
