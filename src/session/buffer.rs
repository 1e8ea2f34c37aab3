//! ICE Candidate Buffer
//!
//! Candidates die vor der Remote Description eintreffen werden hier
//! gepuffert und nach dem ersten erfolgreichen `set_remote_description`
//! genau einmal in Empfangsreihenfolge abgespielt.

use crate::signaling::IceCandidate;
use chrono::{DateTime, Utc};

/// Ein gepufferter Candidate samt Empfangszeitpunkt
#[derive(Debug, Clone)]
pub struct BufferedCandidate {
    pub candidate: IceCandidate,
    pub received_at: DateTime<Utc>,
}

/// FIFO-Puffer für verfrühte ICE Candidates
///
/// `flush` ist ein Einmal-Vorgang: der zweite Aufruf liefert eine leere
/// Liste. Reihenfolge bleibt strikt erhalten, es findet keine
/// Deduplizierung statt.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    entries: Vec<BufferedCandidate>,
    flushed: bool,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stellt einen Candidate hinten an
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.entries.push(BufferedCandidate {
            candidate,
            received_at: Utc::now(),
        });
    }

    /// Gibt alle gepufferten Candidates in Empfangsreihenfolge zurück
    /// und leert den Puffer
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        self.entries.drain(..).map(|e| e.candidate).collect()
    }

    /// Verwirft alle Einträge und setzt den Puffer zurück
    pub fn clear(&mut self) {
        self.entries.clear();
        self.flushed = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
