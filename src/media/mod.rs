//! Media Module - Geräte und Peer Connection
//!
//! Dieses Modul verwaltet:
//! - Lokale Capture-Geräte (Mikrofon, Lautsprecher-Routing)
//! - Aufbau der WebRTC Peer Connection mit fester ICE-Konfiguration
//! - Verbindungszustand als Input für den ReconnectionSupervisor

mod controller;
mod devices;

pub use controller::{
    default_ice_servers, ConnectionHealth, MediaController, MediaError, MediaEvent,
    WebRtcMediaController,
};
pub use devices::{DeviceError, MediaStreamBundle, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
