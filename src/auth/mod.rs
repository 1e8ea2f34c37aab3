//! Auth Module - Anmeldedaten für das Signaling
//!
//! Dieses Modul stellt die Schnittstelle zum Authentifizierungs-
//! Kollaborateur bereit: ein Bearer-Token auf Abruf. Token-Beschaffung
//! und -Erneuerung liegen außerhalb dieser Engine.

mod credentials;

pub use credentials::{CredentialProvider, StaticCredentials};
