//! Credential Provider - Bearer-Token für Signaling-Zugriffe
//!
//! Die eigentliche Token-Beschaffung (Login, Refresh) ist Sache des
//! Embedders; die Engine fragt nur bei Bedarf nach und behandelt ein
//! fehlendes Token als terminalen `Unauthenticated`-Fehler.

use parking_lot::RwLock;

/// Liefert auf Abruf ein Bearer-Token
pub trait CredentialProvider: Send + Sync {
    /// `None` bedeutet: aktuell keine gültige Anmeldung
    fn bearer_token(&self) -> Option<String>;
}

/// Statischer Provider mit austauschbarem Token
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Provider ohne Token, jeder Signaling-Versuch schlägt mit
    /// `Unauthenticated` fehl
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Tauscht das Token aus (z.B. nach einem Refresh)
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_roundtrip() {
        let creds = StaticCredentials::new("token-a");
        assert_eq!(creds.bearer_token().as_deref(), Some("token-a"));

        creds.set_token(Some("token-b".to_string()));
        assert_eq!(creds.bearer_token().as_deref(), Some("token-b"));

        creds.set_token(None);
        assert!(creds.bearer_token().is_none());
    }

    #[test]
    fn test_unauthenticated_provider_has_no_token() {
        assert!(StaticCredentials::unauthenticated().bearer_token().is_none());
    }
}
