use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Shared secret seeded when no settings row exists yet.
pub const DEFAULT_PASSWORD: &str = "firmware";

/// Process-wide switch governing taxonomy auto-creation, image mirroring,
/// and the technote publish-state rules. Read once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Development,
    Production,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => bail!("unknown sync mode: {other}"),
        }
    }

    pub fn creates_missing_terms(self) -> bool {
        self == Self::Development
    }

    pub fn mirrors_images(self) -> bool {
        self == Self::Development
    }
}

/// Persisted single-row configuration: the encoded ingest credential and
/// the sync mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub password_encoded: String,
    pub mode: SyncMode,
}

impl Settings {
    /// Defaults written on first initialization.
    pub fn seeded() -> Self {
        Self {
            password_encoded: encode_secret(DEFAULT_PASSWORD),
            mode: SyncMode::Development,
        }
    }

    /// Equality compare of the stored encoded value against the encoding of
    /// the presented header value. Not cryptographic verification.
    pub fn accepts(&self, presented: &str) -> bool {
        self.password_encoded == encode_secret(presented)
    }
}

pub fn encode_secret(raw: &str) -> String {
    STANDARD.encode(raw.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_settings_accept_default_password() {
        let settings = Settings::seeded();
        assert_eq!(settings.mode, SyncMode::Development);
        assert!(settings.accepts("firmware"));
        assert!(!settings.accepts("Firmware"));
        assert!(!settings.accepts(""));
    }

    #[test]
    fn encode_secret_is_base64() {
        assert_eq!(encode_secret("firmware"), "ZmlybXdhcmU=");
    }

    #[test]
    fn mode_parse_round_trips() {
        assert_eq!(
            SyncMode::parse("development").expect("parse"),
            SyncMode::Development
        );
        assert_eq!(
            SyncMode::parse("production").expect("parse"),
            SyncMode::Production
        );
        assert!(SyncMode::parse("staging").is_err());
    }

    #[test]
    fn mode_governs_term_creation_and_mirroring() {
        assert!(SyncMode::Development.creates_missing_terms());
        assert!(SyncMode::Development.mirrors_images());
        assert!(!SyncMode::Production.creates_missing_terms());
        assert!(!SyncMode::Production.mirrors_images());
    }
}
