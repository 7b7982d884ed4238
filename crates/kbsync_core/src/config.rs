use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_SOURCE_DOMAIN: &str = "entrust.com";
pub const DEFAULT_FILES_PREFIX: &str = "/files";
pub const DEFAULT_MIRROR_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub mirror: MirrorSection,
    #[serde(default)]
    pub files: FilesSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ServerSection {
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorSection {
    pub source_domain: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilesSection {
    pub public_prefix: Option<String>,
}

impl AppConfig {
    /// Resolve the ingest listen address: env KBSYNC_LISTEN_ADDR > config > default.
    pub fn listen_addr(&self) -> String {
        if let Some(value) = env_value("KBSYNC_LISTEN_ADDR") {
            return value;
        }
        self.server
            .listen_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
    }

    /// Domain whose images are mirrored locally in development mode.
    pub fn source_domain(&self) -> String {
        if let Some(value) = env_value("KBSYNC_SOURCE_DOMAIN") {
            return value;
        }
        self.mirror
            .source_domain
            .clone()
            .unwrap_or_else(|| DEFAULT_SOURCE_DOMAIN.to_string())
    }

    pub fn mirror_timeout_ms(&self) -> u64 {
        env::var("KBSYNC_MIRROR_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.mirror.timeout_ms)
            .unwrap_or(DEFAULT_MIRROR_TIMEOUT_MS)
    }

    /// URL prefix stored blobs are served under.
    pub fn files_prefix(&self) -> String {
        if let Some(value) = env_value("KBSYNC_FILES_PREFIX") {
            return value;
        }
        self.files
            .public_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_FILES_PREFIX.to_string())
    }
}

fn env_value(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

/// Load and parse an AppConfig from a TOML file. Returns defaults if the
/// file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    if !config_path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AppConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Render the default config written by `init`.
pub fn default_config_toml() -> String {
    format!(
        "[server]\nlisten_addr = \"{DEFAULT_LISTEN_ADDR}\"\n\n\
         [mirror]\nsource_domain = \"{DEFAULT_SOURCE_DOMAIN}\"\n\n\
         [files]\npublic_prefix = \"{DEFAULT_FILES_PREFIX}\"\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_builtin_values() {
        let config = AppConfig::default();
        assert_eq!(config.listen_addr(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.source_domain(), DEFAULT_SOURCE_DOMAIN);
        assert_eq!(config.files_prefix(), DEFAULT_FILES_PREFIX);
        assert_eq!(config.mirror_timeout_ms(), DEFAULT_MIRROR_TIMEOUT_MS);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/kbsync.toml")).expect("load config");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[server]
listen_addr = "0.0.0.0:9000"

[mirror]
source_domain = "example.org"
timeout_ms = 5000

[files]
public_prefix = "/static"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.source_domain(), "example.org");
        assert_eq!(config.mirror_timeout_ms(), 5000);
        assert_eq!(config.files_prefix(), "/static");
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[server]\nlisten_addr = \"127.0.0.1:1234\"\n")
            .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.listen_addr(), "127.0.0.1:1234");
        assert_eq!(config.source_domain(), DEFAULT_SOURCE_DOMAIN);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[server\nlisten_addr = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn default_config_toml_round_trips() {
        let parsed: AppConfig = toml::from_str(&default_config_toml()).expect("parse default");
        assert_eq!(parsed.listen_addr(), DEFAULT_LISTEN_ADDR);
    }
}
