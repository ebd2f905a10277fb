//! `folio.toml` loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use folio_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "folio.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolioConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Settings for the HTTP fetch bridge (`[http]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sent with every request unless the plugin sets the same header.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            default_headers: BTreeMap::new(),
        }
    }
}

fn default_user_agent() -> String {
    format!("folio/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

impl FolioConfig {
    /// Load from `path`, or from `folio.toml` in the working directory.
    ///
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !required && !path.exists() {
            tracing::debug!("[config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [runtime]
            await_timeout_ms = 5000
            promise_mode = "native"

            [http]
            user_agent = "Mozilla/5.0"
            default_headers = {{ Referer = "https://example.test/" }}
            "#
        )
        .unwrap();

        let config = FolioConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.runtime.await_timeout_ms, 5000);
        assert_eq!(config.runtime.poll_interval_ms, 10);
        assert_eq!(config.http.user_agent, "Mozilla/5.0");
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(
            config.http.default_headers.get("Referer").map(String::as_str),
            Some("https://example.test/")
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = FolioConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();

        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FolioConfig::parse("").unwrap();

        assert_eq!(config, FolioConfig::default());
        assert!(config.http.user_agent.starts_with("folio/"));
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        assert!(FolioConfig::parse("[runtime\nawait_timeout_ms = 1").is_err());
    }
}
