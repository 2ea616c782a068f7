//! Application configuration
//!
//! `peercoord.toml` lives in the platform config directory unless a path
//! is given on the command line. A missing default file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use peercoord_core::{EngineConfig, Error, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "peercoord.toml";

/// Relay connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Port `peercoord relay` listens on
    pub port: u16,
    /// Connect and handshake timeout
    pub io_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: peercoord_net::DEFAULT_PORT,
            io_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub relay: RelayConfig,
}

impl AppConfig {
    /// Load from `explicit`, or from the default location if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_file(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::load_file(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file; using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "peercoord", "peercoord").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;

        Ok(dirs.config_dir().join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sections_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nhost_claim_grace_ms = 500\n\n[relay]\nport = 9000"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.host_claim_grace_ms, 500);
        assert_eq!(config.engine.sampling_interval_secs, 600);
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.io_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join(CONFIG_FILE)));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nhost_claim_grace_ms = \"soon\"").unwrap();
        assert!(matches!(
            AppConfig::load(Some(file.path())),
            Err(Error::Config(_))
        ));
    }
}
