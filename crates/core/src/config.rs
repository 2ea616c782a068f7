//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default capability sampling period (10 minutes)
pub const DEFAULT_SAMPLING_INTERVAL_SECS: u64 = 600;

/// Default wait before a hostless peer runs the host claim tie-break
pub const DEFAULT_HOST_CLAIM_GRACE_MS: u64 = 2000;

/// Tunables for one coordination engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between capability samples
    pub sampling_interval_secs: u64,
    /// Milliseconds a peer waits with no known host before claiming
    pub host_claim_grace_ms: u64,
    /// How many times a failed signaling session is re-created
    pub signaling_retries: u32,
    /// Capacity of the engine event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: DEFAULT_SAMPLING_INTERVAL_SECS,
            host_claim_grace_ms: DEFAULT_HOST_CLAIM_GRACE_MS,
            signaling_retries: 1,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn sampling_interval(&self) -> Duration {
        // A zero period would make the interval timer panic
        Duration::from_secs(self.sampling_interval_secs.max(1))
    }

    pub fn host_claim_grace(&self) -> Duration {
        Duration::from_millis(self.host_claim_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sampling_interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str("host_claim_grace_ms = 50\n").unwrap();
        assert_eq!(config.host_claim_grace(), Duration::from_millis(50));
        assert_eq!(config.signaling_retries, 1);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(EngineConfig::from_toml_str("sampling_interval_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sampling_interval_secs = 30").unwrap();
        writeln!(file, "signaling_retries = 0").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.sampling_interval(), Duration::from_secs(30));
        assert_eq!(config.signaling_retries, 0);
    }
}
