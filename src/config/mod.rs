//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`STREAMSEAL_*`)
//! - CLI arguments (for the binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SealError};

/// Default secure-transport package
pub const DEFAULT_PACKAGE: &str = "streamseal";

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Secure-transport package to negotiate with
    #[serde(default = "default_package")]
    pub package: String,

    /// Handshake timing
    #[serde(default)]
    pub handshake: HandshakeConfig,
}

fn default_package() -> String {
    DEFAULT_PACKAGE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            package: default_package(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SealError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `STREAMSEAL_*` overrides from `lookup`.
    ///
    /// Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(package) = lookup("STREAMSEAL_PACKAGE") {
            self.package = package;
        }

        let handshake = &mut self.handshake;
        override_parsed(&lookup, "STREAMSEAL_HANDSHAKE_SETTLE_MS", &mut handshake.settle_ms);
        override_parsed(&lookup, "STREAMSEAL_HANDSHAKE_DRAIN_MS", &mut handshake.drain_ms);
        override_parsed(&lookup, "STREAMSEAL_HANDSHAKE_TIMEOUT_MS", &mut handshake.timeout_ms);
        override_parsed(&lookup, "STREAMSEAL_HANDSHAKE_MAX_ROUNDS", &mut handshake.max_rounds);

        self
    }

    /// Check values a session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.package.is_empty() {
            return Err(SealError::Config("package name is empty".to_string()));
        }
        if self.handshake.max_rounds == 0 {
            return Err(SealError::Config("handshake.max_rounds must be at least 1".to_string()));
        }
        if self.handshake.timeout_ms == 0 {
            return Err(SealError::Config("handshake.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Runtime handshake timing
    pub fn timing(&self) -> HandshakeTiming {
        self.handshake.timing()
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    match lookup(key).map(|raw| raw.parse::<T>()) {
        Some(Ok(value)) => *slot = value,
        Some(Err(_)) => tracing::warn!("Ignoring unparseable {}", key),
        None => {},
    }
}

/// Handshake timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Coarse wait for the first byte of each peer token (ms)
    pub settle_ms: u64,

    /// Fine wait between reads while draining a token (ms)
    pub drain_ms: u64,

    /// Upper bound on the whole negotiation (ms)
    pub timeout_ms: u64,

    /// Upper bound on provider steps per negotiation
    pub max_rounds: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            drain_ms: 1,
            timeout_ms: 30_000,
            max_rounds: 64,
        }
    }
}

impl HandshakeConfig {
    /// Convert to the runtime form
    pub fn timing(&self) -> HandshakeTiming {
        HandshakeTiming {
            settle: Duration::from_millis(self.settle_ms),
            drain: Duration::from_millis(self.drain_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            max_rounds: self.max_rounds,
        }
    }
}

/// Handshake polling contract.
///
/// Each time the provider needs more input the negotiator waits up to
/// `settle` for the peer to start answering, then keeps reading while the
/// socket becomes readable again within `drain`. The negotiation fails with
/// `TimedOut` after `timeout` or `max_rounds` provider steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTiming {
    /// Coarse wait before the first read of a token
    pub settle: Duration,
    /// Fine wait between follow-up reads
    pub drain: Duration,
    /// Bound on the whole negotiation
    pub timeout: Duration,
    /// Bound on provider steps
    pub max_rounds: u32,
}

impl Default for HandshakeTiming {
    fn default() -> Self {
        HandshakeConfig::default().timing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.package, "streamseal");
        assert_eq!(config.handshake.settle_ms, 2000);
        assert_eq!(config.handshake.drain_ms, 1);

        let timing = config.timing();
        assert_eq!(timing.settle, Duration::from_secs(2));
        assert_eq!(timing.timeout, Duration::from_secs(30));
        assert_eq!(timing.max_rounds, 64);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            package = "custom"

            [handshake]
            settle_ms = 250
            max_rounds = 8
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.package, "custom");
        assert_eq!(config.handshake.settle_ms, 250);
        assert_eq!(config.handshake.max_rounds, 8);
        // Unset keys keep their defaults
        assert_eq!(config.handshake.drain_ms, 1);
        assert_eq!(config.handshake.timeout_ms, 30_000);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Config::from_toml("[handshake]\nmax_rounds = 0\n").unwrap_err();
        assert!(matches!(err, SealError::Config(_)));

        let err = Config::from_toml("package = 3").unwrap_err();
        assert!(matches!(err, SealError::Config(_)));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[handshake]\ntimeout_ms = 500").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.handshake.timeout_ms, 500);
        assert_eq!(config.timing().timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STREAMSEAL_PACKAGE", "other"),
            ("STREAMSEAL_HANDSHAKE_SETTLE_MS", "10"),
            ("STREAMSEAL_HANDSHAKE_MAX_ROUNDS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config =
            Config::default().with_overrides(|key| vars.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.package, "other");
        assert_eq!(config.handshake.settle_ms, 10);
        assert_eq!(config.handshake.max_rounds, 64);
    }
}
