//! Daemon configuration.
//!
//! Configuration is loaded from multiple sources with the following
//! priority:
//!
//! 1. Environment variables (ARMADA_*)
//! 2. Configuration file (`--config`, or /etc/armada/armada.toml)
//! 3. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! listen = "0.0.0.0:2376"
//! engines = ["10.0.0.10:2375", "10.0.0.11:2375"]
//!
//! refresh_interval_secs = 30
//! request_timeout_secs = 30
//! overcommit_ratio = 0.05
//!
//! [tls]
//! ca = "/etc/armada/ca.pem"
//! cert = "/etc/armada/cert.pem"
//! key = "/etc/armada/key.pem"
//!
//! [logging]
//! level = "info"
//! ```

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Armada daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the cluster API listens on.
    pub listen: String,
    /// Engine addresses (`host:port`) to manage.
    pub engines: Vec<String>,
    /// Cluster options as `key=value` strings, e.g.
    /// `armada.overcommit=10` (percent) or `armada.refresh_interval=15`
    /// (seconds). These win over the dedicated config keys.
    pub cluster_opts: Vec<String>,
    /// Background refresh period per engine, seconds.
    pub refresh_interval_secs: u64,
    /// Per-request timeout toward engines, seconds.
    pub request_timeout_secs: u64,
    /// Fraction of raw engine capacity advertised on top (0.05 = 105%).
    pub overcommit_ratio: f64,
    /// Root directory for reschedule records.
    pub store_root: PathBuf,
    /// TLS material for dialing engines.
    pub tls: TlsPaths,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// PEM file locations for mutual TLS toward engines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPaths {
    /// CA bundle verifying engine certificates. TLS is off when unset.
    pub ca: Option<PathBuf>,
    /// Client certificate presented to engines.
    pub cert: Option<PathBuf>,
    /// Client private key.
    pub key: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "armada=info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2376".to_string(),
            engines: Vec::new(),
            cluster_opts: Vec::new(),
            refresh_interval_secs: 30,
            request_timeout_secs: 30,
            overcommit_ratio: 0.05,
            store_root: default_store_root(),
            tls: TlsPaths::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_store_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".armada").join("state"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/armada/state"))
}

impl Config {
    /// Loads configuration from the default file locations and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("/etc/armada/armada.toml"))
            .merge(Toml::file("armada.toml"))
            .merge(Env::prefixed("ARMADA_").split("_"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ARMADA_").split("_"))
            .extract()
    }

    /// Certificate and key paths as a pair, when both are configured.
    #[must_use]
    pub fn client_cert(&self) -> Option<(&std::path::Path, &std::path::Path)> {
        match (&self.tls.cert, &self.tls.key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.refresh_interval_secs, 30);
        assert!(config.engines.is_empty());
        assert!(config.tls.ca.is_none());
        assert!(config.client_cert().is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armada.toml");
        std::fs::write(
            &path,
            r#"
listen = "0.0.0.0:4000"
engines = ["10.0.0.10:2375"]
overcommit_ratio = 0.1
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.listen, "0.0.0.0:4000");
        assert_eq!(config.engines, vec!["10.0.0.10:2375".to_string()]);
        assert!((config.overcommit_ratio - 0.1).abs() < f64::EPSILON);
        // Untouched keys keep their defaults.
        assert_eq!(config.request_timeout_secs, 30);
    }
}
