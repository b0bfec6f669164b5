//! Server configuration
//!
//! Loaded the way `find-non-standard-tx`'s `main` loads its node settings:
//! a [`config::Config`] builder stacking a TOML file under CLI-provided
//! environment overrides, deserialized into a plain `serde` struct. Every
//! value also has a hardcoded default, so a calendar can be started with
//! nothing but `--datadir`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors loading the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `config` crate failed to build or deserialize the settings.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Calendar server configuration, deserialized from `<config-file>` and
/// overridable by `OTS_CALENDAR__*` environment variables (double
/// underscore separates nested keys, e.g. `OTS_CALENDAR__BITCOIN__RPC_URL`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `uri`, `hmac-key`, `journal`, and the `db` tree.
    pub datadir: PathBuf,
    /// This calendar's own URI, embedded in every `Pending` attestation it
    /// issues. Only used the first time `datadir` is initialized.
    pub uri: String,
    /// Address the HTTP server binds to.
    pub bind: SocketAddr,
    /// Directory backup chunks are cached under, relative to `datadir` if
    /// not absolute.
    pub backup_cache_dir: PathBuf,
    pub bitcoin: BitcoinConfig,
    pub aggregator: AggregatorConfig,
    pub stamper: StamperConfig,
    /// Remote calendars to mirror, if any. An empty list means this process
    /// runs its own aggregator and stamper instead of mirroring.
    pub mirror: Vec<MirrorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitcoinConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub commitment_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StamperConfig {
    pub max_pending: usize,
    pub min_confirmations: u64,
    pub min_tx_interval_secs: u64,
    pub relay_feerate: u64,
    pub max_fee_sats: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub uri: String,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datadir: PathBuf::from("./calendar-data"),
            uri: "https://localhost".to_string(),
            bind: "127.0.0.1:14788".parse().expect("valid default bind address"),
            backup_cache_dir: PathBuf::from("backup_cache"),
            bitcoin: BitcoinConfig::default(),
            aggregator: AggregatorConfig::default(),
            stamper: StamperConfig::default(),
            mirror: Vec::new(),
        }
    }
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".to_string(),
            rpc_user: String::new(),
            rpc_password: String::new(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        // matches otsserver's default aggregation interval
        Self { commitment_interval_secs: 1 }
    }
}

impl Default for StamperConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            min_confirmations: 6,
            min_tx_interval_secs: 600,
            relay_feerate: 1,
            max_fee_sats: 1_000_000,
            poll_interval_secs: 10,
        }
    }
}

impl StamperConfig {
    #[must_use]
    pub fn min_tx_interval(&self) -> Duration {
        Duration::from_secs(self.min_tx_interval_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn max_fee(&self) -> bitcoin::Amount {
        bitcoin::Amount::from_sat(self.max_fee_sats)
    }

    #[must_use]
    pub fn to_runtime(&self) -> crate::stamper::StamperConfig {
        crate::stamper::StamperConfig {
            max_pending: self.max_pending,
            min_confirmations: self.min_confirmations,
            min_tx_interval: self.min_tx_interval(),
            relay_feerate: self.relay_feerate,
            max_fee: self.max_fee(),
        }
    }
}

impl AggregatorConfig {
    #[must_use]
    pub fn commitment_interval(&self) -> Duration {
        Duration::from_secs(self.commitment_interval_secs)
    }
}

impl MirrorConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path` (if it exists) layered under
    /// `OTS_CALENDAR__*` environment overrides, falling back to defaults
    /// for anything neither source sets.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is present but malformed, or if the
    /// merged settings don't deserialize into [`Config`].
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("OTS_CALENDAR").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_a_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.stamper.min_confirmations, 6);
        assert_eq!(config.bind.port(), 14788);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(std::path::Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.aggregator.commitment_interval_secs, 1);
    }
}
