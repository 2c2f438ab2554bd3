//! Configuration types for the RelayCraft proxy core.

mod listen;
mod protocol;
mod upstream;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use listen::{ListenConfig, MetricsConfig, TlsConfig};
pub use protocol::Protocol;
pub use upstream::{parse_upstream_proxy, ConnectionPoolConfig, UpstreamProxyConfig};

/// Tuning knobs for the flow database's background maintenance, per
/// SPEC_FULL §4.6. All have defaults matching the distilled spec so a
/// deployment need not set any of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    #[serde(default = "default_max_flow_age_days")]
    pub max_flow_age_days: u32,
    #[serde(default = "default_max_total_flows")]
    pub max_total_flows: u64,
    #[serde(default = "default_max_db_size_mb")]
    pub max_db_size_mb: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_flow_age_days() -> u32 {
    30
}
fn default_max_total_flows() -> u64 {
    1_000_000
}
fn default_max_db_size_mb() -> u64 {
    2_000
}
fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_flow_age_days: default_max_flow_age_days(),
            max_total_flows: default_max_total_flows(),
            max_db_size_mb: default_max_db_size_mb(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub db: DbConfig,

    /// Root of persisted state; `DATA_DIR` env var / `--data-dir` flag takes
    /// precedence over this field when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,

    /// Directory holding a pre-generated CA `cert.crt`/`cert.pem` +
    /// `key.pem` pair. Generating or managing this material is out of
    /// scope (SPEC_FULL §1); the substrate only reads it, to terminate
    /// `CONNECT` tunnels and to serve `GET /cert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            metrics: MetricsConfig::default(),
            connection_pool: ConnectionPoolConfig::default(),
            db: DbConfig::default(),
            data_dir: None,
            rules_dir: None,
            rules_file: None,
            ca_dir: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.listen.protocol == Protocol::Https && self.listen.tls.is_none() {
            anyhow::bail!(
                "TLS configuration is required when listener protocol is 'https'. \
                 Please provide 'listen.tls.cert_path' and 'listen.tls.key_path'"
            );
        }
        Ok(())
    }

    /// Resolve the data directory, defaulting to `~/.relaycraft` per
    /// SPEC_FULL §6.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".relaycraft")
        })
    }

    /// Resolve the CA material directory, defaulting to `<data_dir>/ca`.
    pub fn resolve_ca_dir(&self) -> PathBuf {
        self.ca_dir
            .clone()
            .unwrap_or_else(|| self.resolve_data_dir().join("ca"))
    }
}
