//! Runtime configuration.
//!
//! Loaded once at startup from a TOML file; read-only afterwards. All
//! durations are expressed in milliseconds. A missing required key fails
//! startup with a message naming the key.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;

use crate::error::{Error, Result};

fn default_time_suffix() -> String {
    "%Y%m%d".to_string()
}

fn default_instances() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// `chrono` format pattern appended to collection prefixes, applied to
    /// the source packet timestamp in UTC.
    #[serde(default = "default_time_suffix")]
    pub time_suffix: String,

    /// Shard count for the sharded SIP aggregators.
    #[serde(default = "default_instances")]
    pub instances: usize,

    #[serde(default)]
    pub sip: SipConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub udf: UdfConfig,

    pub management: ManagementConfig,

    pub mongo: Option<MongoConfig>,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(Error::InvalidConfig("instances must be at least 1".into()));
        }
        if StrftimeItems::new(&self.time_suffix).any(|item| matches!(item, Item::Error)) {
            return Err(Error::InvalidConfig(format!(
                "time-suffix '{}' is not a valid chrono format",
                self.time_suffix
            )));
        }
        self.management.socket_addr()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SipConfig {
    #[serde(default)]
    pub message: SipMessageConfig,

    #[serde(default)]
    pub transaction: SipTransactionConfig,

    #[serde(default)]
    pub call: SipCallConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SipMessageConfig {
    /// CSeq methods whose raw documents and forwarding are suppressed.
    /// Metrics are still emitted for excluded methods.
    #[serde(default)]
    pub exclusions: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SipTransactionConfig {
    #[serde(default = "SipTransactionConfig::default_expiration_delay")]
    pub expiration_delay: u64,

    #[serde(default = "SipTransactionConfig::default_termination_timeout")]
    pub termination_timeout: u64,
}

impl SipTransactionConfig {
    fn default_expiration_delay() -> u64 {
        100
    }

    fn default_termination_timeout() -> u64 {
        10_000
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_millis(self.expiration_delay)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout)
    }
}

impl Default for SipTransactionConfig {
    fn default() -> Self {
        Self {
            expiration_delay: Self::default_expiration_delay(),
            termination_timeout: Self::default_termination_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SipCallConfig {
    #[serde(default = "SipCallConfig::default_expiration_delay")]
    pub expiration_delay: u64,

    #[serde(default = "SipCallConfig::default_aggregation_timeout")]
    pub aggregation_timeout: u64,
}

impl SipCallConfig {
    fn default_expiration_delay() -> u64 {
        1_000
    }

    fn default_aggregation_timeout() -> u64 {
        120_000
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_millis(self.expiration_delay)
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregation_timeout)
    }
}

impl Default for SipCallConfig {
    fn default() -> Self {
        Self {
            expiration_delay: Self::default_expiration_delay(),
            aggregation_timeout: Self::default_aggregation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MediaConfig {
    #[serde(default, rename = "rtp-r")]
    pub rtp_r: RtprConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RtprConfig {
    /// When `true`, per-session aggregate metrics are emitted on session
    /// termination instead of per report.
    #[serde(default)]
    pub cumulative_metrics: bool,

    #[serde(default = "RtprConfig::default_expiration_delay")]
    pub expiration_delay: u64,

    #[serde(default = "RtprConfig::default_aggregation_timeout")]
    pub aggregation_timeout: u64,
}

impl RtprConfig {
    fn default_expiration_delay() -> u64 {
        4_000
    }

    fn default_aggregation_timeout() -> u64 {
        30_000
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_millis(self.expiration_delay)
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregation_timeout)
    }
}

impl Default for RtprConfig {
    fn default() -> Self {
        Self {
            cumulative_metrics: false,
            expiration_delay: Self::default_expiration_delay(),
            aggregation_timeout: Self::default_aggregation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UdfConfig {
    #[serde(default = "UdfConfig::default_check_period")]
    pub check_period: u64,

    #[serde(default = "UdfConfig::default_execution_timeout")]
    pub execution_timeout: u64,
}

impl UdfConfig {
    fn default_check_period() -> u64 {
        300_000
    }

    fn default_execution_timeout() -> u64 {
        100
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout)
    }
}

impl Default for UdfConfig {
    fn default() -> Self {
        Self {
            check_period: Self::default_check_period(),
            execution_timeout: Self::default_execution_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ManagementConfig {
    /// Listen URI of the management socket, e.g. `udp://0.0.0.0:15090`.
    pub uri: String,

    #[serde(default = "ManagementConfig::default_expiration_delay")]
    pub expiration_delay: u64,

    #[serde(default = "ManagementConfig::default_expiration_timeout")]
    pub expiration_timeout: u64,
}

impl ManagementConfig {
    fn default_expiration_delay() -> u64 {
        60_000
    }

    fn default_expiration_timeout() -> u64 {
        120_000
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_millis(self.expiration_delay)
    }

    pub fn expiration_timeout(&self) -> Duration {
        Duration::from_millis(self.expiration_timeout)
    }

    /// Parses the `udp://host:port` listen URI.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .uri
            .strip_prefix("udp://")
            .ok_or_else(|| {
                Error::InvalidConfig(format!("management.uri '{}' must be udp://", self.uri))
            })?
            .parse()
            .map_err(|err| {
                Error::InvalidConfig(format!("management.uri '{}': {}", self.uri, err))
            })?;
        Ok(addr)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MongoConfig {
    pub uri: String,
    pub db: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "StorageConfig::default_flush_interval")]
    pub flush_interval: u64,
}

impl StorageConfig {
    fn default_batch_size() -> usize {
        256
    }

    fn default_flush_interval() -> u64 {
        1_000
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            flush_interval: Self::default_flush_interval(),
        }
    }
}
