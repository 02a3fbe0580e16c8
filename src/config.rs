//! Client configuration consumed by every pipeline component.
//!
//! [`ClientConfig`] is loaded once (typically from the JSON document shared
//! with the logging server), validated, and then shared immutably behind an
//! [`Arc`]. Durations are expressed in milliseconds in the JSON form.

use std::{collections::BTreeMap, fs, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::level::Level;

/// Maximum number of attempts for a single package.
pub const RETRY_COUNT: u8 = 3;

const VALID_POLICIES: &str = "drop, block, timeout:N";

/// Immutable configuration shared by all components.
pub type SharedConfig = Arc<ClientConfig>;

/// Determines how the hi-pri lane reacts when its buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HiPriOverflowPolicy {
    /// Drop the incoming group and count it.
    #[default]
    Drop,
    /// Block the producer until space becomes available.
    Block,
    /// Block up to the specified duration before dropping.
    Timeout(Duration),
}

impl HiPriOverflowPolicy {
    /// Parse `drop`, `block` or `timeout:N` (N milliseconds, N > 0).
    pub fn parse(policy: &str) -> Result<Self, ConfigError> {
        let normalized = policy.trim().to_ascii_lowercase();

        if let Some(rest) = normalized.strip_prefix("timeout:") {
            let ms: i64 = rest.trim().parse().map_err(|_| {
                ConfigError::Invalid("timeout must be a positive integer (N in 'timeout:N')".into())
            })?;
            if ms <= 0 {
                return Err(ConfigError::Invalid(
                    "timeout must be greater than zero".into(),
                ));
            }
            return Ok(Self::Timeout(Duration::from_millis(ms as u64)));
        }

        match normalized.as_str() {
            "drop" => Ok(Self::Drop),
            "block" => Ok(Self::Block),
            "timeout" => Err(ConfigError::Invalid(
                "timeout requires a positive integer N, use 'timeout:N'".into(),
            )),
            _ => Err(ConfigError::Invalid(format!(
                "invalid hi-pri overflow policy '{normalized}'. Valid options are: {VALID_POLICIES}"
            ))),
        }
    }
}

/// How the pool picks among selectable connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum DeliveryMethod {
    /// Stick to the first selectable connection in configured order.
    ClientSpecified,
    /// Rotate through selectable connections, least recently used first.
    #[default]
    RoundRobin,
}

impl TryFrom<u8> for DeliveryMethod {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(Self::ClientSpecified),
            1 => Ok(Self::RoundRobin),
            other => Err(format!("unknown delivery method {other}")),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub enabled: bool,
    pub app_name: String,
    /// Least severe level forwarded to the server.
    pub level: Level,
    pub endpoint: String,
    pub number_of_connections: usize,
    #[serde(rename = "numberOfHiPriConnections")]
    pub number_of_hipri_connections: usize,
    pub number_of_backup_connections: usize,
    #[serde(rename = "numberOfHiPriBackupConnections")]
    pub number_of_hipri_backup_connections: usize,
    #[serde(deserialize_with = "millis")]
    pub connection_reset_interval: Duration,
    pub channel_size: usize,
    pub overflow_channel_size: usize,
    pub overflow_channel_logging_level: Level,
    pub hipri_logging_level: Level,
    pub hipri_channel_size: usize,
    #[serde(deserialize_with = "overflow_policy")]
    pub hipri_overflow_policy: HiPriOverflowPolicy,
    pub target_message_batch_size: usize,
    #[serde(deserialize_with = "millis")]
    pub send_batch_logs_interval: Duration,
    pub common_labels: BTreeMap<String, String>,
    pub server_config_group: String,
    pub server_config_name: String,
    pub delivery_method: DeliveryMethod,
    #[serde(deserialize_with = "millis")]
    pub health_check_interval: Duration,
    pub health_check_failure_threshold: u32,
    #[serde(
        rename = "connectionShutdownTimout",
        alias = "connectionShutdownTimeout",
        deserialize_with = "millis"
    )]
    pub connection_shutdown_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub correlation_idle_window: Duration,
    #[serde(deserialize_with = "millis")]
    pub correlation_sweep_interval: Duration,
    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Upper bound for a single send, data or health check.
    #[serde(deserialize_with = "millis")]
    pub send_timeout: Duration,
    pub max_frame_size: usize,
    /// Minimum spacing between coalesced drop warnings.
    #[serde(deserialize_with = "millis")]
    pub warn_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_name: String::new(),
            level: Level::Debug,
            endpoint: "localhost:9020".into(),
            number_of_connections: 2,
            number_of_hipri_connections: 1,
            number_of_backup_connections: 1,
            number_of_hipri_backup_connections: 1,
            connection_reset_interval: Duration::from_secs(300),
            channel_size: 1024,
            overflow_channel_size: 256,
            overflow_channel_logging_level: Level::Warn,
            hipri_logging_level: Level::Error,
            hipri_channel_size: 256,
            hipri_overflow_policy: HiPriOverflowPolicy::Drop,
            target_message_batch_size: 64,
            send_batch_logs_interval: Duration::from_millis(500),
            common_labels: BTreeMap::new(),
            server_config_group: String::new(),
            server_config_name: String::new(),
            delivery_method: DeliveryMethod::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            health_check_failure_threshold: 3,
            connection_shutdown_timeout: Duration::from_secs(5),
            correlation_idle_window: Duration::from_secs(5),
            correlation_sweep_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            max_frame_size: 1 << 20,
            warn_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_non_zero("channelSize", self.channel_size)?;
        ensure_non_zero("overflowChannelSize", self.overflow_channel_size)?;
        ensure_non_zero("hipriChannelSize", self.hipri_channel_size)?;
        ensure_non_zero("targetMessageBatchSize", self.target_message_batch_size)?;
        ensure_non_zero("numberOfConnections", self.number_of_connections)?;
        ensure_non_zero("numberOfHiPriConnections", self.number_of_hipri_connections)?;
        ensure_non_zero("maxFrameSize", self.max_frame_size)?;
        ensure_non_zero(
            "healthCheckFailureThreshold",
            self.health_check_failure_threshold as usize,
        )?;
        for (field, value) in [
            ("sendBatchLogsInterval", self.send_batch_logs_interval),
            ("healthCheckInterval", self.health_check_interval),
            ("connectionResetInterval", self.connection_reset_interval),
            ("correlationSweepInterval", self.correlation_sweep_interval),
            ("sendTimeout", self.send_timeout),
            ("connectTimeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Total number of pooled connections across every role.
    pub fn total_connections(&self) -> usize {
        self.number_of_connections
            + self.number_of_hipri_connections
            + self.number_of_backup_connections
            + self.number_of_hipri_backup_connections
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(self)
    }
}

fn ensure_non_zero(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn overflow_policy<'de, D>(deserializer: D) -> Result<HiPriOverflowPolicy, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    HiPriOverflowPolicy::parse(&raw).map_err(serde::de::Error::custom)
}
