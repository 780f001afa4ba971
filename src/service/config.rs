use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use super::{AppError, AppResult};

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Directory of the RocksDB state store.
    #[serde(default = "default_state_db_path")]
    pub state_db_path: String,
    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_db_path: default_state_db_path(),
            log_dir: default_log_dir(),
        }
    }
}

/// Tunables of the delivery tracker, as they appear in the config file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeliverySettings {
    #[serde(default = "default_max_cache_size_megabytes", alias = "maxCacheSizeMegabytes")]
    pub max_cache_size_megabytes: u64,
    #[serde(default = "default_max_cache_offset_age", alias = "maxCacheOffsetAge")]
    pub max_cache_offset_age: i64,
    #[serde(
        default = "default_state_persistence_period_seconds",
        alias = "statePersistencePeriodSeconds"
    )]
    pub state_persistence_period_seconds: f64,
    #[serde(
        default = "default_outbound_batch_processing_timeout_seconds",
        alias = "outboundBatchProcessingTimeoutSeconds"
    )]
    pub outbound_batch_processing_timeout_seconds: f64,
    #[serde(
        default = "default_max_number_of_persistence_retries",
        alias = "maxNumberOfPersistenceRetries"
    )]
    pub max_number_of_persistence_retries: u32,
    #[serde(
        default = "default_message_replay_period_seconds",
        alias = "messageReplayPeriodSeconds"
    )]
    pub message_replay_period_seconds: f64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_cache_size_megabytes: default_max_cache_size_megabytes(),
            max_cache_offset_age: default_max_cache_offset_age(),
            state_persistence_period_seconds: default_state_persistence_period_seconds(),
            outbound_batch_processing_timeout_seconds:
                default_outbound_batch_processing_timeout_seconds(),
            max_number_of_persistence_retries: default_max_number_of_persistence_retries(),
            message_replay_period_seconds: default_message_replay_period_seconds(),
        }
    }
}

fn default_state_db_path() -> String {
    "./state".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_max_cache_size_megabytes() -> u64 {
    100
}
fn default_max_cache_offset_age() -> i64 {
    50_000
}
fn default_state_persistence_period_seconds() -> f64 {
    1.0
}
fn default_outbound_batch_processing_timeout_seconds() -> f64 {
    30.0
}
fn default_max_number_of_persistence_retries() -> u32 {
    3
}
fn default_message_replay_period_seconds() -> f64 {
    2.0
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub delivery: DeliverySettings,
}

impl DeliveryConfig {
    /// Reads the config file, then lets `DELIVERYMQ_<SECTION>__<KEY>` variables override it.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<DeliveryConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("DELIVERYMQ").separator("__"))
            .build()?;

        let delivery_config: DeliveryConfig = config.try_deserialize()?;
        // reject bad tunables at startup rather than on first reconfigure
        DeliverySnapshot::try_from(&delivery_config.delivery)?;
        Ok(delivery_config)
    }
}

/// Validated, immutable view of [`DeliverySettings`] in the units the components use.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySnapshot {
    pub max_cache_size_bytes: u64,
    pub max_cache_offset_age: i64,
    pub persistence_period: Duration,
    pub outbound_batch_timeout: Duration,
    pub max_persistence_retries: u32,
    pub replay_period: Duration,
}

impl Default for DeliverySnapshot {
    fn default() -> Self {
        // defaults are valid by construction
        Self {
            max_cache_size_bytes: default_max_cache_size_megabytes() * MEGABYTE,
            max_cache_offset_age: default_max_cache_offset_age(),
            persistence_period: Duration::from_secs_f64(default_state_persistence_period_seconds()),
            outbound_batch_timeout: Duration::from_secs_f64(
                default_outbound_batch_processing_timeout_seconds(),
            ),
            max_persistence_retries: default_max_number_of_persistence_retries(),
            replay_period: Duration::from_secs_f64(default_message_replay_period_seconds()),
        }
    }
}

fn positive_seconds(name: &str, value: f64) -> AppResult<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::InvalidValue(format!("{name}: {value}")));
    }
    Ok(Duration::from_secs_f64(value))
}

impl TryFrom<&DeliverySettings> for DeliverySnapshot {
    type Error = AppError;

    fn try_from(settings: &DeliverySettings) -> AppResult<Self> {
        if settings.max_cache_size_megabytes == 0 {
            return Err(AppError::InvalidValue(
                "max_cache_size_megabytes: 0".to_string(),
            ));
        }
        if settings.max_cache_offset_age < 0 {
            return Err(AppError::InvalidValue(format!(
                "max_cache_offset_age: {}",
                settings.max_cache_offset_age
            )));
        }
        if settings.max_number_of_persistence_retries == 0 {
            return Err(AppError::InvalidValue(
                "max_number_of_persistence_retries: 0".to_string(),
            ));
        }
        Ok(Self {
            max_cache_size_bytes: settings.max_cache_size_megabytes.saturating_mul(MEGABYTE),
            max_cache_offset_age: settings.max_cache_offset_age,
            persistence_period: positive_seconds(
                "state_persistence_period_seconds",
                settings.state_persistence_period_seconds,
            )?,
            outbound_batch_timeout: positive_seconds(
                "outbound_batch_processing_timeout_seconds",
                settings.outbound_batch_processing_timeout_seconds,
            )?,
            max_persistence_retries: settings.max_number_of_persistence_retries,
            replay_period: positive_seconds(
                "message_replay_period_seconds",
                settings.message_replay_period_seconds,
            )?,
        })
    }
}

/// Holds the current [`DeliverySnapshot`] and notifies subscribers when it is replaced.
///
/// Replacement swaps a whole `Arc`, so a reader holding the previous snapshot keeps a
/// consistent view until it asks again.
#[derive(Debug)]
pub struct ConfigHolder {
    sender: watch::Sender<Arc<DeliverySnapshot>>,
}

impl ConfigHolder {
    pub fn new(snapshot: DeliverySnapshot) -> Self {
        let (sender, _) = watch::channel(Arc::new(snapshot));
        Self { sender }
    }

    pub fn from_settings(settings: &DeliverySettings) -> AppResult<Self> {
        Ok(Self::new(DeliverySnapshot::try_from(settings)?))
    }

    pub fn current(&self) -> Arc<DeliverySnapshot> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DeliverySnapshot>> {
        self.sender.subscribe()
    }

    /// Validates and publishes new settings. Invalid settings leave the current snapshot in place.
    pub fn apply(&self, settings: &DeliverySettings) -> AppResult<Arc<DeliverySnapshot>> {
        let snapshot = Arc::new(DeliverySnapshot::try_from(settings)?);
        self.sender.send_replace(snapshot.clone());
        info!("delivery configuration replaced: {:?}", snapshot);
        Ok(snapshot)
    }
}

impl Default for ConfigHolder {
    fn default() -> Self {
        Self::new(DeliverySnapshot::default())
    }
}
