//! Configuration for the Weighpoint control core.
//!
//! This module provides configuration types and presets for the weighing
//! station, from bench testing to battery-constrained field deployments.
//!
//! # Configuration Presets
//!
//! The [`Config`] type provides preset configurations for common scenarios:
//!
//! - [`Config::low_power()`] - Battery-optimized for long unattended runtime
//! - [`Config::test_mode()`] - In-memory collaborators and short timeouts
//!
//! # Examples
//!
//! ```
//! # use weighpoint_core::Config;
//! // Use the low-power preset for field deployment
//! let config = Config::low_power();
//!
//! // Or create a custom configuration
//! let mut config = Config::default();
//! config.transfer.ack_timeout = std::time::Duration::from_secs(10);
//! config.store.db_path = "./station_7.db".to_string();
//! config.validate().expect("valid config");
//! ```

use crate::display::DisplayMode;
use crate::types::TxSchedule;
use crate::{ENV_ACK_TIMEOUT_MS, ENV_DB_PATH, ENV_DEVICE_ID, ENV_LOW_POWER, ENV_SENSE_INTERVAL_SECS, ENV_SERVER_ADDR};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the checksummed transfer protocol.
///
/// Controls how many times a payload is retransmitted after a digest
/// mismatch or an acknowledgment timeout before the transfer is abandoned
/// and the local source preserved.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::TransferConfig;
/// let config = TransferConfig::default();
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// The maximum number of transmission attempts per session.
    ///
    /// A mismatched echo digest and a reply timeout both consume one
    /// attempt. Once exhausted, the session fails and the payload source
    /// stays on the device for a later retry.
    pub max_attempts: u32,
    /// How long to wait for the server's echoed digest before treating the
    /// attempt as failed.
    pub ack_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_TRANSFER_MAX_ATTEMPTS,
            ack_timeout: Duration::from_millis(crate::DEFAULT_ACK_TIMEOUT_MS),
        }
    }
}

/// Configuration for the recurring-work scheduler and the sensing loop.
///
/// Transmission times themselves are not configured here; they are assigned
/// by the server and persisted as a [`TxSchedule`](crate::TxSchedule).
///
/// # Examples
///
/// ```
/// # use weighpoint_core::ScheduleConfig;
/// let config = ScheduleConfig::default();
/// assert_eq!(config.sense_interval.as_secs(), 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Period of the recurring device status check.
    pub status_check_period: Duration,
    /// Period of the recurring clock synchronization against the time server.
    pub clock_sync_period: Duration,
    /// Interval between load-cell readings while the device is active.
    pub sense_interval: Duration,
    /// Transmission times to use until the server assigns a schedule.
    pub fallback_tx: TxSchedule,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            status_check_period: Duration::from_secs(24 * 60 * 60),
            clock_sync_period: Duration::from_secs(24 * 60 * 60),
            sense_interval: Duration::from_secs(60),
            fallback_tx: TxSchedule::default(),
        }
    }
}

/// The storage backend for logs, records, and persisted keys.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::{StoreConfig, StoreBackendType};
/// let config = StoreConfig {
///     backend: StoreBackendType::Sqlite,
///     db_path: "./station.db".to_string(),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendType {
    /// Use SQLite for storage.
    ///
    /// A single-file database that survives power loss and deep sleep.
    /// This is the backend for deployed stations.
    Sqlite,
    /// Use in-memory storage.
    ///
    /// Data is lost when the process stops. Intended for tests and
    /// simulation runs.
    Memory,
}

impl Default for StoreBackendType {
    fn default() -> Self {
        Self::Sqlite
    }
}

impl std::fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Configuration for the persistence layer.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::StoreConfig;
/// let config = StoreConfig::sqlite("./station_data.db");
/// assert_eq!(config.db_path, "./station_data.db");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The [`StoreBackendType`] to use.
    pub backend: StoreBackendType,
    /// The path to the database file. Ignored for the `Memory` backend.
    pub db_path: String,
    /// Maximum number of log rows before the final full-marker row is
    /// written and further rows are dropped.
    pub log_capacity: usize,
    /// Maximum number of weight records the data table holds between
    /// transmissions.
    pub table_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendType::default(),
            db_path: "./weighpoint.db".to_string(),
            log_capacity: crate::DEFAULT_LOG_CAPACITY,
            table_capacity: crate::DATA_TABLE_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Creates a new SQLite storage configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::{StoreConfig, StoreBackendType};
    /// let config = StoreConfig::sqlite("./field.db");
    /// assert_eq!(config.backend, StoreBackendType::Sqlite);
    /// ```
    pub fn sqlite(path: &str) -> Self {
        Self {
            backend: StoreBackendType::Sqlite,
            db_path: path.to_string(),
            ..Default::default()
        }
    }

    /// Creates a new in-memory storage configuration for testing.
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::StoreConfig;
    /// let config = StoreConfig::memory();
    /// assert_eq!(config.db_path, ":memory:");
    /// ```
    pub fn memory() -> Self {
        Self {
            backend: StoreBackendType::Memory,
            db_path: ":memory:".to_string(),
            ..Default::default()
        }
    }
}

/// The server link to use.
///
/// CoAP over UDP is the deployed transport; the in-memory link exists for
/// tests and simulation.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::LinkConfig;
/// let link = LinkConfig::Coap {
///     server_addr: "192.0.2.10:5683".to_string(),
///     time_server_addr: "192.0.2.10:5683".to_string(),
///     bind_addr: "0.0.0.0:0".to_string(),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkConfig {
    /// An in-memory link that never touches the network.
    Memory,
    /// A CoAP/UDP link to the collection server.
    Coap {
        /// Address of the collection server (`host:port`).
        server_addr: String,
        /// Address of the time server used for clock synchronization.
        time_server_addr: String,
        /// Local address to bind the UDP socket to.
        bind_addr: String,
    },
}

impl Default for LinkConfig {
    /// Defaults to CoAP on the standard port; the device is an IoT client.
    fn default() -> Self {
        Self::Coap {
            server_addr: "192.168.1.1:5683".to_string(),
            time_server_addr: "192.168.1.1:5683".to_string(),
            bind_addr: "0.0.0.0:0".to_string(),
        }
    }
}

/// The main configuration for the Weighpoint control core.
///
/// This struct contains every tunable the station needs, from the server
/// link to retry policy to the plausibility band for calibration weights.
///
/// # Configuration Presets
///
/// Use one of the preset methods for common scenarios:
/// - [`Config::low_power()`] - Battery-optimized field deployment
/// - [`Config::test_mode()`] - In-memory everything for tests
///
/// # Examples
///
/// ```
/// # use weighpoint_core::Config;
/// let mut config = Config::default();
/// config.device_id = Some("station-7".to_string());
/// config.validate().expect("valid config");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The device identity, if already assigned.
    ///
    /// If `None`, the device requests an identity from the server during
    /// setup and persists the assignment.
    pub device_id: Option<String>,

    /// Weight in grams of the reference plate installed on this station.
    ///
    /// Reported to the server during setup; the server echoes it back during
    /// calibration as the reference weight.
    pub plate_grams: u32,

    /// Lower bound of the plausible band for calibration weights, in grams.
    pub plate_min_grams: u32,

    /// Upper bound of the plausible band for calibration weights, in grams.
    pub plate_max_grams: u32,

    /// Minimum operational battery voltage.
    ///
    /// Measurements below this are a critical status failure.
    pub min_battery_volts: f32,

    /// Capacity of the bounded event queue.
    pub queue_capacity: usize,

    /// Where operator indications are rendered.
    pub display_mode: DisplayMode,

    /// The server link configuration.
    pub link: LinkConfig,

    /// The transfer retry policy.
    pub transfer: TransferConfig,

    /// Recurring-work periods and the sensing interval.
    pub schedule: ScheduleConfig,

    /// The persistence configuration.
    pub store: StoreConfig,

    /// The logging level.
    ///
    /// Valid values: "trace", "debug", "info", "warn", "error".
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            plate_grams: 1000,
            plate_min_grams: crate::PLATE_MIN_GRAMS,
            plate_max_grams: crate::PLATE_MAX_GRAMS,
            min_battery_volts: crate::MIN_BATTERY_VOLTS,
            queue_capacity: crate::EVENT_QUEUE_CAPACITY,
            display_mode: DisplayMode::Both,
            link: LinkConfig::default(),
            transfer: TransferConfig::default(),
            schedule: ScheduleConfig::default(),
            store: StoreConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Returns a configuration optimized for battery-operated field
    /// deployment.
    ///
    /// This configuration features:
    /// - Longer acknowledgment timeouts (poor rural links)
    /// - A slower sensing interval (5 minutes)
    /// - LED-only operator indications (no host attached)
    /// - Error-level logging
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::Config;
    /// let config = Config::low_power();
    /// assert_eq!(config.schedule.sense_interval.as_secs(), 300);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn low_power() -> Self {
        Self {
            display_mode: DisplayMode::LedOnly,
            transfer: TransferConfig {
                max_attempts: crate::DEFAULT_TRANSFER_MAX_ATTEMPTS,
                ack_timeout: Duration::from_secs(15),
            },
            schedule: ScheduleConfig {
                sense_interval: Duration::from_secs(300),
                ..Default::default()
            },
            log_level: "error".to_string(),
            ..Default::default()
        }
    }

    /// Returns a configuration optimized for testing.
    ///
    /// This configuration features:
    /// - In-memory storage (no disk I/O)
    /// - In-memory server link (no network)
    /// - Short acknowledgment timeouts (50ms)
    /// - A pre-assigned device identity
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::Config;
    /// let config = Config::test_mode();
    /// assert!(config.device_id.is_some());
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn test_mode() -> Self {
        Self {
            device_id: Some("test-device".to_string()),
            display_mode: DisplayMode::ComputerOnly,
            link: LinkConfig::Memory,
            transfer: TransferConfig {
                max_attempts: crate::DEFAULT_TRANSFER_MAX_ATTEMPTS,
                ack_timeout: Duration::from_millis(50),
            },
            schedule: ScheduleConfig {
                status_check_period: Duration::from_millis(500),
                clock_sync_period: Duration::from_millis(500),
                sense_interval: Duration::from_millis(20),
                ..Default::default()
            },
            store: StoreConfig::memory(),
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Creates a `Config` from environment variables.
    ///
    /// This method reads configuration from the following environment
    /// variables:
    /// - `WEIGHPOINT_LOW_POWER` - If set, use the low-power preset as base
    /// - `WEIGHPOINT_SERVER_ADDR` - Collection server address (`host:port`)
    /// - `WEIGHPOINT_DEVICE_ID` - Pre-assigned device identity
    /// - `WEIGHPOINT_DB_PATH` - Path to the SQLite database file
    /// - `WEIGHPOINT_SENSE_INTERVAL_SECS` - Override the sensing interval
    /// - `WEIGHPOINT_ACK_TIMEOUT_MS` - Override the acknowledgment timeout
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::Config;
    /// let config = Config::from_env();
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn from_env() -> Self {
        let mut config = if std::env::var(ENV_LOW_POWER).is_ok() {
            Self::low_power()
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var(ENV_SERVER_ADDR) {
            let time_addr = addr.clone();
            if let LinkConfig::Coap {
                server_addr,
                time_server_addr,
                ..
            } = &mut config.link
            {
                *server_addr = addr;
                *time_server_addr = time_addr;
            }
        }

        if let Ok(id) = std::env::var(ENV_DEVICE_ID) {
            if !id.is_empty() {
                config.device_id = Some(id);
            }
        }

        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            config.store.db_path = path;
        }

        if let Ok(secs_str) = std::env::var(ENV_SENSE_INTERVAL_SECS) {
            if let Ok(secs) = secs_str.parse::<u64>() {
                config.schedule.sense_interval = Duration::from_secs(secs);
            }
        }

        if let Ok(ms_str) = std::env::var(ENV_ACK_TIMEOUT_MS) {
            if let Ok(ms) = ms_str.parse::<u64>() {
                config.transfer.ack_timeout = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Validates the configuration to ensure settings are usable.
    ///
    /// This method checks that:
    /// - The event queue holds at least one event
    /// - The transfer policy allows at least one attempt
    /// - The plate plausibility band is non-empty
    /// - The sensing interval is non-zero
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`ConfigError`] variant for the first
    /// violated constraint.
    ///
    /// # Examples
    ///
    /// ```
    /// # use weighpoint_core::Config;
    /// let config = Config::default();
    /// assert!(config.validate().is_ok());
    ///
    /// let mut bad_config = Config::default();
    /// bad_config.queue_capacity = 0;
    /// assert!(bad_config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::QueueTooSmall(self.queue_capacity));
        }

        if self.transfer.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }

        if self.plate_min_grams >= self.plate_max_grams {
            return Err(ConfigError::PlateBandEmpty {
                min: self.plate_min_grams,
                max: self.plate_max_grams,
            });
        }

        if self.schedule.sense_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sense interval must be non-zero".to_string(),
            ));
        }

        if !(1.0..=6.0).contains(&self.min_battery_volts) {
            return Err(ConfigError::Invalid(format!(
                "minimum battery voltage {} outside 1.0-6.0 V",
                self.min_battery_volts
            )));
        }

        Ok(())
    }
}

/// Defines errors that can occur during configuration validation.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::Config;
/// let mut config = Config::default();
/// config.queue_capacity = 0;
///
/// match config.validate() {
///     Err(e) => println!("Config error: {}", e),
///     Ok(_) => println!("Config is valid"),
/// }
/// ```
#[derive(Debug)]
pub enum ConfigError {
    /// The event queue capacity is zero.
    QueueTooSmall(usize),
    /// The transfer policy allows zero attempts.
    NoAttempts,
    /// The plate plausibility band contains no weights.
    PlateBandEmpty { min: u32, max: u32 },
    /// The configuration contains an invalid setting.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::QueueTooSmall(size) => {
                write!(f, "Event queue capacity too small: {} (minimum 1)", size)
            }
            ConfigError::NoAttempts => {
                write!(f, "Transfer policy must allow at least one attempt")
            }
            ConfigError::PlateBandEmpty { min, max } => {
                write!(f, "Plate plausibility band {}-{} g is empty", min, max)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
