//! Error types for the Weighpoint control core.
//!
//! This module provides the error hierarchy for the control plane, with
//! specific error types per subsystem so callers can react precisely:
//! retry, re-route to setup, escalate to a log transmission, or just log and
//! continue.
//!
//! # Error Categories
//!
//! - **Config**: configuration and validation errors
//! - **Queue**: bounded event-queue failures (full, empty)
//! - **Schedule**: scheduler failures (no scheduled work)
//! - **Lifecycle**: provisioning and calibration failures
//! - **Transfer**: checksummed transfer failures
//! - **Network**: server-link communication failures
//! - **Status**: status-check probe failures
//! - **Storage**: log/data-table/key-value persistence failures
//!
//! # Examples
//!
//! ```
//! # use weighpoint_core::{Error, NetworkError, Result};
//! fn example_operation() -> Result<()> {
//!     let err = Error::Network(NetworkError::Timeout {
//!         what: "activation ack".to_string(),
//!         timeout_ms: 5000,
//!     });
//!
//!     if err.is_comm() {
//!         // Raise the communication-problem flag, keep the loop running.
//!     }
//!
//!     println!("Error code: {}", err.code());
//!     Ok(())
//! }
//! ```

use crate::config::ConfigError;
use crate::types::PayloadKind;

/// A specialized `Result` type for control-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the Weighpoint control core.
#[derive(Debug)]
pub enum Error {
    /// An error related to the device configuration.
    Config(ConfigError),
    /// An error from the bounded event queue.
    Queue(QueueError),
    /// An error from the deep-sleep scheduler.
    Schedule(ScheduleError),
    /// An error from the lifecycle state machine.
    Lifecycle(LifecycleError),
    /// An error from the checksummed transfer protocol.
    Transfer(TransferError),
    /// An error from the server link.
    Network(NetworkError),
    /// An error from a status-check probe.
    Status(StatusError),
    /// An error from the persistence collaborator.
    Storage(StorageError),
    /// An error during data serialization or deserialization.
    Serialization(String),
    /// An error from the underlying I/O system.
    Io(std::io::Error),
    /// An unexpected internal error, which may indicate a bug.
    Internal(String),
}

/// Errors from the bounded event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity; the event was not inserted and existing
    /// contents are unchanged.
    Full { capacity: usize },
    /// `dequeue` was called on an empty queue.
    Empty,
}

/// Errors from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// No recurring action is registered, so there is no wake deadline to
    /// arm. Sleeping indefinitely would brick the device.
    NoScheduledWork,
}

/// Errors from the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Required identifiers or endpoints are missing; provisioning must
    /// finish before the requested activity can run.
    SetupIncomplete { missing: String },
    /// The server-provided reference plate weight is outside the plausible
    /// band.
    InvalidPlateWeight { grams: u32, min: u32, max: u32 },
}

/// Errors from the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Every attempt ended in a checksum mismatch or timeout. The local
    /// source is preserved.
    IntegrityFailure { kind: PayloadKind, attempts: u32 },
    /// A session for this payload kind is already in flight.
    SessionBusy { kind: PayloadKind },
    /// The payload source read back empty or unreadable.
    SourceUnavailable { kind: PayloadKind, reason: String },
}

/// Errors from the server link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// No reply arrived within the timeout.
    Timeout { what: String, timeout_ms: u64 },
    /// The message could not be sent.
    SendFailed { what: String, reason: String },
    /// The server replied, but not with the expected acknowledgment.
    UnexpectedReply { expected: String, got: String },
    /// Address parsing failed.
    InvalidAddress { addr: String },
    /// Generic link error.
    Other(String),
}

/// Errors from status-check probes.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusError {
    /// Measured battery voltage is below the operational minimum.
    LowBattery { measured_volts: f32, min_volts: f32 },
    /// Sensor readings exist but do not make sense.
    SensorImplausible { reason: String },
    /// A probe could not produce a reading at all.
    ProbeFailed { probe: String, reason: String },
}

/// Errors from the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend connection or open failed.
    ConnectionFailed { path: String, reason: String },
    /// A backend query failed.
    QueryFailed { reason: String },
    /// The log file is at capacity; the final marker row has been written.
    LogFull { capacity: usize },
    /// The data table is at capacity.
    TableFull { capacity: usize },
    /// A persisted key was requested but never stored.
    KeyNotFound { key: String },
    /// Generic storage error.
    Other(String),
}

// ============================================================================
// Display implementations
// ============================================================================

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Queue(e) => write!(f, "Queue error: {}", e),
            Error::Schedule(e) => write!(f, "Schedule error: {}", e),
            Error::Lifecycle(e) => write!(f, "Lifecycle error: {}", e),
            Error::Transfer(e) => write!(f, "Transfer error: {}", e),
            Error::Network(e) => write!(f, "Network error: {}", e),
            Error::Status(e) => write!(f, "Status error: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Serialization(s) => write!(f, "Serialization error: {}", s),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Internal(s) => write!(f, "Internal error: {}", s),
        }
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full { capacity } => write!(f, "queue full (capacity: {})", capacity),
            QueueError::Empty => write!(f, "queue empty"),
        }
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::NoScheduledWork => write!(f, "no scheduled work to arm"),
        }
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::SetupIncomplete { missing } => {
                write!(f, "setup incomplete: missing {}", missing)
            }
            LifecycleError::InvalidPlateWeight { grams, min, max } => {
                write!(
                    f,
                    "invalid plate weight {} g (plausible band {}-{} g)",
                    grams, min, max
                )
            }
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::IntegrityFailure { kind, attempts } => {
                write!(
                    f,
                    "{} transfer failed integrity check after {} attempts",
                    kind, attempts
                )
            }
            TransferError::SessionBusy { kind } => {
                write!(f, "a {} transfer is already in flight", kind)
            }
            TransferError::SourceUnavailable { kind, reason } => {
                write!(f, "{} source unavailable: {}", kind, reason)
            }
        }
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Timeout { what, timeout_ms } => {
                write!(f, "timed out waiting for {} after {}ms", what, timeout_ms)
            }
            NetworkError::SendFailed { what, reason } => {
                write!(f, "send of {} failed: {}", what, reason)
            }
            NetworkError::UnexpectedReply { expected, got } => {
                write!(f, "expected {}, got {}", expected, got)
            }
            NetworkError::InvalidAddress { addr } => write!(f, "invalid address: {}", addr),
            NetworkError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::LowBattery {
                measured_volts,
                min_volts,
            } => {
                write!(
                    f,
                    "battery at {:.2} V, below minimum {:.2} V",
                    measured_volts, min_volts
                )
            }
            StatusError::SensorImplausible { reason } => {
                write!(f, "sensor reading implausible: {}", reason)
            }
            StatusError::ProbeFailed { probe, reason } => {
                write!(f, "{} probe failed: {}", probe, reason)
            }
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::ConnectionFailed { path, reason } => {
                write!(f, "storage at '{}' failed to open: {}", path, reason)
            }
            StorageError::QueryFailed { reason } => write!(f, "query failed: {}", reason),
            StorageError::LogFull { capacity } => {
                write!(f, "log file full (capacity: {} rows)", capacity)
            }
            StorageError::TableFull { capacity } => {
                write!(f, "data table full (capacity: {} records)", capacity)
            }
            StorageError::KeyNotFound { key } => write!(f, "key not found: {}", key),
            StorageError::Other(s) => write!(f, "{}", s),
        }
    }
}

// ============================================================================
// std::error::Error implementations
// ============================================================================

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for QueueError {}
impl std::error::Error for ScheduleError {}
impl std::error::Error for LifecycleError {}
impl std::error::Error for TransferError {}
impl std::error::Error for NetworkError {}
impl std::error::Error for StatusError {}
impl std::error::Error for StorageError {}

// ============================================================================
// From implementations
// ============================================================================

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        Error::Queue(e)
    }
}

impl From<ScheduleError> for Error {
    fn from(e: ScheduleError) -> Self {
        Error::Schedule(e)
    }
}

impl From<LifecycleError> for Error {
    fn from(e: LifecycleError) -> Self {
        Error::Lifecycle(e)
    }
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        Error::Transfer(e)
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::Network(e)
    }
}

impl From<StatusError> for Error {
    fn from(e: StatusError) -> Self {
        Error::Status(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(StorageError::QueryFailed {
            reason: e.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

// ============================================================================
// Convenience constructors and classification helpers
// ============================================================================

impl Error {
    /// Create a generic network error from a string.
    pub fn network(s: impl Into<String>) -> Self {
        Error::Network(NetworkError::Other(s.into()))
    }

    /// Create a generic storage error from a string.
    pub fn storage(s: impl Into<String>) -> Self {
        Error::Storage(StorageError::Other(s.into()))
    }

    /// Create a network timeout error.
    pub fn timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        Error::Network(NetworkError::Timeout {
            what: what.into(),
            timeout_ms,
        })
    }

    /// Returns `true` if this is a communication failure: a link error or a
    /// transfer that exhausted its attempts. These raise the device's
    /// communication-problem flag.
    pub fn is_comm(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Transfer(TransferError::IntegrityFailure { .. })
        )
    }

    /// Returns `true` if the error is likely recoverable on a later attempt
    /// (e.g. a transient link failure or a busy transfer slot).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network(e) => matches!(
                e,
                NetworkError::Timeout { .. }
                    | NetworkError::SendFailed { .. }
                    | NetworkError::UnexpectedReply { .. }
                    | NetworkError::Other(_)
            ),
            Error::Transfer(TransferError::SessionBusy { .. }) => true,
            Error::Queue(QueueError::Full { .. }) => true,
            _ => false,
        }
    }

    /// Returns `true` if the failing activity must re-route to Setup before
    /// it can proceed.
    pub fn needs_setup(&self) -> bool {
        matches!(self, Error::Lifecycle(LifecycleError::SetupIncomplete { .. }))
    }

    /// Returns an error code string for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "E_CONFIG",
            Error::Queue(e) => match e {
                QueueError::Full { .. } => "E_QUEUE_FULL",
                QueueError::Empty => "E_QUEUE_EMPTY",
            },
            Error::Schedule(ScheduleError::NoScheduledWork) => "E_SCHED_NO_WORK",
            Error::Lifecycle(e) => match e {
                LifecycleError::SetupIncomplete { .. } => "E_SETUP_INCOMPLETE",
                LifecycleError::InvalidPlateWeight { .. } => "E_PLATE_WEIGHT",
            },
            Error::Transfer(e) => match e {
                TransferError::IntegrityFailure { .. } => "E_XFER_INTEGRITY",
                TransferError::SessionBusy { .. } => "E_XFER_BUSY",
                TransferError::SourceUnavailable { .. } => "E_XFER_SOURCE",
            },
            Error::Network(e) => match e {
                NetworkError::Timeout { .. } => "E_NET_TIMEOUT",
                NetworkError::SendFailed { .. } => "E_NET_SEND_FAILED",
                NetworkError::UnexpectedReply { .. } => "E_NET_UNEXPECTED",
                NetworkError::InvalidAddress { .. } => "E_NET_INVALID_ADDR",
                NetworkError::Other(_) => "E_NET_OTHER",
            },
            Error::Status(e) => match e {
                StatusError::LowBattery { .. } => "E_STATUS_LOW_BATTERY",
                StatusError::SensorImplausible { .. } => "E_STATUS_SENSOR",
                StatusError::ProbeFailed { .. } => "E_STATUS_PROBE",
            },
            Error::Storage(e) => match e {
                StorageError::ConnectionFailed { .. } => "E_STOR_CONN",
                StorageError::QueryFailed { .. } => "E_STOR_QUERY",
                StorageError::LogFull { .. } => "E_STOR_LOG_FULL",
                StorageError::TableFull { .. } => "E_STOR_TABLE_FULL",
                StorageError::KeyNotFound { .. } => "E_STOR_KEY",
                StorageError::Other(_) => "E_STOR_OTHER",
            },
            Error::Serialization(_) => "E_SERDE",
            Error::Io(_) => "E_IO",
            Error::Internal(_) => "E_INTERNAL",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                Error::Queue(QueueError::Full { capacity: 10 }),
                "Queue error: queue full (capacity: 10)",
            ),
            (Error::Queue(QueueError::Empty), "Queue error: queue empty"),
            (
                Error::Schedule(ScheduleError::NoScheduledWork),
                "Schedule error: no scheduled work to arm",
            ),
            (
                Error::Lifecycle(LifecycleError::SetupIncomplete {
                    missing: "server address".to_string(),
                }),
                "Lifecycle error: setup incomplete: missing server address",
            ),
            (
                Error::Transfer(TransferError::IntegrityFailure {
                    kind: PayloadKind::Log,
                    attempts: 3,
                }),
                "Transfer error: log transfer failed integrity check after 3 attempts",
            ),
            (
                Error::Network(NetworkError::Timeout {
                    what: "activation ack".to_string(),
                    timeout_ms: 5000,
                }),
                "Network error: timed out waiting for activation ack after 5000ms",
            ),
            (
                Error::Serialization("invalid json".into()),
                "Serialization error: invalid json",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(format!("{}", error), expected);
        }
    }

    #[test]
    fn test_status_error_display() {
        assert_eq!(
            format!(
                "{}",
                StatusError::LowBattery {
                    measured_volts: 2.97,
                    min_volts: 3.02,
                }
            ),
            "battery at 2.97 V, below minimum 3.02 V"
        );
        assert_eq!(
            format!(
                "{}",
                StatusError::ProbeFailed {
                    probe: "battery".to_string(),
                    reason: "adc saturated".to_string(),
                }
            ),
            "battery probe failed: adc saturated"
        );
    }

    #[test]
    fn test_storage_error_display() {
        assert_eq!(
            format!("{}", StorageError::LogFull { capacity: 512 }),
            "log file full (capacity: 512 rows)"
        );
        assert_eq!(
            format!(
                "{}",
                StorageError::KeyNotFound {
                    key: "cal-ratio".to_string()
                }
            ),
            "key not found: cal-ratio"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::Queue(QueueError::Full { capacity: 3 }).code(),
            "E_QUEUE_FULL"
        );
        assert_eq!(Error::Queue(QueueError::Empty).code(), "E_QUEUE_EMPTY");
        assert_eq!(
            Error::Schedule(ScheduleError::NoScheduledWork).code(),
            "E_SCHED_NO_WORK"
        );
        assert_eq!(
            Error::Lifecycle(LifecycleError::SetupIncomplete {
                missing: "identity".to_string()
            })
            .code(),
            "E_SETUP_INCOMPLETE"
        );
        assert_eq!(
            Error::Transfer(TransferError::IntegrityFailure {
                kind: PayloadKind::Data,
                attempts: 3
            })
            .code(),
            "E_XFER_INTEGRITY"
        );
        assert_eq!(Error::timeout("ping", 2000).code(), "E_NET_TIMEOUT");
        assert_eq!(
            Error::Status(StatusError::LowBattery {
                measured_volts: 2.9,
                min_volts: 3.02
            })
            .code(),
            "E_STATUS_LOW_BATTERY"
        );
    }

    #[test]
    fn test_is_comm() {
        assert!(Error::timeout("ack", 5000).is_comm());
        assert!(Error::network("link down").is_comm());
        assert!(Error::Transfer(TransferError::IntegrityFailure {
            kind: PayloadKind::Log,
            attempts: 3
        })
        .is_comm());

        assert!(!Error::Queue(QueueError::Empty).is_comm());
        assert!(!Error::Transfer(TransferError::SessionBusy {
            kind: PayloadKind::Log
        })
        .is_comm());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::timeout("ack", 5000).is_recoverable());
        assert!(Error::Queue(QueueError::Full { capacity: 10 }).is_recoverable());
        assert!(Error::Transfer(TransferError::SessionBusy {
            kind: PayloadKind::Data
        })
        .is_recoverable());

        assert!(!Error::Transfer(TransferError::IntegrityFailure {
            kind: PayloadKind::Data,
            attempts: 3
        })
        .is_recoverable());
        assert!(!Error::Schedule(ScheduleError::NoScheduledWork).is_recoverable());
    }

    #[test]
    fn test_needs_setup() {
        assert!(Error::Lifecycle(LifecycleError::SetupIncomplete {
            missing: "identity".to_string()
        })
        .needs_setup());
        assert!(!Error::network("x").needs_setup());
    }

    #[test]
    fn test_from_specific_errors() {
        let q: Error = QueueError::Empty.into();
        assert!(matches!(q, Error::Queue(_)));

        let s: Error = ScheduleError::NoScheduledWork.into();
        assert!(matches!(s, Error::Schedule(_)));

        let t: Error = TransferError::SessionBusy {
            kind: PayloadKind::Log,
        }
        .into();
        assert!(matches!(t, Error::Transfer(_)));

        let n: Error = NetworkError::Other("x".into()).into();
        assert!(matches!(n, Error::Network(_)));

        let st: Error = StorageError::Other("x".into()).into();
        assert!(matches!(st, Error::Storage(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: Error = io_err.into();
        assert!(matches!(error, Error::Io(_)));
        assert_eq!(error.code(), "E_IO");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str("invalid");
        let error: Error = json_result.unwrap_err().into();
        assert!(matches!(error, Error::Serialization(_)));
        assert_eq!(error.code(), "E_SERDE");
    }

    #[test]
    fn test_error_is_error_trait() {
        use std::error::Error as StdError;

        let error = Error::Internal("test".into());
        let _: &dyn StdError = &error;

        let io_err = std::io::Error::other("test");
        let error = Error::Io(io_err);
        assert!(StdError::source(&error).is_some());
    }
}
