#![doc = include_str!("../README.md")]
#![allow(rustdoc::bare_urls)]
//! # Weighpoint Core - Field Weighing Station Control
//!
//! Event-driven control core for a battery-powered, deep-sleeping weight
//! sensing station.
//!
//! ## Overview
//!
//! A Weighpoint station spends almost all of its life asleep. It wakes for
//! exactly two reasons: a scheduled action came due, or a producer (button,
//! server directive) enqueued an event. Everything the device does runs
//! through one bounded priority queue and one dispatch loop, so there is a
//! single place where state changes and a single order in which it changes.
//!
//! ## Features
//!
//! - **Bounded priority event queue**: three tiers, FIFO within a tier,
//!   never blocks a producer
//! - **Deep-sleep scheduler**: the device sleeps until the earliest of its
//!   recurring actions, never polls
//! - **Checksummed transfers**: BLAKE3 digest echo with bounded retries;
//!   payloads survive on the device until the server confirms
//! - **Lifecycle safety**: setup, activation, and deactivation resequence
//!   themselves so the device is never provisioned mid-measurement
//! - **Pluggable hardware**: load cell, battery gauge, display, and clock
//!   behind traits, with in-memory doubles for every one of them
//! - **CoAP uplink**: lightweight UDP transport for the field radio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use weighpoint_core::{
//!     AutoConfirm, Config, Event, EventKind, LifecycleController, LogDisplay, MemoryLink,
//!     MemoryStore, SystemClock,
//! };
//! use weighpoint_core::sensors::{MockBatteryGauge, MockLoadCell};
//!
//! fn main() -> weighpoint_core::Result<()> {
//!     let config = Config::default();
//!     let display_mode = config.display_mode;
//!     let mut controller = LifecycleController::new(
//!         config,
//!         Arc::new(MemoryLink::new()),
//!         Arc::new(Mutex::new(MemoryStore::new())),
//!         Arc::new(MockLoadCell::new(0)),
//!         Arc::new(MockBatteryGauge::new(3.9)),
//!         Arc::new(LogDisplay::new(display_mode)),
//!         Arc::new(AutoConfirm),
//!         Arc::new(SystemClock),
//!     )?;
//!
//!     // Boot sequence: provision, then go on duty.
//!     let queue = controller.queue();
//!     queue.enqueue(Event::immediate(EventKind::Setup))?;
//!     queue.enqueue(Event::urgent(EventKind::Activate))?;
//!
//!     smol::block_on(controller.run())
//! }
//! ```
//!
//! ## Event Priorities
//!
//! | Tier | Value | Used for |
//! |------|-------|----------|
//! | immediate | 0 | lifecycle resequencing |
//! | urgent | 1 | escalations and activation follow-ups |
//! | routine | 2 | scheduled and operator-initiated work |
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `coap` | CoAP uplink to the server (default) | coap-lite |
//! | `sqlite` | SQLite storage backend (default) | rusqlite |
//! | `embedded` | HX711 load-cell driver | embedded-hal |

#[cfg(feature = "coap")]
pub mod coap;
pub mod config;
pub mod context;
pub mod controller;
pub mod display;
pub mod error;
pub mod network;
pub mod power;
pub mod queue;
pub mod schedule;
pub mod sensors;
pub mod status;
pub mod store;
pub mod transfer;
pub mod types;

// Storage backends (feature-gated); the trait lives in `store`.
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

// Re-exports
#[cfg(feature = "coap")]
pub use coap::CoapLink;
pub use config::{
    Config, ConfigError, LinkConfig, ScheduleConfig, StoreBackendType, StoreConfig, TransferConfig,
};
pub use context::DeviceContext;
pub use controller::{
    on_button_press, AutoConfirm, ButtonPress, ControllerStats, LifecycleController,
    LifecycleState, OperatorInput, ScriptedOperator,
};
pub use display::{DisplayMode, DisplaySink, LogDisplay, PatternId, RecordingDisplay};
pub use error::{
    Error, LifecycleError, NetworkError, QueueError, Result, ScheduleError, StatusError,
    StorageError, TransferError,
};
pub use network::{LinkStats, MemoryLink, Message, NoticeKind, ServerLink};
pub use power::{BatteryInfo, PowerManager, SleepConfig, WakeReason};
pub use queue::{EventQueue, Prioritized, PriorityQueue};
pub use schedule::{Clock, ManualClock, RecurringKind, ScheduledAction, Scheduler, SystemClock};
pub use sensors::{BatteryGauge, CalRatio, LoadCell};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;
pub use status::{StatusCode, StatusMonitor, StatusReport};
pub use store::{DataTable, DeviceStore, LogFile, MemoryStore, StoreStats};
pub use transfer::{TransferManager, TransferReceipt, TransferStats};
pub use types::*;

/// Version information for the crate.
///
/// # Examples
///
/// ```
/// # use weighpoint_core::VERSION;
/// println!("Weighpoint core version: {}", VERSION);
/// ```
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.85";

/// Capacity of the control event queue.
///
/// Sized from the worst realistic burst: a lifecycle resequencing chain,
/// the first-activation follow-ups, a status escalation, and a couple of
/// server directives. Anything beyond that is a runaway producer, and the
/// queue refuses it rather than growing.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Capacity of the measurement table in records.
///
/// A record per minute between the morning and evening transmissions, two
/// days deep, so a single missed transmission loses nothing.
pub const DATA_TABLE_CAPACITY: usize = 840;

/// Capacity of the device log in rows.
pub const DEFAULT_LOG_CAPACITY: usize = 512;

/// Transfer attempts before a payload is declared undeliverable this
/// session.
pub const DEFAULT_TRANSFER_MAX_ATTEMPTS: u32 = 3;

/// Default wait for a server reply, in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5000;

/// Battery voltage under which the station reports itself critical.
///
/// Just above the LiPo protection cutoff; below this the next deep-sleep
/// wake is not guaranteed.
pub const MIN_BATTERY_VOLTS: f32 = 3.02;

/// Lightest reference plate the server may hand out for calibration, in
/// grams.
pub const PLATE_MIN_GRAMS: u32 = 200;

/// Heaviest reference plate the server may hand out for calibration, in
/// grams.
pub const PLATE_MAX_GRAMS: u32 = 10_000;

/// Environment variable selecting the low-power preset.
pub const ENV_LOW_POWER: &str = "WEIGHPOINT_LOW_POWER";

/// Environment variable overriding the server address.
pub const ENV_SERVER_ADDR: &str = "WEIGHPOINT_SERVER_ADDR";

/// Environment variable overriding the device identity.
pub const ENV_DEVICE_ID: &str = "WEIGHPOINT_DEVICE_ID";

/// Environment variable overriding the storage path.
pub const ENV_DB_PATH: &str = "WEIGHPOINT_DB_PATH";

/// Environment variable overriding the sensing interval, in seconds.
pub const ENV_SENSE_INTERVAL_SECS: &str = "WEIGHPOINT_SENSE_INTERVAL_SECS";

/// Environment variable overriding the server reply timeout, in
/// milliseconds.
pub const ENV_ACK_TIMEOUT_MS: &str = "WEIGHPOINT_ACK_TIMEOUT_MS";
