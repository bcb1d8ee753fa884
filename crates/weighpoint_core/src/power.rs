//! Power Management for the Weighing Station
//!
//! Provides battery estimation and deep-sleep bookkeeping for the control
//! loop. The station spends most of its life asleep; between wakes, the only
//! consumer is the low-power timer counting down to the next scheduled
//! action.
//!
//! # Features
//! - Battery voltage tracking with a LiPo percentage estimate
//! - Sleep configurations with selectable wake sources
//! - Wake-reason classification
//! - Sleep/wake cycle statistics
//!
//! # Example
//! ```rust
//! use weighpoint_core::power::{BatteryInfo, PowerManager};
//!
//! let mut pm = PowerManager::new();
//! pm.update_battery(BatteryInfo::from_volts(3.8));
//!
//! if !pm.battery_operational(3.02) {
//!     // Escalate before the battery dies.
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Voltage treated as an empty LiPo cell.
const BATTERY_EMPTY_VOLTS: f32 = 3.0;
/// Voltage treated as a full LiPo cell.
const BATTERY_FULL_VOLTS: f32 = 4.2;

/// A battery measurement
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Measured voltage (V)
    pub volts: f32,
}

impl BatteryInfo {
    /// Create battery info from a voltage reading
    pub fn from_volts(volts: f32) -> Self {
        Self { volts }
    }

    /// Rough charge percentage, linear across the LiPo discharge band
    pub fn percent_estimate(&self) -> f32 {
        let span = BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS;
        ((self.volts - BATTERY_EMPTY_VOLTS) / span * 100.0).clamp(0.0, 100.0)
    }

    /// Check whether the battery can still power a full duty cycle
    pub fn is_operational(&self, min_volts: f32) -> bool {
        self.volts >= min_volts
    }
}

/// Sleep mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepConfig {
    /// Sleep duration
    pub duration: Duration,
    /// Wake on timer
    pub wake_on_timer: bool,
    /// Wake on the operator button
    pub wake_on_button: bool,
    /// Wake on network activity
    pub wake_on_network: bool,
}

impl SleepConfig {
    /// Create default sleep config (all wake sources armed)
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            wake_on_timer: true,
            wake_on_button: true,
            wake_on_network: true,
        }
    }

    /// Create deep sleep config (timer only)
    pub fn deep_sleep(duration: Duration) -> Self {
        Self {
            duration,
            wake_on_timer: true,
            wake_on_button: false,
            wake_on_network: false,
        }
    }
}

/// Wake reason after sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woke up due to the armed timer
    Timer,
    /// Woke up due to the operator button
    Button,
    /// Woke up due to network activity
    Network,
    /// Unknown reason
    Unknown,
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeReason::Timer => write!(f, "timer"),
            WakeReason::Button => write!(f, "button"),
            WakeReason::Network => write!(f, "network"),
            WakeReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Sleep/wake statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerStats {
    /// Total uptime (seconds)
    pub uptime_secs: u64,
    /// Total time spent asleep (seconds)
    pub total_sleep_secs: u64,
    /// Number of sleep/wake cycles
    pub sleep_wake_cycles: u64,
    /// Wakes caused by the armed timer
    pub wakes_by_timer: u64,
    /// Wakes caused by the operator button
    pub wakes_by_button: u64,
    /// Wakes caused by network activity
    pub wakes_by_network: u64,
}

impl PowerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get active time (uptime - sleep time)
    pub fn active_secs(&self) -> u64 {
        self.uptime_secs.saturating_sub(self.total_sleep_secs)
    }

    /// Get sleep percentage
    pub fn sleep_percentage(&self) -> f64 {
        if self.uptime_secs == 0 {
            return 0.0;
        }
        (self.total_sleep_secs as f64 / self.uptime_secs as f64) * 100.0
    }
}

/// Power manager for the weighing station
pub struct PowerManager {
    /// Latest battery measurement (if any)
    battery: Option<BatteryInfo>,
    /// Statistics
    stats: PowerStats,
    /// Manager start time
    start_time: Instant,
}

impl PowerManager {
    /// Create a new power manager
    pub fn new() -> Self {
        Self {
            battery: None,
            stats: PowerStats::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a battery measurement
    pub fn update_battery(&mut self, battery: BatteryInfo) {
        log::debug!(
            "Battery updated: {:.2} V (~{:.0}%)",
            battery.volts,
            battery.percent_estimate()
        );
        self.battery = Some(battery);
    }

    /// Latest measured voltage, if a measurement exists
    pub fn battery_volts(&self) -> Option<f32> {
        self.battery.map(|b| b.volts)
    }

    /// Check the latest measurement against the operational minimum.
    ///
    /// An unmeasured battery is assumed operational; the status check will
    /// measure it soon enough.
    pub fn battery_operational(&self, min_volts: f32) -> bool {
        self.battery.map(|b| b.is_operational(min_volts)).unwrap_or(true)
    }

    /// Record a completed sleep/wake cycle
    pub fn record_wake(&mut self, slept: Duration, reason: WakeReason) {
        self.stats.total_sleep_secs += slept.as_secs();
        self.stats.sleep_wake_cycles += 1;
        match reason {
            WakeReason::Timer => self.stats.wakes_by_timer += 1,
            WakeReason::Button => self.stats.wakes_by_button += 1,
            WakeReason::Network => self.stats.wakes_by_network += 1,
            WakeReason::Unknown => {}
        }
        log::debug!("Woke after {:?} ({})", slept, reason);
    }

    /// Get power statistics
    pub fn stats(&mut self) -> PowerStats {
        self.stats.uptime_secs = self.start_time.elapsed().as_secs();
        self.stats.clone()
    }
}

impl Default for PowerManager {
    fn default() -> Self {
        Self::new()
    }
}
