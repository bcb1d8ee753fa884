//! Sensor Abstraction Layer for the Weighing Station
//!
//! Provides the hardware-facing traits the control core measures through:
//! a load cell producing raw ADC counts and a battery gauge producing volts.
//! The core never touches pins or ADCs itself; deployed stations plug in a
//! real driver (see [`hx711`]), tests plug in the mocks.
//!
//! # Example
//! ```rust
//! use weighpoint_core::sensors::{CalRatio, LoadCell, MockLoadCell};
//!
//! let cell = MockLoadCell::new(12_000);
//! let ratio = CalRatio::from_reference(1000, 2_000, 12_000).unwrap();
//!
//! let raw = cell.read_raw().unwrap();
//! assert_eq!(ratio.apply(raw), 1000);
//! ```

use crate::context::DeviceContext;
use crate::error::{Result, StatusError};
use crate::schedule::Clock;
use crate::store::{DataTable, DeviceStore, KEY_CAL_RATIO};
use crate::types::{MinuteOfDay, Record, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lowest raw count a 24-bit load-cell ADC can produce.
pub const RAW_MIN: i32 = -8_388_608;
/// Highest raw count a 24-bit load-cell ADC can produce.
pub const RAW_MAX: i32 = 8_388_607;

/// A reading railed at either end of the ADC range means a disconnected or
/// saturated cell, not a weight.
pub fn reading_plausible(raw: i32) -> bool {
    raw > RAW_MIN && raw < RAW_MAX
}

/// The load cell the station weighs with.
pub trait LoadCell: Send + Sync {
    /// Read one raw ADC count.
    fn read_raw(&self) -> Result<i32>;

    /// Check if the cell can produce a reading right now.
    fn is_ready(&self) -> bool {
        true
    }
}

/// The battery voltage gauge.
pub trait BatteryGauge: Send + Sync {
    /// Read the battery voltage.
    fn read_volts(&self) -> Result<f32>;
}

/// Calibration: converts raw ADC counts to grams.
///
/// Produced by weighing the reference plate against the unloaded cell;
/// persisted under the `cal-ratio` key so it survives deep sleep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalRatio {
    /// Grams per raw count.
    pub grams_per_count: f32,
    /// Raw count of the unloaded cell.
    pub tare_raw: i32,
    /// When this calibration was taken.
    pub calibrated_at: Timestamp,
}

impl Default for CalRatio {
    fn default() -> Self {
        Self {
            grams_per_count: 1.0,
            tare_raw: 0,
            calibrated_at: Timestamp(0),
        }
    }
}

impl CalRatio {
    /// Derive a calibration from the reference plate.
    ///
    /// Returns `None` when the loaded and unloaded readings are equal - a
    /// cell that does not react to the plate cannot be calibrated.
    pub fn from_reference(reference_grams: u32, unloaded_raw: i32, loaded_raw: i32) -> Option<Self> {
        let delta = loaded_raw - unloaded_raw;
        if delta == 0 {
            return None;
        }
        Some(Self {
            grams_per_count: reference_grams as f32 / delta as f32,
            tare_raw: unloaded_raw,
            calibrated_at: Timestamp::now(),
        })
    }

    /// Convert a raw count to grams, clamped to the storable range.
    pub fn apply(&self, raw: i32) -> u16 {
        let grams = (raw - self.tare_raw) as f32 * self.grams_per_count;
        grams.round().clamp(0.0, u16::MAX as f32) as u16
    }
}

/// Persist a calibration under its device key.
pub fn save_cal_ratio<S: DeviceStore + ?Sized>(store: &S, ratio: CalRatio) -> Result<()> {
    store.put_value(KEY_CAL_RATIO, &serde_json::to_string(&ratio)?)
}

/// Load the persisted calibration, if one exists.
pub fn load_cal_ratio<S: DeviceStore + ?Sized>(store: &S) -> Result<Option<CalRatio>> {
    match store.get_value(KEY_CAL_RATIO)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

// ============================================================================
// Mocks
// ============================================================================

/// Mock load cell for testing.
pub struct MockLoadCell {
    raw: AtomicI32,
    ready: AtomicBool,
    fail: AtomicBool,
}

impl MockLoadCell {
    /// Create a mock producing the given raw count.
    pub fn new(raw: i32) -> Self {
        Self {
            raw: AtomicI32::new(raw),
            ready: AtomicBool::new(true),
            fail: AtomicBool::new(false),
        }
    }

    /// Change the produced raw count.
    pub fn set_raw(&self, raw: i32) {
        self.raw.store(raw, Ordering::SeqCst);
    }

    /// Make `is_ready` report the given state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make every read fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

impl LoadCell for MockLoadCell {
    fn read_raw(&self) -> Result<i32> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StatusError::ProbeFailed {
                probe: "load cell".to_string(),
                reason: "mock failure".to_string(),
            }
            .into());
        }
        Ok(self.raw.load(Ordering::SeqCst))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Mock battery gauge for testing.
pub struct MockBatteryGauge {
    millivolts: AtomicU32,
    fail: AtomicBool,
}

impl MockBatteryGauge {
    pub fn new(volts: f32) -> Self {
        Self {
            millivolts: AtomicU32::new((volts * 1000.0) as u32),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_volts(&self, volts: f32) {
        self.millivolts
            .store((volts * 1000.0) as u32, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

impl BatteryGauge for MockBatteryGauge {
    fn read_volts(&self) -> Result<f32> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StatusError::ProbeFailed {
                probe: "battery".to_string(),
                reason: "mock failure".to_string(),
            }
            .into());
        }
        Ok(self.millivolts.load(Ordering::SeqCst) as f32 / 1000.0)
    }
}

// ============================================================================
// Sensing loop
// ============================================================================

/// Sensing statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenseStats {
    /// Readings stored
    pub stored: u64,
    /// Readings rejected as implausible
    pub rejected: u64,
    /// Reads that failed outright
    pub failed: u64,
    /// Readings dropped because the table was full
    pub dropped: u64,
}

/// Read the load cell every `interval` while the device is active.
///
/// Each plausible reading is converted through the persisted calibration and
/// appended to the data table with the current minute-of-day. Implausible
/// readings, read failures, and a full table are logged and skipped; the
/// loop itself never fails. Runs until `running` is cleared.
pub async fn sensing_loop<S, C, L>(
    store: Arc<Mutex<S>>,
    cell: Arc<L>,
    clock: Arc<C>,
    context: Arc<DeviceContext>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> SenseStats
where
    S: DeviceStore,
    C: Clock + ?Sized,
    L: LoadCell + ?Sized,
{
    let table = DataTable::new(Arc::clone(&store));
    let mut stats = SenseStats::default();

    log::info!("sensing loop started, interval {:?}", interval);
    while running.load(Ordering::SeqCst) {
        if context.is_active() {
            take_reading(&store, &table, cell.as_ref(), clock.as_ref(), &mut stats);
        }
        smol::Timer::after(interval).await;
    }
    log::info!(
        "sensing loop stopped: {} stored, {} rejected, {} failed, {} dropped",
        stats.stored,
        stats.rejected,
        stats.failed,
        stats.dropped
    );
    stats
}

fn take_reading<S, C, L>(
    store: &Arc<Mutex<S>>,
    table: &DataTable<S>,
    cell: &L,
    clock: &C,
    stats: &mut SenseStats,
) where
    S: DeviceStore,
    C: Clock + ?Sized,
    L: LoadCell + ?Sized,
{
    let raw = match cell.read_raw() {
        Ok(raw) => raw,
        Err(e) => {
            stats.failed += 1;
            log::warn!("load cell read failed: {}", e);
            return;
        }
    };

    if !reading_plausible(raw) {
        stats.rejected += 1;
        log::warn!("implausible load cell reading {}, skipped", raw);
        return;
    }

    let ratio = {
        let guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        load_cal_ratio(&*guard).ok().flatten().unwrap_or_default()
    };
    let grams = ratio.apply(raw);
    let minute = MinuteOfDay::new(clock.minute_of_day()).unwrap_or(MinuteOfDay::MIDNIGHT);

    match table.append(Record { minute, grams }) {
        Ok(()) => {
            stats.stored += 1;
            log::debug!("stored reading {} g at {}", grams, minute);
        }
        Err(e) => {
            stats.dropped += 1;
            log::warn!("reading {} g dropped: {}", grams, e);
        }
    }
}

// ============================================================================
// HX711 adapter
// ============================================================================

/// Bit-bang driver for the HX711 load-cell ADC.
#[cfg(feature = "embedded")]
pub mod hx711 {
    use super::*;
    use embedded_hal::delay::DelayNs;
    use embedded_hal::digital::{InputPin, OutputPin};

    /// Clock pulse width in nanoseconds. The HX711 needs at least 200ns.
    const PULSE_NS: u32 = 1_000;
    /// Conversions run at 10Hz; waiting a little over two periods covers a
    /// conversion in flight plus settling.
    const READY_POLLS: u32 = 250;
    const READY_POLL_NS: u32 = 1_000_000;

    /// An HX711 wired to two GPIO pins.
    pub struct Hx711<In, Out, D> {
        dout: In,
        sck: Out,
        delay: D,
    }

    impl<In, Out, D> Hx711<In, Out, D>
    where
        In: InputPin,
        Out: OutputPin,
        D: DelayNs,
    {
        pub fn new(dout: In, sck: Out, delay: D) -> Self {
            Self { dout, sck, delay }
        }

        /// `true` when a conversion is waiting to be clocked out.
        pub fn conversion_ready(&mut self) -> bool {
            self.dout.is_low().unwrap_or(false)
        }

        /// Clock out one 24-bit conversion at gain 128.
        pub fn read(&mut self) -> Result<i32> {
            let mut polls = 0;
            while !self.conversion_ready() {
                polls += 1;
                if polls > READY_POLLS {
                    return Err(StatusError::ProbeFailed {
                        probe: "load cell".to_string(),
                        reason: "conversion never became ready".to_string(),
                    }
                    .into());
                }
                self.delay.delay_ns(READY_POLL_NS);
            }

            let mut value: u32 = 0;
            for _ in 0..24 {
                self.pulse()?;
                let bit = self.dout.is_high().map_err(pin_error)?;
                value = (value << 1) | bit as u32;
            }
            // One extra pulse selects gain 128 for the next conversion.
            self.pulse()?;

            // Sign-extend the 24-bit two's complement value.
            Ok(((value << 8) as i32) >> 8)
        }

        fn pulse(&mut self) -> Result<()> {
            self.sck.set_high().map_err(pin_error)?;
            self.delay.delay_ns(PULSE_NS);
            self.sck.set_low().map_err(pin_error)?;
            self.delay.delay_ns(PULSE_NS);
            Ok(())
        }
    }

    fn pin_error<E: core::fmt::Debug>(e: E) -> crate::error::Error {
        StatusError::ProbeFailed {
            probe: "load cell".to_string(),
            reason: format!("gpio error: {:?}", e),
        }
        .into()
    }

    /// A shareable HX711 satisfying [`LoadCell`].
    pub struct SharedHx711<In, Out, D>(Mutex<Hx711<In, Out, D>>);

    impl<In, Out, D> SharedHx711<In, Out, D>
    where
        In: InputPin,
        Out: OutputPin,
        D: DelayNs,
    {
        pub fn new(driver: Hx711<In, Out, D>) -> Self {
            Self(Mutex::new(driver))
        }
    }

    impl<In, Out, D> LoadCell for SharedHx711<In, Out, D>
    where
        In: InputPin + Send,
        Out: OutputPin + Send,
        D: DelayNs + Send,
    {
        fn read_raw(&self) -> Result<i32> {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .read()
        }

        fn is_ready(&self) -> bool {
            self.0
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .conversion_ready()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ManualClock;
    use crate::store::MemoryStore;

    #[test]
    fn test_reading_plausible_band() {
        assert!(reading_plausible(0));
        assert!(reading_plausible(120_000));
        assert!(reading_plausible(-5_000));
        assert!(!reading_plausible(RAW_MIN));
        assert!(!reading_plausible(RAW_MAX));
        assert!(!reading_plausible(i32::MIN));
        assert!(!reading_plausible(i32::MAX));
    }

    #[test]
    fn test_cal_ratio_from_reference() {
        let ratio = CalRatio::from_reference(1000, 2_000, 12_000).unwrap();
        assert_eq!(ratio.tare_raw, 2_000);
        assert!((ratio.grams_per_count - 0.1).abs() < 1e-6);

        // A loaded reading equal to the unloaded one is no calibration.
        assert!(CalRatio::from_reference(1000, 5_000, 5_000).is_none());
    }

    #[test]
    fn test_cal_ratio_apply() {
        let ratio = CalRatio::from_reference(1000, 2_000, 12_000).unwrap();
        assert_eq!(ratio.apply(2_000), 0); // tare
        assert_eq!(ratio.apply(12_000), 1000); // the plate itself
        assert_eq!(ratio.apply(7_000), 500);
        // Below tare clamps to zero rather than going negative.
        assert_eq!(ratio.apply(1_000), 0);
    }

    #[test]
    fn test_cal_ratio_apply_clamps_to_u16() {
        let ratio = CalRatio {
            grams_per_count: 1000.0,
            tare_raw: 0,
            calibrated_at: Timestamp(0),
        };
        assert_eq!(ratio.apply(1_000_000), u16::MAX);
    }

    #[test]
    fn test_cal_ratio_default_is_identity() {
        let ratio = CalRatio::default();
        assert_eq!(ratio.apply(1500), 1500);
    }

    #[test]
    fn test_cal_ratio_persistence() {
        let store = MemoryStore::new();
        assert!(load_cal_ratio(&store).unwrap().is_none());

        let ratio = CalRatio::from_reference(1000, 2_000, 12_000).unwrap();
        save_cal_ratio(&store, ratio).unwrap();

        let loaded = load_cal_ratio(&store).unwrap().unwrap();
        assert_eq!(loaded.tare_raw, ratio.tare_raw);
        assert!((loaded.grams_per_count - ratio.grams_per_count).abs() < 1e-6);
    }

    #[test]
    fn test_mock_load_cell() {
        let cell = MockLoadCell::new(42);
        assert!(cell.is_ready());
        assert_eq!(cell.read_raw().unwrap(), 42);

        cell.set_raw(77);
        assert_eq!(cell.read_raw().unwrap(), 77);

        cell.set_ready(false);
        assert!(!cell.is_ready());

        cell.set_failing(true);
        assert!(cell.read_raw().is_err());
    }

    #[test]
    fn test_mock_battery_gauge() {
        let gauge = MockBatteryGauge::new(3.8);
        assert!((gauge.read_volts().unwrap() - 3.8).abs() < 1e-3);

        gauge.set_volts(2.9);
        assert!((gauge.read_volts().unwrap() - 2.9).abs() < 1e-3);

        gauge.set_failing(true);
        assert!(gauge.read_volts().is_err());
    }

    #[test]
    fn test_take_reading_stores_calibrated_grams() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let table = DataTable::new(Arc::clone(&store));
        let cell = MockLoadCell::new(7_000);
        let clock = ManualClock::at_minute(9 * 60 + 30);
        let mut stats = SenseStats::default();

        {
            let guard = store.lock().unwrap();
            save_cal_ratio(
                &*guard,
                CalRatio::from_reference(1000, 2_000, 12_000).unwrap(),
            )
            .unwrap();
        }

        take_reading(&store, &table, &cell, &clock, &mut stats);

        assert_eq!(stats.stored, 1);
        let records = table.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].grams, 500);
        assert_eq!(records[0].minute.hhmm(), "0930");
    }

    #[test]
    fn test_take_reading_rejects_railed_value() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let table = DataTable::new(Arc::clone(&store));
        let cell = MockLoadCell::new(RAW_MAX);
        let clock = ManualClock::at_minute(0);
        let mut stats = SenseStats::default();

        take_reading(&store, &table, &cell, &clock, &mut stats);

        assert_eq!(stats.rejected, 1);
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn test_take_reading_counts_failures() {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let table = DataTable::new(Arc::clone(&store));
        let cell = MockLoadCell::new(0);
        cell.set_failing(true);
        let clock = ManualClock::at_minute(0);
        let mut stats = SenseStats::default();

        take_reading(&store, &table, &cell, &clock, &mut stats);

        assert_eq!(stats.failed, 1);
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn test_take_reading_drops_when_table_full() {
        let store = Arc::new(Mutex::new(MemoryStore::with_capacities(16, 1)));
        let table = DataTable::new(Arc::clone(&store));
        let cell = MockLoadCell::new(100);
        let clock = ManualClock::at_minute(0);
        let mut stats = SenseStats::default();

        take_reading(&store, &table, &cell, &clock, &mut stats);
        take_reading(&store, &table, &cell, &clock, &mut stats);

        assert_eq!(stats.stored, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(table.count().unwrap(), 1);
    }

    #[test]
    fn test_sensing_loop_only_measures_while_active() {
        smol::block_on(async {
            let store = Arc::new(Mutex::new(MemoryStore::new()));
            let cell = Arc::new(MockLoadCell::new(5_000));
            let clock = Arc::new(ManualClock::at_minute(600));
            let context = Arc::new(DeviceContext::new());
            let running = Arc::new(AtomicBool::new(true));

            context.set_active(true);

            let task = smol::spawn(sensing_loop(
                Arc::clone(&store),
                Arc::clone(&cell),
                Arc::clone(&clock),
                Arc::clone(&context),
                Arc::clone(&running),
                Duration::from_millis(5),
            ));

            smol::Timer::after(Duration::from_millis(40)).await;
            context.set_active(false);
            smol::Timer::after(Duration::from_millis(20)).await;
            running.store(false, Ordering::SeqCst);

            let stats = task.await;
            assert!(stats.stored >= 2);

            let table = DataTable::new(store);
            assert_eq!(table.count().unwrap() as u64, stats.stored);
        });
    }
}
