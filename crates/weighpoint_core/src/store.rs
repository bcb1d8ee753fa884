//! Persistence for logs, weight records, and device keys.
//!
//! This module defines the common interface for all storage backends.
//! Implementations include SQLite (deployed stations) and an in-memory
//! backend (tests and simulation).
//!
//! Three kinds of data live behind [`DeviceStore`]:
//!
//! - the **log file**: timestamped rows under a device-id header, with a
//!   date header whenever the date changes and a final marker row once the
//!   log is full;
//! - the **data table**: a capacity-bounded list of weight [`Record`]s;
//! - **device keys**: small persisted values (transmission times, the
//!   calibration ratio, the assigned identity).
//!
//! The [`LogFile`] and [`DataTable`] wrappers add the formatting and
//! capacity policy on top of the raw backend rows.

use crate::error::{Result, StorageError};
use crate::types::{MinuteOfDay, Record, TxSchedule};
use chrono::{Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Key for the morning transmission time.
pub const KEY_TX_MORNING: &str = "tx-morning";
/// Key for the evening transmission time.
pub const KEY_TX_EVENING: &str = "tx-evening";
/// Key for the persisted calibration ratio.
pub const KEY_CAL_RATIO: &str = "cal-ratio";
/// Key for the server-assigned device identity.
pub const KEY_IDENTITY: &str = "identity";

/// The row recorded once when the log reaches capacity.
pub const LOG_FULL_MARKER: &str = "log file is full, yet more info is tried to be logged";

/// Trait for storage backends - enables different implementations
/// (SQLite, Memory, etc.)
///
/// Note: Not Sync because some backends (like SQLite) have single-writer
/// limitations. For shared usage, wrap in `Arc<Mutex<S>>`.
pub trait DeviceStore: Send {
    /// Store a device key.
    fn put_value(&self, key: &str, value: &str) -> Result<()>;

    /// Get a device key.
    fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Remove a device key. Removing an absent key is not an error.
    fn delete_value(&self, key: &str) -> Result<()>;

    /// Get a device key that must exist.
    ///
    /// Default implementation maps an absent key to
    /// [`StorageError::KeyNotFound`].
    fn require_value(&self, key: &str) -> Result<String> {
        self.get_value(key)?.ok_or_else(|| {
            StorageError::KeyNotFound {
                key: key.to_string(),
            }
            .into()
        })
    }

    /// Append one pre-formatted log row.
    ///
    /// Fails with [`StorageError::LogFull`] at capacity; the stored rows are
    /// unchanged.
    fn append_log_row(&self, row: &str) -> Result<()>;

    /// All log rows, oldest first.
    fn read_log_rows(&self) -> Result<Vec<String>>;

    /// Number of stored log rows.
    fn log_row_count(&self) -> Result<usize>;

    /// Remove every log row.
    fn clear_log(&self) -> Result<()>;

    /// The log row capacity.
    fn log_capacity(&self) -> usize;

    /// Append one weight record.
    ///
    /// Fails with [`StorageError::TableFull`] at capacity; stored records
    /// are unchanged.
    fn append_record(&self, record: Record) -> Result<()>;

    /// All records, oldest first.
    fn read_records(&self) -> Result<Vec<Record>>;

    /// Number of stored records.
    fn record_count(&self) -> Result<usize>;

    /// Remove every record.
    fn clear_records(&self) -> Result<()>;

    /// The record capacity.
    fn table_capacity(&self) -> usize;

    /// Get storage statistics.
    ///
    /// Default implementation assembles them from the counts.
    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            log_rows: self.log_row_count()? as u64,
            records: self.record_count()? as u64,
            log_capacity: self.log_capacity(),
            table_capacity: self.table_capacity(),
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of log rows stored
    pub log_rows: u64,
    /// Number of weight records stored
    pub records: u64,
    /// Log row capacity
    pub log_capacity: usize,
    /// Record capacity
    pub table_capacity: usize,
}

// ============================================================================
// Persisted-key helpers
// ============================================================================

/// Persist a transmission schedule under its two keys.
pub fn save_tx_schedule<S: DeviceStore + ?Sized>(store: &S, schedule: TxSchedule) -> Result<()> {
    store.put_value(KEY_TX_MORNING, &schedule.morning.get().to_string())?;
    store.put_value(KEY_TX_EVENING, &schedule.evening.get().to_string())?;
    Ok(())
}

/// Load the persisted transmission schedule, if both keys exist.
pub fn load_tx_schedule<S: DeviceStore + ?Sized>(store: &S) -> Result<Option<TxSchedule>> {
    let morning = match store.get_value(KEY_TX_MORNING)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let evening = match store.get_value(KEY_TX_EVENING)? {
        Some(v) => v,
        None => return Ok(None),
    };

    let parse = |raw: &str, key: &str| -> Result<MinuteOfDay> {
        raw.parse::<u16>()
            .ok()
            .and_then(MinuteOfDay::new)
            .ok_or_else(|| {
                StorageError::QueryFailed {
                    reason: format!("stored {} '{}' is not a minute of day", key, raw),
                }
                .into()
            })
    };

    Ok(Some(TxSchedule {
        morning: parse(&morning, KEY_TX_MORNING)?,
        evening: parse(&evening, KEY_TX_EVENING)?,
    }))
}

/// Persist the server-assigned identity.
pub fn save_identity<S: DeviceStore + ?Sized>(store: &S, device_id: &str) -> Result<()> {
    store.put_value(KEY_IDENTITY, device_id)
}

/// Load the persisted identity, if assigned.
pub fn load_identity<S: DeviceStore + ?Sized>(store: &S) -> Result<Option<String>> {
    store.get_value(KEY_IDENTITY)
}

// ============================================================================
// LogFile
// ============================================================================

/// The device log: formatting and capacity policy over raw backend rows.
///
/// Rows are stamped `HHmm`. A `device <id>` header is the first row; a
/// `== YYYY-MM-DD ==` header is inserted whenever the date changes. Once the
/// log is full a single marker row is recorded and later rows are dropped
/// without error - logging must never take the control loop down.
pub struct LogFile<S: DeviceStore> {
    store: Arc<Mutex<S>>,
    device_id: String,
    last_date: Mutex<Option<NaiveDate>>,
}

impl<S: DeviceStore> LogFile<S> {
    /// Open the log, writing the device header if the log is empty.
    ///
    /// Re-opening an existing log recovers the current date section from the
    /// stored rows.
    pub fn open(store: Arc<Mutex<S>>, device_id: &str) -> Result<Self> {
        let log = Self {
            store,
            device_id: device_id.to_string(),
            last_date: Mutex::new(None),
        };
        log.ensure_header()?;
        Ok(log)
    }

    fn ensure_header(&self) -> Result<()> {
        let store = lock(&self.store);
        if store.log_row_count()? == 0 {
            store.append_log_row(&format!("device {}", self.device_id))?;
        } else {
            // Recover the open date section after a restart.
            let mut last = None;
            for row in store.read_log_rows()? {
                if let Some(date) = parse_date_header(&row) {
                    last = Some(date);
                }
            }
            *lock_cache(&self.last_date) = last;
        }
        Ok(())
    }

    /// Append a timestamped row for `message`.
    pub fn log(&self, message: &str) -> Result<()> {
        let now = Utc::now();
        let minute = MinuteOfDay::from_hm(now.hour() as u8, now.minute() as u8)
            .unwrap_or(MinuteOfDay::MIDNIGHT);
        self.log_stamped(now.date_naive(), minute, message)
    }

    fn log_stamped(&self, date: NaiveDate, minute: MinuteOfDay, message: &str) -> Result<()> {
        let store = lock(&self.store);
        let capacity = store.log_capacity();
        let mut rows = store.log_row_count()?;

        if rows >= capacity {
            log::debug!("log full, dropping row: {}", message);
            return Ok(());
        }
        if rows == capacity - 1 {
            store.append_log_row(LOG_FULL_MARKER)?;
            log::warn!("log reached capacity {}, recorded full marker", capacity);
            return Ok(());
        }

        let mut last_date = lock_cache(&self.last_date);
        if *last_date != Some(date) {
            store.append_log_row(&format_date_header(date))?;
            *last_date = Some(date);
            rows += 1;
            if rows == capacity - 1 {
                store.append_log_row(LOG_FULL_MARKER)?;
                log::warn!("log reached capacity {}, recorded full marker", capacity);
                return Ok(());
            }
        }

        store.append_log_row(&format!("{} {}", minute.hhmm(), message))
    }

    /// The full log rendered as one transferable payload.
    pub fn render(&self) -> Result<String> {
        Ok(lock(&self.store).read_log_rows()?.join("\n"))
    }

    /// Number of stored rows, header included.
    pub fn row_count(&self) -> Result<usize> {
        lock(&self.store).log_row_count()
    }

    /// `true` when only the header row exists.
    pub fn is_fresh(&self) -> Result<bool> {
        Ok(self.row_count()? <= 1)
    }

    /// Delete the log and recreate it empty with a fresh header.
    pub fn reset(&self) -> Result<()> {
        let store = lock(&self.store);
        store.clear_log()?;
        store.append_log_row(&format!("device {}", self.device_id))?;
        *lock_cache(&self.last_date) = None;
        Ok(())
    }
}

fn format_date_header(date: NaiveDate) -> String {
    format!(
        "== {:04}-{:02}-{:02} ==",
        date.year(),
        date.month(),
        date.day()
    )
}

fn parse_date_header(row: &str) -> Option<NaiveDate> {
    let inner = row.strip_prefix("== ")?.strip_suffix(" ==")?;
    NaiveDate::parse_from_str(inner, "%Y-%m-%d").ok()
}

// ============================================================================
// DataTable
// ============================================================================

/// The measurement table: weight records awaiting transmission.
pub struct DataTable<S: DeviceStore> {
    store: Arc<Mutex<S>>,
}

impl<S: DeviceStore> DataTable<S> {
    pub fn new(store: Arc<Mutex<S>>) -> Self {
        Self { store }
    }

    /// Append one record.
    ///
    /// Fails with [`StorageError::TableFull`] at capacity.
    pub fn append(&self, record: Record) -> Result<()> {
        lock(&self.store).append_record(record)
    }

    /// All records, oldest first.
    pub fn read_all(&self) -> Result<Vec<Record>> {
        lock(&self.store).read_records()
    }

    /// The records rendered as one transferable JSON payload.
    pub fn render(&self) -> Result<String> {
        let records = self.read_all()?;
        Ok(serde_json::to_string(&records)?)
    }

    pub fn count(&self) -> Result<usize> {
        lock(&self.store).record_count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Delete the table contents; the next append starts a fresh table.
    pub fn reset(&self) -> Result<()> {
        lock(&self.store).clear_records()
    }
}

fn lock<S: DeviceStore>(store: &Arc<Mutex<S>>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_cache<T>(cache: &Mutex<T>) -> MutexGuard<'_, T> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    values: std::collections::HashMap<String, String>,
    log_rows: Vec<String>,
    records: Vec<Record>,
}

/// In-memory storage backend for tests and simulation.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    log_capacity: usize,
    table_capacity: usize,
}

impl MemoryStore {
    /// Create a store with the default capacities.
    pub fn new() -> Self {
        Self::with_capacities(crate::DEFAULT_LOG_CAPACITY, crate::DATA_TABLE_CAPACITY)
    }

    /// Create a store with explicit capacities.
    pub fn with_capacities(log_capacity: usize, table_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            log_capacity,
            table_capacity,
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore for MemoryStore {
    fn put_value(&self, key: &str, value: &str) -> Result<()> {
        self.inner()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner().values.get(key).cloned())
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        self.inner().values.remove(key);
        Ok(())
    }

    fn append_log_row(&self, row: &str) -> Result<()> {
        let mut inner = self.inner();
        if inner.log_rows.len() >= self.log_capacity {
            return Err(StorageError::LogFull {
                capacity: self.log_capacity,
            }
            .into());
        }
        inner.log_rows.push(row.to_string());
        Ok(())
    }

    fn read_log_rows(&self) -> Result<Vec<String>> {
        Ok(self.inner().log_rows.clone())
    }

    fn log_row_count(&self) -> Result<usize> {
        Ok(self.inner().log_rows.len())
    }

    fn clear_log(&self) -> Result<()> {
        self.inner().log_rows.clear();
        Ok(())
    }

    fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    fn append_record(&self, record: Record) -> Result<()> {
        let mut inner = self.inner();
        if inner.records.len() >= self.table_capacity {
            return Err(StorageError::TableFull {
                capacity: self.table_capacity,
            }
            .into());
        }
        inner.records.push(record);
        Ok(())
    }

    fn read_records(&self) -> Result<Vec<Record>> {
        Ok(self.inner().records.clone())
    }

    fn record_count(&self) -> Result<usize> {
        Ok(self.inner().records.len())
    }

    fn clear_records(&self) -> Result<()> {
        self.inner().records.clear();
        Ok(())
    }

    fn table_capacity(&self) -> usize {
        self.table_capacity
    }
}
