//! SQLite storage backend for deployed stations.
//!
//! A single-file database holding the log rows, the weight records, and the
//! device keys. Survives power loss and deep sleep; ideal for a station that
//! may go weeks between transmissions.

use crate::config::StoreConfig;
use crate::error::{Result, StorageError};
use crate::store::DeviceStore;
use crate::types::{MinuteOfDay, Record};
use rusqlite::{params, Connection};

/// SQLite-backed [`DeviceStore`].
pub struct SqliteStore {
    conn: Connection,
    log_capacity: usize,
    table_capacity: usize,
}

impl SqliteStore {
    /// Open or create the database at the configured path.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.db_path).map_err(|e| {
            StorageError::ConnectionFailed {
                path: config.db_path.clone(),
                reason: e.to_string(),
            }
        })?;

        let store = Self {
            conn,
            log_capacity: config.log_capacity,
            table_capacity: config.table_capacity,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::ConnectionFailed {
            path: ":memory:".to_string(),
            reason: e.to_string(),
        })?;

        let store = Self {
            conn,
            log_capacity: crate::DEFAULT_LOG_CAPACITY,
            table_capacity: crate::DATA_TABLE_CAPACITY,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Device keys (identity, tx times, calibration ratio)
            CREATE TABLE IF NOT EXISTS device_keys (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Log rows, insertion-ordered
            CREATE TABLE IF NOT EXISTS log_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                row TEXT NOT NULL
            );

            -- Weight records awaiting transmission
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                minute INTEGER NOT NULL,
                grams INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl DeviceStore for SqliteStore {
    fn put_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO device_keys (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM device_keys WHERE key = ?1")?;

        let value: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();
        Ok(value)
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM device_keys WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn append_log_row(&self, row: &str) -> Result<()> {
        if self.log_row_count()? >= self.log_capacity {
            return Err(StorageError::LogFull {
                capacity: self.log_capacity,
            }
            .into());
        }
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO log_rows (row) VALUES (?1)")?;
        stmt.execute(params![row])?;
        Ok(())
    }

    fn read_log_rows(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT row FROM log_rows ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    fn log_row_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM log_rows")
    }

    fn clear_log(&self) -> Result<()> {
        self.conn.execute("DELETE FROM log_rows", [])?;
        Ok(())
    }

    fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    fn append_record(&self, record: Record) -> Result<()> {
        if self.record_count()? >= self.table_capacity {
            return Err(StorageError::TableFull {
                capacity: self.table_capacity,
            }
            .into());
        }
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO records (minute, grams) VALUES (?1, ?2)")?;
        stmt.execute(params![record.minute.get(), record.grams])?;
        Ok(())
    }

    fn read_records(&self) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT minute, grams FROM records ORDER BY id")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, u16>(0)?, row.get::<_, u16>(1)?)))?
            .collect::<std::result::Result<Vec<(u16, u16)>, _>>()?;

        raw.into_iter()
            .map(|(minute, grams)| {
                let minute = MinuteOfDay::new(minute).ok_or_else(|| {
                    crate::error::Error::Storage(StorageError::QueryFailed {
                        reason: format!("stored minute {} out of range", minute),
                    })
                })?;
                Ok(Record { minute, grams })
            })
            .collect()
    }

    fn record_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM records")
    }

    fn clear_records(&self) -> Result<()> {
        self.conn.execute("DELETE FROM records", [])?;
        Ok(())
    }

    fn table_capacity(&self) -> usize {
        self.table_capacity
    }
}
