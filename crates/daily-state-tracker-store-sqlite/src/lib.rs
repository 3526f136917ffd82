#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use daily_state_tracker_core::{
    build_csv, build_empty_record, date_key, export_backup_json, merge_partial,
    normalize_payload_with_version, parse_backup_json, Clock, LocalClock, Record, StoragePayload,
    DEFAULT_STORAGE_KEY, SCHEMA_VERSION,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use time::{Date, OffsetDateTime};

const SLOT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SLOTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_slots (
  slot_key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SlotError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for SlotError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A durable key-value store holding whole JSON documents under string keys.
pub trait SlotBackend: Send {
    fn read_slot(&self, key: &str) -> Result<Option<String>, SlotError>;
    fn write_slot(&self, key: &str, value: &str) -> Result<(), SlotError>;
}

pub struct SqliteSlotBackend {
    conn: Connection,
}

impl SqliteSlotBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SLOTS_V1)
            .context("failed to apply slot schema")?;

        let now = now_rfc3339().context("failed to format migration timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SLOT_MIGRATION_VERSION, now],
            )
            .context("failed to register slot schema migration")?;

        Ok(())
    }

}

impl SlotBackend for SqliteSlotBackend {
    fn read_slot(&self, key: &str) -> Result<Option<String>, SlotError> {
        let value = self
            .conn
            .query_row(
                "SELECT value_json FROM kv_slots WHERE slot_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_slot(&self, key: &str, value: &str) -> Result<(), SlotError> {
        let now = now_rfc3339()
            .map_err(|err| SlotError::Backend(format!("failed to format timestamp: {err}")))?;
        self.conn.execute(
            "INSERT INTO kv_slots(slot_key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(slot_key) DO UPDATE SET
               value_json = excluded.value_json,
               updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }
}

/// In-process slot storage. Clones share the same slots.
#[derive(Debug, Clone)]
pub struct MemorySlotBackend {
    slots: Arc<Mutex<BTreeMap<String, String>>>,
    available: bool,
}

impl MemorySlotBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(BTreeMap::new())),
            available: true,
        }
    }

    /// A backend that reports itself unavailable for every read and write.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn raw_slot(&self, key: &str) -> Option<String> {
        self.lock_slots().get(key).cloned()
    }

    pub fn put_raw_slot(&self, key: &str, value: &str) {
        self.lock_slots().insert(key.to_string(), value.to_string());
    }

    fn lock_slots(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), SlotError> {
        if self.available {
            Ok(())
        } else {
            Err(SlotError::Unavailable(
                "memory backend disabled".to_string(),
            ))
        }
    }
}

impl Default for MemorySlotBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBackend for MemorySlotBackend {
    fn read_slot(&self, key: &str) -> Result<Option<String>, SlotError> {
        self.ensure_available()?;
        Ok(self.raw_slot(key))
    }

    fn write_slot(&self, key: &str, value: &str) -> Result<(), SlotError> {
        self.ensure_available()?;
        self.put_raw_slot(key, value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub storage_key: String,
    pub schema_version: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Owns the durable storage payload behind a single slot.
///
/// Every operation takes the backend lock for its whole duration, so a
/// [`DailyStateStore::save_today_record`] read-merge-write cycle cannot
/// interleave with another call on the same store. Separate store instances
/// over one database are not coordinated.
pub struct DailyStateStore<B: SlotBackend> {
    backend: Mutex<B>,
    config: StoreConfig,
    clock: Box<dyn Clock>,
}

impl DailyStateStore<SqliteSlotBackend> {
    /// Opens and migrates a database, using the local calendar date as "today".
    pub fn open_sqlite(path: &Path, config: StoreConfig) -> Result<Self> {
        Self::open_sqlite_with_clock(path, config, LocalClock::detect())
    }

    pub fn open_sqlite_with_clock(
        path: &Path,
        config: StoreConfig,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        let backend = SqliteSlotBackend::open(path)?;
        backend.migrate()?;
        Ok(Self::with_clock(backend, config, clock))
    }
}

impl<B: SlotBackend> DailyStateStore<B> {
    pub fn with_clock(backend: B, config: StoreConfig, clock: impl Clock + 'static) -> Self {
        Self {
            backend: Mutex::new(backend),
            config,
            clock: Box::new(clock),
        }
    }

    pub fn today(&self) -> Date {
        self.clock.today()
    }

    pub fn today_key(&self) -> String {
        date_key(self.today())
    }

    /// Reads the whole payload. Missing, unreadable, or corrupt storage
    /// yields an empty payload rather than an error.
    pub fn load_all(&self) -> StoragePayload {
        let backend = self.lock_backend();
        self.load_locked(&backend)
    }

    /// Replaces the stored payload wholesale, stamped with the configured
    /// schema version. An unavailable backend makes this a no-op.
    pub fn save_all(&self, payload: &StoragePayload) -> Result<()> {
        let backend = self.lock_backend();
        self.save_locked(&backend, payload)
    }

    pub fn get_record(&self, date: Date) -> Record {
        self.load_all()
            .records
            .remove(&date_key(date))
            .unwrap_or_else(build_empty_record)
    }

    pub fn get_today_record(&self) -> Record {
        self.get_record(self.today())
    }

    /// Merges `partial` into today's record and persists the result.
    ///
    /// Invalid values in `partial` are dropped to empty; unknown keys are
    /// ignored. Records for other dates are written back unchanged, so a
    /// failed read aborts the save instead of writing over them.
    pub fn save_today_record(&self, partial: &Map<String, Value>) -> Result<Record> {
        let backend = self.lock_backend();
        let today = self.today_key();

        let mut payload = self
            .try_load_locked(&backend)
            .with_context(|| format!("failed to load records before saving {today}"))?;
        let existing = payload
            .records
            .get(&today)
            .cloned()
            .unwrap_or_else(build_empty_record);
        let merged = merge_partial(&existing, partial);
        payload.records.insert(today.clone(), merged.clone());

        self.save_locked(&backend, &payload)
            .with_context(|| format!("failed to save record for {today}"))?;
        tracing::debug!(date = %today, fields = partial.len(), "saved today record");
        Ok(merged)
    }

    pub fn export_csv(&self) -> String {
        build_csv(&self.load_all().records)
    }

    pub fn export_json(&self) -> Result<String> {
        let payload = self.load_all();
        Ok(export_backup_json(&payload)?)
    }

    /// Replaces the whole store with the payload parsed from `text`.
    ///
    /// Nothing is written when parsing fails.
    pub fn import_json(&self, text: &str) -> Result<StoragePayload> {
        let mut payload = parse_backup_json(text)?;
        payload.schema_version = self.config.schema_version;

        let backend = self.lock_backend();
        self.save_locked(&backend, &payload)
            .context("failed to persist imported backup")?;
        tracing::info!(records = payload.records.len(), "imported backup");
        Ok(payload)
    }

    fn lock_backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self, backend: &B) -> StoragePayload {
        match self.try_load_locked(backend) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    slot = %self.config.storage_key,
                    error = %err,
                    "failed to read storage slot; reading as empty"
                );
                StoragePayload::empty_with_version(self.config.schema_version)
            }
        }
    }

    /// Like `load_locked`, but a backend read failure is an error. Absent
    /// slots, unavailable storage, and corrupt JSON still read as empty.
    fn try_load_locked(&self, backend: &B) -> Result<StoragePayload, SlotError> {
        let key = &self.config.storage_key;
        let empty = StoragePayload::empty_with_version(self.config.schema_version);

        let text = match backend.read_slot(key) {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(empty),
            Err(SlotError::Unavailable(reason)) => {
                tracing::debug!(slot = %key, %reason, "storage unavailable; reading as empty");
                return Ok(empty);
            }
            Err(err) => return Err(err),
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Ok(normalize_payload_with_version(
                &value,
                self.config.schema_version,
            )),
            Err(err) => {
                tracing::warn!(slot = %key, error = %err, "stored payload is not valid JSON; reading as empty");
                Ok(empty)
            }
        }
    }

    fn save_locked(&self, backend: &B, payload: &StoragePayload) -> Result<()> {
        let key = &self.config.storage_key;
        let mut normalized = payload.clone();
        normalized.schema_version = self.config.schema_version;

        let text = serde_json::to_string(&normalized.to_value())
            .context("failed to encode storage payload")?;

        match backend.write_slot(key, &text) {
            Err(SlotError::Unavailable(reason)) => {
                tracing::debug!(slot = %key, %reason, "storage unavailable; write skipped");
                Ok(())
            }
            result => {
                result.with_context(|| format!("failed to write storage slot {key}"))?;
                tracing::debug!(slot = %key, records = normalized.records.len(), "wrote storage slot");
                Ok(())
            }
        }
    }
}

fn now_rfc3339() -> Result<String, time::error::Format> {
    OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)
}
