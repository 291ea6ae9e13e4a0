//! RocksDB-backed mission store.
//!
//! Durable key/value state with column families per record type. The
//! engine's write-ahead log makes individual operations atomic; callers
//! treat each put/get as such. Values are bincode-encoded through serde.
//!
//! Schema migrations are forward-only and versioned: a `meta` column
//! family records the applied version and pending steps run at open.

use std::path::PathBuf;
use std::sync::RwLock;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::info;

use super::schema::{self, keys, ALL_CFS, META_SCHEMA_VERSION, SCHEMA_VERSION};
use super::types::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("store schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to the mission store
pub type SharedStore = Arc<MissionStore>;

/// RocksDB-backed persistent mission store
pub struct MissionStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl MissionStore {
    /// Open or create a store at the given path, applying pending migrations.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        let store = Self {
            db: RwLock::new(db),
            path,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Migrations
    // =========================================================================

    /// Apply forward-only schema migrations up to [`SCHEMA_VERSION`].
    fn migrate(&self) -> StoreResult<()> {
        let found = self.schema_version()?;
        match found {
            None => {
                // Fresh database: stamp the current version, nothing to replay.
                self.put_schema_version(SCHEMA_VERSION)?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::SchemaTooNew {
                    found: v,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(v) => {
                for step in (v + 1)..=SCHEMA_VERSION {
                    self.apply_migration(step)?;
                    self.put_schema_version(step)?;
                    info!(version = step, "applied store migration");
                }
            }
        }
        Ok(())
    }

    /// One migration step. Version 1 is the baseline layout; future steps
    /// rewrite keys or backfill fields here.
    fn apply_migration(&self, version: u32) -> StoreResult<()> {
        match version {
            1 => Ok(()),
            other => Err(StoreError::Decode(format!(
                "unknown migration step {other}"
            ))),
        }
    }

    /// Applied schema version, if any.
    pub fn schema_version(&self) -> StoreResult<Option<u32>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_META)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_META.to_string()))?;
        match db.get_cf(&cf, META_SCHEMA_VERSION.as_bytes())? {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                text.parse()
                    .map(Some)
                    .map_err(|e: std::num::ParseIntError| StoreError::Decode(e.to_string()))
            }
            None => Ok(None),
        }
    }

    fn put_schema_version(&self, version: u32) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_META)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_META.to_string()))?;
        db.put_cf(&cf, META_SCHEMA_VERSION.as_bytes(), version.to_string())?;
        Ok(())
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let (value, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, cf_name: &str, key: &str) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    fn list_keys(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut out = Vec::new();
        let iter = db.prefix_iterator_cf(&cf, prefix.as_bytes());
        for result in iter {
            let (key, _) = result?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                if key_str.starts_with(prefix) {
                    out.push(key_str);
                } else {
                    break;
                }
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Mission operations
    // =========================================================================

    pub fn put_mission(&self, mission: &Mission) -> StoreResult<()> {
        self.put(schema::CF_MISSIONS, &keys::mission(&mission.id), mission)
    }

    pub fn get_mission(&self, mission_id: &str) -> StoreResult<Option<Mission>> {
        self.get(schema::CF_MISSIONS, &keys::mission(mission_id))
    }

    pub fn list_missions(&self) -> StoreResult<Vec<Mission>> {
        let keys = self.list_keys(schema::CF_MISSIONS, "msn:")?;
        let mut missions: Vec<Mission> = keys
            .iter()
            .filter_map(|key| self.get(schema::CF_MISSIONS, key).ok()?)
            .collect();
        missions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(missions)
    }

    // =========================================================================
    // Epoch operations
    // =========================================================================

    pub fn put_epoch(&self, epoch: &Epoch) -> StoreResult<()> {
        let key = keys::epoch(&epoch.mission_id, epoch.ordinal);
        self.put(schema::CF_EPOCHS, &key, epoch)
    }

    pub fn mission_epochs(&self, mission_id: &str) -> StoreResult<Vec<Epoch>> {
        let prefix = format!("epo:{mission_id}:");
        let keys = self.list_keys(schema::CF_EPOCHS, &prefix)?;
        Ok(keys
            .iter()
            .filter_map(|key| self.get(schema::CF_EPOCHS, key).ok()?)
            .collect())
    }

    // =========================================================================
    // Work-unit operations
    // =========================================================================

    pub fn put_unit(&self, unit: &WorkUnit) -> StoreResult<()> {
        self.put(schema::CF_UNITS, &keys::unit(&unit.id), unit)
    }

    pub fn get_unit(&self, unit_id: &str) -> StoreResult<Option<WorkUnit>> {
        self.get(schema::CF_UNITS, &keys::unit(unit_id))
    }

    pub fn mission_units(&self, mission_id: &str) -> StoreResult<Vec<WorkUnit>> {
        let keys = self.list_keys(schema::CF_UNITS, "unit:")?;
        Ok(keys
            .iter()
            .filter_map(|key| self.get::<WorkUnit>(schema::CF_UNITS, key).ok()?)
            .filter(|u| u.mission_id == mission_id)
            .collect())
    }

    // =========================================================================
    // Backlog operations (read by the controller, written by the planner)
    // =========================================================================

    pub fn put_backlog_item(&self, item: &BacklogItem) -> StoreResult<()> {
        self.put(schema::CF_BACKLOG, &keys::backlog(&item.id), item)
    }

    pub fn list_backlog(&self) -> StoreResult<Vec<BacklogItem>> {
        let keys = self.list_keys(schema::CF_BACKLOG, "bkl:")?;
        Ok(keys
            .iter()
            .filter_map(|key| self.get(schema::CF_BACKLOG, key).ok()?)
            .collect())
    }

    pub fn delete_backlog_item(&self, item_id: &str) -> StoreResult<()> {
        self.delete(schema::CF_BACKLOG, &keys::backlog(item_id))
    }

    // =========================================================================
    // Context items
    // =========================================================================

    pub fn put_context_item(&self, item: &ContextItem) -> StoreResult<()> {
        let key = keys::context(&item.mission_id, &item.id);
        self.put(schema::CF_CONTEXT, &key, item)
    }

    pub fn mission_context(&self, mission_id: &str) -> StoreResult<Vec<ContextItem>> {
        let prefix = format!("ctx:{mission_id}:");
        let keys = self.list_keys(schema::CF_CONTEXT, &prefix)?;
        Ok(keys
            .iter()
            .filter_map(|key| self.get(schema::CF_CONTEXT, key).ok()?)
            .collect())
    }

    // =========================================================================
    // Reviews and reflections
    // =========================================================================

    pub fn put_review(&self, review: &ReviewRecord) -> StoreResult<()> {
        self.put(schema::CF_REVIEWS, &keys::review(&review.unit_id), review)
    }

    pub fn get_review(&self, unit_id: &str) -> StoreResult<Option<ReviewRecord>> {
        self.get(schema::CF_REVIEWS, &keys::review(unit_id))
    }

    pub fn put_reflection(&self, reflection: &Reflection) -> StoreResult<()> {
        let key = keys::reflection(&reflection.mission_id, reflection.epoch_ordinal);
        self.put(schema::CF_REFLECTIONS, &key, reflection)
    }

    pub fn mission_reflections(&self, mission_id: &str) -> StoreResult<Vec<Reflection>> {
        let prefix = format!("rfl:{mission_id}:");
        let keys = self.list_keys(schema::CF_REFLECTIONS, &prefix)?;
        Ok(keys
            .iter()
            .filter_map(|key| self.get(schema::CF_REFLECTIONS, key).ok()?)
            .collect())
    }

    // =========================================================================
    // Event operations (JSON for debuggability)
    // =========================================================================

    pub fn put_event(
        &self,
        timestamp_nanos: i64,
        event_id: &str,
        event: &impl Serialize,
    ) -> StoreResult<()> {
        let key = keys::event(timestamp_nanos, event_id);
        let bytes = serde_json::to_vec(event).map_err(|e| StoreError::Encode(e.to_string()))?;

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn events_range<T: DeserializeOwned>(
        &self,
        start_nanos: i64,
        end_nanos: i64,
    ) -> StoreResult<Vec<(i64, T)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;

        let start_key = keys::event(start_nanos, "");
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward),
        );

        let mut events = Vec::new();
        for result in iter {
            let (key, value) = result?;
            let key_str =
                String::from_utf8(key.to_vec()).map_err(|e| StoreError::Decode(e.to_string()))?;

            if let Some(ts) = keys::parse_event_timestamp(&key_str) {
                if ts > end_nanos {
                    break;
                }
                let event: T = serde_json::from_slice(&value)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                events.push((ts, event));
            }
        }
        Ok(events)
    }
}
