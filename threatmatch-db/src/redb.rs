//! Redb-based persistent database backend
//!
//! Each threat list is one JSON record in the `threat_lists` table, keyed
//! by threat type name, so a list commit is a single write transaction.
//! All lists are mirrored in memory for lookups. Opening a database
//! recomputes every list's checksum; if any list fails, the whole store is
//! wiped and every list starts over with a full update.

use crate::{
    reconcile, BackoffInfo, Database, DatabaseError, DatabaseStats, ListStore, Result, RetryInfo,
    ThreatList, UpdateInfo,
};
use async_trait::async_trait;
use redb::{Database as RedbDb, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use threatmatch_api::{ListUpdateResponse, ThreatType};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Table definitions for redb storage
const THREAT_LISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("threat_lists");
const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

/// Metadata keys
const UPDATE_INFO_KEY: &str = "update_info";
const BACKOFF_KEY: &str = "backoff";

/// Serializable fetch bookkeeping
#[derive(Serialize, Deserialize, Default)]
struct StoredUpdateInfo {
    /// Last fetch, seconds since epoch
    last_fetch: Option<u64>,
    minimum_wait_ms: u64,
}

impl From<UpdateInfo> for StoredUpdateInfo {
    fn from(info: UpdateInfo) -> Self {
        Self {
            last_fetch: info
                .last_fetch
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            minimum_wait_ms: info.minimum_wait.as_millis() as u64,
        }
    }
}

impl From<StoredUpdateInfo> for UpdateInfo {
    fn from(stored: StoredUpdateInfo) -> Self {
        Self {
            last_fetch: stored
                .last_fetch
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            minimum_wait: Duration::from_millis(stored.minimum_wait_ms),
        }
    }
}

/// Serializable retry bookkeeping, `until` in milliseconds since epoch
#[derive(Serialize, Deserialize, Default)]
struct StoredRetryInfo {
    retries: u32,
    until_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredBackoffInfo {
    find: StoredRetryInfo,
    update: StoredRetryInfo,
}

impl From<RetryInfo> for StoredRetryInfo {
    fn from(info: RetryInfo) -> Self {
        Self {
            retries: info.retries,
            until_ms: info
                .until
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64),
        }
    }
}

impl From<StoredRetryInfo> for RetryInfo {
    fn from(stored: StoredRetryInfo) -> Self {
        Self {
            retries: stored.retries,
            until: stored
                .until_ms
                .map(|ms| UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

impl From<BackoffInfo> for StoredBackoffInfo {
    fn from(info: BackoffInfo) -> Self {
        Self {
            find: info.find.into(),
            update: info.update.into(),
        }
    }
}

impl From<StoredBackoffInfo> for BackoffInfo {
    fn from(stored: StoredBackoffInfo) -> Self {
        Self {
            find: stored.find.into(),
            update: stored.update.into(),
        }
    }
}

fn storage_error<E: Display>(context: &'static str) -> impl FnOnce(E) -> DatabaseError {
    move |e| DatabaseError::Storage(format!("{context}: {e}"))
}

/// Redb-based persistent database
pub struct RedbDatabase {
    db: RedbDb,
    inner: Mutex<ListStore>,
    path: PathBuf,
}

impl RedbDatabase {
    /// Open or create a database at `path`
    ///
    /// Runs the integrity check on every stored list before returning.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening RedbDatabase at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = RedbDb::create(&path).map_err(storage_error("Failed to open database"))?;
        create_tables(&db)?;

        let store = match load_store(&db) {
            Ok(store) => store,
            Err(DatabaseError::StorageCorrupted(reason)) => {
                warn!(
                    "Database at {:?} failed integrity check ({}), discarding all threat lists",
                    path, reason
                );
                wipe(&db)?;
                ListStore::default()
            }
            Err(e) => return Err(e),
        };

        info!(
            "Loaded {} threat lists with {} hashes",
            store.lists.len(),
            store.lists.values().map(|l| l.hashes.len()).sum::<usize>()
        );

        Ok(Self {
            db,
            inner: Mutex::new(store),
            path,
        })
    }

    /// Open the database at [`RedbDatabase::default_path`]
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    /// Get the default database path in the system cache directory
    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().ok_or_else(|| {
            DatabaseError::Storage("Failed to get cache directory".to_string())
        })?;

        Ok(cache_dir.join("threatmatch").join("database.redb"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of one stored list
    pub async fn threat_list(&self, threat_type: ThreatType) -> Option<ThreatList> {
        self.inner.lock().await.lists.get(&threat_type).cloned()
    }

    fn store_threat_list(&self, threat_type: ThreatType, list: &ThreatList) -> Result<()> {
        debug!(
            "Storing threat list {} with {} hashes",
            threat_type,
            list.hashes.len()
        );

        let value = serde_json::to_vec(list).map_err(|e| {
            DatabaseError::Storage(format!("Failed to serialize threat list: {e}"))
        })?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_error("Failed to begin write transaction"))?;
        {
            let mut table = write_txn
                .open_table(THREAT_LISTS_TABLE)
                .map_err(storage_error("Failed to open threat_lists table"))?;
            table
                .insert(threat_type.as_str(), value.as_slice())
                .map_err(storage_error("Failed to insert threat list"))?;
        }
        write_txn
            .commit()
            .map_err(storage_error("Failed to commit transaction"))?;

        Ok(())
    }

    fn store_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_error("Failed to begin write transaction"))?;
        {
            let mut table = write_txn
                .open_table(METADATA_TABLE)
                .map_err(storage_error("Failed to open metadata table"))?;
            table
                .insert(key, value)
                .map_err(storage_error("Failed to insert metadata"))?;
        }
        write_txn
            .commit()
            .map_err(storage_error("Failed to commit transaction"))?;

        debug!("Stored metadata key: {}", key);
        Ok(())
    }
}

fn create_tables(db: &RedbDb) -> Result<()> {
    let write_txn = db
        .begin_write()
        .map_err(storage_error("Failed to begin write transaction"))?;
    write_txn
        .open_table(THREAT_LISTS_TABLE)
        .map_err(storage_error("Failed to create threat_lists table"))?;
    write_txn
        .open_table(METADATA_TABLE)
        .map_err(storage_error("Failed to create metadata table"))?;
    write_txn
        .commit()
        .map_err(storage_error("Failed to commit transaction"))?;
    Ok(())
}

/// Read every list and verify it. Undecodable or inconsistent records
/// are reported as `StorageCorrupted`.
fn load_store(db: &RedbDb) -> Result<ListStore> {
    let read_txn = db
        .begin_read()
        .map_err(storage_error("Failed to begin read transaction"))?;

    let table = read_txn
        .open_table(THREAT_LISTS_TABLE)
        .map_err(storage_error("Failed to open threat_lists table"))?;

    let mut lists = HashMap::new();
    for item in table
        .iter()
        .map_err(storage_error("Failed to iterate table"))?
    {
        let (key, value) = item.map_err(storage_error("Failed to read table item"))?;
        let name = key.value();

        let threat_type: ThreatType = name.parse().map_err(DatabaseError::StorageCorrupted)?;
        let list: ThreatList = serde_json::from_slice(value.value()).map_err(|e| {
            DatabaseError::StorageCorrupted(format!("undecodable record for {name}: {e}"))
        })?;
        list.verify()
            .map_err(|reason| DatabaseError::StorageCorrupted(format!("{name}: {reason}")))?;

        debug!(
            "Loaded threat list {} with {} hashes",
            threat_type,
            list.hashes.len()
        );
        lists.insert(threat_type, list);
    }

    let metadata = read_txn
        .open_table(METADATA_TABLE)
        .map_err(storage_error("Failed to open metadata table"))?;
    let update_info = match metadata
        .get(UPDATE_INFO_KEY)
        .map_err(storage_error("Failed to get metadata"))?
    {
        Some(value) => serde_json::from_slice::<StoredUpdateInfo>(value.value())
            .map_err(|e| DatabaseError::StorageCorrupted(format!("undecodable update info: {e}")))?
            .into(),
        None => UpdateInfo::default(),
    };

    // A bad backoff record resets backoff only, the lists stay.
    let backoff = match metadata
        .get(BACKOFF_KEY)
        .map_err(storage_error("Failed to get metadata"))?
    {
        Some(value) => match serde_json::from_slice::<StoredBackoffInfo>(value.value()) {
            Ok(stored) => stored.into(),
            Err(e) => {
                warn!("Ignoring undecodable backoff state: {}", e);
                BackoffInfo::default()
            }
        },
        None => BackoffInfo::default(),
    };

    Ok(ListStore {
        lists,
        update_info,
        backoff,
    })
}

/// Delete every record in one transaction
fn wipe(db: &RedbDb) -> Result<()> {
    let write_txn = db
        .begin_write()
        .map_err(storage_error("Failed to begin write transaction"))?;
    write_txn
        .delete_table(THREAT_LISTS_TABLE)
        .map_err(storage_error("Failed to delete threat_lists table"))?;
    write_txn
        .delete_table(METADATA_TABLE)
        .map_err(storage_error("Failed to delete metadata table"))?;
    write_txn
        .open_table(THREAT_LISTS_TABLE)
        .map_err(storage_error("Failed to create threat_lists table"))?;
    write_txn
        .open_table(METADATA_TABLE)
        .map_err(storage_error("Failed to create metadata table"))?;
    write_txn
        .commit()
        .map_err(storage_error("Failed to commit transaction"))?;
    Ok(())
}

#[async_trait]
impl Database for RedbDatabase {
    async fn get_state(&self, threat_type: ThreatType) -> Result<Vec<u8>> {
        Ok(self.inner.lock().await.get_state(threat_type))
    }

    async fn find(&self, hash: &[u8]) -> Result<Vec<String>> {
        self.inner.lock().await.find(hash)
    }

    async fn update_list(&self, response: &ListUpdateResponse) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let threat_type = response.threat_type;
        if let Some(list) = reconcile(inner.lists.get(&threat_type), response)? {
            // Disk first, so a failed write leaves both copies on the old version.
            self.store_threat_list(threat_type, &list)?;
            inner.lists.insert(threat_type, list);
        }
        Ok(())
    }

    async fn record_fetch(&self, info: UpdateInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let value = serde_json::to_vec(&StoredUpdateInfo::from(info)).map_err(|e| {
            DatabaseError::Storage(format!("Failed to serialize update info: {e}"))
        })?;
        self.store_metadata(UPDATE_INFO_KEY, &value)?;
        inner.update_info = info;
        Ok(())
    }

    async fn update_info(&self) -> UpdateInfo {
        self.inner.lock().await.update_info
    }

    async fn record_backoff(&self, info: BackoffInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let value = serde_json::to_vec(&StoredBackoffInfo::from(info)).map_err(|e| {
            DatabaseError::Storage(format!("Failed to serialize backoff state: {e}"))
        })?;
        self.store_metadata(BACKOFF_KEY, &value)?;
        inner.backoff = info;
        Ok(())
    }

    async fn backoff_info(&self) -> BackoffInfo {
        self.inner.lock().await.backoff
    }

    async fn stats(&self) -> DatabaseStats {
        self.inner.lock().await.stats()
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        info!("Clearing database at {:?}", self.path);
        wipe(&self.db)?;
        *inner = ListStore::default();
        Ok(())
    }
}
