//! Threat list database
//!
//! Stores one sorted hash prefix list per threat type together with the
//! server issued state token and the list's SHA256 checksum. Updates from
//! the Fetch RPC are reconciled with [`reconcile`], which either produces
//! the complete next version of a list or an error, leaving the stored
//! list untouched. Backends commit that result as one unit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use threatmatch_api::{FetchResponse, ListUpdateResponse, ThreatType};
use threatmatch_hash::{to_base64, HashError, PrefixList, FULL_HASH_LENGTH};
use tracing::{debug, warn};

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::MemoryDatabase;
#[cfg(feature = "redb")]
pub use crate::redb::RedbDatabase;

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Error types for database operations
#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    /// The update violates the protocol and was rejected
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    /// The reconciled list does not match the server checksum
    #[error("Checksum mismatch for {threat_type}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        threat_type: ThreatType,
        expected: String,
        actual: String,
    },

    /// Persisted data failed the integrity check
    #[error("Storage corrupted: {0}")]
    StorageCorrupted(String),

    /// Lookups require a full 32 byte hash
    #[error("Invalid hash length: {0} bytes")]
    InvalidHashLength(usize),

    /// Error decoding update data
    #[error("Error decoding data: {0}")]
    Decode(String),

    /// Error from the storage engine
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HashError> for DatabaseError {
    fn from(e: HashError) -> Self {
        DatabaseError::Decode(e.to_string())
    }
}

/// The stored version of one threat list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatList {
    /// Server issued version token
    #[serde(with = "threatmatch_api::serde_helpers::base64_bytes")]
    pub state: Vec<u8>,

    /// SHA256 over the sorted, concatenated prefixes
    #[serde(with = "threatmatch_api::serde_helpers::base64_bytes")]
    pub checksum: Vec<u8>,

    /// Hash prefixes, sorted by raw bytes
    pub hashes: PrefixList,
}

impl ThreatList {
    /// Check sort order and that the stored checksum matches the prefixes
    pub fn verify(&self) -> std::result::Result<(), String> {
        if !self.hashes.is_sorted() {
            return Err("hash prefixes are not sorted".to_string());
        }
        let actual = self.hashes.checksum();
        if actual[..] != self.checksum[..] {
            return Err(format!(
                "checksum {} does not match stored {}",
                to_base64(&actual),
                to_base64(&self.checksum)
            ));
        }
        Ok(())
    }
}

/// When lists were last fetched and how long the server asked us to wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub last_fetch: Option<SystemTime>,
    pub minimum_wait: Duration,
}

/// Retry bookkeeping for one kind of network call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryInfo {
    /// Consecutive failures
    pub retries: u32,
    /// End of the current wait window
    pub until: Option<SystemTime>,
}

/// Retry bookkeeping for Find and Fetch calls, kept across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffInfo {
    pub find: RetryInfo,
    pub update: RetryInfo,
}

/// Database statistics
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    /// Total number of hash prefixes in the database
    pub total_hashes: usize,

    /// Number of stored threat lists
    pub threat_lists: usize,

    /// Prefix count per stored list
    pub lists: Vec<(ThreatType, usize)>,

    /// Last time an update was fetched
    pub last_fetch: Option<SystemTime>,
}

impl fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last_fetch = match self.last_fetch.and_then(|t| t.elapsed().ok()) {
            Some(elapsed) => format!("{}s ago", elapsed.as_secs()),
            None => "never".to_string(),
        };

        write!(
            f,
            "Database stats: {} hashes in {} lists, last fetch: {}",
            self.total_hashes, self.threat_lists, last_fetch
        )?;
        for (threat_type, count) in &self.lists {
            write!(f, "\n  {threat_type}: {count} hashes")?;
        }
        Ok(())
    }
}

/// Threat list storage
///
/// Implementations serialize all access behind a single lock so lookups
/// never observe a half applied update.
#[async_trait]
pub trait Database: Send + Sync {
    /// Stored state token for a list, empty if the list was never populated
    async fn get_state(&self, threat_type: ThreatType) -> Result<Vec<u8>>;

    /// Longest stored prefix of `hash` in every list, base64 encoded and
    /// deduplicated. `hash` must be a full 32 byte hash.
    async fn find(&self, hash: &[u8]) -> Result<Vec<String>>;

    /// Reconcile and commit a single list update
    async fn update_list(&self, response: &ListUpdateResponse) -> Result<()>;

    /// Record when a fetch happened and the server requested wait
    async fn record_fetch(&self, info: UpdateInfo) -> Result<()>;

    async fn update_info(&self) -> UpdateInfo;

    /// Record the client's network backoff state
    async fn record_backoff(&self, info: BackoffInfo) -> Result<()>;

    async fn backoff_info(&self) -> BackoffInfo;

    async fn stats(&self) -> DatabaseStats;

    /// Drop every list and all metadata
    async fn clear(&self) -> Result<()>;

    /// Apply a Fetch response.
    ///
    /// Each list is reconciled on its own; a rejected list does not stop
    /// the others. Returns the first error after every list was attempted.
    async fn update(&self, response: &FetchResponse) -> Result<()> {
        debug!(
            "Applying {} list update responses",
            response.list_update_responses.len()
        );

        let mut first_error = None;
        for list_update in &response.list_update_responses {
            if let Err(e) = self.update_list(list_update).await {
                warn!(
                    "Rejected update for {}: {}",
                    list_update.descriptor(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        let recorded = self
            .record_fetch(UpdateInfo {
                last_fetch: Some(SystemTime::now()),
                minimum_wait: response.minimum_wait_duration.unwrap_or_default(),
            })
            .await;
        if let Err(e) = recorded {
            warn!("Failed to record fetch time: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Compute the next version of a list from its current version and an update.
///
/// Returns `Ok(None)` when the update neither adds nor removes anything.
/// On error the current version is unaffected and the state token must not
/// advance.
pub fn reconcile(
    current: Option<&ThreatList>,
    response: &ListUpdateResponse,
) -> Result<Option<ThreatList>> {
    let threat_type = response.threat_type;
    if response.is_empty() {
        debug!("No changes for {}", threat_type);
        return Ok(None);
    }

    let mut hashes = if response.is_full_update() {
        if !response.removals.is_empty() {
            return Err(DatabaseError::MalformedUpdate(format!(
                "full update for {threat_type} carries removals"
            )));
        }
        PrefixList::new()
    } else {
        match current {
            Some(list) => list.hashes.clone(),
            None => {
                return Err(DatabaseError::MalformedUpdate(format!(
                    "partial update for {threat_type} without a stored list"
                )))
            }
        }
    };

    let mut indices = Vec::new();
    for removal in &response.removals {
        indices.extend(removal.decode_removals()?);
    }
    let removed = hashes.remove_indices(indices);

    let mut additions = Vec::new();
    for addition in &response.additions {
        additions.extend(addition.decode_additions()?);
    }
    let added = additions.len();
    hashes.extend_sorted(additions);

    debug!(
        "Reconciled {} for {}: {} removed, {} added, {} total",
        if response.is_full_update() {
            "full update"
        } else {
            "partial update"
        },
        threat_type,
        removed,
        added,
        hashes.len()
    );

    let expected = response
        .checksum
        .as_ref()
        .map(|c| c.sha256.as_slice())
        .ok_or_else(|| {
            DatabaseError::MalformedUpdate(format!("update for {threat_type} has no checksum"))
        })?;
    let actual = hashes.checksum();
    if actual[..] != *expected {
        return Err(DatabaseError::ChecksumMismatch {
            threat_type,
            expected: to_base64(expected),
            actual: to_base64(&actual),
        });
    }

    Ok(Some(ThreatList {
        state: response.new_client_state.clone(),
        checksum: actual.to_vec(),
        hashes,
    }))
}

/// In-memory contents shared by the backends
#[derive(Debug, Default)]
pub(crate) struct ListStore {
    pub(crate) lists: HashMap<ThreatType, ThreatList>,
    pub(crate) update_info: UpdateInfo,
    pub(crate) backoff: BackoffInfo,
}

impl ListStore {
    pub(crate) fn get_state(&self, threat_type: ThreatType) -> Vec<u8> {
        self.lists
            .get(&threat_type)
            .map(|list| list.state.clone())
            .unwrap_or_default()
    }

    pub(crate) fn find(&self, hash: &[u8]) -> Result<Vec<String>> {
        if hash.len() != FULL_HASH_LENGTH {
            return Err(DatabaseError::InvalidHashLength(hash.len()));
        }

        let mut matches: Vec<String> = Vec::new();
        for list in self.lists.values() {
            if let Some(prefix) = list.hashes.longest_match(hash) {
                let encoded = prefix.to_base64();
                if !matches.contains(&encoded) {
                    matches.push(encoded);
                }
            }
        }
        Ok(matches)
    }

    pub(crate) fn stats(&self) -> DatabaseStats {
        let mut lists: Vec<(ThreatType, usize)> = self
            .lists
            .iter()
            .map(|(threat_type, list)| (*threat_type, list.hashes.len()))
            .collect();
        lists.sort();

        DatabaseStats {
            total_hashes: lists.iter().map(|(_, count)| count).sum(),
            threat_lists: lists.len(),
            lists,
            last_fetch: self.update_info.last_fetch,
        }
    }
}
