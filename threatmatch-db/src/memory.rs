//! In-memory database backend

use crate::{
    reconcile, BackoffInfo, Database, DatabaseStats, ListStore, Result, ThreatList, UpdateInfo,
};
use async_trait::async_trait;
use threatmatch_api::{ListUpdateResponse, ThreatType};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Database that keeps every list in memory
///
/// Contents are lost when the process exits, so every list starts with a
/// full update.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    inner: Mutex<ListStore>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one stored list
    pub async fn threat_list(&self, threat_type: ThreatType) -> Option<ThreatList> {
        self.inner.lock().await.lists.get(&threat_type).cloned()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
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
            debug!(
                "Storing threat list {} with {} hashes",
                threat_type,
                list.hashes.len()
            );
            inner.lists.insert(threat_type, list);
        }
        Ok(())
    }

    async fn record_fetch(&self, info: UpdateInfo) -> Result<()> {
        self.inner.lock().await.update_info = info;
        Ok(())
    }

    async fn update_info(&self) -> UpdateInfo {
        self.inner.lock().await.update_info
    }

    async fn record_backoff(&self, info: BackoffInfo) -> Result<()> {
        self.inner.lock().await.backoff = info;
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
        info!("Clearing {} threat lists", inner.lists.len());
        *inner = ListStore::default();
        Ok(())
    }
}
