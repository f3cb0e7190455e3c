//! # Local threat list URL matching
//!
//! This crate checks URLs against locally stored threat list hash prefixes
//! and confirms local matches with full hash lookups against a remote threat
//! service. Lists are kept up to date with periodic incremental updates.
//!
//! ## Features
//!
//! - Asynchronous API using tokio
//! - Pluggable database backends (in memory or persistent redb)
//! - Positive and negative result caching with server supplied TTLs
//! - URL canonicalization and lookup candidate generation
//! - Exponential backoff when the remote service fails
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use threatmatch::{ApiConfig, Config, HttpThreatService, MemoryDatabase, ThreatMatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = HttpThreatService::new(&ApiConfig {
//!         api_key: "your-api-key".to_string(),
//!         ..Default::default()
//!     })?;
//!
//!     let mut matcher = ThreatMatcher::new(
//!         Config::default(),
//!         Arc::new(MemoryDatabase::new()),
//!         Arc::new(service),
//!     )?;
//!     matcher.update().await?;
//!     matcher.start_updater();
//!
//!     let verdict = matcher.check_url("http://example.com/suspicious").await?;
//!     println!("{verdict}");
//!
//!     matcher.close().await?;
//!     Ok(())
//! }
//! ```

// Re-export crates from workspace
pub use threatmatch_api;
pub use threatmatch_db;
pub use threatmatch_hash;
pub use threatmatch_url;

pub mod backoff;
pub mod cache;
pub mod error;
pub mod verdict;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{oneshot, Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, Operation};

pub use crate::cache::{Cache, CacheHit, CacheLookup, CacheStats};
pub use crate::error::{Error, ErrorContext, Result};
pub use crate::verdict::{classify, Verdict};
pub use threatmatch_api::{
    ApiConfig, ApiError, ClientInfo, Constraints, FetchRequest, FetchResponse, FindRequest,
    FindResponse, HttpThreatService, ListUpdateRequest, PlatformType, ThreatDescriptor,
    ThreatEntry, ThreatEntryType, ThreatInfo, ThreatService, ThreatType,
};
#[cfg(feature = "redb")]
pub use threatmatch_db::RedbDatabase;
pub use threatmatch_db::{
    BackoffInfo, Database, DatabaseError, DatabaseStats, MemoryDatabase, RetryInfo, UpdateInfo,
};
pub use threatmatch_hash::HashPrefix;
pub use threatmatch_url::{canonicalize, candidate_lookup_strings, validate_url, CanonicalUrl};

/// Default update period for threat lists (30 minutes)
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Default interval between cache purges
pub const DEFAULT_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default client ID
pub const DEFAULT_CLIENT_ID: &str = env!("CARGO_PKG_NAME");

/// Default client version
pub const DEFAULT_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the matching client
#[derive(Debug, Clone)]
pub struct Config {
    /// Client identifier for API requests
    pub client_id: String,

    /// Client version for API requests
    pub client_version: String,

    /// Threat lists to keep up to date and match against
    pub threat_lists: Vec<ThreatDescriptor>,

    /// How often to update threat lists
    pub update_period: Duration,

    /// Update constraints forwarded with every list update request
    pub constraints: Constraints,

    /// Platforms named in full hash lookups
    pub find_platform_types: Vec<PlatformType>,

    /// Entry types named in full hash lookups
    pub find_threat_entry_types: Vec<ThreatEntryType>,

    /// How often the background updater purges expired cache entries
    pub cache_purge_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
            update_period: DEFAULT_UPDATE_PERIOD,
            threat_lists: ThreatType::LISTED
                .into_iter()
                .map(ThreatDescriptor::url_list)
                .collect(),
            constraints: Constraints::default(),
            find_platform_types: vec![PlatformType::AnyPlatform],
            find_threat_entry_types: vec![ThreatEntryType::Url],
            cache_purge_interval: DEFAULT_CACHE_PURGE_INTERVAL,
        }
    }
}

impl Config {
    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.client_id.clone(),
            client_version: self.client_version.clone(),
        }
    }

    /// Distinct threat types across the configured lists
    fn threat_types(&self) -> Vec<ThreatType> {
        let mut threat_types: Vec<ThreatType> = Vec::new();
        for descriptor in &self.threat_lists {
            if !threat_types.contains(&descriptor.threat_type) {
                threat_types.push(descriptor.threat_type);
            }
        }
        threat_types
    }
}

/// Statistics about matching operations
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Number of queries answered by the local database alone
    pub queries_by_database: u64,

    /// Number of queries served from cache
    pub queries_by_cache: u64,

    /// Number of queries that needed a full hash lookup
    pub queries_by_api: u64,

    /// Number of failed queries
    pub queries_fail: u64,

    /// Number of successful list updates
    pub updates: u64,

    /// Number of failed list updates
    pub updates_fail: u64,

    /// Duration since the last list fetch
    pub database_update_lag: Duration,
}

struct Inner {
    config: Config,
    database: Arc<dyn Database>,
    service: Arc<dyn ThreatService>,
    cache: Mutex<Cache>,
    backoff: OnceCell<Mutex<Backoff>>,
    stats: Mutex<Stats>,
}

/// Matching client
pub struct ThreatMatcher {
    inner: Arc<Inner>,
    update_task: Option<JoinHandle<()>>,
    shutdown_sender: Option<oneshot::Sender<()>>,
}

impl ThreatMatcher {
    /// Create a matching client over a database and a threat service
    pub fn new(
        config: Config,
        database: Arc<dyn Database>,
        service: Arc<dyn ThreatService>,
    ) -> Result<Self> {
        if config.threat_lists.is_empty() {
            return Err(Error::Configuration(
                "At least one threat list is required".to_string(),
            ));
        }
        if config.update_period.is_zero() {
            return Err(Error::Configuration(
                "Update period must be positive".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                database,
                service,
                cache: Mutex::new(Cache::new()),
                backoff: OnceCell::new(),
                stats: Mutex::new(Stats::default()),
            }),
            update_task: None,
            shutdown_sender: None,
        })
    }

    /// The configuration this client was created with
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Check one URL
    pub async fn check_url(&self, url: &str) -> Result<Verdict> {
        self.inner.check_url(url).await
    }

    /// Check multiple URLs, in order
    pub async fn check_urls(&self, urls: &[impl AsRef<str>]) -> Result<Vec<Verdict>> {
        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            results.push(self.inner.check_url(url.as_ref()).await?);
        }
        Ok(results)
    }

    /// Fetch and apply list updates now
    pub async fn update(&self) -> Result<()> {
        self.inner.update().await
    }

    /// Time until the next list update is due
    pub async fn next_update_delay(&self) -> Duration {
        self.inner.next_update_delay().await
    }

    /// Get current statistics
    pub async fn stats(&self) -> Stats {
        let mut stats = self.inner.stats.lock().await.clone();
        if let Some(last_fetch) = self.inner.database.update_info().await.last_fetch {
            stats.database_update_lag = SystemTime::now()
                .duration_since(last_fetch)
                .unwrap_or_default();
        }
        stats
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().await.stats()
    }

    /// Get database statistics
    pub async fn database_stats(&self) -> DatabaseStats {
        self.inner.database.stats().await
    }

    /// Start the background task that keeps lists updated and purges the cache
    pub fn start_updater(&mut self) {
        if self.update_task.is_some() {
            debug!("Update task already running");
            return;
        }

        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel();
        self.shutdown_sender = Some(shutdown_sender);

        let inner = Arc::clone(&self.inner);
        let update_task = tokio::spawn(async move {
            loop {
                let delay = inner.next_update_delay().await;
                let sleep_for = delay.min(inner.config.cache_purge_interval);
                debug!("Next list update in {:?}", delay);

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        if sleep_for == delay {
                            if let Err(e) = inner.update().await {
                                error!("Threat list update failed: {}", e);
                            }
                        }
                        inner.cache.lock().await.purge();
                    }
                    _ = &mut shutdown_receiver => {
                        info!("Update task shutting down");
                        break;
                    }
                }
            }
        });

        self.update_task = Some(update_task);
    }

    /// Stop the background updater and wait for it to finish
    pub async fn close(&mut self) -> Result<()> {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }

        if let Some(task) = self.update_task.take() {
            task.await
                .map_err(|e| Error::Internal(format!("Update task error: {e}")))?;
        }

        Ok(())
    }
}

impl Inner {
    async fn check_url(&self, url: &str) -> Result<Verdict> {
        let lookup_start = Instant::now();
        let full_hashes = threatmatch_url::full_hashes(url)?;

        let mut any_local_match = false;
        let mut confirmed = Vec::new();
        let mut unresolved: Vec<HashPrefix> = Vec::new();

        for hash in &full_hashes {
            let local_matches = match self.database.find(hash.as_bytes()).await {
                Ok(matches) => matches,
                Err(e) => {
                    self.stats.lock().await.queries_fail += 1;
                    return Err(e.into());
                }
            };
            if local_matches.is_empty() {
                continue;
            }
            any_local_match = true;

            let lookup = self.cache.lock().await.find(hash);
            match lookup.hit {
                CacheHit::Positive => confirmed.extend(lookup.threats),
                CacheHit::Negative => {}
                CacheHit::Miss => {
                    for encoded in &local_matches {
                        let prefix = HashPrefix::from_base64(encoded).map_err(DatabaseError::from)?;
                        if !unresolved.contains(&prefix) {
                            unresolved.push(prefix);
                        }
                    }
                }
            }
        }

        if !any_local_match {
            self.stats.lock().await.queries_by_database += 1;
            debug!(
                "lookup for '{}' (no local match) completed in {:?}",
                url,
                lookup_start.elapsed()
            );
            return Ok(Verdict::Safe);
        }

        if !confirmed.is_empty() || unresolved.is_empty() {
            self.stats.lock().await.queries_by_cache += 1;
            debug!(
                "lookup for '{}' (cache) completed in {:?}",
                url,
                lookup_start.elapsed()
            );
            return Ok(classify(&confirmed));
        }

        if !self.backoff().await.can_find() {
            debug!("Full hash lookups are backing off, '{}' is unknown", url);
            return Ok(Verdict::Unknown);
        }

        let request = self.find_request(&unresolved).await?;
        let response = match self.service.find(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                let (delay, info) = {
                    let mut backoff = self.backoff().await;
                    let delay = backoff.enter(Operation::Find, server_wait(&e));
                    (delay, backoff.to_info())
                };
                self.save_backoff(info).await;
                self.stats.lock().await.queries_fail += 1;
                warn!("Full hash lookup failed, backing off for {:?}: {}", delay, e);
                return Err(Error::Network(e));
            }
        };

        let changed = {
            let mut backoff = self.backoff().await;
            let mut changed = backoff.reset(Operation::Find);
            if let Some(wait) = response.minimum_wait_duration {
                backoff.defer(Operation::Find, wait);
                changed = true;
            }
            changed.then(|| backoff.to_info())
        };
        if let Some(info) = changed {
            self.save_backoff(info).await;
        }

        self.cache.lock().await.update(&request, &response);
        self.stats.lock().await.queries_by_api += 1;

        let threats: Vec<ThreatType> = response
            .matches
            .iter()
            .filter(|threat_match| {
                full_hashes
                    .iter()
                    .any(|hash| hash.as_bytes() == threat_match.threat.hash.as_slice())
            })
            .map(|threat_match| threat_match.threat_type)
            .collect();

        debug!(
            "lookup for '{}' (api) completed in {:?}",
            url,
            lookup_start.elapsed()
        );
        Ok(classify(&threats))
    }

    async fn find_request(&self, prefixes: &[HashPrefix]) -> Result<FindRequest> {
        let mut client_states = Vec::new();
        for threat_type in self.config.threat_types() {
            let state = self.database.get_state(threat_type).await?;
            if !state.is_empty() {
                client_states.push(state);
            }
        }

        Ok(FindRequest {
            client: self.config.client_info(),
            client_states,
            threat_info: ThreatInfo {
                threat_types: self.config.threat_types(),
                platform_types: self.config.find_platform_types.clone(),
                threat_entry_types: self.config.find_threat_entry_types.clone(),
                threat_entries: prefixes.iter().map(ThreatEntry::from_hash).collect(),
            },
        })
    }

    async fn update(&self) -> Result<()> {
        if !self.backoff().await.can_update() {
            debug!("List updates are backing off, skipping update");
            return Ok(());
        }

        let mut list_update_requests = Vec::with_capacity(self.config.threat_lists.len());
        for descriptor in &self.config.threat_lists {
            list_update_requests.push(ListUpdateRequest {
                threat_type: descriptor.threat_type,
                platform_type: descriptor.platform_type,
                threat_entry_type: descriptor.threat_entry_type,
                state: self.database.get_state(descriptor.threat_type).await?,
                constraints: Some(self.config.constraints.clone()),
            });
        }

        debug!("Fetching updates for {} lists", list_update_requests.len());
        let request = FetchRequest {
            client: self.config.client_info(),
            list_update_requests,
        };

        let response = match self.service.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                let (delay, info) = {
                    let mut backoff = self.backoff().await;
                    let delay = backoff.enter(Operation::Update, server_wait(&e));
                    (delay, backoff.to_info())
                };
                self.save_backoff(info).await;
                self.stats.lock().await.updates_fail += 1;
                warn!("List fetch failed, backing off for {:?}: {}", delay, e);
                return Err(Error::Network(e));
            }
        };
        let cleared = {
            let mut backoff = self.backoff().await;
            backoff
                .reset(Operation::Update)
                .then(|| backoff.to_info())
        };
        if let Some(info) = cleared {
            self.save_backoff(info).await;
        }

        if let Err(e) = self.database.update(&response).await {
            self.stats.lock().await.updates_fail += 1;
            return Err(e.into());
        }

        self.cache.lock().await.purge();
        self.stats.lock().await.updates += 1;
        info!(
            "Applied {} list updates",
            response.list_update_responses.len()
        );
        Ok(())
    }

    async fn next_update_delay(&self) -> Duration {
        let deadline = self.backoff().await.deadline(Operation::Update);
        if let Some(deadline) = deadline {
            return deadline.saturating_duration_since(Instant::now());
        }

        let info = self.database.update_info().await;
        let Some(last_fetch) = info.last_fetch else {
            return Duration::ZERO;
        };
        let interval = self.config.update_period.max(info.minimum_wait);
        let elapsed = SystemTime::now()
            .duration_since(last_fetch)
            .unwrap_or_default();
        interval.saturating_sub(elapsed)
    }

    /// Backoff state, restored from the database on first use
    async fn backoff(&self) -> MutexGuard<'_, Backoff> {
        let database = &self.database;
        self.backoff
            .get_or_init(|| async move {
                let info = database.backoff_info().await;
                if info != BackoffInfo::default() {
                    info!("Restored backoff state: {:?}", info);
                }
                Mutex::new(Backoff::from_info(info))
            })
            .await
            .lock()
            .await
    }

    async fn save_backoff(&self, info: BackoffInfo) {
        if let Err(e) = self.database.record_backoff(info).await {
            warn!("Failed to save backoff state: {}", e);
        }
    }
}

/// Wait requested by the server alongside an error
fn server_wait(error: &threatmatch_api::Error) -> Option<Duration> {
    match error {
        threatmatch_api::Error::Api(ApiError::RateLimit { retry_after }) => *retry_after,
        _ => None,
    }
}

impl Drop for ThreatMatcher {
    fn drop(&mut self) {
        if self.update_task.is_some() {
            warn!("ThreatMatcher dropped without calling close()");
        }
    }
}

impl std::fmt::Debug for ThreatMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatMatcher")
            .field("config", &self.inner.config)
            .field("stats", &"<stats>")
            .field("updater_running", &self.update_task.is_some())
            .finish()
    }
}
