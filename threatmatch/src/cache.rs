//! Full hash result cache
//!
//! Positive entries remember which threat lists a full hash was confirmed
//! on, each with its own expiry. Negative entries remember that a prefix
//! was confirmed clean. Nothing is persisted.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use threatmatch_api::{FindRequest, FindResponse, ThreatType};
use threatmatch_hash::HashPrefix;
use tracing::{debug, warn};

/// Outcome of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    /// The hash is a confirmed threat
    Positive,
    /// A prefix of the hash is confirmed clean
    Negative,
    /// The cache cannot answer
    Miss,
}

/// Result of [`Cache::find`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    /// Threat types for a positive hit, empty otherwise
    pub threats: Vec<ThreatType>,
    pub hit: CacheHit,
}

impl CacheLookup {
    fn miss() -> Self {
        Self {
            threats: Vec::new(),
            hit: CacheHit::Miss,
        }
    }
}

/// Threat types a full hash was confirmed on
#[derive(Debug, Clone, Default)]
struct ThreatCacheEntry {
    threats: Vec<(ThreatType, Instant)>,
}

impl ThreatCacheEntry {
    fn insert(&mut self, threat_type: ThreatType, expiry: Instant) {
        match self.threats.iter_mut().find(|(t, _)| *t == threat_type) {
            Some(slot) => slot.1 = expiry,
            None => self.threats.push((threat_type, expiry)),
        }
    }

    fn all_valid(&self, now: Instant) -> bool {
        self.threats.iter().all(|&(_, expiry)| expiry > now)
    }

    fn any_valid(&self, now: Instant) -> bool {
        self.threats.iter().any(|&(_, expiry)| expiry > now)
    }
}

/// TTL-based cache of Find results
#[derive(Debug, Default)]
pub struct Cache {
    // Positive cache: full hash -> threat types with TTL
    positive_cache: HashMap<HashPrefix, ThreatCacheEntry>,

    // Negative cache: exact hash prefix -> expiry time
    negative_cache: HashMap<HashPrefix, Instant>,

    hits: u64,
    misses: u64,
}

impl Cache {
    /// Create a new cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a full hash.
    ///
    /// A positive entry is served only while none of its threat entries has
    /// expired. Otherwise every prefix of the hash is checked for an
    /// unexpired negative entry. Anything that is not a full hash is a miss.
    pub fn find(&mut self, hash: &HashPrefix) -> CacheLookup {
        if !hash.is_full_hash() {
            self.misses += 1;
            return CacheLookup::miss();
        }

        let now = Instant::now();

        if let Some(entry) = self.positive_cache.get(hash) {
            if entry.all_valid(now) {
                self.hits += 1;
                return CacheLookup {
                    threats: entry.threats.iter().map(|&(t, _)| t).collect(),
                    hit: CacheHit::Positive,
                };
            }
            debug!("Positive cache entry for {} has expired", hash);
            self.misses += 1;
            return CacheLookup::miss();
        }

        let negative = hash.prefixes().any(|prefix| {
            self.negative_cache
                .get(&prefix)
                .is_some_and(|&expiry| expiry > now)
        });
        if negative {
            self.hits += 1;
            return CacheLookup {
                threats: Vec::new(),
                hit: CacheHit::Negative,
            };
        }

        self.misses += 1;
        CacheLookup::miss()
    }

    /// Record that `hash` is on the `threat_type` list for `ttl`
    pub fn insert_positive(&mut self, hash: HashPrefix, threat_type: ThreatType, ttl: Duration) {
        if !hash.is_full_hash() {
            return;
        }

        let expiry = Instant::now() + ttl;
        self.positive_cache
            .entry(hash)
            .or_default()
            .insert(threat_type, expiry);
    }

    /// Record that every hash starting with `prefix` is clean for `ttl`
    pub fn insert_negative(&mut self, prefix: HashPrefix, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        self.negative_cache.insert(prefix, expiry);
    }

    /// Update the cache with a Find response
    pub fn update(&mut self, request: &FindRequest, response: &FindResponse) {
        for threat_match in &response.matches {
            let hash = match HashPrefix::new(threat_match.threat.hash.clone()) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Ignoring match with invalid hash: {}", e);
                    continue;
                }
            };
            let ttl = threat_match.cache_duration.unwrap_or_default();
            self.insert_positive(hash, threat_match.threat_type, ttl);
        }

        let negative_ttl = response.negative_cache_duration.unwrap_or_default();
        if negative_ttl > Duration::ZERO {
            for entry in &request.threat_info.threat_entries {
                match HashPrefix::new(entry.hash.clone()) {
                    Ok(prefix) => self.insert_negative(prefix, negative_ttl),
                    Err(e) => warn!("Ignoring requested prefix with invalid length: {}", e),
                }
            }
        }

        debug!(
            "Cache updated with {} matches, {} entries total",
            response.matches.len(),
            self.entry_count()
        );
    }

    /// Purge expired entries from the cache.
    ///
    /// A positive entry whose threat entries have all expired is kept while
    /// an unexpired negative entry covers some prefix of its hash.
    pub fn purge(&mut self) {
        let now = Instant::now();
        let negative_cache = &self.negative_cache;

        self.positive_cache.retain(|hash, entry| {
            entry.any_valid(now)
                || hash.prefixes().any(|prefix| {
                    negative_cache
                        .get(&prefix)
                        .is_some_and(|&expiry| expiry > now)
                })
        });

        self.negative_cache.retain(|_, &mut expiry| expiry > now);
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            positive_entries: self.positive_cache.len(),
            negative_entries: self.negative_cache.len(),
            hit_rate: if self.hits + self.misses > 0 {
                self.hits as f64 / (self.hits + self.misses) as f64
            } else {
                0.0
            },
        }
    }

    /// Clear all cache entries
    pub fn clear(&mut self) {
        self.positive_cache.clear();
        self.negative_cache.clear();
        self.hits = 0;
        self.misses = 0;
    }

    /// Get the total number of cache entries
    pub fn entry_count(&self) -> usize {
        self.positive_cache.len() + self.negative_cache.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.positive_cache.is_empty() && self.negative_cache.is_empty()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of positive cache entries
    pub positive_entries: usize,
    /// Number of negative cache entries
    pub negative_entries: usize,
    /// Cache hit rate (0.0 to 1.0)
    pub hit_rate: f64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache Stats: {} hits, {} misses, {:.1}% hit rate, {} positive, {} negative entries",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.positive_entries,
            self.negative_entries
        )
    }
}
