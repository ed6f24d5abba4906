//! Expiring cache of issued leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::CaResult;
use super::leaf::{LeafCredential, LeafHost, LeafIssuer};

/// Cache for leaf credentials.
///
/// Keyed by normalized host. An entry is reissued once it comes within
/// `refresh_margin` of its `not_after`. Concurrent misses for the same
/// host may each issue; the last insert wins.
pub struct LeafCache {
    issuer: LeafIssuer,
    cache: RwLock<HashMap<LeafHost, Arc<LeafCredential>>>,
    capacity: usize,
    refresh_margin: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl LeafCache {
    /// Creates a cache holding at most `capacity` leaves. A capacity of
    /// zero issues on every lookup.
    pub fn new(issuer: LeafIssuer, capacity: usize, refresh_margin: Duration) -> Self {
        Self {
            issuer,
            cache: RwLock::new(HashMap::new()),
            capacity,
            refresh_margin,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Gets or issues the leaf for a server name or `host:port`.
    pub fn get_or_issue(&self, host: &str) -> CaResult<Arc<LeafCredential>> {
        let host = LeafHost::parse(host)?;
        let now = OffsetDateTime::now_utc();

        if let Ok(cache) = self.cache.read()
            && let Some(leaf) = cache.get(&host)
            && leaf.is_fresh(now, self.refresh_margin)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(self.issuer.issue_for(&host, now)?);
        self.misses.fetch_add(1, Ordering::Relaxed);

        if self.capacity > 0
            && let Ok(mut cache) = self.cache.write()
        {
            if cache.len() >= self.capacity && !cache.contains_key(&host) {
                self.evict(&mut cache, now);
            }
            cache.insert(host, Arc::clone(&leaf));
        }

        Ok(leaf)
    }

    /// Drops stale entries, then the one closest to expiry if still full.
    fn evict(&self, cache: &mut HashMap<LeafHost, Arc<LeafCredential>>, now: OffsetDateTime) {
        let before = cache.len();
        cache.retain(|_, leaf| leaf.is_fresh(now, self.refresh_margin));

        if cache.len() >= self.capacity
            && let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, leaf)| leaf.not_after())
                .map(|(host, _)| host.clone())
        {
            cache.remove(&oldest);
        }
        debug!("evicted {} cached leaves", before - cache.len());
    }

    pub fn issuer(&self) -> &LeafIssuer {
        &self.issuer
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.read().map(|c| c.len()).unwrap_or_default(),
        }
    }
}
