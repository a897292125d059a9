use crate::store::{StoreError, StoreHandle};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Upper bound on cached verdicts; beyond it, expired entries are swept.
const MAX_CACHE_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    banned: bool,
    cached_at: Instant,
}

/// Ban lookups backed by the store, cached for a short TTL.
///
/// Decisions are deny-by-ban, allow-by-default: a cache miss only
/// reports "not banned" once the store said so. `invalidate` drops the
/// whole cache and is called whenever a ban is written, so new bans take
/// effect without waiting out the TTL.
pub struct BanList {
    store: StoreHandle,
    ttl: Duration,
    cache: DashMap<(Option<String>, IpAddr), CacheEntry>,
}

impl BanList {
    /// Creates a ban list over the given store with the given cache TTL.
    #[must_use]
    pub fn new(store: StoreHandle, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: DashMap::new(),
        }
    }

    fn cached(&self, key: &(Option<String>, IpAddr)) -> Option<bool> {
        let entry = self.cache.get(key)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.banned)
        } else {
            None
        }
    }

    fn remember(&self, key: (Option<String>, IpAddr), banned: bool) {
        if self.cache.len() >= MAX_CACHE_ENTRIES {
            let ttl = self.ttl;
            self.cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        }
        self.cache.insert(
            key,
            CacheEntry {
                banned,
                cached_at: Instant::now(),
            },
        );
    }

    /// Is this (user, address) pair banned?
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store lookup fails on a cache miss.
    pub async fn is_user_banned(&self, user: &str, addr: IpAddr) -> Result<bool, StoreError> {
        let key = (Some(user.to_owned()), addr);
        if let Some(banned) = self.cached(&key) {
            return Ok(banned);
        }
        let banned = self
            .store
            .is_user_and_address_banned(user, &addr.to_string())
            .await?;
        self.remember(key, banned);
        Ok(banned)
    }

    /// Is this address banned outright (API ban)?
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store lookup fails on a cache miss.
    pub async fn is_address_banned(&self, addr: IpAddr) -> Result<bool, StoreError> {
        let key = (None, addr);
        if let Some(banned) = self.cached(&key) {
            return Ok(banned);
        }
        let banned = self.store.is_address_banned(&addr.to_string()).await?;
        self.remember(key, banned);
        Ok(banned)
    }

    /// Drops every cached verdict. Called on ban updates.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}
