//! # Response Cache
//!
//! Local cache of read results with per-entry TTL and tag invalidation.
//!
//! ```text
//! read(key)
//!   ├─ absent ───────────────────► miss
//!   ├─ now >= expires_at ─► purge ► miss
//!   └─ fresh ────────────────────► data (no side effects)
//!
//! read_through(key, fetch, opts)
//!   ├─ hit ──► data
//!   └─ miss ─► fetch() ─ ok ──► write(key, data, opts) ► data
//!                       └ err ─► error (nothing written)
//! ```

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info};

use crate::error::SyncResult;
use tether_core::{CacheEntry, CacheOptions};
use tether_db::{CacheEntryRepository, Database};

/// Entry counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    /// Entries past `expires_at` still waiting for a sweep.
    pub expired: u64,
}

/// TTL + tag cache over the durable store.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    repo: CacheEntryRepository,
}

impl ResponseCache {
    pub fn new(db: &Database) -> Self {
        ResponseCache {
            repo: db.cache_entries(),
        }
    }

    /// Stores `data` under `key`, replacing any previous entry.
    ///
    /// Returns the new entry's version.
    pub async fn write(&self, key: &str, data: Value, options: CacheOptions) -> SyncResult<u64> {
        let entry = CacheEntry::new(key, data, options, Utc::now(), None)?;
        let version = self.repo.put(&entry).await?;

        debug!(key, version, expires_at = ?entry.expires_at, "Cache write");
        Ok(version)
    }

    /// Fresh data for `key`, purging it if it has expired.
    pub async fn read(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.read_entry(key).await?.map(|e| e.data))
    }

    /// Like [`read`](Self::read) but returns the whole entry.
    pub async fn read_entry(&self, key: &str) -> SyncResult<Option<CacheEntry>> {
        let Some(entry) = self.repo.get(key).await? else {
            return Ok(None);
        };

        if entry.is_expired(Utc::now()) {
            // A concurrent write may have replaced it since the read.
            self.repo.delete_version(key, entry.version).await?;
            debug!(key, version = entry.version, "Cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Returns cached data, or fetches, stores and returns it.
    pub async fn read_through<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: CacheOptions,
    ) -> SyncResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        if let Some(data) = self.read(key).await? {
            debug!(key, "Cache hit");
            return Ok(data);
        }

        debug!(key, "Cache miss; fetching");
        let data = fetch().await?;
        self.write(key, data.clone(), options).await?;
        Ok(data)
    }

    /// Purges every entry tagged with any of `tags`. Returns the purged keys.
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> SyncResult<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self.repo.delete_by_tags(&tags).await?;
        info!(?tags, removed = removed.len(), "Cache invalidated by tag");
        Ok(removed)
    }

    pub async fn invalidate(&self, key: &str) -> SyncResult<bool> {
        Ok(self.repo.delete(key).await?)
    }

    /// Purges all expired entries. Returns how many were removed.
    pub async fn sweep_expired(&self) -> SyncResult<usize> {
        let removed = self.repo.delete_expired(Utc::now()).await?;
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Expired cache entries swept");
        }
        Ok(removed.len())
    }

    pub async fn clear(&self) -> SyncResult<u64> {
        let removed = self.repo.clear().await?;
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    pub async fn stats(&self) -> SyncResult<CacheStats> {
        Ok(CacheStats {
            entries: self.repo.count().await?,
            expired: self.repo.count_expired(Utc::now()).await?,
        })
    }
}
