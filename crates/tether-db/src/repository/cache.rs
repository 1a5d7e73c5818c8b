//! # Cache Entry Repository
//!
//! Persists cached reads in the `cached_entries` collection.
//!
//! ## Indexes
//! - `expires_at` → sortable timestamp (absent for entries without a TTL)
//! - `tag`        → one index entry per tag (multi-entry)

use chrono::{DateTime, Utc};

use crate::error::DbResult;
use crate::store::{index_timestamp, DurableStore, IndexPredicate, StoredRecord};
use tether_core::{CacheEntry, CACHED_ENTRIES};

const EXPIRES_AT_INDEX: &str = "expires_at";
const TAG_INDEX: &str = "tag";
const VERSION_PATH: &str = "$.version";

/// Repository for cached reads.
#[derive(Debug, Clone)]
pub struct CacheEntryRepository {
    store: DurableStore,
}

impl CacheEntryRepository {
    pub fn new(store: DurableStore) -> Self {
        CacheEntryRepository { store }
    }

    fn decode(record: StoredRecord) -> DbResult<CacheEntry> {
        Ok(serde_json::from_str(&record.value)?)
    }

    fn expired_at(now: DateTime<Utc>) -> IndexPredicate {
        IndexPredicate::less_or_equal(EXPIRES_AT_INDEX, index_timestamp(now))
    }

    /// Stores an entry, replacing any previous entry and its tags.
    ///
    /// The store assigns the version: one more than the replaced entry's,
    /// whatever `entry.version` says. Returns the assigned version.
    pub async fn put(&self, entry: &CacheEntry) -> DbResult<u64> {
        let mut indexes: Vec<(&str, String)> = entry
            .tags
            .iter()
            .map(|tag| (TAG_INDEX, tag.clone()))
            .collect();
        if let Some(expires_at) = entry.expires_at {
            indexes.push((EXPIRES_AT_INDEX, index_timestamp(expires_at)));
        }

        let value = serde_json::to_string(entry)?;
        let (_, version) = self
            .store
            .put_versioned(CACHED_ENTRIES, &entry.key, &value, VERSION_PATH, &indexes)
            .await?;
        Ok(version as u64)
    }

    /// Reads an entry as stored, expired or not.
    pub async fn get(&self, key: &str) -> DbResult<Option<CacheEntry>> {
        self.store
            .get(CACHED_ENTRIES, key)
            .await?
            .map(Self::decode)
            .transpose()
    }

    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        self.store.delete(CACHED_ENTRIES, key).await
    }

    /// Deletes `key` only if it still holds `version`.
    pub async fn delete_version(&self, key: &str, version: u64) -> DbResult<bool> {
        self.store
            .delete_if_version(CACHED_ENTRIES, key, VERSION_PATH, version as i64)
            .await
    }

    /// Deletes every entry carrying at least one of `tags`.
    ///
    /// Returns the removed keys.
    pub async fn delete_by_tags(&self, tags: &[String]) -> DbResult<Vec<String>> {
        self.store
            .delete_matching(CACHED_ENTRIES, &IndexPredicate::any_of(TAG_INDEX, tags.iter().cloned()))
            .await
    }

    /// Deletes every entry whose `expires_at` is at or before `now`.
    ///
    /// Returns the removed keys.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<String>> {
        self.store
            .delete_matching(CACHED_ENTRIES, &Self::expired_at(now))
            .await
    }

    pub async fn count(&self) -> DbResult<u64> {
        self.store.count(CACHED_ENTRIES, &IndexPredicate::All).await
    }

    pub async fn count_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        self.store.count(CACHED_ENTRIES, &Self::expired_at(now)).await
    }

    pub async fn clear(&self) -> DbResult<u64> {
        self.store.clear(CACHED_ENTRIES).await
    }
}
