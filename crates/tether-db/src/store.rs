//! # Durable Store
//!
//! Keyed JSON records grouped into named collections, with secondary
//! indexes that can hold several values per record (multi-entry).
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  records                                                                │
//! │  ┌──────┬────────────────────┬──────────┬─────────────────────┐        │
//! │  │ seq  │ collection         │ key      │ value (JSON)        │        │
//! │  ├──────┼────────────────────┼──────────┼─────────────────────┤        │
//! │  │ 1    │ pending_operations │ 3f2a…    │ {"target":…}        │        │
//! │  │ 2    │ cached_entries     │ deals    │ {"data":…}          │        │
//! │  └──────┴────────────────────┴──────────┴─────────────────────┘        │
//! │                                                                         │
//! │  record_indexes                                                         │
//! │  ┌────────────────────┬──────────┬────────────┬─────────────┐          │
//! │  │ collection         │ key      │ index_name │ index_value │          │
//! │  ├────────────────────┼──────────┼────────────┼─────────────┤          │
//! │  │ cached_entries     │ deals    │ tag        │ deals       │          │
//! │  │ cached_entries     │ deals    │ tag        │ user:7      │ ← multi  │
//! │  │ cached_entries     │ deals    │ expires_at │ 00017…      │          │
//! │  └────────────────────┴──────────┴────────────┴─────────────┘          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Scans return records in insertion order (`seq`). Overwriting a key keeps
//! its original `seq`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::DbResult;

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    /// JSON text.
    pub value: String,
    /// Insertion sequence, stable across overwrites.
    pub sequence: i64,
}

impl StoredRecord {
    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        Ok(StoredRecord {
            sequence: row.try_get("seq")?,
            key: row.try_get("key")?,
            value: row.try_get("value")?,
        })
    }
}

/// Which records a scan, count or bulk delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexPredicate {
    /// Every record in the collection.
    All,
    /// Records having `value` under `index`.
    Equals { index: String, value: String },
    /// Records having at least one of `values` under `index`.
    AnyOf { index: String, values: Vec<String> },
    /// Records with some value `<= value` under `index` (string order).
    LessOrEqual { index: String, value: String },
}

impl IndexPredicate {
    pub fn equals(index: impl Into<String>, value: impl Into<String>) -> Self {
        IndexPredicate::Equals {
            index: index.into(),
            value: value.into(),
        }
    }

    pub fn any_of<I, S>(index: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexPredicate::AnyOf {
            index: index.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn less_or_equal(index: impl Into<String>, value: impl Into<String>) -> Self {
        IndexPredicate::LessOrEqual {
            index: index.into(),
            value: value.into(),
        }
    }

    /// True when the predicate can't match anything.
    fn is_empty(&self) -> bool {
        matches!(self, IndexPredicate::AnyOf { values, .. } if values.is_empty())
    }
}

/// Encodes a timestamp as an index value whose string order matches time order.
pub fn index_timestamp(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_millis().max(0))
}

/// Appends the predicate as an `AND EXISTS (...)` clause against alias `r`.
fn push_predicate(qb: &mut QueryBuilder<'_, Sqlite>, predicate: &IndexPredicate) {
    let (index, op) = match predicate {
        IndexPredicate::All => return,
        IndexPredicate::Equals { index, .. } => (index, "="),
        IndexPredicate::AnyOf { index, .. } => (index, "IN"),
        IndexPredicate::LessOrEqual { index, .. } => (index, "<="),
    };

    qb.push(
        " AND EXISTS (SELECT 1 FROM record_indexes i \
         WHERE i.collection = r.collection AND i.key = r.key AND i.index_name = ",
    );
    qb.push_bind(index.clone());
    qb.push(" AND i.index_value ");
    qb.push(op);

    match predicate {
        IndexPredicate::Equals { value, .. } | IndexPredicate::LessOrEqual { value, .. } => {
            qb.push(" ");
            qb.push_bind(value.clone());
        }
        IndexPredicate::AnyOf { values, .. } => {
            qb.push(" (");
            let mut list = qb.separated(", ");
            for value in values {
                list.push_bind(value.clone());
            }
            list.push_unseparated(")");
        }
        IndexPredicate::All => {}
    }

    qb.push(")");
}

/// Replaces every index entry of one record inside `tx`.
async fn replace_indexes(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    key: &str,
    indexes: &[(&str, String)],
) -> DbResult<()> {
    sqlx::query("DELETE FROM record_indexes WHERE collection = ?1 AND key = ?2")
        .bind(collection)
        .bind(key)
        .execute(&mut **tx)
        .await?;

    for (name, index_value) in indexes {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO record_indexes (collection, key, index_name, index_value)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(*name)
        .bind(index_value)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Generic durable key/value store over SQLite.
#[derive(Debug, Clone)]
pub struct DurableStore {
    pool: SqlitePool,
}

impl DurableStore {
    pub fn new(pool: SqlitePool) -> Self {
        DurableStore { pool }
    }

    /// Inserts or overwrites a record and replaces its index entries.
    ///
    /// Runs in one transaction. Returns the record's sequence.
    pub async fn put(
        &self,
        collection: &str,
        key: &str,
        value: &str,
        indexes: &[(&str, String)],
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO records (collection, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (collection, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            RETURNING seq
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        replace_indexes(&mut tx, collection, key, indexes).await?;
        tx.commit().await?;

        debug!(collection, key, sequence, "Record stored");
        Ok(sequence)
    }

    /// Like [`put`](Self::put), but sets the JSON field at `version_path`
    /// to one more than the stored record's (1 for a new key).
    ///
    /// The bump happens in the same statement as the write, so concurrent
    /// writers never observe or produce the same version. Returns the
    /// record's sequence and its new version.
    pub async fn put_versioned(
        &self,
        collection: &str,
        key: &str,
        value: &str,
        version_path: &str,
        indexes: &[(&str, String)],
    ) -> DbResult<(i64, i64)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO records (collection, key, value, updated_at)
            VALUES (?1, ?2, json_set(?3, ?5, 1), ?4)
            ON CONFLICT (collection, key)
            DO UPDATE SET
                value = json_set(
                    excluded.value,
                    ?5,
                    COALESCE(json_extract(records.value, ?5), 0) + 1
                ),
                updated_at = excluded.updated_at
            RETURNING seq, json_extract(value, ?5) AS version
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .bind(version_path)
        .fetch_one(&mut *tx)
        .await?;

        let sequence: i64 = row.try_get("seq")?;
        let version: i64 = row.try_get("version")?;

        replace_indexes(&mut tx, collection, key, indexes).await?;
        tx.commit().await?;

        debug!(collection, key, sequence, version, "Versioned record stored");
        Ok((sequence, version))
    }

    /// Overwrites a record only if it still exists. Returns whether it did.
    ///
    /// The existence check and the write share one statement, so a record
    /// deleted concurrently is never brought back.
    pub async fn update_existing(
        &self,
        collection: &str,
        key: &str,
        value: &str,
        indexes: &[(&str, String)],
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE records SET value = ?3, updated_at = ?4 WHERE collection = ?1 AND key = ?2",
        )
        .bind(collection)
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        replace_indexes(&mut tx, collection, key, indexes).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Reads one record.
    pub async fn get(&self, collection: &str, key: &str) -> DbResult<Option<StoredRecord>> {
        let row = sqlx::query("SELECT seq, key, value FROM records WHERE collection = ?1 AND key = ?2")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(StoredRecord::from_row).transpose()
    }

    /// Deletes one record and its index entries. Returns whether it existed.
    pub async fn delete(&self, collection: &str, key: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM record_indexes WHERE collection = ?1 AND key = ?2")
            .bind(collection)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND key = ?2")
            .bind(collection)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes a record only while the JSON field at `version_path` still
    /// equals `version`. Returns whether it was deleted.
    pub async fn delete_if_version(
        &self,
        collection: &str,
        key: &str,
        version_path: &str,
        version: i64,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM records
            WHERE collection = ?1 AND key = ?2 AND json_extract(value, ?3) = ?4
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(version_path)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM record_indexes WHERE collection = ?1 AND key = ?2")
            .bind(collection)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Returns matching records in insertion order.
    pub async fn scan(
        &self,
        collection: &str,
        predicate: &IndexPredicate,
    ) -> DbResult<Vec<StoredRecord>> {
        if predicate.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT r.seq, r.key, r.value FROM records r WHERE r.collection = ",
        );
        qb.push_bind(collection.to_string());
        push_predicate(&mut qb, predicate);
        qb.push(" ORDER BY r.seq");

        let rows = qb.build().fetch_all(&self.pool).await?;

        rows.iter().map(StoredRecord::from_row).collect()
    }

    /// Counts matching records.
    pub async fn count(&self, collection: &str, predicate: &IndexPredicate) -> DbResult<u64> {
        if predicate.is_empty() {
            return Ok(0);
        }

        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM records r WHERE r.collection = ");
        qb.push_bind(collection.to_string());
        push_predicate(&mut qb, predicate);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Deletes every matching record in one transaction.
    ///
    /// Returns the deleted keys in insertion order.
    pub async fn delete_matching(
        &self,
        collection: &str,
        predicate: &IndexPredicate,
    ) -> DbResult<Vec<String>> {
        if predicate.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT r.key FROM records r WHERE r.collection = ");
        qb.push_bind(collection.to_string());
        push_predicate(&mut qb, predicate);
        qb.push(" ORDER BY r.seq");

        let keys: Vec<String> = qb.build_query_scalar().fetch_all(&mut *tx).await?;

        for key in &keys {
            sqlx::query("DELETE FROM record_indexes WHERE collection = ?1 AND key = ?2")
                .bind(collection)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM records WHERE collection = ?1 AND key = ?2")
                .bind(collection)
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(collection, deleted = keys.len(), "Records deleted");
        Ok(keys)
    }

    /// Removes every record in a collection. Returns how many were removed.
    pub async fn clear(&self, collection: &str) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM record_indexes WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::TimeZone;

    async fn store() -> DurableStore {
        Database::new(DbConfig::in_memory()).await.unwrap().store()
    }

    fn keys(records: &[StoredRecord]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = store().await;

        store.put("c", "a", "1", &[]).await.unwrap();
        assert_eq!(store.get("c", "a").await.unwrap().unwrap().value, "1");
        assert!(store.get("other", "a").await.unwrap().is_none());

        assert!(store.delete("c", "a").await.unwrap());
        assert!(!store.delete("c", "a").await.unwrap());
        assert!(store.get("c", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_sequence_and_replaces_indexes() {
        let store = store().await;

        let first = store
            .put("c", "a", "1", &[("tag", "x".to_string())])
            .await
            .unwrap();
        store.put("c", "b", "2", &[]).await.unwrap();
        let again = store
            .put("c", "a", "3", &[("tag", "y".to_string())])
            .await
            .unwrap();

        assert_eq!(first, again);

        let all = store.scan("c", &IndexPredicate::All).await.unwrap();
        assert_eq!(keys(&all), vec!["a", "b"]);
        assert_eq!(all[0].value, "3");

        let old_tag = store
            .scan("c", &IndexPredicate::equals("tag", "x"))
            .await
            .unwrap();
        assert!(old_tag.is_empty());
    }

    #[tokio::test]
    async fn test_put_versioned_bumps_per_key() {
        let store = store().await;

        let (_, v1) = store
            .put_versioned("c", "k", r#"{"version":99,"n":1}"#, "$.version", &[])
            .await
            .unwrap();
        let (_, v2) = store
            .put_versioned("c", "k", r#"{"version":1,"n":2}"#, "$.version", &[])
            .await
            .unwrap();
        let (_, other) = store
            .put_versioned("c", "j", r#"{"n":3}"#, "$.version", &[])
            .await
            .unwrap();

        assert_eq!((v1, v2, other), (1, 2, 1));

        let stored: serde_json::Value =
            serde_json::from_str(&store.get("c", "k").await.unwrap().unwrap().value).unwrap();
        assert_eq!(stored["version"], 2);
        assert_eq!(stored["n"], 2);
    }

    #[tokio::test]
    async fn test_concurrent_versioned_writes_never_share_a_version() {
        let store = store().await;

        let writes = (0..10).map(|n| {
            let store = store.clone();
            async move {
                let value = format!(r#"{{"n":{}}}"#, n);
                store
                    .put_versioned("c", "k", &value, "$.version", &[])
                    .await
                    .unwrap()
                    .1
            }
        });
        let mut versions: Vec<i64> = futures_util::future::join_all(writes).await;
        versions.sort_unstable();

        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_update_existing_never_recreates() {
        let store = store().await;

        store
            .put("c", "a", "1", &[("tag", "x".to_string())])
            .await
            .unwrap();
        assert!(store
            .update_existing("c", "a", "2", &[("tag", "y".to_string())])
            .await
            .unwrap());
        assert_eq!(store.get("c", "a").await.unwrap().unwrap().value, "2");
        assert_eq!(
            store.count("c", &IndexPredicate::equals("tag", "y")).await.unwrap(),
            1
        );

        store.delete("c", "a").await.unwrap();
        assert!(!store
            .update_existing("c", "a", "3", &[("tag", "z".to_string())])
            .await
            .unwrap());
        assert!(store.get("c", "a").await.unwrap().is_none());
        assert_eq!(
            store.count("c", &IndexPredicate::equals("tag", "z")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_delete_if_version_spares_newer_record() {
        let store = store().await;

        store
            .put_versioned("c", "k", "{}", "$.version", &[("tag", "t".to_string())])
            .await
            .unwrap();
        store
            .put_versioned("c", "k", "{}", "$.version", &[("tag", "t".to_string())])
            .await
            .unwrap();

        assert!(!store.delete_if_version("c", "k", "$.version", 1).await.unwrap());
        assert!(store.get("c", "k").await.unwrap().is_some());

        assert!(store.delete_if_version("c", "k", "$.version", 2).await.unwrap());
        assert!(store.get("c", "k").await.unwrap().is_none());
        assert_eq!(
            store.count("c", &IndexPredicate::equals("tag", "t")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_multi_entry_index() {
        let store = store().await;

        store
            .put(
                "c",
                "list",
                "{}",
                &[("tag", "deals".to_string()), ("tag", "user:7".to_string())],
            )
            .await
            .unwrap();
        store
            .put("c", "other", "{}", &[("tag", "notes".to_string())])
            .await
            .unwrap();

        let by_user = store
            .scan("c", &IndexPredicate::equals("tag", "user:7"))
            .await
            .unwrap();
        assert_eq!(keys(&by_user), vec!["list"]);

        let any = store
            .scan("c", &IndexPredicate::any_of("tag", ["deals", "notes", "nope"]))
            .await
            .unwrap();
        assert_eq!(keys(&any), vec!["list", "other"]);

        let none = store
            .scan("c", &IndexPredicate::any_of("tag", Vec::<String>::new()))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_less_or_equal_on_timestamps() {
        let store = store().await;
        let t = |s: i64| Utc.timestamp_opt(s, 0).unwrap();

        store
            .put("c", "old", "{}", &[("expires_at", index_timestamp(t(100)))])
            .await
            .unwrap();
        store
            .put("c", "new", "{}", &[("expires_at", index_timestamp(t(10_000)))])
            .await
            .unwrap();
        store.put("c", "forever", "{}", &[]).await.unwrap();

        let expired = store
            .delete_matching("c", &IndexPredicate::less_or_equal("expires_at", index_timestamp(t(100))))
            .await
            .unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert_eq!(store.count("c", &IndexPredicate::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_collection() {
        let store = store().await;

        store.put("a", "1", "{}", &[("i", "v".to_string())]).await.unwrap();
        store.put("b", "1", "{}", &[("i", "v".to_string())]).await.unwrap();

        assert_eq!(store.clear("a").await.unwrap(), 1);
        assert_eq!(store.count("a", &IndexPredicate::All).await.unwrap(), 0);
        assert_eq!(
            store.count("b", &IndexPredicate::equals("i", "v")).await.unwrap(),
            1
        );
    }

    #[test]
    fn test_index_timestamp_sorts_like_time() {
        let a = index_timestamp(Utc.timestamp_opt(9, 0).unwrap());
        let b = index_timestamp(Utc.timestamp_opt(10, 0).unwrap());
        assert!(a < b);
        assert_eq!(a.len(), 20);
    }
}
