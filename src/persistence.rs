//! Durable storage for completed records.
//!
//! The worker calls [`RecordStore::save`] after every completed job and
//! [`RecordStore::load_last_known`] when a key has no cache entry at all.
//! Save failures are logged by the caller and never fail a job.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::Config;
use crate::error::StorageError;
use crate::models::{CollectionRecord, KeyKind, ParcelKey};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &CollectionRecord) -> Result<(), StorageError>;

    async fn load_last_known(&self, key: &ParcelKey)
        -> Result<Option<CollectionRecord>, StorageError>;

    /// Removes the stored record. Returns false if there was none.
    async fn delete(&self, key: &ParcelKey) -> Result<bool, StorageError>;
}

/// SQLite-backed store, one row per `(kind, normalized_value)`.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects and makes sure the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parcel_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn save(&self, record: &CollectionRecord) -> Result<(), StorageError> {
        let fields_json = serde_json::to_string(&record.fields)?;
        let sources_json = serde_json::to_string(&record.sources_attempted)?;

        sqlx::query(
            r#"
            INSERT INTO parcel_records (kind, normalized_value, raw_value, completeness, fields_json, sources_json, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, normalized_value) DO UPDATE SET
                raw_value = excluded.raw_value,
                completeness = excluded.completeness,
                fields_json = excluded.fields_json,
                sources_json = excluded.sources_json,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(record.key.kind().as_str())
        .bind(record.key.normalized_value())
        .bind(record.key.raw_value())
        .bind(record.completeness.as_str())
        .bind(&fields_json)
        .bind(&sources_json)
        .bind(record.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_last_known(
        &self,
        key: &ParcelKey,
    ) -> Result<Option<CollectionRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT raw_value, completeness, fields_json, sources_json, last_updated \
             FROM parcel_records WHERE kind = ? AND normalized_value = ?",
        )
        .bind(key.kind().as_str())
        .bind(key.normalized_value())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_value: String = row.get("raw_value");
        let completeness: String = row.get("completeness");
        let fields_json: String = row.get("fields_json");
        let sources_json: String = row.get("sources_json");
        let last_updated: i64 = row.get("last_updated");

        let completeness = completeness
            .parse()
            .map_err(|e: String| StorageError(anyhow::anyhow!(e)))?;
        let last_updated = Utc
            .timestamp_millis_opt(last_updated)
            .single()
            .ok_or_else(|| StorageError(anyhow::anyhow!("bad timestamp {}", last_updated)))?;

        Ok(Some(CollectionRecord {
            key: ParcelKey::from_parts(key.kind(), key.normalized_value(), raw_value),
            fields: serde_json::from_str(&fields_json)?,
            completeness,
            sources_attempted: serde_json::from_str(&sources_json)?,
            last_updated,
        }))
    }

    async fn delete(&self, key: &ParcelKey) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM parcel_records WHERE kind = ? AND normalized_value = ?")
                .bind(key.kind().as_str())
                .bind(key.normalized_value())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-process store for tests and storage-less runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<(KeyKind, String), CollectionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a record directly, bypassing the worker.
    pub fn insert(&self, record: CollectionRecord) {
        let key = (record.key.kind(), record.key.normalized_value().to_string());
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &CollectionRecord) -> Result<(), StorageError> {
        self.insert(record.clone());
        Ok(())
    }

    async fn load_last_known(
        &self,
        key: &ParcelKey,
    ) -> Result<Option<CollectionRecord>, StorageError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&(key.kind(), key.normalized_value().to_string()))
            .cloned())
    }

    async fn delete(&self, key: &ParcelKey) -> Result<bool, StorageError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .remove(&(key.kind(), key.normalized_value().to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryRecordStore::new();
        let key = normalize("50138237", None).unwrap();
        assert!(store.load_last_known(&key).await.unwrap().is_none());

        let record = CollectionRecord::new(key.clone(), Utc::now());
        store.save(&record).await.unwrap();
        let other_spelling = normalize("501-38-237", None).unwrap();
        assert!(store.load_last_known(&other_spelling).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.is_empty());
    }
}
