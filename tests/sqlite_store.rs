//! SQLite record store against a real database file in a temp directory.

use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use parcel_harvest::config::Config;
use parcel_harvest::models::{CollectionRecord, FieldValue, KeyKind, SourceResult};
use parcel_harvest::normalize::normalize;
use parcel_harvest::persistence::{RecordStore, SqliteRecordStore};
use parcel_harvest::{Collector, CollectorSettings, Completeness, Priority};

fn config_in(tmp: &TempDir) -> Config {
    let mut config = Config::minimal();
    config.db.path = tmp.path().join("nested").join("parcels.sqlite");
    config
}

fn record(raw: &str, owner: &str) -> CollectionRecord {
    let key = normalize(raw, None).unwrap();
    let now = Utc::now();
    let mut record = CollectionRecord::new(key, now);
    let mut fields = BTreeMap::new();
    fields.insert("owner".to_string(), FieldValue::new(owner));
    fields.insert("assessed_value".to_string(), FieldValue::new(315000));
    record.merge(SourceResult::success("primary_api", fields, true, 120), now);
    record.merge(
        SourceResult::failure("web_fallback", "source unavailable: status 503", 40),
        now,
    );
    record
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(&config_in(&tmp)).await.unwrap();
    let saved = record("501 38 237", "CITY OF GLENDALE");

    store.save(&saved).await.unwrap();
    let loaded = store
        .load_last_known(&normalize("50138237", None).unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loaded.key, saved.key);
    assert_eq!(loaded.key.raw_value(), "501 38 237");
    assert_eq!(loaded.completeness, Completeness::Detailed);
    assert_eq!(loaded.fields, saved.fields);
    assert_eq!(loaded.sources_attempted.len(), 2);
    assert_eq!(
        loaded.sources_attempted[1].error_detail.as_deref(),
        Some("source unavailable: status 503")
    );
    assert_eq!(
        loaded.last_updated.timestamp_millis(),
        saved.last_updated.timestamp_millis()
    );
}

#[tokio::test]
async fn save_replaces_the_previous_row() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(&config_in(&tmp)).await.unwrap();

    store.save(&record("50138237", "OLD OWNER")).await.unwrap();
    let mut newer = record("50138237", "NEW OWNER");
    newer.last_updated = newer.last_updated + Duration::seconds(5);
    store.save(&newer).await.unwrap();

    assert_eq!(store.count().await.unwrap(), 1);
    let loaded = store
        .load_last_known(&newer.key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.field("owner"), Some(&json!("NEW OWNER")));
}

#[tokio::test]
async fn keys_of_different_kinds_do_not_collide() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(&config_in(&tmp)).await.unwrap();

    let owner = normalize("Glendale Civic", Some(KeyKind::OwnerName)).unwrap();
    let address = normalize("Glendale Civic", Some(KeyKind::Address)).unwrap();
    store
        .save(&CollectionRecord::new(owner.clone(), Utc::now()))
        .await
        .unwrap();

    assert!(store.load_last_known(&owner).await.unwrap().is_some());
    assert!(store.load_last_known(&address).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_removes_the_row() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteRecordStore::open(&config_in(&tmp)).await.unwrap();
    let saved = record("50138237", "CITY OF GLENDALE");
    store.save(&saved).await.unwrap();

    assert!(store.delete(&saved.key).await.unwrap());
    assert!(!store.delete(&saved.key).await.unwrap());
    assert!(store.load_last_known(&saved.key).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn reopening_keeps_records() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let saved = record("50138237", "CITY OF GLENDALE");
    {
        let store = SqliteRecordStore::open(&config).await.unwrap();
        store.save(&saved).await.unwrap();
        store.pool().close().await;
    }

    let store = SqliteRecordStore::open(&config).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn collector_writes_through_to_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(SqliteRecordStore::open(&config_in(&tmp)).await.unwrap());
    let collector = Collector::builder(CollectorSettings {
        workers: 1,
        ..CollectorSettings::default()
    })
    .store(store.clone())
    .build();

    let record = collector
        .collect("5850 W Glendale Ave", None, Priority::Normal)
        .await
        .unwrap();
    collector.shutdown().await;

    let stored = store.load_last_known(&record.key).await.unwrap().unwrap();
    assert!(stored.is_placeholder());
    assert_eq!(stored.completeness, Completeness::Basic);
}
