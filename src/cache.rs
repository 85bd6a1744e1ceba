//! Time-bounded result cache.
//!
//! Stores the most recent [`CollectionRecord`] per [`ParcelKey`]. An entry is
//! *fresh* when it is younger than the freshness window **and** complete
//! with values its own collection verified; fresh entries short-circuit a
//! submission. Stale or partial entries are
//! kept until the retention window passes and are used to seed new jobs.
//!
//! Time comes from a [`Clock`] so tests can move it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::models::{CollectionRecord, Completeness, ParcelKey};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Arc<CollectionRecord>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
}

pub struct ResultCache {
    entries: RwLock<HashMap<ParcelKey, CacheEntry>>,
    freshness: Duration,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(freshness: Duration, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            freshness,
            retention,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.record.verified_completeness() == Completeness::Complete
            && now - entry.stored_at < self.freshness
    }

    /// Any entry for `key`, fresh or not, within retention.
    pub fn get(&self, key: &ParcelKey) -> Option<CacheEntry> {
        let now = self.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|e| now - e.stored_at < self.retention)
            .cloned()
    }

    pub fn get_if_fresh(&self, key: &ParcelKey) -> Option<Arc<CollectionRecord>> {
        let now = self.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|e| self.is_fresh(e, now))
            .map(|e| e.record.clone())
    }

    /// Stores `record`, replacing any previous entry for its key.
    pub fn put(&self, record: Arc<CollectionRecord>) -> CacheEntry {
        let entry = CacheEntry {
            stored_at: self.now(),
            record,
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.record.key.clone(), entry.clone());
        entry
    }

    /// Inserts a record loaded from storage, keeping its original timestamp.
    /// An existing in-memory entry wins.
    pub fn seed(&self, record: CollectionRecord) -> bool {
        let entry = CacheEntry {
            stored_at: record.last_updated,
            record: Arc::new(record),
        };
        if self.now() - entry.stored_at >= self.retention {
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&entry.record.key) {
            return false;
        }
        entries.insert(entry.record.key.clone(), entry);
        true
    }

    pub fn invalidate(&self, key: &ParcelKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).is_some()
    }

    /// Drops entries past retention. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| now - e.stored_at < self.retention);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let fresh = entries.values().filter(|e| self.is_fresh(e, now)).count();
        CacheStats {
            entries: entries.len(),
            fresh,
            stale: entries.len() - fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fields, FieldValue, SourceResult};
    use crate::normalize::normalize;

    fn record(key: &ParcelKey, complete: bool, now: DateTime<Utc>) -> Arc<CollectionRecord> {
        let names: Vec<&str> = if complete {
            fields::tracked().collect()
        } else {
            vec![fields::OWNER]
        };
        let values = names
            .into_iter()
            .map(|n| (n.to_string(), FieldValue::new("x")))
            .collect();
        let mut record = CollectionRecord::new(key.clone(), now);
        record.merge(SourceResult::success("primary_api", values, !complete, 1), now);
        Arc::new(record)
    }

    fn setup() -> (Arc<ManualClock>, ResultCache) {
        let clock = Arc::new(ManualClock::default());
        let cache = ResultCache::new(Duration::hours(24), Duration::hours(168), clock.clone());
        (clock, cache)
    }

    #[test]
    fn complete_entry_is_fresh_within_window() {
        let (clock, cache) = setup();
        let key = normalize("50138237", None).unwrap();
        cache.put(record(&key, true, clock.now()));
        assert!(cache.get_if_fresh(&key).is_some());

        clock.advance(Duration::hours(25));
        assert!(cache.get_if_fresh(&key).is_none());
        assert!(cache.get(&key).is_some(), "stale entry still seeds");
    }

    #[test]
    fn partial_entry_is_never_fresh() {
        let (clock, cache) = setup();
        let key = normalize("50138237", None).unwrap();
        cache.put(record(&key, false, clock.now()));
        assert!(cache.get_if_fresh(&key).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                fresh: 0,
                stale: 1
            }
        );
    }

    #[test]
    fn unconfirmed_seed_values_are_not_fresh() {
        let (clock, cache) = setup();
        let key = normalize("50138237", None).unwrap();
        let old = record(&key, true, clock.now());
        let carried = CollectionRecord::seeded(key.clone(), &old, clock.now());
        assert_eq!(carried.completeness, Completeness::Complete);
        cache.put(Arc::new(carried));
        assert!(cache.get_if_fresh(&key).is_none());
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn retention_purges() {
        let (clock, cache) = setup();
        let key = normalize("50138237", None).unwrap();
        cache.put(record(&key, true, clock.now()));
        clock.advance(Duration::hours(200));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn seed_does_not_overwrite_live_entry() {
        let (clock, cache) = setup();
        let key = normalize("50138237", None).unwrap();
        cache.put(record(&key, true, clock.now()));
        let old = (*record(&key, false, clock.now() - Duration::hours(30))).clone();
        assert!(!cache.seed(old));
        assert!(cache.get_if_fresh(&key).is_some());
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
    }
}
