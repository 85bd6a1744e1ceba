//! The public entry point: [`Collector`].
//!
//! Wires the normalizer, cache, scheduler, worker pool, adapters and
//! persistence together. Everything is injected at construction time
//! through [`CollectorBuilder`]; nothing is looked up globally.
//!
//! ```rust,no_run
//! use parcel_harvest::collector::{Collector, CollectorSettings};
//! use parcel_harvest::models::Priority;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let collector = Collector::builder(CollectorSettings::default()).build();
//! let handle = collector.submit_collection("501 38 237", None, Priority::High)?;
//! let record = handle.wait(Duration::from_secs(30)).await?;
//! println!("{} -> {}", record.key, record.completeness);
//! collector.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterChain, LocalSynthesisAdapter, SourceAdapter};
use crate::cache::{CacheStats, Clock, ResultCache, SystemClock};
use crate::config::Config;
use crate::credentials::{CredentialProvider, EnvCredentials};
use crate::error::{CollectError, StorageError};
use crate::events::{CollectionEvent, EventBus};
use crate::job::{JobHandle, JobOutcome, JobSnapshot};
use crate::models::{CollectionRecord, KeyKind, ParcelKey, Priority};
use crate::normalize::normalize;
use crate::persistence::{RecordStore, SqliteRecordStore};
use crate::scheduler::Scheduler;
use crate::worker::{RetryPolicy, WorkerContext, WorkerPool};

/// Tunables for one collector instance.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub workers: usize,
    pub freshness: chrono::Duration,
    pub retention: chrono::Duration,
    pub job_deadline: Duration,
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from(&Config::minimal())
    }
}

impl From<&Config> for CollectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.collector.workers,
            freshness: config.collector.freshness(),
            retention: config.collector.retention(),
            job_deadline: config.collector.job_deadline(),
            event_capacity: config.collector.event_capacity,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

pub struct CollectorBuilder {
    settings: CollectorSettings,
    adapters: Option<AdapterChain>,
    store: Option<Arc<dyn RecordStore>>,
    clock: Arc<dyn Clock>,
}

impl CollectorBuilder {
    pub fn new(settings: CollectorSettings) -> Self {
        Self {
            settings,
            adapters: None,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the whole chain. Without this (or [`Self::adapter`]) the
    /// chain is local synthesis only.
    pub fn adapters(mut self, chain: AdapterChain) -> Self {
        self.adapters = Some(chain);
        self
    }

    /// Appends one adapter to the chain.
    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters
            .get_or_insert_with(AdapterChain::new)
            .register(adapter);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the collector and spawns its workers on the current tokio
    /// runtime.
    pub fn build(self) -> Collector {
        let settings = self.settings;
        let adapters = self.adapters.unwrap_or_else(|| {
            let mut chain = AdapterChain::new();
            chain.register(Arc::new(LocalSynthesisAdapter::default()));
            chain
        });
        let cache = Arc::new(ResultCache::new(
            settings.freshness,
            settings.retention,
            self.clock,
        ));
        let events = EventBus::new(settings.event_capacity);
        let scheduler = Arc::new(Scheduler::new(cache.clone(), events.clone()));

        let ctx = Arc::new(WorkerContext {
            scheduler: scheduler.clone(),
            cache: cache.clone(),
            adapters: adapters.clone(),
            store: self.store.clone(),
            events: events.clone(),
            retry: settings.retry,
            job_deadline: settings.job_deadline,
        });
        let workers = WorkerPool::spawn(ctx, settings.workers);
        info!(
            workers = workers.len(),
            adapters = ?adapters.names(),
            "collector started"
        );

        Collector {
            scheduler,
            cache,
            events,
            adapters,
            store: self.store,
            workers: Mutex::new(Some(workers)),
            settings,
        }
    }
}

pub struct Collector {
    scheduler: Arc<Scheduler>,
    cache: Arc<ResultCache>,
    events: EventBus,
    adapters: AdapterChain,
    store: Option<Arc<dyn RecordStore>>,
    workers: Mutex<Option<WorkerPool>>,
    settings: CollectorSettings,
}

impl Collector {
    pub fn builder(settings: CollectorSettings) -> CollectorBuilder {
        CollectorBuilder::new(settings)
    }

    /// Standard setup from a config file: SQLite persistence, token from
    /// the configured environment variable and the configured adapter chain.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let credentials: Arc<dyn CredentialProvider> = Arc::new(EnvCredentials::new(
            config.adapters.primary_api.token_env.clone(),
        ));
        Self::from_config_with_credentials(config, credentials).await
    }

    pub async fn from_config_with_credentials(
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let store = SqliteRecordStore::open(config).await?;
        let chain = AdapterChain::from_config(config, credentials)?;
        Ok(Self::builder(CollectorSettings::from(config))
            .adapters(chain)
            .store(Arc::new(store))
            .build())
    }

    /// Normalizes `raw` and submits it. Never blocks; fails synchronously
    /// only for unclassifiable input or after shutdown.
    pub fn submit_collection(
        &self,
        raw: &str,
        hint: Option<KeyKind>,
        priority: Priority,
    ) -> Result<JobHandle, CollectError> {
        let key = normalize(raw, hint)?;
        self.submit_key(key, priority)
    }

    pub fn submit_key(&self, key: ParcelKey, priority: Priority) -> Result<JobHandle, CollectError> {
        self.scheduler.submit(key, priority)
    }

    /// Submits and waits for the final record.
    pub async fn collect(
        &self,
        raw: &str,
        hint: Option<KeyKind>,
        priority: Priority,
    ) -> JobOutcome {
        self.submit_collection(raw, hint, priority)?.result().await
    }

    /// Fresh cached record, without scheduling anything.
    pub fn get_cached_if_fresh(&self, key: &ParcelKey) -> Option<Arc<CollectionRecord>> {
        self.cache.get_if_fresh(key)
    }

    /// Cancels one caller's wait. See [`JobHandle::cancel`].
    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel();
    }

    /// Drops the cached entry for `key`. The next submission collects anew.
    pub fn invalidate(&self, key: &ParcelKey) -> bool {
        let removed = self.cache.invalidate(key);
        debug!(key = %key, removed, "cache entry invalidated");
        removed
    }

    /// Invalidates the cache entry and deletes the stored record.
    pub async fn forget(&self, key: &ParcelKey) -> Result<bool, StorageError> {
        let mut removed = self.invalidate(key);
        if let Some(store) = &self.store {
            removed |= store.delete(key).await?;
        }
        Ok(removed)
    }

    /// Loads the last known record of each key from storage into the cache.
    /// Returns how many entries were added.
    pub async fn warm_cache(&self, keys: &[ParcelKey]) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let mut added = 0;
        for key in keys {
            match store.load_last_known(key).await {
                Ok(Some(record)) => {
                    if self.cache.seed(record) {
                        added += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to warm cache entry"),
            }
        }
        added
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }

    /// Pending jobs in the order workers will pick them up.
    pub fn queue_snapshot(&self) -> Vec<JobSnapshot> {
        self.scheduler.queue_snapshot()
    }

    pub fn in_flight(&self) -> Vec<JobSnapshot> {
        self.scheduler.in_flight()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn adapters(&self) -> &AdapterChain {
        &self.adapters
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.names()
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Stops accepting submissions, cancels queued jobs and waits for
    /// running jobs to finish.
    pub async fn shutdown(&self) {
        let cancelled = self.scheduler.shutdown();
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(workers) = workers {
            workers.join().await;
        }
        info!(cancelled, "collector shut down");
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Lets idle workers exit when the collector goes away without an
        // explicit shutdown.
        if !self.scheduler.is_closed() {
            self.scheduler.shutdown();
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("adapters", &self.adapters.names())
            .field("scheduler", &self.scheduler)
            .field("settings", &self.settings)
            .finish()
    }
}
