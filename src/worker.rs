//! Worker pool and the adapter fallback chain.
//!
//! Each worker pulls a job from the [`Scheduler`], walks the adapters in
//! registration order and merges every result into the job's record:
//!
//! ```text
//! next_job ─▶ seed ─▶ stage 0 ─▶ stage 1 ─▶ ... ─▶ cache.put ─▶ save ─▶ finish
//!                       │ retry transient errors with backoff
//!                       └ StageCompleted event after every stage
//! ```
//!
//! A remote stage is skipped once the values verified by this job reach the
//! adapter's `runs_below()` level. Values carried over from a seed only count
//! for local stages. The job deadline bounds the remote stages; once it
//! passes only local adapters still run and the record is finalized with
//! whatever was collected.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::{self, AdapterChain, SourceAdapter};
use crate::cache::ResultCache;
use crate::config::RetryConfig;
use crate::error::CollectError;
use crate::events::{CollectionEvent, EventBus};
use crate::job::Job;
use crate::models::{CollectionRecord, ParcelKey, SourceResult};
use crate::persistence::RecordStore;
use crate::scheduler::Scheduler;

/// Bounded exponential backoff for transient adapter errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<ResultCache>,
    pub adapters: AdapterChain,
    pub store: Option<Arc<dyn RecordStore>>,
    pub events: EventBus,
    pub retry: RetryPolicy,
    pub job_deadline: Duration,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on the current runtime.
    pub fn spawn(ctx: Arc<WorkerContext>, workers: usize) -> Self {
        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, ctx.clone())))
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to exit. Workers exit once the scheduler is
    /// shut down and their current job is done.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(worker: usize, ctx: Arc<WorkerContext>) {
    debug!(worker, "worker started");
    while let Some(job) = ctx.scheduler.next_job().await {
        // Run in its own task so a panicking adapter fails the job, not the worker.
        let task = {
            let ctx = ctx.clone();
            let job = job.clone();
            tokio::spawn(async move { run_job(&ctx, &job).await })
        };
        if let Err(e) = task.await {
            let message = if e.is_panic() {
                "collection task panicked".to_string()
            } else {
                e.to_string()
            };
            error!(worker, job_id = %job.id(), key = %job.key(), error = %message, "collection job failed");
            ctx.scheduler
                .finish(&job, Err(CollectError::JobFailed(message.clone())));
            ctx.events.publish(CollectionEvent::Failed {
                job_id: job.id(),
                key: job.key().clone(),
                error: message,
            });
        }
    }
    debug!(worker, "worker stopped");
}

/// Runs the whole fallback chain for one job and publishes the outcome.
pub async fn run_job(ctx: &WorkerContext, job: &Arc<Job>) {
    let key = job.key().clone();
    let abort = job.abort_token().clone();
    let deadline = Instant::now() + ctx.job_deadline;

    info!(job_id = %job.id(), key = %key, priority = %job.priority(), "collection started");
    ctx.events.publish(CollectionEvent::Started {
        job_id: job.id(),
        key: key.clone(),
    });

    let mut record = initial_record(ctx, job).await;
    let mut deadline_hit = false;

    for (stage, adapter) in ctx.adapters.adapters().iter().enumerate() {
        if abort.is_cancelled() {
            return cancelled(ctx, job);
        }
        // Carried-over values only set the floor that local stages fill.
        // Remote stages run until this collection has verified enough.
        let reached = if adapter.is_local() {
            record.completeness
        } else {
            record.verified_completeness()
        };
        if reached >= adapter.runs_below() {
            debug!(
                job_id = %job.id(),
                adapter = adapter.name(),
                completeness = %reached,
                "stage skipped"
            );
            continue;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = if adapter.is_local() {
            adapter.timeout()
        } else if remaining.is_zero() {
            if !deadline_hit {
                warn!(
                    job_id = %job.id(),
                    key = %key,
                    completeness = %record.completeness,
                    "job deadline exceeded, skipping remote sources"
                );
                deadline_hit = true;
            }
            continue;
        } else {
            remaining
        };

        job.set_stage(stage);
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => return cancelled(ctx, job),
            result = run_stage(ctx, adapter.as_ref(), &key, &record, budget) => result,
        };

        let status = result.status;
        let attempts = result.attempts;
        let written = record.merge(result, ctx.cache.now());
        info!(
            job_id = %job.id(),
            key = %key,
            adapter = adapter.name(),
            status = %status,
            attempts,
            fields_written = written,
            completeness = %record.completeness,
            "stage completed"
        );
        ctx.events.publish(CollectionEvent::StageCompleted {
            job_id: job.id(),
            key: key.clone(),
            stage,
            adapter: adapter.name().to_string(),
            status,
            completeness: record.completeness,
            record: Arc::new(record.clone()),
        });
    }

    if abort.is_cancelled() {
        return cancelled(ctx, job);
    }

    let record = Arc::new(record);
    ctx.cache.put(record.clone());
    if let Some(store) = &ctx.store {
        if let Err(e) = store.save(&record).await {
            warn!(job_id = %job.id(), key = %key, error = %e, "failed to persist record");
        }
    }

    let completeness = record.completeness;
    ctx.scheduler.finish(job, Ok(record.clone()));
    info!(
        job_id = %job.id(),
        key = %key,
        completeness = %completeness,
        sources = record.sources_attempted.len(),
        "collection completed"
    );
    ctx.events.publish(CollectionEvent::Completed {
        job_id: job.id(),
        key,
        completeness,
        record,
    });
}

/// The record a job starts from: the stale cache entry it was queued with,
/// else the last persisted record, else empty.
async fn initial_record(ctx: &WorkerContext, job: &Job) -> CollectionRecord {
    let now = ctx.cache.now();
    let key = job.key().clone();
    if let Some(seed) = job.seed() {
        return CollectionRecord::seeded(key, seed, now);
    }
    let Some(store) = &ctx.store else {
        return CollectionRecord::new(key, now);
    };
    match store.load_last_known(&key).await {
        Ok(Some(previous)) => {
            debug!(job_id = %job.id(), key = %key, "seeded from storage");
            CollectionRecord::seeded(key, &previous, now)
        }
        Ok(None) => CollectionRecord::new(key, now),
        Err(e) => {
            warn!(job_id = %job.id(), key = %key, error = %e, "failed to load last known record");
            CollectionRecord::new(key, now)
        }
    }
}

/// One stage: the adapter attempt plus bounded retries of transient
/// failures, all within `budget`.
async fn run_stage(
    ctx: &WorkerContext,
    adapter: &dyn SourceAdapter,
    key: &ParcelKey,
    record: &CollectionRecord,
    budget: Duration,
) -> SourceResult {
    let started = Instant::now();
    let stage_deadline = started + budget;
    let mut tries = 0u32;
    loop {
        tries += 1;
        let remaining = stage_deadline.saturating_duration_since(Instant::now());
        let outcome =
            adapters::attempt(adapter, key, record, adapter.timeout().min(remaining)).await;

        let delay = ctx.retry.delay_for(tries);
        let retry = outcome.is_transient_failure()
            && tries <= ctx.retry.max_retries
            && Instant::now() + delay < stage_deadline;
        if !retry {
            let mut result = outcome.result;
            result.attempts = tries;
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        debug!(
            adapter = adapter.name(),
            key = %key,
            attempt = tries,
            delay_ms = delay.as_millis() as u64,
            error = ?outcome.error,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn cancelled(ctx: &WorkerContext, job: &Arc<Job>) {
    info!(job_id = %job.id(), key = %job.key(), "collection aborted, no waiters left");
    ctx.scheduler.finish(job, Err(CollectError::Cancelled));
    ctx.events.publish(CollectionEvent::Cancelled {
        job_id: job.id(),
        key: job.key().clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1000));
    }

    #[test]
    fn policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(RetryPolicy::none().delay_for(3), Duration::ZERO);
    }
}
