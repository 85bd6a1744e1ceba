//! Priority queue and in-flight registry.
//!
//! Submission never blocks: it either resolves from a fresh cache entry,
//! attaches to the in-flight job for the same key, or queues a new job.
//! Workers pull from [`Scheduler::next_job`] in priority order with FIFO
//! tie-break.
//!
//! Promotion pushes a second queue entry at the new priority and the old
//! one is skipped when popped. The mutex guards bookkeeping only and is
//! never held across adapter I/O.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::error::CollectError;
use crate::events::{CollectionEvent, EventBus};
use crate::job::{Job, JobHandle, JobOutcome, JobSnapshot, JobState};
use crate::models::{ParcelKey, Priority};

struct QueueEntry {
    priority: Priority,
    seq: u64,
    job: Arc<Job>,
}

impl QueueEntry {
    /// Entries left behind by promotion or cancellation.
    fn is_stale(&self) -> bool {
        self.job.state() != JobState::Queued
            || self.job.priority() != self.priority
            || self.job.is_aborted()
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    inflight: HashMap<ParcelKey, Arc<Job>>,
    next_seq: u64,
    closed: bool,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    ready: Notify,
    cache: Arc<ResultCache>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(cache: Arc<ResultCache>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            ready: Notify::new(),
            cache,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Submits `key` at `priority`.
    ///
    /// A fresh cache entry resolves immediately. An in-flight job for the
    /// same key gains a waiter and its priority becomes
    /// `max(existing, priority)`. Otherwise a new job is queued, seeded with
    /// whatever stale cache entry exists.
    pub fn submit(
        self: &Arc<Self>,
        key: ParcelKey,
        priority: Priority,
    ) -> Result<JobHandle, CollectError> {
        let (handle, event, queued) = {
            let mut state = self.lock();
            if state.closed {
                return Err(CollectError::ShutDown);
            }
            if let Some(record) = self.cache.get_if_fresh(&key) {
                debug!(key = %key, "served from fresh cache");
                return Ok(JobHandle::ready(key, record));
            }

            let existing = state
                .inflight
                .get(&key)
                .filter(|job| !job.is_aborted())
                .cloned();
            match existing {
                Some(job) => {
                    let promoted = job.promote(priority);
                    if promoted && job.state() == JobState::Queued {
                        state.queue.push(QueueEntry {
                            priority: job.priority(),
                            seq: job.seq(),
                            job: job.clone(),
                        });
                    }
                    let (waiter, waiters) = job.add_waiter();
                    info!(
                        job_id = %job.id(),
                        key = %key,
                        priority = %job.priority(),
                        promoted,
                        waiters,
                        "attached to in-flight job"
                    );
                    let event = CollectionEvent::Attached {
                        job_id: job.id(),
                        key: key.clone(),
                        priority: job.priority(),
                        waiters,
                    };
                    let handle =
                        JobHandle::attached(job, waiter, self.clone(), self.events.clone());
                    (handle, event, false)
                }
                None => {
                    let seed = self.cache.get(&key).map(|entry| entry.record);
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let job = Arc::new(Job::new(
                        key.clone(),
                        priority,
                        seq,
                        seed,
                        self.cache.now(),
                    ));
                    let (waiter, _) = job.add_waiter();
                    state.inflight.insert(key.clone(), job.clone());
                    state.queue.push(QueueEntry {
                        priority,
                        seq,
                        job: job.clone(),
                    });
                    info!(
                        job_id = %job.id(),
                        key = %key,
                        priority = %priority,
                        seeded = job.seed().is_some(),
                        "queued collection job"
                    );
                    let event = CollectionEvent::Queued {
                        job_id: job.id(),
                        key,
                        priority,
                    };
                    let handle =
                        JobHandle::attached(job, waiter, self.clone(), self.events.clone());
                    (handle, event, true)
                }
            }
        };

        if queued {
            self.ready.notify_one();
        }
        self.events.publish(event);
        Ok(handle)
    }

    /// Waits for the next runnable job. Returns `None` once the scheduler
    /// is shut down.
    pub async fn next_job(&self) -> Option<Arc<Job>> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                while let Some(entry) = state.queue.pop() {
                    if entry.is_stale() {
                        continue;
                    }
                    entry.job.mark_started(self.cache.now());
                    // Wake another idle worker if more work is waiting.
                    if !state.queue.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(entry.job);
                }
            }

            notified.await;
        }
    }

    /// Pops the next runnable job without waiting.
    pub fn try_next_job(&self) -> Option<Arc<Job>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        while let Some(entry) = state.queue.pop() {
            if !entry.is_stale() {
                entry.job.mark_started(self.cache.now());
                return Some(entry.job);
            }
        }
        None
    }

    /// Removes the job from the registry and hands `outcome` to its waiters.
    pub fn finish(&self, job: &Arc<Job>, outcome: JobOutcome) {
        {
            let mut state = self.lock();
            let same = state
                .inflight
                .get(job.key())
                .is_some_and(|current| current.id() == job.id());
            if same {
                state.inflight.remove(job.key());
            }
        }
        job.complete(outcome, self.cache.now());
    }

    /// Detaches one waiter. The last waiter leaving aborts the job; a job
    /// that never started is cancelled right away.
    pub fn detach(&self, job: &Arc<Job>, waiter: u64) {
        let cancelled_while_queued = {
            let mut state = self.lock();
            match job.remove_waiter(waiter) {
                Some(0) if !job.state().is_terminal() => {
                    job.abort();
                    if job.cancel_if_queued(self.cache.now()) {
                        let same = state
                            .inflight
                            .get(job.key())
                            .is_some_and(|current| current.id() == job.id());
                        if same {
                            state.inflight.remove(job.key());
                        }
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if job.is_aborted() {
            debug!(job_id = %job.id(), key = %job.key(), "last waiter cancelled");
        }
        if cancelled_while_queued {
            job.complete(Err(CollectError::Cancelled), self.cache.now());
            self.events.publish(CollectionEvent::Cancelled {
                job_id: job.id(),
                key: job.key().clone(),
            });
        }
    }

    /// Pending jobs in dequeue order with their effective priority.
    pub fn queue_snapshot(&self) -> Vec<JobSnapshot> {
        let state = self.lock();
        let mut entries: Vec<&QueueEntry> =
            state.queue.iter().filter(|e| !e.is_stale()).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| e.job.snapshot()).collect()
    }

    /// Jobs submitted and not yet terminal, queued or running.
    pub fn in_flight(&self) -> Vec<JobSnapshot> {
        let state = self.lock();
        state.inflight.values().map(|job| job.snapshot()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stops accepting work and cancels every job that has not started.
    /// Running jobs finish normally.
    pub fn shutdown(&self) -> usize {
        let cancelled: Vec<Arc<Job>> = {
            let mut state = self.lock();
            state.closed = true;
            let queued: Vec<Arc<Job>> = state
                .queue
                .drain()
                .filter(|e| !e.is_stale())
                .map(|e| e.job)
                .collect();
            let now = self.cache.now();
            let cancelled: Vec<Arc<Job>> = queued
                .into_iter()
                .filter(|job| job.cancel_if_queued(now))
                .collect();
            for job in &cancelled {
                state.inflight.remove(job.key());
            }
            cancelled
        };
        self.ready.notify_waiters();

        for job in &cancelled {
            job.abort();
            job.complete(Err(CollectError::ShutDown), self.cache.now());
            self.events.publish(CollectionEvent::Cancelled {
                job_id: job.id(),
                key: job.key().clone(),
            });
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled queued jobs on shutdown");
        }
        cancelled.len()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Scheduler")
            .field("queued", &state.queue.len())
            .field("inflight", &state.inflight.len())
            .field("closed", &state.closed)
            .finish()
    }
}
