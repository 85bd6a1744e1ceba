//! Collection jobs and caller handles.
//!
//! A [`Job`] is shared between the scheduler, the worker running it and
//! every [`JobHandle`] attached to it. Waiters are reference counted: one
//! caller cancelling only detaches that caller, the job itself is aborted
//! once the last waiter is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CollectError;
use crate::events::{CollectionEvent, EventBus};
use crate::models::{CollectionRecord, ParcelKey, Priority, SourceStatus};
use crate::scheduler::Scheduler;

/// Unique identifier for collection jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    /// `stage` is the index of the adapter currently running.
    Running {
        stage: usize,
    },
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// What every waiter eventually receives.
pub type JobOutcome = Result<Arc<CollectionRecord>, CollectError>;

#[derive(Debug)]
struct JobInner {
    priority: Priority,
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    waiters: HashSet<u64>,
    next_waiter: u64,
}

/// Shared state of one collection job.
pub struct Job {
    id: JobId,
    key: ParcelKey,
    created_at: DateTime<Utc>,
    seq: u64,
    seed: Option<Arc<CollectionRecord>>,
    inner: Mutex<JobInner>,
    outcome: watch::Sender<Option<JobOutcome>>,
    abort: CancellationToken,
}

impl Job {
    pub(crate) fn new(
        key: ParcelKey,
        priority: Priority,
        seq: u64,
        seed: Option<Arc<CollectionRecord>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: JobId::new(),
            key,
            created_at,
            seq,
            seed,
            inner: Mutex::new(JobInner {
                priority,
                state: JobState::Queued,
                started_at: None,
                completed_at: None,
                waiters: HashSet::new(),
                next_waiter: 0,
            }),
            outcome,
            abort: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn key(&self) -> &ParcelKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Submission order, the FIFO tie-break within one priority.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Previous record (stale cache entry) to start from, if any.
    pub fn seed(&self) -> Option<&Arc<CollectionRecord>> {
        self.seed.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.lock().priority
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().completed_at
    }

    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Raises the priority to `max(current, priority)`. Returns true if it
    /// went up.
    pub(crate) fn promote(&self, priority: Priority) -> bool {
        let mut inner = self.lock();
        if priority > inner.priority {
            inner.priority = priority;
            true
        } else {
            false
        }
    }

    pub(crate) fn add_waiter(&self) -> (u64, usize) {
        let mut inner = self.lock();
        let id = inner.next_waiter;
        inner.next_waiter += 1;
        inner.waiters.insert(id);
        (id, inner.waiters.len())
    }

    /// Returns the remaining waiter count, or `None` if `waiter` was not
    /// attached.
    pub(crate) fn remove_waiter(&self, waiter: u64) -> Option<usize> {
        let mut inner = self.lock();
        inner.waiters.remove(&waiter).then(|| inner.waiters.len())
    }

    pub(crate) fn mark_started(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.state = JobState::Running { stage: 0 };
        inner.started_at = Some(now);
    }

    pub(crate) fn set_stage(&self, stage: usize) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            inner.state = JobState::Running { stage };
        }
    }

    /// Moves a queued job straight to `Cancelled`. Returns false if a worker
    /// already picked it up.
    pub(crate) fn cancel_if_queued(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        if inner.state != JobState::Queued {
            return false;
        }
        inner.state = JobState::Cancelled;
        inner.completed_at = Some(now);
        true
    }

    /// Records the terminal state and wakes every waiter. Only the first
    /// call has any effect.
    pub(crate) fn complete(&self, outcome: JobOutcome, now: DateTime<Utc>) -> bool {
        {
            let mut inner = self.lock();
            if self.outcome.borrow().is_some() {
                return false;
            }
            inner.state = match &outcome {
                Ok(_) => JobState::Completed,
                Err(CollectError::Cancelled) | Err(CollectError::ShutDown) => JobState::Cancelled,
                Err(_) => JobState::Failed,
            };
            inner.completed_at = Some(now);
        }
        self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn abort(&self) {
        self.abort.cancel();
    }

    /// True once every waiter has cancelled.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    fn outcome_receiver(&self) -> watch::Receiver<Option<JobOutcome>> {
        self.outcome.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        JobSnapshot {
            job_id: self.id,
            key: self.key.clone(),
            priority: inner.priority,
            state: inner.state,
            waiters: inner.waiters.len(),
            created_at: self.created_at,
            started_at: inner.started_at,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("priority", &inner.priority)
            .field("state", &inner.state)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Point-in-time view of a job, for instrumentation.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub key: ParcelKey,
    pub priority: Priority,
    pub state: JobState,
    pub waiters: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Delivered to progress callbacks after each adapter stage.
#[derive(Debug, Clone)]
pub struct StageProgress {
    pub stage: usize,
    pub adapter: String,
    pub status: SourceStatus,
    pub record: Arc<CollectionRecord>,
}

/// A caller's view of a submission.
///
/// Either already resolved from a fresh cache entry, or attached as one
/// waiter of an in-flight job. Dropping a handle does not cancel anything;
/// use [`JobHandle::cancel`].
pub struct JobHandle {
    key: ParcelKey,
    inner: HandleInner,
}

enum HandleInner {
    Ready(Arc<CollectionRecord>),
    Attached(Attachment),
}

struct Attachment {
    job: Arc<Job>,
    waiter: u64,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    cancelled: CancellationToken,
    detached: AtomicBool,
}

impl JobHandle {
    pub(crate) fn ready(key: ParcelKey, record: Arc<CollectionRecord>) -> Self {
        Self {
            key,
            inner: HandleInner::Ready(record),
        }
    }

    pub(crate) fn attached(
        job: Arc<Job>,
        waiter: u64,
        scheduler: Arc<Scheduler>,
        events: EventBus,
    ) -> Self {
        Self {
            key: job.key().clone(),
            inner: HandleInner::Attached(Attachment {
                job,
                waiter,
                scheduler,
                events,
                cancelled: CancellationToken::new(),
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &ParcelKey {
        &self.key
    }

    /// `None` when the handle was served from cache.
    pub fn job_id(&self) -> Option<JobId> {
        match &self.inner {
            HandleInner::Ready(_) => None,
            HandleInner::Attached(a) => Some(a.job.id()),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.inner, HandleInner::Ready(_))
    }

    pub fn job(&self) -> Option<&Arc<Job>> {
        match &self.inner {
            HandleInner::Ready(_) => None,
            HandleInner::Attached(a) => Some(&a.job),
        }
    }

    /// Waits for the final record.
    pub async fn result(&self) -> JobOutcome {
        self.outcome_future().await
    }

    /// Waits at most `timeout`. A timeout only ends this wait; the job keeps
    /// running for other waiters.
    pub async fn wait(&self, timeout: Duration) -> JobOutcome {
        match tokio::time::timeout(timeout, self.outcome_future()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollectError::WaitTimeout),
        }
    }

    fn outcome_future(&self) -> impl Future<Output = JobOutcome> + Send + 'static {
        let ready = match &self.inner {
            HandleInner::Ready(record) => Some(record.clone()),
            HandleInner::Attached(_) => None,
        };
        let attached = match &self.inner {
            HandleInner::Ready(_) => None,
            HandleInner::Attached(a) => Some((a.job.outcome_receiver(), a.cancelled.clone())),
        };
        async move {
            let Some((mut rx, cancelled)) = attached else {
                return ready.ok_or_else(|| CollectError::JobFailed("empty handle".to_string()));
            };
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(CollectError::Cancelled),
                outcome = async move { rx.wait_for(Option::is_some).await.map(|v| (*v).clone()) } => {
                    match outcome {
                        Ok(Some(outcome)) => outcome,
                        _ => Err(CollectError::JobFailed("job dropped without a result".to_string())),
                    }
                }
            }
        }
    }

    /// Calls `callback` after each adapter stage of the job. Stages that
    /// completed before registration are not replayed. The returned task
    /// ends when the job reaches a terminal state or this handle cancels.
    pub fn on_progress<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(StageProgress) + Send + 'static,
    {
        let HandleInner::Attached(a) = &self.inner else {
            return tokio::spawn(async {});
        };
        let mut rx = a.events.subscribe();
        let job_id = a.job.id();
        let done = self.outcome_future();
        tokio::spawn(async move {
            tokio::pin!(done);
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Ok(CollectionEvent::StageCompleted { job_id: id, stage, adapter, status, record, .. })
                            if id == job_id =>
                        {
                            callback(StageProgress { stage, adapter, status, record });
                        }
                        Ok(event) if event.job_id() == job_id && event.is_terminal() => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut done => break,
                }
            }
        })
    }

    /// Calls `callback` exactly once with the final outcome, including
    /// `Err(Cancelled)` if this handle is cancelled first.
    pub fn on_complete<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(JobOutcome) + Send + 'static,
    {
        let done = self.outcome_future();
        tokio::spawn(async move {
            callback(done.await);
        })
    }

    /// Detaches this caller. Other waiters are unaffected; the job is
    /// aborted when no waiter is left. Calling it twice is a no-op.
    pub fn cancel(&self) {
        let HandleInner::Attached(a) = &self.inner else {
            return;
        };
        if a.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        a.cancelled.cancel();
        a.scheduler.detach(&a.job, a.waiter);
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            HandleInner::Ready(_) => false,
            HandleInner::Attached(a) => a.cancelled.is_cancelled(),
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("key", &self.key.to_string())
            .field("job_id", &self.job_id())
            .field("cached", &self.is_cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    fn job() -> Job {
        let key = normalize("50138237", None).unwrap();
        Job::new(key, Priority::Normal, 0, None, Utc::now())
    }

    #[test]
    fn promotion_only_raises() {
        let job = job();
        assert!(!job.promote(Priority::Low));
        assert_eq!(job.priority(), Priority::Normal);
        assert!(job.promote(Priority::Critical));
        assert!(!job.promote(Priority::High));
        assert_eq!(job.priority(), Priority::Critical);
    }

    #[test]
    fn waiters_are_counted() {
        let job = job();
        let (a, n) = job.add_waiter();
        let (b, m) = job.add_waiter();
        assert_eq!((n, m), (1, 2));
        assert_eq!(job.remove_waiter(a), Some(1));
        assert_eq!(job.remove_waiter(a), None);
        assert_eq!(job.remove_waiter(b), Some(0));
    }

    #[test]
    fn outcome_is_set_once() {
        let job = job();
        let key = job.key().clone();
        job.mark_started(Utc::now());
        let record = Arc::new(CollectionRecord::new(key, Utc::now()));
        assert!(job.complete(Ok(record), Utc::now()));
        assert!(!job.complete(Err(CollectError::Cancelled), Utc::now()));
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn queued_job_can_be_cancelled_before_start() {
        let job = job();
        assert!(job.cancel_if_queued(Utc::now()));
        assert_eq!(job.state(), JobState::Cancelled);

        let started = self::job();
        started.mark_started(Utc::now());
        assert!(!started.cancel_if_queued(Utc::now()));
    }
}
