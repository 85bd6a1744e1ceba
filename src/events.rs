//! Collection lifecycle events.
//!
//! Every state change of a job is published on a broadcast [`EventBus`].
//! Per-handle progress callbacks, the CLI progress reporter and the HTTP
//! server all read from the same stream.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::models::{CollectionRecord, Completeness, ParcelKey, Priority, SourceStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CollectionEvent {
    Queued {
        job_id: JobId,
        key: ParcelKey,
        priority: Priority,
    },
    /// A submission joined an existing in-flight job.
    Attached {
        job_id: JobId,
        key: ParcelKey,
        priority: Priority,
        waiters: usize,
    },
    Started {
        job_id: JobId,
        key: ParcelKey,
    },
    /// One adapter stage finished; `record` is the merged state afterwards.
    StageCompleted {
        job_id: JobId,
        key: ParcelKey,
        stage: usize,
        adapter: String,
        status: SourceStatus,
        completeness: Completeness,
        record: Arc<CollectionRecord>,
    },
    Completed {
        job_id: JobId,
        key: ParcelKey,
        completeness: Completeness,
        record: Arc<CollectionRecord>,
    },
    Failed {
        job_id: JobId,
        key: ParcelKey,
        error: String,
    },
    Cancelled {
        job_id: JobId,
        key: ParcelKey,
    },
}

impl CollectionEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            CollectionEvent::Queued { job_id, .. }
            | CollectionEvent::Attached { job_id, .. }
            | CollectionEvent::Started { job_id, .. }
            | CollectionEvent::StageCompleted { job_id, .. }
            | CollectionEvent::Completed { job_id, .. }
            | CollectionEvent::Failed { job_id, .. }
            | CollectionEvent::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn key(&self) -> &ParcelKey {
        match self {
            CollectionEvent::Queued { key, .. }
            | CollectionEvent::Attached { key, .. }
            | CollectionEvent::Started { key, .. }
            | CollectionEvent::StageCompleted { key, .. }
            | CollectionEvent::Completed { key, .. }
            | CollectionEvent::Failed { key, .. }
            | CollectionEvent::Cancelled { key, .. } => key,
        }
    }

    /// No further events follow for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollectionEvent::Completed { .. }
                | CollectionEvent::Failed { .. }
                | CollectionEvent::Cancelled { .. }
        )
    }
}

/// Fan-out channel for [`CollectionEvent`]s.
///
/// Slow subscribers lag and lose events instead of blocking workers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CollectionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CollectionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        let key = normalize("50138237", None).unwrap();
        bus.publish(CollectionEvent::Started {
            job_id: JobId::new(),
            key: key.clone(),
        });

        let mut rx = bus.subscribe();
        let id = JobId::new();
        bus.publish(CollectionEvent::Cancelled { job_id: id, key });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), id);
        assert!(event.is_terminal());
    }

    #[test]
    fn events_serialize_with_tag() {
        let key = normalize("50138237", None).unwrap();
        let event = CollectionEvent::Queued {
            job_id: JobId::new(),
            key,
            priority: Priority::High,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queued");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["key"]["normalized_value"], "50138237");
    }
}
