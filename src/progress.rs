//! Collection progress reporting for the CLI.
//!
//! Reports stage-by-stage progress during `parcel collect` and `parcel batch`
//! so users see which source answered and how complete the record is.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::events::CollectionEvent;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A lifecycle event from the collector's bus.
    Job(CollectionEvent),
    /// Batch runs: `done` of `total` inputs resolved.
    Batch { done: u64, total: u64 },
}

/// Reports collection progress. Implementations write to stderr (human or JSON).
pub trait CollectProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "collect apn:50138237  web_fallback  success  detailed".
pub struct StderrProgress;

impl CollectProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Job(job) => match human_line(job) {
                Some(line) => line,
                None => return,
            },
            ProgressEvent::Batch { done, total } => format!(
                "batch  {} / {} parcels\n",
                format_number(*done),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn human_line(event: &CollectionEvent) -> Option<String> {
    let line = match event {
        CollectionEvent::Queued { key, priority, .. } => {
            format!("collect {}  queued ({})\n", key, priority)
        }
        CollectionEvent::Attached {
            key,
            priority,
            waiters,
            ..
        } => format!(
            "collect {}  joined running job ({}, {} waiters)\n",
            key, priority, waiters
        ),
        CollectionEvent::StageCompleted {
            key,
            adapter,
            status,
            completeness,
            ..
        } => format!("collect {}  {}  {}  {}\n", key, adapter, status, completeness),
        CollectionEvent::Completed {
            key,
            completeness,
            record,
            ..
        } => format!(
            "collect {}  done  {}  ({} sources)\n",
            key,
            completeness,
            record.sources_attempted.len()
        ),
        CollectionEvent::Failed { key, error, .. } => {
            format!("collect {}  failed: {}\n", key, error)
        }
        CollectionEvent::Cancelled { key, .. } => format!("collect {}  cancelled\n", key),
        CollectionEvent::Started { .. } => return None,
    };
    Some(line)
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CollectProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            // The full record stays on stdout; progress lines stay small.
            ProgressEvent::Job(CollectionEvent::StageCompleted {
                job_id,
                key,
                stage,
                adapter,
                status,
                completeness,
                ..
            }) => serde_json::json!({
                "event": "stage_completed",
                "job_id": job_id,
                "key": key.to_string(),
                "stage": stage,
                "adapter": adapter,
                "status": status,
                "completeness": completeness,
            }),
            ProgressEvent::Job(CollectionEvent::Completed {
                job_id,
                key,
                completeness,
                ..
            }) => serde_json::json!({
                "event": "completed",
                "job_id": job_id,
                "key": key.to_string(),
                "completeness": completeness,
            }),
            ProgressEvent::Job(other) => match serde_json::to_value(other) {
                Ok(value) => value,
                Err(_) => return,
            },
            ProgressEvent::Batch { done, total } => serde_json::json!({
                "event": "batch",
                "done": done,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CollectProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn CollectProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

/// Forwards bus events to `reporter` until the bus closes or the returned
/// task is aborted.
pub fn forward_events(
    mut rx: broadcast::Receiver<CollectionEvent>,
    reporter: Arc<dyn CollectProgressReporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => reporter.report(ProgressEvent::Job(event)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
