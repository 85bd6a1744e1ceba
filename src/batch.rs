//! Batch collection.
//!
//! Normalizes a list of raw inputs, submits them all up front (the
//! scheduler dedups repeats and the worker pool throttles execution) and
//! waits for every result.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

use crate::collector::Collector;
use crate::error::CollectError;
use crate::models::{KeyKind, Priority};
use crate::progress::{CollectProgressReporter, ProgressEvent};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub input: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    /// Resolved records per completeness level.
    pub by_completeness: BTreeMap<String, usize>,
    /// Records backed only by synthesized placeholder data.
    pub placeholders: usize,
    pub invalid: Vec<BatchFailure>,
    pub failed: Vec<BatchFailure>,
}

impl BatchSummary {
    pub fn collected(&self) -> usize {
        self.by_completeness.values().sum()
    }
}

/// Reads one raw input per line. Blank lines and `#` comments are skipped.
pub fn read_inputs(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {}", path.display()))?;
    Ok(parse_inputs(&content))
}

pub fn parse_inputs(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Collects every input and summarizes the outcome. `wait` bounds each
/// individual wait; `None` waits as long as the job runs.
pub async fn run_batch(
    collector: &Collector,
    inputs: &[String],
    hint: Option<KeyKind>,
    priority: Priority,
    wait: Option<Duration>,
    reporter: &dyn CollectProgressReporter,
) -> BatchSummary {
    let mut summary = BatchSummary {
        total: inputs.len(),
        ..Default::default()
    };
    let mut pending = JoinSet::new();

    for input in inputs {
        match collector.submit_collection(input, hint, priority) {
            Ok(handle) => {
                let input = input.clone();
                pending.spawn(async move {
                    let outcome = match wait {
                        Some(timeout) => handle.wait(timeout).await,
                        None => handle.result().await,
                    };
                    (input, outcome)
                });
            }
            Err(err @ CollectError::InvalidFormat { .. }) => summary.invalid.push(BatchFailure {
                input: input.clone(),
                error: err.to_string(),
            }),
            Err(err) => summary.failed.push(BatchFailure {
                input: input.clone(),
                error: err.to_string(),
            }),
        }
    }

    let total = inputs.len() as u64;
    let mut done = (summary.invalid.len() + summary.failed.len()) as u64;
    while let Some(joined) = pending.join_next().await {
        done += 1;
        match joined {
            Ok((_, Ok(record))) => {
                *summary
                    .by_completeness
                    .entry(record.completeness.to_string())
                    .or_default() += 1;
                if record.is_placeholder() {
                    summary.placeholders += 1;
                }
            }
            Ok((input, Err(err))) => summary.failed.push(BatchFailure {
                input,
                error: err.to_string(),
            }),
            Err(e) => summary.failed.push(BatchFailure {
                input: String::new(),
                error: e.to_string(),
            }),
        }
        reporter.report(ProgressEvent::Batch { done, total });
    }

    info!(
        total = summary.total,
        collected = summary.collected(),
        invalid = summary.invalid.len(),
        failed = summary.failed.len(),
        "batch finished"
    );
    summary
}
