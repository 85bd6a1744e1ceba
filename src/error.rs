//! Error taxonomy for the collection engine.
//!
//! Only [`CollectError`] is visible to callers. [`SourceError`] stays inside
//! the fallback chain and ends up as `error_detail` in
//! [`SourceResult`](crate::models::SourceResult); [`StorageError`] is logged
//! by the worker and never fails a job.

use std::time::Duration;

use thiserror::Error;

/// Caller-visible failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    /// The raw input could not be classified. No job is created.
    #[error("invalid input '{input}': {reason}")]
    InvalidFormat { input: String, reason: String },

    /// Infrastructure broke while running the job.
    #[error("collection job failed: {0}")]
    JobFailed(String),

    /// This waiter, or every waiter of the job, cancelled.
    #[error("collection cancelled")]
    Cancelled,

    /// The caller's own wait deadline passed. The job keeps running.
    #[error("timed out waiting for collection result")]
    WaitTimeout,

    #[error("collector is shutting down")]
    ShutDown,
}

impl CollectError {
    pub(crate) fn invalid(input: &str, reason: impl Into<String>) -> Self {
        CollectError::InvalidFormat {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a single adapter attempt did not produce data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("no credential available")]
    MissingCredential,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("parcel not found at source")]
    NotFound,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("adapter disabled")]
    Disabled,
}

impl SourceError {
    /// Transient errors (timeouts, 5xx, throttling, connection failures) are
    /// retried with backoff. Everything else falls straight through to the
    /// next adapter.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Timeout(_))
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            401 | 403 => SourceError::Unauthorized(format!("status {}", status)),
            404 => SourceError::NotFound,
            429 | 500..=599 => SourceError::Unavailable(format!("status {}: {}", status, message)),
            _ => SourceError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::from_status(status.as_u16(), &err.to_string())
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

/// A persistence write or read failed.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StorageError(#[from] pub anyhow::Error);

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError(err.into())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            SourceError::from_status(401, ""),
            SourceError::Unauthorized("status 401".to_string())
        );
        assert_eq!(SourceError::from_status(404, "gone"), SourceError::NotFound);
        assert!(SourceError::from_status(503, "maintenance").is_transient());
        assert!(SourceError::from_status(429, "slow down").is_transient());
        assert!(!SourceError::from_status(400, "bad apn").is_transient());
        assert!(!SourceError::from_status(403, "").is_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(SourceError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!SourceError::MissingCredential.is_transient());
        assert!(!SourceError::Malformed("no table".into()).is_transient());
    }
}
