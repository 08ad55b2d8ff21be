//! Typed error kinds for the ingest data-plane.
//!
//! Call sites match on these to decide retry/park/drop behavior; everything
//! still converts freely to [`anyhow::Error`] at component boundaries, the
//! same way diesel's `DatabaseErrorKind` is matched explicitly in a handful
//! of repositories while `anyhow` remains the outer contract everywhere else.

use thiserror::Error;

/// The error kinds the ingestion data-plane distinguishes.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A source fetch failed; the adapter skips this cycle, no in-cycle retry.
    #[error("transient source error: {0}")]
    TransientSource(#[source] anyhow::Error),

    /// A malformed observation; dropped with a counter increment.
    #[error("validation error: {0}")]
    Validation(String),

    /// A store operation failed transiently; requeue with retry.
    #[error("transient store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    /// A store operation failed in a way retrying cannot fix; park in DLQ.
    #[error("fatal store error: {0}")]
    FatalStore(#[source] anyhow::Error),

    /// A webhook delivery attempt failed transiently (timeout, 5xx, network).
    #[error("transient delivery error: {0}")]
    DeliveryTransient(String),

    /// A webhook delivery attempt failed permanently (bad URL, HTTPS policy).
    #[error("permanent delivery error: {0}")]
    DeliveryPermanent(String),

    /// The per-subscriber governor denied the request; reschedule, not a failure.
    #[error("governor denied, retry at {retry_at}")]
    GovernorDenied { retry_at: chrono::DateTime<chrono::Utc> },

    /// The per-subscriber breaker is open; reschedule at `retry_at`, not a failure.
    #[error("breaker open, retry at {retry_at}")]
    BreakerOpen { retry_at: chrono::DateTime<chrono::Utc> },
}

impl IngestError {
    /// Whether this error kind represents something that should be retried
    /// by the queue's own retry machinery (as opposed to being handled and
    /// recovered locally).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::TransientSource(_)
                | IngestError::TransientStore(_)
                | IngestError::DeliveryTransient(_)
        )
    }

    /// Whether this error kind should park the message in the dead-letter
    /// queue immediately, without consuming a retry attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::FatalStore(_) | IngestError::DeliveryPermanent(_)
        )
    }
}
