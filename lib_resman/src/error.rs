//! # Error Taxonomy
//!
//! Every failure the resource manager can hand back to a caller. None of these
//! are retried internally; recovery (retry, user-facing messaging) belongs to
//! the domain layer that issued the request.
//!
//! - **`Producer`**: the caller-supplied fetch failed. The same error is handed
//!   to every waiter that joined the deduplicated request.
//! - **`CapacityRejection`**: a pending request or subscription was refused or
//!   evicted because a fixed capacity was reached.
//! - **`Timeout`**: a worker task exceeded its deadline. The worker context
//!   that was running it is kept for future tasks.
//! - **`ContextCrash`**: a background worker context died while a task was in
//!   flight on it.
//!
//! Pressure-driven eviction never surfaces here: entries and subscriptions
//! disappear silently.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors surfaced by the cache, the multiplexer and the worker scheduler.
///
/// The type is `Clone` because a single producer failure is fanned out to
/// every caller awaiting the same key.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The producer behind a cache key failed.
    #[error("producer for '{key}' failed: {cause}")]
    Producer {
        /// Cache key whose producer failed.
        key: String,
        /// The producer's own error, shared between all waiters.
        cause: Arc<anyhow::Error>,
    },

    /// A request or registration was refused (or evicted) at capacity.
    #[error("{resource} '{id}' rejected: capacity exhausted")]
    CapacityRejection {
        /// What kind of slot was exhausted (e.g. "pending request").
        resource: &'static str,
        /// Identifier of the refused or evicted item.
        id: String,
    },

    /// A worker task did not settle within its deadline.
    #[error("task {task_id} ({kind}) timed out after {elapsed:?}")]
    Timeout {
        /// Scheduler-assigned task identifier.
        task_id: u64,
        /// Task kind, as submitted.
        kind: String,
        /// Deadline that was exceeded.
        elapsed: Duration,
    },

    /// The background context running a task terminated unexpectedly.
    #[error("worker context {worker} crashed while running task {task_id}")]
    ContextCrash {
        /// Scheduler-assigned task identifier.
        task_id: u64,
        /// Index of the crashed worker slot.
        worker: usize,
    },

    /// The task kind is not part of the fixed catalog.
    #[error("unknown task kind '{0}'")]
    UnknownTaskKind(String),

    /// The payload could not be decoded for the requested task kind.
    #[error("invalid payload for '{kind}': {message}")]
    InvalidPayload {
        /// Task kind the payload was meant for.
        kind: String,
        /// Decoder message.
        message: String,
    },

    /// The realtime backend refused to open or rebind the physical channel.
    #[error("realtime channel error: {0}")]
    Channel(String),

    /// The component was shut down before the request could complete.
    #[error("resource manager is shut down")]
    Shutdown,
}

impl ResourceError {
    /// Wraps a producer failure for `key`.
    pub fn producer(key: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Producer {
            key: key.into(),
            cause: Arc::new(cause),
        }
    }

    /// Returns `true` for capacity refusals and evictions.
    pub fn is_capacity_rejection(&self) -> bool {
        matches!(self, Self::CapacityRejection { .. })
    }

    /// Returns `true` when a worker task exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
