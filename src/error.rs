//! Crate-wide error types.

use std::fmt;

use thiserror::Error;

use crate::path::Path;

/// The outcome of a failed operation run.
///
/// Generic over the operation's own failure type `F` so a query's handler can fail with a
/// domain-specific error (`sqlx::Error`, a REST client's status-code error, ...) while this crate
/// still attaches the bookkeeping every caller needs regardless of what `F` is. `F` is
/// deliberately not bounded by `std::error::Error` — callers routinely use plain enums or string
/// wrappers as their failure type, so `Display`/`Error` are implemented manually below rather
/// than derived, which would otherwise force a bound this type doesn't need.
#[derive(Debug, Clone)]
pub enum OperationError<F> {
    /// The operation body itself returned or yielded a failure.
    Failed(F),
    /// The run was cancelled before it produced a result.
    Cancelled,
    /// The run exceeded its retry budget; carries the last attempt's failure.
    RetriesExhausted(F),
}

impl<F> OperationError<F> {
    pub fn failure(&self) -> Option<&F> {
        match self {
            OperationError::Failed(f) | OperationError::RetriesExhausted(f) => Some(f),
            OperationError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

impl<F: fmt::Display> fmt::Display for OperationError<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Failed(inner) => write!(f, "operation failed: {inner}"),
            OperationError::Cancelled => write!(f, "operation was cancelled"),
            OperationError::RetriesExhausted(inner) => {
                write!(f, "operation failed after exhausting retries: {inner}")
            }
        }
    }
}

impl<F: fmt::Debug + fmt::Display> std::error::Error for OperationError<F> {}

/// Errors raised by [`Client`](crate::client::Client)-level operations, as distinct from a single
/// operation's own [`OperationError`].
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// No store is registered at the given path.
    #[error("no store registered at path {path:?}")]
    NoSuchStore {
        /// The path that was looked up.
        path: Path,
    },

    /// A store is registered at the path, but not of the type the caller asked for.
    #[error("store at path {path:?} is not of the requested type")]
    WrongStoreType {
        /// The path that was looked up.
        path: Path,
    },

    /// The client was dropped while a handle derived from it was still in use.
    #[error("client has been dropped")]
    ClientDropped,
}

/// A non-fatal condition surfaced to observers without failing the run it occurred during —
/// reported via `tracing::warn!` plus the optional `IssueHandlerKey` context hook, never
/// returned as an `Err`. Each of these is "recovered locally": the caller gets a usable store
/// back (or a completed retry) rather than a hard failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIssue {
    /// A retry is about to happen after attempt `attempt` failed.
    RetryScheduled { attempt: u32 },
    /// A stale value is being served because a store was evicted under memory pressure and a
    /// fresh run hasn't completed yet.
    ServingStaleValue { path: Path },
    /// A second operation was registered at a path that already has a store of a different
    /// concrete type. The caller gets back a fresh, unregistered store rather than the existing
    /// (and incompatible) one.
    DuplicatePath { path: Path },
    /// A lookup found an entry at `path` but it was not of the requested concrete type.
    TypeMismatch { path: Path },
}
