//! Error taxonomy for the runtime.

use std::fmt;
use thiserror::Error;

/// Errors reported by scope-lifecycle mismanagement: mis-nested `CancelScope`s,
/// nurseries closed out of order, or internal invariants the run loop caught
/// itself violating.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// A scope was exited a second time.
    #[error("attempted to exit a cancel scope that's already been exited")]
    AlreadyExited,

    /// A scope was exited while a child scope, still active, was lexically
    /// nested inside it. Mirrors trio's `MISNESTING_ADVICE`.
    #[error(
        "cancel scope stack corrupted: attempted to exit {outer}, but {inner} is still open; \
         this is probably caused by a cancel scope or nursery being exited out of lexical order"
    )]
    MisNested { outer: String, inner: String },

    /// A nursery's child task exited without calling `started()` after
    /// `Nursery::start` was used to spawn it.
    #[error("child exited without calling task_status.started()")]
    StartNeverCalled,

    /// The run loop observed a state that should be provably unreachable.
    #[error("internal error in the runtime - this is a bug: {0}")]
    Internal(String),
}

/// Top-level error type surfaced to users of the runtime (`run`, nurseries,
/// memory channels).
#[derive(Debug, Error)]
pub enum WeaveError {
    /// The originating scope's deadline or explicit `cancel()` fired while
    /// this task was at a checkpoint.
    #[error("cancelled")]
    Cancelled,

    /// The resource (channel endpoint) was already closed by the caller.
    #[error("this resource has already been closed")]
    ClosedResource,

    /// The resource's peers have all disappeared; further use can't succeed.
    #[error("this resource is broken: no peers are left")]
    BrokenResource,

    /// A receive was attempted on a channel with no more senders and an
    /// empty buffer.
    #[error("end of channel")]
    EndOfChannel,

    /// A non-blocking (`try_*`) operation could not complete immediately.
    #[error("operation would block")]
    WouldBlock,

    /// An operation was attempted against a run that has already finished.
    #[error("this run has already finished")]
    RunFinished,

    /// A cancel-scope/nursery lifecycle error.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// One or more child tasks in a nursery failed; see `MultiError` for the
    /// individual leaves.
    #[error(transparent)]
    Multi(#[from] MultiError),

    /// A task's own body returned an application error. Boxed here so the
    /// nursery that joins the task only ever has to reason about
    /// `WeaveError`, regardless of what error type the task itself used.
    #[error("{0}")]
    Task(#[source] Box<dyn std::error::Error>),

    /// The run loop caught itself in a state that should be provably
    /// unreachable. Always indicates a bug in the runtime, never user error.
    #[error("internal runtime error - this is a bug: {0}")]
    Internal(String),
}

/// A flat, non-nesting aggregation of errors raised by sibling tasks in one
/// nursery. Flattening happens at construction time: a `MultiError` is never
/// built out of other `MultiError`s.
#[derive(Debug)]
pub struct MultiError {
    leaves: Vec<WeaveError>,
}

impl MultiError {
    /// Build a `MultiError` from a non-empty list of leaf errors, flattening
    /// any leaf that is itself a `MultiError`. Panics if `leaves` is empty;
    /// callers should prefer `WeaveError` directly for a single error.
    pub fn new(leaves: Vec<WeaveError>) -> Self {
        assert!(!leaves.is_empty(), "MultiError must have at least one leaf");
        let mut flat = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            match leaf {
                WeaveError::Multi(inner) => flat.extend(inner.leaves),
                other => flat.push(other),
            }
        }
        MultiError { leaves: flat }
    }

    pub fn leaves(&self) -> &[WeaveError] {
        &self.leaves
    }

    /// Remove leaves matched by `pred`. Returns `None` if every leaf was
    /// removed (the whole error disappears), `Some(single)` if exactly one
    /// leaf survives, or `Some(Multi(..))` otherwise.
    pub fn filter<F>(self, mut pred: F) -> Option<WeaveError>
    where
        F: FnMut(&WeaveError) -> bool,
    {
        let remaining: Vec<WeaveError> = self.leaves.into_iter().filter(|e| !pred(e)).collect();
        match remaining.len() {
            0 => None,
            1 => remaining.into_iter().next(),
            _ => Some(WeaveError::Multi(MultiError { leaves: remaining })),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.leaves.len())?;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{i}] {leaf}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.leaves.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_flattens_nested_errors() {
        let inner = MultiError::new(vec![WeaveError::Cancelled, WeaveError::WouldBlock]);
        let outer = MultiError::new(vec![WeaveError::Multi(inner), WeaveError::EndOfChannel]);
        assert_eq!(outer.leaves().len(), 3);
    }

    #[test]
    fn filter_removes_all_cancelled_leaves() {
        let multi = MultiError::new(vec![WeaveError::Cancelled, WeaveError::Cancelled]);
        let filtered = multi.filter(|e| matches!(e, WeaveError::Cancelled));
        assert!(filtered.is_none());
    }

    #[test]
    fn filter_collapses_to_single_error() {
        let multi = MultiError::new(vec![WeaveError::Cancelled, WeaveError::EndOfChannel]);
        let filtered = multi.filter(|e| matches!(e, WeaveError::Cancelled));
        assert!(matches!(filtered, Some(WeaveError::EndOfChannel)));
    }
}
