//! Trap messages and the checkpoint primitives built on top of them.
//!
//! A real coroutine-based scheduler lets a suspended computation yield a
//! tagged message to its driver. Rust's `Future` doesn't have an equivalent
//! of `yield`, so a task's future leaves its trap in a thread-local scratch
//! slot immediately before returning `Poll::Pending`; the runner reads the
//! slot right after the `poll` call returns and clears it before the next
//! one. The slot is only ever touched while a single task's future is being
//! polled, so there's no cross-task interference despite being thread-local
//! rather than per-task.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::WeaveError;
use crate::outcome::Outcome;

/// What an abort function reports back to the task that installed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// The wait was actually torn down; the runner should reschedule the
    /// task with `Error(Cancelled)`.
    Succeeded,
    /// The primitive isn't ready to give up the wait yet (e.g. a nursery
    /// still has other children to wait for). It keeps responsibility for
    /// eventually rescheduling the task through some other path.
    Failed,
}

/// Called with `true` when the abort is being attempted because of a
/// cancellation (as opposed to some other forced wakeup); the core only
/// ever calls these with `true`, but the bool is threaded through so
/// callers can match the shape of `raise_cancel` in the source design.
pub type AbortFunc = Box<dyn FnOnce(bool) -> Abort>;

/// A message a task's future leaves behind for the runner instead of
/// returning a final value.
pub enum Trap {
    /// Reschedule immediately with `Value(())`; no cancellation check. A
    /// pure yield point.
    CancelShieldedCheckpoint,
    /// Park the task. `abort_func` is installed so a forced wakeup
    /// (cancellation) can tear the wait down.
    WaitTaskRescheduled(AbortFunc),
    /// Treat the task as if it had returned this outcome. Never produced
    /// inside this crate, but accepted for forward compatibility with
    /// hand-off primitives built on top of it.
    PermanentlyDetachCoroutineObject(Outcome<(), WeaveError>),
}

thread_local! {
    static PENDING_TRAP: RefCell<Option<Trap>> = const { RefCell::new(None) };
}

pub(crate) fn stash_trap(trap: Trap) {
    PENDING_TRAP.with(|cell| {
        let previous = cell.borrow_mut().replace(trap);
        debug_assert!(
            previous.is_none(),
            "a task's future yielded two traps in a single poll"
        );
    });
}

/// Drains whatever trap the just-completed `poll` call left behind, if any.
pub(crate) fn take_trap() -> Option<Trap> {
    PENDING_TRAP.with(|cell| cell.borrow_mut().take())
}

/// Suspends the current task, installing `abort` so a cancellation can tear
/// the wait down. Resolves to `Err(Cancelled)` if the abort fired and
/// succeeded, `Ok(())` (or whatever the reschedule outcome carries) if the
/// task was woken some other way.
pub async fn wait_task_rescheduled(abort: AbortFunc) -> Result<(), WeaveError> {
    WaitTaskRescheduled { abort: Some(abort) }.await
}

struct WaitTaskRescheduled {
    abort: Option<AbortFunc>,
}

impl Future for WaitTaskRescheduled {
    type Output = Result<(), WeaveError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(abort) = self.abort.take() {
            stash_trap(Trap::WaitTaskRescheduled(abort));
            return Poll::Pending;
        }
        // Second poll: the runner only re-polls us after stashing a resume
        // outcome on the active task.
        Poll::Ready(crate::context::take_resume_outcome().into_result())
    }
}

/// A pure yield point: reschedules immediately, with no cancellation check.
pub async fn cancel_shielded_checkpoint() {
    CancelShieldedCheckpoint { yielded: false }.await
}

struct CancelShieldedCheckpoint {
    yielded: bool,
}

impl Future for CancelShieldedCheckpoint {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.yielded {
            self.yielded = true;
            stash_trap(Trap::CancelShieldedCheckpoint);
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}

/// Raises `Cancelled` immediately (without suspending) if the current task
/// is effectively cancelled right now.
pub async fn checkpoint_if_cancelled() -> Result<(), WeaveError> {
    if crate::context::active_task().cancel_status().effectively_cancelled() {
        Err(WeaveError::Cancelled)
    } else {
        Ok(())
    }
}

/// The only fully sanctioned checkpoint: checks for a pending cancellation,
/// then yields once so other runnable tasks get a turn.
pub async fn checkpoint() -> Result<(), WeaveError> {
    checkpoint_if_cancelled().await?;
    cancel_shielded_checkpoint().await;
    Ok(())
}
