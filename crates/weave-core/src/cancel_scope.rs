//! User-facing cancellation scopes: deadline + shield + cancel bit.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancel_status::CancelStatus;
use crate::context;
use crate::error::{ScopeError, WeaveError};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

/// Internal state of a `CancelScope`. One-shot: a scope may be entered at
/// most once.
pub struct CancelScopeInner {
    pub id: u64,
    pub deadline: Cell<f64>,
    pub shield: Cell<bool>,
    pub cancel_called: Cell<bool>,
    pub cancelled_caught: Cell<bool>,
    has_been_entered: Cell<bool>,
    /// Mirror of `deadline` as registered in the runner's `Deadlines` heap;
    /// `+inf` whenever the scope is inactive or already cancelled.
    pub registered_deadline: Cell<f64>,
    status: std::cell::RefCell<Option<CancelStatus>>,
}

/// A lexical region whose cancellation affects all enclosed work. Construct
/// with `CancelScope::new`, enter with `CancelScope::enter`, and always pair
/// with a call to `exit` (the `Checkpoint`/task-body helpers in `runner.rs`
/// do this for you via a guard).
#[derive(Clone)]
pub struct CancelScope(pub Rc<CancelScopeInner>);

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("id", &self.0.id)
            .field("deadline", &self.0.deadline.get())
            .field("shield", &self.0.shield.get())
            .field("cancel_called", &self.0.cancel_called.get())
            .finish()
    }
}

impl CancelScope {
    pub fn new(deadline: f64, shield: bool) -> Self {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        CancelScope(Rc::new(CancelScopeInner {
            id,
            deadline: Cell::new(deadline),
            shield: Cell::new(shield),
            cancel_called: Cell::new(false),
            cancelled_caught: Cell::new(false),
            has_been_entered: Cell::new(false),
            registered_deadline: Cell::new(f64::INFINITY),
            status: std::cell::RefCell::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn deadline(&self) -> f64 {
        self.0.deadline.get()
    }

    pub fn shield(&self) -> bool {
        self.0.shield.get()
    }

    pub fn cancel_called(&self) -> bool {
        self.0.cancel_called.get()
    }

    pub fn cancelled_caught(&self) -> bool {
        self.0.cancelled_caught.get()
    }

    /// Current active status, if the scope is entered.
    pub fn status(&self) -> Option<CancelStatus> {
        self.0.status.borrow().clone()
    }

    /// Enter the scope under `parent` (the task's currently active status),
    /// returning the new status which becomes active for the task.
    ///
    /// The `registered_deadline`/heap-registration dance described in the
    /// specification's "might_change_registered_deadline" protocol is the
    /// caller's job (`Runner::enter_scope`), since only the runner has access
    /// to the `Deadlines` heap.
    pub fn enter(&self, parent: Option<CancelStatus>) -> CancelStatus {
        assert!(!self.0.has_been_entered.get(), "CancelScope is one-shot");
        self.0.has_been_entered.set(true);
        let status = CancelStatus::new(Rc::downgrade(&self.0), parent);
        *self.0.status.borrow_mut() = Some(status.clone());
        self.sync_registered_deadline();
        // A deadline already in the past at entry time is cancelled right
        // away rather than left for the next loop iteration's deadline
        // sweep to discover - avoids a spurious extra checkpoint's worth of
        // latency on a scope that was born already expired.
        if self.0.deadline.get().is_finite() {
            if let Some(now) = context::try_with_runner(|r| r.current_time()) {
                if now >= self.0.deadline.get() {
                    self.cancel();
                }
            }
        }
        status
    }

    /// The "might_change_registered_deadline" protocol: recompute what
    /// should be registered in the runner's deadline heap and, if it
    /// changed, swap the registration. A no-op outside an active run (unit
    /// tests construct scopes without a runner).
    fn sync_registered_deadline(&self) {
        context::try_with_runner(|r| r.sync_registered_deadline(self));
    }

    /// Recompute what should be registered in the deadlines heap: `+inf` if
    /// cancelled or inactive, else `deadline`.
    pub fn desired_registered_deadline(&self) -> f64 {
        if self.0.cancel_called.get() || self.0.status.borrow().is_none() {
            f64::INFINITY
        } else {
            self.0.deadline.get()
        }
    }

    pub fn set_deadline(&self, deadline: f64) {
        assert!(
            deadline.is_finite() || deadline == f64::INFINITY,
            "deadline must be finite or +inf, got {deadline}"
        );
        self.0.deadline.set(deadline);
        self.sync_registered_deadline();
    }

    pub fn set_shield(&self, shield: bool) {
        self.0.shield.set(shield);
        if let Some(status) = self.status() {
            status.recalculate();
        }
    }

    /// Idempotent. Sets `cancel_called`, unregisters the deadline (the
    /// runner will notice the mismatch and drop it lazily), and recalculates.
    pub fn cancel(&self) {
        self.0.cancel_called.set(true);
        self.sync_registered_deadline();
        if let Some(status) = self.status() {
            status.recalculate();
        }
    }

    /// Exit the scope. `current_active` is the task's *current* active
    /// status (which should equal ours, unless something mis-nested).
    /// `exc` is whatever error is currently propagating out of the body, if
    /// any. Returns the (possibly replaced) error.
    pub fn close(
        &self,
        current_active: &CancelStatus,
        exc: Option<WeaveError>,
    ) -> Result<Option<WeaveError>, ScopeError> {
        let Some(our_status) = self.status() else {
            return Err(ScopeError::AlreadyExited);
        };

        if our_status.id() != current_active.id() {
            if our_status.0.abandoned_by_misnesting.get() {
                // Already reported by an enclosing scope; finish closing quietly.
                our_status.close();
                *self.0.status.borrow_mut() = None;
                self.sync_registered_deadline();
                return Ok(exc);
            }
            if !encloses(&our_status, current_active) {
                return Err(ScopeError::Internal(
                    "attempted to exit a cancel scope that isn't on the current task's stack"
                        .to_string(),
                ));
            }
            let outer = format!("CancelScope#{}", self.id());
            let inner = format!("CancelStatus#{}", current_active.id());
            our_status.close();
            *self.0.status.borrow_mut() = None;
            self.sync_registered_deadline();
            return Err(ScopeError::MisNested { outer, inner });
        }

        let mut exc = exc;
        if exc.is_some()
            && our_status.effectively_cancelled()
            && !our_status.parent_cancellation_is_visible_to_us()
        {
            exc = filter_cancelled(exc, &self.0.cancelled_caught);
        }

        our_status.close();
        *self.0.status.borrow_mut() = None;
        self.sync_registered_deadline();
        Ok(exc)
    }

    /// Runs `body` lexically inside this scope: enters on the current task,
    /// awaits it, and exits the scope whether `body` succeeded, failed, or
    /// was cancelled. This is the `async with cancel_scope:` equivalent for
    /// a one-shot scope that isn't already owned by a [`crate::nursery::Nursery`].
    ///
    /// Returns `Ok(Some(value))` if `body` ran to completion, `Ok(None)` if
    /// this scope cancelled `body` and swallowed the resulting `Cancelled`
    /// (there's no value to hand back in that case - check
    /// [`CancelScope::cancelled_caught`] to distinguish "body returned
    /// nothing meaningful" from "this scope actually fired"), or
    /// `Err` if `body` failed with something this scope didn't absorb.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<Option<T>, WeaveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WeaveError>>,
    {
        let task = context::active_task();
        let parent_status = task.cancel_status();
        let status = self.enter(Some(parent_status.clone()));
        task.enter_cancel_status(status);

        let outcome = body().await;
        let (value, exc) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };

        let current_active = task.cancel_status();
        let filtered = match self.close(&current_active, exc) {
            Ok(filtered) => filtered,
            Err(e) => Some(WeaveError::Scope(e)),
        };
        task.enter_cancel_status(parent_status);

        match filtered {
            None => Ok(value),
            Some(e) => Err(e),
        }
    }
}

fn encloses(this: &CancelStatus, other: &CancelStatus) -> bool {
    let mut cur = Some(other.clone());
    while let Some(c) = cur {
        if c.id() == this.id() {
            return true;
        }
        cur = c.parent();
    }
    false
}

fn filter_cancelled(exc: Option<WeaveError>, caught_flag: &Cell<bool>) -> Option<WeaveError> {
    match exc {
        None => None,
        Some(WeaveError::Cancelled) => {
            caught_flag.set(true);
            None
        }
        Some(WeaveError::Multi(multi)) => {
            let filtered = multi.filter(|e| {
                let hit = matches!(e, WeaveError::Cancelled);
                if hit {
                    caught_flag.set(true);
                }
                hit
            });
            filtered
        }
        Some(other) => Some(other),
    }
}

#[cfg(test)]
impl CancelScope {
    /// Test-only: bind this scope as the root status of a fresh tree,
    /// without going through a `Runner`.
    pub fn bind_root(&self) -> CancelStatus {
        self.enter(None)
    }

    /// Test-only: bind this scope as a child of `parent`.
    pub fn bind_child(&self, parent: &CancelStatus) -> CancelStatus {
        self.enter(Some(parent.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let scope = CancelScope::new(f64::INFINITY, false);
        let _status = scope.bind_root();
        scope.cancel();
        scope.cancel();
        assert!(scope.cancel_called());
    }

    #[test]
    fn close_filters_cancelled_when_effectively_cancelled() {
        let scope = CancelScope::new(f64::INFINITY, false);
        let status = scope.bind_root();
        scope.cancel();
        assert!(status.effectively_cancelled());

        let result = scope.close(&status, Some(WeaveError::Cancelled)).unwrap();
        assert!(result.is_none());
        assert!(scope.cancelled_caught());
    }

    #[test]
    fn close_leaves_other_errors_untouched() {
        let scope = CancelScope::new(f64::INFINITY, false);
        let status = scope.bind_root();
        scope.cancel();

        let result = scope
            .close(&status, Some(WeaveError::EndOfChannel))
            .unwrap();
        assert!(matches!(result, Some(WeaveError::EndOfChannel)));
    }

    #[test]
    fn run_returns_the_bodys_value_when_uncancelled() {
        let result = crate::executor::run(
            || async {
                let scope = CancelScope::new(f64::INFINITY, false);
                let v = scope.run(|| async { Ok::<_, WeaveError>(9) }).await?;
                Ok::<_, WeaveError>(v)
            },
            crate::config::RunConfig::new(),
        );
        assert_eq!(result.unwrap(), Some(9));
    }

    #[test]
    fn run_absorbs_its_own_cancellation() {
        let result = crate::executor::run(
            || async {
                let scope = CancelScope::new(f64::INFINITY, false);
                let v = scope
                    .run(|| async {
                        scope.cancel();
                        crate::trap::checkpoint().await?;
                        Ok::<_, WeaveError>(())
                    })
                    .await?;
                assert!(scope.cancelled_caught());
                Ok::<_, WeaveError>(v)
            },
            crate::config::RunConfig::new(),
        );
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn close_out_of_order_reports_misnesting_and_marks_subtree_abandoned() {
        let outer = CancelScope::new(f64::INFINITY, false);
        let outer_status = outer.bind_root();
        let inner = CancelScope::new(f64::INFINITY, false);
        let inner_status = inner.bind_child(&outer_status);

        // Closing `outer` while `inner_status` is still the task's active
        // status (i.e. `inner` was never closed first) is a mis-nested exit.
        let result = outer.close(&inner_status, None);
        assert!(matches!(result, Err(ScopeError::MisNested { .. })));

        // The abandoned subtree is forced into cancellation so any tasks
        // still parked under it get a chance to unwind.
        assert!(inner_status.effectively_cancelled());

        // A subsequent close of the already-abandoned inner scope stays
        // quiet instead of reporting a second mis-nesting error.
        let inner_result = inner.close(&inner_status, None);
        assert!(inner_result.is_ok());
    }
}
