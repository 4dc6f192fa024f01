//! The coroutine driver: a task's future, its resume/abort slots, and the
//! cancel-status link that ties it into the propagation tree.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancel_status::CancelStatus;
use crate::context;
use crate::error::WeaveError;
use crate::nursery::NurseryInner;
use crate::outcome::Outcome;
use crate::trap::{self, Abort, AbortFunc, Trap};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A task's future: boxed and type-erased so `Runner::tasks` can hold a
/// flat, heterogeneous collection. Errors are boxed into `WeaveError::Task`
/// at the boundary so the nursery that joins this task only ever has to
/// reason about `WeaveError`.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), WeaveError>>>>;

/// Wraps a user-supplied fallible future into the shape the runner expects.
pub fn erase_future<F, E>(fut: F) -> TaskFuture
where
    F: Future<Output = Result<(), E>> + 'static,
    E: std::error::Error + 'static,
{
    Box::pin(async move { fut.await.map_err(|e| WeaveError::Task(Box::new(e))) })
}

pub(crate) enum StepResult {
    Trap(Trap),
    Finished(Outcome<(), WeaveError>),
}

pub struct TaskInner {
    pub id: TaskId,
    pub name: String,
    coroutine: RefCell<Option<TaskFuture>>,
    resume_outcome: RefCell<Option<Outcome<(), WeaveError>>>,
    abort_func: RefCell<Option<AbortFunc>>,
    cancel_status: RefCell<CancelStatus>,
    pub(crate) parent_nursery: RefCell<Option<Weak<NurseryInner>>>,
    pub(crate) child_nurseries: RefCell<Vec<Rc<NurseryInner>>>,
    /// Back-reference to the `Rc` this very struct lives in, so methods
    /// taking only `&self` (like `attempt_delivery_of_any_pending_cancel`)
    /// can still hand a cloneable `Task` handle to `Runner::reschedule`.
    /// Set once, right after construction, in `Task::new`.
    self_weak: RefCell<Weak<TaskInner>>,
}

impl TaskInner {
    pub fn cancel_status(&self) -> CancelStatus {
        self.cancel_status.borrow().clone()
    }

    pub(crate) fn set_cancel_status(&self, status: CancelStatus) {
        *self.cancel_status.borrow_mut() = status;
    }

    /// `runnable` iff a resume outcome has been recorded; `suspended` iff an
    /// abort function is installed. Exactly one of the two holds between
    /// creation and exit.
    pub fn is_runnable(&self) -> bool {
        self.resume_outcome.borrow().is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.abort_func.borrow().is_some()
    }

    pub(crate) fn set_resume_outcome(&self, outcome: Outcome<(), WeaveError>) {
        assert!(
            !self.is_runnable(),
            "task {} rescheduled while already runnable",
            self.id
        );
        self.abort_func.borrow_mut().take();
        *self.resume_outcome.borrow_mut() = Some(outcome);
    }

    pub(crate) fn install_abort(&self, abort: AbortFunc) {
        *self.abort_func.borrow_mut() = Some(abort);
    }

    pub(crate) fn has_abort(&self) -> bool {
        self.abort_func.borrow().is_some()
    }

    /// Polls the coroutine exactly once, returning either the trap it left
    /// behind or its final outcome.
    ///
    /// The recorded resume outcome must stay in place *during* the poll, not
    /// be taken beforehand: a `WaitTaskRescheduled` future's second poll
    /// reads it itself, via `take_resume_outcome`, to recover the value
    /// `set_resume_outcome` actually delivered (e.g. `Error(Cancelled)`).
    /// Whatever the poll didn't consume that way (a pure yield point like
    /// `CancelShieldedCheckpoint`, or a task's very first poll, neither of
    /// which read the slot) is discarded afterward, so the runnable flag
    /// doesn't linger past this step.
    pub(crate) fn step(&self) -> StepResult {
        debug_assert!(
            self.resume_outcome.borrow().is_some(),
            "stepped a task with no resume outcome"
        );
        let result = self.poll_once();
        self.resume_outcome.borrow_mut().take();
        result
    }

    fn poll_once(&self) -> StepResult {
        use std::task::{Context, Poll};
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.coroutine.borrow_mut();
        let fut = slot
            .as_mut()
            .expect("task polled after it already finished");

        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(result) => {
                drop(slot);
                *self.coroutine.borrow_mut() = None;
                StepResult::Finished(result.into())
            }
            Poll::Pending => match trap::take_trap() {
                Some(trap) => StepResult::Trap(trap),
                None => StepResult::Finished(Outcome::Error(WeaveError::Internal(
                    "task suspended without yielding a recognized trap".to_string(),
                ))),
            },
        }
    }

    /// Consumes the resume outcome left by `set_resume_outcome`. Must only
    /// be called from within a `WaitTaskRescheduled` future's second poll.
    pub(crate) fn take_resume_outcome(&self) -> Outcome<(), WeaveError> {
        self.resume_outcome.borrow_mut().take().unwrap_or(Outcome::Value(()))
    }

    /// If parked with an abort function and effectively cancelled, attempt
    /// delivery. One attempt per blocking call: the abort function is
    /// cleared either way.
    ///
    /// On success this must go through `Runner::reschedule`, not just set
    /// the local resume slot: `reschedule` is also what pushes the task
    /// onto `runq`, and `run_iteration` only ever steps tasks it finds
    /// there. Setting the slot directly would leave the task looking
    /// "runnable" (`is_runnable()` true) while never actually being
    /// stepped again.
    pub fn attempt_delivery_of_any_pending_cancel(&self) {
        if !self.has_abort() {
            return;
        }
        if !self.cancel_status().effectively_cancelled() {
            return;
        }
        let abort = self.abort_func.borrow_mut().take();
        let Some(abort) = abort else { return };
        if let Abort::Succeeded = abort(true) {
            let handle = Task(self
                .self_weak
                .borrow()
                .upgrade()
                .expect("task dropped while still installed as an abort target"));
            context::with_runner(|r| r.reschedule(handle, Outcome::Error(WeaveError::Cancelled)));
        }
        // Abort::Failed: the waiting primitive keeps responsibility; the
        // task stays parked with no abort function until something else
        // reschedules it.
    }
}

/// Cheap-to-clone handle to a task.
#[derive(Clone)]
pub struct Task(pub Rc<TaskInner>);

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Task {}

impl Deref for Task {
    type Target = TaskInner;
    fn deref(&self) -> &TaskInner {
        &self.0
    }
}

impl Task {
    pub fn new(name: impl Into<String>, coroutine: TaskFuture, cancel_status: CancelStatus) -> Self {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let inner = Rc::new(TaskInner {
            id,
            name: name.into(),
            coroutine: RefCell::new(Some(coroutine)),
            resume_outcome: RefCell::new(None),
            abort_func: RefCell::new(None),
            cancel_status: RefCell::new(cancel_status),
            parent_nursery: RefCell::new(None),
            child_nurseries: RefCell::new(Vec::new()),
            self_weak: RefCell::new(Weak::new()),
        });
        *inner.self_weak.borrow_mut() = Rc::downgrade(&inner);
        Task(inner)
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Moves this task from its current cancel status to `new_status`:
    /// deregisters from the old node's `tasks` set and registers with the
    /// new one, so `recalculate` on either node sees the right membership.
    pub(crate) fn enter_cancel_status(&self, new_status: CancelStatus) {
        let old = self.cancel_status();
        old.remove_task(self.id().0);
        new_status.add_task(&self.0);
        self.set_cancel_status(new_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel_scope::CancelScope;

    fn root_status() -> CancelStatus {
        let scope = CancelScope::new(f64::INFINITY, false);
        scope.bind_root()
    }

    #[test]
    fn new_task_is_runnable_and_not_suspended() {
        let fut = erase_future::<_, WeaveError>(async { Ok(()) });
        let task = Task::new("t", fut, root_status());
        task.set_resume_outcome(Outcome::Value(()));
        assert!(task.is_runnable());
        assert!(!task.is_suspended());
    }

    #[test]
    fn step_runs_a_ready_future_to_completion() {
        let fut = erase_future::<_, WeaveError>(async { Ok(()) });
        let task = Task::new("t", fut, root_status());
        task.set_resume_outcome(Outcome::Value(()));
        match task.step() {
            StepResult::Finished(Outcome::Value(())) => {}
            _ => panic!("expected immediate completion"),
        }
    }
}
