//! The global run context: which task is currently being polled, and a
//! handle back to the runner driving it. Represented as thread-locals
//! (there is exactly one runner thread), installed on entry to `run`/
//! `start_guest_run` and torn down at exit. Reentrant `run()` calls on the
//! same thread are rejected.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::WeaveError;
use crate::executor::RunnerInner;
use crate::outcome::Outcome;
use crate::task::Task;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Task>> = const { RefCell::new(None) };
    static CURRENT_RUNNER: RefCell<Option<Rc<RunnerInner>>> = const { RefCell::new(None) };
}

pub(crate) struct RunnerGuard;

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        CURRENT_RUNNER.with(|cell| {
            cell.borrow_mut().take();
        });
    }
}

/// Installs `runner` as the active one for this thread. Panics if a run is
/// already active (no reentrancy).
pub(crate) fn enter_runner(runner: Rc<RunnerInner>) -> RunnerGuard {
    CURRENT_RUNNER.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(slot.is_none(), "a run is already active on this thread");
        *slot = Some(runner);
    });
    RunnerGuard
}

pub(crate) fn with_runner<F, R>(f: F) -> R
where
    F: FnOnce(&Rc<RunnerInner>) -> R,
{
    CURRENT_RUNNER.with(|cell| {
        let borrow = cell.borrow();
        let runner = borrow
            .as_ref()
            .expect("called outside of an active run()/start_guest_run()");
        f(runner)
    })
}

pub(crate) fn try_with_runner<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Rc<RunnerInner>) -> R,
{
    CURRENT_RUNNER.with(|cell| cell.borrow().as_ref().map(f))
}

pub(crate) struct TaskGuard {
    previous: Option<Task>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| {
            *cell.borrow_mut() = self.previous.take();
        });
    }
}

/// Sets `task` as the one currently being polled, restoring the previous
/// value (normally `None`) when the guard drops.
pub(crate) fn enter_task(task: Task) -> TaskGuard {
    let previous = CURRENT_TASK.with(|cell| cell.borrow_mut().replace(task));
    TaskGuard { previous }
}

/// The task currently being polled. Panics if called from outside a task's
/// own future (i.e. from outside the runner's `step`) - a programmer error
/// inside this crate, never user-reachable.
pub(crate) fn active_task() -> Task {
    CURRENT_TASK
        .with(|cell| cell.borrow().clone())
        .expect("no task is currently active")
}

pub(crate) fn take_resume_outcome() -> Outcome<(), WeaveError> {
    active_task().take_resume_outcome()
}

/// A cheap handle to the currently-running task, for introspection.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: u64,
    pub name: String,
}

/// The current task, for introspection. Returns `RunFinished` if called
/// outside an active run.
pub fn current_task() -> Result<TaskHandle, WeaveError> {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| TaskHandle {
                id: t.id().0,
                name: t.name().to_string(),
            })
            .ok_or(WeaveError::RunFinished)
    })
}

/// The effective deadline the current task would observe right now:
/// `-inf` if already cancelled, otherwise the narrowest enclosing deadline.
pub fn current_effective_deadline() -> Result<f64, WeaveError> {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| t.cancel_status().effective_deadline())
            .ok_or(WeaveError::RunFinished)
    })
}

/// The run's monotonic clock reading, plus its per-run random offset.
pub fn current_time() -> Result<f64, WeaveError> {
    try_with_runner(|r| r.current_time()).ok_or(WeaveError::RunFinished)
}

/// Requests delivery of a keyboard interrupt to the main task. A no-op if
/// called outside an active run.
pub fn deliver_ki() {
    try_with_runner(|r| r.deliver_ki());
}

/// Whether a keyboard interrupt is pending delivery.
pub fn current_ki_pending() -> Result<bool, WeaveError> {
    try_with_runner(|r| r.ki_pending()).ok_or(WeaveError::RunFinished)
}

/// A cheap handle to the currently-running task, suitable for building
/// synchronization primitives (like memory channels) outside this crate:
/// hang onto it in a waiter queue, then hand it to [`reschedule_task`] once
/// whatever it's waiting for becomes available.
pub fn current_task_handle() -> Result<Task, WeaveError> {
    CURRENT_TASK
        .with(|cell| cell.borrow().clone())
        .ok_or(WeaveError::RunFinished)
}

/// Wakes a specific task parked via [`crate::trap::wait_task_rescheduled`],
/// delivering `outcome`. Clears whatever abort function it installed; the
/// caller is responsible for having already removed `task` from its own
/// waiter bookkeeping.
pub fn reschedule_task(task: &Task, outcome: Result<(), WeaveError>) {
    with_runner(|r| r.reschedule(task.clone(), outcome.into()));
}
