//! Structured join of sibling tasks: the "no orphan tasks" guarantee.
//!
//! A nursery owns a [`CancelScope`] and a set of child tasks. It doesn't
//! return until every child has exited, and it aggregates whatever errors
//! they raised into a single [`WeaveError`].

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::cancel_scope::CancelScope;
use crate::cancel_status::CancelStatus;
use crate::context;
use crate::error::{MultiError, ScopeError, WeaveError};
use crate::outcome::Outcome;
use crate::task::{erase_future, Task, TaskFuture, TaskInner};
use crate::trap::{wait_task_rescheduled, Abort};

pub struct NurseryInner {
    parent_task: Weak<TaskInner>,
    pub(crate) cancel_scope: CancelScope,
    cancel_status: CancelStatus,
    pub(crate) children: RefCell<Vec<Task>>,
    pending_excs: RefCell<Vec<WeaveError>>,
    closed: Cell<bool>,
    /// At most one `Cancelled` is recorded for the nursery's own scope
    /// cancellation, no matter how many times the parent re-parks while
    /// waiting for children to drain (it gets filtered away at scope close
    /// anyway, but there's no reason to let it grow unboundedly).
    self_cancel_recorded: Cell<bool>,
    /// True only while the parent task is actually parked inside
    /// `wait_until_quiescent`'s own wait. The parent may be suspended for
    /// plenty of unrelated reasons while the nursery body is still running
    /// (a `sleep`, a channel recv, `wait_all_tasks_blocked`...); without this
    /// flag `wake_parent_if_waiting` would reschedule the parent out from
    /// under whichever of those it's actually parked on.
    parent_waiting_in_aexit: Cell<bool>,
}

/// A structured-concurrency scope: tasks spawned into it cannot outlive it.
#[derive(Clone)]
pub struct Nursery(pub(crate) Rc<NurseryInner>);

impl Nursery {
    fn open_under(parent_task: &Task, parent_status: CancelStatus) -> Self {
        let cancel_scope = CancelScope::new(f64::INFINITY, false);
        let status = cancel_scope.enter(Some(parent_status));
        let inner = Rc::new(NurseryInner {
            parent_task: Rc::downgrade(&parent_task.0),
            cancel_scope,
            cancel_status: status,
            children: RefCell::new(Vec::new()),
            pending_excs: RefCell::new(Vec::new()),
            closed: Cell::new(false),
            self_cancel_recorded: Cell::new(false),
            parent_waiting_in_aexit: Cell::new(false),
        });
        parent_task.0.child_nurseries.borrow_mut().push(inner.clone());
        Nursery(inner)
    }

    pub fn cancel_scope(&self) -> &CancelScope {
        &self.0.cancel_scope
    }

    pub fn child_count(&self) -> usize {
        self.0.children.borrow().len()
    }

    /// Spawns a task into this nursery. Delegates the actual bookkeeping to
    /// the runner, which owns the flat task set.
    pub fn start_soon<F, E>(&self, fut: F) -> Result<(), WeaveError>
    where
        F: Future<Output = Result<(), E>> + 'static,
        E: std::error::Error + 'static,
    {
        self.start_soon_named("", erase_future(fut))
    }

    pub fn start_soon_named(&self, name: &str, fut: TaskFuture) -> Result<(), WeaveError> {
        if self.0.closed.get() {
            return Err(WeaveError::Scope(ScopeError::Internal(
                "tried to start_soon into a closed nursery".to_string(),
            )));
        }
        context::with_runner(|r| r.spawn_impl(self, name, fut));
        Ok(())
    }

    /// Opens a temporary staging nursery around a single spawn and hands the
    /// child a `TaskStatus<T>` proxy. Once the child calls `started(value)`,
    /// every task and cancel-status subtree under the staging nursery is
    /// reparented onto `self`, and `start` returns `value` while the child
    /// keeps running under `self`.
    pub async fn start<T, F, Fut>(&self, child: F) -> Result<T, WeaveError>
    where
        T: 'static,
        F: FnOnce(TaskStatus<T>) -> Fut + 'static,
        Fut: Future<Output = Result<(), WeaveError>> + 'static,
    {
        let task = context::active_task();
        let staging = Nursery::open_under(&task, task.cancel_status());
        task.enter_cancel_status(staging.0.cancel_status.clone());

        let started_value: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let task_status = TaskStatus {
            staging: staging.clone(),
            target: self.clone(),
            value: started_value.clone(),
        };
        staging.start_soon_named("", Box::pin(child(task_status)))?;

        let body_value: Option<()> = Some(());
        let agg = staging.close(body_value).await;

        match (started_value.borrow_mut().take(), agg) {
            (Some(v), None) => Ok(v),
            (Some(_), Some(e)) => Err(e),
            (None, Some(e)) => Err(e),
            (None, None) => Err(WeaveError::Scope(ScopeError::StartNeverCalled)),
        }
    }

    /// Moves every task and cancel-status subtree of `self` (a staging
    /// nursery) onto `target`. Detaches from the old side before attaching
    /// to the new one: attaching under an already-cancelled target may fire
    /// abort callbacks that touch the old side, so the old side must be
    /// clear first.
    fn reparent_onto(&self, target: &Nursery) {
        if self.0.cancel_status.effectively_cancelled() {
            // Staging is already cancelled; moving the child onto a target
            // with no cancelled scope left to catch that would strand the
            // cancellation. Let it die normally under staging instead.
            return;
        }
        let children: Vec<Task> = self.0.children.borrow_mut().drain(..).collect();
        for task in &children {
            task.0.parent_nursery.borrow_mut().replace(Rc::downgrade(&target.0));
        }
        target.0.children.borrow_mut().extend(children);

        let moving_statuses = self.0.cancel_status.child_statuses();
        for status in moving_statuses {
            status.set_parent(Some(target.0.cancel_status.clone()));
        }

        // The staging nursery may now be quiescent even though nothing
        // "finished" in the usual sense - the child just moved house. Its
        // parent could already be parked in `wait_until_quiescent`.
        if self.0.children.borrow().is_empty() {
            self.wake_parent_if_waiting();
        }
    }

    /// Called by a child's `TaskStatus::started`.
    fn accept_handoff(&self, target: &Nursery) {
        self.reparent_onto(target);
    }

    pub(crate) fn notify_child_finished(&self, task: &Task, outcome: Outcome<(), WeaveError>) {
        self.0.children.borrow_mut().retain(|t| t != task);
        if let Outcome::Error(e) = outcome {
            self.0.pending_excs.borrow_mut().push(e);
            self.0.cancel_scope.cancel();
        }
        if self.0.children.borrow().is_empty() {
            self.wake_parent_if_waiting();
        }
    }

    /// Only wakes the parent if it's actually parked waiting for this
    /// nursery's children to drain. The parent being merely "suspended" isn't
    /// enough: it could be blocked on something else entirely while the
    /// nursery body is still running, and rescheduling it here would resolve
    /// that unrelated wait early with the wrong outcome.
    fn wake_parent_if_waiting(&self) {
        if !self.0.parent_waiting_in_aexit.get() {
            return;
        }
        let Some(parent) = self.0.parent_task.upgrade() else {
            return;
        };
        if parent.is_suspended() {
            context::with_runner(|r| r.reschedule(Task(parent), Outcome::Value(())));
        }
    }

    async fn wait_until_quiescent(&self) {
        loop {
            if self.0.children.borrow().is_empty() {
                return;
            }
            let nursery = self.clone();
            self.0.parent_waiting_in_aexit.set(true);
            let result = wait_task_rescheduled(Box::new(move |_raise_cancel| {
                if !nursery.0.self_cancel_recorded.get() {
                    nursery.0.self_cancel_recorded.set(true);
                    nursery.0.pending_excs.borrow_mut().push(WeaveError::Cancelled);
                }
                Abort::Failed
            }))
            .await;
            self.0.parent_waiting_in_aexit.set(false);
            let _ = result;
        }
    }

    fn aggregate_pending(&self) -> Option<WeaveError> {
        let excs: Vec<WeaveError> = self.0.pending_excs.borrow_mut().drain(..).collect();
        match excs.len() {
            0 => None,
            1 => excs.into_iter().next(),
            _ => Some(WeaveError::Multi(MultiError::new(excs))),
        }
    }

    /// Runs the nested block, waits for all children, and closes the
    /// nursery's cancel scope, returning the aggregated error (if any).
    /// `body_value` is `Some(())` when the nested block completed without
    /// raising; `None` means the caller already recorded its error into
    /// `pending_excs` and cancelled the scope before calling this.
    async fn close(&self, body_value: Option<()>) -> Option<WeaveError> {
        let _ = body_value;
        self.wait_until_quiescent().await;

        let task = self
            .0
            .parent_task
            .upgrade()
            .expect("parent task gone while nursery still open");
        let task = Task(task);

        self.0.closed.set(true);
        let raw = self.aggregate_pending();
        let parent_status = self.0.cancel_status.parent();
        let current_active = task.cancel_status();
        let filtered = match self.0.cancel_scope.close(&current_active, raw) {
            Ok(exc) => exc,
            Err(e) => Some(WeaveError::Scope(e)),
        };
        if let Some(parent_status) = parent_status {
            task.enter_cancel_status(parent_status);
        }
        task.0
            .child_nurseries
            .borrow_mut()
            .retain(|n| !Rc::ptr_eq(n, &self.0));
        filtered
    }
}

/// A proxy handed to a task spawned via [`Nursery::start`], letting it
/// report a value back to the caller and move itself into the target
/// nursery.
pub struct TaskStatus<T> {
    staging: Nursery,
    target: Nursery,
    value: Rc<RefCell<Option<T>>>,
}

impl<T> TaskStatus<T> {
    pub fn started(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.staging.accept_handoff(&self.target);
    }
}

/// Opens a nursery, runs `body` inside it, and waits for every spawned
/// child to finish before returning. Errors from the body and from any
/// child are aggregated per [`MultiError`]'s rules.
pub async fn open_nursery<F, Fut, T>(body: F) -> Result<T, WeaveError>
where
    F: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = Result<T, WeaveError>>,
{
    let task = context::active_task();
    let nursery = Nursery::open_under(&task, task.cancel_status());
    task.enter_cancel_status(nursery.0.cancel_status.clone());

    let body_result = body(nursery.clone()).await;
    let (body_value, body_marker) = match body_result {
        Ok(v) => (Some(v), Some(())),
        Err(e) => {
            nursery.0.pending_excs.borrow_mut().push(e);
            nursery.0.cancel_scope.cancel();
            (None, None)
        }
    };

    let agg = nursery.close(body_marker).await;
    match (body_value, agg) {
        (Some(v), None) => Ok(v),
        (Some(_), Some(e)) => Err(e),
        (None, Some(e)) => Err(e),
        (None, None) => unreachable!("a body error was recorded but vanished during aggregation"),
    }
}
