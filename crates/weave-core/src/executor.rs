//! The runner: scheduling queue, deadline expiry, task stepping, and the
//! native/guest entry points.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;

use crate::cancel_scope::CancelScope;
use crate::clock::{Clock, MAX_TIMEOUT};
use crate::config::RunConfig;
use crate::context::{self, TaskHandle};
use crate::deadlines::Deadlines;
use crate::error::WeaveError;
use crate::instruments::RunInstruments;
use crate::io_manager::{IoEvents, IoManager, NativeIoManager};
use crate::nursery::{open_nursery, Nursery};
use crate::outcome::Outcome;
use crate::stats::RunStatistics;
use crate::task::{Task, TaskFuture};
use crate::trap::Trap;

/// Which of the two idle-timeout shortcuts (§4.6 steps 2-3) shortened this
/// iteration's timeout, so step 7 knows what to do if the loop really did
/// stay idle.
#[derive(Clone, Copy)]
enum IdlePrimed {
    /// Wake every `waiting_for_idle` task registered at this absolute time.
    WaitingForIdle(f64),
    /// Fast-forward the clock by this many seconds instead of blocking.
    Autojump(f64),
}

/// The runner's mutable state. One instance per `run()`/`start_guest_run()`
/// call; installed as the thread's active runner via [`context::enter_runner`].
pub(crate) struct RunnerInner {
    runq: RefCell<VecDeque<Task>>,
    tasks: RefCell<FxHashMap<u64, Task>>,
    deadlines: RefCell<Deadlines>,
    /// Tasks parked via [`crate::idle::wait_all_tasks_blocked`], each with
    /// the absolute time (`now + cushion` at registration) it should be
    /// woken if the run loop is still idle by then.
    waiting_for_idle: RefCell<Vec<(f64, Task)>>,
    idle_primed: Cell<Option<IdlePrimed>>,
    is_guest: Cell<bool>,
    guest_tick_scheduled: Cell<bool>,
    ki_pending: Cell<bool>,
    pub(crate) main_task: RefCell<Option<Task>>,
    init_task: RefCell<Option<Task>>,
    finished: Cell<bool>,
    clock: Box<dyn Clock>,
    instruments: Box<dyn RunInstruments>,
    io: RefCell<Box<dyn IoManager>>,
    deterministic_scheduling: bool,
    #[allow(dead_code)]
    restrict_ki_to_checkpoints: bool,
}

impl RunnerInner {
    fn new(config: RunConfig, is_guest: bool) -> Rc<Self> {
        config.clock.start_clock();
        Rc::new(RunnerInner {
            runq: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(FxHashMap::default()),
            deadlines: RefCell::new(Deadlines::new()),
            waiting_for_idle: RefCell::new(Vec::new()),
            idle_primed: Cell::new(None),
            is_guest: Cell::new(is_guest),
            guest_tick_scheduled: Cell::new(false),
            ki_pending: Cell::new(false),
            main_task: RefCell::new(None),
            init_task: RefCell::new(None),
            finished: Cell::new(false),
            clock: config.clock,
            instruments: config.instruments,
            io: RefCell::new(Box::new(NativeIoManager)),
            deterministic_scheduling: config.deterministic_scheduling,
            restrict_ki_to_checkpoints: config.restrict_ki_to_checkpoints,
        })
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.clock.current_time()
    }

    /// Registers the current task in `waiting_for_idle`, to be woken once
    /// the run loop has gone `cushion` seconds without anything runnable.
    pub(crate) fn add_idle_waiter(&self, cushion: f64, task: Task) {
        let wake_at = self.current_time() + cushion;
        self.waiting_for_idle.borrow_mut().push((wake_at, task));
    }

    /// Removes a specific task from `waiting_for_idle` (used by its abort
    /// function, if it's cancelled before the cushion elapses).
    pub(crate) fn remove_idle_waiter(&self, task_id: u64) {
        self.waiting_for_idle
            .borrow_mut()
            .retain(|(_, t)| t.id().0 != task_id);
    }

    fn min_idle_wake_at(&self) -> Option<f64> {
        self.waiting_for_idle
            .borrow()
            .iter()
            .map(|(wake_at, _)| *wake_at)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))))
    }

    /// Wakes every task whose registered wake time has arrived.
    fn wake_idle_waiters(&self, primed_wake_at: f64) {
        let mut waiting = self.waiting_for_idle.borrow_mut();
        let mut to_wake = Vec::new();
        waiting.retain(|(wake_at, task)| {
            if *wake_at <= primed_wake_at {
                to_wake.push(task.clone());
                false
            } else {
                true
            }
        });
        drop(waiting);
        for task in to_wake {
            self.reschedule(task, Outcome::Value(()));
        }
    }

    /// The "might_change_registered_deadline" protocol: compute what should
    /// be registered for `scope` and swap the heap registration if it
    /// changed.
    pub(crate) fn sync_registered_deadline(&self, scope: &CancelScope) {
        let desired = scope.desired_registered_deadline();
        let current = scope.0.registered_deadline.get();
        if desired == current {
            return;
        }
        let mut deadlines = self.deadlines.borrow_mut();
        if current.is_finite() {
            deadlines.remove();
        }
        scope.0.registered_deadline.set(desired);
        if desired.is_finite() {
            deadlines.add(desired, scope.clone());
        }
        drop(deadlines);
        if self.is_guest.get() && desired < current {
            self.force_guest_tick_asap();
        }
    }

    /// Marks a task runnable with `outcome`, clearing any installed abort.
    pub(crate) fn reschedule(&self, task: Task, outcome: Outcome<(), WeaveError>) {
        task.set_resume_outcome(outcome);
        if self.is_guest.get() && self.runq.borrow().is_empty() {
            self.force_guest_tick_asap();
        }
        self.runq.borrow_mut().push_back(task);
    }

    fn force_guest_tick_asap(&self) {
        self.guest_tick_scheduled.set(true);
    }

    /// Implements `Nursery.start_soon`/`Runner.spawn_impl`: builds a task
    /// around `fut`, wires its cancel-status and nursery membership, and
    /// schedules it to start running with `Value(())`.
    pub(crate) fn spawn_impl(&self, nursery: &Nursery, name: &str, fut: TaskFuture) {
        let status = nursery
            .cancel_scope()
            .status()
            .expect("nursery scope not active");
        let task = Task::new(name, fut, status.clone());
        status.add_task(&task.0);
        *task.0.parent_nursery.borrow_mut() = Some(Rc::downgrade(&nursery.0));
        nursery.0.children.borrow_mut().push(task.clone());
        self.tasks.borrow_mut().insert(task.id().0, task.clone());
        self.instruments.task_spawned(&TaskHandle {
            id: task.id().0,
            name: task.name().to_string(),
        });
        self.reschedule(task, Outcome::Value(()));
    }

    /// Handles a task's coroutine finishing (successfully or not): removes
    /// it from bookkeeping and notifies whoever is waiting on it.
    fn task_exited(self: &Rc<Self>, task: Task, outcome: Outcome<(), WeaveError>) {
        self.tasks.borrow_mut().remove(&task.id().0);
        self.instruments.task_exited(&TaskHandle {
            id: task.id().0,
            name: task.name().to_string(),
        });

        // A status abandoned by mis-nesting with no surviving parent means
        // the scope tree was left corrupted with nowhere left to report the
        // damage; surface that instead of letting the task exit as if
        // nothing happened.
        let status = task.cancel_status();
        let outcome = if status.0.abandoned_by_misnesting.get() && status.parent().is_none() {
            let detail = match outcome {
                Outcome::Error(e) => format!(": {e}"),
                Outcome::Value(()) => String::new(),
            };
            Outcome::Error(WeaveError::Internal(format!(
                "task exited with its cancel-scope subtree abandoned by mis-nesting and no \
                 surviving parent status{detail}"
            )))
        } else {
            outcome
        };

        let is_init = self
            .init_task
            .borrow()
            .as_ref()
            .map(|t| *t == task)
            .unwrap_or(false);
        if is_init {
            if let Outcome::Error(e) = outcome {
                panic!("internal runtime error - this is a bug: init task failed: {e}");
            }
            self.finished.set(true);
            return;
        }

        let is_main = self
            .main_task
            .borrow()
            .as_ref()
            .map(|t| *t == task)
            .unwrap_or(false);
        let outcome_for_parent = if is_main { Outcome::Value(()) } else { outcome };

        if let Some(parent) = task
            .0
            .parent_nursery
            .borrow()
            .as_ref()
            .and_then(|w| w.upgrade())
        {
            Nursery(parent).notify_child_finished(&task, outcome_for_parent);
        }
    }

    /// Steps one task once, dispatching on the trap it yields or its final
    /// outcome.
    fn step_task(self: &Rc<Self>, task: Task) {
        let handle = TaskHandle {
            id: task.id().0,
            name: task.name().to_string(),
        };
        self.instruments.before_task_step(&handle);
        let guard = context::enter_task(task.clone());
        let result = task.step();
        drop(guard);
        self.instruments.after_task_step(&handle);

        match result {
            crate::task::StepResult::Trap(Trap::CancelShieldedCheckpoint) => {
                self.reschedule(task, Outcome::Value(()));
            }
            crate::task::StepResult::Trap(Trap::WaitTaskRescheduled(abort)) => {
                task.install_abort(abort);
                task.attempt_delivery_of_any_pending_cancel();
            }
            crate::task::StepResult::Trap(Trap::PermanentlyDetachCoroutineObject(outcome)) => {
                self.task_exited(task, outcome);
            }
            crate::task::StepResult::Finished(outcome) => {
                self.task_exited(task, outcome);
            }
        }
    }

    /// Read-only: how long until the next deadline fires, ignoring idle
    /// priming. Safe to call from `statistics()` without disturbing
    /// `idle_primed`, which `next_timeout` may set as a side effect.
    fn seconds_to_next_deadline(&self) -> f64 {
        let now = self.current_time();
        if !self.runq.borrow().is_empty() {
            return 0.0;
        }
        let deadline = self.deadlines.borrow_mut().next_deadline();
        (deadline - now).clamp(0.0, MAX_TIMEOUT)
    }

    /// The timeout the outer driver should wait on, per §4.6 steps 1-3:
    /// shortened by the nearest `waiting_for_idle` cushion or (failing
    /// that) the clock's autojump threshold, whichever applies. Records
    /// which shortcut fired (if any) in `idle_primed` for `run_iteration`'s
    /// step 7 to consult once it sees how the wait actually went.
    fn next_timeout(&self) -> f64 {
        let now = self.current_time();
        self.idle_primed.set(None);
        if !self.runq.borrow().is_empty() {
            return 0.0;
        }
        let deadline = self.deadlines.borrow_mut().next_deadline();
        let mut timeout = (deadline - now).clamp(0.0, MAX_TIMEOUT);

        if let Some(wake_at) = self.min_idle_wake_at() {
            let cushion_timeout = (wake_at - now).clamp(0.0, MAX_TIMEOUT);
            if cushion_timeout < timeout {
                timeout = cushion_timeout;
                self.idle_primed.set(Some(IdlePrimed::WaitingForIdle(wake_at)));
            }
        } else {
            let threshold = self.clock.autojump_threshold();
            if threshold < timeout {
                // Don't actually block for `timeout` seconds; fast-forward
                // the virtual clock by that much instead, once step 7
                // confirms the loop really did stay idle.
                self.idle_primed.set(Some(IdlePrimed::Autojump(timeout)));
                timeout = 0.0;
            }
        }
        timeout
    }

    /// One iteration of the run loop (§4.6). `events` is whatever the outer
    /// driver collected from `io_manager.get_events(timeout)`.
    fn run_iteration(self: &Rc<Self>, events: IoEvents) {
        let events_empty = events.is_empty();
        self.io.borrow_mut().process_events(events);

        let now = self.current_time();
        // `expire` only collects; the cancels happen after the borrow on
        // `self.deadlines` is released, since `CancelScope::cancel` re-enters
        // `sync_registered_deadline`, which needs its own borrow of the same
        // heap to re-register the (now infinite) deadline.
        let expired = self.deadlines.borrow_mut().expire(now);
        if !expired.is_empty() {
            self.idle_primed.set(None);
        }
        for scope in expired {
            scope.cancel();
        }

        if let Some(primed) = self.idle_primed.take() {
            if self.runq.borrow().is_empty() && events_empty {
                match primed {
                    IdlePrimed::WaitingForIdle(wake_at) => self.wake_idle_waiters(wake_at),
                    IdlePrimed::Autojump(gap) => self.clock.autojump(gap),
                }
            }
        }

        let mut batch: Vec<Task> = self.runq.borrow_mut().drain(..).collect();
        if !self.deterministic_scheduling && batch.len() > 1 {
            batch.shuffle(&mut rand::thread_rng());
        }
        for task in batch {
            self.step_task(task);
        }
    }

    pub(crate) fn statistics(&self) -> RunStatistics {
        RunStatistics {
            tasks_living: self.tasks.borrow().len(),
            tasks_runnable: self.runq.borrow().len(),
            seconds_to_next_deadline: self.seconds_to_next_deadline(),
            run_sync_soon_queue_size: 0,
            io_statistics: self.io.borrow().statistics(),
        }
    }

    /// KI delivery bypasses cancel scopes entirely: it targets only the main
    /// task's abort function. The keyboard-interrupt machinery proper
    /// (signal handler install/uninstall, the thread-safe entry queue used
    /// to deliver it) is an external collaborator out of scope here; this
    /// just tracks the flag the run loop would consult.
    pub(crate) fn deliver_ki(&self) {
        self.ki_pending.set(true);
    }

    pub(crate) fn ki_pending(&self) -> bool {
        self.ki_pending.get()
    }
}

/// Builds the init task: triple-nested system nurseries, per §4.6. The
/// innermost spawns the user's `main` coroutine; the middle and outer
/// levels are reserved for system tasks (the entry queue, I/O manager
/// helpers) that this core does not implement, since they're external
/// collaborators per the purpose/scope notes.
fn install_init_task(runner: &Rc<RunnerInner>, main_future: TaskFuture, main_name: String) {
    let root_scope = CancelScope::new(f64::INFINITY, false);
    let root_status = root_scope.enter(None);

    let init_body: TaskFuture = Box::pin(async move {
        open_nursery(|_entry_queue_host: Nursery| async move {
            open_nursery(|_system_nursery: Nursery| async move {
                open_nursery(|main_nursery: Nursery| async move {
                    main_nursery.start_soon_named(&main_name, main_future)?;
                    let spawned = main_nursery.child_count();
                    debug_assert_eq!(spawned, 1, "main nursery should hold exactly the main task");
                    if let Some(main_task) = main_nursery.0.children.borrow().first().cloned() {
                        context::with_runner(|r| {
                            *r.main_task.borrow_mut() = Some(main_task);
                        });
                    }
                    Ok(())
                })
                .await?;
                Ok(())
            })
            .await?;
            Ok(())
        })
        .await
    });

    let init_task = Task::new("init", init_body, root_status.clone());
    root_status.add_task(&init_task.0);
    *runner.init_task.borrow_mut() = Some(init_task.clone());
    runner.tasks.borrow_mut().insert(init_task.id().0, init_task.clone());
    runner.reschedule(init_task, Outcome::Value(()));
}

fn wrap_main<F, Fut, T>(
    main: F,
) -> (TaskFuture, Rc<RefCell<Option<Result<T, WeaveError>>>>)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, WeaveError>> + 'static,
    T: 'static,
{
    let result_slot: Rc<RefCell<Option<Result<T, WeaveError>>>> = Rc::new(RefCell::new(None));
    let slot_for_body = result_slot.clone();
    let fut: TaskFuture = Box::pin(async move {
        let r = main().await;
        *slot_for_body.borrow_mut() = Some(r);
        Ok(())
    });
    (fut, result_slot)
}

fn take_main_result<T>(slot: Rc<RefCell<Option<Result<T, WeaveError>>>>) -> Result<T, WeaveError> {
    slot.borrow_mut()
        .take()
        .unwrap_or_else(|| Err(WeaveError::Internal("main task never completed".to_string())))
}

/// Synchronous entry point: drives the run loop directly on the calling
/// thread until every task has exited, returning the main task's result.
/// Only one run may be active per thread at a time.
pub fn run<F, Fut, T>(main: F, config: RunConfig) -> Result<T, WeaveError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, WeaveError>> + 'static,
    T: 'static,
{
    let (main_future, result_slot) = wrap_main(main);

    let runner = RunnerInner::new(config, false);
    let _guard = context::enter_runner(runner.clone());
    install_init_task(&runner, main_future, "main".to_string());

    while !runner.finished.get() {
        let timeout = runner.next_timeout();
        runner.instruments.before_io_wait(timeout);
        let events = runner.io.borrow_mut().get_events(timeout);
        runner.instruments.after_io_wait();
        runner.run_iteration(events);
    }

    take_main_result(result_slot)
}

/// Guest-mode handle: a non-blocking entry point driven by callbacks on a
/// foreign host event loop rather than a direct synchronous loop.
pub struct GuestRun<T> {
    runner: Rc<RunnerInner>,
    result_slot: Rc<RefCell<Option<Result<T, WeaveError>>>>,
}

impl<T: 'static> GuestRun<T> {
    /// Advances the run loop by one tick. Returns the timeout (in seconds)
    /// the host should wait before feeding events back via
    /// [`GuestRun::deliver_events`], or `None` if the run has finished.
    pub fn tick_timeout(&self) -> Option<f64> {
        let _guard = context::enter_runner(self.runner.clone());
        if self.runner.finished.get() {
            None
        } else {
            Some(self.runner.next_timeout())
        }
    }

    /// Feeds a batch of I/O events (or an empty batch, for a bare timeout
    /// tick) back into the runner, advancing one iteration. If this tick
    /// finishes the run, the caller should follow up with
    /// [`GuestRun::take_result`].
    pub fn deliver_events(&self, events: IoEvents) {
        let _guard = context::enter_runner(self.runner.clone());
        if !self.runner.finished.get() {
            self.runner.run_iteration(events);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.runner.finished.get()
    }

    pub fn statistics(&self) -> RunStatistics {
        self.runner.statistics()
    }

    /// Takes the main task's result once `is_finished()` is true. Calling
    /// this is how a host fires its `done_callback`.
    pub fn take_result(&self) -> Result<T, WeaveError> {
        take_main_result(self.result_slot.clone())
    }
}

/// Non-blocking entry into guest mode: installs the runner and returns a
/// [`GuestRun`] handle the host drives via `tick_timeout`/`deliver_events`,
/// calling `take_result` (and its own `done_callback`) once
/// `GuestRun::is_finished()` is true.
pub fn start_guest_run<F, Fut, T>(main: F, config: RunConfig) -> GuestRun<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, WeaveError>> + 'static,
    T: 'static,
{
    let (main_future, result_slot) = wrap_main(main);
    let runner = RunnerInner::new(config, true);
    {
        let _guard = context::enter_runner(runner.clone());
        install_init_task(&runner, main_future, "main".to_string());
    }
    GuestRun { runner, result_slot }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::checkpoint;

    #[test]
    fn run_returns_main_tasks_value() {
        let result = run(|| async { Ok::<_, WeaveError>(42) }, RunConfig::new());
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn run_propagates_main_tasks_error() {
        let result: Result<(), WeaveError> =
            run(|| async { Err(WeaveError::EndOfChannel) }, RunConfig::new());
        assert!(matches!(result, Err(WeaveError::EndOfChannel)));
    }

    #[test]
    fn run_drives_a_checkpoint_to_completion() {
        let result = run(
            || async {
                checkpoint().await?;
                Ok::<_, WeaveError>(7)
            },
            RunConfig::new(),
        );
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn guest_run_completes_across_ticks() {
        let guest = start_guest_run(|| async { Ok::<_, WeaveError>(5) }, RunConfig::new());
        while let Some(timeout) = guest.tick_timeout() {
            assert_eq!(timeout, 0.0);
            guest.deliver_events(IoEvents::default());
            if guest.is_finished() {
                break;
            }
        }
        assert_eq!(guest.take_result().unwrap(), 5);
    }

    #[test]
    fn a_task_exiting_with_an_orphaned_abandoned_status_surfaces_as_internal_error() {
        // Uses a nursery child rather than the main task itself: the main
        // task's own result is captured straight off its `Ok`/`Err` return
        // value (see `wrap_main`), bypassing `task_exited`'s outcome
        // entirely, so only a child's exit actually exercises this path.
        let result = run(
            || async {
                open_nursery(|nursery| async move {
                    nursery.start_soon(async {
                        let task = context::active_task();
                        let outer = CancelScope::new(f64::INFINITY, false);
                        let outer_status = outer.enter(Some(task.cancel_status()));
                        task.enter_cancel_status(outer_status.clone());
                        let inner = CancelScope::new(f64::INFINITY, false);
                        let inner_status = inner.enter(Some(outer_status.clone()));
                        task.enter_cancel_status(inner_status);

                        // Exit `outer` while `inner` is still the task's
                        // active status: a mis-nested close. `outer`'s own
                        // status gets detached (`parent() == None`) and its
                        // whole subtree, including `inner_status`, marked
                        // abandoned.
                        let _ = outer.close(&task.cancel_status(), None);

                        // Simulate what a caller skipping parent
                        // reactivation on a mis-nested close would leave
                        // behind: the task's active status pointed at the
                        // now-orphaned, abandoned `outer_status` rather
                        // than a real surviving parent.
                        task.enter_cancel_status(outer_status);
                        Ok::<_, WeaveError>(())
                    })?;
                    Ok::<_, WeaveError>(())
                })
                .await
            },
            RunConfig::new(),
        );
        assert!(matches!(result, Err(WeaveError::Internal(_))), "{result:?}");
    }

    #[test]
    fn statistics_report_no_tasks_once_a_run_has_finished() {
        let guest = start_guest_run(|| async { Ok::<_, WeaveError>(()) }, RunConfig::new());
        while !guest.is_finished() {
            guest.deliver_events(IoEvents::default());
        }
        pretty_assertions::assert_eq!(
            guest.statistics(),
            RunStatistics {
                tasks_living: 0,
                tasks_runnable: 0,
                seconds_to_next_deadline: MAX_TIMEOUT,
                run_sync_soon_queue_size: 0,
                io_statistics: crate::io_manager::IoStatistics::default(),
            }
        );
    }
}
