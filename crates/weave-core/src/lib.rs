//! Structured-concurrency runtime core.
//!
//! A cooperative, single-threaded task scheduler that coordinates
//! concurrent work through a tree of nested [`CancelScope`]s and
//! [`Nursery`] instances, with deterministic cancellation semantics and a
//! minimal `async`/`Future`-based execution model.
//!
//! # Modules
//! - [`deadlines`] - min-heap of `(deadline, scope)` with lazy pruning
//! - [`cancel_status`] - the dynamic cancellation-propagation tree
//! - [`cancel_scope`] - the user-facing cancellation unit
//! - [`task`] - coroutine driver state for a single spawned task
//! - [`nursery`] - structured join of sibling tasks, with error aggregation
//! - [`executor`] - the scheduling queue and run loop, native and guest
//! - [`trap`] - the suspension primitives tasks are built on
//!
//! # Ambient stack
//! - [`error`] - the `WeaveError`/`ScopeError`/`MultiError` taxonomy
//! - [`config`] - `RunConfig`, the builder passed to `run`/`start_guest_run`
//! - [`instruments`] - the `RunInstruments` hook surface for embedders
//! - [`clock`] - the pluggable monotonic time source
//! - [`io_manager`] - the I/O reactor facade (external collaborator)
//! - [`stats`] - cheap run/channel statistics snapshots
//! - [`idle`] - test tooling for waiting on scheduler quiescence

pub mod cancel_scope;
pub mod cancel_status;
pub mod clock;
pub mod config;
pub mod context;
pub mod deadlines;
pub mod error;
pub mod executor;
pub mod idle;
pub mod instruments;
pub mod io_manager;
pub mod nursery;
pub mod outcome;
pub mod sleep;
pub mod stats;
pub mod task;
pub mod trap;
pub mod util;

pub use cancel_scope::CancelScope;
pub use cancel_status::CancelStatus;
pub use clock::{Clock, MockClock, SystemClock};
pub use config::RunConfig;
pub use context::{
    current_effective_deadline, current_ki_pending, current_task, current_task_handle,
    current_time, deliver_ki, reschedule_task, TaskHandle,
};
pub use deadlines::Deadlines;
pub use error::{MultiError, ScopeError, WeaveError};
pub use executor::{run, start_guest_run, GuestRun};
pub use idle::wait_all_tasks_blocked;
pub use instruments::{NullInstruments, RunInstruments};
pub use io_manager::{IoEvents, IoManager, IoStatistics, NativeIoManager};
pub use nursery::{open_nursery, Nursery, TaskStatus};
pub use outcome::Outcome;
pub use sleep::{sleep, sleep_until};
pub use stats::RunStatistics;
pub use task::{erase_future, Task, TaskFuture, TaskId};
pub use trap::{
    cancel_shielded_checkpoint, checkpoint, checkpoint_if_cancelled, wait_task_rescheduled, Abort,
    AbortFunc, Trap,
};
