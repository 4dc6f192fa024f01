//! Sleeping: the simplest possible consumer of the deadline machinery. A
//! sleep is just a scope whose only way to end is its own deadline firing.

use crate::cancel_scope::CancelScope;
use crate::context;
use crate::error::WeaveError;
use crate::trap::{wait_task_rescheduled, Abort};

/// Suspends the current task until `deadline` (per [`context::current_time`])
/// or until an enclosing scope is cancelled, whichever comes first.
pub async fn sleep_until(deadline: f64) -> Result<(), WeaveError> {
    let scope = CancelScope::new(deadline, false);
    scope
        .run(|| wait_task_rescheduled(Box::new(|_raise_cancel| Abort::Succeeded)))
        .await
        .map(|_| ())
}

/// Suspends the current task for `seconds`.
pub async fn sleep(seconds: f64) -> Result<(), WeaveError> {
    let now = context::current_time()?;
    sleep_until(now + seconds).await
}
