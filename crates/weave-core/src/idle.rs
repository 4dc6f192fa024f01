//! Testing helper: wait until the run loop has had nothing runnable for a
//! stretch of time, rather than for some specific event.
//!
//! This is the scheduler-introspection counterpart to [`crate::sleep`]: a
//! sleep waits for a deadline regardless of what else is going on, while
//! [`wait_all_tasks_blocked`] waits for the *scheduler itself* to go idle,
//! which is what deterministic tests of concurrent code actually want
//! ("has the other task reached its checkpoint yet?") instead of a
//! guessed-at sleep duration.

use crate::context;
use crate::error::WeaveError;
use crate::trap::{wait_task_rescheduled, Abort};

/// Suspends the current task until the run loop has gone `cushion` seconds
/// with nothing else runnable (no task stepped, no I/O event delivered), or
/// until cancelled. A `cushion` of `0.0` wakes as soon as the *next*
/// iteration finds the loop idle.
///
/// Pairs naturally with a [`crate::clock::MockClock::with_autojump_threshold`]
/// virtual clock in tests: the run loop fast-forwards through any deadline
/// nothing is waiting to observe, so `wait_all_tasks_blocked` still returns
/// promptly even if some other task is sleeping for a long virtual time.
pub async fn wait_all_tasks_blocked(cushion: f64) -> Result<(), WeaveError> {
    crate::trap::checkpoint_if_cancelled().await?;

    let task = context::current_task_handle()?;
    let id = task.id().0;
    context::with_runner(|r| r.add_idle_waiter(cushion, task));

    wait_task_rescheduled(Box::new(move |_raise_cancel| {
        context::with_runner(|r| r.remove_idle_waiter(id));
        Abort::Succeeded
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::RunConfig;
    use crate::executor::run;
    use crate::nursery::open_nursery;

    #[test]
    fn wakes_once_the_loop_actually_goes_idle() {
        let result = run(
            || async {
                open_nursery(|nursery| async move {
                    let ran_to_completion = std::rc::Rc::new(std::cell::Cell::new(false));
                    let flag = ran_to_completion.clone();
                    nursery.start_soon(async move {
                        crate::trap::checkpoint().await?;
                        flag.set(true);
                        Ok::<_, WeaveError>(())
                    })?;

                    wait_all_tasks_blocked(0.0).await?;
                    assert!(
                        ran_to_completion.get(),
                        "the sibling task should have already finished before we woke"
                    );
                    Ok::<_, WeaveError>(())
                })
                .await
            },
            RunConfig::new(),
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn autojump_clock_fast_forwards_past_an_unobserved_sleep() {
        // Nothing ever calls `wait_all_tasks_blocked` here: the nursery
        // parking on its one sleeping child is itself enough to take the
        // run loop idle, which is what should trigger the autojump.
        let clock = MockClock::new(0.0).with_autojump_threshold(0.01);
        let result = run(
            || async {
                open_nursery(|nursery| async move {
                    nursery.start_soon(async {
                        crate::sleep::sleep(1000.0).await?;
                        Ok::<_, WeaveError>(())
                    })?;
                    Ok::<_, WeaveError>(())
                })
                .await
            },
            RunConfig::new().with_clock(clock),
        );
        assert!(result.is_ok(), "{result:?}");
    }
}
