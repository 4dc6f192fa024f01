//! Scenario: a scope whose deadline fires while a task inside it is asleep.

use weave_core::{run, CancelScope, RunConfig, WeaveError};

#[test]
fn deadline_cancels_a_sleeping_task() {
    let result = run(
        || async {
            let now = weave_core::current_time()?;
            let scope = CancelScope::new(now + 0.05, false);
            let outcome = scope.run(|| weave_core::sleep(10.0)).await?;
            assert!(outcome.is_none(), "sleep should have been cut short by the deadline");
            assert!(scope.cancelled_caught());
            Ok::<_, WeaveError>(())
        },
        RunConfig::new(),
    );
    assert!(result.is_ok(), "{result:?}");
}
