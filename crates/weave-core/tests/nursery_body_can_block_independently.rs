//! Scenario: while a nursery body is still running (hasn't reached its
//! implicit close yet), the parent task blocks on something that has
//! nothing to do with the nursery - here, its own `sleep`. A sibling child
//! finishing in the meantime must not reschedule the parent early: the
//! parent isn't parked waiting for children yet, it's parked waiting for
//! its deadline.

use weave_core::{open_nursery, run, sleep, MockClock, RunConfig, WeaveError};

#[test]
fn a_child_finishing_does_not_cut_a_sibling_sleep_short() {
    let clock = MockClock::new(0.0).with_autojump_threshold(0.01);
    let result = run(
        || async {
            open_nursery(|nursery| async move {
                let ran_to_completion = std::rc::Rc::new(std::cell::Cell::new(false));
                let flag = ran_to_completion.clone();
                nursery.start_soon(async move {
                    weave_core::checkpoint().await?;
                    flag.set(true);
                    Ok::<_, WeaveError>(())
                })?;

                // The child above races to completion almost immediately.
                // If a child finishing woke the parent out of whatever it's
                // blocked on (rather than only when the parent is actually
                // parked waiting for children), this sleep would return at
                // virtual time ~0 instead of ~1000.
                sleep(1000.0).await?;
                let elapsed = weave_core::current_time()?;
                assert!(
                    elapsed >= 999.0,
                    "sleep returned after only {elapsed} virtual seconds"
                );
                assert!(ran_to_completion.get());
                Ok::<_, WeaveError>(())
            })
            .await
        },
        RunConfig::new().with_clock(clock),
    );
    assert!(result.is_ok(), "{result:?}");
}
