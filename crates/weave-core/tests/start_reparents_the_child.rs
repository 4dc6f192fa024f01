//! Scenario: `nursery.start(child)` returns the value the child hands back
//! via `task_status.started(..)` while the child keeps running - now under
//! the target nursery rather than the temporary staging one `start` opened
//! for it.

use weave_core::{open_nursery, run, RunConfig, WeaveError};

#[test]
fn start_returns_early_while_the_child_keeps_running_under_the_target() {
    let result = run(
        || async {
            open_nursery(|nursery| async move {
                let value = nursery
                    .start(move |task_status| async move {
                        task_status.started(42);
                        // Keep running after handing off; this only completes
                        // under the *target* nursery's watch, not staging's.
                        weave_core::sleep(0.01).await?;
                        Ok::<_, WeaveError>(())
                    })
                    .await?;

                assert_eq!(value, 42);
                assert_eq!(
                    nursery.child_count(),
                    1,
                    "the child should have been reparented onto this nursery"
                );
                Ok::<_, WeaveError>(())
            })
            .await
        },
        RunConfig::new(),
    );
    assert!(result.is_ok(), "{result:?}");
}
