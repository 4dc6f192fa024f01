//! Scenario: two children spawned into the same nursery both fail
//! concurrently; the nursery's exit aggregates exactly those two leaves.

use std::fmt;

use weave_core::{open_nursery, run, RunConfig, WeaveError};

#[derive(Debug)]
struct TestError(&'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

#[test]
fn nursery_aggregates_errors_from_concurrent_children() {
    let result = run(
        || async {
            let outcome = open_nursery(|nursery| async move {
                nursery.start_soon(async { Err::<(), _>(TestError("a")) })?;
                nursery.start_soon(async { Err::<(), _>(TestError("b")) })?;
                Ok::<(), WeaveError>(())
            })
            .await;

            match outcome {
                Err(WeaveError::Multi(multi)) => {
                    let messages: Vec<String> =
                        multi.leaves().iter().map(|e| e.to_string()).collect();
                    assert_eq!(messages.len(), 2);
                    assert!(messages.contains(&"a".to_string()));
                    assert!(messages.contains(&"b".to_string()));
                }
                other => panic!("expected a Multi error with two leaves, got {other:?}"),
            }
            Ok::<_, WeaveError>(())
        },
        RunConfig::new(),
    );
    assert!(result.is_ok(), "{result:?}");
}
