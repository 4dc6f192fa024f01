//! Scenario: a rendezvous channel (buffer 0) with two sender clones; once
//! both close, a receiver parked on `recv` observes end-of-channel.

use weave_channel::{open_memory_channel, Capacity};
use weave_core::{open_nursery, run, RunConfig, WeaveError};

#[test]
fn channel_closes_once_every_sender_clone_is_gone() {
    let result = run(
        || async {
            let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
            let tx2 = tx.clone();

            open_nursery(|nursery| async move {
                nursery.start_soon(async move {
                    weave_core::sleep(0.01).await?;
                    tx.close();
                    tx2.close();
                    Ok::<_, WeaveError>(())
                })?;

                match rx.recv().await {
                    Err(WeaveError::EndOfChannel) => Ok(()),
                    other => panic!("expected EndOfChannel, got {other:?}"),
                }
            })
            .await
        },
        RunConfig::new(),
    );
    assert!(result.is_ok(), "{result:?}");
}
