//! Per-task and per-iteration instrumentation hooks.
//!
//! Named-hook registry from the source, reduced to a trait: embedders wire
//! in their own tracing/metrics by implementing [`RunInstruments`] and
//! passing it to [`crate::config::RunConfig::with_instruments`]. This crate
//! does not depend on a tracing backend itself.

use crate::context::TaskHandle;

pub trait RunInstruments {
    fn before_task_step(&self, _task: &TaskHandle) {}
    fn after_task_step(&self, _task: &TaskHandle) {}
    fn before_io_wait(&self, _timeout: f64) {}
    fn after_io_wait(&self) {}
    fn task_spawned(&self, _task: &TaskHandle) {}
    fn task_exited(&self, _task: &TaskHandle) {}
}

/// Default: does nothing, costs nothing.
#[derive(Debug, Default)]
pub struct NullInstruments;

impl RunInstruments for NullInstruments {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_instruments_is_inert() {
        let instruments = NullInstruments;
        let handle = TaskHandle { id: 1, name: "t".to_string() };
        instruments.before_task_step(&handle);
        instruments.after_task_step(&handle);
        instruments.before_io_wait(1.0);
        instruments.after_io_wait();
        instruments.task_spawned(&handle);
        instruments.task_exited(&handle);
    }
}
