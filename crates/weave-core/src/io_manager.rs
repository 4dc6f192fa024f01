//! The I/O manager facade: a reactor for sockets, timers, and signals.
//!
//! Deliberately out of scope per the runtime's own design split (platform
//! polling is a separate concern); the runner only needs this interface. A
//! [`NativeIoManager`] stub is provided so `run()` has something to drive
//! when no real reactor is wired in: it sleeps for the requested timeout and
//! reports no events, which is correct (if inert) for a run that never
//! touches actual I/O.

use std::thread;
use std::time::Duration;

/// Opaque batch of I/O readiness events.
#[derive(Debug, Default)]
pub struct IoEvents {
    /// `true` if the wait returned because something external happened
    /// (as opposed to merely timing out). Drives the "events truthiness"
    /// idle-priming guard.
    pub woken: bool,
}

impl IoEvents {
    pub fn is_empty(&self) -> bool {
        !self.woken
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoStatistics {
    pub tasks_waiting: usize,
}

pub trait IoManager {
    /// Block for up to `timeout` seconds waiting for readiness. May return
    /// early if `force_wakeup` was called concurrently.
    fn get_events(&mut self, timeout: f64) -> IoEvents;

    /// Apply a batch of events, rescheduling whatever tasks they unblock.
    fn process_events(&mut self, events: IoEvents);

    fn statistics(&self) -> IoStatistics;

    /// Interrupt a blocked `get_events` call from another thread.
    fn force_wakeup(&self);

    fn close(&mut self);
}

/// A reactor that performs no actual I/O: `get_events` just sleeps. Useful
/// as the default for runs that only exercise scopes, nurseries, and memory
/// channels (none of which need real sockets).
#[derive(Debug, Default)]
pub struct NativeIoManager;

impl IoManager for NativeIoManager {
    fn get_events(&mut self, timeout: f64) -> IoEvents {
        if timeout > 0.0 {
            thread::sleep(Duration::from_secs_f64(timeout));
        }
        IoEvents::default()
    }

    fn process_events(&mut self, _events: IoEvents) {}

    fn statistics(&self) -> IoStatistics {
        IoStatistics::default()
    }

    fn force_wakeup(&self) {}

    fn close(&mut self) {}
}
