//! Monotonic time source for the run loop.

use std::time::Instant;

/// The maximum time, in seconds, the run loop will ever block waiting for I/O
/// in one iteration, regardless of how far off the next deadline is.
pub const MAX_TIMEOUT: f64 = 24.0 * 60.0 * 60.0;

/// Pluggable clock; `run()` defaults to `SystemClock`. Implementers of
/// virtual-time test clocks can substitute their own.
pub trait Clock: std::fmt::Debug {
    /// Called once, right before the run loop starts.
    fn start_clock(&self) {}

    /// Current time in the clock's own units (seconds since some epoch that
    /// only this clock needs to know).
    fn current_time(&self) -> f64;

    /// How long to sleep, in seconds, to reach `deadline`. Clamped to
    /// `[0, MAX_TIMEOUT]` by the caller.
    fn deadline_to_sleep_time(&self, deadline: f64) -> f64 {
        deadline - self.current_time()
    }

    /// Idle-timeout threshold (seconds) beyond which the run loop should
    /// fast-forward this clock instead of actually blocking in
    /// `IoManager::get_events`. `+inf` (the default) disables autojump -
    /// correct for `SystemClock`, since real wall-clock time can't be
    /// fast-forwarded. A virtual-time test clock overrides this to some
    /// small value so deadline-heavy tests don't burn real wall-clock time
    /// waiting on timeouts nothing is going to interrupt.
    fn autojump_threshold(&self) -> f64 {
        f64::INFINITY
    }

    /// Advance the clock by `seconds` without sleeping. Only meaningful for
    /// a virtual-time clock that also overrides `autojump_threshold`; the
    /// default no-op is correct for `SystemClock`.
    fn autojump(&self, seconds: f64) {
        let _ = seconds;
    }
}

/// Wall-clock time plus a random per-run offset, so that absolute deadline
/// values are never accidentally comparable across separate runs.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
    offset: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        use rand::Rng;
        let offset = rand::thread_rng().gen_range(0.0..=10_000.0);
        SystemClock {
            start: Instant::now(),
            offset,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn current_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64() + self.offset
    }
}

/// A virtual-time clock for deterministic tests: `current_time` only ever
/// advances via explicit `jump`/`autojump` calls, never with real wall-clock
/// elapsed time.
#[derive(Debug)]
pub struct MockClock {
    now: std::cell::Cell<f64>,
    autojump_threshold: std::cell::Cell<f64>,
}

impl MockClock {
    pub fn new(start: f64) -> Self {
        MockClock {
            now: std::cell::Cell::new(start),
            autojump_threshold: std::cell::Cell::new(f64::INFINITY),
        }
    }

    /// Fast-forward whenever the run loop is otherwise idle for longer than
    /// `threshold` seconds, instead of actually waiting.
    pub fn with_autojump_threshold(self, threshold: f64) -> Self {
        self.autojump_threshold.set(threshold);
        self
    }

    pub fn jump(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for MockClock {
    fn current_time(&self) -> f64 {
        self.now.get()
    }

    fn autojump_threshold(&self) -> f64 {
        self.autojump_threshold.get()
    }

    fn autojump(&self, seconds: f64) {
        self.jump(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_time_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.current_time();
        let b = clock.current_time();
        assert!(b >= a);
    }

    #[test]
    fn mock_clock_only_advances_on_jump() {
        let clock = MockClock::new(0.0);
        assert_eq!(clock.current_time(), 0.0);
        clock.jump(5.0);
        assert_eq!(clock.current_time(), 5.0);
        clock.autojump(2.5);
        assert_eq!(clock.current_time(), 7.5);
    }
}
