//! Run configuration, built the way `RuntimeConfig` is in the teacher crate:
//! a `Default` plus `with_*` builder methods.

use crate::clock::{Clock, SystemClock};
use crate::instruments::{NullInstruments, RunInstruments};

pub struct RunConfig {
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) instruments: Box<dyn RunInstruments>,
    pub(crate) restrict_ki_to_checkpoints: bool,
    pub(crate) deterministic_scheduling: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            clock: Box::new(SystemClock::new()),
            instruments: Box::new(NullInstruments),
            restrict_ki_to_checkpoints: false,
            deterministic_scheduling: false,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_instruments(mut self, instruments: impl RunInstruments + 'static) -> Self {
        self.instruments = Box::new(instruments);
        self
    }

    pub fn with_restrict_ki_to_checkpoints(mut self, value: bool) -> Self {
        self.restrict_ki_to_checkpoints = value;
        self
    }

    /// Test hook: disables the per-iteration batch shuffle (§9's
    /// "Randomized scheduling" note) so tests can assert on ordering.
    pub fn with_deterministic_scheduling(mut self, value: bool) -> Self {
        self.deterministic_scheduling = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let config = RunConfig::new()
            .with_restrict_ki_to_checkpoints(true)
            .with_deterministic_scheduling(true);
        assert!(config.restrict_ki_to_checkpoints);
        assert!(config.deterministic_scheduling);
    }
}
