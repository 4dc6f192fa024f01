//! Cheap, allocation-light snapshots for logging or tests.

use crate::io_manager::IoStatistics;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStatistics {
    pub tasks_living: usize,
    pub tasks_runnable: usize,
    pub seconds_to_next_deadline: f64,
    pub run_sync_soon_queue_size: usize,
    pub io_statistics: IoStatistics,
}
