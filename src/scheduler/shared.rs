//! State shared between the scheduler and all of its queues, plus the
//! overhead timer used for diagnostics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use coarsetime::Instant;
use parking_lot::Mutex;

/// Runtime measures of one graph run, for test and diagnostic purposes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerTimes {
    /// Total run time measured by the scheduler, in microseconds.
    pub total_time_us: u64,
    /// Total time spent inside node callbacks, in microseconds.
    pub node_time_us: u64,
}

impl SchedulerTimes {
    /// The fraction of the run not spent inside node callbacks. Only a
    /// meaningful measure when the graph ran on a single worker thread.
    pub fn overhead(&self) -> f64 {
        if self.total_time_us == 0 {
            return 0.0;
        }
        1.0 - (self.node_time_us as f64 / self.total_time_us as f64)
    }
}

/// Accumulates the total run time and the time spent running nodes, using a
/// coarse monotonic clock.
pub(crate) struct SchedulerTimer {
    run_start: Mutex<Option<Instant>>,
    total_run_time_us: AtomicU64,
    total_node_time_us: AtomicU64,
}

fn micros_since(start: Instant) -> u64 {
    let elapsed = Instant::now().duration_since(start);
    (elapsed.as_f64() * 1_000_000.0) as u64
}

impl SchedulerTimer {
    pub fn new() -> SchedulerTimer {
        SchedulerTimer {
            run_start: Mutex::new(None),
            total_run_time_us: AtomicU64::new(0),
            total_node_time_us: AtomicU64::new(0),
        }
    }

    pub fn start_run(&self) {
        *self.run_start.lock() = Some(Instant::now());
        self.total_node_time_us.store(0, Ordering::Relaxed);
    }

    pub fn end_run(&self) {
        if let Some(start) = self.run_start.lock().take() {
            self.total_run_time_us
                .store(micros_since(start), Ordering::Relaxed);
        }
    }

    /// Called immediately before invoking a node callback.
    pub fn start_node(&self) -> Instant {
        Instant::now()
    }

    /// Called immediately after a node callback returns.
    pub fn end_node(&self, start: Instant) {
        self.total_node_time_us
            .fetch_add(micros_since(start), Ordering::Relaxed);
    }

    pub fn scheduler_times(&self) -> SchedulerTimes {
        SchedulerTimes {
            total_time_us: self.total_run_time_us.load(Ordering::Relaxed),
            node_time_us: self.total_node_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Flags consulted by every scheduler queue.
pub(crate) struct SchedulerShared {
    /// The graph is winding down: all source nodes are closed at the next
    /// scheduling opportunity and no further sources are scheduled.
    pub stopping: AtomicBool,
    pub has_error: AtomicBool,
    pub timer: SchedulerTimer,
}

impl SchedulerShared {
    pub fn new() -> SchedulerShared {
        SchedulerShared {
            stopping: AtomicBool::new(false),
            has_error: AtomicBool::new(false),
            timer: SchedulerTimer::new(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    pub fn set_has_error(&self, has_error: bool) {
        self.has_error.store(has_error, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_of_empty_run_is_zero() {
        let times = SchedulerTimes::default();
        assert_eq!(times.overhead(), 0.0);
    }

    #[test]
    fn timer_accumulates_node_time() {
        let timer = SchedulerTimer::new();
        timer.start_run();
        let start = timer.start_node();
        timer.end_node(start);
        timer.end_run();
        let times = timer.scheduler_times();
        assert!(times.node_time_us <= times.total_time_us + 1_000);
    }
}
