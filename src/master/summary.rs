// src/master/summary.rs

//! End-of-run accounting and the `cluster-summary` record.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};

/// Counters the scheduler keeps while running.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Task attempts dispatched.
    pub submitted: u64,
    /// Attempts that exited 0.
    pub succeeded: u64,
    /// Attempts that exited non-zero.
    pub failed: u64,
    /// Sum of reported task runtimes, seconds.
    pub runtime: f64,
}

impl RunStats {
    pub fn record_result(&mut self, exit_code: i32, runtime: f64) {
        self.runtime += runtime;
        if exit_code == 0 {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Fraction of available slot time spent running tasks.
pub fn utilization(runtime: f64, wall: Duration, slots: usize) -> f64 {
    let denom = wall.as_secs_f64() * slots as f64;
    if runtime <= 0.0 || denom <= 0.0 {
        return 0.0;
    }
    runtime / denom
}

/// The provenance line written to the task stdout sink at the end of a run.
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub failed: bool,
    pub stats: RunStats,
    pub start: DateTime<Local>,
    pub duration: Duration,
    pub pid: u32,
    pub app: String,
    pub slots: usize,
    pub cpus: u32,
}

impl fmt::Display for ClusterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[cluster-summary stat=\"{}\", tasks={}, succeeded={}, failed={}, extra=0, \
             start=\"{}\", duration={:.3}, pid={}, app=\"{}\", runtime={:.3}, slots={}, cpus={}]",
            if self.failed { "failed" } else { "ok" },
            self.stats.submitted,
            self.stats.succeeded,
            self.stats.failed,
            self.start.to_rfc3339_opts(SecondsFormat::Millis, false),
            self.duration.as_secs_f64(),
            self.pid,
            self.app,
            self.stats.runtime,
            self.slots,
            self.cpus,
        )
    }
}
