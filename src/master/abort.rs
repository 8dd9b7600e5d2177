// src/master/abort.rs

//! Run-wide abort flag.
//!
//! Only the signal listeners and the wall-time timer set the flag. The
//! scheduler loop reads it once per iteration and while polling for results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::Result;

#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Background tasks that may raise an [`AbortFlag`]. Dropping the guard
/// stops them.
#[derive(Debug, Default)]
pub struct AbortTriggers {
    tasks: Vec<JoinHandle<()>>,
}

impl AbortTriggers {
    /// Raise `flag` on SIGTERM or SIGINT.
    pub fn on_signals(mut self, flag: &AbortFlag) -> Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let flag = flag.clone();

        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => error!("caught SIGTERM"),
                _ = sigint.recv() => error!("caught SIGINT"),
            }
            flag.raise();
        }));
        Ok(self)
    }

    /// Raise `flag` once `minutes` of wall time have passed. Non-positive
    /// budgets are ignored.
    pub fn on_wall_time(mut self, flag: &AbortFlag, minutes: f64) -> Self {
        if minutes <= 0.0 {
            return self;
        }
        let Ok(budget) = Duration::try_from_secs_f64(minutes * 60.0) else {
            warn!(minutes, "max wall time out of range; ignoring");
            return self;
        };
        info!(minutes, "setting max wall time");
        let flag = flag.clone();

        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            error!(minutes, "max wall time reached");
            flag.raise();
        }));
        self
    }
}

impl Drop for AbortTriggers {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
