//! Shared run status for the /api/status endpoint.
//! Updated by the Scheduler (scheduled, startup and manual runs).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::scheduler::RunOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub at: String,
    pub ok: bool,
    pub attempts: u32,
    /// Capture file on success, failure reason otherwise.
    pub detail: String,
}

/// Shared run metrics. Written by the scheduler, read by the API.
#[derive(Default)]
pub struct StatusBoard {
    /// True while the scheduler loop is active.
    pub loop_running: AtomicBool,
    pub captures_ok: AtomicU64,
    pub captures_failed: AtomicU64,
    /// Scheduler ticks where a due job failed.
    pub tick_errors: AtomicU64,
    last_run: Mutex<Option<LastRun>>,
    next_run: Mutex<Option<String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loop_running(&self, v: bool) {
        self.loop_running.store(v, Ordering::Relaxed);
    }

    pub fn loop_running(&self) -> bool {
        self.loop_running.load(Ordering::Relaxed)
    }

    pub fn record(&self, outcome: &RunOutcome) {
        let last = match outcome {
            RunOutcome::Completed { path, attempts } => {
                self.captures_ok.fetch_add(1, Ordering::Relaxed);
                LastRun {
                    at: chrono::Local::now().to_rfc3339(),
                    ok: true,
                    attempts: *attempts,
                    detail: path.display().to_string(),
                }
            }
            RunOutcome::Failed { attempts, reason } => {
                self.captures_failed.fetch_add(1, Ordering::Relaxed);
                LastRun {
                    at: chrono::Local::now().to_rfc3339(),
                    ok: false,
                    attempts: *attempts,
                    detail: reason.clone(),
                }
            }
        };
        if let Ok(mut slot) = self.last_run.lock() {
            *slot = Some(last);
        }
    }

    pub fn captures_ok(&self) -> u64 {
        self.captures_ok.load(Ordering::Relaxed)
    }

    pub fn captures_failed(&self) -> u64 {
        self.captures_failed.load(Ordering::Relaxed)
    }

    pub fn record_tick_error(&self) {
        self.tick_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_errors(&self) -> u64 {
        self.tick_errors.load(Ordering::Relaxed)
    }

    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_next_run(&self, next: Option<String>) {
        if let Ok(mut slot) = self.next_run.lock() {
            *slot = next;
        }
    }

    pub fn next_run(&self) -> Option<String> {
        self.next_run.lock().ok().and_then(|g| g.clone())
    }
}
