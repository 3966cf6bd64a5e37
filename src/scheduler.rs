//! Triggered capture runs plus the daily maintenance jobs.
//!
//! The loop polls on a fixed tick. Each job keeps its next due time; a due job
//! runs inline on the loop's task and is then re-armed from the current time.
//! Manual runs are spawned and serialize with scheduled ones through the
//! pipeline's run lock.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, TimeDelta};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::api::health::StatusBoard;
use crate::config::{
    parse_hhmm, RetentionPolicy, RetryConfig, ScheduleConfig, BACKUP_CHECK_TIME, CLEANUP_TIME,
    RETRY_DELAY_SECS, TICK_ERROR_BACKOFF_SECS, TICK_INTERVAL_SECS,
};
use crate::error::{AppError, Result};
use crate::notify::{Notifier, NotifyKind};
use crate::pipeline::{CaptureDepth, CapturePipeline};
use crate::retention::RetentionManager;

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { path: PathBuf, attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: RetryConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            max_attempts: cfg.max_attempts,
            delay: Duration::from_secs(RETRY_DELAY_SECS),
        }
    }

    fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Run `attempt` until it succeeds or the policy's attempts are used up,
/// sleeping `policy.delay` between failures.
pub async fn run_with_retry<F, Fut>(policy: RetryPolicy, mut attempt: F) -> RunOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PathBuf>>,
{
    let max = policy.attempts();
    let mut reason = String::new();

    for n in 1..=max {
        match attempt(n).await {
            Ok(path) => return RunOutcome::Completed { path, attempts: n },
            Err(e) => {
                reason = e.to_string();
                if n < max {
                    warn!("Attempt {n}/{max} failed: {e}; retrying in {:?}", policy.delay);
                    sleep(policy.delay).await;
                } else {
                    error!("Attempt {n}/{max} failed: {e}");
                }
            }
        }
    }

    RunOutcome::Failed {
        attempts: max,
        reason,
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One year.
const MAX_INTERVAL_MINUTES: u64 = 60 * 24 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Capture,
    Cleanup,
    BackupCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    DailyAt(NaiveTime),
    Every(TimeDelta),
}

impl Trigger {
    /// First firing strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Trigger::DailyAt(t) => {
                let today = after.date().and_time(t);
                if today > after {
                    today
                } else {
                    today + TimeDelta::days(1)
                }
            }
            Trigger::Every(step) => after + step,
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    job: Job,
    trigger: Trigger,
    next_due: NaiveDateTime,
}

/// Every armed job with its next due time.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    jobs: Vec<ScheduledJob>,
}

impl Plan {
    pub fn build(
        schedule: &ScheduleConfig,
        retention: &RetentionPolicy,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let mut plan = Plan::default();
        if schedule.enabled {
            for t in &schedule.times {
                plan.push(Job::Capture, Trigger::DailyAt(*t), now);
            }
            if let Some(minutes) = schedule.interval_minutes {
                let step = TimeDelta::minutes(minutes.min(MAX_INTERVAL_MINUTES) as i64);
                plan.push(Job::Capture, Trigger::Every(step), now);
            }
        }
        plan.push(Job::Cleanup, Trigger::DailyAt(parse_hhmm(CLEANUP_TIME)?), now);
        if retention.backup_enabled {
            plan.push(Job::BackupCheck, Trigger::DailyAt(parse_hhmm(BACKUP_CHECK_TIME)?), now);
        }
        Ok(plan)
    }

    fn push(&mut self, job: Job, trigger: Trigger, now: NaiveDateTime) {
        self.jobs.push(ScheduledJob {
            job,
            trigger,
            next_due: trigger.next_after(now),
        });
    }

    /// Jobs due at `now`, each at most once, in Capture → Cleanup → BackupCheck
    /// order. Every due trigger is re-armed from `now`.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<Job> {
        let mut due: Vec<Job> = Vec::new();
        for sj in self.jobs.iter_mut().filter(|sj| sj.next_due <= now) {
            sj.next_due = sj.trigger.next_after(now);
            if !due.contains(&sj.job) {
                due.push(sj.job);
            }
        }
        due.sort_by_key(|j| match j {
            Job::Capture => 0,
            Job::Cleanup => 1,
            Job::BackupCheck => 2,
        });
        due
    }

    pub fn next_capture(&self) -> Option<NaiveDateTime> {
        self.jobs
            .iter()
            .filter(|sj| sj.job == Job::Capture)
            .map(|sj| sj.next_due)
            .min()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    pipeline: Arc<CapturePipeline>,
    retention: Arc<RetentionManager>,
    status: Arc<StatusBoard>,
    notifier: RwLock<Arc<Notifier>>,
    schedule: RwLock<ScheduleConfig>,
    plan: Mutex<Plan>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<CapturePipeline>,
        retention: Arc<RetentionManager>,
        status: Arc<StatusBoard>,
        notifier: Notifier,
        schedule: ScheduleConfig,
    ) -> Result<Self> {
        let plan = Plan::build(&schedule, &retention.policy(), Local::now().naive_local())?;
        status.set_next_run(plan.next_capture().map(|t| t.to_string()));
        Ok(Self {
            pipeline,
            retention,
            status,
            notifier: RwLock::new(Arc::new(notifier)),
            schedule: RwLock::new(schedule),
            plan: Mutex::new(plan),
            running: AtomicBool::new(false),
        })
    }

    pub fn schedule(&self) -> ScheduleConfig {
        match self.schedule.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    pub fn pipeline(&self) -> &Arc<CapturePipeline> {
        &self.pipeline
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    fn notifier(&self) -> Arc<Notifier> {
        match self.notifier.read() {
            Ok(n) => n.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the schedule and notifier and re-arm every job from now.
    pub fn reconfigure(&self, schedule: ScheduleConfig, notifier: Notifier) -> Result<()> {
        let plan = Plan::build(&schedule, &self.retention.policy(), Local::now().naive_local())?;
        self.status.set_next_run(plan.next_capture().map(|t| t.to_string()));
        if let Ok(mut p) = self.plan.lock() {
            *p = plan;
        }
        if let Ok(mut s) = self.schedule.write() {
            *s = schedule;
        }
        if let Ok(mut n) = self.notifier.write() {
            *n = Arc::new(notifier);
        }
        info!("Schedule reloaded");
        Ok(())
    }

    /// Stop the loop after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One capture with the configured retry policy, recorded and notified.
    pub async fn run_capture(&self, depth: CaptureDepth, origin: &str) -> RunOutcome {
        let retry = RetryPolicy::from_config(self.schedule().retry);
        info!("Starting {origin} capture");

        let pipeline = Arc::clone(&self.pipeline);
        let outcome = run_with_retry(retry, move |n| {
            let pipeline = Arc::clone(&pipeline);
            async move {
                if n > 1 {
                    info!("Capture attempt {n}");
                }
                let report = pipeline.run(depth).await?;
                info!(
                    pages = report.pages,
                    reports = report.reports,
                    entries = report.summary.total_entries,
                    "Capture attempt {n} succeeded"
                );
                Ok::<PathBuf, AppError>(report.capture_path)
            }
        })
        .await;

        self.status.record(&outcome);
        let notifier = self.notifier();
        match &outcome {
            RunOutcome::Completed { path, .. } => {
                notifier
                    .send(NotifyKind::Success, &format!("Capture saved to {}", path.display()))
                    .await;
            }
            RunOutcome::Failed { attempts, reason } => {
                notifier
                    .send(
                        NotifyKind::Error,
                        &format!("Capture failed after {attempts} attempt(s): {reason}"),
                    )
                    .await;
            }
        }
        outcome
    }

    /// Launch a capture on its own task. It waits for any run already holding the lock.
    pub fn trigger_manual(
        self: &Arc<Self>,
        depth: CaptureDepth,
    ) -> tokio::task::JoinHandle<RunOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_capture(depth, "manual").await })
    }

    async fn tick(&self, now: NaiveDateTime) -> Result<()> {
        let due = {
            let mut plan = self
                .plan
                .lock()
                .map_err(|_| AppError::ScheduleTick("plan lock poisoned".to_string()))?;
            let due = plan.take_due(now);
            self.status.set_next_run(plan.next_capture().map(|t| t.to_string()));
            due
        };

        let mut failures = Vec::new();
        for job in due {
            match job {
                Job::Capture => {
                    let depth = self.pipeline.settings().default_depth;
                    self.run_capture(depth, "scheduled").await;
                }
                Job::Cleanup => {
                    if let Err(e) = self.retention.cleanup().await {
                        failures.push(format!("cleanup: {e}"));
                    }
                }
                Job::BackupCheck => match self.retention.check_backup(now.day()).await {
                    Ok(Some(path)) => info!("Scheduled backup written to {}", path.display()),
                    Ok(None) => {}
                    Err(e) => failures.push(format!("backup: {e}")),
                },
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::ScheduleTick(failures.join("; ")))
        }
    }

    /// Poll until `stop` is called.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.status.set_loop_running(true);

        let schedule = self.schedule();
        info!(
            "Scheduler started: {} daily trigger(s), interval {:?} min, automation {}",
            schedule.times.len(),
            schedule.interval_minutes,
            if schedule.enabled { "on" } else { "off" }
        );
        if schedule.enabled && schedule.capture_on_startup {
            let depth = self.pipeline.settings().default_depth;
            self.run_capture(depth, "startup").await;
        }

        let mut ticker = interval(Duration::from_secs(TICK_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.tick(Local::now().naive_local()).await {
                error!("{e}");
                self.status.record_tick_error();
                sleep(Duration::from_secs(TICK_ERROR_BACKOFF_SECS)).await;
            }
        }

        self.status.set_loop_running(false);
        info!("Scheduler stopped");
    }
}
