//! Operational controls shared by the HTTP API and the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::api::health::LastRun;
use crate::config::Config;
use crate::error::Result;
use crate::notify::Notifier;
use crate::pipeline::{CaptureDepth, PipelineSettings};
use crate::scheduler::Scheduler;
use crate::store::CaptureStore;
use crate::types::{CaptureDocument, Manifest, ManifestEntry};

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub started: bool,
    /// A run already held the lock; the new one queues behind it.
    pub queued: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub scheduler_running: bool,
    pub capture_in_progress: bool,
    pub automation_enabled: bool,
    pub headless: bool,
    pub capture_times: Vec<String>,
    pub interval_minutes: Option<u64>,
    pub captures_ok: u64,
    pub captures_failed: u64,
    pub tick_errors: u64,
    pub last_run: Option<LastRun>,
    pub next_run: Option<String>,
    pub data_size_mb: f64,
    pub latest_capture: Option<ManifestEntry>,
}

pub struct Control {
    scheduler: Arc<Scheduler>,
    store: CaptureStore,
    config_path: PathBuf,
}

impl Control {
    pub fn new(scheduler: Arc<Scheduler>, store: CaptureStore, config_path: PathBuf) -> Self {
        Self {
            scheduler,
            store,
            config_path,
        }
    }

    /// Spawn a manual capture; returns immediately.
    pub fn start_capture(&self, depth: Option<CaptureDepth>) -> StartResponse {
        let pipeline = self.scheduler.pipeline();
        let queued = pipeline.is_busy();
        let depth = depth.unwrap_or_else(|| pipeline.settings().default_depth);
        self.scheduler.trigger_manual(depth);
        StartResponse {
            started: true,
            queued,
            message: if queued {
                "capture queued behind the run in progress".to_string()
            } else {
                "capture started".to_string()
            },
        }
    }

    pub fn status(&self) -> SystemStatus {
        let schedule = self.scheduler.schedule();
        let board = self.scheduler.status();
        let latest_capture = self.store.manifest().ok().and_then(|m| m.files.into_iter().next());

        SystemStatus {
            scheduler_running: board.loop_running(),
            capture_in_progress: self.scheduler.pipeline().is_busy(),
            automation_enabled: schedule.enabled,
            headless: schedule.headless,
            capture_times: schedule.times.iter().map(|t| t.format("%H:%M").to_string()).collect(),
            interval_minutes: schedule.interval_minutes,
            captures_ok: board.captures_ok(),
            captures_failed: board.captures_failed(),
            tick_errors: board.tick_errors(),
            last_run: board.last_run(),
            next_run: board.next_run(),
            data_size_mb: self.store.data_size() as f64 / (1024.0 * 1024.0),
            latest_capture,
        }
    }

    /// Re-read the config file and apply it to the pipeline, retention and schedule.
    /// The running config is unchanged when the new one fails validation.
    pub fn reload_config(&self) -> Result<Config> {
        let cfg = Config::load(&self.config_path)?;
        let schedule = cfg.schedule()?;

        self.scheduler
            .pipeline()
            .reconfigure(PipelineSettings::from_config(&cfg));
        self.scheduler.retention().set_policy(cfg.retention());
        self.scheduler
            .reconfigure(schedule, Notifier::new(cfg.notifications.clone()))?;

        info!("Configuration reloaded from {}", self.config_path.display());
        Ok(cfg)
    }

    pub async fn backup_now(&self) -> Result<PathBuf> {
        self.scheduler.retention().create_backup().await
    }

    pub fn latest_data(&self) -> Result<CaptureDocument> {
        self.store.latest_capture()
    }

    pub fn manifest(&self) -> Result<Manifest> {
        self.store.manifest()
    }

    pub fn data_file(&self, name: &str) -> Result<serde_json::Value> {
        self.store.data_file(name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::health::StatusBoard;
    use crate::config::StoragePaths;
    use crate::pipeline::CapturePipeline;
    use crate::retention::RetentionManager;
    use crate::session::fake::StaticPages;

    fn control(dir: &tempfile::TempDir) -> Control {
        let config_path = dir.path().join("config/config.json");
        let cfg = Config::load(&config_path).unwrap();
        let paths = StoragePaths::new(dir.path(), &config_path);
        paths.ensure().unwrap();

        let pipeline = Arc::new(CapturePipeline::new(
            PipelineSettings {
                provider: Arc::new(StaticPages::default()),
                base_url: "https://example.test".to_string(),
                wait: Duration::ZERO,
                default_depth: CaptureDepth::ListOnly,
            },
            paths.clone(),
        ));
        let retention = Arc::new(RetentionManager::new(Arc::clone(&pipeline), cfg.retention()));
        let scheduler = Arc::new(
            Scheduler::new(
                pipeline,
                retention,
                Arc::new(StatusBoard::new()),
                Notifier::new(cfg.notifications.clone()),
                cfg.schedule().unwrap(),
            )
            .unwrap(),
        );
        Control::new(scheduler, CaptureStore::new(paths), config_path)
    }

    #[test]
    fn status_on_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let status = control(&dir).status();
        assert!(!status.scheduler_running);
        assert!(!status.capture_in_progress);
        assert!(status.automation_enabled);
        assert_eq!(status.capture_times.len(), 5);
        assert!(status.next_run.is_some());
        assert!(status.latest_capture.is_none());
        assert!(status.last_run.is_none());
    }

    #[test]
    fn reload_applies_new_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = control(&dir);

        let config_path = dir.path().join("config/config.json");
        let mut cfg = Config::load(&config_path).unwrap();
        cfg.automation.capture_times = vec!["08:30".to_string()];
        cfg.automation.capture_interval_minutes = 15;
        cfg.save(&config_path).unwrap();

        ctl.reload_config().unwrap();
        let status = ctl.status();
        assert_eq!(status.capture_times, vec!["08:30"]);
        assert_eq!(status.interval_minutes, Some(15));
    }

    #[test]
    fn invalid_reload_keeps_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = control(&dir);
        std::fs::write(
            dir.path().join("config/config.json"),
            r#"{"automation": {"capture_times": ["7h"]}}"#,
        )
        .unwrap();

        assert!(ctl.reload_config().is_err());
        assert_eq!(ctl.status().capture_times.len(), 5);
    }

    #[tokio::test]
    async fn backup_now_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = control(&dir);
        let path = ctl.backup_now().await.unwrap();
        assert!(path.exists());
    }
}
