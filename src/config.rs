use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, Result};

pub const DEFAULT_BASE_URL: &str = "https://dashboard.imperiorapidinhas.me";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// Schema version written into new config files. Files with a newer version are rejected.
pub const CONFIG_VERSION: u32 = 1;

/// Tag stored in every capture document (`captura.versao`).
pub const FORMAT_VERSION: &str = "2.0";

/// Scheduler polling interval (seconds).
pub const TICK_INTERVAL_SECS: u64 = 30;

/// Sleep after a failed scheduler tick before polling resumes (seconds).
pub const TICK_ERROR_BACKOFF_SECS: u64 = 60;

/// Fixed delay between capture retry attempts (seconds).
pub const RETRY_DELAY_SECS: u64 = 30;

/// Listing traversal stops after this many pages.
pub const MAX_LIST_PAGES: usize = 50;

/// Manifest keeps only the newest N capture files.
pub const MANIFEST_MAX_ENTRIES: usize = 100;

/// Entries written to `top_rifas` in the summary document.
pub const TOP_RANKING_SIZE: usize = 10;

/// Daily maintenance times (local).
pub const CLEANUP_TIME: &str = "03:00";
pub const BACKUP_CHECK_TIME: &str = "04:00";

/// Directory layout, relative to the data root.
pub const CAPTURES_DIR: &str = "data/captures";
pub const ARCHIVE_DIR: &str = "archive";
pub const BACKUPS_DIR: &str = "backups";

// ---------------------------------------------------------------------------
// File-backed configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub imperio: ImperioConfig,
    pub capture: CaptureConfig,
    pub automation: AutomationConfig,
    pub data_management: DataManagementConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImperioConfig {
    pub username: String,
    pub password: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Per-request timeout (seconds).
    pub timeout: u64,
    /// Pause between detail page fetches (seconds).
    pub wait_between_actions: u64,
    /// Fetch per-entry detail reports (false = listing only).
    pub capture_details: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
    /// Daily trigger times, `HH:MM` local.
    pub capture_times: Vec<String>,
    /// Repeating interval in minutes; 0 disables it.
    pub capture_interval_minutes: u64,
    pub use_headless: bool,
    pub capture_on_startup: bool,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataManagementConfig {
    pub keep_days: u32,
    pub compress_old_data: bool,
    pub backup_enabled: bool,
    /// Days of the month on which the backup check creates a bundle.
    pub backup_days: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub notify_on_error: bool,
    pub notify_on_success: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            imperio: ImperioConfig::default(),
            capture: CaptureConfig::default(),
            automation: AutomationConfig::default(),
            data_management: DataManagementConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for ImperioConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            wait_between_actions: 2,
            capture_details: true,
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_times: ["06:00", "10:00", "14:00", "18:00", "22:00"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            capture_interval_minutes: 0,
            use_headless: true,
            capture_on_startup: true,
            retry_on_failure: true,
            max_retries: 3,
            api_port: 8081,
        }
    }
}

impl Default for DataManagementConfig {
    fn default() -> Self {
        Self {
            keep_days: 365,
            compress_old_data: true,
            backup_enabled: true,
            backup_days: vec![1, 15],
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            notify_on_error: true,
            notify_on_success: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived views consumed by the scheduler and retention manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub times: Vec<NaiveTime>,
    pub interval_minutes: Option<u64>,
    pub headless: bool,
    pub capture_on_startup: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_days: u32,
    pub compress_before_delete: bool,
    pub backup_enabled: bool,
    pub backup_days: Vec<u32>,
}

impl Config {
    /// Load the config file, merging defaults for missing keys, then apply env
    /// overrides and validate. A missing file is created with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_str::<Config>(&raw)
                .map_err(|e| AppError::Config(format!("invalid {}: {e}", path.display())))?
        } else {
            let cfg = Config::default();
            cfg.save(path)?;
            warn!(
                "Config file {} not found, wrote defaults. Set imperio.username/password or IMPERIO_USERNAME/IMPERIO_PASSWORD.",
                path.display()
            );
            cfg
        };

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| AppError::persistence(path, e))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("IMPERIO_USERNAME") {
            self.imperio.username = v;
        }
        if let Ok(v) = std::env::var("IMPERIO_PASSWORD") {
            self.imperio.password = v;
        }
        if let Ok(v) = std::env::var("IMPERIO_BASE_URL") {
            self.imperio.base_url = v;
        }
        if let Some(port) = std::env::var("API_PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
            self.automation.api_port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > CONFIG_VERSION {
            return Err(AppError::Config(format!(
                "config version {} is newer than supported version {CONFIG_VERSION}",
                self.version
            )));
        }
        reqwest::Url::parse(&self.imperio.base_url)
            .map_err(|e| AppError::Config(format!("imperio.base_url is not a valid URL: {e}")))?;
        if self.automation.max_retries == 0 {
            return Err(AppError::Config("automation.max_retries must be >= 1".to_string()));
        }
        if self.data_management.keep_days == 0 {
            return Err(AppError::Config("data_management.keep_days must be >= 1".to_string()));
        }
        if let Some(day) = self
            .data_management
            .backup_days
            .iter()
            .find(|d| !(1..=31).contains(*d))
        {
            return Err(AppError::Config(format!(
                "data_management.backup_days contains invalid day {day}"
            )));
        }
        self.schedule()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<ScheduleConfig> {
        let times = self
            .automation
            .capture_times
            .iter()
            .map(|t| parse_hhmm(t))
            .collect::<Result<Vec<_>>>()?;

        Ok(ScheduleConfig {
            enabled: self.automation.enabled,
            times,
            interval_minutes: (self.automation.capture_interval_minutes > 0)
                .then_some(self.automation.capture_interval_minutes),
            headless: self.automation.use_headless,
            capture_on_startup: self.automation.capture_on_startup,
            retry: RetryConfig {
                enabled: self.automation.retry_on_failure,
                max_attempts: self.automation.max_retries.max(1),
            },
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_days: self.data_management.keep_days,
            compress_before_delete: self.data_management.compress_old_data,
            backup_enabled: self.data_management.backup_enabled,
            backup_days: self.data_management.backup_days.clone(),
        }
    }
}

pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| AppError::Config(format!("invalid trigger time '{s}', expected HH:MM")))
}

// ---------------------------------------------------------------------------
// Process environment
// ---------------------------------------------------------------------------

/// Settings that come from the environment rather than the config file.
#[derive(Debug, Clone)]
pub struct Env {
    pub config_path: PathBuf,
    pub data_root: PathBuf,
    pub log_level: String,
}

impl Env {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
            data_root: std::env::var("DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Resolved on-disk layout.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub captures: PathBuf,
    pub archive: PathBuf,
    pub backups: PathBuf,
    pub config_file: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>, config_file: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let captures = root.join(CAPTURES_DIR);
        Self {
            archive: captures.join(ARCHIVE_DIR),
            backups: root.join(BACKUPS_DIR),
            captures,
            root,
            config_file: config_file.into(),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.captures)?;
        std::fs::create_dir_all(&self.backups)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"imperio": {"username": "op", "password": "pw"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.imperio.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.capture.timeout, 30);
        assert_eq!(cfg.automation.max_retries, 3);
        assert_eq!(cfg.data_management.backup_days, vec![1, 15]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_trigger_time_is_rejected() {
        let mut cfg = Config::default();
        cfg.automation.capture_times = vec!["25:99".to_string()];
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let cfg = Config {
            version: CONFIG_VERSION + 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_interval_means_fixed_times_only() {
        let cfg = Config::default();
        let sched = cfg.schedule().unwrap();
        assert_eq!(sched.interval_minutes, None);
        assert_eq!(sched.times.len(), 5);
        assert_eq!(sched.retry.max_attempts, 3);
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.json");
        let cfg = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.version, CONFIG_VERSION);
    }
}
