//! Age-based cleanup of capture files and periodic backup bundles.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::ser::{self, SerializeMap, Serializer};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{RetentionPolicy, StoragePaths};
use crate::error::{AppError, Result};
use crate::pipeline::CapturePipeline;
use crate::store::{list_capture_files, rebuild_manifest};

const SECS_PER_DAY: u64 = 86_400;

/// Contents of `backup_<stamp>.json.gz`.
#[derive(Serialize)]
struct BackupBundle<'a> {
    created: String,
    /// Path relative to the data root → file contents.
    files: BundleFiles<'a>,
}

/// Reads each file as it is serialized, so at most one is held in memory.
struct BundleFiles<'a> {
    root: &'a Path,
    sources: &'a [PathBuf],
}

impl Serialize for BundleFiles<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sources.len()))?;
        for path in self.sources {
            let bytes = fs::read(path).map_err(|e| {
                <S::Error as ser::Error>::custom(format!("{}: {e}", path.display()))
            })?;
            let content = String::from_utf8_lossy(&bytes);
            if matches!(content, Cow::Owned(_)) {
                warn!("{} is not valid UTF-8; invalid bytes replaced", path.display());
            }
            map.serialize_entry(&relative_name(self.root, path), &content)?;
        }
        map.end()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub archived: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.archived + self.deleted
    }
}

pub struct RetentionManager {
    pipeline: Arc<CapturePipeline>,
    policy: RwLock<RetentionPolicy>,
}

impl RetentionManager {
    pub fn new(pipeline: Arc<CapturePipeline>, policy: RetentionPolicy) -> Self {
        Self {
            pipeline,
            policy: RwLock::new(policy),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        match self.policy.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_policy(&self, policy: RetentionPolicy) {
        match self.policy.write() {
            Ok(mut p) => *p = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    fn paths(&self) -> &StoragePaths {
        self.pipeline.paths()
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(SystemTime::now()).await
    }

    /// Archive or delete capture files last modified more than `keep_days` before `now`.
    pub async fn cleanup_at(&self, now: SystemTime) -> Result<CleanupReport> {
        let _guard = self.pipeline.exclusive().await;
        let policy = self.policy();
        let cutoff = now
            .checked_sub(Duration::from_secs(u64::from(policy.keep_days) * SECS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        info!("Cleaning capture files older than {} day(s)", policy.keep_days);

        let mut report = CleanupReport::default();
        for file in list_capture_files(&self.paths().captures)? {
            if file.modified >= cutoff {
                continue;
            }
            let outcome = if policy.compress_before_delete {
                compress_file(&file.path, &self.paths().archive).map(|_| true)
            } else {
                fs::remove_file(&file.path)
                    .map(|_| false)
                    .map_err(|e| AppError::persistence(&file.path, e))
            };
            match outcome {
                Ok(true) => report.archived += 1,
                Ok(false) => report.deleted += 1,
                Err(e) => {
                    error!("Cleanup of {} failed: {e}", file.name);
                    report.failed += 1;
                }
            }
        }

        if report.removed() > 0 {
            info!(
                "Removed {} old file(s) ({} archived)",
                report.removed(),
                report.archived
            );
            rebuild_manifest(self.paths())?;
        }
        Ok(report)
    }

    /// Create a backup when `day_of_month` is a configured backup day.
    pub async fn check_backup(&self, day_of_month: u32) -> Result<Option<PathBuf>> {
        let policy = self.policy();
        if !policy.backup_enabled || !policy.backup_days.contains(&day_of_month) {
            return Ok(None);
        }
        self.create_backup().await.map(Some)
    }

    /// Bundle every JSON file under the captures tree plus the config file.
    pub async fn create_backup(&self) -> Result<PathBuf> {
        let _guard = self.pipeline.exclusive().await;
        let paths = self.paths();

        let mut sources = Vec::new();
        collect_json(&paths.captures, &mut sources)?;
        if paths.config_file.is_file() {
            sources.push(paths.config_file.clone());
        }

        let now = chrono::Local::now();
        let bundle = BackupBundle {
            created: now.to_rfc3339(),
            files: BundleFiles {
                root: &paths.root,
                sources: &sources,
            },
        };
        fs::create_dir_all(&paths.backups).map_err(|e| AppError::persistence(&paths.backups, e))?;
        let target = paths
            .backups
            .join(format!("backup_{}.json.gz", now.format("%Y%m%d_%H%M%S")));
        if let Err(e) = write_bundle(&target, &bundle) {
            let _ = fs::remove_file(&target);
            return Err(e);
        }

        let size_kb = fs::metadata(&target).map(|m| m.len() as f64 / 1024.0).unwrap_or(0.0);
        info!(
            "Backup created: {} ({} file(s), {size_kb:.1} KB)",
            target.display(),
            sources.len()
        );
        Ok(target)
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn collect_json(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let read = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AppError::persistence(dir, e)),
    };
    for item in read {
        let path = item?.path();
        if path.is_dir() {
            collect_json(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

fn gzip_writer(target: &Path) -> Result<GzEncoder<BufWriter<File>>> {
    let file = File::create(target).map_err(|e| AppError::persistence(target, e))?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

fn finish_gzip(target: &Path, encoder: GzEncoder<BufWriter<File>>) -> Result<()> {
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| AppError::persistence(target, e))
}

fn write_bundle(target: &Path, bundle: &BackupBundle<'_>) -> Result<()> {
    let mut encoder = gzip_writer(target)?;
    serde_json::to_writer(&mut encoder, bundle).map_err(|e| AppError::persistence(target, e))?;
    finish_gzip(target, encoder)
}

/// Gzip `src` into `archive_dir/<name>.gz` and remove the original.
pub fn compress_file(src: &Path, archive_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir).map_err(|e| AppError::persistence(archive_dir, e))?;
    let name = src
        .file_name()
        .ok_or_else(|| AppError::persistence(src, "not a file"))?
        .to_string_lossy();
    let target = archive_dir.join(format!("{name}.gz"));

    let mut input = File::open(src).map_err(|e| AppError::persistence(src, e))?;
    let mut encoder = gzip_writer(&target)?;
    io::copy(&mut input, &mut encoder).map_err(|e| AppError::persistence(&target, e))?;
    finish_gzip(&target, encoder)?;
    fs::remove_file(src).map_err(|e| AppError::persistence(src, e))?;
    Ok(target)
}
