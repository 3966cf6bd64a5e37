//! File-backed persistence under the captures directory.
//!
//! Every document is a whole-file pretty JSON rewrite; there is no atomic
//! rename, so a crash mid-write can leave a truncated file which the manifest
//! rebuild then skips.

pub mod manifest;
pub mod rollup;
pub mod writer;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoragePaths;
use crate::error::{AppError, Result};
use crate::types::{CaptureDocument, Manifest};

pub use manifest::rebuild_manifest;
pub use rollup::update_daily_rollup;
pub use writer::write_capture;

pub const CAPTURE_PREFIX: &str = "captura_";
pub const SUMMARY_PREFIX: &str = "resumo_";
pub const ROLLUP_PREFIX: &str = "resumo_diario_";
pub const MANIFEST_FILE: &str = "manifest.json";

/// `YYYYMMDD_HHMMSS`, the suffix shared by a run's capture and summary files.
pub fn file_stamp(at: &chrono::DateTime<chrono::Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).map_err(|e| AppError::persistence(path, e))?;
    fs::write(path, body).map_err(|e| AppError::persistence(path, e))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path).map_err(|e| AppError::persistence(path, e))?;
    serde_json::from_str(&body).map_err(|e| AppError::persistence(path, e))
}

/// A `captura_*.json` file on disk.
#[derive(Debug, Clone)]
pub struct CaptureFile {
    pub path: PathBuf,
    pub name: String,
    pub modified: SystemTime,
    pub size: u64,
}

/// Capture files in `dir`, newest modification first. Missing directory → empty.
/// Entries whose metadata cannot be read are skipped with a warning.
pub fn list_capture_files(dir: &Path) -> Result<Vec<CaptureFile>> {
    let read = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::persistence(dir, e)),
    };

    let mut files = Vec::new();
    for item in read {
        let item = match item {
            Ok(i) => i,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {e}", dir.display());
                continue;
            }
        };
        let name = item.file_name().to_string_lossy().into_owned();
        if !(name.starts_with(CAPTURE_PREFIX) && name.ends_with(".json")) {
            continue;
        }
        let stat = item
            .metadata()
            .and_then(|meta| meta.modified().map(|modified| (meta, modified)));
        let (meta, modified) = match stat {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping {name}: {e}");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        files.push(CaptureFile {
            path: item.path(),
            name,
            modified,
            size: meta.len(),
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(files)
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Read-only view over persisted documents, used by the control surface.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    paths: StoragePaths,
}

impl CaptureStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    /// Most recently modified capture document.
    pub fn latest_capture(&self) -> Result<CaptureDocument> {
        let files = list_capture_files(&self.paths.captures)?;
        let latest = files
            .first()
            .ok_or_else(|| AppError::NotFound("no capture files yet".to_string()))?;
        read_json(&latest.path)
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let path = self.paths.captures.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(AppError::NotFound(MANIFEST_FILE.to_string()));
        }
        read_json(&path)
    }

    /// Any JSON document directly inside the captures directory, by file name.
    pub fn data_file(&self, name: &str) -> Result<serde_json::Value> {
        let plain = Path::new(name)
            .file_name()
            .map(|f| f == name)
            .unwrap_or(false);
        if !plain || !name.ends_with(".json") {
            return Err(AppError::NotFound(name.to_string()));
        }
        let path = self.paths.captures.join(name);
        if !path.is_file() {
            return Err(AppError::NotFound(name.to_string()));
        }
        read_json(&path)
    }

    /// Total bytes under the data root's captures and backups trees.
    pub fn data_size(&self) -> u64 {
        dir_size(&self.paths.captures) + dir_size(&self.paths.backups)
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(read) = fs::read_dir(dir) else { return 0 };
    read.flatten()
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}
