use serde::Deserialize;
use tracing::{info, warn};

use super::{list_capture_files, read_json, write_json, CaptureFile, MANIFEST_FILE};
use crate::config::{StoragePaths, MANIFEST_MAX_ENTRIES};
use crate::error::Result;
use crate::types::{Manifest, ManifestEntry};

/// The fields of a capture document the manifest needs.
#[derive(Deserialize)]
struct Headline {
    captura: HeadlineHeader,
    resumo_geral: HeadlineSummary,
}

#[derive(Deserialize)]
struct HeadlineHeader {
    timestamp: String,
    #[serde(default)]
    timestamp_unix: f64,
}

#[derive(Deserialize)]
struct HeadlineSummary {
    total_rifas: usize,
    arrecadado_total: f64,
}

fn manifest_entry(paths: &StoragePaths, file: &CaptureFile) -> Result<ManifestEntry> {
    let head: Headline = read_json(&file.path)?;
    let relative_path = file
        .path
        .strip_prefix(&paths.root)
        .unwrap_or(&file.path)
        .to_string_lossy()
        .into_owned();
    Ok(ManifestEntry {
        filename: file.name.clone(),
        relative_path,
        timestamp: head.captura.timestamp,
        timestamp_unix: head.captura.timestamp_unix,
        total_entries: head.resumo_geral.total_rifas,
        collected_total: head.resumo_geral.arrecadado_total,
        size_kb: file.size as f64 / 1024.0,
    })
}

/// Rebuild `manifest.json` from the capture files on disk: newest first,
/// at most `MANIFEST_MAX_ENTRIES` entries. Unreadable files are skipped.
pub fn rebuild_manifest(paths: &StoragePaths) -> Result<Manifest> {
    let files = list_capture_files(&paths.captures)?;

    let mut entries = Vec::with_capacity(files.len().min(MANIFEST_MAX_ENTRIES));
    for file in files.iter().take(MANIFEST_MAX_ENTRIES) {
        match manifest_entry(paths, file) {
            Ok(e) => entries.push(e),
            Err(e) => warn!("Skipping {} in manifest: {e}", file.name),
        }
    }

    let manifest = Manifest {
        updated: chrono::Local::now().to_rfc3339(),
        total_files: files.len(),
        files: entries,
    };
    write_json(&paths.captures.join(MANIFEST_FILE), &manifest)?;
    info!(
        "Manifest rebuilt: {} listed of {} capture file(s)",
        manifest.files.len(),
        manifest.total_files
    );
    Ok(manifest)
}
