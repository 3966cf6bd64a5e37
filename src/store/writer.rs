use std::path::PathBuf;

use tracing::info;

use super::{file_stamp, write_json, CAPTURE_PREFIX, SUMMARY_PREFIX};
use crate::config::StoragePaths;
use crate::error::Result;
use crate::types::{
    AggregateSummary, CaptureDocument, CaptureHeader, CaptureSession, ListingEntry, SummaryDocument,
};

#[derive(Debug, Clone)]
pub struct WrittenCapture {
    pub capture_path: PathBuf,
    pub summary_path: PathBuf,
}

impl CaptureHeader {
    pub fn for_run(session: &CaptureSession) -> Self {
        let at = session.run_at;
        Self {
            timestamp: at.to_rfc3339(),
            timestamp_unix: at.timestamp_millis() as f64 / 1000.0,
            date: at.format("%Y-%m-%d").to_string(),
            time: at.format("%H:%M:%S").to_string(),
            version: session.format_version.clone(),
        }
    }
}

/// Persist one run as `captura_<stamp>.json` plus `resumo_<stamp>.json`.
/// Runs within the same second share a stamp; the later one overwrites.
pub fn write_capture(
    paths: &StoragePaths,
    session: &CaptureSession,
    summary: &AggregateSummary,
    top: &[ListingEntry],
) -> Result<WrittenCapture> {
    let stamp = file_stamp(&session.run_at);
    let capture_path = paths.captures.join(format!("{CAPTURE_PREFIX}{stamp}.json"));
    let summary_path = paths.captures.join(format!("{SUMMARY_PREFIX}{stamp}.json"));

    let capture = CaptureDocument {
        header: CaptureHeader::for_run(session),
        summary: summary.clone(),
        entries: session.entries.clone(),
        reports: session.reports.clone(),
    };
    write_json(&capture_path, &capture)?;

    let resumo = SummaryDocument {
        timestamp: capture.header.timestamp.clone(),
        summary: summary.clone(),
        top: top.to_vec(),
    };
    write_json(&summary_path, &resumo)?;

    info!(
        "Saved {} ({} entries, R$ {:.2})",
        capture_path.display(),
        summary.total_entries,
        summary.collected_total
    );
    Ok(WrittenCapture {
        capture_path,
        summary_path,
    })
}
