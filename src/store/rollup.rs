use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::{info, warn};

use super::{read_json, write_json, ROLLUP_PREFIX};
use crate::config::StoragePaths;
use crate::error::Result;
use crate::types::{AggregateSummary, DailyRollup, RollupRun};

pub fn rollup_path(paths: &StoragePaths, day: &DateTime<Local>) -> PathBuf {
    paths
        .captures
        .join(format!("{ROLLUP_PREFIX}{}.json", day.format("%Y%m%d")))
}

/// Append this run to its day's rollup. The day's final summary is simply
/// the latest run's, not a merge of all runs.
pub fn update_daily_rollup(
    paths: &StoragePaths,
    run_at: &DateTime<Local>,
    summary: &AggregateSummary,
) -> Result<DailyRollup> {
    let path = rollup_path(paths, run_at);
    let stamp = run_at.to_rfc3339();

    let existing = if path.exists() {
        match read_json::<DailyRollup>(&path) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Daily rollup unreadable, starting over: {e}");
                None
            }
        }
    } else {
        None
    };
    let mut rollup = existing.unwrap_or_else(|| DailyRollup {
        date: run_at.format("%Y-%m-%d").to_string(),
        first_run: stamp.clone(),
        last_run: stamp.clone(),
        runs: Vec::new(),
        final_summary: AggregateSummary::default(),
    });

    rollup.last_run = stamp;
    rollup.runs.push(RollupRun {
        time: run_at.format("%H:%M:%S").to_string(),
        summary: summary.clone(),
    });
    rollup.final_summary = summary.clone();

    write_json(&path, &rollup)?;
    info!("Daily rollup {} now has {} run(s)", rollup.date, rollup.runs.len());
    Ok(rollup)
}
