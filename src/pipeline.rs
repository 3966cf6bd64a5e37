//! One capture run: list → details → aggregate → persist.
//!
//! `CapturePipeline` owns the run-exclusive lock. A capture, a retention pass
//! and a backup each hold it for their whole duration, so two of them never
//! touch the session or the output directory at once.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::aggregate::{apply_reports, summarize, top_ranking};
use crate::config::{Config, StoragePaths, FORMAT_VERSION, TOP_RANKING_SIZE};
use crate::error::{AppError, Result};
use crate::extract::{extract_details, extract_listing, ListTermination};
use crate::session::{HttpSessionProvider, SessionProvider};
use crate::store::{rebuild_manifest, update_daily_rollup, write_capture};
use crate::types::{AggregateSummary, CaptureSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDepth {
    /// Listing pages only.
    ListOnly,
    /// Listing plus one detail report per token.
    WithDetails,
}

impl CaptureDepth {
    pub fn from_flag(capture_details: bool) -> Self {
        if capture_details {
            CaptureDepth::WithDetails
        } else {
            CaptureDepth::ListOnly
        }
    }
}

/// Parts of a run that a config reload may replace.
#[derive(Clone)]
pub struct PipelineSettings {
    pub provider: Arc<dyn SessionProvider>,
    pub base_url: String,
    /// Pause between detail page fetches.
    pub wait: Duration,
    pub default_depth: CaptureDepth,
}

impl PipelineSettings {
    /// HTTP-backed settings from the loaded config.
    pub fn from_config(cfg: &Config) -> Self {
        let provider = HttpSessionProvider::new(
            cfg.imperio.clone(),
            Duration::from_secs(cfg.capture.timeout),
        );
        Self {
            provider: Arc::new(provider),
            base_url: cfg.imperio.base_url.trim_end_matches('/').to_string(),
            wait: Duration::from_secs(cfg.capture.wait_between_actions),
            default_depth: CaptureDepth::from_flag(cfg.capture.capture_details),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub capture_path: PathBuf,
    pub summary: AggregateSummary,
    pub pages: usize,
    pub reports: usize,
}

pub struct CapturePipeline {
    settings: RwLock<PipelineSettings>,
    paths: StoragePaths,
    run_lock: Mutex<()>,
}

impl CapturePipeline {
    pub fn new(settings: PipelineSettings, paths: StoragePaths) -> Self {
        Self {
            settings: RwLock::new(settings),
            paths,
            run_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn settings(&self) -> PipelineSettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in new settings; runs already in flight keep the old ones.
    pub fn reconfigure(&self, settings: PipelineSettings) {
        match self.settings.write() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    /// Wait for exclusive use of the session and output directory.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn run(&self, depth: CaptureDepth) -> Result<RunReport> {
        let _guard = self.exclusive().await;
        let settings = self.settings();
        let run_at = Local::now();
        info!("Capture started ({depth:?})");

        let mut source = settings.provider.open().await?;

        let listing = extract_listing(source.as_mut(), &settings.base_url).await?;
        if let ListTermination::Failed(reason) = &listing.termination {
            warn!("Listing ended early after {} page(s): {reason}", listing.pages);
        }
        let mut entries = listing.entries;
        if entries.is_empty() {
            return Err(AppError::NoEntries);
        }

        let reports = match depth {
            CaptureDepth::WithDetails => {
                let stage =
                    extract_details(source.as_mut(), &settings.base_url, &entries, settings.wait)
                        .await;
                if stage.auth_lost {
                    warn!("Detail stage stopped early; {} report(s) kept", stage.reports.len());
                }
                stage.reports
            }
            CaptureDepth::ListOnly => Default::default(),
        };
        drop(source);

        apply_reports(&mut entries, &reports);
        let summary = summarize(&entries);
        let top = top_ranking(&entries, TOP_RANKING_SIZE);

        let session = CaptureSession {
            run_at,
            format_version: FORMAT_VERSION.to_string(),
            entries,
            reports,
        };
        let written = write_capture(&self.paths, &session, &summary, &top)?;

        if let Err(e) = update_daily_rollup(&self.paths, &run_at, &summary) {
            error!("Daily rollup update failed: {e}");
        }
        if let Err(e) = rebuild_manifest(&self.paths) {
            error!("Manifest rebuild failed: {e}");
        }

        info!(
            entries = summary.total_entries,
            active = summary.active_count,
            finished = summary.finished_count,
            summary_file = %written.summary_path.display(),
            "Capture finished: R$ {:.2} collected, {} sales",
            summary.collected_total,
            summary.sales_total
        );
        Ok(RunReport {
            capture_path: written.capture_path,
            summary,
            pages: listing.pages,
            reports: session.reports.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::StaticPages;
    use crate::store::CaptureStore;

    const BASE: &str = "https://example.test";

    fn listing_html() -> String {
        let row = |token: &str, id: &str, title: &str, status: &str, money: &str| {
            format!(
                r#"<tr><td><input type="checkbox" name="rifa[]" value="{id}" data-token="{token}"></td>
                   <td>{id}</td><td>{title}</td><td>{status}</td><td>1</td><td>1</td><td>{money}</td></tr>"#
            )
        };
        format!(
            "<html><body><table><tbody>{}{}</tbody></table></body></html>",
            row("tok-a", "1001", "", "Ativo", "R$ 1,00"),
            row("tok-b", "1002", "2º RAPIDINHA", "Finalizado", "R$ 30,00"),
        )
    }

    fn report_html(crumb: &str, sales: u64, tickets: u64, total: &str) -> String {
        format!(
            r#"<html><body><ol class="breadcrumb"><li>Rifas</li><li>{crumb}</li></ol>
               <table><thead><tr><th>Data</th><th>Vendas</th><th>Qtd. Títulos</th><th>Total</th></tr></thead>
               <tbody><tr><td>01/05</td><td>{sales}</td><td>{tickets}</td><td>{total}</td></tr></tbody>
               <tfoot><tr><td>Recusadas: 1</td></tr></tfoot></table></body></html>"#
        )
    }

    fn site() -> StaticPages {
        StaticPages::new([
            (format!("{BASE}/admin/rifas"), listing_html()),
            (
                format!("{BASE}/admin/rifas/relatorios/tok-a"),
                report_html("1º RAPIDINHA", 10, 12, "R$ 120,00"),
            ),
            (
                format!("{BASE}/admin/rifas/relatorios/tok-b"),
                report_html("ignored", 5, 5, "R$ 50,00"),
            ),
        ])
    }

    fn pipeline(provider: StaticPages) -> (tempfile::TempDir, CapturePipeline) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path(), dir.path().join("config.json"));
        paths.ensure().unwrap();
        let settings = PipelineSettings {
            provider: Arc::new(provider),
            base_url: BASE.to_string(),
            wait: Duration::ZERO,
            default_depth: CaptureDepth::WithDetails,
        };
        (dir, CapturePipeline::new(settings, paths))
    }

    #[tokio::test]
    async fn full_run_persists_enriched_capture() {
        let (_dir, p) = pipeline(site());
        let report = p.run(CaptureDepth::WithDetails).await.unwrap();

        assert_eq!(report.reports, 2);
        assert_eq!(report.summary.sales_total, 15);
        assert_eq!(report.summary.tickets_total, 17);
        assert!((report.summary.collected_total - 170.0).abs() < 1e-9);
        assert_eq!(report.summary.rejected_total, 2);

        let store = CaptureStore::new(p.paths().clone());
        let doc = store.latest_capture().unwrap();
        assert_eq!(doc.entries[0].title, "1º RAPIDINHA");
        assert_eq!(doc.entries[1].title, "2º RAPIDINHA");
        assert_eq!(doc.reports.len(), 2);
        assert_eq!(store.manifest().unwrap().files.len(), 1);
    }

    #[tokio::test]
    async fn list_only_skips_report_pages() {
        let provider = site();
        let fetched = provider.fetched.clone();
        let (_dir, p) = pipeline(provider);
        let report = p.run(CaptureDepth::ListOnly).await.unwrap();

        assert_eq!(report.reports, 0);
        assert_eq!(fetched.lock().unwrap().len(), 1);
        assert!((report.summary.collected_total - 31.0).abs() < 1e-9);

        let doc = CaptureStore::new(p.paths().clone()).latest_capture().unwrap();
        assert_eq!(doc.entries[0].title, "Rifa 1001");
    }

    #[tokio::test]
    async fn empty_listing_is_no_entries() {
        let provider = StaticPages::new([(
            format!("{BASE}/admin/rifas"),
            "<html><body>Nenhuma rifa cadastrada</body></html>",
        )]);
        let (_dir, p) = pipeline(provider);
        assert!(matches!(
            p.run(CaptureDepth::WithDetails).await,
            Err(AppError::NoEntries)
        ));
    }

    #[tokio::test]
    async fn login_failure_is_auth_error() {
        let (_dir, p) = pipeline(StaticPages::rejecting_login());
        let err = p.run(CaptureDepth::ListOnly).await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_runs_never_overlap() {
        let provider = site().with_delay(Duration::from_millis(20));
        let peak = Arc::clone(&provider.peak_in_flight);
        let fetched = provider.fetched.clone();
        let (_dir, p) = pipeline(provider);
        let p = Arc::new(p);

        let spawn_run = |p: Arc<CapturePipeline>| {
            tokio::spawn(async move { p.run(CaptureDepth::WithDetails).await })
        };
        let a = spawn_run(Arc::clone(&p));
        let b = spawn_run(Arc::clone(&p));

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(fetched.lock().unwrap().len(), 6);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_is_held_while_busy() {
        let (_dir, p) = pipeline(site());
        let guard = p.exclusive().await;
        assert!(p.is_busy());
        drop(guard);
        assert!(!p.is_busy());
    }
}
