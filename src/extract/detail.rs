use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::{debug, error, info, warn};

use super::html::{children_named, sel, text_of};
use crate::error::{AppError, Result};
use crate::session::PageSource;
use crate::types::{DailyRow, DetailReport, ListingEntry, ReportSummary};
use crate::values::{parse_money, parse_quantity};

/// Breadcrumb items containing this word name the campaign.
const TITLE_KEYWORD: &str = "rapidinha";

static REJECTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)recusadas\s*:\s*(\d+)").expect("static regex"));

/// `{base}/admin/rifas/relatorios/{token}`
pub fn report_url(base_url: &str, token: &str) -> String {
    format!("{}/admin/rifas/relatorios/{token}", base_url.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Column mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Date,
    AvgTicket,
    Sales,
    Tickets,
    Total,
}

impl Column {
    /// Classify a header cell. Checked in order, so "Ticket Médio" is never read as a total.
    pub fn from_header(header: &str) -> Option<Self> {
        let h = header.to_lowercase();
        if h.contains("data") {
            Some(Column::Date)
        } else if h.contains("ticket") || h.contains("tícket") {
            Some(Column::AvgTicket)
        } else if h.contains("vendas") {
            Some(Column::Sales)
        } else if h.contains("qtd") || h.contains("título") || h.contains("titulo") {
            Some(Column::Tickets)
        } else if h.contains("total") {
            Some(Column::Total)
        } else {
            None
        }
    }
}

/// Header index of each recognized column. The first header wins on duplicates.
#[derive(Debug, Default)]
pub struct ColumnMap {
    slots: Vec<(Column, usize)>,
    header_count: usize,
}

impl ColumnMap {
    pub fn from_headers(headers: &[String]) -> Self {
        let mut slots: Vec<(Column, usize)> = Vec::new();
        for (i, h) in headers.iter().enumerate() {
            if let Some(col) = Column::from_header(h) {
                if !slots.iter().any(|(c, _)| *c == col) {
                    slots.push((col, i));
                }
            }
        }
        Self {
            slots,
            header_count: headers.len(),
        }
    }

    fn cell<'a>(&self, cells: &'a [String], col: Column) -> Option<&'a str> {
        self.slots
            .iter()
            .find(|(c, _)| *c == col)
            .and_then(|(_, i)| cells.get(*i))
            .map(String::as_str)
    }

    /// `None` for short rows and rows without a usable date.
    pub fn parse_row(&self, cells: &[String]) -> Option<DailyRow> {
        if cells.len() < self.header_count {
            return None;
        }
        let date = self.cell(cells, Column::Date)?.trim();
        if !date.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(DailyRow {
            date: date.to_string(),
            avg_ticket: self.cell(cells, Column::AvgTicket).map(parse_money).unwrap_or(0.0),
            sales: self.cell(cells, Column::Sales).map(parse_quantity).unwrap_or(0),
            tickets: self.cell(cells, Column::Tickets).map(parse_quantity).unwrap_or(0),
            total: self.cell(cells, Column::Total).map(parse_money).unwrap_or(0.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Page parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SalesTable {
    pub rows: Vec<DailyRow>,
    pub discarded: usize,
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub struct ParsedDetailPage {
    pub breadcrumb_title: Option<String>,
    /// `None` when no table has both a date and a sales header.
    pub table: Option<SalesTable>,
}

pub fn parse_detail_page(html: &str) -> ParsedDetailPage {
    let doc = Html::parse_document(html);
    ParsedDetailPage {
        breadcrumb_title: breadcrumb_title(&doc),
        table: find_sales_table(&doc).map(parse_sales_table),
    }
}

/// Last breadcrumb item naming a campaign.
fn breadcrumb_title(doc: &Html) -> Option<String> {
    let items: Vec<String> = doc.select(&sel(".breadcrumb li")).map(text_of).collect();
    items
        .into_iter()
        .rev()
        .find(|t| t.to_lowercase().contains(TITLE_KEYWORD))
}

fn header_texts(table: ElementRef<'_>) -> Vec<String> {
    let thead: Vec<String> = table.select(&sel("thead th")).map(text_of).collect();
    if !thead.is_empty() {
        return thead;
    }
    table
        .select(&sel("tr"))
        .next()
        .map(|tr| children_named(tr, "th").into_iter().map(text_of).collect())
        .unwrap_or_default()
}

fn find_sales_table(doc: &Html) -> Option<ElementRef<'_>> {
    doc.select(&sel("table")).find(|t| {
        let headers = header_texts(*t).join(" ").to_lowercase();
        headers.contains("data") && headers.contains("vendas")
    })
}

fn parse_sales_table(table: ElementRef<'_>) -> SalesTable {
    let map = ColumnMap::from_headers(&header_texts(table));

    let mut body_rows: Vec<ElementRef<'_>> = table.select(&sel("tbody tr")).collect();
    if body_rows.is_empty() {
        body_rows = table
            .select(&sel("tr"))
            .filter(|tr| children_named(*tr, "th").is_empty())
            .collect();
    }

    let mut out = SalesTable::default();
    for tr in body_rows {
        let cells: Vec<String> = children_named(tr, "td").into_iter().map(text_of).collect();
        match map.parse_row(&cells) {
            Some(row) => out.rows.push(row),
            None => out.discarded += 1,
        }
    }

    let footer = table
        .select(&sel("tfoot"))
        .next()
        .map(text_of)
        .unwrap_or_else(|| text_of(table));
    out.rejected = REJECTED_RE
        .captures(&footer)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    out
}

/// Build the report for one entry from its detail page, or an extraction
/// error when the page has no recognizable sales table.
pub fn build_report(entry: &ListingEntry, url: &str, html: &str) -> Result<DetailReport> {
    let parsed = parse_detail_page(html);
    let table = parsed.table.ok_or_else(|| {
        AppError::Extraction(format!("no sales table on report page for token {}", entry.token))
    })?;
    if table.discarded > 0 {
        debug!("Token {}: {} table row(s) discarded", entry.token, table.discarded);
    }

    let title = if entry.title.is_empty() {
        parsed.breadcrumb_title.unwrap_or_default()
    } else {
        entry.title.clone()
    };

    Ok(DetailReport {
        token: entry.token.clone(),
        url: url.to_string(),
        title,
        id: entry.id.clone(),
        summary: ReportSummary::from_rows(&table.rows, table.rejected),
        rows: table.rows,
    })
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DetailStage {
    pub reports: BTreeMap<String, DetailReport>,
    pub failures: usize,
    /// Set when the session was lost; reports gathered before that are kept.
    pub auth_lost: bool,
}

/// Fetch one report per distinct token, in entry order. Failures are
/// per-entry and never abort the stage, except a lost session.
pub async fn extract_details(
    source: &mut dyn PageSource,
    base_url: &str,
    entries: &[ListingEntry],
    wait: Duration,
) -> DetailStage {
    let mut stage = DetailStage::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let targets: Vec<&ListingEntry> = entries.iter().filter(|e| e.has_token()).collect();
    info!("Capturing detail reports for {} entries", targets.len());

    for (n, entry) in targets.iter().enumerate() {
        if !seen.insert(entry.token.as_str()) {
            warn!("Duplicate token {} (entry {}); reusing its report", entry.token, entry.index);
            continue;
        }
        if n > 0 && !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let url = report_url(base_url, &entry.token);
        let page = match source.fetch(&url).await {
            Ok(p) => p,
            Err(e) if e.is_auth() => {
                error!("Session lost during detail capture: {e}");
                stage.auth_lost = true;
                break;
            }
            Err(e) => {
                warn!("Detail fetch failed for {}: {e}", entry.token);
                stage.failures += 1;
                continue;
            }
        };

        match build_report(entry, &page.url, &page.html) {
            Ok(report) => {
                debug!(
                    token = %entry.token,
                    days = report.summary.days_with_sales,
                    "Report captured: {} sales, R$ {:.2}",
                    report.summary.sales_total,
                    report.summary.collected_total
                );
                stage.reports.insert(entry.token.clone(), report);
            }
            Err(e) => {
                warn!("{e}");
                stage.failures += 1;
            }
        }
    }

    info!(
        "Detail stage: {} report(s), {} failure(s)",
        stage.reports.len(),
        stage.failures
    );
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::StaticPages;

    const BASE: &str = "https://example.test";

    fn entry(index: usize, token: &str, title: &str) -> ListingEntry {
        ListingEntry {
            index,
            id: format!("{}", 1000 + index),
            title: title.to_string(),
            token: token.to_string(),
            ..Default::default()
        }
    }

    fn report_page(breadcrumb: &str, headers: &[&str], rows: &[&[&str]], footer: &str) -> String {
        let ths: String = headers.iter().map(|h| format!("<th>{h}</th>")).collect();
        let trs: String = rows
            .iter()
            .map(|r| {
                let tds: String = r.iter().map(|c| format!("<td>{c}</td>")).collect();
                format!("<tr>{tds}</tr>")
            })
            .collect();
        format!(
            r#"<html><body>
               <ol class="breadcrumb"><li>Início</li><li>Rifas</li><li>{breadcrumb}</li><li>Relatório</li></ol>
               <table class="table"><thead><tr>{ths}</tr></thead><tbody>{trs}</tbody>
               <tfoot><tr><td>{footer}</td></tr></tfoot></table>
               </body></html>"#
        )
    }

    const HEADERS: &[&str] = &["Data", "Ticket Médio", "Vendas", "Qtd. Títulos", "Total"];

    #[test]
    fn two_day_report_summary() {
        let html = report_page(
            "12º RAPIDINHA",
            HEADERS,
            &[
                &["01/05", "R$ 10,00", "10", "12", "R$ 120,00"],
                &["02/05", "R$ 10,00", "5", "5", "R$ 50,00"],
            ],
            "Recusadas: 3",
        );
        let report = build_report(&entry(1, "tok", ""), "u", &html).unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.summary.sales_total, 15);
        assert_eq!(report.summary.tickets_total, 17);
        assert!((report.summary.collected_total - 170.0).abs() < 1e-9);
        assert!((report.summary.avg_ticket_overall - 10.0).abs() < 1e-9);
        assert_eq!(report.summary.days_with_sales, 2);
        assert_eq!(report.summary.rejected, 3);
        assert_eq!(report.title, "12º RAPIDINHA");
    }

    #[test]
    fn columns_are_mapped_by_header_not_position() {
        let html = report_page(
            "x",
            &["Total", "Vendas", "Data", "Qtd. Títulos"],
            &[&["R$ 1.500,00", "7", "03/05", "30"]],
            "",
        );
        let table = parse_detail_page(&html).table.unwrap();
        assert_eq!(
            table.rows,
            vec![DailyRow {
                date: "03/05".to_string(),
                avg_ticket: 0.0,
                sales: 7,
                tickets: 30,
                total: 1500.0,
            }]
        );
        assert_eq!(table.rejected, 0);
    }

    #[test]
    fn short_and_dateless_rows_are_discarded() {
        let html = report_page(
            "x",
            HEADERS,
            &[
                &["01/05", "R$ 1,00", "1", "1", "R$ 1,00"],
                &["Total", "", "1", "1", "R$ 1,00"],
                &["02/05", "R$ 1,00"],
            ],
            "",
        );
        let table = parse_detail_page(&html).table.unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.discarded, 2);
    }

    #[test]
    fn table_without_sales_header_is_ignored() {
        let html = r#"<table><thead><tr><th>Data</th><th>Evento</th></tr></thead>
                      <tbody><tr><td>01/05</td><td>x</td></tr></tbody></table>"#;
        assert!(parse_detail_page(html).table.is_none());
        let err = build_report(&entry(1, "t", ""), "u", html).unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[test]
    fn existing_title_is_kept() {
        let html = report_page("9º RAPIDINHA", HEADERS, &[], "");
        let report = build_report(&entry(1, "tok", "Campanha"), "u", &html).unwrap();
        assert_eq!(report.title, "Campanha");
        assert_eq!(report.summary, ReportSummary::default());
    }

    #[test]
    fn breadcrumb_prefers_last_matching_item() {
        let html = r#"<ul class="breadcrumb"><li>Rapidinhas</li><li>5º Rapidinha R$ 0,50</li><li>Relatório</li></ul>"#;
        assert_eq!(
            parse_detail_page(html).breadcrumb_title.as_deref(),
            Some("5º Rapidinha R$ 0,50")
        );
    }

    #[tokio::test]
    async fn stage_skips_failures_and_duplicate_tokens() {
        let good = report_page("A", HEADERS, &[&["01/05", "R$ 2,00", "2", "2", "R$ 4,00"]], "");
        let mut pages = StaticPages::new([
            (report_url(BASE, "a"), good),
            (report_url(BASE, "b"), "<html><body>erro</body></html>".to_string()),
        ]);
        let entries = vec![
            entry(1, "a", ""),
            entry(2, "b", ""),
            entry(3, "", "no token"),
            entry(4, "missing", ""),
            entry(5, "a", ""),
        ];

        let stage = extract_details(&mut pages, BASE, &entries, Duration::ZERO).await;
        assert_eq!(stage.reports.len(), 1);
        assert_eq!(stage.failures, 2);
        assert!(!stage.auth_lost);
        assert_eq!(pages.fetched().len(), 3);
        assert_eq!(stage.reports["a"].summary.sales_total, 2);
    }
}
