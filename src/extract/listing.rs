use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html};
use tracing::{debug, error, info, warn};

use super::html::{body_text_lc, children_named, closest, has_class, sel, text_of};
use crate::config::MAX_LIST_PAGES;
use crate::error::Result;
use crate::session::PageSource;
use crate::types::{EntryStatus, ListingEntry};
use crate::values::parse_money;

/// One checkbox per campaign row; carries the `data-token` attribute.
pub const MARKER_SELECTOR: &str = "input[type='checkbox'][name='rifa[]']";

/// Page text that means the listing is legitimately empty.
const NO_DATA_MARKERS: &[&str] = &["nenhuma rifa", "sem dados", "nenhum registro"];

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d{4,})").expect("static regex"));
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+\s*[º°ª]?\s*RAPIDINHA.*?R\$\s*[\d.,]*\d)").expect("static regex")
});
static MONEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"R\$\s*([\d.,]+)").expect("static regex"));
static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d.]*").expect("static regex"));

// ---------------------------------------------------------------------------
// Row field strategies
// ---------------------------------------------------------------------------

/// What a strategy sees of one listing row.
#[derive(Debug, Clone, Default)]
pub struct RowView {
    /// Text of each direct `<td>`, in order. Empty when the marker is not inside a table row.
    pub cells: Vec<String>,
    /// Full visible text of the row container.
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFields {
    pub id: String,
    pub title: String,
    pub status: EntryStatus,
    pub sales: u64,
    pub tickets: u64,
    pub collected: f64,
}

pub trait RowStrategy: Sync {
    fn name(&self) -> &'static str;
    /// `None` means "this strategy does not apply to the row", so the next one is tried.
    fn extract(&self, row: &RowView) -> Option<RowFields>;
}

/// Fixed column layout: marker, id, title, status, sales, tickets, collected[, avg ticket].
pub struct ColumnStrategy;

impl RowStrategy for ColumnStrategy {
    fn name(&self) -> &'static str {
        "columns"
    }

    fn extract(&self, row: &RowView) -> Option<RowFields> {
        if !(7..=8).contains(&row.cells.len()) {
            return None;
        }
        let c = &row.cells;
        Some(RowFields {
            id: c[1].clone(),
            title: c[2].clone(),
            status: EntryStatus::from_text(&c[3]),
            sales: first_count(&c[4]),
            tickets: first_count(&c[5]),
            collected: parse_money(&c[6]),
        })
    }
}

/// Pattern search over the row's text when the cell layout is unrecognized.
pub struct TextPatternStrategy;

impl RowStrategy for TextPatternStrategy {
    fn name(&self) -> &'static str {
        "text-patterns"
    }

    fn extract(&self, row: &RowView) -> Option<RowFields> {
        if row.text.trim().is_empty() {
            return None;
        }
        let text = &row.text;

        let id = ID_RE
            .captures(text)
            .map(|c| format!("#{}", &c[1]))
            .unwrap_or_default();
        let title = TITLE_RE
            .captures(text)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        // Several amounts can appear (price, goal, collected); the largest is taken as the total.
        let collected = MONEY_RE
            .captures_iter(text)
            .map(|c| parse_money(&c[1]))
            .fold(0.0_f64, f64::max);

        Some(RowFields {
            id,
            title,
            status: EntryStatus::from_text(text),
            collected,
            ..Default::default()
        })
    }
}

pub const ROW_STRATEGIES: [&dyn RowStrategy; 2] = [&ColumnStrategy, &TextPatternStrategy];

/// First number in the text, with `.` thousands separators removed: `"1.234 vendas"` → 1234.
fn first_count(text: &str) -> u64 {
    COUNT_RE
        .find(text)
        .and_then(|m| m.as_str().replace('.', "").parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// "Next page" locators
// ---------------------------------------------------------------------------

/// One way of finding the pagination control. Tried in `NEXT_LOCATORS` order.
pub struct NextLocator {
    pub name: &'static str,
    pub selector: &'static str,
    /// Required substrings of the link text; empty accepts any text.
    pub labels: &'static [&'static str],
}

pub const NEXT_LOCATORS: &[NextLocator] = &[
    NextLocator {
        name: "rel-next",
        selector: "a[rel='next']",
        labels: &[],
    },
    NextLocator {
        name: "pagination-link",
        selector: "ul.pagination a, li.page-item a, a.page-link",
        labels: &["Próxima", "Próximo", "›", "»", ">"],
    },
    NextLocator {
        name: "labelled-anchor",
        selector: "a",
        labels: &["Próxima", "Próximo"],
    },
    NextLocator {
        name: "aria-next",
        selector: "a[aria-label='Next'], a[aria-label='Próxima']",
        labels: &[],
    },
];

/// Resolve the next page URL, or `None` when no enabled control exists.
pub fn locate_next(doc: &Html, page_url: &Url) -> Option<String> {
    for locator in NEXT_LOCATORS {
        let selector = sel(locator.selector);
        for a in doc.select(&selector) {
            let label = text_of(a);
            if !locator.labels.is_empty() && !locator.labels.iter().any(|l| label.contains(l)) {
                continue;
            }
            if is_disabled(a) {
                continue;
            }
            let Some(href) = a.value().attr("href") else { continue };
            if let Ok(mut url) = page_url.join(href.trim()) {
                url.set_fragment(None);
                debug!("Next page via {}: {url}", locator.name);
                return Some(url.to_string());
            }
        }
    }
    None
}

fn is_disabled(a: ElementRef<'_>) -> bool {
    let href = a.value().attr("href").map(str::trim).unwrap_or("");
    if href.is_empty() || href == "#" || href.starts_with("javascript:") {
        return true;
    }
    if has_class(a, "disabled") || a.value().attr("aria-disabled") == Some("true") {
        return true;
    }
    a.parent()
        .and_then(ElementRef::wrap)
        .map(|p| has_class(p, "disabled"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Single page
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ParsedListingPage {
    pub entries: Vec<ListingEntry>,
    pub markers: usize,
    pub skipped_without_token: usize,
    pub no_data: bool,
    pub next_url: Option<String>,
}

pub fn parse_listing_page(html: &str, page_url: &Url) -> ParsedListingPage {
    let doc = Html::parse_document(html);
    let marker_sel = sel(MARKER_SELECTOR);
    let captured_at = chrono::Local::now().to_rfc3339();

    let mut parsed = ParsedListingPage::default();

    for marker in doc.select(&marker_sel) {
        parsed.markers += 1;

        let token = marker.value().attr("data-token").map(str::trim).unwrap_or("");
        if token.is_empty() {
            parsed.skipped_without_token += 1;
            continue;
        }

        let view = row_view(marker);
        let fields = ROW_STRATEGIES
            .iter()
            .find_map(|s| {
                let f = s.extract(&view)?;
                debug!("Row {token} extracted via {}", s.name());
                Some(f)
            })
            .unwrap_or_default();

        let mut entry = ListingEntry {
            id: fields.id,
            title: fields.title,
            status: fields.status,
            token: token.to_string(),
            checkbox_value: marker.value().attr("value").unwrap_or("").trim().to_string(),
            sales: fields.sales,
            tickets: fields.tickets,
            collected: fields.collected,
            captured_at: captured_at.clone(),
            ..Default::default()
        };
        entry.refresh_derived();
        parsed.entries.push(entry);
    }

    let body = body_text_lc(&doc);
    parsed.no_data = NO_DATA_MARKERS.iter().any(|m| body.contains(m));
    parsed.next_url = locate_next(&doc, page_url);
    parsed
}

fn row_view(marker: ElementRef<'_>) -> RowView {
    match closest(marker, &["tr"]) {
        Some(tr) => RowView {
            cells: children_named(tr, "td").into_iter().map(text_of).collect(),
            text: text_of(tr),
        },
        None => RowView {
            cells: Vec::new(),
            text: closest(marker, &["div", "li"]).map(text_of).unwrap_or_default(),
        },
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

enum ListState {
    FetchPage { page: usize, url: String },
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListTermination {
    Done,
    PageCap,
    Failed(String),
}

#[derive(Debug)]
pub struct ListingOutcome {
    pub entries: Vec<ListingEntry>,
    pub pages: usize,
    pub termination: ListTermination,
}

/// Walk the paginated listing from page 1. Only an authentication failure is
/// returned as an error; every other problem ends traversal with the entries
/// gathered so far.
pub async fn extract_listing(
    source: &mut dyn PageSource,
    base_url: &str,
) -> Result<ListingOutcome> {
    let start = format!("{}/admin/rifas", base_url.trim_end_matches('/'));
    let mut visited: HashSet<String> = HashSet::new();
    let mut entries: Vec<ListingEntry> = Vec::new();
    let mut pages = 0usize;
    let mut state = ListState::FetchPage { page: 1, url: start };

    let termination = loop {
        match state {
            ListState::FetchPage { page, url } => {
                if page > MAX_LIST_PAGES {
                    warn!("Listing page cap reached ({MAX_LIST_PAGES}); stopping traversal");
                    break ListTermination::PageCap;
                }
                visited.insert(url.clone());

                let fetched = match source.fetch(&url).await {
                    Ok(p) => p,
                    Err(e) if e.is_auth() => return Err(e),
                    Err(e) => {
                        state = ListState::Failed(format!("page {page} fetch failed: {e}"));
                        continue;
                    }
                };
                pages = page;

                let Ok(page_url) = Url::parse(&fetched.url).or_else(|_| Url::parse(&url)) else {
                    state = ListState::Failed(format!("page {page} has unusable URL {url}"));
                    continue;
                };
                let parsed = parse_listing_page(&fetched.html, &page_url);

                if parsed.skipped_without_token > 0 {
                    warn!(
                        "Page {page}: {} row(s) without data-token skipped",
                        parsed.skipped_without_token
                    );
                }
                info!(
                    page,
                    markers = parsed.markers,
                    extracted = parsed.entries.len(),
                    "Listing page {page}: {} entries",
                    parsed.entries.len()
                );
                for mut entry in parsed.entries {
                    entry.index = entries.len() + 1;
                    entries.push(entry);
                }

                state = if parsed.markers == 0 && !parsed.no_data && parsed.next_url.is_none() {
                    ListState::Failed(format!("page {page} has no row markers and no pagination"))
                } else if parsed.no_data {
                    info!("Page {page} reports no data; listing complete");
                    ListState::Done
                } else {
                    match parsed.next_url {
                        Some(next) if !visited.contains(&next) => ListState::FetchPage {
                            page: page + 1,
                            url: next,
                        },
                        Some(next) => {
                            debug!("Next link points back to visited page {next}");
                            ListState::Done
                        }
                        None => ListState::Done,
                    }
                };
            }
            ListState::Done => break ListTermination::Done,
            ListState::Failed(reason) => {
                error!("Listing traversal failed: {reason}");
                break ListTermination::Failed(reason);
            }
        }
    };

    info!("Listing complete: {} entries over {pages} page(s)", entries.len());
    Ok(ListingOutcome {
        entries,
        pages,
        termination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::StaticPages;

    const BASE: &str = "https://example.test";

    fn url(path: &str) -> String {
        format!("{BASE}{path}")
    }

    fn table_row(
        token: Option<&str>,
        id: &str,
        title: &str,
        status: &str,
        sales: &str,
        tickets: &str,
        money: &str,
    ) -> String {
        let token_attr = token.map(|t| format!(r#" data-token="{t}""#)).unwrap_or_default();
        format!(
            r#"<tr><td><input type="checkbox" name="rifa[]" value="{id}"{token_attr}></td>
               <td>{id}</td><td>{title}</td><td><span class="badge">{status}</span></td>
               <td>{sales}</td><td>{tickets}</td><td>{money}</td></tr>"#
        )
    }

    fn listing(rows: &[String], pagination: &str) -> String {
        format!(
            "<html><body><table class='table'><tbody>{}</tbody></table>{pagination}</body></html>",
            rows.join("\n")
        )
    }

    fn page_url() -> Url {
        Url::parse(&url("/admin/rifas")).unwrap()
    }

    #[test]
    fn rows_without_token_are_skipped() {
        let html = listing(
            &[
                table_row(Some("tok-a"), "1001", "1º RAPIDINHA", "Ativo", "10", "20", "R$ 100,00"),
                table_row(None, "1002", "2º RAPIDINHA", "Ativo", "1", "2", "R$ 10,00"),
                table_row(
                    Some("tok-c"),
                    "1003",
                    "3º RAPIDINHA",
                    "Finalizado",
                    "5",
                    "5",
                    "R$ 50,00",
                ),
            ],
            "",
        );
        let parsed = parse_listing_page(&html, &page_url());
        assert_eq!(parsed.markers, 3);
        assert_eq!(parsed.skipped_without_token, 1);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].token, "tok-a");
        assert_eq!(parsed.entries[1].token, "tok-c");
    }

    #[test]
    fn column_layout_maps_fields() {
        let html = listing(
            &[table_row(
                Some("tok"),
                "1001",
                "1º RAPIDINHA R$ 0,50",
                "Ativo",
                "1.234 vendas",
                "93 93%",
                "R$ 1.234,56",
            )],
            "",
        );
        let e = &parse_listing_page(&html, &page_url()).entries[0];
        assert_eq!(e.id, "1001");
        assert_eq!(e.title, "1º RAPIDINHA R$ 0,50");
        assert_eq!(e.status, EntryStatus::Active);
        assert_eq!(e.sales, 1234);
        assert_eq!(e.tickets, 93);
        assert!((e.collected - 1234.56).abs() < 1e-9);
        assert!((e.avg_ticket - 1234.56 / 93.0).abs() < 1e-9);
        assert_eq!(e.checkbox_value, "1001");
    }

    #[test]
    fn unrecognized_layout_falls_back_to_text_patterns() {
        let html = r#"<html><body><div class="card">
            <input type="checkbox" name="rifa[]" value="9" data-token="tok-x">
            <span>#123456</span> <h5>12º RAPIDINHA DO DIA - cota R$ 0,99</h5>
            <p>Status: Concluído</p><p>Meta R$ 5.000,00</p><p>Arrecadado R$ 7.250,50</p>
            </div></body></html>"#;
        let e = &parse_listing_page(html, &page_url()).entries[0];
        assert_eq!(e.id, "#123456");
        assert_eq!(e.title, "12º RAPIDINHA DO DIA - cota R$ 0,99");
        assert_eq!(e.status, EntryStatus::Finished);
        assert!((e.collected - 7250.50).abs() < 1e-9);
    }

    #[test]
    fn short_row_uses_text_strategy() {
        let view = RowView {
            cells: vec!["".into(), "#4321".into(), "R$ 10,00".into()],
            text: "#4321 ativo R$ 10,00 R$ 2,00".into(),
        };
        assert!(ColumnStrategy.extract(&view).is_none());
        let f = TextPatternStrategy.extract(&view).unwrap();
        assert_eq!(f.id, "#4321");
        assert_eq!(f.status, EntryStatus::Active);
        assert!((f.collected - 10.0).abs() < 1e-9);
    }

    #[test]
    fn next_locator_skips_disabled_controls() {
        let disabled = r##"<ul class="pagination"><li class="page-item disabled"><a class="page-link" href="#">Próxima</a></li></ul>"##;
        let doc = Html::parse_document(disabled);
        assert_eq!(locate_next(&doc, &page_url()), None);

        let enabled = r#"<ul class="pagination"><li class="page-item"><a class="page-link" href="?page=2">Próxima</a></li></ul>"#;
        let doc = Html::parse_document(enabled);
        assert_eq!(
            locate_next(&doc, &page_url()),
            Some(url("/admin/rifas?page=2"))
        );
    }

    #[test]
    fn rel_next_has_priority() {
        let html = r#"<a rel="next" href="/admin/rifas?page=3">3</a>
                      <ul class="pagination"><li><a href="/admin/rifas?page=2">›</a></li></ul>"#;
        let doc = Html::parse_document(html);
        assert_eq!(locate_next(&doc, &page_url()), Some(url("/admin/rifas?page=3")));
    }

    #[test]
    fn previous_link_is_not_next() {
        let html = r#"<ul class="pagination"><li><a href="/admin/rifas?page=1">‹ Anterior</a></li></ul>"#;
        let doc = Html::parse_document(html);
        assert_eq!(locate_next(&doc, &page_url()), None);
    }

    #[tokio::test]
    async fn traverses_pages_in_order() {
        let p1 = listing(
            &[
                table_row(Some("a"), "1", "A", "Ativo", "1", "1", "R$ 1,00"),
                table_row(Some("b"), "2", "B", "Ativo", "1", "1", "R$ 1,00"),
            ],
            r#"<ul class="pagination"><li><a href="/admin/rifas?page=2">Próxima</a></li></ul>"#,
        );
        let p2 = listing(
            &[table_row(Some("c"), "3", "C", "Finalizado", "1", "1", "R$ 1,00")],
            r##"<ul class="pagination"><li class="disabled"><a href="#">Próxima</a></li></ul>"##,
        );
        let mut pages = StaticPages::new([
            (url("/admin/rifas"), p1),
            (url("/admin/rifas?page=2"), p2),
        ]);

        let out = extract_listing(&mut pages, BASE).await.unwrap();
        assert_eq!(out.termination, ListTermination::Done);
        assert_eq!(out.pages, 2);
        let tokens: Vec<_> = out.entries.iter().map(|e| e.token.as_str()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
        let indexes: Vec<_> = out.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_page_without_indicator_fails_but_keeps_entries() {
        let p1 = listing(
            &[table_row(Some("a"), "1", "A", "Ativo", "1", "1", "R$ 1,00")],
            r#"<a rel="next" href="/admin/rifas?page=2">next</a>"#,
        );
        let p2 = "<html><body><p>Erro inesperado</p></body></html>";
        let mut pages = StaticPages::new([
            (url("/admin/rifas"), p1),
            (url("/admin/rifas?page=2"), p2.to_string()),
        ]);

        let out = extract_listing(&mut pages, BASE).await.unwrap();
        assert!(matches!(out.termination, ListTermination::Failed(_)));
        assert_eq!(out.entries.len(), 1);
    }

    #[tokio::test]
    async fn no_data_page_ends_cleanly() {
        let html = "<html><body><table><tr><td>Nenhuma rifa encontrada</td></tr></table></body></html>";
        let mut pages = StaticPages::new([(url("/admin/rifas"), html)]);
        let out = extract_listing(&mut pages, BASE).await.unwrap();
        assert_eq!(out.termination, ListTermination::Done);
        assert!(out.entries.is_empty());
    }

    #[tokio::test]
    async fn page_cap_stops_traversal() {
        let mut site = Vec::new();
        for n in 1..=60 {
            let path = if n == 1 {
                "/admin/rifas".to_string()
            } else {
                format!("/admin/rifas?page={n}")
            };
            let html = listing(
                &[table_row(
                    Some(&format!("t{n}")),
                    &n.to_string(),
                    "X",
                    "Ativo",
                    "1",
                    "1",
                    "R$ 1,00",
                )],
                &format!(r#"<a rel="next" href="/admin/rifas?page={}">next</a>"#, n + 1),
            );
            site.push((url(&path), html));
        }
        let mut pages = StaticPages::new(site);

        let out = extract_listing(&mut pages, BASE).await.unwrap();
        assert_eq!(out.termination, ListTermination::PageCap);
        assert_eq!(out.entries.len(), MAX_LIST_PAGES);
        assert_eq!(pages.fetched().len(), MAX_LIST_PAGES);
    }

    #[tokio::test]
    async fn self_referencing_next_terminates() {
        let html = listing(
            &[table_row(Some("a"), "1", "A", "Ativo", "1", "1", "R$ 1,00")],
            r#"<a rel="next" href="/admin/rifas">next</a>"#,
        );
        let mut pages = StaticPages::new([(url("/admin/rifas"), html)]);
        let out = extract_listing(&mut pages, BASE).await.unwrap();
        assert_eq!(out.termination, ListTermination::Done);
        assert_eq!(out.pages, 1);
    }
}
