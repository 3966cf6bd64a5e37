//! Cross-entry rollups. Everything here is derived from the entries and
//! reports of one run and never mutated on its own.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{ratio, AggregateSummary, DetailReport, EntryStatus, ListingEntry};

/// Merge detail reports into their listing entries.
///
/// The report's numbers replace the listing's; id and title are only filled
/// when the listing left them empty. Entries still lacking a title get the
/// generic fallback afterwards.
pub fn apply_reports(entries: &mut [ListingEntry], reports: &BTreeMap<String, DetailReport>) {
    let mut applied = 0usize;
    for entry in entries.iter_mut() {
        if let Some(report) = reports.get(&entry.token) {
            let s = &report.summary;
            entry.sales = s.sales_total;
            entry.tickets = s.tickets_total;
            entry.collected = s.collected_total;
            entry.rejected = s.rejected;
            entry.refresh_derived();

            if entry.title.is_empty() && !report.title.is_empty() {
                entry.title = report.title.clone();
            }
            if entry.id.is_empty() && !report.id.is_empty() {
                entry.id = report.id.clone();
            }
            applied += 1;
        }
        entry.fill_title_fallback();
    }
    debug!("Applied {applied} report(s) to {} entries", entries.len());
}

pub fn summarize(entries: &[ListingEntry]) -> AggregateSummary {
    let mut s = AggregateSummary {
        total_entries: entries.len(),
        ..Default::default()
    };
    for e in entries {
        match e.status {
            EntryStatus::Active => s.active_count += 1,
            EntryStatus::Finished => s.finished_count += 1,
            EntryStatus::Unknown => {}
        }
        s.sales_total += e.sales;
        s.tickets_total += e.tickets;
        s.collected_total += e.collected;
        s.rejected_total += e.rejected;
    }
    s.avg_ticket_overall = ratio(s.collected_total, s.sales_total);
    s
}

/// Top `n` entries by collected total. Ties keep listing order.
pub fn top_ranking(entries: &[ListingEntry], n: usize) -> Vec<ListingEntry> {
    let mut ranked: Vec<&ListingEntry> = entries.iter().filter(|e| e.collected > 0.0).collect();
    ranked.sort_by(|a, b| b.collected.total_cmp(&a.collected));
    ranked.into_iter().take(n).cloned().collect()
}
