use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Listing entries
// ---------------------------------------------------------------------------

/// One campaign row from the paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// 1-based position in page-then-row order.
    #[serde(rename = "index")]
    pub index: usize,
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: String,
    pub status: EntryStatus,
    #[serde(rename = "data_token")]
    pub token: String,
    pub checkbox_value: String,
    #[serde(rename = "vendas_total")]
    pub sales: u64,
    #[serde(rename = "titulos_total")]
    pub tickets: u64,
    #[serde(rename = "arrecadado_total")]
    pub collected: f64,
    #[serde(rename = "ticket_medio")]
    pub avg_ticket: f64,
    #[serde(rename = "percentual_vendido")]
    pub percent_sold: f64,
    #[serde(rename = "recusadas")]
    pub rejected: u64,
    #[serde(rename = "data_captura")]
    pub captured_at: String,
}

impl ListingEntry {
    /// Recompute `avg_ticket` and `percent_sold` from the counters.
    pub fn refresh_derived(&mut self) {
        self.avg_ticket = ratio(self.collected, self.tickets);
        self.percent_sold = if self.tickets > 0 && self.sales > 0 {
            (self.sales as f64 / self.tickets as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Generic title for entries where neither the row nor the report had one.
    pub fn fill_title_fallback(&mut self) {
        if !self.title.is_empty() {
            return;
        }
        if !self.id.is_empty() {
            self.title = format!("Rifa {}", self.id);
        } else if !self.checkbox_value.is_empty() {
            self.title = format!("Rifa #{}", self.checkbox_value);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    #[serde(rename = "Ativo")]
    Active,
    #[serde(rename = "Finalizado")]
    Finished,
    #[default]
    #[serde(rename = "Desconhecido")]
    Unknown,
}

impl EntryStatus {
    /// Classify free text by keyword containment.
    pub fn from_text(text: &str) -> Self {
        let lc = text.to_lowercase();
        if lc.contains("inativ") || lc.contains("inactive") {
            EntryStatus::Unknown
        } else if lc.contains("ativ") || lc.contains("active") || lc.contains("aberto") {
            EntryStatus::Active
        } else if ["finaliz", "conclu", "encerr", "finished", "completed"]
            .iter()
            .any(|k| lc.contains(k))
        {
            EntryStatus::Finished
        } else {
            EntryStatus::Unknown
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryStatus::Active => "active",
            EntryStatus::Finished => "finished",
            EntryStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Detail reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailReport {
    pub token: String,
    pub url: String,
    #[serde(rename = "titulo")]
    pub title: String,
    pub id: String,
    #[serde(rename = "dados_tabela")]
    pub rows: Vec<DailyRow>,
    #[serde(rename = "resumo")]
    pub summary: ReportSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyRow {
    #[serde(rename = "data")]
    pub date: String,
    #[serde(rename = "ticket_medio")]
    pub avg_ticket: f64,
    #[serde(rename = "vendas")]
    pub sales: u64,
    #[serde(rename = "qtd_titulos")]
    pub tickets: u64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    #[serde(rename = "vendas_total")]
    pub sales_total: u64,
    #[serde(rename = "titulos_total")]
    pub tickets_total: u64,
    #[serde(rename = "arrecadado_total")]
    pub collected_total: f64,
    #[serde(rename = "ticket_medio_geral")]
    pub avg_ticket_overall: f64,
    #[serde(rename = "dias_com_vendas")]
    pub days_with_sales: usize,
    #[serde(rename = "recusadas")]
    pub rejected: u64,
}

impl ReportSummary {
    pub fn from_rows(rows: &[DailyRow], rejected: u64) -> Self {
        let sales_total = rows.iter().map(|r| r.sales).sum();
        let tickets_total = rows.iter().map(|r| r.tickets).sum();
        let collected_total: f64 = rows.iter().map(|r| r.total).sum();
        Self {
            sales_total,
            tickets_total,
            collected_total,
            avg_ticket_overall: ratio(collected_total, tickets_total),
            days_with_sales: rows.len(),
            rejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    #[serde(rename = "total_rifas")]
    pub total_entries: usize,
    #[serde(rename = "rifas_ativas")]
    pub active_count: usize,
    #[serde(rename = "rifas_finalizadas")]
    pub finished_count: usize,
    #[serde(rename = "vendas_total")]
    pub sales_total: u64,
    #[serde(rename = "titulos_total")]
    pub tickets_total: u64,
    #[serde(rename = "arrecadado_total")]
    pub collected_total: f64,
    #[serde(rename = "ticket_medio_geral")]
    pub avg_ticket_overall: f64,
    #[serde(rename = "total_recusadas")]
    pub rejected_total: u64,
}

// ---------------------------------------------------------------------------
// Capture session and persisted documents
// ---------------------------------------------------------------------------

/// Everything one run captured. Never mutated after it is written.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub run_at: chrono::DateTime<chrono::Local>,
    pub format_version: String,
    pub entries: Vec<ListingEntry>,
    pub reports: BTreeMap<String, DetailReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub timestamp: String,
    pub timestamp_unix: f64,
    #[serde(rename = "data")]
    pub date: String,
    #[serde(rename = "hora")]
    pub time: String,
    #[serde(rename = "versao")]
    pub version: String,
}

/// `captura_<stamp>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureDocument {
    #[serde(rename = "captura")]
    pub header: CaptureHeader,
    #[serde(rename = "resumo_geral")]
    pub summary: AggregateSummary,
    #[serde(rename = "rifas")]
    pub entries: Vec<ListingEntry>,
    #[serde(rename = "relatorios_detalhados", default)]
    pub reports: BTreeMap<String, DetailReport>,
}

/// `resumo_<stamp>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryDocument {
    pub timestamp: String,
    #[serde(rename = "resumo")]
    pub summary: AggregateSummary,
    #[serde(rename = "top_rifas")]
    pub top: Vec<ListingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    #[serde(rename = "path")]
    pub relative_path: String,
    pub timestamp: String,
    pub timestamp_unix: f64,
    #[serde(rename = "total_rifas")]
    pub total_entries: usize,
    #[serde(rename = "arrecadado_total")]
    pub collected_total: f64,
    pub size_kb: f64,
}

/// `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub updated: String,
    pub total_files: usize,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupRun {
    #[serde(rename = "hora")]
    pub time: String,
    #[serde(rename = "resumo")]
    pub summary: AggregateSummary,
}

/// `resumo_diario_<YYYYMMDD>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRollup {
    #[serde(rename = "data")]
    pub date: String,
    #[serde(rename = "primeira_captura")]
    pub first_run: String,
    #[serde(rename = "ultima_captura")]
    pub last_run: String,
    #[serde(rename = "capturas")]
    pub runs: Vec<RollupRun>,
    #[serde(rename = "resumo_final_dia")]
    pub final_summary: AggregateSummary,
}

/// `numerator / denominator`, or 0 when the denominator is zero.
pub fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator / denominator as f64
    } else {
        0.0
    }
}
