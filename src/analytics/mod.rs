//! Derived metrics: per-ticker calculated fields and the industry roll-up.

use crate::models::{IndustrySummary, MetricsRow};
use crate::provider::cleaner::epoch_to_date;
use crate::storage::{Cell, Table, Tabular};
use crate::utils::format_ts;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

fn safe_div(x: Option<f64>, y: Option<f64>) -> Option<f64> {
    match (x, y) {
        (Some(x), Some(y)) if y != 0.0 => Some(x / y).filter(|v| v.is_finite()),
        _ => None,
    }
}

fn difference(x: Option<f64>, y: Option<f64>) -> Option<f64> {
    Some(x? - y?)
}

fn product(x: Option<f64>, y: Option<f64>) -> Option<f64> {
    Some(x? * y?)
}

// ── Calculated fields ─────────────────────────────────────────────────────────

type Formula = fn(Option<f64>, Option<f64>) -> Option<f64>;

const CALCULATED: [(&str, &str, &str, Formula); 8] = [
    ("Net Debt", "totalDebt", "totalCash", difference),
    ("Op CF M", "operatingCashflow", "totalRevenue", safe_div),
    ("FCF M", "freeCashflow", "totalRevenue", safe_div),
    ("PEG R", "forwardPE", "earningsGrowth", safe_div),
    ("FCF/Sh", "freeCashflow", "sharesOutstanding", safe_div),
    ("EV/FCF", "enterpriseValue", "freeCashflow", safe_div),
    ("D/EBITDA", "totalDebt", "ebitda", safe_div),
    ("Op P", "totalRevenue", "operatingMargins", product),
];

/// Add the derived ratio columns. A column is added only when the row carries
/// both operand fields; a missing operand or zero divisor leaves it null.
pub fn add_calculated_fields(row: &mut MetricsRow) {
    for (name, a, b, f) in CALCULATED {
        if row.fields.contains_key(a) && row.fields.contains_key(b) {
            let v = f(row.number(a), row.number(b));
            row.set_number(name, v);
        }
    }
}

pub const DATE_FIELDS: [&str; 4] = [
    "lastSplitDate",
    "lastFiscalYearEnd",
    "nextFiscalYearEnd",
    "mostRecentQuarter",
];

/// Epoch-second date fields → `YYYY-MM-DD`; anything unparseable becomes null.
pub fn convert_date_fields(row: &mut MetricsRow) {
    for key in DATE_FIELDS {
        if !row.fields.contains_key(key) {
            continue;
        }
        let date = row.number(key).and_then(epoch_to_date);
        row.fields
            .insert(key.to_string(), date.map(Value::String).unwrap_or(Value::Null));
    }
}

// ── Metrics table ─────────────────────────────────────────────────────────────

fn value_cell(v: Option<&Value>) -> Cell {
    match v {
        None | Some(Value::Null) => Cell::Empty,
        Some(Value::Number(n)) => Cell::number(n.as_f64()),
        Some(Value::String(s)) => Cell::Text(s.clone()),
        Some(Value::Bool(b)) => Cell::Text((if *b { "True" } else { "False" }).to_string()),
        Some(other) => Cell::Text(other.to_string()),
    }
}

/// Lay metrics rows out as a table.
///
/// `columns` selects and orders raw field names (those no row carries are
/// dropped); empty means Ticker, every field seen in sorted order, Timestamp.
/// Headers are then renamed through `rename`.
pub fn metrics_table(
    rows: &[MetricsRow],
    columns: &[String],
    rename: &BTreeMap<String, String>,
) -> Table {
    let present: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();

    let selected: Vec<String> = if columns.is_empty() {
        std::iter::once("Ticker")
            .chain(present.iter().copied().filter(|c| *c != "Ticker" && *c != "Timestamp"))
            .chain(std::iter::once("Timestamp"))
            .map(str::to_string)
            .collect()
    } else {
        columns
            .iter()
            .filter(|c| matches!(c.as_str(), "Ticker" | "Timestamp") || present.contains(c.as_str()))
            .cloned()
            .collect()
    };

    let headers = selected
        .iter()
        .map(|c| rename.get(c).cloned().unwrap_or_else(|| c.clone()))
        .collect();
    let mut table = Table::new(headers);

    for row in rows {
        let cells = selected
            .iter()
            .map(|c| match c.as_str() {
                "Ticker" => Cell::Text(row.ticker.clone()),
                "Timestamp" => Cell::text(row.timestamp.as_ref().map(format_ts).as_deref()),
                key => value_cell(row.fields.get(key)),
            })
            .collect();
        table.push(cells);
    }
    table
}

// ── Industry summary ──────────────────────────────────────────────────────────

pub const SUMMARY_COLUMNS: [&str; 26] = [
    "Industry", "# of Companies", "W/A P/E", "W/A EV/EBITDA", "T Mkt Cap", "T EV", "T Rev",
    "T Gr P", "T EBITDA", "T Op P", "T Net Inc", "T Op CF", "T FCF", "W/A Gr M",
    "W/A EBITDA M", "W/A Op M", "W/A Net M", "W/A Op CF M", "W/A FCF M", "Avg Rating",
    "T Analysts", "HHI Score", "CR1", "CR2", "CR4", "CR10",
];

#[derive(Default)]
struct Group {
    companies: usize,
    caps: Vec<f64>,
    sums: HashMap<&'static str, f64>,
    ratings: Vec<f64>,
}

const SUMMED: [&str; 10] = [
    "Mkt Cap", "EV", "Rev", "Gr P", "EBITDA", "Op P", "Net Inc", "Op CF", "FCF", "Analysts",
];

fn parse_num(s: Option<&String>) -> Option<f64> {
    s?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// HHI and CR1/2/4/10 over the non-missing market caps of one industry.
fn concentration(caps: &[f64]) -> [Option<f64>; 5] {
    let total: f64 = caps.iter().sum();
    if caps.is_empty() || total == 0.0 {
        return [None; 5];
    }
    let mut shares: Vec<f64> = caps.iter().map(|c| c / total).collect();
    shares.sort_by(|a, b| b.total_cmp(a));

    let top = |n: usize| -> Option<f64> {
        (shares.len() >= n).then(|| shares[..n].iter().sum())
    };
    let hhi = shares.iter().map(|s| s * s).sum::<f64>() * 10_000.0;
    let cr10 = shares.iter().take(10).sum();
    [Some(hhi), top(1), top(2), top(4), Some(cr10)]
}

/// Group full-metrics rows (keyed by output header) by `Industry`, blank → `none`.
/// Ordered by total market cap, largest first.
pub fn industry_summary(rows: &[HashMap<String, String>]) -> Vec<IndustrySummary> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for row in rows {
        let industry = row
            .get("Industry")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("none")
            .to_string();
        let g = groups.entry(industry).or_default();

        if row.get("Ticker").is_some_and(|t| !t.trim().is_empty()) {
            g.companies += 1;
        }
        for col in SUMMED {
            if let Some(v) = parse_num(row.get(col)) {
                *g.sums.entry(col).or_default() += v;
                if col == "Mkt Cap" {
                    g.caps.push(v);
                }
            }
        }
        if let Some(r) = parse_num(row.get("Avg Rating")) {
            g.ratings.push(r);
        }
    }

    let mut out: Vec<IndustrySummary> = groups
        .into_iter()
        .map(|(industry, g)| {
            let t = |c: &str| g.sums.get(c).copied().unwrap_or(0.0);
            let rev = Some(t("Rev"));
            let [hhi, cr1, cr2, cr4, cr10] = concentration(&g.caps);
            IndustrySummary {
                industry,
                companies: g.companies,
                total_market_cap: t("Mkt Cap"),
                total_ev: t("EV"),
                total_revenue: t("Rev"),
                total_gross_profit: t("Gr P"),
                total_ebitda: t("EBITDA"),
                total_operating_profit: t("Op P"),
                total_net_income: t("Net Inc"),
                total_operating_cf: t("Op CF"),
                total_fcf: t("FCF"),
                avg_rating: (!g.ratings.is_empty())
                    .then(|| g.ratings.iter().sum::<f64>() / g.ratings.len() as f64),
                total_analysts: t("Analysts"),
                wa_gross_margin: safe_div(Some(t("Gr P")), rev),
                wa_ebitda_margin: safe_div(Some(t("EBITDA")), rev),
                wa_operating_margin: safe_div(Some(t("Op P")), rev),
                wa_net_margin: safe_div(Some(t("Net Inc")), rev),
                wa_operating_cf_margin: safe_div(Some(t("Op CF")), rev),
                wa_fcf_margin: safe_div(Some(t("FCF")), rev),
                wa_pe: safe_div(Some(t("Mkt Cap")), Some(t("Net Inc"))),
                wa_ev_ebitda: safe_div(Some(t("EV")), Some(t("EBITDA"))),
                hhi,
                cr1,
                cr2,
                cr4,
                cr10,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.total_market_cap
            .total_cmp(&a.total_market_cap)
            .then_with(|| a.industry.cmp(&b.industry))
    });
    out
}

impl Tabular for IndustrySummary {
    fn columns() -> Vec<String> {
        SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    fn cells(&self) -> Vec<Cell> {
        let n = |v: f64| Cell::number(Some(v));
        vec![
            Cell::Text(self.industry.clone()),
            n(self.companies as f64),
            Cell::number(self.wa_pe),
            Cell::number(self.wa_ev_ebitda),
            n(self.total_market_cap),
            n(self.total_ev),
            n(self.total_revenue),
            n(self.total_gross_profit),
            n(self.total_ebitda),
            n(self.total_operating_profit),
            n(self.total_net_income),
            n(self.total_operating_cf),
            n(self.total_fcf),
            Cell::number(self.wa_gross_margin),
            Cell::number(self.wa_ebitda_margin),
            Cell::number(self.wa_operating_margin),
            Cell::number(self.wa_net_margin),
            Cell::number(self.wa_operating_cf_margin),
            Cell::number(self.wa_fcf_margin),
            Cell::number(self.avg_rating),
            n(self.total_analysts),
            Cell::number(self.hhi),
            Cell::number(self.cr1),
            Cell::number(self.cr2),
            Cell::number(self.cr4),
            Cell::number(self.cr10),
        ]
    }
}
