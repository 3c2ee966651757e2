//! End-of-run summary tables.

use crate::aggregate::{Aggregate, TOTAL_KEY};
use crate::efficiency::{BinEfficiency, BinSpread, efficiency, integrated};
use crate::manager::RunReport;
use comfy_table::{Cell, Table};
use std::collections::BTreeMap;
use std::fmt;

const PRESET: &str = "||--+-++|    ++++++";

/// Row outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum RowStatus {
    Ok,
    /// The key's partial results could not be merged.
    Failed(String),
    /// Every item with this label failed; nothing was merged.
    NoData(usize),
}

/// One line of the efficiency summary.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportRow {
    pub sample: String,
    /// Partial results merged into this row.
    pub items: u64,
    /// Sum of accepted weights and its error.
    pub accepted: (f64, f64),
    pub rejected: (f64, f64),
    pub spread: Option<BinSpread>,
    pub integrated: Option<BinEfficiency>,
    pub status: RowStatus,
}

impl ReportRow {
    fn failed(sample: &str, status: RowStatus) -> Self {
        Self {
            sample: sample.to_string(),
            items: 0,
            accepted: (0.0, 0.0),
            rejected: (0.0, 0.0),
            spread: None,
            integrated: None,
            status,
        }
    }
}

/// Efficiency summary over an aggregate of histogram pairs.
#[derive(Clone, Debug)]
pub struct Report {
    title: String,
    rows: Vec<ReportRow>,
}

impl Report {
    /// One row per key with a histogram pair, then `TOTAL`, then a row for
    /// every key that failed to merge.
    #[must_use]
    pub fn from_aggregate(title: impl Into<String>, aggregate: &Aggregate) -> Self {
        let total_items: u64 = aggregate.keys().map(|k| aggregate.contributions(k)).sum();
        let mut rows: Vec<ReportRow> = aggregate
            .iter()
            .filter_map(|(key, acc)| acc.as_pair().map(|p| (key.as_str(), aggregate.contributions(key), p)))
            .chain(
                aggregate
                    .total()
                    .and_then(|t| t.as_pair())
                    .map(|p| (TOTAL_KEY, total_items, p)),
            )
            .map(|(key, items, pair)| {
                let eff = efficiency(pair);
                ReportRow {
                    sample: key.to_string(),
                    items,
                    accepted: pair.accepted.integral(),
                    rejected: pair.rejected.integral(),
                    spread: Some(eff.spread()),
                    integrated: Some(integrated(pair)),
                    status: RowStatus::Ok,
                }
            })
            .collect();
        rows.extend(
            aggregate
                .poisoned()
                .iter()
                .map(|(key, reason)| ReportRow::failed(key, RowStatus::Failed(reason.clone()))),
        );
        Self {
            title: title.into(),
            rows,
        }
    }

    /// Add a row for every item label of `run` that failed and never
    /// merged, so it shows up as a failure instead of being absent. Labels
    /// that already have a row keep it.
    #[must_use]
    pub fn with_run(mut self, run: &RunReport) -> Self {
        let mut missing: BTreeMap<&str, usize> = BTreeMap::new();
        for item in &run.failed_items {
            let label = item.label.as_str();
            if label.is_empty() || run.merged_labels.contains_key(label) || self.rows.iter().any(|r| r.sample == label) {
                continue;
            }
            *missing.entry(label).or_insert(0) += 1;
        }
        self.rows.extend(
            missing
                .into_iter()
                .map(|(key, n)| ReportRow::failed(key, RowStatus::NoData(n))),
        );
        self
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    #[must_use]
    pub fn row(&self, sample: &str) -> Option<&ReportRow> {
        self.rows.iter().find(|r| r.sample == sample)
    }

    #[must_use]
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(PRESET);
        table.set_header(vec![
            Cell::new("Sample"),
            Cell::new("#items"),
            Cell::new("#accepted [10^3]"),
            Cell::new("#rejected [10^3]"),
            Cell::new("<eff> [%]"),
            Cell::new("integrated eff [%]"),
            Cell::new("min [%]"),
            Cell::new("max [%]"),
            Cell::new("status"),
        ]);
        for row in &self.rows {
            let status = match &row.status {
                RowStatus::Ok => match row.spread {
                    Some(s) if s.degenerate > 0 => format!("{} empty bin(s)", s.degenerate),
                    _ => "ok".to_string(),
                },
                RowStatus::Failed(reason) => format!("FAILED: {reason}"),
                RowStatus::NoData(n) => format!("FAILED: {n} item(s), no data"),
            };
            let mut cells = vec![Cell::new(&row.sample), Cell::new(row.items)];
            if row.status == RowStatus::Ok {
                let (a, ea) = row.accepted;
                let (r, er) = row.rejected;
                cells.push(Cell::new(format!("{:9.1} +- {:<5.1}", a / 1e3, ea / 1e3)));
                cells.push(Cell::new(format!("{:9.1} +- {:<5.1}", r / 1e3, er / 1e3)));
                cells.push(Cell::new(row.spread.map_or_else(String::new, |s| {
                    format!("{:6.2} +- {:<5.2}", 100.0 * s.mean, 100.0 * s.rms)
                })));
                cells.push(Cell::new(row.integrated.map_or_else(String::new, |e| {
                    format!("{:6.2} +- {:<5.2}", 100.0 * e.value, 100.0 * e.error)
                })));
                cells.push(Cell::new(row.spread.map_or_else(String::new, |s| format!("{:+7.1}", 100.0 * s.min))));
                cells.push(Cell::new(row.spread.map_or_else(String::new, |s| format!("{:+7.1}", 100.0 * s.max))));
            } else {
                cells.extend((0..6).map(|_| Cell::new("-")));
            }
            cells.push(Cell::new(status));
            table.add_row(cells);
        }
        table
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        write!(f, "{}", self.table())
    }
}

/// Per-variable statistics of an aggregate of running statistics.
#[must_use]
pub fn stats_table(aggregate: &Aggregate) -> Table {
    let mut table = Table::new();
    table.load_preset(PRESET);
    table.set_header(vec![
        Cell::new("Sample"),
        Cell::new("Variable"),
        Cell::new("#entries"),
        Cell::new("mean +- rms"),
        Cell::new("min / max"),
    ]);
    for (key, acc) in aggregate.iter() {
        let Some(stats) = acc.as_stats() else {
            continue;
        };
        for (name, s) in stats.iter() {
            let trivial = if s.is_trivial() { " (trivial)" } else { "" };
            table.add_row(vec![
                Cell::new(key),
                Cell::new(format!("{name}{trivial}")),
                Cell::new(s.count()),
                Cell::new(format!("{:+.3} +- {:<.3}", s.mean(), s.rms())),
                Cell::new(format!(
                    "{:+.3} / {:+.3}",
                    s.min().unwrap_or(0.0),
                    s.max().unwrap_or(0.0)
                )),
            ]);
        }
    }
    table
}
