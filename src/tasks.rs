//! Concrete tasks.
//!
//! - [`EfficiencyTask`] fills an (accepted, rejected) histogram pair per work
//!   item. With [`Grouping::PerKey`] the aggregate holds one pair per sample
//!   key plus `TOTAL`; with [`Grouping::Single`] every item folds into one
//!   pair under a fixed label.
//! - [`StatsTask`] accumulates running statistics of named columns per key
//!   and warns about weight columns that never vary.

use crate::aggregate::{Aggregate, TOTAL_KEY};
use crate::error::{CalibError, ConfigError};
use crate::histogram::Binning;
use crate::partial::{HistogramPair, PartialResult};
use crate::selection::{Cut, Projection, Selection};
use crate::stats::StatsMap;
use crate::task::Task;
use crate::work_item::{Source, WorkItem};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How partial results are keyed in the aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grouping {
    /// One entry per work-item key, plus `TOTAL`.
    PerKey,
    /// Everything under one label.
    Single(String),
}

fn validate_items(items: &[WorkItem]) -> Result<(), ConfigError> {
    for (job_id, item) in items.iter().enumerate() {
        let reason = if item.key.is_empty() {
            Some("empty key")
        } else if item.key == TOTAL_KEY {
            Some("key is reserved for the total")
        } else if matches!(&item.source, Source::Chain { files, .. } if files.is_empty()) {
            Some("chain without files")
        } else if matches!(&item.source, Source::Chain { tree, .. } if tree.is_empty()) {
            Some("chain without a tree name")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::InvalidItem {
                job_id,
                key: item.key.clone(),
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}

fn merge_into(aggregate: &mut Aggregate, partial: PartialResult, job_id: usize) -> Result<(), CalibError> {
    let failures = aggregate.merge(partial);
    debug!(job_id, keys = aggregate.len(), "partial result merged");
    match failures.into_iter().next() {
        Some((key, source)) => Err(CalibError::Merge { key, source }),
        None => Ok(()),
    }
}

/// Accepted/rejected histogram production.
#[derive(Clone, Debug)]
pub struct EfficiencyTask {
    binning: Binning,
    selection: Selection,
    projection: Projection,
    grouping: Grouping,
    aggregate: Aggregate,
    worker: Option<usize>,
}

impl EfficiencyTask {
    /// # Errors
    /// [`ConfigError::InvalidBinning`] if the projection does not have one
    /// expression per binning axis.
    pub fn new(binning: Binning, selection: Selection, projection: Projection) -> Result<Self, ConfigError> {
        if projection.axes.len() != binning.dimension() {
            return Err(ConfigError::InvalidBinning(format!(
                "{} projection axes for a {}D binning",
                projection.axes.len(),
                binning.dimension()
            )));
        }
        Ok(Self {
            binning,
            selection,
            projection,
            grouping: Grouping::PerKey,
            aggregate: Aggregate::new(),
            worker: None,
        })
    }

    #[must_use]
    pub fn with_grouping(mut self, grouping: Grouping) -> Self {
        self.grouping = grouping;
        self
    }

    #[must_use]
    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    #[must_use]
    pub fn grouping(&self) -> &Grouping {
        &self.grouping
    }

    /// Fill the histogram pair of one item without touching the aggregate.
    ///
    /// # Errors
    /// Fails on unreadable sources or events missing a referenced column.
    pub fn fill(&self, item: &WorkItem) -> anyhow::Result<HistogramPair> {
        let mut pair = HistogramPair::new(&self.binning);
        item.for_each_event(|ev| {
            let Some(accepted) = self.selection.classify(ev)? else {
                return Ok(());
            };
            let coords = self.projection.coords(ev)?;
            let weight = self.projection.weight(ev)?;
            let hist = if accepted {
                &mut pair.accepted
            } else {
                &mut pair.rejected
            };
            hist.fill(&coords, weight);
            Ok(())
        })?;
        Ok(pair)
    }
}

impl Task for EfficiencyTask {
    type Item = WorkItem;
    type Partial = PartialResult;
    type Output = Aggregate;

    fn name(&self) -> &str {
        "efficiency"
    }

    fn validate(&self, items: &[WorkItem]) -> Result<(), ConfigError> {
        validate_items(items)
    }

    fn initialize_local(&mut self) {
        self.aggregate = match self.grouping {
            Grouping::PerKey => Aggregate::new(),
            Grouping::Single(_) => Aggregate::without_total(),
        };
    }

    fn initialize_remote(&mut self, worker_id: usize) -> anyhow::Result<()> {
        self.worker = Some(worker_id);
        Ok(())
    }

    fn process(&mut self, job_id: usize, item: &WorkItem) -> anyhow::Result<PartialResult> {
        let pair = self.fill(item)?;
        debug!(
            job_id,
            worker = ?self.worker,
            key = %item.key,
            accepted = pair.accepted.entries(),
            rejected = pair.rejected.entries(),
            "item filled"
        );
        let label = match &self.grouping {
            Grouping::PerKey => item.key.clone(),
            Grouping::Single(label) => label.clone(),
        };
        Ok(PartialResult::single(label, pair))
    }

    fn merge(&mut self, partial: PartialResult, job_id: usize) -> Result<(), CalibError> {
        merge_into(&mut self.aggregate, partial, job_id)
    }

    fn finalize(&mut self) {
        info!(
            keys = self.aggregate.len(),
            poisoned = self.aggregate.poisoned().len(),
            binning = %self.binning,
            "efficiency histograms complete"
        );
    }

    fn results(&self) -> &Aggregate {
        &self.aggregate
    }

    fn describe(&self, item: &WorkItem) -> String {
        item.key.clone()
    }
}

/// Running statistics of named columns, per key.
#[derive(Clone, Debug)]
pub struct StatsTask {
    variables: Vec<String>,
    weights: Vec<String>,
    cut: Cut,
    aggregate: Aggregate,
}

impl StatsTask {
    /// # Errors
    /// [`ConfigError::EmptyRequest`] when no variable is named.
    pub fn new<S: Into<String>>(variables: impl IntoIterator<Item = S>) -> Result<Self, ConfigError> {
        let variables: Vec<String> = variables.into_iter().map(Into::into).collect();
        if variables.is_empty() {
            return Err(ConfigError::EmptyRequest("no variables to summarize".into()));
        }
        Ok(Self {
            variables,
            weights: Vec::new(),
            cut: Cut::all(),
            aggregate: Aggregate::without_total(),
        })
    }

    /// Only events passing `cut` are summarized.
    #[must_use]
    pub fn with_cut(mut self, cut: Cut) -> Self {
        self.cut = cut;
        self
    }

    /// Columns to check for being trivial (e.g. sWeights fixed at one).
    /// Weight columns are summarized too.
    #[must_use]
    pub fn with_weights<S: Into<String>>(mut self, weights: impl IntoIterator<Item = S>) -> Self {
        for w in weights {
            let w = w.into();
            if !self.variables.contains(&w) {
                self.variables.push(w.clone());
            }
            self.weights.push(w);
        }
        self
    }

    /// `(key, column)` of every weight column with zero spread.
    #[must_use]
    pub fn trivial_weights(&self) -> Vec<(String, String)> {
        self.aggregate
            .iter()
            .filter_map(|(key, acc)| acc.as_stats().map(|s| (key, s)))
            .flat_map(|(key, stats)| {
                self.weights
                    .iter()
                    .filter(move |w| stats.get(w).is_some_and(|s| s.is_trivial()))
                    .map(move |w| (key.clone(), w.clone()))
            })
            .collect()
    }
}

impl Task for StatsTask {
    type Item = WorkItem;
    type Partial = PartialResult;
    type Output = Aggregate;

    fn name(&self) -> &str {
        "statistics"
    }

    fn validate(&self, items: &[WorkItem]) -> Result<(), ConfigError> {
        validate_items(items)
    }

    fn initialize_local(&mut self) {
        self.aggregate.clear();
    }

    fn process(&mut self, _job_id: usize, item: &WorkItem) -> anyhow::Result<PartialResult> {
        let mut stats = StatsMap::new();
        for v in &self.variables {
            stats.entry(v);
        }
        item.for_each_event(|ev| {
            if !self.cut.eval(ev)? {
                return Ok(());
            }
            for v in &self.variables {
                let x = ev
                    .get(v)
                    .ok_or_else(|| anyhow!("missing column '{v}'"))?;
                stats.entry(v).add(x);
            }
            Ok(())
        })?;
        Ok(PartialResult::single(item.key.clone(), stats))
    }

    fn merge(&mut self, partial: PartialResult, job_id: usize) -> Result<(), CalibError> {
        merge_into(&mut self.aggregate, partial, job_id)
    }

    fn finalize(&mut self) {
        for (key, column) in self.trivial_weights() {
            warn!(key = %key, column = %column, "weight column is trivial (zero rms), check the sample");
        }
    }

    fn results(&self) -> &Aggregate {
        &self.aggregate
    }

    fn describe(&self, item: &WorkItem) -> String {
        item.key.clone()
    }
}
