//! The controller-side aggregate.
//!
//! An [`Aggregate`] maps sample keys to [`Accumulator`]s and, optionally, keeps a
//! running `TOTAL` that accumulates every key. It is mutated only by
//! [`Aggregate::merge`], one partial result at a time, so its state after any
//! prefix of arrivals is the fold of that prefix.
//!
//! A key whose partial results cannot be combined (binning or kind mismatch,
//! or a histogram pair whose halves disagree) is *poisoned*: its entry is dropped, the error is remembered, and every later
//! partial for that key is ignored. Other keys are never touched.

use crate::error::MergeError;
use crate::partial::{Accumulator, Mergeable, PartialResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Key under which the union of all entries is reported.
pub const TOTAL_KEY: &str = "TOTAL";

/// Merge-fold of all partial results received so far.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    entries: BTreeMap<String, Accumulator>,
    total: Option<Accumulator>,
    track_total: bool,
    poisoned: BTreeMap<String, String>,
    contributions: BTreeMap<String, u64>,
    merged: u64,
}

impl Aggregate {
    /// Empty aggregate that also maintains `TOTAL`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            track_total: true,
            ..Self::default()
        }
    }

    /// Empty aggregate without a `TOTAL` entry.
    #[must_use]
    pub fn without_total() -> Self {
        Self::default()
    }

    /// Reset to empty, keeping the `TOTAL` setting.
    pub fn clear(&mut self) {
        *self = Self {
            track_total: self.track_total,
            ..Self::default()
        };
    }

    /// Fold one partial result in. Returns the keys that failed to merge; those
    /// keys are now poisoned. Keys of `partial` merge independently.
    pub fn merge(&mut self, partial: PartialResult) -> Vec<(String, MergeError)> {
        self.merged += 1;
        let mut failures = Vec::new();
        for (key, value) in partial.into_entries() {
            if self.poisoned.contains_key(&key) {
                debug!(key = %key, "dropping partial result for poisoned key");
                continue;
            }
            let for_total = self.track_total.then(|| value.clone());
            if let Err(e) = self.merge_entry(&key, value) {
                warn!(key = %key, error = %e, "merge failed, key poisoned");
                self.entries.remove(&key);
                self.contributions.remove(&key);
                self.poisoned.insert(key.clone(), e.to_string());
                failures.push((key, e));
                self.rebuild_total();
                continue;
            }
            *self.contributions.entry(key).or_insert(0) += 1;
            if let Some(value) = for_total {
                self.merge_total(value);
            }
        }
        failures
    }

    fn merge_entry(&mut self, key: &str, value: Accumulator) -> Result<(), MergeError> {
        value.check()?;
        match self.entries.get_mut(key) {
            Some(existing) => existing.merge(value),
            None => {
                self.entries.insert(key.to_string(), value);
                Ok(())
            }
        }
    }

    /// Recompute `TOTAL` from the surviving entries, so a poisoned key no
    /// longer contributes to it.
    fn rebuild_total(&mut self) {
        if !self.track_total {
            return;
        }
        self.total = None;
        self.poisoned.remove(TOTAL_KEY);
        let values: Vec<Accumulator> = self.entries.values().cloned().collect();
        for value in values {
            self.merge_total(value);
        }
    }

    fn merge_total(&mut self, value: Accumulator) {
        if self.poisoned.contains_key(TOTAL_KEY) {
            return;
        }
        let result = match &mut self.total {
            Some(total) => total.merge(value),
            None => {
                self.total = Some(value);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "entries cannot be summed into {TOTAL_KEY}");
            self.total = None;
            self.poisoned.insert(TOTAL_KEY.to_string(), e.to_string());
        }
    }

    /// Entry for `key`; [`TOTAL_KEY`] reads the total. Item keys never equal
    /// [`TOTAL_KEY`]: tasks reject such items before dispatch.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Accumulator> {
        if key == TOTAL_KEY {
            return self.total.as_ref();
        }
        self.entries.get(key)
    }

    /// Per-key entries in key order (without `TOTAL`).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Accumulator)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    #[must_use]
    pub fn total(&self) -> Option<&Accumulator> {
        self.total.as_ref()
    }

    /// Keys that failed to merge, with the reason.
    #[must_use]
    pub fn poisoned(&self) -> &BTreeMap<String, String> {
        &self.poisoned
    }

    /// Number of partial results that contributed to `key`.
    #[must_use]
    pub fn contributions(&self, key: &str) -> u64 {
        self.contributions.get(key).copied().unwrap_or(0)
    }

    /// Number of partial results folded in (including empty ones).
    #[must_use]
    pub fn merged(&self) -> u64 {
        self.merged
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, totals and poisoned keys agree within `tolerance`.
    /// Contribution counters are ignored.
    #[must_use]
    pub fn approx_eq(&self, other: &Aggregate, tolerance: f64) -> bool {
        let totals = match (&self.total, &other.total) {
            (Some(a), Some(b)) => a.approx_eq(b, tolerance),
            (None, None) => true,
            _ => false,
        };
        totals
            && self.poisoned.keys().eq(other.poisoned.keys())
            && self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(k, v)| {
                other
                    .entries
                    .get(k)
                    .is_some_and(|o| v.approx_eq(o, tolerance))
            })
    }
}
