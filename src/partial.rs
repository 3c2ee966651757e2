//! The partial-result algebra.
//!
//! Every value a worker returns must fold into the controller's aggregate with a
//! binary operation that is associative and commutative and has an identity.
//! [`Mergeable`] captures that contract. It is the `merge` half of a combiner:
//! there is no `add_input`, because partial results are produced whole by
//! workers and only ever combined.
//!
//! Three flavors implement it:
//!
//! - [`HistogramPair`] -- `(acc1, rej1) + (acc2, rej2) = (acc1 + acc2, rej1 + rej2)`.
//! - [`StatsMap`] -- per-variable running statistics.
//! - [`PartialResult`] -- a dictionary of keyed [`Accumulator`]s; keys merge
//!   independently and a key missing on one side is inserted as-is.

use crate::error::MergeError;
use crate::histogram::{Binning, Histogram};
use crate::stats::StatsMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Associative, commutative combination with an identity ([`Mergeable::is_empty`] values).
pub trait Mergeable: Sized {
    /// Fold `other` into `self`.
    ///
    /// On error `self` must be left unchanged.
    ///
    /// # Errors
    /// Returns a [`MergeError`] when the two values are structurally incompatible.
    fn merge(&mut self, other: Self) -> Result<(), MergeError>;

    /// `true` for identity elements: merging them is a no-op.
    fn is_empty(&self) -> bool;
}

impl Mergeable for Histogram {
    fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        self.add(&other)
    }

    fn is_empty(&self) -> bool {
        Histogram::is_empty(self)
    }
}

impl Mergeable for StatsMap {
    fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        self.combine(other);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        StatsMap::is_empty(self)
    }
}

/// Accepted and rejected distributions over the same binning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramPair {
    pub accepted: Histogram,
    pub rejected: Histogram,
}

impl HistogramPair {
    /// Zero-filled pair; the identity element for this binning.
    #[must_use]
    pub fn new(binning: &Binning) -> Self {
        Self {
            accepted: Histogram::new(binning, "Accepted"),
            rejected: Histogram::new(binning, "Rejected"),
        }
    }

    /// # Errors
    /// [`MergeError::BinningMismatch`] if the two histograms disagree.
    pub fn from_parts(accepted: Histogram, rejected: Histogram) -> Result<Self, MergeError> {
        accepted.check_compatible(&rejected)?;
        Ok(Self { accepted, rejected })
    }

    #[must_use]
    pub fn binning(&self) -> &Binning {
        self.accepted.binning()
    }

    /// # Errors
    /// [`MergeError::BinningMismatch`] if the two halves disagree.
    pub fn check(&self) -> Result<(), MergeError> {
        self.accepted.check_compatible(&self.rejected)
    }

    #[must_use]
    pub fn approx_eq(&self, other: &HistogramPair, tolerance: f64) -> bool {
        self.accepted.approx_eq(&other.accepted, tolerance)
            && self.rejected.approx_eq(&other.rejected, tolerance)
    }
}

impl Mergeable for HistogramPair {
    fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        // validate both halves first so a mismatch leaves self untouched
        self.accepted.check_compatible(&other.accepted)?;
        self.rejected.check_compatible(&other.rejected)?;
        self.accepted.add(&other.accepted)?;
        self.rejected.add(&other.rejected)?;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// The per-key value held by a [`PartialResult`] or an aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    Pair(HistogramPair),
    Stats(StatsMap),
}

impl Accumulator {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Accumulator::Pair(_) => "histogram pair",
            Accumulator::Stats(_) => "statistics",
        }
    }

    #[must_use]
    pub fn as_pair(&self) -> Option<&HistogramPair> {
        match self {
            Accumulator::Pair(p) => Some(p),
            Accumulator::Stats(_) => None,
        }
    }

    #[must_use]
    pub fn as_stats(&self) -> Option<&StatsMap> {
        match self {
            Accumulator::Stats(s) => Some(s),
            Accumulator::Pair(_) => None,
        }
    }

    #[must_use]
    pub fn approx_eq(&self, other: &Accumulator, tolerance: f64) -> bool {
        match (self, other) {
            (Accumulator::Pair(a), Accumulator::Pair(b)) => a.approx_eq(b, tolerance),
            (Accumulator::Stats(a), Accumulator::Stats(b)) => a.approx_eq(b, tolerance),
            _ => false,
        }
    }
}

impl Accumulator {
    /// Internal consistency of one accumulator.
    ///
    /// # Errors
    /// [`MergeError::BinningMismatch`] for a pair whose halves disagree.
    pub fn check(&self) -> Result<(), MergeError> {
        match self {
            Accumulator::Pair(p) => p.check(),
            Accumulator::Stats(_) => Ok(()),
        }
    }
}

impl Mergeable for Accumulator {
    fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        match (self, other) {
            (Accumulator::Pair(a), Accumulator::Pair(b)) => a.merge(b),
            (Accumulator::Stats(a), Accumulator::Stats(b)) => a.merge(b),
            (mine, theirs) => Err(MergeError::KindMismatch {
                expected: mine.kind(),
                found: theirs.kind(),
            }),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Accumulator::Pair(p) => p.is_empty(),
            Accumulator::Stats(s) => s.is_empty(),
        }
    }
}

impl From<HistogramPair> for Accumulator {
    fn from(p: HistogramPair) -> Self {
        Accumulator::Pair(p)
    }
}

impl From<StatsMap> for Accumulator {
    fn from(s: StatsMap) -> Self {
        Accumulator::Stats(s)
    }
}

/// What a worker hands back for one work item: accumulators keyed by sample key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    entries: BTreeMap<String, Accumulator>,
}

impl PartialResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A partial result carrying a single key.
    #[must_use]
    pub fn single(key: impl Into<String>, value: impl Into<Accumulator>) -> Self {
        let mut out = Self::new();
        out.entries.insert(key.into(), value.into());
        out
    }

    /// Insert or combine one keyed accumulator.
    ///
    /// # Errors
    /// Propagates [`MergeError`] from the per-key combination.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Accumulator>) -> Result<(), MergeError> {
        let key = key.into();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(existing) => existing.merge(value),
            None => {
                self.entries.insert(key, value);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Accumulator> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (String, Accumulator)> {
        self.entries.into_iter()
    }
}

impl Mergeable for PartialResult {
    fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        // check every shared key before touching anything
        for (key, theirs) in &other.entries {
            if let Some(mine) = self.entries.get(key) {
                check_mergeable(mine, theirs)?;
            }
        }
        for (key, value) in other.entries {
            self.insert(key, value)?;
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.entries.values().all(Mergeable::is_empty)
    }
}

/// Structural compatibility check without mutating either side.
pub(crate) fn check_mergeable(mine: &Accumulator, theirs: &Accumulator) -> Result<(), MergeError> {
    match (mine, theirs) {
        (Accumulator::Pair(a), Accumulator::Pair(b)) => {
            a.accepted.check_compatible(&b.accepted)?;
            a.rejected.check_compatible(&b.rejected)
        }
        (Accumulator::Stats(_), Accumulator::Stats(_)) => Ok(()),
        _ => Err(MergeError::KindMismatch {
            expected: mine.kind(),
            found: theirs.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(acc: &[f64], rej: &[f64]) -> HistogramPair {
        let edges: Vec<f64> = (0..=acc.len()).map(|i| i as f64).collect();
        let b = Binning::one_d(edges).unwrap();
        let mut p = HistogramPair::new(&b);
        for (i, (a, r)) in acc.iter().zip(rej).enumerate() {
            p.accepted.set_bin(i, *a, *a);
            p.rejected.set_bin(i, *r, *r);
        }
        p
    }

    #[test]
    fn pair_merge_adds_both_halves() {
        let mut a = pair(&[1.0, 2.0], &[3.0, 4.0]);
        a.merge(pair(&[10.0, 20.0], &[30.0, 40.0])).unwrap();
        assert_eq!(a.accepted.contents(), &[11.0, 22.0]);
        assert_eq!(a.rejected.contents(), &[33.0, 44.0]);
    }

    #[test]
    fn pair_halves_must_agree() {
        let two = Histogram::new(&Binning::one_d(vec![0.0, 1.0, 2.0]).unwrap(), "a");
        let one = Histogram::new(&Binning::one_d(vec![0.0, 1.0]).unwrap(), "r");
        assert!(HistogramPair::from_parts(two.clone(), one.clone()).is_err());
        let lopsided = Accumulator::Pair(HistogramPair {
            accepted: two,
            rejected: one,
        });
        assert!(matches!(lopsided.check(), Err(MergeError::BinningMismatch { .. })));
        assert!(Accumulator::Pair(pair(&[1.0], &[1.0])).check().is_ok());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut a = Accumulator::Pair(pair(&[1.0], &[1.0]));
        let err = a.merge(Accumulator::Stats(StatsMap::new())).unwrap_err();
        assert!(matches!(err, MergeError::KindMismatch { .. }));
    }

    #[test]
    fn dictionary_merge_inserts_new_keys() {
        let mut a = PartialResult::single("A", pair(&[1.0], &[0.0]));
        a.merge(PartialResult::single("B", pair(&[2.0], &[0.0]))).unwrap();
        a.merge(PartialResult::single("A", pair(&[3.0], &[1.0]))).unwrap();
        assert_eq!(a.len(), 2);
        let got = a.get("A").and_then(Accumulator::as_pair).unwrap();
        assert_eq!(got.accepted.contents(), &[4.0]);
        assert_eq!(got.rejected.contents(), &[1.0]);
    }

    #[test]
    fn failed_dictionary_merge_leaves_target_untouched() {
        let mut a = PartialResult::single("A", pair(&[1.0], &[0.0]));
        a.insert("B", pair(&[1.0], &[1.0])).unwrap();
        let before = a.clone();
        let mut bad = PartialResult::single("B", pair(&[5.0], &[5.0]));
        bad.insert("A", pair(&[1.0, 1.0], &[1.0, 1.0])).unwrap();
        assert!(a.merge(bad).is_err());
        assert_eq!(a, before);
    }
}
