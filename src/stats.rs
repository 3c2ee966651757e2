//! Running statistics: count, sum, sum of squares, min, max.
//!
//! [`RunningStats`] is the statistics-flavor accumulator. It plays the same
//! role as the `(sum, count)` accumulator of an averaging combiner, extended
//! with second moments and extrema so that `mean` and `rms` can be reported.
//! Combination is the usual parallel reduction: counts and sums add,
//! extrema take the extreme.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accumulator for a single variable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    n: u64,
    sum: f64,
    sum2: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl RunningStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one value. NaN values are ignored.
    pub fn add(&mut self, x: f64) {
        if x.is_nan() {
            return;
        }
        self.n += 1;
        self.sum += x;
        self.sum2 += x * x;
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
    }

    /// Fold another accumulator into this one.
    pub fn combine(&mut self, other: &RunningStats) {
        self.n += other.n;
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.n
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Mean, or `0.0` for an empty accumulator.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / self.n as f64
        }
    }

    /// Standard deviation around the mean (population form), `0.0` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum2 / self.n as f64 - mean * mean).max(0.0).sqrt()
    }

    /// A variable is trivial when it never varies (e.g. an sWeight fixed at 1).
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.n > 0 && (self.rms() == 0.0 || self.min == self.max)
    }

    /// Approximate equality, used when comparing reductions done in different orders.
    #[must_use]
    pub fn approx_eq(&self, other: &RunningStats, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs()));
        self.n == other.n
            && close(self.sum, other.sum)
            && close(self.sum2, other.sum2)
            && self.min == other.min
            && self.max == other.max
    }
}

/// Named accumulators, one per variable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsMap {
    vars: BTreeMap<String, RunningStats>,
}

impl StatsMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator for `name`, created on first use.
    pub fn entry(&mut self, name: &str) -> &mut RunningStats {
        self.vars.entry(name.to_string()).or_default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RunningStats> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RunningStats)> {
        self.vars.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.values().all(RunningStats::is_empty)
    }

    /// Per-variable combination; variables missing on one side are taken as-is.
    pub fn combine(&mut self, other: StatsMap) {
        for (name, stats) in other.vars {
            match self.vars.get_mut(&name) {
                Some(mine) => mine.combine(&stats),
                None => {
                    self.vars.insert(name, stats);
                }
            }
        }
    }

    #[must_use]
    pub fn approx_eq(&self, other: &StatsMap, tolerance: f64) -> bool {
        self.vars.len() == other.vars.len()
            && self.vars.iter().all(|(k, v)| {
                other
                    .vars
                    .get(k)
                    .is_some_and(|o| v.approx_eq(o, tolerance))
            })
    }
}

impl FromIterator<(String, RunningStats)> for StatsMap {
    fn from_iter<I: IntoIterator<Item = (String, RunningStats)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_rms() {
        let mut s = RunningStats::new();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.add(x);
        }
        assert_eq!(s.count(), 8);
        assert!((s.mean() - 5.0).abs() < 1e-12);
        assert!((s.rms() - 2.0).abs() < 1e-12);
        assert_eq!(s.min(), Some(2.0));
        assert_eq!(s.max(), Some(9.0));
    }

    #[test]
    fn combine_equals_single_pass() {
        let xs = [1.5, -3.0, 8.25, 0.0, 4.0, 11.0];
        let mut whole = RunningStats::new();
        xs.iter().for_each(|x| whole.add(*x));

        let mut left = RunningStats::new();
        let mut right = RunningStats::new();
        xs[..2].iter().for_each(|x| left.add(*x));
        xs[2..].iter().for_each(|x| right.add(*x));
        left.combine(&right);

        assert!(left.approx_eq(&whole, 1e-12));
    }

    #[test]
    fn empty_is_identity() {
        let mut s = RunningStats::new();
        s.add(3.0);
        let before = s.clone();
        s.combine(&RunningStats::new());
        assert_eq!(s, before);
    }

    #[test]
    fn constant_weight_is_trivial() {
        let mut s = RunningStats::new();
        (0..10).for_each(|_| s.add(1.0));
        assert!(s.is_trivial());
        assert!(!RunningStats::new().is_trivial());
    }
}
