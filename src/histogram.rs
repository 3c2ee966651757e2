//! Weighted histograms with variable-width binning in one to three dimensions.
//!
//! A [`Histogram`] stores, per bin, the sum of weights (`sumw`) and the sum of
//! squared weights (`sumw2`), so bin errors are `sqrt(sumw2)` and two histograms
//! with identical [`Binning`] add bin-wise without loss of information.
//! Fills outside the axis ranges are not binned; their weight is kept in
//! [`Histogram::outside`] so that totals survive merging.
//!
//! # Example
//! ```
//! use calibflow::histogram::{Binning, Histogram};
//!
//! let binning = Binning::one_d(vec![0.0, 10.0, 20.0, 50.0])?;
//! let mut h = Histogram::new(&binning, "momentum");
//! h.fill(&[5.0], 1.0);
//! h.fill(&[12.0], 0.5);
//! h.fill(&[70.0], 1.0); // outside
//!
//! assert_eq!(h.contents(), &[1.0, 0.5, 0.0]);
//! assert_eq!(h.outside(), 1.0);
//! # Ok::<(), calibflow::ConfigError>(())
//! ```

use crate::error::{ConfigError, MergeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest supported histogram dimension.
pub const MAX_DIMENSION: usize = 3;

/// One axis: strictly increasing, finite bin edges (`n_bins + 1` values).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    edges: Vec<f64>,
}

impl Axis {
    /// Build an axis from explicit bin edges.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidBinning`] if fewer than two edges are given,
    /// or edges are not finite and strictly increasing.
    pub fn new(edges: Vec<f64>) -> Result<Self, ConfigError> {
        if edges.len() < 2 {
            return Err(ConfigError::InvalidBinning(format!(
                "an axis needs at least 2 edges, got {}",
                edges.len()
            )));
        }
        if let Some(bad) = edges.iter().find(|e| !e.is_finite()) {
            return Err(ConfigError::InvalidBinning(format!("non-finite edge {bad}")));
        }
        if let Some(w) = edges.windows(2).find(|w| w[0] >= w[1]) {
            return Err(ConfigError::InvalidBinning(format!(
                "edges must be strictly increasing ({} >= {})",
                w[0], w[1]
            )));
        }
        Ok(Self { edges })
    }

    /// `n` equal-width bins spanning `[lo, hi)`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidBinning`] if `n == 0` or `lo >= hi`.
    #[allow(clippy::cast_precision_loss)]
    pub fn uniform(n: usize, lo: f64, hi: f64) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::InvalidBinning("zero bins requested".into()));
        }
        let width = (hi - lo) / n as f64;
        let mut edges: Vec<f64> = (0..n).map(|i| lo + width * i as f64).collect();
        edges.push(hi);
        Self::new(edges)
    }

    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    #[must_use]
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin containing `x`, with bins closed on the left: `[lo, hi)`.
    /// `None` for under/overflow and NaN.
    #[must_use]
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        let last = self.edges.len() - 1;
        if x.is_nan() || x < self.edges[0] || x >= self.edges[last] {
            return None;
        }
        // first edge strictly greater than x, minus one
        let upper = self.edges.partition_point(|e| *e <= x);
        Some(upper - 1)
    }
}

/// The binning of a histogram: one axis per dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    axes: Vec<Axis>,
}

impl Binning {
    /// # Errors
    /// Returns [`ConfigError::InvalidBinning`] for zero or more than
    /// [`MAX_DIMENSION`] axes.
    pub fn new(axes: Vec<Axis>) -> Result<Self, ConfigError> {
        if axes.is_empty() || axes.len() > MAX_DIMENSION {
            return Err(ConfigError::InvalidBinning(format!(
                "expected 1..={MAX_DIMENSION} axes, got {}",
                axes.len()
            )));
        }
        Ok(Self { axes })
    }

    /// # Errors
    /// Propagates [`Axis::new`] validation.
    pub fn one_d(x: Vec<f64>) -> Result<Self, ConfigError> {
        Self::new(vec![Axis::new(x)?])
    }

    /// # Errors
    /// Propagates [`Axis::new`] validation.
    pub fn two_d(x: Vec<f64>, y: Vec<f64>) -> Result<Self, ConfigError> {
        Self::new(vec![Axis::new(x)?, Axis::new(y)?])
    }

    /// # Errors
    /// Propagates [`Axis::new`] validation.
    pub fn three_d(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self, ConfigError> {
        Self::new(vec![Axis::new(x)?, Axis::new(y)?, Axis::new(z)?])
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    #[must_use]
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Total number of (in-range) bins.
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.axes.iter().map(Axis::n_bins).product()
    }

    /// Linear bin index for a point; the first axis varies fastest.
    /// `None` if the point lies outside any axis or has the wrong dimension.
    #[must_use]
    pub fn bin_index(&self, coords: &[f64]) -> Option<usize> {
        if coords.len() != self.axes.len() {
            return None;
        }
        let mut index = 0usize;
        let mut stride = 1usize;
        for (axis, x) in self.axes.iter().zip(coords) {
            index += axis.find_bin(*x)? * stride;
            stride *= axis.n_bins();
        }
        Some(index)
    }
}

impl fmt::Display for Binning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape: Vec<String> = self
            .axes
            .iter()
            .map(|a| {
                format!(
                    "{}[{}..{}]",
                    a.n_bins(),
                    a.edges[0],
                    a.edges[a.edges.len() - 1]
                )
            })
            .collect();
        write!(f, "{}D({})", self.axes.len(), shape.join(" x "))
    }
}

/// A weighted histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    title: String,
    binning: Binning,
    sumw: Vec<f64>,
    sumw2: Vec<f64>,
    entries: u64,
    outside: f64,
}

impl Histogram {
    /// Zero-filled histogram with the given binning.
    #[must_use]
    pub fn new(binning: &Binning, title: impl Into<String>) -> Self {
        let n = binning.n_bins();
        Self {
            title: title.into(),
            binning: binning.clone(),
            sumw: vec![0.0; n],
            sumw2: vec![0.0; n],
            entries: 0,
            outside: 0.0,
        }
    }

    /// Zero-filled copy with the same binning and title.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self::new(&self.binning, self.title.clone())
    }

    /// Fill one weighted point. Returns `true` if the point landed in a bin.
    pub fn fill(&mut self, coords: &[f64], weight: f64) -> bool {
        self.entries += 1;
        match self.binning.bin_index(coords) {
            Some(i) => {
                self.sumw[i] += weight;
                self.sumw2[i] += weight * weight;
                true
            }
            None => {
                self.outside += weight;
                false
            }
        }
    }

    /// Overwrite a bin with explicit `(sumw, sumw2)`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn set_bin(&mut self, index: usize, sumw: f64, sumw2: f64) {
        self.sumw[index] = sumw;
        self.sumw2[index] = sumw2;
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    #[must_use]
    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.sumw.len()
    }

    /// Bin contents (sum of weights).
    #[must_use]
    pub fn contents(&self) -> &[f64] {
        &self.sumw
    }

    /// Per-bin sum of squared weights.
    #[must_use]
    pub fn sumw2(&self) -> &[f64] {
        &self.sumw2
    }

    #[must_use]
    pub fn bin_content(&self, index: usize) -> f64 {
        self.sumw[index]
    }

    #[must_use]
    pub fn bin_error(&self, index: usize) -> f64 {
        self.sumw2[index].sqrt()
    }

    /// Number of `fill` calls, in range or not.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Sum of weights of fills outside the binning.
    #[must_use]
    pub fn outside(&self) -> f64 {
        self.outside
    }

    /// Sum of in-range bin contents and its uncertainty.
    #[must_use]
    pub fn integral(&self) -> (f64, f64) {
        let sum: f64 = self.sumw.iter().sum();
        let var: f64 = self.sumw2.iter().sum();
        (sum, var.sqrt())
    }

    /// `true` if nothing was ever filled or added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
            && self.outside == 0.0
            && self.sumw.iter().all(|w| *w == 0.0)
            && self.sumw2.iter().all(|w| *w == 0.0)
    }

    /// Check that `other` can be added bin-wise to `self`.
    ///
    /// # Errors
    /// [`MergeError::BinningMismatch`] if the binnings differ in any edge.
    pub fn check_compatible(&self, other: &Histogram) -> Result<(), MergeError> {
        if self.binning == other.binning {
            Ok(())
        } else {
            Err(MergeError::BinningMismatch {
                expected: self.binning.to_string(),
                found: other.binning.to_string(),
            })
        }
    }

    /// Bin-wise sum: contents and squared weights add, so errors add in quadrature.
    ///
    /// # Errors
    /// [`MergeError::BinningMismatch`] if the binnings differ; `self` is left untouched.
    pub fn add(&mut self, other: &Histogram) -> Result<(), MergeError> {
        self.check_compatible(other)?;
        for (a, b) in self.sumw.iter_mut().zip(&other.sumw) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        self.entries += other.entries;
        self.outside += other.outside;
        Ok(())
    }

    /// Bin-wise comparison of contents and squared weights within an absolute
    /// tolerance scaled by magnitude.
    #[must_use]
    pub fn approx_eq(&self, other: &Histogram, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs()));
        self.binning == other.binning
            && self.entries == other.entries
            && close(self.outside, other.outside)
            && self.sumw.iter().zip(&other.sumw).all(|(a, b)| close(*a, *b))
            && self.sumw2.iter().zip(&other.sumw2).all(|(a, b)| close(*a, *b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_rejects_bad_edges() {
        assert!(Axis::new(vec![1.0]).is_err());
        assert!(Axis::new(vec![0.0, 2.0, 1.0]).is_err());
        assert!(Axis::new(vec![0.0, f64::NAN]).is_err());
        assert!(Axis::uniform(0, 0.0, 1.0).is_err());
    }

    #[test]
    fn find_bin_is_left_closed() {
        let a = Axis::new(vec![0.0, 1.0, 2.0]).unwrap();
        assert_eq!(a.find_bin(0.0), Some(0));
        assert_eq!(a.find_bin(1.0), Some(1));
        assert_eq!(a.find_bin(1.999), Some(1));
        assert_eq!(a.find_bin(2.0), None);
        assert_eq!(a.find_bin(-0.1), None);
        assert_eq!(a.find_bin(f64::NAN), None);
    }

    #[test]
    fn three_d_index_is_x_fastest() {
        let b = Binning::three_d(vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 1.0, 2.0])
            .unwrap();
        assert_eq!(b.n_bins(), 2 * 3 * 2);
        assert_eq!(b.bin_index(&[0.5, 0.5, 0.5]), Some(0));
        assert_eq!(b.bin_index(&[1.5, 0.5, 0.5]), Some(1));
        assert_eq!(b.bin_index(&[0.5, 1.5, 0.5]), Some(2));
        assert_eq!(b.bin_index(&[1.5, 2.5, 1.5]), Some(11));
        assert_eq!(b.bin_index(&[0.5, 0.5]), None);
    }

    #[test]
    fn weighted_fill_accumulates_squares() {
        let b = Binning::one_d(vec![0.0, 1.0]).unwrap();
        let mut h = Histogram::new(&b, "h");
        h.fill(&[0.5], 2.0);
        h.fill(&[0.5], 3.0);
        assert_eq!(h.bin_content(0), 5.0);
        assert!((h.bin_error(0) - 13f64.sqrt()).abs() < 1e-12);
        assert_eq!(h.entries(), 2);
    }

    #[test]
    fn add_rejects_different_edges() {
        let mut a = Histogram::new(&Binning::one_d(vec![0.0, 1.0, 2.0]).unwrap(), "a");
        a.fill(&[0.5], 1.0);
        let b = Histogram::new(&Binning::one_d(vec![0.0, 1.5, 2.0]).unwrap(), "b");
        let before = a.clone();
        assert!(matches!(a.add(&b), Err(MergeError::BinningMismatch { .. })));
        assert_eq!(a, before);
    }
}
