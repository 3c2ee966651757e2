//! Efficiency derivation: `eff = 1 / (1 + rejected / accepted)`, bin by bin.
//!
//! A pure function of an (accepted, rejected) pair. Uncertainties come from
//! the sum of squared weights of each side, so sWeighted samples are handled
//! the same way as plain counts:
//!
//! ```text
//! var(eff) = (r^2 var(a) + a^2 var(r)) / (a + r)^4
//! ```
//!
//! A bin with no accepted weight, or whose total weight is not positive, is
//! *degenerate*: its efficiency is reported as `0 ± 0` and flagged.

use crate::error::MergeError;
use crate::histogram::{Binning, Histogram};
use crate::partial::HistogramPair;
use crate::stats::RunningStats;
use serde::{Deserialize, Serialize};

/// Efficiency of one bin (or of the integral).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinEfficiency {
    pub value: f64,
    pub error: f64,
    pub degenerate: bool,
}

impl BinEfficiency {
    const DEGENERATE: BinEfficiency = BinEfficiency {
        value: 0.0,
        error: 0.0,
        degenerate: true,
    };

    /// Efficiency of accepted weight `a` against rejected weight `r`, given
    /// their variances.
    #[must_use]
    pub fn from_weights(a: f64, var_a: f64, r: f64, var_r: f64) -> Self {
        let sum = a + r;
        if a <= 0.0 || sum <= 0.0 || !sum.is_finite() {
            return Self::DEGENERATE;
        }
        let value = 1.0 / (1.0 + r / a);
        let variance = (r * r * var_a + a * a * var_r) / sum.powi(4);
        Self {
            value,
            error: variance.max(0.0).sqrt(),
            degenerate: false,
        }
    }
}

/// Bin-wise efficiency over the binning of its source pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyHistogram {
    binning: Binning,
    bins: Vec<BinEfficiency>,
}

/// Spread of bin efficiencies, degenerate bins excluded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinSpread {
    pub mean: f64,
    pub rms: f64,
    pub min: f64,
    pub max: f64,
    pub degenerate: usize,
}

impl EfficiencyHistogram {
    #[must_use]
    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.bins.len()
    }

    #[must_use]
    pub fn bins(&self) -> &[BinEfficiency] {
        &self.bins
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.value).collect()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.error).collect()
    }

    /// Indices of degenerate bins.
    #[must_use]
    pub fn degenerate_bins(&self) -> Vec<usize> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, b)| b.degenerate)
            .map(|(i, _)| i)
            .collect()
    }

    #[must_use]
    pub fn spread(&self) -> BinSpread {
        let mut stats = RunningStats::new();
        self.bins
            .iter()
            .filter(|b| !b.degenerate)
            .for_each(|b| stats.add(b.value));
        BinSpread {
            mean: stats.mean(),
            rms: stats.rms(),
            min: stats.min().unwrap_or(0.0),
            max: stats.max().unwrap_or(0.0),
            degenerate: self.bins.len() - usize::try_from(stats.count()).unwrap_or(usize::MAX),
        }
    }

    #[must_use]
    pub fn approx_eq(&self, other: &EfficiencyHistogram, tolerance: f64) -> bool {
        self.binning == other.binning
            && self.bins.len() == other.bins.len()
            && self.bins.iter().zip(&other.bins).all(|(a, b)| {
                a.degenerate == b.degenerate
                    && (a.value - b.value).abs() <= tolerance
                    && (a.error - b.error).abs() <= tolerance
            })
    }
}

/// Efficiency histogram of a merged pair. Bins past the shorter half of a
/// lopsided pair are dropped.
#[must_use]
pub fn efficiency(pair: &HistogramPair) -> EfficiencyHistogram {
    let (a, r) = (&pair.accepted, &pair.rejected);
    let bins = a
        .contents()
        .iter()
        .zip(a.sumw2())
        .zip(r.contents().iter().zip(r.sumw2()))
        .map(|((&wa, &va), (&wr, &vr))| BinEfficiency::from_weights(wa, va, wr, vr))
        .collect();
    EfficiencyHistogram {
        binning: a.binning().clone(),
        bins,
    }
}

/// Efficiency histogram of two separate histograms.
///
/// # Errors
/// [`MergeError::BinningMismatch`] if their binnings differ.
pub fn efficiency_of(accepted: &Histogram, rejected: &Histogram) -> Result<EfficiencyHistogram, MergeError> {
    accepted.check_compatible(rejected)?;
    Ok(efficiency(&HistogramPair {
        accepted: accepted.clone(),
        rejected: rejected.clone(),
    }))
}

/// Efficiency of the integrals of both sides.
#[must_use]
pub fn integrated(pair: &HistogramPair) -> BinEfficiency {
    let (a, ea) = pair.accepted.integral();
    let (r, er) = pair.rejected.integral();
    BinEfficiency::from_weights(a, ea * ea, r, er * er)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(acc: &[f64], rej: &[f64]) -> HistogramPair {
        let edges: Vec<f64> = (0..=acc.len()).map(|i| i as f64).collect();
        let mut p = HistogramPair::new(&Binning::one_d(edges).unwrap());
        for (i, (a, r)) in acc.iter().zip(rej).enumerate() {
            p.accepted.set_bin(i, *a, *a);
            p.rejected.set_bin(i, *r, *r);
        }
        p
    }

    #[test]
    fn ratio_per_bin() {
        let eff = efficiency(&pair(&[10.0, 20.0, 30.0], &[5.0, 5.0, 0.0]));
        let v = eff.values();
        assert!((v[0] - 10.0 / 15.0).abs() < 1e-12);
        assert!((v[1] - 0.8).abs() < 1e-12);
        assert!((v[2] - 1.0).abs() < 1e-12);
        assert!(eff.degenerate_bins().is_empty());
        // a fully efficient bin has zero binomial error
        assert_eq!(eff.errors()[2], 0.0);
    }

    #[test]
    fn empty_accepted_is_flagged_not_fatal() {
        let eff = efficiency(&pair(&[0.0, 4.0], &[3.0, 4.0]));
        assert_eq!(eff.bins()[0], BinEfficiency::DEGENERATE);
        assert_eq!(eff.degenerate_bins(), vec![0]);
        assert!((eff.values()[1] - 0.5).abs() < 1e-12);
        let spread = eff.spread();
        assert_eq!(spread.degenerate, 1);
        assert!((spread.mean - 0.5).abs() < 1e-12);
    }

    #[test]
    fn error_for_counts() {
        // a = r = 50 counts: eff = 0.5, sigma = sqrt(eff (1 - eff) / n)
        let e = BinEfficiency::from_weights(50.0, 50.0, 50.0, 50.0);
        assert!((e.value - 0.5).abs() < 1e-12);
        assert!((e.error - (0.25f64 / 100.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn integrated_uses_totals() {
        let e = integrated(&pair(&[10.0, 20.0, 30.0], &[5.0, 5.0, 0.0]));
        assert!((e.value - 60.0 / 70.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_binning_is_rejected() {
        let a = pair(&[1.0], &[1.0]).accepted;
        let r = pair(&[1.0, 1.0], &[1.0, 1.0]).rejected;
        assert!(efficiency_of(&a, &r).is_err());
    }

    #[test]
    fn lopsided_pair_does_not_panic() {
        let lopsided = HistogramPair {
            accepted: pair(&[4.0, 4.0], &[0.0, 0.0]).accepted,
            rejected: pair(&[0.0], &[4.0]).rejected,
        };
        let eff = efficiency(&lopsided);
        assert_eq!(eff.bins().len(), 1);
        assert!((eff.values()[0] - 0.5).abs() < 1e-12);
    }
}
