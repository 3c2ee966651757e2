//! Run configuration, read from JSON.
//!
//! ```json
//! {
//!   "request":  { "particle": "K", "years": ["2016"], "version": "v5r1" },
//!   "binning":  [[0, 10, 20, 50, 100], [1.5, 3.0, 5.0]],
//!   "axes":     ["P/1000", "ETA"],
//!   "accepted": "ProbNNk > 0.5",
//!   "rejected": "ProbNNk <= 0.5",
//!   "cuts":     "hasRich",
//!   "weight":   "sw",
//!   "output":   "eff_K.db",
//!   "manager":  { "mode": { "Parallel": { "workers": 8 } } }
//! }
//! ```

use crate::catalog::{RunRequest, SampleCatalog};
use crate::error::ConfigError;
use crate::histogram::{Axis, Binning};
use crate::manager::ManagerConfig;
use crate::selection::{Cut, Projection, Selection};
use crate::tasks::EfficiencyTask;
use crate::work_item::WorkItem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub request: RunRequest,
    /// Bin edges, one list per axis.
    pub binning: Vec<Vec<f64>>,
    /// One expression per axis, e.g. `P/1000`.
    pub axes: Vec<String>,
    pub accepted: String,
    pub rejected: String,
    #[serde(default)]
    pub cuts: String,
    #[serde(default)]
    pub weight: Option<String>,
    /// Result store path; defaults to `eff_<particle>.db`.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl RunConfig {
    /// # Errors
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("read run config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse run config {}", path.display()))
    }

    /// # Errors
    /// [`ConfigError::InvalidBinning`] for malformed edges or dimensions.
    pub fn binning(&self) -> Result<Binning, ConfigError> {
        let axes = self
            .binning
            .iter()
            .map(|edges| Axis::new(edges.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Binning::new(axes)
    }

    /// # Errors
    /// [`ConfigError::InvalidCut`] for a malformed cut.
    pub fn selection(&self) -> Result<Selection, ConfigError> {
        Ok(Selection::parse(&self.accepted, &self.rejected)?.with_cuts(Cut::parse(&self.cuts)?))
    }

    /// # Errors
    /// [`ConfigError::InvalidCut`] for a malformed axis expression.
    pub fn projection(&self) -> Result<Projection, ConfigError> {
        let projection = Projection::parse(&self.axes)?;
        Ok(match &self.weight {
            Some(w) => projection.with_weight(w.clone()),
            None => projection,
        })
    }

    /// The efficiency task this configuration describes.
    ///
    /// # Errors
    /// Any [`ConfigError`] from the parts above.
    pub fn efficiency_task(&self) -> Result<EfficiencyTask, ConfigError> {
        EfficiencyTask::new(self.binning()?, self.selection()?, self.projection()?)
    }

    /// Work items for the request, `manager.chunk_size` files per item.
    ///
    /// # Errors
    /// Any resolution error from [`SampleCatalog::resolve`].
    pub fn work_items(&self, catalog: &SampleCatalog) -> Result<Vec<WorkItem>> {
        catalog.work_items(&self.request, self.manager.chunk_size)
    }

    /// Where results are stored. A relative path is taken below `dir`.
    #[must_use]
    pub fn output_path(&self, dir: impl AsRef<Path>) -> PathBuf {
        let name = self
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("eff_{}.db", self.request.particle)));
        dir.as_ref().join(name)
    }

    /// JSON snapshot stored next to results.
    ///
    /// # Errors
    /// Fails only if serialization fails.
    pub fn snapshot(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize run config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "request": {"particle": "K", "years": ["2016"], "version": "v5r1", "polarity": "MagUp"},
        "binning": [[0, 10, 20], [1.5, 5.0]],
        "axes": ["P/1000", "ETA"],
        "accepted": "ProbNNk > 0.5",
        "rejected": "ProbNNk <= 0.5",
        "weight": "sw"
    }"#;

    #[test]
    fn builds_a_task() {
        let cfg: RunConfig = serde_json::from_str(DOC).unwrap();
        assert_eq!(cfg.binning().unwrap().n_bins(), 2);
        assert!(cfg.selection().unwrap().cuts.is_empty());
        assert_eq!(cfg.projection().unwrap().weight.as_deref(), Some("sw"));
        assert!(cfg.efficiency_task().is_ok());
        assert_eq!(cfg.manager.chunk_size, 20);
    }

    #[test]
    fn output_path_defaults_to_the_particle() {
        let mut cfg: RunConfig = serde_json::from_str(DOC).unwrap();
        assert_eq!(cfg.output_path("out"), Path::new("out/eff_K.db"));
        cfg.output = Some(PathBuf::from("/data/kaons.db"));
        assert_eq!(cfg.output_path("out"), Path::new("/data/kaons.db"));
    }

    #[test]
    fn bad_edges_are_config_errors() {
        let mut cfg: RunConfig = serde_json::from_str(DOC).unwrap();
        cfg.binning = vec![vec![1.0, 0.0]];
        assert!(matches!(cfg.binning(), Err(ConfigError::InvalidBinning(_))));
        cfg.binning = vec![vec![0.0, 1.0]];
        // two axis expressions against one axis
        assert!(matches!(cfg.efficiency_task(), Err(ConfigError::InvalidBinning(_))));
    }
}
