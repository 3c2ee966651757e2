//! Sample catalog: which files hold which calibration samples.
//!
//! The catalog is static configuration, loaded once from JSON and never
//! mutated. It maps data-taking periods to file locations and particle
//! names to the samples that make them up. [`SampleCatalog::resolve`] turns a
//! [`RunRequest`] into `(key, source)` pairs ready for planning.
//!
//! ```json
//! {
//!   "periods": { "pp/2016/v5r1/MagUp": "/data/calib/2016/up" },
//!   "groups":  { "K": ["DSt_K", "DSt_KP"], "PI": ["DSt_Pi", "DSt_PiP"] },
//!   "exclusions": { "v5r1/2016": ["DSt_KP"] }
//! }
//! ```

use crate::error::ConfigError;
use crate::work_item::{Source, WorkItem, plan_items};
use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Build a sample key, `collision/year/version/polarity/species`.
#[must_use]
pub fn make_key(collision: &str, year: &str, version: &str, polarity: &str, species: &str) -> String {
    format!("{collision}/{year}/{version}/{polarity}/{species}")
}

fn period_key(collision: &str, year: &str, version: &str, polarity: &str) -> String {
    format!("{collision}/{year}/{version}/{polarity}")
}

/// Files matching `pattern`, sorted, directories skipped, at most `max_files`.
///
/// # Errors
/// Fails on an invalid pattern or an unreadable directory entry.
pub fn list_files(pattern: &str, max_files: Option<usize>) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;
    let mut out = Vec::new();
    for entry in paths {
        let path = entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    if let Some(max) = max_files {
        out.truncate(max);
    }
    Ok(out)
}

/// Magnet polarity selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    MagUp,
    MagDown,
    #[default]
    Both,
}

impl Polarity {
    #[must_use]
    pub fn expand(self) -> &'static [&'static str] {
        match self {
            Polarity::MagUp => &["MagUp"],
            Polarity::MagDown => &["MagDown"],
            Polarity::Both => &["MagUp", "MagDown"],
        }
    }
}

/// What to process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Particle or species group, e.g. `K`, `Pi+`, `P`.
    pub particle: String,
    pub years: Vec<String>,
    #[serde(default = "default_collisions")]
    pub collisions: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub polarity: Polarity,
    /// Explicit sample names; overrides the particle group when non-empty.
    #[serde(default)]
    pub samples: Vec<String>,
    #[serde(default)]
    pub max_files: Option<usize>,
}

fn default_collisions() -> Vec<String> {
    vec!["pp".to_string()]
}

impl RunRequest {
    #[must_use]
    pub fn new(particle: impl Into<String>, year: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            particle: particle.into(),
            years: vec![year.into()],
            collisions: default_collisions(),
            version: version.into(),
            polarity: Polarity::Both,
            samples: Vec::new(),
            max_files: None,
        }
    }

    #[must_use]
    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    #[must_use]
    pub fn with_samples<S: Into<String>>(mut self, samples: impl IntoIterator<Item = S>) -> Self {
        self.samples = samples.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }
}

/// Immutable sample lookup tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleCatalog {
    /// `collision/year/version/polarity` to a directory or glob pattern.
    pub periods: BTreeMap<String, String>,
    /// Particle name (case-insensitive) to sample names.
    pub groups: BTreeMap<String, Vec<String>>,
    /// `version/year` to the samples that exist there. Absent means no restriction.
    pub known: BTreeMap<String, Vec<String>>,
    /// `version/year` to samples that must not be used.
    pub exclusions: BTreeMap<String, Vec<String>>,
    /// Pattern appended to period directories.
    pub file_pattern: String,
    /// Chain name, `{sample}` is replaced by the sample name.
    pub chain_template: String,
}

impl Default for SampleCatalog {
    fn default() -> Self {
        Self {
            periods: BTreeMap::new(),
            groups: BTreeMap::new(),
            known: BTreeMap::new(),
            exclusions: BTreeMap::new(),
            file_pattern: "*.jsonl*".to_string(),
            chain_template: "{sample}Tuple/DecayTree".to_string(),
        }
    }
}

impl SampleCatalog {
    /// # Errors
    /// Fails if the file cannot be read or is not a valid catalog.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("read catalog {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse catalog {}", path.display()))
    }

    #[must_use]
    pub fn with_period(mut self, collision: &str, year: &str, version: &str, polarity: &str, location: impl Into<String>) -> Self {
        self.periods
            .insert(period_key(collision, year, version, polarity), location.into());
        self
    }

    #[must_use]
    pub fn with_group<S: Into<String>>(mut self, name: &str, samples: impl IntoIterator<Item = S>) -> Self {
        self.groups
            .insert(name.to_uppercase(), samples.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_exclusions<S: Into<String>>(mut self, version: &str, year: &str, samples: impl IntoIterator<Item = S>) -> Self {
        self.exclusions
            .entry(format!("{version}/{year}"))
            .or_default()
            .extend(samples.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn chain_name(&self, sample: &str) -> String {
        self.chain_template.replace("{sample}", sample)
    }

    fn group(&self, particle: &str) -> Option<&Vec<String>> {
        let wanted = particle.to_uppercase();
        self.groups
            .iter()
            .find(|(name, _)| name.to_uppercase() == wanted)
            .map(|(_, samples)| samples)
    }

    fn is_sample(&self, name: &str) -> bool {
        self.groups.values().flatten().any(|s| s == name)
            || self.known.values().flatten().any(|s| s == name)
    }

    /// Sample names for `request` in `year`, after restriction and exclusions.
    ///
    /// # Errors
    /// [`ConfigError::UnknownSpecies`] for an unknown particle or sample.
    pub fn species(&self, request: &RunRequest, year: &str) -> Result<Vec<String>, ConfigError> {
        let requested: Vec<String> = if request.samples.is_empty() {
            match self.group(&request.particle) {
                Some(samples) => samples.clone(),
                None if self.is_sample(&request.particle) => vec![request.particle.clone()],
                None => return Err(ConfigError::UnknownSpecies(request.particle.clone())),
            }
        } else {
            if let Some(unknown) = request.samples.iter().find(|s| !self.is_sample(s)) {
                return Err(ConfigError::UnknownSpecies(unknown.clone()));
            }
            request.samples.clone()
        };

        let scope = format!("{}/{year}", request.version);
        let known: Option<BTreeSet<&String>> = self.known.get(&scope).map(|k| k.iter().collect());
        let excluded: BTreeSet<&String> = self.exclusions.get(&scope).into_iter().flatten().collect();
        let mut out: Vec<String> = requested
            .into_iter()
            .filter(|s| known.as_ref().is_none_or(|k| k.contains(s)))
            .filter(|s| {
                let drop = excluded.contains(s);
                if drop {
                    warn!(sample = %s, scope = %scope, "sample excluded");
                }
                !drop
            })
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Resolve a request into `(key, source)` pairs, one per
    /// period, polarity and sample with data.
    ///
    /// # Errors
    /// A [`ConfigError`] (downcastable from the returned error) when the
    /// particle, a sample or a whole period is unknown, or nothing is
    /// selected; I/O errors from file listing.
    pub fn resolve(&self, request: &RunRequest) -> Result<Vec<(String, Source)>> {
        let mut out = Vec::new();
        for year in &request.years {
            let species = self.species(request, year)?;
            if species.is_empty() {
                return Err(ConfigError::EmptyRequest(format!(
                    "no samples of '{}' left for {}/{year}",
                    request.particle, request.version
                ))
                .into());
            }
            for collision in &request.collisions {
                let polarities = request.polarity.expand();
                if !polarities
                    .iter()
                    .any(|p| self.periods.contains_key(&period_key(collision, year, &request.version, p)))
                {
                    return Err(ConfigError::UnknownPeriod(format!("{collision}/{year}/{}", request.version)).into());
                }
                for polarity in polarities {
                    let Some(location) = self.periods.get(&period_key(collision, year, &request.version, polarity)) else {
                        warn!(collision = %collision, year = %year, polarity = %polarity, "no data for period, skipped");
                        continue;
                    };
                    let pattern = self.pattern(location);
                    let files = list_files(&pattern, request.max_files)?;
                    if files.is_empty() {
                        warn!(pattern = %pattern, "no files found, period skipped");
                        continue;
                    }
                    info!(collision = %collision, year = %year, polarity = %polarity, files = files.len(), "period resolved");
                    for sample in &species {
                        let key = make_key(collision, year, &request.version, polarity, sample);
                        out.push((key, Source::chain(self.chain_name(sample), files.clone())));
                    }
                }
            }
        }
        if out.is_empty() {
            return Err(ConfigError::EmptyRequest(format!("no data found for '{}'", request.particle)).into());
        }
        Ok(out)
    }

    /// Resolve and chunk into work items.
    ///
    /// # Errors
    /// See [`SampleCatalog::resolve`].
    pub fn work_items(&self, request: &RunRequest, chunk_size: usize) -> Result<Vec<WorkItem>> {
        Ok(self
            .resolve(request)?
            .iter()
            .flat_map(|(key, source)| plan_items(key, source, chunk_size))
            .collect())
    }

    fn pattern(&self, location: &str) -> String {
        if location.contains(['*', '?', '[']) {
            location.to_string()
        } else {
            Path::new(location)
                .join(&self.file_pattern)
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SampleCatalog {
        SampleCatalog::default()
            .with_group("K", ["DSt_K", "Phi_K", "Ds_K"])
            .with_exclusions("v4r1", "2016", ["Ds_K"])
    }

    #[test]
    fn keys_have_five_parts() {
        assert_eq!(make_key("pp", "2016", "v5r1", "MagUp", "DSt_K"), "pp/2016/v5r1/MagUp/DSt_K");
    }

    #[test]
    fn groups_are_case_insensitive_and_exclusions_apply() {
        let c = catalog();
        let req = RunRequest::new("k", "2016", "v4r1");
        assert_eq!(c.species(&req, "2016").unwrap(), vec!["DSt_K", "Phi_K"]);
        let req = RunRequest::new("K", "2017", "v4r1");
        assert_eq!(c.species(&req, "2017").unwrap().len(), 3);
    }

    #[test]
    fn unknown_particle_is_a_config_error() {
        let err = catalog().species(&RunRequest::new("X", "2016", "v4r1"), "2016").unwrap_err();
        assert_eq!(err, ConfigError::UnknownSpecies("X".into()));
        let req = RunRequest::new("K", "2016", "v4r1").with_samples(["Nope"]);
        assert!(catalog().species(&req, "2016").is_err());
    }

    #[test]
    fn both_polarities() {
        assert_eq!(Polarity::Both.expand(), &["MagUp", "MagDown"]);
        assert_eq!(Polarity::MagDown.expand(), &["MagDown"]);
    }

    #[test]
    fn catalog_from_json_uses_defaults() {
        let c: SampleCatalog = serde_json::from_str(r#"{"groups":{"PI":["DSt_Pi"]}}"#).unwrap();
        assert_eq!(c.chain_name("DSt_Pi"), "DSt_PiTuple/DecayTree");
        assert_eq!(c.file_pattern, "*.jsonl*");
    }
}
