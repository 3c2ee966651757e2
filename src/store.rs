//! Key-value persistence of results.
//!
//! A [`ResultStore`] is written as one `postcard` blob wrapped in an envelope
//! carrying the SHA-256 checksum of the payload. Saving goes through a
//! temporary file and a rename, so a crash never leaves a half-written store.
//! Loading verifies the checksum before decoding.
//!
//! [`ResultStore::save_run`] writes the layout used by downstream tools:
//!
//! | key                         | value                          |
//! |-----------------------------|--------------------------------|
//! | `<key>`                     | accepted/rejected pair (or statistics) |
//! | `<key>:efficiency`          | efficiency histogram           |
//! | `<key>:conf`                | configuration snapshot         |
//! | `<key>:created`             | timestamp (ms since epoch)     |
//! | `TOTAL_<species>`           | pair summed over all keys      |
//! | `TOTAL_<species>:keys`      | every key of the run           |
//! | `TOTAL_<species>:files`     | input files                    |
//! | `TOTAL_<species>:conf`      | configuration snapshot         |
//! | `TOTAL_<species>:created`   | timestamp                      |
//! | `TOTAL_<species>:processed` | keys with merged results       |

use crate::aggregate::Aggregate;
use crate::efficiency::{EfficiencyHistogram, efficiency};
use crate::partial::{Accumulator, HistogramPair};
use crate::stats::StatsMap;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// A stored value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Pair(HistogramPair),
    Efficiency(EfficiencyHistogram),
    Stats(StatsMap),
    Text(String),
    List(Vec<String>),
    Timestamp(u64),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: Vec<u8>,
}

/// SHA-256 of `data`, hex encoded.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File-backed key-value store.
#[derive(Clone, Debug)]
pub struct ResultStore {
    path: PathBuf,
    entries: BTreeMap<String, StoredValue>,
}

impl ResultStore {
    /// An empty store that will be saved to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load `path` if it exists, otherwise start empty.
    ///
    /// # Errors
    /// Fails if an existing file cannot be read, is corrupt, or fails the
    /// checksum.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let bytes = fs::read(&path).with_context(|| format!("read store {}", path.display()))?;
        let envelope: Envelope =
            postcard::from_bytes(&bytes).with_context(|| format!("decode store {}", path.display()))?;
        if compute_checksum(&envelope.payload) != envelope.checksum {
            return Err(anyhow!(
                "store {} failed its integrity check: checksum mismatch",
                path.display()
            ));
        }
        let entries = postcard::from_bytes(&envelope.payload)
            .with_context(|| format!("decode entries of {}", path.display()))?;
        Ok(Self { path, entries })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StoredValue) {
        self.entries.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StoredValue> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn get_pair(&self, key: &str) -> Option<&HistogramPair> {
        match self.entries.get(key) {
            Some(StoredValue::Pair(p)) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_efficiency(&self, key: &str) -> Option<&EfficiencyHistogram> {
        match self.entries.get(key) {
            Some(StoredValue::Efficiency(e)) => Some(e),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<StoredValue> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the store to its path atomically.
    ///
    /// # Errors
    /// Fails if encoding or any file operation fails.
    pub fn save(&self) -> Result<()> {
        let payload = postcard::to_allocvec(&self.entries).context("encode store entries")?;
        let envelope = Envelope {
            checksum: compute_checksum(&payload),
            payload,
        };
        let bytes = postcard::to_allocvec(&envelope).context("encode store envelope")?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        debug!(path = %self.path.display(), entries = self.entries.len(), bytes = bytes.len(), "store saved");
        Ok(())
    }

    /// Human-readable dump of all entries.
    ///
    /// # Errors
    /// Fails if the file cannot be written.
    pub fn export_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &self.entries)
            .with_context(|| format!("write JSON export {}", path.display()))
    }

    /// Record the results of one run. Returns the number of keys written.
    pub fn save_run(&mut self, species: &str, aggregate: &Aggregate, conf: &str, files: &[PathBuf]) -> usize {
        let before = self.entries.len();
        let now = current_timestamp_ms();
        let mut written = 0;
        let mut put = |store: &mut Self, key: String, value: StoredValue| {
            store.entries.insert(key, value);
            written += 1;
        };

        for (key, acc) in aggregate.iter() {
            match acc {
                Accumulator::Pair(pair) => {
                    put(self, key.clone(), StoredValue::Pair(pair.clone()));
                    put(self, format!("{key}:efficiency"), StoredValue::Efficiency(efficiency(pair)));
                }
                Accumulator::Stats(stats) => put(self, key.clone(), StoredValue::Stats(stats.clone())),
            }
            put(self, format!("{key}:conf"), StoredValue::Text(conf.to_string()));
            put(self, format!("{key}:created"), StoredValue::Timestamp(now));
        }

        let total = format!("TOTAL_{species}");
        if let Some(Accumulator::Pair(pair)) = aggregate.total() {
            put(self, total.clone(), StoredValue::Pair(pair.clone()));
        }
        let mut keys: Vec<String> = aggregate.keys().cloned().collect();
        keys.extend(aggregate.poisoned().keys().cloned());
        keys.sort();
        keys.dedup();
        let processed: Vec<String> = aggregate.keys().cloned().collect();
        let files: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        put(self, format!("{total}:keys"), StoredValue::List(keys));
        put(self, format!("{total}:files"), StoredValue::List(files));
        put(self, format!("{total}:conf"), StoredValue::Text(conf.to_string()));
        put(self, format!("{total}:created"), StoredValue::Timestamp(now));
        put(self, format!("{total}:processed"), StoredValue::List(processed));

        info!(
            species = %species,
            written,
            new = self.entries.len() - before,
            path = %self.path.display(),
            "run recorded"
        );
        written
    }
}
