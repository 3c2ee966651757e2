//! Worker-side event reading.
//!
//! Calibration samples are stored as JSON Lines: one event per line, numeric
//! (or boolean) columns plus an optional `"tree"` label naming the chain the
//! event belongs to. Files ending in `.gz`, or starting with the gzip magic
//! bytes, are decompressed transparently when the `compression-gzip` feature
//! is enabled.
//!
//! Events without a `"tree"` label belong to every chain.

use crate::work_item::EntryRange;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One event: named numeric columns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    tree: Option<String>,
    values: BTreeMap<String, f64>,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I: IntoIterator<Item = (String, f64)>>(pairs: I) -> Self {
        Self {
            tree: None,
            values: pairs.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn with_tree(mut self, tree: impl Into<String>) -> Self {
        self.tree = Some(tree.into());
        self
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: f64) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }

    #[must_use]
    pub fn tree(&self) -> Option<&str> {
        self.tree.as_deref()
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Unlabeled events belong to every chain.
    #[must_use]
    pub fn belongs_to(&self, chain: &str) -> bool {
        self.tree.as_deref().is_none_or(|t| t == chain)
    }
}

/// On-disk row: columns are flattened next to the optional label.
#[derive(Serialize, Deserialize)]
struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tree: Option<String>,
    #[serde(flatten)]
    columns: BTreeMap<String, serde_json::Value>,
}

impl From<Row> for Event {
    fn from(row: Row) -> Self {
        let values = row
            .columns
            .into_iter()
            .filter_map(|(k, v)| {
                let x = match v {
                    serde_json::Value::Number(n) => n.as_f64()?,
                    serde_json::Value::Bool(b) => f64::from(u8::from(b)),
                    _ => return None,
                };
                Some((k, x))
            })
            .collect();
        Event {
            tree: row.tree,
            values,
        }
    }
}

impl From<&Event> for Row {
    fn from(event: &Event) -> Self {
        let columns = event
            .values
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        Row {
            tree: event.tree.clone(),
            columns,
        }
    }
}

fn is_gzip(path: &Path, head: &[u8]) -> bool {
    path.extension().is_some_and(|e| e == "gz") || head.starts_with(&GZIP_MAGIC)
}

/// Open `path` for line reading, decompressing gzip input.
///
/// # Errors
/// Fails if the file cannot be opened, or is gzip-compressed while the
/// `compression-gzip` feature is disabled.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut rdr = BufReader::new(f);
    let head = rdr
        .fill_buf()
        .with_context(|| format!("read header of {}", path.display()))?;
    if !is_gzip(path, head) {
        return Ok(Box::new(rdr));
    }
    #[cfg(feature = "compression-gzip")]
    {
        let inner: Box<dyn std::io::Read> = Box::new(flate2::read::MultiGzDecoder::new(rdr));
        Ok(Box::new(BufReader::new(inner)))
    }
    #[cfg(not(feature = "compression-gzip"))]
    {
        anyhow::bail!(
            "{} is gzip-compressed but the compression-gzip feature is disabled",
            path.display()
        )
    }
}

/// Visit every event of `path` in file order.
///
/// # Errors
/// Propagates I/O and parse errors (with line numbers) and any error from `f`.
pub fn for_each_event<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(Event) -> Result<bool>,
{
    let rdr = open_reader(path)?;
    for (i, line) in rdr.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} in {}", i + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(&line)
            .with_context(|| format!("parse event on line {} in {}", i + 1, path.display()))?;
        if !f(Event::from(row))? {
            break;
        }
    }
    Ok(())
}

/// Read every event of one file.
///
/// # Errors
/// See [`for_each_event`].
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<Event>> {
    let mut out = Vec::new();
    for_each_event(path.as_ref(), |ev| {
        out.push(ev);
        Ok(true)
    })?;
    Ok(out)
}

/// Visit the entries of a chain: the events labelled `tree` across `files`,
/// numbered consecutively from zero in file order, restricted to `range`.
/// Returns the number of entries visited.
///
/// # Errors
/// Fails on a missing or unreadable file, or if `f` fails.
pub fn visit_chain<F>(
    tree: &str,
    files: &[PathBuf],
    range: Option<EntryRange>,
    mut f: F,
) -> Result<u64>
where
    F: FnMut(&Event) -> Result<()>,
{
    let mut index = 0u64;
    let mut visited = 0u64;
    for path in files {
        if range.is_some_and(|r| index >= r.last) {
            break;
        }
        for_each_event(path, |ev| {
            if !ev.belongs_to(tree) {
                return Ok(true);
            }
            let i = index;
            index += 1;
            match range {
                Some(r) if i >= r.last => return Ok(false),
                Some(r) if i < r.first => return Ok(true),
                _ => {}
            }
            f(&ev)?;
            visited += 1;
            Ok(true)
        })?;
    }
    Ok(visited)
}

/// Number of entries of `tree` across `files`.
///
/// # Errors
/// Fails on a missing or unreadable file.
pub fn count_entries(tree: &str, files: &[PathBuf]) -> Result<u64> {
    visit_chain(tree, files, None, |_| Ok(()))
}

/// Write events as JSON Lines, gzip-compressed when `path` ends in `.gz`.
/// Parent directories are created as needed. Returns the number written.
///
/// # Errors
/// Fails if the file cannot be created or written.
pub fn write_events(path: impl AsRef<Path>, events: &[Event]) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w: Box<dyn Write> = if path.extension().is_some_and(|e| e == "gz") {
        #[cfg(feature = "compression-gzip")]
        {
            Box::new(flate2::write::GzEncoder::new(
                BufWriter::new(f),
                flate2::Compression::default(),
            ))
        }
        #[cfg(not(feature = "compression-gzip"))]
        {
            anyhow::bail!(
                "cannot write {}: the compression-gzip feature is disabled",
                path.display()
            )
        }
    } else {
        Box::new(BufWriter::new(f))
    };
    for (i, ev) in events.iter().enumerate() {
        serde_json::to_writer(&mut w, &Row::from(ev))
            .with_context(|| format!("serialize event #{i} to {}", path.display()))?;
        w.write_all(b"\n")?;
    }
    w.flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(events.len())
}
