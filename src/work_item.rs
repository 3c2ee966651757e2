//! Work items and their planning.
//!
//! A [`WorkItem`] is the only thing a worker receives. It names its key and
//! carries everything needed to reach its events (file paths and a chain
//! name, or the events themselves), so a worker that knows nothing about the
//! controller can still produce a partial result from it.

use crate::source::{self, Event};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Half-open entry range `[first, last)` within a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRange {
    pub first: u64,
    pub last: u64,
}

impl EntryRange {
    #[must_use]
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.last.saturating_sub(self.first)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        (self.first..self.last).contains(&index)
    }
}

/// Where a work item's events come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Source {
    /// The events labelled `tree` across `files`, in file order.
    Chain { tree: String, files: Vec<PathBuf> },
    /// Events carried by value.
    Sample { events: Vec<Event> },
}

impl Source {
    #[must_use]
    pub fn chain(tree: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Source::Chain {
            tree: tree.into(),
            files,
        }
    }

    #[must_use]
    pub fn sample(events: Vec<Event>) -> Self {
        Source::Sample { events }
    }
}

/// One dispatchable unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    pub source: Source,
    pub range: Option<EntryRange>,
}

impl WorkItem {
    #[must_use]
    pub fn new(key: impl Into<String>, source: Source) -> Self {
        Self {
            key: key.into(),
            source,
            range: None,
        }
    }

    #[must_use]
    pub fn chain(key: impl Into<String>, tree: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self::new(key, Source::chain(tree, files))
    }

    #[must_use]
    pub fn sample(key: impl Into<String>, events: Vec<Event>) -> Self {
        Self::new(key, Source::sample(events))
    }

    #[must_use]
    pub fn with_range(mut self, range: EntryRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Visit the item's events in order, honoring its range. Returns the
    /// number of events visited.
    ///
    /// # Errors
    /// Fails on unreadable sources or if `f` fails.
    pub fn for_each_event<F>(&self, mut f: F) -> Result<u64>
    where
        F: FnMut(&Event) -> Result<()>,
    {
        match &self.source {
            Source::Chain { tree, files } => source::visit_chain(tree, files, self.range, f),
            Source::Sample { events } => {
                let mut visited = 0;
                for (i, ev) in (0u64..).zip(events) {
                    if self.range.is_some_and(|r| !r.contains(i)) {
                        continue;
                    }
                    f(ev)?;
                    visited += 1;
                }
                Ok(visited)
            }
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Chain { tree, files } => {
                write!(f, "{} [{tree}, {} file(s)", self.key, files.len())?;
            }
            Source::Sample { events } => {
                write!(f, "{} [{} event(s)", self.key, events.len())?;
            }
        }
        if let Some(r) = self.range {
            write!(f, ", entries {}..{}", r.first, r.last)?;
        }
        write!(f, "]")
    }
}

/// Split a chain's file list into items of at most `chunk_size` files.
/// `chunk_size == 0` yields a single item. An empty file list yields nothing.
#[must_use]
pub fn plan_chain_items(
    key: &str,
    chain: &str,
    files: &[PathBuf],
    chunk_size: usize,
) -> Vec<WorkItem> {
    if files.is_empty() {
        return Vec::new();
    }
    let size = if chunk_size == 0 {
        files.len()
    } else {
        chunk_size
    };
    files
        .chunks(size)
        .map(|chunk| WorkItem::chain(key, chain, chunk.to_vec()))
        .collect()
}

/// Expand one `(key, source)` pair into work items: chains are chunked by
/// file, in-memory samples stay whole.
#[must_use]
pub fn plan_items(key: &str, source: &Source, chunk_size: usize) -> Vec<WorkItem> {
    match source {
        Source::Chain { tree, files } => plan_chain_items(key, tree, files, chunk_size),
        Source::Sample { .. } => vec![WorkItem::new(key, source.clone())],
    }
}

/// Split `item` into consecutive entry ranges of `per_item` entries covering
/// `total` entries. A `per_item` of zero returns the item unchanged.
#[must_use]
pub fn split_entries(item: &WorkItem, total: u64, per_item: u64) -> Vec<WorkItem> {
    if per_item == 0 {
        return vec![item.clone()];
    }
    (0..total)
        .step_by(usize::try_from(per_item).unwrap_or(usize::MAX))
        .map(|first| {
            let last = first.saturating_add(per_item).min(total);
            item.clone().with_range(EntryRange::new(first, last))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("f{i}.jsonl"))).collect()
    }

    #[test]
    fn chunking_bounds_item_size() {
        let items = plan_chain_items("k", "DecayTree", &files(45), 20);
        let sizes: Vec<usize> = items
            .iter()
            .map(|it| match &it.source {
                Source::Chain { files, .. } => files.len(),
                Source::Sample { .. } => 0,
            })
            .collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert!(items.iter().all(|it| it.key == "k"));
        assert_eq!(plan_chain_items("k", "t", &files(45), 0).len(), 1);
        assert!(plan_chain_items("k", "t", &[], 20).is_empty());
    }

    #[test]
    fn entry_ranges_cover_the_chain() {
        let item = WorkItem::chain("k", "t", files(1));
        let parts = split_entries(&item, 10, 4);
        let ranges: Vec<_> = parts.iter().filter_map(|p| p.range).collect();
        assert_eq!(
            ranges,
            vec![
                EntryRange::new(0, 4),
                EntryRange::new(4, 8),
                EntryRange::new(8, 10)
            ]
        );
    }

    #[test]
    fn sample_items_honor_ranges() -> Result<()> {
        let events: Vec<Event> = (0..5).map(|i| Event::new().with("i", f64::from(i))).collect();
        let item = WorkItem::sample("k", events).with_range(EntryRange::new(1, 3));
        let mut seen = Vec::new();
        let n = item.for_each_event(|ev| {
            seen.extend(ev.get("i"));
            Ok(())
        })?;
        assert_eq!(n, 2);
        assert_eq!(seen, vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn items_survive_postcard() -> Result<()> {
        let item = WorkItem::sample("k", vec![Event::new().with_tree("t").with("x", 1.0)])
            .with_range(EntryRange::new(0, 1));
        let bytes = postcard::to_allocvec(&item)?;
        let back: WorkItem = postcard::from_bytes(&bytes)?;
        assert_eq!(back, item);
        Ok(())
    }
}
