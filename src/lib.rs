//! # Calibflow
//!
//! Parallel production of PID **efficiency histograms** and **sample
//! statistics** from calibration samples.
//!
//! A physicist declares a particle, a data-taking period and a binning; the
//! crate plans the work, farms it out to a pool of workers and folds the
//! partial histograms back together into one result per sample key.
//!
//! ## Key Features
//!
//! - **One task contract** - [`Task`] with local/remote initialization,
//!   `process`, `merge` and `results`
//! - **Lossless, order-independent merging** - the [`Mergeable`] algebra over
//!   histogram pairs, dictionaries of pairs and running statistics
//! - **Controller-only merges** - workers never touch the aggregate, so it
//!   needs no lock
//! - **Skip-and-continue** - a failing or panicking item is logged and
//!   skipped, the run goes on
//! - **Serializable selections** - cuts and projections are data, not closures
//! - **Sequential and parallel execution** with identical results
//!
//! ## Quick Start
//!
//! ```
//! use calibflow::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let events: Vec<Event> = [0.9, 0.7, 0.2, 0.4]
//!     .iter()
//!     .map(|pid| Event::new().with("P", 5.0).with("ProbNNk", *pid))
//!     .collect();
//!
//! let mut task = EfficiencyTask::new(
//!     Binning::one_d(vec![0.0, 10.0])?,
//!     Selection::threshold("ProbNNk", 0.5),
//!     Projection::parse(&["P"])?,
//! )?;
//! let items = vec![WorkItem::sample("pp/2016/v5r1/MagUp/DSt_K", events)];
//!
//! let report = WorkManager::new(ManagerConfig::parallel(2))?.process(&mut task, items)?;
//! assert!(report.is_clean());
//!
//! let pair = task.results().get("pp/2016/v5r1/MagUp/DSt_K").and_then(Accumulator::as_pair).unwrap();
//! assert_eq!(efficiency(pair).values(), vec![0.5]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Work items
//!
//! A [`WorkItem`] is self-describing: a key plus either a chain of files or
//! events carried by value, optionally restricted to an entry range. In
//! parallel mode each item is serialized before dispatch.
//!
//! ### Partial results and the aggregate
//!
//! Workers return [`PartialResult`]s. The controller folds them into an
//! [`Aggregate`], keyed by sample, with an optional `TOTAL`. A key whose
//! partials disagree in binning is poisoned and reported as failed; other
//! keys are unaffected.
//!
//! ### Efficiency
//!
//! [`efficiency`] turns a merged (accepted, rejected) pair into
//! `1 / (1 + rejected / accepted)` per bin. Bins with nothing accepted are
//! flagged, never fatal.
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod efficiency;
pub mod error;
pub mod histogram;
pub mod manager;
pub mod partial;
pub mod report;
pub mod selection;
pub mod source;
pub mod stats;
pub mod store;
pub mod task;
pub mod tasks;
pub mod work_item;

pub use aggregate::{Aggregate, TOTAL_KEY};
pub use catalog::{Polarity, RunRequest, SampleCatalog, make_key};
pub use config::RunConfig;
pub use efficiency::{BinEfficiency, EfficiencyHistogram, efficiency, integrated};
pub use error::{CalibError, ConfigError, MergeError};
pub use histogram::{Axis, Binning, Histogram};
pub use manager::{ExecMode, FailedItem, ManagerConfig, RunReport, WorkManager};
pub use partial::{Accumulator, HistogramPair, Mergeable, PartialResult};
pub use report::Report;
pub use selection::{Cut, Projection, Selection};
pub use source::Event;
pub use stats::{RunningStats, StatsMap};
pub use store::{ResultStore, StoredValue};
pub use task::{Task, TaskState};
pub use tasks::{EfficiencyTask, Grouping, StatsTask};
pub use work_item::{EntryRange, Source, WorkItem, plan_chain_items, split_entries};
