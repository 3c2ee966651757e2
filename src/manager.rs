//! The work manager: dispatch, collect, merge.
//!
//! [`WorkManager::process`] runs a [`Task`] over a list of items. Workers are
//! threads of a dedicated rayon pool; each owns a clone of the task and pulls
//! items from a shared queue. Partial results travel back over a channel and
//! are merged by the calling thread only, in arrival order, so the aggregate
//! is never shared.
//!
//! In parallel mode items are encoded with `postcard` before dispatch and
//! decoded by the worker. An item that does not survive the round trip is a
//! configuration error.
//!
//! A failing item (an `Err` from [`Task::process`] or a panic) is retried up
//! to [`ManagerConfig::max_retries`] times, then logged and skipped. The run
//! continues with the remaining items. After a panic the worker restarts from
//! a fresh clone; if that restart fails, the worker's remaining items are
//! reported as failed.
//!
//! Workers are threads, not OS processes. They share nothing mutable: each
//! works on its own clone of the task and on decoded copies of the items.

use crate::error::{CalibError, ConfigError};
use crate::task::{Task, TaskState};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How items are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// `process` then `merge`, item by item, on the calling thread.
    Sequential,
    /// A pool of `workers` threads. One worker behaves like `Sequential`.
    Parallel { workers: usize },
}

impl ExecMode {
    /// One worker per logical CPU.
    #[must_use]
    pub fn parallel() -> Self {
        ExecMode::Parallel {
            workers: num_cpus::get().max(1),
        }
    }
}

/// Scheduler options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub mode: ExecMode,
    /// Files per work item when planning chains. Read by the planners
    /// ([`crate::RunConfig::work_items`]); the manager runs items as given.
    pub chunk_size: usize,
    /// Extra attempts for a failing item.
    pub max_retries: u32,
    /// Round-trip every item through `postcard` before dispatch.
    pub serialize_items: bool,
    /// Log progress every `progress` merges; `0` disables it.
    pub progress: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mode: ExecMode::parallel(),
            chunk_size: 20,
            max_retries: 0,
            serialize_items: true,
            progress: 0,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            mode: ExecMode::Sequential,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn parallel(workers: usize) -> Self {
        Self {
            mode: ExecMode::Parallel { workers },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_serialize_items(mut self, serialize_items: bool) -> Self {
        self.serialize_items = serialize_items;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, every: usize) -> Self {
        self.progress = every;
        self
    }

    /// Number of workers the mode asks for.
    #[must_use]
    pub fn workers(&self) -> usize {
        match self.mode {
            ExecMode::Sequential => 1,
            ExecMode::Parallel { workers } => workers,
        }
    }

    /// # Errors
    /// [`ConfigError::InvalidManager`] for a parallel mode without workers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers() == 0 {
            return Err(ConfigError::InvalidManager(
                "parallel mode needs at least one worker".into(),
            ));
        }
        Ok(())
    }
}

/// An item that contributed nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedItem {
    pub job_id: usize,
    pub label: String,
    pub attempts: u32,
    pub error: String,
}

/// Outcome of one [`WorkManager::process`] call.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub submitted: usize,
    /// Partial results handed to [`Task::merge`].
    pub merged: usize,
    pub failed_items: Vec<FailedItem>,
    /// Keys whose merge failed, with the reason.
    pub failed_keys: BTreeMap<String, String>,
    /// Merged items per item label.
    pub merged_labels: BTreeMap<String, usize>,
    pub workers: usize,
    pub elapsed: Duration,
    pub state: TaskState,
}

impl RunReport {
    fn new(submitted: usize, workers: usize) -> Self {
        Self {
            submitted,
            merged: 0,
            failed_items: Vec::new(),
            failed_keys: BTreeMap::new(),
            merged_labels: BTreeMap::new(),
            workers,
            elapsed: Duration::ZERO,
            state: TaskState::Uninitialized,
        }
    }

    /// Every item merged and no key failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_items.is_empty() && self.failed_keys.is_empty()
    }

    fn advance(&mut self, next: TaskState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, "task state");
        self.state = next;
    }
}

/// Why an item failed, after all attempts.
struct Failure {
    attempts: u32,
    error: String,
    panicked: bool,
}

struct Outcome<P> {
    job_id: usize,
    label: String,
    result: Result<P, Failure>,
}

enum Message<P> {
    Item(Outcome<P>),
    WorkerDown { worker_id: usize, error: String },
}

enum Payload<I> {
    Encoded(Vec<u8>),
    Plain(I),
}

/// A queued item: job id, label and the item itself.
type Queued<I> = (usize, String, Payload<I>);

/// Runs tasks according to a [`ManagerConfig`].
#[derive(Clone, Debug, Default)]
pub struct WorkManager {
    config: ManagerConfig,
}

impl WorkManager {
    /// # Errors
    /// [`ConfigError::InvalidManager`] if the configuration is unusable.
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn sequential() -> Self {
        Self {
            config: ManagerConfig::sequential(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Run `task` over `items`. Afterwards the aggregate is available from
    /// [`Task::results`].
    ///
    /// # Errors
    /// A [`ConfigError`] from validation aborts before any item is dispatched.
    /// Per-item failures and per-key merge failures do not abort; they are
    /// listed in the returned [`RunReport`].
    pub fn process<T: Task>(&self, task: &mut T, items: Vec<T::Item>) -> Result<RunReport, CalibError> {
        self.config.validate()?;
        task.validate(&items)?;

        let start = Instant::now();
        let workers = self.config.workers().min(items.len()).max(1);
        let mut report = RunReport::new(items.len(), workers);

        task.initialize_local();
        report.advance(TaskState::LocalReady);
        info!(
            task = task.name(),
            items = items.len(),
            workers,
            mode = ?self.config.mode,
            "run started"
        );

        if !items.is_empty() {
            if workers == 1 || !cfg!(feature = "parallel") {
                self.run_sequential(task, items, &mut report)?;
            } else {
                self.run_parallel(task, items, workers, &mut report)?;
            }
        }

        task.finalize();
        report.advance(TaskState::Done);
        report.elapsed = start.elapsed();
        info!(
            task = task.name(),
            merged = report.merged,
            failed_items = report.failed_items.len(),
            failed_keys = report.failed_keys.len(),
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );
        Ok(report)
    }

    fn run_sequential<T: Task>(&self, task: &mut T, items: Vec<T::Item>, report: &mut RunReport) -> Result<(), CalibError> {
        let mut worker = task.clone();
        if let Err(e) = worker.initialize_remote(0) {
            error!(worker_id = 0, error = %format!("{e:#}"), "worker initialization failed");
            for (job_id, item) in items.iter().enumerate() {
                report.failed_items.push(FailedItem {
                    job_id,
                    label: task.describe(item),
                    attempts: 0,
                    error: format!("worker initialization failed: {e:#}"),
                });
            }
            return Ok(());
        }
        report.advance(TaskState::RemoteReady);

        let mut items = items.into_iter().enumerate();
        while let Some((job_id, item)) = items.next() {
            report.advance(TaskState::Processing);
            let label = worker.describe(&item);
            let result = attempt(&mut worker, job_id, &item, self.config.max_retries);
            let panicked = result.as_ref().is_err_and(|f| f.panicked);
            self.absorb(task, Outcome { job_id, label, result }, report)?;
            if panicked {
                worker = task.clone();
                if let Err(e) = worker.initialize_remote(0) {
                    error!(worker_id = 0, error = %format!("{e:#}"), "worker restart failed");
                    for (job_id, item) in items.by_ref() {
                        report.failed_items.push(FailedItem {
                            job_id,
                            label: task.describe(&item),
                            attempts: 0,
                            error: format!("worker restart failed: {e:#}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn run_parallel<T: Task>(
        &self,
        task: &mut T,
        items: Vec<T::Item>,
        workers: usize,
        report: &mut RunReport,
    ) -> Result<(), CalibError> {
        let queue = Mutex::new(self.encode(task, items)?);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("calib-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::InvalidManager(format!("cannot start worker pool: {e}")))?;
        let max_retries = self.config.max_retries;
        let (tx, rx) = mpsc::channel::<Message<T::Partial>>();

        let result = pool.in_place_scope(|scope| {
            for worker_id in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let template = task.clone();
                scope.spawn(move |_| worker_loop(worker_id, &template, queue, &tx, max_retries));
            }
            drop(tx);
            report.advance(TaskState::RemoteReady);
            report.advance(TaskState::Processing);

            for message in rx {
                match message {
                    Message::Item(outcome) => {
                        if let Err(e) = self.absorb(task, outcome, report) {
                            // stop handing out work; running items finish and are dropped
                            queue.lock().unwrap_or_else(PoisonError::into_inner).clear();
                            return Err(e);
                        }
                    }
                    Message::WorkerDown { worker_id, error } => {
                        error!(worker_id, error = %error, "worker initialization failed");
                    }
                }
            }
            Ok(())
        });
        result?;

        // items no worker could take
        let leftover = std::mem::take(&mut *queue.lock().unwrap_or_else(PoisonError::into_inner));
        for (job_id, label, _) in leftover {
            report.failed_items.push(FailedItem {
                job_id,
                label,
                attempts: 0,
                error: "no worker available".into(),
            });
        }
        Ok(())
    }

    fn encode<T: Task>(&self, task: &T, items: Vec<T::Item>) -> Result<VecDeque<Queued<T::Item>>, ConfigError> {
        items
            .into_iter()
            .enumerate()
            .map(|(job_id, item)| {
                let label = task.describe(&item);
                if !self.config.serialize_items {
                    return Ok((job_id, label, Payload::Plain(item)));
                }
                match postcard::to_allocvec(&item) {
                    Ok(bytes) => Ok((job_id, label, Payload::Encoded(bytes))),
                    Err(e) => Err(ConfigError::InvalidItem {
                        job_id,
                        key: label,
                        reason: format!("not serializable: {e}"),
                    }),
                }
            })
            .collect()
    }

    /// Record one outcome on the controller; merges successful partials.
    fn absorb<T: Task>(&self, task: &mut T, outcome: Outcome<T::Partial>, report: &mut RunReport) -> Result<(), CalibError> {
        let Outcome {
            job_id,
            label,
            result,
        } = outcome;
        let partial = match result {
            Ok(partial) => partial,
            Err(failure) => {
                warn!(
                    job_id,
                    item = %label,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "item failed, skipping"
                );
                report.failed_items.push(FailedItem {
                    job_id,
                    label,
                    attempts: failure.attempts,
                    error: failure.error,
                });
                return Ok(());
            }
        };

        report.advance(TaskState::Merging);
        match task.merge(partial, job_id) {
            Ok(()) => {}
            Err(CalibError::Merge { key, source }) => {
                error!(job_id, key = %key, error = %source, "merge failed, key dropped");
                report.failed_keys.entry(key).or_insert_with(|| source.to_string());
            }
            Err(e) => return Err(e),
        }
        report.merged += 1;
        *report.merged_labels.entry(label).or_insert(0) += 1;
        report.advance(TaskState::Processing);

        let every = self.config.progress;
        if every > 0 && report.merged % every == 0 {
            info!(merged = report.merged, submitted = report.submitted, "progress");
        }
        Ok(())
    }
}

fn worker_loop<T: Task>(
    worker_id: usize,
    template: &T,
    queue: &Mutex<VecDeque<Queued<T::Item>>>,
    tx: &mpsc::Sender<Message<T::Partial>>,
    max_retries: u32,
) {
    let start = |template: &T| -> Result<T, String> {
        let mut local = template.clone();
        local
            .initialize_remote(worker_id)
            .map(|()| local)
            .map_err(|e| format!("{e:#}"))
    };
    let mut local = match start(template) {
        Ok(local) => local,
        Err(error) => {
            let _ = tx.send(Message::WorkerDown { worker_id, error });
            return;
        }
    };
    debug!(worker_id, "worker ready");

    loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some((job_id, label, payload)) = next else {
            break;
        };
        let item = match payload {
            Payload::Plain(item) => item,
            Payload::Encoded(bytes) => match postcard::from_bytes::<T::Item>(&bytes) {
                Ok(item) => item,
                Err(e) => {
                    let outcome = Outcome {
                        job_id,
                        label,
                        result: Err(Failure {
                            attempts: 0,
                            error: format!("cannot decode item: {e}"),
                            panicked: false,
                        }),
                    };
                    if tx.send(Message::Item(outcome)).is_err() {
                        break;
                    }
                    continue;
                }
            },
        };
        let result = attempt(&mut local, job_id, &item, max_retries);
        let panicked = result.as_ref().is_err_and(|f| f.panicked);
        if tx.send(Message::Item(Outcome { job_id, label, result })).is_err() {
            break;
        }
        if panicked {
            // a panic may leave the worker's copy half-updated
            match start(template) {
                Ok(fresh) => local = fresh,
                Err(error) => {
                    let _ = tx.send(Message::WorkerDown { worker_id, error });
                    return;
                }
            }
        }
    }
    debug!(worker_id, "worker drained");
}

/// Run `process` with retries, turning panics into failures.
fn attempt<T: Task>(task: &mut T, job_id: usize, item: &T::Item, max_retries: u32) -> Result<T::Partial, Failure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let (error, panicked) = match catch_unwind(AssertUnwindSafe(|| task.process(job_id, item))) {
            Ok(Ok(partial)) => return Ok(partial),
            Ok(Err(e)) => (format!("{e:#}"), false),
            Err(payload) => (format!("panicked: {}", panic_message(payload.as_ref())), true),
        };
        if attempts > max_retries {
            return Err(Failure {
                attempts,
                error,
                panicked,
            });
        }
        warn!(job_id, attempt = attempts, error = %error, "item failed, retrying");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
