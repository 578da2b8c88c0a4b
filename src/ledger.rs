//! The result ledger: process-wide record of build and run outcomes with
//! per-name one-shot execution.
//!
//! Every cross-task mutable structure lives here: the build and run
//! memoization maps, the active-jobs registry, and the baseline-sources
//! registry. Each is protected by its own lock, held only for a
//! check-and-maybe-insert, never across an external call. The one
//! exception is the per-name execution lock, which is held for the
//! duration of the one-time work so that contending callers block until
//! the first caller's result is recorded.
//!
//! Run names move through three states: absent (never scheduled),
//! incomplete (placeholder written before execution begins), and done.
//! Completion is broadcast on a [`Notify`] so dependents wake without
//! polling.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::DriverError;

/// One output artifact, split into a directory prefix and a relative
/// suffix. The split lets a baseline tree and a run directory share the
/// same suffix namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutFile {
    pub prefix: PathBuf,
    pub suffix: PathBuf,
}

impl OutFile {
    pub fn new(prefix: impl Into<PathBuf>, suffix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.prefix.join(&self.suffix)
    }
}

/// Outcome of one build, shared by every run referencing that build name.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub name: String,
    pub failed: bool,
    /// Opaque value from the build postprocess callback (binary path, etc).
    pub artifact: serde_json::Value,
}

impl BuildResult {
    pub fn failure(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failed: true,
            artifact: serde_json::Value::Null,
        }
    }
}

/// Outcome of one run, shared by every group referencing that run name.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub name: String,
    pub failed: bool,
    pub files: Vec<OutFile>,
    /// Opaque value from the run postprocess callback.
    pub result: serde_json::Value,
}

impl RunResult {
    pub fn failure(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failed: true,
            files: Vec::new(),
            result: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
enum RunState {
    Incomplete,
    Done(Arc<RunResult>),
}

/// A run's externally-visible job, kept so cancellation can delete it
/// from the batch system.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub run: String,
    pub job_id: String,
}

#[derive(Default)]
struct NameLocks {
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NameLocks {
    /// Two-phase acquisition: the shared guard lazily creates the per-name
    /// lock, then the caller holds that lock across the one-time work.
    async fn acquire(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Process-wide record of build/run results and shared registries.
#[derive(Default)]
pub struct Ledger {
    build_locks: NameLocks,
    builds: Mutex<HashMap<String, Arc<BuildResult>>>,
    run_locks: NameLocks,
    runs: Mutex<HashMap<String, RunState>>,
    run_done: Notify,
    data: tokio::sync::Mutex<Option<bool>>,
    active: Mutex<HashMap<String, ActiveJob>>,
    baseline_sources: Mutex<BTreeMap<String, Arc<RunResult>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` at most once for `name` across all concurrent callers;
    /// everyone observes the first caller's result, failures included.
    pub async fn build_once<F, Fut>(&self, name: &str, work: F) -> Arc<BuildResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BuildResult>,
    {
        let lock = self.build_locks.acquire(name).await;
        let _guard = lock.lock().await;
        if let Some(existing) = self.builds.lock().unwrap().get(name) {
            return existing.clone();
        }
        let result = Arc::new(work().await);
        self.builds
            .lock()
            .unwrap()
            .insert(name.to_string(), result.clone());
        result
    }

    /// Like [`build_once`](Self::build_once) for runs, with the
    /// `incomplete` placeholder written before execution begins so
    /// dependents can distinguish "running" from "not scheduled."
    pub async fn run_once<F, Fut>(&self, name: &str, work: F) -> Arc<RunResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RunResult>,
    {
        let lock = self.run_locks.acquire(name).await;
        let _guard = lock.lock().await;
        if let Some(RunState::Done(existing)) = self.runs.lock().unwrap().get(name) {
            return existing.clone();
        }
        self.runs
            .lock()
            .unwrap()
            .insert(name.to_string(), RunState::Incomplete);
        let result = Arc::new(work().await);
        self.runs
            .lock()
            .unwrap()
            .insert(name.to_string(), RunState::Done(result.clone()));
        self.run_done.notify_waiters();
        result
    }

    /// Terminal result for a run name, if it has one.
    pub fn run_result(&self, name: &str) -> Option<Arc<RunResult>> {
        match self.runs.lock().unwrap().get(name) {
            Some(RunState::Done(r)) => Some(r.clone()),
            _ => None,
        }
    }

    /// Blocks until `name` reaches a terminal state. The wait is unbounded;
    /// cancellation of the enclosing task is the only way out.
    pub async fn wait_for_run(&self, name: &str) -> Arc<RunResult> {
        loop {
            let notified = self.run_done.notified();
            if let Some(result) = self.run_result(name) {
                return result;
            }
            notified.await;
        }
    }

    /// Suite-wide data staging, performed at most once per invocation.
    pub async fn data_prep_once<F, Fut>(&self, work: F) -> Result<(), DriverError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DriverError>>,
    {
        let mut state = self.data.lock().await;
        match *state {
            Some(true) => Ok(()),
            Some(false) => Err(DriverError::Run {
                name: "data".to_string(),
                reason: "data preparation already failed".to_string(),
            }),
            None => {
                let outcome = work().await;
                *state = Some(outcome.is_ok());
                outcome
            }
        }
    }

    pub fn register_active(&self, run: &str, job_id: &str) {
        self.active.lock().unwrap().insert(
            run.to_string(),
            ActiveJob {
                run: run.to_string(),
                job_id: job_id.to_string(),
            },
        );
    }

    pub fn clear_active(&self, run: &str) {
        self.active.lock().unwrap().remove(run);
    }

    /// Snapshot of still-active jobs, for best-effort cancellation.
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.active.lock().unwrap().values().cloned().collect()
    }

    /// First-writer-wins registration of a baseline source. Returns false
    /// if the name was already claimed (runs sharing a baseline name are
    /// assumed equivalent).
    pub fn register_baseline_source(&self, baseline: &str, result: Arc<RunResult>) -> bool {
        let mut sources = self.baseline_sources.lock().unwrap();
        if sources.contains_key(baseline) {
            return false;
        }
        sources.insert(baseline.to_string(), result);
        true
    }

    pub fn baseline_sources(&self) -> Vec<(String, Arc<RunResult>)> {
        self.baseline_sources
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn build_results(&self) -> Vec<Arc<BuildResult>> {
        self.builds.lock().unwrap().values().cloned().collect()
    }

    pub fn run_results(&self) -> Vec<Arc<RunResult>> {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter_map(|s| match s {
                RunState::Done(r) => Some(r.clone()),
                RunState::Incomplete => None,
            })
            .collect()
    }
}
