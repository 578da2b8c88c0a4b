//! Capability-set interfaces for the pluggable build/run/check/compare
//! callbacks, plus the registry that resolves a declared profile name to
//! concrete implementations.
//!
//! A run's definition names a profile; the registry resolves that name
//! once per run into a [`ProfileSet`] of trait objects which the executor
//! passes explicitly through the run lifecycle. Alternate file
//! comparators are registered under their own names and selected with a
//! run's `comparator` key.

pub mod shell;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::defs::{DefValue, RunDef};
use crate::error::{ConfigError, DriverResult};
use crate::ledger::{ActiveJob, Ledger, OutFile};
use crate::logbook::{Logbook, TaskLog};
use crate::workdir::Workdir;

/// Everything a build callback can see.
#[derive(Clone)]
pub struct BuildEnv {
    pub name: String,
    pub spec: BTreeMap<String, DefValue>,
    /// `builds/<name>`, recreated per invocation unless retention is on.
    pub build_dir: PathBuf,
    pub retain: bool,
}

/// Everything a run callback can see.
#[derive(Clone)]
pub struct RunEnv {
    pub def: RunDef,
    /// Opaque artifact from the build postprocess callback.
    pub artifact: serde_json::Value,
    pub workdir: Arc<Workdir>,
    /// For registering externally-visible jobs so cancellation can reach
    /// them.
    pub ledger: Arc<Ledger>,
}

/// Handle to a completed external run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Captured stdout of the run, for the success check.
    pub stdout: PathBuf,
    pub job_id: Option<String>,
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn prepare(&self, env: &BuildEnv, log: &mut TaskLog) -> DriverResult<()>;

    /// Executes the build, returning its raw output.
    async fn execute(&self, env: &BuildEnv, log: &mut TaskLog) -> DriverResult<String>;

    /// Turns the raw build output into the opaque artifact recorded in
    /// the ledger.
    async fn postprocess(&self, env: &BuildEnv, output: &str) -> DriverResult<serde_json::Value>;
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Whether this run's definition calls for suite-wide data staging.
    /// Runs that do not must not consume the one-shot staging guard.
    fn needs_data(&self, env: &RunEnv) -> bool;

    /// Suite-wide data staging; invoked at most once per invocation.
    async fn prepare_data(&self, env: &RunEnv, log: &mut TaskLog) -> DriverResult<()>;

    /// Stages the run directory; returns the effective directory.
    async fn prepare_run(&self, env: &RunEnv, dir: &Path, log: &mut TaskLog) -> DriverResult<PathBuf>;

    /// Executes the run and returns a handle to its output.
    async fn execute(&self, env: &RunEnv, dir: &Path, log: &mut TaskLog) -> DriverResult<RunHandle>;

    /// Turns the run handle into the opaque check input / recorded value.
    async fn postprocess(&self, env: &RunEnv, handle: &RunHandle) -> DriverResult<serde_json::Value>;

    /// Lists the run's output artifacts as (prefix, suffix) pairs.
    fn list_output_files(&self, env: &RunEnv, dir: &Path) -> DriverResult<Vec<OutFile>>;

    /// Best-effort deletion of an external job during cancellation.
    async fn cancel_job(&self, job: &ActiveJob, book: &Logbook);
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// Decides whether the run succeeded, given the postprocess output.
    async fn check(&self, env: &RunEnv, input: &serde_json::Value, log: &mut TaskLog) -> DriverResult<bool>;
}

#[async_trait]
pub trait FileComparator: Send + Sync {
    /// True when the two files are equivalent.
    async fn compare(&self, left: &Path, right: &Path) -> DriverResult<bool>;
}

/// The concrete callbacks a run dispatches through.
#[derive(Clone)]
pub struct ProfileSet {
    pub builder: Arc<dyn Builder>,
    pub runner: Arc<dyn Runner>,
    pub checker: Arc<dyn Checker>,
    pub comparator: Arc<dyn FileComparator>,
}

impl std::fmt::Debug for ProfileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileSet").finish_non_exhaustive()
    }
}

/// Maps profile and comparator names to implementations.
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ProfileSet>,
    comparators: HashMap<String, Arc<dyn FileComparator>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell` profile and `bytes` comparator.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_profile("shell", shell::ShellProfile::set());
        registry.register_comparator("bytes", Arc::new(shell::ByteComparator));
        registry
    }

    pub fn register_profile(&mut self, name: &str, set: ProfileSet) {
        self.profiles.insert(name.to_string(), set);
    }

    pub fn register_comparator(&mut self, name: &str, comparator: Arc<dyn FileComparator>) {
        self.comparators.insert(name.to_string(), comparator);
    }

    /// Resolves a run's declared profile, honoring an alternate
    /// comparator if the run names one.
    pub fn resolve(&self, run: &RunDef) -> Result<ProfileSet, ConfigError> {
        let mut set = self
            .profiles
            .get(&run.profile)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProfile {
                run: run.name.clone(),
                profile: run.profile.clone(),
            })?;
        if let Some(alt) = run.spec.get("comparator").and_then(DefValue::as_str) {
            set.comparator = self
                .comparators
                .get(alt)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownProfile {
                    run: run.name.clone(),
                    profile: format!("comparator '{alt}'"),
                })?;
        }
        Ok(set)
    }
}
