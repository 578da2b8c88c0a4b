//! Error taxonomy for the orchestrator.
//!
//! Configuration problems are separated from execution problems: a
//! [`ConfigError`] is always fatal to the run or group it affects and is
//! reported before execution where statically detectable, while the
//! [`DriverError`] variants cover failures that occur once work is underway.

use std::path::PathBuf;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Problems with definition files or the scheduled run set.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A definition file could not be parsed as YAML.
    #[error("Error parsing definition '{file}': {source}")]
    Parse {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A definition's value cannot be represented (unknown YAML tag, etc).
    #[error("Definition '{file}': {reason}")]
    Invalid { file: String, reason: String },

    /// A definition names a parent that does not exist.
    #[error("Definition '{name}' extends missing ancestor '{ancestor}'")]
    MissingAncestor { name: String, ancestor: String },

    /// Inheritance revisited a name already on the resolution path.
    #[error("Circular dependency detected for '{name}' (chain: {chain})")]
    Cycle { name: String, chain: String },

    /// A build, run, or suite definition file was not found.
    #[error("No {kind} definition named '{name}' in {dir}")]
    NotFound {
        kind: &'static str,
        name: String,
        dir: PathBuf,
    },

    /// A key holds a value of the wrong shape.
    #[error("Config invalid: '{name}' key '{key}': {reason}")]
    BadValue {
        name: String,
        key: String,
        reason: String,
    },

    /// The same run name appears twice in one comparison group.
    #[error("Run '{run}' listed more than once in group '{group}'")]
    DuplicateRun { run: String, group: String },

    /// A run is not associated with any build.
    #[error("Run '{run}' not associated with any build")]
    NoBuild { run: String },

    /// A run names a build with no definition on disk.
    #[error("Run '{run}' associated with missing build '{build}'")]
    MissingBuild { run: String, build: String },

    /// A run requires a peer that is not part of the scheduled set.
    #[error("Run '{run}' depends on unscheduled run '{requires}'")]
    UnscheduledDependency { run: String, requires: String },

    /// A run requires a peer whose recorded result is a failure.
    #[error("Run '{run}' depends on failed run '{requires}'")]
    FailedDependency { run: String, requires: String },

    /// Baseline generation would overwrite an existing baseline directory.
    #[error("Run '{run}' could overwrite baseline '{baseline}'")]
    BaselineConflict { run: String, baseline: String },

    /// A run declares a profile name with no registered implementation.
    #[error("Run '{run}' declares unknown profile '{profile}'")]
    UnknownProfile { run: String, profile: String },
}

/// Failures during suite execution.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The build callback exited nonzero or its prep step failed.
    #[error("Build '{name}' failed")]
    Build { name: String },

    /// The run callback failed or the success marker was not found.
    #[error("Run '{name}' failed: {reason}")]
    Run { name: String, reason: String },

    /// Output file lists of two runs do not name the same files.
    #[error("File list matching failed ({left} vs {right})")]
    FileListMismatch { left: String, right: String },

    /// A pairwise file comparison found differing content.
    #[error("Comparison failed ({left} vs {right})")]
    Comparison { left: String, right: String },

    /// The invocation was interrupted or a sibling failure cancelled it.
    #[error("Interrupted")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// True for conditions that should abort sibling work when the suite
    /// is not in continue mode.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}
