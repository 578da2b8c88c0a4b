//! lockstep: a regression-test orchestrator.
//!
//! A test application supplies YAML definitions of builds, runs, and
//! suites; lockstep builds each required program once, executes the
//! scheduled runs concurrently, and verifies output either by
//! cross-comparing runs grouped as equivalent or by comparing against a
//! stored baseline.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Defs**: YAML definitions with single inheritance and tagged merges
//! - **Ledger**: process-wide one-shot memoization of build/run results
//! - **Profiles**: pluggable build/run/check/compare callback sets
//! - **Suite**: the coordinator driving comparison groups to a verdict
//!
//! # Example
//!
//! ```no_run
//! use lockstep::{BaselineMode, Coordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coord = Coordinator::new(
//!         std::path::Path::new("."),
//!         std::path::Path::new("."),
//!         BaselineMode::Off,
//!     )?;
//!     let report = coord.run_suite("nightly").await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod compare;
pub mod defs;
pub mod error;
pub mod ledger;
pub mod logbook;
pub mod profile;
pub mod run;
pub mod suite;
pub mod workdir;

// Re-export commonly used types
pub use defs::{DefKind, DefStore, DefValue, RunDef, SuiteDef};
pub use error::{ConfigError, DriverError, DriverResult};
pub use ledger::{BuildResult, Ledger, RunResult};
pub use profile::{ProfileRegistry, ProfileSet};
pub use suite::{BaselineMode, Coordinator, SuiteReport};
