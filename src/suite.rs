//! The suite coordinator: turns a suite definition into one concurrent
//! task per comparison group (each spawning one task per run), validates
//! the scheduled set up front, aggregates pass/fail statistics, and
//! handles cancellation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::compare::{compare_group, write_baseline, FileSet};
use crate::defs::{DefKind, DefStore, GroupDef, SuiteDef, SuiteSettings};
use crate::error::{ConfigError, DriverResult};
use crate::ledger::{Ledger, RunResult};
use crate::logbook::{Logbook, TaskLog};
use crate::profile::{ProfileRegistry, ProfileSet};
use crate::run;
use crate::workdir::Workdir;

const PRE: &str = "ts";

/// How this invocation interacts with stored baselines.
#[derive(Debug, Clone)]
pub enum BaselineMode {
    Off,
    /// Write each registered baseline source under the given root.
    Generate(PathBuf),
    /// Compare every run's output against the given root.
    Use(PathBuf),
}

/// Shared state handed to every group and run task. All cross-task
/// mutable structures live in the ledger; everything else is read-only.
pub struct SuiteContext {
    pub store: DefStore,
    pub ledger: Arc<Ledger>,
    pub profiles: ProfileRegistry,
    pub workdir: Arc<Workdir>,
    pub book: Arc<Logbook>,
    pub settings: SuiteSettings,
    pub baseline: BaselineMode,
    pub cancel: CancellationToken,
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub suite: String,
    pub groups_total: usize,
    pub groups_failed: usize,
    pub runs_total: usize,
    pub runs_failed: usize,
    pub builds_total: usize,
    pub builds_failed: usize,
    pub cancelled: bool,
    pub warned: bool,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.groups_failed == 0 && !self.cancelled
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

/// Owns the per-invocation state and drives suites to completion.
pub struct Coordinator {
    store: DefStore,
    workdir: Arc<Workdir>,
    book: Arc<Logbook>,
    ledger: Arc<Ledger>,
    profiles: ProfileRegistry,
    baseline: BaselineMode,
}

impl Coordinator {
    pub fn new(app: &Path, out: &Path, baseline: BaselineMode) -> DriverResult<Self> {
        std::fs::create_dir_all(out)?;
        let invocation = chrono::Utc::now().timestamp().to_string();
        let book = Logbook::create(out, &invocation)?;
        Ok(Self {
            store: DefStore::new(app),
            workdir: Arc::new(Workdir::new(out, invocation)),
            book,
            ledger: Arc::new(Ledger::new()),
            profiles: ProfileRegistry::with_defaults(),
            baseline,
        })
    }

    pub fn book(&self) -> &Arc<Logbook> {
        &self.book
    }

    pub fn store(&self) -> &DefStore {
        &self.store
    }

    /// Runs a named suite to completion.
    pub async fn run_suite(&self, name: &str) -> DriverResult<SuiteReport> {
        let suite = self.store.resolve_suite(name).map_err(|e| {
            self.book.error(PRE, &e.to_string());
            self.book.info(PRE, &format!("Test suite '{name}' FAILED"));
            e
        })?;
        self.book.info(PRE, &format!("Running test suite '{name}'"));
        let report = self.execute(suite).await;
        if report.is_err() {
            self.book.info(PRE, &format!("Test suite '{name}' FAILED"));
        }
        report
    }

    /// Runs a single run as a one-group, one-run suite; comparison is
    /// skipped, baseline actions still apply.
    pub async fn run_single(&self, name: &str, overrides: BTreeMap<String, crate::defs::DefValue>) -> DriverResult<SuiteReport> {
        let suite = SuiteDef {
            name: name.to_string(),
            settings: SuiteSettings::default(),
            groups: vec![GroupDef {
                name: name.to_string(),
                runs: vec![name.to_string()],
                overrides,
            }],
        };
        let report = self.execute(suite).await;
        if report.is_err() {
            self.book.info(PRE, "Aborting...");
        }
        report
    }

    async fn execute(&self, suite: SuiteDef) -> DriverResult<SuiteReport> {
        let scheduled = suite.scheduled_runs();
        let profiles_by_run = self.preflight(&suite, &scheduled).map_err(|e| {
            self.book.error(PRE, &e.to_string());
            e
        })?;

        self.workdir.init_builds(suite.settings.retain_builds)?;
        self.workdir.ensure_runs_dir()?;

        let ctx = Arc::new(SuiteContext {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            profiles: self.profiles.clone(),
            workdir: self.workdir.clone(),
            book: self.book.clone(),
            settings: suite.settings.clone(),
            baseline: self.baseline.clone(),
            cancel: CancellationToken::new(),
        });

        // external interrupt: cancel every task, then clean up jobs below
        let interrupt = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctx.book.info(PRE, "Interrupted");
                    ctx.cancel.cancel();
                }
            })
        };

        let mut tasks: JoinSet<(String, bool)> = JoinSet::new();
        for group in suite.groups.clone() {
            tasks.spawn(group_task(ctx.clone(), group));
        }

        let mut groups_failed = 0;
        while let Some(joined) = tasks.join_next().await {
            let ok = match joined {
                Ok((_, ok)) => ok,
                Err(_) => false,
            };
            if !ok {
                groups_failed += 1;
                if !ctx.settings.continue_on_failure {
                    ctx.cancel.cancel();
                }
            }
        }
        interrupt.abort();

        let cancelled = ctx.cancel.is_cancelled();
        if cancelled {
            self.cancel_active_jobs(&profiles_by_run).await;
        }

        if let BaselineMode::Generate(root) = &self.baseline {
            if groups_failed == 0 && !cancelled {
                self.generate_baselines(root)?;
            }
        }

        let report = self.report(&suite, &scheduled, groups_failed, cancelled);
        if cancelled {
            self.book
                .info(PRE, &format!("Test suite '{}' FAILED", suite.name));
        } else {
            self.emit_stats(&report);
        }
        Ok(report)
    }

    /// Static validation of the whole scheduled set, before any
    /// execution starts. Returns the resolved profile per run for later
    /// job cancellation.
    fn preflight(
        &self,
        suite: &SuiteDef,
        scheduled: &[String],
    ) -> Result<HashMap<String, ProfileSet>, ConfigError> {
        let mut profiles = HashMap::new();
        for group in &suite.groups {
            for name in &group.runs {
                let def = self.store.resolve_run(name, &group.overrides)?;
                for req in &def.require {
                    if !scheduled.iter().any(|r| r == req) {
                        return Err(ConfigError::UnscheduledDependency {
                            run: name.clone(),
                            requires: req.clone(),
                        });
                    }
                }
                let build = def.build.as_ref().ok_or_else(|| ConfigError::NoBuild {
                    run: name.clone(),
                })?;
                if !self.store.exists(DefKind::Build, build) {
                    return Err(ConfigError::MissingBuild {
                        run: name.clone(),
                        build: build.clone(),
                    });
                }
                if let BaselineMode::Generate(root) = &self.baseline {
                    if def.baseline_enabled() && root.join(&def.baseline).is_dir() {
                        return Err(ConfigError::BaselineConflict {
                            run: name.clone(),
                            baseline: def.baseline.clone(),
                        });
                    }
                }
                profiles.insert(name.clone(), self.profiles.resolve(&def)?);
            }
        }
        Ok(profiles)
    }

    /// Best-effort deletion of every job still recorded as active.
    async fn cancel_active_jobs(&self, profiles: &HashMap<String, ProfileSet>) {
        let jobs = self.ledger.active_jobs();
        if jobs.is_empty() {
            return;
        }
        self.book.info(PRE, "Stopping runs...");
        for job in jobs {
            if let Some(set) = profiles.get(&job.run) {
                set.runner.cancel_job(&job, &self.book).await;
            }
        }
    }

    fn generate_baselines(&self, root: &Path) -> DriverResult<()> {
        for (baseline, source) in self.ledger.baseline_sources() {
            self.book
                .info(PRE, &format!("Creating {baseline} baseline..."));
            write_baseline(root, &baseline, &source)?;
            self.book
                .info(PRE, &format!("Creating {baseline} baseline: OK"));
        }
        Ok(())
    }

    fn report(
        &self,
        suite: &SuiteDef,
        scheduled: &[String],
        groups_failed: usize,
        cancelled: bool,
    ) -> SuiteReport {
        let builds = self.ledger.build_results();
        let runs = self.ledger.run_results();
        SuiteReport {
            suite: suite.name.clone(),
            groups_total: suite.groups.len(),
            groups_failed,
            runs_total: scheduled.len(),
            runs_failed: runs.iter().filter(|r| r.failed).count(),
            builds_total: builds.len(),
            builds_failed: builds.iter().filter(|b| b.failed).count(),
            cancelled,
            warned: self.book.warned(),
        }
    }

    fn emit_stats(&self, report: &SuiteReport) {
        if report.groups_failed > 0 {
            self.book.info(
                PRE,
                &format!(
                    "Suite stats: Failure in {} of {} group(s)",
                    report.groups_failed, report.groups_total
                ),
            );
        }
        let rate = |failed: usize, total: usize| {
            if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            }
        };
        self.book.info(
            PRE,
            &format!(
                "Suite stats: build fail rate = {:.1}",
                rate(report.builds_failed, report.builds_total)
            ),
        );
        self.book.info(
            PRE,
            &format!(
                "Suite stats: run fail rate = {:.1}",
                rate(report.runs_failed, report.runs_total)
            ),
        );
        if report.groups_failed == 0 {
            let mut msg = "ALL TESTS PASSED".to_string();
            if report.warned {
                msg.push_str(" -- but note WARNING(s) above!");
            }
            self.book.info(PRE, &msg);
        } else {
            self.book.info(
                PRE,
                &format!(
                    "{} of {} TEST(S) FAILED",
                    report.runs_failed, report.runs_total
                ),
            );
        }
    }
}

/// One comparison group: spawn each member run, then compare the
/// survivors' output. A group is ok only if no member failed and the
/// comparison (if any) passed.
async fn group_task(ctx: Arc<SuiteContext>, group: GroupDef) -> (String, bool) {
    let mut log = TaskLog::new(ctx.book.clone(), format!("Group {}", group.name));
    let mut set = JoinSet::new();
    for name in group.runs.clone() {
        set.spawn(run::perform(ctx.clone(), name, group.overrides.clone()));
    }
    let mut results: Vec<Arc<RunResult>> = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(result) = joined {
            results.push(result);
        }
    }
    // comparison order is group declaration order
    let ordered: Vec<Arc<RunResult>> = group
        .runs
        .iter()
        .filter_map(|name| results.iter().find(|r| r.name == *name).cloned())
        .collect();
    let total = group.runs.len();
    let survivors: Vec<Arc<RunResult>> = ordered.iter().filter(|r| !r.failed).cloned().collect();
    let failed = total - survivors.len();
    let mut ok = failed == 0;

    if survivors.len() < 2 {
        if failed > 0 {
            log.info(&format!(
                "Group stats: {failed} of {total} runs failed, skipping comparison"
            ));
        }
        return (group.name, ok);
    }

    let names = survivors
        .iter()
        .map(|r| r.name.clone())
        .collect::<Vec<_>>()
        .join(", ");
    log.info(&format!("{names}: Checking..."));
    match group_comparator(&ctx, &group, &survivors[0].name) {
        Ok(set) => {
            let file_sets: Vec<FileSet> = survivors.iter().map(|r| FileSet::from_run(r)).collect();
            match compare_group(
                &file_sets,
                set.comparator.as_ref(),
                ctx.settings.continue_on_failure,
                &mut log,
            )
            .await
            {
                Ok(true) => log.info(&format!("{names}: OK")),
                Ok(false) => ok = false,
                Err(e) => {
                    log.error(&e.to_string());
                    ok = false;
                }
            }
        }
        Err(e) => {
            log.error(&e.to_string());
            ok = false;
        }
    }
    (group.name, ok)
}

/// The group's comparator comes from its reference run's profile.
fn group_comparator(
    ctx: &SuiteContext,
    group: &GroupDef,
    reference: &str,
) -> Result<ProfileSet, ConfigError> {
    let def = ctx.store.resolve_run(reference, &group.overrides)?;
    ctx.profiles.resolve(&def)
}
