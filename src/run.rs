//! The per-run lifecycle: dependency wait, build, data staging, run,
//! check, and the baseline action.
//!
//! A run name executes at most once per invocation regardless of how
//! many comparison groups reference it; everyone else observes the
//! recorded result. Failures inside the lifecycle are recovered into a
//! failed [`RunResult`] so dependents and statistics can react, rather
//! than crashing the invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compare::{compare_group, FileSet};
use crate::defs::{DefKind, DefValue, RunDef};
use crate::error::{ConfigError, DriverError, DriverResult};
use crate::ledger::{BuildResult, RunResult};
use crate::logbook::TaskLog;
use crate::profile::{BuildEnv, ProfileSet, RunEnv};
use crate::suite::{BaselineMode, SuiteContext};

/// Executes (or retrieves) the named run, returning its recorded result.
pub async fn perform(
    ctx: Arc<SuiteContext>,
    name: String,
    overrides: BTreeMap<String, DefValue>,
) -> Arc<RunResult> {
    let key = name.clone();
    let ctx2 = ctx.clone();
    ctx.ledger
        .run_once(&key, move || async move {
            let mut log = TaskLog::new(ctx2.book.clone(), format!("Run {name}"));
            let outcome = tokio::select! {
                _ = ctx2.cancel.cancelled() => Err(DriverError::Cancelled),
                r = lifecycle(&ctx2, &name, &overrides, &mut log) => r,
            };
            match outcome {
                Ok(result) => {
                    log.info("Completed");
                    result
                }
                Err(e) => {
                    log.flush();
                    log.error(&e.to_string());
                    // leave the job registered on cancellation so the
                    // coordinator can still delete it
                    if !e.is_cancellation() {
                        ctx2.ledger.clear_active(&name);
                    }
                    RunResult::failure(&name)
                }
            }
        })
        .await
}

async fn lifecycle(
    ctx: &Arc<SuiteContext>,
    name: &str,
    overrides: &BTreeMap<String, DefValue>,
    log: &mut TaskLog,
) -> DriverResult<RunResult> {
    let def = ctx.store.resolve_run(name, overrides)?;
    log.debug(format!(
        "Resolved run config:\n{}",
        DefValue::Map(def.spec.clone()).pretty(1)
    ));
    let profile = ctx.profiles.resolve(&def)?;

    for req in &def.require {
        log.info(&format!("Waiting on required run: {req}"));
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(DriverError::Cancelled),
            r = ctx.ledger.wait_for_run(req) => r,
        };
        if result.failed {
            return Err(ConfigError::FailedDependency {
                run: name.to_string(),
                requires: req.clone(),
            }
            .into());
        }
    }

    let build_name = def.build.clone().ok_or_else(|| ConfigError::NoBuild {
        run: name.to_string(),
    })?;
    let build = perform_build(ctx, &profile, &def, &build_name).await?;
    if build.failed {
        return Err(DriverError::Run {
            name: name.to_string(),
            reason: format!("required build '{build_name}' unavailable"),
        });
    }

    if ctx.settings.build_only || def.build_only {
        return Ok(RunResult {
            name: name.to_string(),
            failed: false,
            files: Vec::new(),
            result: serde_json::Value::Null,
        });
    }

    let env = RunEnv {
        def: def.clone(),
        artifact: build.artifact.clone(),
        workdir: ctx.workdir.clone(),
        ledger: ctx.ledger.clone(),
    };

    if profile.runner.needs_data(&env) {
        let data_log = &mut *log;
        let data_env = &env;
        let runner = profile.runner.clone();
        ctx.ledger
            .data_prep_once(move || async move { runner.prepare_data(data_env, data_log).await })
            .await?;
    }

    log.info("Started");
    let dir = ctx.workdir.run_dir(name);
    std::fs::create_dir_all(&dir)?;
    log.debug("* Output from run prep:");
    let dir = profile.runner.prepare_run(&env, &dir, log).await?;
    log.debug("* Output from run:");
    let handle = profile.runner.execute(&env, &dir, log).await?;
    let check_input = profile.runner.postprocess(&env, &handle).await?;
    if !profile.checker.check(&env, &check_input, log).await? {
        return Err(DriverError::Run {
            name: name.to_string(),
            reason: format!("Run failed, see {}", handle.stdout.display()),
        });
    }
    let files = profile.runner.list_output_files(&env, &dir)?;
    let result = RunResult {
        name: name.to_string(),
        failed: false,
        files,
        result: check_input,
    };
    baseline_action(ctx, &def, &profile, &result, log).await?;
    log.flush();
    Ok(result)
}

/// Delegates to the ledger-memoized build step. The winning caller logs
/// under its own prefix; everyone else gets the cached result, failures
/// included.
async fn perform_build(
    ctx: &Arc<SuiteContext>,
    profile: &ProfileSet,
    run: &RunDef,
    build_name: &str,
) -> DriverResult<Arc<BuildResult>> {
    if !ctx.store.exists(DefKind::Build, build_name) {
        return Err(ConfigError::MissingBuild {
            run: run.name.clone(),
            build: build_name.to_string(),
        }
        .into());
    }
    let spec = ctx.store.resolve(DefKind::Build, build_name)?;
    let env = BuildEnv {
        name: build_name.to_string(),
        spec,
        build_dir: ctx.workdir.build_dir(build_name),
        retain: ctx.settings.retain_builds,
    };
    let builder = profile.builder.clone();
    let book = ctx.book.clone();
    Ok(ctx
        .ledger
        .build_once(build_name, move || async move {
            let mut log = TaskLog::new(book, format!("Build {}", env.name));
            log.info("Started");
            let steps = async {
                builder.prepare(&env, &mut log).await?;
                log.debug("* Output from build:");
                let output = builder.execute(&env, &mut log).await?;
                builder.postprocess(&env, &output).await
            };
            match steps.await {
                Ok(artifact) => {
                    log.info("Completed");
                    BuildResult {
                        name: env.name.clone(),
                        failed: false,
                        artifact,
                    }
                }
                Err(e) => {
                    log.flush();
                    log.error(&format!("Build failed: {e}"));
                    BuildResult::failure(&env.name)
                }
            }
        })
        .await)
}

async fn baseline_action(
    ctx: &Arc<SuiteContext>,
    def: &RunDef,
    profile: &ProfileSet,
    result: &RunResult,
    log: &mut TaskLog,
) -> DriverResult<()> {
    match &ctx.baseline {
        BaselineMode::Off => {}
        BaselineMode::Generate(_) => {
            if !def.baseline_enabled() {
                log.debug(format!("Baseline registration for {} disabled, skipping", def.name));
            } else {
                // first writer wins; runs sharing a baseline name are
                // assumed equivalent
                ctx.ledger
                    .register_baseline_source(&def.baseline, Arc::new(result.clone()));
            }
        }
        BaselineMode::Use(root) => {
            if !def.baseline_enabled() {
                log.debug(format!("Baseline comparison for {} disabled, skipping", def.name));
            } else if !root.is_dir() {
                log.warn(&format!(
                    "Baseline directory '{}' not found, continuing...",
                    root.display()
                ));
            } else {
                let sub = root.join(&def.baseline);
                if sub.is_dir() {
                    log.info(&format!("Comparing to baseline {}", def.baseline));
                    let sets = [
                        FileSet::from_run(result),
                        FileSet::from_baseline(&format!("baseline {}", def.baseline), &sub)?,
                    ];
                    if !compare_group(&sets, profile.comparator.as_ref(), false, log).await? {
                        return Err(DriverError::Comparison {
                            left: result.name.clone(),
                            right: format!("baseline {}", def.baseline),
                        });
                    }
                    log.info("Baseline comparison OK");
                } else {
                    log.warn(&format!("No baseline '{}' found, continuing...", def.baseline));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefKind, DefStore};
    use crate::ledger::Ledger;
    use crate::logbook::Logbook;
    use crate::profile::ProfileRegistry;
    use crate::suite::SuiteContext;
    use crate::workdir::Workdir;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(dir: &TempDir, files: &[(DefKind, &str, &str)]) -> Arc<SuiteContext> {
        let app = dir.path().join("app");
        for kind in [DefKind::Build, DefKind::Run, DefKind::Suite] {
            std::fs::create_dir_all(app.join(kind.dirname())).unwrap();
        }
        for (kind, name, body) in files {
            std::fs::write(app.join(kind.dirname()).join(name), body).unwrap();
        }
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        Arc::new(SuiteContext {
            store: DefStore::new(&app),
            ledger: Arc::new(Ledger::new()),
            profiles: ProfileRegistry::with_defaults(),
            workdir: Arc::new(Workdir::new(&out, "1")),
            book: Logbook::create(&out, "1").unwrap(),
            settings: Default::default(),
            baseline: BaselineMode::Off,
            cancel: CancellationToken::new(),
        })
    }

    const OK_BUILD: &str = "cmd: 'true'\n";

    #[tokio::test]
    async fn run_without_build_fails_before_callbacks() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, &[(DefKind::Run, "r1", "baseline: none\ncmd: 'true'\n")]);
        let result = perform(ctx.clone(), "r1".to_string(), BTreeMap::new()).await;
        assert!(result.failed);
        // no run directory was ever created
        assert!(!ctx.workdir.run_dir("r1").exists());
    }

    #[tokio::test]
    async fn successful_run_records_output_files() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "b1", OK_BUILD),
                (
                    DefKind::Run,
                    "r1",
                    "build: b1\ncmd: echo hi > out1 && echo SUCCESS\n",
                ),
            ],
        );
        let result = perform(ctx, "r1".to_string(), BTreeMap::new()).await;
        assert!(!result.failed, "run should pass");
        let suffixes: Vec<String> = result
            .files
            .iter()
            .map(|f| f.suffix.to_string_lossy().into_owned())
            .collect();
        assert_eq!(suffixes, vec!["out1"]);
    }

    #[tokio::test]
    async fn missing_success_marker_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "b1", OK_BUILD),
                (DefKind::Run, "r1", "build: b1\ncmd: echo no marker here\n"),
            ],
        );
        let result = perform(ctx, "r1".to_string(), BTreeMap::new()).await;
        assert!(result.failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_build_executes_once() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("out/builds/builds.count");
        let ctx = context(
            &dir,
            &[
                (
                    DefKind::Build,
                    "b1",
                    "cmd: echo built >> ../builds.count\n",
                ),
                (DefKind::Run, "r1", "build: b1\ncmd: echo SUCCESS\n"),
                (DefKind::Run, "r2", "build: b1\ncmd: echo SUCCESS\n"),
            ],
        );
        let a = tokio::spawn(perform(ctx.clone(), "r1".to_string(), BTreeMap::new()));
        let b = tokio::spawn(perform(ctx.clone(), "r2".to_string(), BTreeMap::new()));
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(!ra.failed && !rb.failed);
        let text = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(text.lines().count(), 1, "build ran more than once");
    }

    #[tokio::test]
    async fn failed_build_fails_every_dependent_run() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "bad", "cmd: 'false'\n"),
                (DefKind::Run, "r1", "build: bad\ncmd: echo SUCCESS\n"),
                (DefKind::Run, "r2", "build: bad\ncmd: echo SUCCESS\n"),
            ],
        );
        let r1 = perform(ctx.clone(), "r1".to_string(), BTreeMap::new()).await;
        let r2 = perform(ctx.clone(), "r2".to_string(), BTreeMap::new()).await;
        assert!(r1.failed && r2.failed);
        assert_eq!(ctx.ledger.build_results().len(), 1);
    }

    #[tokio::test]
    async fn dependent_fails_without_running_when_dependency_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "b1", OK_BUILD),
                (DefKind::Run, "r1", "build: b1\ncmd: 'false'\n"),
                (
                    DefKind::Run,
                    "r2",
                    "build: b1\nrequire: r1\ncmd: echo SUCCESS\n",
                ),
            ],
        );
        let r1 = perform(ctx.clone(), "r1".to_string(), BTreeMap::new()).await;
        assert!(r1.failed);
        let r2 = perform(ctx.clone(), "r2".to_string(), BTreeMap::new()).await;
        assert!(r2.failed);
        assert!(!ctx.workdir.run_dir("r2").exists());
    }

    #[tokio::test]
    async fn build_only_skips_execution() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "b1", OK_BUILD),
                (
                    DefKind::Run,
                    "r1",
                    "build: b1\nbuild_only: true\ncmd: 'false'\n",
                ),
            ],
        );
        let result = perform(ctx.clone(), "r1".to_string(), BTreeMap::new()).await;
        assert!(!result.failed);
        assert!(result.files.is_empty());
        assert!(!ctx.workdir.run_dir("r1").exists());
    }

    #[tokio::test]
    async fn data_staging_survives_earlier_run_without_data() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            &[
                (DefKind::Build, "b1", OK_BUILD),
                (DefKind::Run, "plain", "build: b1\ncmd: echo SUCCESS\n"),
                (
                    DefKind::Run,
                    "staged",
                    "build: b1\ndata:\n  cmd: touch staged.txt\ncmd: echo SUCCESS\n",
                ),
            ],
        );
        let plain = perform(ctx.clone(), "plain".to_string(), BTreeMap::new()).await;
        assert!(!plain.failed);
        let staged = perform(ctx.clone(), "staged".to_string(), BTreeMap::new()).await;
        assert!(!staged.failed);
        // a run with no data mapping must not consume the one-shot guard
        assert!(dir.path().join("out/staged.txt").is_file());
    }

    #[tokio::test]
    async fn baseline_generation_registers_first_writer() {
        let dir = TempDir::new().unwrap();
        let mut files = vec![
            (DefKind::Build, "b1", OK_BUILD),
            (
                DefKind::Run,
                "r1",
                "build: b1\nbaseline: base1\ncmd: echo x > out1 && echo SUCCESS\n",
            ),
        ];
        let baseline_root = dir.path().join("bl");
        let ctx = {
            let mut ctx = context(&dir, &files.drain(..).collect::<Vec<_>>());
            Arc::get_mut(&mut ctx).unwrap().baseline = BaselineMode::Generate(baseline_root);
            ctx
        };
        let result = perform(ctx.clone(), "r1".to_string(), BTreeMap::new()).await;
        assert!(!result.failed);
        let sources = ctx.ledger.baseline_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, "base1");
    }
}
