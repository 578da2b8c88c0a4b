//! The built-in `shell` profile: build and run callbacks driven by
//! commands configured in the definitions themselves.
//!
//! Recognized build keys: `prep_cmd`, `cmd`, `artifact`. Recognized run
//! keys: `prep_cmd`, `cmd`, `success_re` (default `SUCCESS`), `outfiles`
//! (regex over relative output paths, default `^out`), and a `data`
//! mapping (`cmd`, `archive`, `sha256`, `extract_cmd`) for suite-wide
//! data staging. Commands run under `sh -c` in the relevant directory
//! with `LOCKSTEP_*` variables exported.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{BuildEnv, Builder, Checker, FileComparator, ProfileSet, RunEnv, RunHandle, Runner};
use crate::defs::DefValue;
use crate::error::{DriverError, DriverResult};
use crate::ledger::{ActiveJob, OutFile};
use crate::logbook::{Logbook, TaskLog};
use crate::workdir::walk_files;

pub struct ShellProfile;

impl ShellProfile {
    /// A complete capability set backed by this profile.
    pub fn set() -> ProfileSet {
        ProfileSet {
            builder: Arc::new(ShellBuilder),
            runner: Arc::new(ShellRunner),
            checker: Arc::new(MarkerChecker),
            comparator: Arc::new(ByteComparator),
        }
    }
}

fn spec_str<'a>(spec: &'a BTreeMap<String, DefValue>, key: &str) -> Option<&'a str> {
    spec.get(key).and_then(DefValue::as_str)
}

/// Runs a command line under `sh -c`, logging each output line to the
/// task's delayed buffer. Returns the combined output and exit code.
async fn run_shell(
    cmdline: &str,
    cwd: &Path,
    envs: &[(&str, String)],
    log: &mut TaskLog,
) -> DriverResult<(String, i32)> {
    log.debug(format!("Executing: {cmdline}"));
    let mut process = tokio::process::Command::new("sh");
    process.arg("-c").arg(cmdline);
    process.current_dir(cwd);
    for (key, value) in envs {
        process.env(key, value);
    }
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    let output = process.output().await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    for line in text.lines() {
        log.debug(line.to_string());
    }
    Ok((text, output.status.code().unwrap_or(-1)))
}

fn sha256_of(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct ShellBuilder;

#[async_trait]
impl Builder for ShellBuilder {
    async fn prepare(&self, env: &BuildEnv, log: &mut TaskLog) -> DriverResult<()> {
        std::fs::create_dir_all(&env.build_dir)?;
        if let Some(prep) = spec_str(&env.spec, "prep_cmd") {
            let prep = prep.to_string();
            let (_, code) = run_shell(
                &prep,
                &env.build_dir,
                &[
                    ("LOCKSTEP_BUILD_NAME", env.name.clone()),
                    ("LOCKSTEP_BUILD_DIR", env.build_dir.display().to_string()),
                ],
                log,
            )
            .await?;
            if code != 0 {
                return Err(DriverError::Build {
                    name: env.name.clone(),
                });
            }
        }
        Ok(())
    }

    async fn execute(&self, env: &BuildEnv, log: &mut TaskLog) -> DriverResult<String> {
        let cmd = spec_str(&env.spec, "cmd")
            .ok_or_else(|| DriverError::Run {
                name: env.name.clone(),
                reason: "build definition has no 'cmd'".to_string(),
            })?
            .to_string();
        let (output, code) = run_shell(
            &cmd,
            &env.build_dir,
            &[
                ("LOCKSTEP_BUILD_NAME", env.name.clone()),
                ("LOCKSTEP_BUILD_DIR", env.build_dir.display().to_string()),
            ],
            log,
        )
        .await?;
        if code != 0 {
            return Err(DriverError::Build {
                name: env.name.clone(),
            });
        }
        Ok(output)
    }

    async fn postprocess(&self, env: &BuildEnv, _output: &str) -> DriverResult<serde_json::Value> {
        // the artifact is conventionally a path under the build directory
        Ok(match spec_str(&env.spec, "artifact") {
            Some(rel) => serde_json::json!(env.build_dir.join(rel).display().to_string()),
            None => serde_json::json!(env.build_dir.display().to_string()),
        })
    }
}

pub struct ShellRunner;

impl ShellRunner {
    fn run_envs(env: &RunEnv, dir: &Path) -> Vec<(&'static str, String)> {
        vec![
            ("LOCKSTEP_RUN_NAME", env.def.name.clone()),
            ("LOCKSTEP_RUN_DIR", dir.display().to_string()),
            (
                "LOCKSTEP_ARTIFACT",
                env.artifact.as_str().unwrap_or_default().to_string(),
            ),
        ]
    }
}

#[async_trait]
impl Runner for ShellRunner {
    fn needs_data(&self, env: &RunEnv) -> bool {
        env.def.spec.get("data").and_then(DefValue::as_map).is_some()
    }

    async fn prepare_data(&self, env: &RunEnv, log: &mut TaskLog) -> DriverResult<()> {
        let Some(data) = env.def.spec.get("data").and_then(DefValue::as_map) else {
            return Ok(());
        };
        let root = env.workdir.root().to_path_buf();
        let fail = |reason: String| DriverError::Run {
            name: "data".to_string(),
            reason,
        };
        let archive = spec_str(data, "archive").map(|a| root.join(a));
        let digest = spec_str(data, "sha256");
        let ready = match (&archive, digest) {
            (Some(path), Some(want)) => path.is_file() && sha256_of(path)? == want,
            _ => false,
        };
        if !ready {
            if let Some(cmd) = spec_str(data, "cmd") {
                let cmd = cmd.to_string();
                log.debug(format!("Getting data: {cmd}"));
                let (_, code) = run_shell(&cmd, &root, &[], log).await?;
                if code != 0 {
                    return Err(fail("failed to get data".to_string()));
                }
            }
            if let (Some(path), Some(want)) = (&archive, digest) {
                if sha256_of(path)? != want {
                    return Err(fail(format!(
                        "data archive {} has incorrect sha256 digest",
                        path.display()
                    )));
                }
            }
        }
        if let Some(extract) = spec_str(data, "extract_cmd") {
            let extract = extract.to_string();
            log.debug(format!("Extracting data: {extract}"));
            let (_, code) = run_shell(&extract, &root, &[], log).await?;
            if code != 0 {
                return Err(fail("data extract failed".to_string()));
            }
            log.debug("Data extract complete");
        }
        Ok(())
    }

    async fn prepare_run(&self, env: &RunEnv, dir: &Path, log: &mut TaskLog) -> DriverResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        if let Some(prep) = spec_str(&env.def.spec, "prep_cmd") {
            let prep = prep.to_string();
            let (_, code) = run_shell(&prep, dir, &Self::run_envs(env, dir), log).await?;
            if code != 0 {
                return Err(DriverError::Run {
                    name: env.def.name.clone(),
                    reason: "run prep failed".to_string(),
                });
            }
        }
        Ok(dir.to_path_buf())
    }

    async fn execute(&self, env: &RunEnv, dir: &Path, log: &mut TaskLog) -> DriverResult<RunHandle> {
        let name = env.def.name.clone();
        let cmd = spec_str(&env.def.spec, "cmd")
            .ok_or_else(|| DriverError::Run {
                name: name.clone(),
                reason: "run definition has no 'cmd'".to_string(),
            })?
            .to_string();
        let stdout = dir.join("stdout");
        log.debug(format!("Running: {cmd}"));
        let mut process = tokio::process::Command::new("sh");
        process.arg("-c").arg(format!("( {cmd} ) >stdout 2>&1"));
        process.current_dir(dir);
        for (key, value) in Self::run_envs(env, dir) {
            process.env(key, value);
        }
        let mut child = process.spawn()?;
        let job_id = child.id().map(|pid| pid.to_string());
        if let Some(id) = &job_id {
            env.ledger.register_active(&name, id);
        }
        let status = child.wait().await;
        env.ledger.clear_active(&name);
        let status = status?;
        log.debug(format!("Run exited with status {}", status.code().unwrap_or(-1)));
        Ok(RunHandle { stdout, job_id })
    }

    async fn postprocess(&self, _env: &RunEnv, handle: &RunHandle) -> DriverResult<serde_json::Value> {
        Ok(serde_json::json!(handle.stdout.display().to_string()))
    }

    fn list_output_files(&self, env: &RunEnv, dir: &Path) -> DriverResult<Vec<OutFile>> {
        let pattern = spec_str(&env.def.spec, "outfiles").unwrap_or("^out");
        let re = Regex::new(pattern).map_err(|e| DriverError::Run {
            name: env.def.name.clone(),
            reason: format!("bad 'outfiles' pattern: {e}"),
        })?;
        Ok(walk_files(dir)?
            .into_iter()
            .filter(|rel| re.is_match(&rel.to_string_lossy()))
            .map(|rel| OutFile::new(dir, rel))
            .collect())
    }

    async fn cancel_job(&self, job: &ActiveJob, book: &Logbook) {
        book.info(&format!("Run {}", job.run), &format!("Deleting job {}", job.job_id));
        let _ = tokio::process::Command::new("kill")
            .arg(&job.job_id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

/// Declares success when the configured marker appears in the run's
/// captured stdout.
pub struct MarkerChecker;

#[async_trait]
impl Checker for MarkerChecker {
    async fn check(&self, env: &RunEnv, input: &serde_json::Value, log: &mut TaskLog) -> DriverResult<bool> {
        let marker = spec_str(&env.def.spec, "success_re").unwrap_or("SUCCESS");
        let re = Regex::new(marker).map_err(|e| DriverError::Run {
            name: env.def.name.clone(),
            reason: format!("bad 'success_re' pattern: {e}"),
        })?;
        let Some(path) = input.as_str() else {
            return Ok(false);
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            log.debug(format!("No run output at {path}"));
            return Ok(false);
        };
        if text.lines().any(|line| re.is_match(line)) {
            return Ok(true);
        }
        for line in text.lines() {
            log.debug(line.to_string());
        }
        Ok(false)
    }
}

/// Default comparator: full byte equality.
pub struct ByteComparator;

#[async_trait]
impl FileComparator for ByteComparator {
    async fn compare(&self, left: &Path, right: &Path) -> DriverResult<bool> {
        let a = tokio::fs::read(left).await?;
        let b = tokio::fs::read(right).await?;
        Ok(a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::RunDef;
    use crate::ledger::Ledger;
    use crate::logbook::Logbook;
    use crate::workdir::Workdir;
    use tempfile::TempDir;

    fn run_env(dir: &TempDir, spec_src: &str) -> RunEnv {
        let yaml: serde_yaml::Value = serde_yaml::from_str(spec_src).unwrap();
        let map = match DefValue::from_yaml(yaml, "test").unwrap() {
            DefValue::Map(m) => m,
            _ => panic!("map"),
        };
        RunEnv {
            def: RunDef::from_map("r1", map).unwrap(),
            artifact: serde_json::Value::Null,
            workdir: Arc::new(Workdir::new(dir.path(), "1")),
            ledger: Arc::new(Ledger::new()),
        }
    }

    fn task_log(dir: &TempDir) -> TaskLog {
        let book = Logbook::create(dir.path(), "test").unwrap();
        TaskLog::new(book, "test")
    }

    #[tokio::test]
    async fn marker_checker_requires_success_line() {
        let dir = TempDir::new().unwrap();
        let env = run_env(&dir, "cmd: true");
        let mut log = task_log(&dir);

        let out = dir.path().join("stdout");
        std::fs::write(&out, "step one\nRESULT: SUCCESS\n").unwrap();
        let input = serde_json::json!(out.display().to_string());
        assert!(MarkerChecker.check(&env, &input, &mut log).await.unwrap());

        std::fs::write(&out, "no marker here\n").unwrap();
        assert!(!MarkerChecker.check(&env, &input, &mut log).await.unwrap());
    }

    #[tokio::test]
    async fn execute_captures_stdout_and_clears_active_job() {
        let dir = TempDir::new().unwrap();
        let env = run_env(&dir, "cmd: echo SUCCESS");
        let mut log = task_log(&dir);
        let rundir = dir.path().join("r1.1");
        std::fs::create_dir_all(&rundir).unwrap();

        let handle = ShellRunner.execute(&env, &rundir, &mut log).await.unwrap();
        let text = std::fs::read_to_string(&handle.stdout).unwrap();
        assert!(text.contains("SUCCESS"));
        assert!(env.ledger.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn lists_output_files_matching_pattern() {
        let dir = TempDir::new().unwrap();
        let env = run_env(&dir, "outfiles: '^out[0-9]'");
        let rundir = dir.path().join("r1.1");
        std::fs::create_dir_all(&rundir).unwrap();
        for name in ["out1", "out2", "stdout", "notes"] {
            std::fs::write(rundir.join(name), "").unwrap();
        }
        let files = ShellRunner.list_output_files(&env, &rundir).unwrap();
        let suffixes: Vec<String> = files
            .iter()
            .map(|f| f.suffix.to_string_lossy().into_owned())
            .collect();
        assert_eq!(suffixes, vec!["out1", "out2"]);
    }

    #[tokio::test]
    async fn data_prep_rejects_bad_digest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.tgz"), "payload").unwrap();
        let env = run_env(
            &dir,
            "data:\n  archive: data.tgz\n  sha256: '0000000000000000000000000000000000000000000000000000000000000000'\n",
        );
        let mut log = task_log(&dir);
        let err = ShellRunner.prepare_data(&env, &mut log).await.unwrap_err();
        assert!(err.to_string().contains("sha256"), "{err}");
    }

    #[tokio::test]
    async fn byte_comparator_is_exact() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        assert!(ByteComparator.compare(&a, &b).await.unwrap());
        std::fs::write(&b, "diff").unwrap();
        assert!(!ByteComparator.compare(&a, &b).await.unwrap());
    }
}
