//! The definition store: loads build/run/suite documents and resolves
//! single inheritance into merged trees.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use super::merge::merge;
use super::value::DefValue;
use crate::error::ConfigError;

/// Sentinel baseline name disabling registration and comparison for a run.
pub const BASELINE_NONE: &str = "none";

/// The three definition namespaces, each its own subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefKind {
    Build,
    Run,
    Suite,
}

impl DefKind {
    pub fn dirname(self) -> &'static str {
        match self {
            DefKind::Build => "builds",
            DefKind::Run => "runs",
            DefKind::Suite => "suites",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DefKind::Build => "build",
            DefKind::Run => "run",
            DefKind::Suite => "suite",
        }
    }
}

/// Loads and resolves definitions under `<root>/{builds,runs,suites}/<name>`.
#[derive(Debug, Clone)]
pub struct DefStore {
    root: PathBuf,
}

impl DefStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, kind: DefKind) -> PathBuf {
        self.root.join(kind.dirname())
    }

    fn path(&self, kind: DefKind, name: &str) -> PathBuf {
        self.dir(kind).join(name)
    }

    pub fn exists(&self, kind: DefKind, name: &str) -> bool {
        self.path(kind, name).is_file()
    }

    /// Names of all definitions of one kind, sorted.
    pub fn list(&self, kind: DefKind) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir(kind))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Reads one file as a raw (unmerged) mapping.
    fn read_raw(&self, kind: DefKind, name: &str) -> Result<BTreeMap<String, DefValue>, ConfigError> {
        let path = self.path(kind, name);
        if !path.is_file() {
            return Err(ConfigError::NotFound {
                kind: kind.label(),
                name: name.to_string(),
                dir: self.dir(kind),
            });
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Invalid {
            file: name.to_string(),
            reason: format!("unreadable: {e}"),
        })?;
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                file: name.to_string(),
                source,
            })?;
        match DefValue::from_yaml(yaml, name)? {
            DefValue::Map(map) => Ok(map),
            DefValue::Null => Ok(BTreeMap::new()),
            other => Err(ConfigError::Invalid {
                file: name.to_string(),
                reason: format!("top level must be a mapping, got {other:?}"),
            }),
        }
    }

    /// Resolves a definition: recursively resolves the declared ancestor
    /// first, then merges this document onto it. The `extends` key is
    /// consumed during resolution and never appears in the result.
    pub fn resolve(&self, kind: DefKind, name: &str) -> Result<BTreeMap<String, DefValue>, ConfigError> {
        let mut chain = Vec::new();
        let merged = self.resolve_inner(kind, name, &mut chain)?;
        debug!(
            "Resolved {} '{}':\n{}",
            kind.label(),
            name,
            DefValue::Map(merged.clone()).pretty(1)
        );
        Ok(merged)
    }

    fn resolve_inner(
        &self,
        kind: DefKind,
        name: &str,
        chain: &mut Vec<String>,
    ) -> Result<BTreeMap<String, DefValue>, ConfigError> {
        if chain.iter().any(|n| n == name) {
            return Err(ConfigError::Cycle {
                name: name.to_string(),
                chain: chain.join(" -> "),
            });
        }
        chain.push(name.to_string());
        let mut raw = self.read_raw(kind, name)?;
        let ancestor = raw.remove("extends");
        let merged = match ancestor {
            None => raw,
            Some(value) => {
                let parent = value.as_str().ok_or_else(|| ConfigError::BadValue {
                    name: name.to_string(),
                    key: "extends".to_string(),
                    reason: "must be a definition name".to_string(),
                })?;
                if !self.exists(kind, parent) {
                    return Err(ConfigError::MissingAncestor {
                        name: name.to_string(),
                        ancestor: parent.to_string(),
                    });
                }
                let base = self.resolve_inner(kind, parent, chain)?;
                merge(base, raw)
            }
        };
        Ok(merged)
    }

    /// Ancestry chain, most specific first. Used for diagnostic display.
    pub fn ancestry(&self, kind: DefKind, name: &str) -> Result<Vec<String>, ConfigError> {
        let mut chain = Vec::new();
        let mut current = name.to_string();
        loop {
            if chain.contains(&current) {
                return Err(ConfigError::Cycle {
                    name: current,
                    chain: chain.join(" -> "),
                });
            }
            chain.push(current.clone());
            let raw = self.read_raw(kind, &current)?;
            match raw.get("extends").and_then(|v| v.as_str()) {
                Some(parent) => current = parent.to_string(),
                None => break,
            }
        }
        Ok(chain)
    }

    /// Resolves a run definition and applies group- or suite-level
    /// overrides on top of the merged result.
    pub fn resolve_run(
        &self,
        name: &str,
        overrides: &BTreeMap<String, DefValue>,
    ) -> Result<RunDef, ConfigError> {
        let mut merged = self.resolve(DefKind::Run, name)?;
        if !overrides.is_empty() {
            merged = merge(merged, overrides.clone());
        }
        RunDef::from_map(name, merged)
    }

    /// Resolves a suite definition into groups plus suite-wide settings.
    pub fn resolve_suite(&self, name: &str) -> Result<SuiteDef, ConfigError> {
        let merged = self.resolve(DefKind::Suite, name)?;
        SuiteDef::from_map(name, merged)
    }
}

/// A run definition after merging and override application.
#[derive(Debug, Clone)]
pub struct RunDef {
    pub name: String,
    /// Capability-set profile this run dispatches its callbacks through.
    pub profile: String,
    pub build: Option<String>,
    pub baseline: String,
    pub require: Vec<String>,
    pub build_only: bool,
    /// The full merged tree, handed to profile callbacks.
    pub spec: BTreeMap<String, DefValue>,
}

impl RunDef {
    pub fn from_map(name: &str, spec: BTreeMap<String, DefValue>) -> Result<Self, ConfigError> {
        let str_key = |key: &'static str| -> Result<Option<String>, ConfigError> {
            match spec.get(key) {
                None => Ok(None),
                Some(v) => v.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
                    ConfigError::BadValue {
                        name: name.to_string(),
                        key: key.to_string(),
                        reason: "must be a string".to_string(),
                    }
                }),
            }
        };
        let require = match spec.get("require") {
            None => Vec::new(),
            Some(DefValue::Str(s)) => vec![s.clone()],
            Some(DefValue::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| ConfigError::BadValue {
                        name: name.to_string(),
                        key: "require".to_string(),
                        reason: "list elements must be run names".to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(ConfigError::BadValue {
                    name: name.to_string(),
                    key: "require".to_string(),
                    reason: "must be a run name or list of run names".to_string(),
                })
            }
        };
        Ok(RunDef {
            name: name.to_string(),
            profile: str_key("profile")?.unwrap_or_else(|| "shell".to_string()),
            build: str_key("build")?,
            baseline: str_key("baseline")?.unwrap_or_else(|| BASELINE_NONE.to_string()),
            require,
            build_only: spec.get("build_only").and_then(DefValue::as_bool).unwrap_or(false),
            spec,
        })
    }

    pub fn baseline_enabled(&self) -> bool {
        self.baseline != BASELINE_NONE
    }
}

/// Suite-wide scalar settings.
#[derive(Debug, Clone, Default)]
pub struct SuiteSettings {
    /// Proceed past failures instead of aborting siblings.
    pub continue_on_failure: bool,
    pub build_only: bool,
    pub retain_builds: bool,
}

/// One comparison group: an ordered set of unique run names plus
/// group-level configuration overrides.
#[derive(Debug, Clone)]
pub struct GroupDef {
    pub name: String,
    pub runs: Vec<String>,
    pub overrides: BTreeMap<String, DefValue>,
}

/// A parsed suite: comparison groups plus settings.
#[derive(Debug, Clone)]
pub struct SuiteDef {
    pub name: String,
    pub settings: SuiteSettings,
    pub groups: Vec<GroupDef>,
}

impl SuiteDef {
    pub fn from_map(name: &str, map: BTreeMap<String, DefValue>) -> Result<Self, ConfigError> {
        let mut settings = SuiteSettings::default();
        let mut groups = Vec::new();
        for (key, value) in map {
            match value {
                DefValue::List(items) => {
                    let runs = group_runs(name, &key, &items)?;
                    groups.push(GroupDef {
                        name: key,
                        runs,
                        overrides: BTreeMap::new(),
                    });
                }
                DefValue::Map(mut inner) => {
                    // a group may carry scalar overrides next to its run list
                    let items = match inner.remove("runs") {
                        Some(DefValue::List(items)) => items,
                        _ => {
                            return Err(ConfigError::BadValue {
                                name: name.to_string(),
                                key,
                                reason: "group mapping must contain a 'runs' list".to_string(),
                            })
                        }
                    };
                    let runs = group_runs(name, &key, &items)?;
                    groups.push(GroupDef {
                        name: key,
                        runs,
                        overrides: inner,
                    });
                }
                scalar => match key.as_str() {
                    "continue" => settings.continue_on_failure = flag(name, &key, &scalar)?,
                    "build_only" => settings.build_only = flag(name, &key, &scalar)?,
                    "retain_builds" => settings.retain_builds = flag(name, &key, &scalar)?,
                    _ => {
                        return Err(ConfigError::BadValue {
                            name: name.to_string(),
                            key,
                            reason: "unrecognized suite setting".to_string(),
                        })
                    }
                },
            }
        }
        Ok(SuiteDef {
            name: name.to_string(),
            settings,
            groups,
        })
    }

    /// Every run name scheduled by this suite, first appearance order.
    pub fn scheduled_runs(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for group in &self.groups {
            for run in &group.runs {
                if !seen.contains(run) {
                    seen.push(run.clone());
                }
            }
        }
        seen
    }
}

fn flag(suite: &str, key: &str, value: &DefValue) -> Result<bool, ConfigError> {
    value.as_bool().ok_or_else(|| ConfigError::BadValue {
        name: suite.to_string(),
        key: key.to_string(),
        reason: "must be a boolean".to_string(),
    })
}

fn group_runs(suite: &str, group: &str, items: &[DefValue]) -> Result<Vec<String>, ConfigError> {
    let mut runs = Vec::new();
    for item in items {
        let run = item.as_str().ok_or_else(|| ConfigError::BadValue {
            name: suite.to_string(),
            key: group.to_string(),
            reason: "group elements must be run names".to_string(),
        })?;
        if runs.iter().any(|r| r == run) {
            return Err(ConfigError::DuplicateRun {
                run: run.to_string(),
                group: group.to_string(),
            });
        }
        runs.push(run.to_string());
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store_with(files: &[(DefKind, &str, &str)]) -> (TempDir, DefStore) {
        let dir = TempDir::new().unwrap();
        for kind in [DefKind::Build, DefKind::Run, DefKind::Suite] {
            fs::create_dir_all(dir.path().join(kind.dirname())).unwrap();
        }
        for (kind, name, body) in files {
            fs::write(dir.path().join(kind.dirname()).join(name), body).unwrap();
        }
        let store = DefStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn resolves_single_inheritance() {
        let (_d, store) = store_with(&[
            (DefKind::Run, "base", "a: 1\nb: 2\n"),
            (DefKind::Run, "child", "extends: base\nb: 3\n"),
        ]);
        let merged = store.resolve(DefKind::Run, "child").unwrap();
        assert_eq!(merged["a"], DefValue::Int(1));
        assert_eq!(merged["b"], DefValue::Int(3));
        assert!(!merged.contains_key("extends"));
    }

    #[test]
    fn rejects_cycle_before_merging() {
        let (_d, store) = store_with(&[
            (DefKind::Run, "a", "extends: b\n"),
            (DefKind::Run, "b", "extends: a\n"),
        ]);
        let err = store.resolve(DefKind::Run, "a").unwrap_err();
        assert!(matches!(err, ConfigError::Cycle { .. }), "{err}");
    }

    #[test]
    fn rejects_missing_ancestor() {
        let (_d, store) = store_with(&[(DefKind::Run, "a", "extends: ghost\n")]);
        let err = store.resolve(DefKind::Run, "a").unwrap_err();
        assert!(matches!(err, ConfigError::MissingAncestor { .. }), "{err}");
    }

    #[test]
    fn rejects_malformed_yaml() {
        let (_d, store) = store_with(&[(DefKind::Run, "bad", "a: [unclosed\n")]);
        let err = store.resolve(DefKind::Run, "bad").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn ancestry_most_specific_first() {
        let (_d, store) = store_with(&[
            (DefKind::Run, "gran", "a: 1\n"),
            (DefKind::Run, "parent", "extends: gran\n"),
            (DefKind::Run, "child", "extends: parent\n"),
        ]);
        let chain = store.ancestry(DefKind::Run, "child").unwrap();
        assert_eq!(chain, vec!["child", "parent", "gran"]);
    }

    #[test]
    fn run_def_views_typed_keys() {
        let (_d, store) = store_with(&[(
            DefKind::Run,
            "r1",
            "build: b1\nbaseline: base1\nrequire: [r0]\n",
        )]);
        let def = store.resolve_run("r1", &BTreeMap::new()).unwrap();
        assert_eq!(def.build.as_deref(), Some("b1"));
        assert_eq!(def.baseline, "base1");
        assert_eq!(def.require, vec!["r0"]);
        assert_eq!(def.profile, "shell");
        assert!(def.baseline_enabled());
    }

    #[test]
    fn suite_splits_groups_and_settings() {
        let (_d, store) = store_with(&[(
            DefKind::Suite,
            "s1",
            "continue: true\ngroup_a: [r1, r2]\ngroup_b:\n  runs: [r3]\n  sleep: 0\n",
        )]);
        let suite = store.resolve_suite("s1").unwrap();
        assert!(suite.settings.continue_on_failure);
        assert_eq!(suite.groups.len(), 2);
        let b = suite.groups.iter().find(|g| g.name == "group_b").unwrap();
        assert_eq!(b.runs, vec!["r3"]);
        assert_eq!(b.overrides["sleep"], DefValue::Int(0));
        assert_eq!(suite.scheduled_runs(), vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn suite_rejects_duplicate_run_in_group() {
        let (_d, store) = store_with(&[(DefKind::Suite, "s1", "g: [r1, r1]\n")]);
        let err = store.resolve_suite("s1").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRun { .. }), "{err}");
    }
}
