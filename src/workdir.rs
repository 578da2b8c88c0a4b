//! On-disk layout for one invocation: `builds/<name>/`,
//! `runs/<name>.<invocation>/`, staged data, and `log.<invocation>`.

use std::path::{Path, PathBuf};

/// Paths under the output root for one invocation.
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
    invocation: String,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>, invocation: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            invocation: invocation.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn invocation(&self) -> &str {
        &self.invocation
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    pub fn build_dir(&self, name: &str) -> PathBuf {
        self.builds_dir().join(name)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.runs_dir().join(format!("{name}.{}", self.invocation))
    }

    /// Recreates the builds directory, unless retention is configured.
    pub fn init_builds(&self, retain: bool) -> std::io::Result<()> {
        let dir = self.builds_dir();
        if retain {
            std::fs::create_dir_all(&dir)?;
            return Ok(());
        }
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)
    }

    pub fn ensure_runs_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.runs_dir())
    }

    /// Removes everything an invocation creates. Idempotent: items that
    /// do not exist are skipped, and nothing is an error twice.
    /// Returns the names of items actually deleted.
    pub fn clean(&self) -> std::io::Result<Vec<String>> {
        let mut items = vec![
            self.root.join("builds"),
            self.root.join("runs"),
            self.root.join("data"),
        ];
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.filter_map(|e| e.ok()) {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("log.")
                {
                    items.push(entry.path());
                }
            }
        }
        items.sort();
        let mut deleted = Vec::new();
        for item in items {
            if item.is_dir() {
                std::fs::remove_dir_all(&item)?;
            } else if item.exists() {
                std::fs::remove_file(&item)?;
            } else {
                continue;
            }
            deleted.push(item.file_name().unwrap_or_default().to_string_lossy().into_owned());
        }
        Ok(deleted)
    }
}

/// Collects every file under `root`, returned as paths relative to it,
/// sorted. Used for baseline trees and default output listing.
pub fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn visit(dir: &Path, base: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit(&path, base, out)?;
            } else if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_path_buf());
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn clean_twice_is_a_noop_second_time() {
        let dir = TempDir::new().unwrap();
        let wd = Workdir::new(dir.path(), "1");
        std::fs::create_dir_all(wd.builds_dir().join("b1")).unwrap();
        std::fs::create_dir_all(wd.runs_dir()).unwrap();
        std::fs::write(dir.path().join("log.1"), "x").unwrap();

        let first = wd.clean().unwrap();
        assert_eq!(first, vec!["builds", "log.1", "runs"]);
        let second = wd.clean().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn init_builds_clears_unless_retained() {
        let dir = TempDir::new().unwrap();
        let wd = Workdir::new(dir.path(), "1");
        let sentinel = wd.build_dir("b1").join("sentinel");
        std::fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        std::fs::write(&sentinel, "keep me").unwrap();

        wd.init_builds(true).unwrap();
        assert!(sentinel.exists());

        wd.init_builds(false).unwrap();
        assert!(!sentinel.exists());
        assert!(wd.builds_dir().is_dir());
    }

    #[test]
    fn walk_files_is_relative_and_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/out2"), "").unwrap();
        std::fs::write(dir.path().join("out1"), "").unwrap();
        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("out1"), PathBuf::from("sub/out2")]);
    }
}
