//! Pairwise and group output comparison, plus baseline trees.
//!
//! The first file set in a group is the reference; every other set is
//! compared to it in turn. File lists must match by relative suffix
//! before any content is compared; a list mismatch fails the pair
//! outright. Content mismatches are all logged before the group's
//! verdict is decided, so a failing group still reports every differing
//! file.

use std::path::Path;

use crate::error::{DriverError, DriverResult};
use crate::ledger::{OutFile, RunResult};
use crate::logbook::TaskLog;
use crate::profile::FileComparator;
use crate::workdir::walk_files;

/// A named set of output files entering a comparison. A set may come
/// from a run or from a baseline tree.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub name: String,
    pub files: Vec<OutFile>,
}

impl FileSet {
    pub fn from_run(result: &RunResult) -> Self {
        Self {
            name: result.name.clone(),
            files: result.files.clone(),
        }
    }

    /// Reads a baseline subdirectory as a file set; every file under it
    /// participates.
    pub fn from_baseline(name: &str, dir: &Path) -> DriverResult<Self> {
        let files = walk_files(dir)?
            .into_iter()
            .map(|rel| OutFile::new(dir, rel))
            .collect();
        Ok(Self {
            name: name.to_string(),
            files,
        })
    }

    /// Files sorted by relative suffix, the comparison order.
    fn sorted(&self) -> Vec<OutFile> {
        let mut files = self.files.clone();
        files.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        files
    }
}

/// Compares every set in `sets` against the first. Returns `Ok(true)` if
/// all pairs matched, `Ok(false)` if a mismatch was recorded in continue
/// mode, and an error as soon as a pair fails otherwise.
pub async fn compare_group(
    sets: &[FileSet],
    comparator: &dyn FileComparator,
    continue_on_failure: bool,
    log: &mut TaskLog,
) -> DriverResult<bool> {
    let Some((reference, others)) = sets.split_first() else {
        return Ok(true);
    };
    let ref_files = reference.sorted();
    let mut group_ok = true;

    for peer in others {
        log.debug(format!("Comparing {} to {}", reference.name, peer.name));
        let tag = format!("({} vs {})", reference.name, peer.name);
        let peer_files = peer.sorted();

        let ref_suffixes: Vec<_> = ref_files.iter().map(|f| f.suffix.clone()).collect();
        let peer_suffixes: Vec<_> = peer_files.iter().map(|f| f.suffix.clone()).collect();
        if ref_suffixes != peer_suffixes {
            log.debug(format!("File list matching FAILED {tag}, lists are:"));
            log.debug(format!("{} files: {}", reference.name, join_suffixes(&ref_files)));
            log.debug(format!("{} files: {}", peer.name, join_suffixes(&peer_files)));
            if !continue_on_failure {
                return Err(DriverError::FileListMismatch {
                    left: reference.name.clone(),
                    right: peer.name.clone(),
                });
            }
            group_ok = false;
            continue;
        }

        let mut pair_ok = true;
        for (f1, f2) in ref_files.iter().zip(peer_files.iter()) {
            let suffix = f1.suffix.display();
            if comparator.compare(&f1.full_path(), &f2.full_path()).await? {
                log.debug(format!("Comparing {suffix}: OK {tag}"));
            } else {
                // keep comparing the remaining pairs for diagnostics
                log.debug(format!("Comparing {suffix}: FAILED {tag}"));
                pair_ok = false;
            }
        }
        if pair_ok {
            log.debug(format!("Comparing {} to {}: OK", reference.name, peer.name));
        } else {
            if !continue_on_failure {
                return Err(DriverError::Comparison {
                    left: reference.name.clone(),
                    right: peer.name.clone(),
                });
            }
            group_ok = false;
        }
    }
    log.flush();
    Ok(group_ok)
}

fn join_suffixes(files: &[OutFile]) -> String {
    files
        .iter()
        .map(|f| f.suffix.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Copies a baseline source's output files under
/// `<root>/<baseline>/<suffix>`.
pub fn write_baseline(root: &Path, baseline: &str, source: &RunResult) -> DriverResult<()> {
    let dst = root.join(baseline);
    for file in &source.files {
        let target = dst.join(&file.suffix);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(file.full_path(), &target)?;
    }
    Ok(())
}
