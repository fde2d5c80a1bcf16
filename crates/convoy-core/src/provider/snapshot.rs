//! Before/after file snapshots for change detection on a shared filesystem.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

use crate::state::{FileAction, FileChange};

/// Kernel and version-control directories, always skipped.
const ALWAYS_EXCLUDED: &[&str] = &[".git", ".convoy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Modification stamps of every file under a root, keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct FileSnapshot {
    files: BTreeMap<String, Stamp>,
}

impl FileSnapshot {
    /// Walk `root`, skipping excluded directory names at any depth.
    pub fn capture(root: &Path, excludes: &[String]) -> Self {
        let is_excluded = |entry: &DirEntry| {
            entry.file_type().is_dir() && {
                let name = entry.file_name().to_string_lossy();
                ALWAYS_EXCLUDED.contains(&name.as_ref()) || excludes.iter().any(|e| e == name.as_ref())
            }
        };

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| !is_excluded(entry))
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            files.insert(
                relative.to_string_lossy().replace('\\', "/"),
                Stamp {
                    modified: meta.modified().ok(),
                    len: meta.len(),
                },
            );
        }

        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Changes from `self` (before) to `after`, sorted by path.
    pub fn diff(&self, after: &FileSnapshot) -> Vec<FileChange> {
        let mut changes = Vec::new();

        for (path, stamp) in &after.files {
            match self.files.get(path) {
                None => changes.push(FileChange::new(path.clone(), FileAction::Created, 0)),
                Some(before) if before != stamp => {
                    changes.push(FileChange::new(path.clone(), FileAction::Modified, 0))
                }
                Some(_) => {}
            }
        }
        for path in self.files.keys() {
            if !after.files.contains_key(path) {
                changes.push(FileChange::new(path.clone(), FileAction::Deleted, 0));
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }
}
