//! Project context scan fed to the planner and the instruction renderer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

/// Entries kept in `file_tree`.
pub const MAX_FILE_TREE_ENTRIES: usize = 200;

const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".convoy",
    "node_modules",
    "target",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
];

/// Manifest file to language, first match wins.
const MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("tsconfig.json", "typescript"),
    ("package.json", "javascript"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("build.gradle.kts", "kotlin"),
    ("go.mod", "go"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("setup.py", "python"),
    ("Gemfile", "ruby"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub root: PathBuf,
    pub file_count: usize,
    /// Relative paths, sorted, at most `MAX_FILE_TREE_ENTRIES`
    pub file_tree: Vec<String>,
    pub language: Option<String>,
}

impl ProjectContext {
    /// Walk the project, skipping build output and kernel directories.
    pub fn scan(root: &Path) -> Self {
        let skip = |entry: &DirEntry| {
            entry.depth() > 0
                && entry.file_type().is_dir()
                && SKIPPED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref())
        };

        let mut files: Vec<String> = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| !skip(entry))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();

        let file_count = files.len();
        files.truncate(MAX_FILE_TREE_ENTRIES);

        let context = Self {
            root: root.to_path_buf(),
            file_count,
            file_tree: files,
            language: detect_language(root),
        };
        tracing::debug!(
            root = %root.display(),
            files = context.file_count,
            language = context.language.as_deref().unwrap_or("unknown"),
            "Scanned project"
        );
        context
    }

    /// Files left out of `file_tree`.
    pub fn truncated(&self) -> usize {
        self.file_count.saturating_sub(self.file_tree.len())
    }
}

/// Language of the project root, by manifest file.
pub fn detect_language(root: &Path) -> Option<String> {
    MANIFESTS
        .iter()
        .find(|(manifest, _)| root.join(manifest).is_file())
        .map(|(_, language)| language.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_skips_build_output_and_detects_language() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "").unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::write(root.join("target/debug/out"), "").unwrap();
        std::fs::create_dir_all(root.join(".convoy")).unwrap();
        std::fs::write(root.join(".convoy/events.jsonl"), "").unwrap();

        let context = ProjectContext::scan(root);
        assert_eq!(context.file_tree, vec!["Cargo.toml", "src/lib.rs"]);
        assert_eq!(context.file_count, 2);
        assert_eq!(context.language.as_deref(), Some("rust"));
        assert_eq!(context.truncated(), 0);
    }
}
