//! Diff-stat parsing into file changes.

use std::sync::LazyLock;

use regex::Regex;

use crate::state::{FileAction, FileChange};

static STAT_LINE: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"^\s*(.+?)\s*\|\s*(\d+|Bin\b.*?)\s*[+\-]*\s*$") {
        Ok(regex) => regex,
        Err(err) => panic!("Diff stat regex is invalid: {err}"),
    });

static SUMMARY_LINE: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"^\s*\d+\s+files?\s+changed") {
        Ok(regex) => regex,
        Err(err) => panic!("Diff summary regex is invalid: {err}"),
    });

static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"\s*\((new|gone|mode)[^)]*\)\s*$") {
        Ok(regex) => regex,
        Err(err) => panic!("Diff annotation regex is invalid: {err}"),
    });

/// Parse `git diff --compact-summary` style output.
///
/// `(new)` annotations map to created files, `(gone)` to deleted ones, and
/// everything else to modified. The trailing "N files changed" line is skipped.
pub fn parse_diff_stat(text: &str) -> Vec<FileChange> {
    text.lines()
        .filter(|line| !SUMMARY_LINE.is_match(line))
        .filter_map(parse_stat_line)
        .collect()
}

fn parse_stat_line(line: &str) -> Option<FileChange> {
    let caps = STAT_LINE.captures(line)?;
    let raw_path = caps.get(1)?.as_str();
    let lines_changed = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0);

    let (path, action) = match ANNOTATION.captures(raw_path) {
        Some(annotation) => {
            let action = match annotation.get(1).map(|m| m.as_str()) {
                Some("new") => FileAction::Created,
                Some("gone") => FileAction::Deleted,
                _ => FileAction::Modified,
            };
            (ANNOTATION.replace(raw_path, "").to_string(), action)
        }
        None => (raw_path.to_string(), FileAction::Modified),
    };

    if path.is_empty() {
        return None;
    }

    Some(FileChange::new(path, action, lines_changed))
}

/// Drop kernel-owned paths and worker scratch output.
pub fn is_meaningful_change(change: &FileChange) -> bool {
    let path = change.path.as_str();
    !(path.starts_with(".convoy/")
        || path.contains("/.convoy/")
        || path.ends_with(".log")
        || path.ends_with(".jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_plain_and_summary_yield_two_changes() {
        let text = " src/new_module.rs (new) | 42 ++++++++\n src/lib.rs              |  3 +-\n 2 files changed, 44 insertions(+), 1 deletion(-)\n";
        let changes = parse_diff_stat(text);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], FileChange::new("src/new_module.rs", FileAction::Created, 42));
        assert_eq!(changes[1], FileChange::new("src/lib.rs", FileAction::Modified, 3));
    }

    #[test]
    fn test_gone_and_mode_annotations() {
        let text = " old.txt (gone) | 7 -------\n run.sh (mode +x) | 0\n";
        let changes = parse_diff_stat(text);
        assert_eq!(changes[0], FileChange::new("old.txt", FileAction::Deleted, 7));
        assert_eq!(changes[1], FileChange::new("run.sh", FileAction::Modified, 0));
    }

    #[test]
    fn test_binary_lines_count_zero() {
        let changes = parse_diff_stat(" logo.png (new) | Bin 0 -> 1024 bytes\n");
        assert_eq!(changes, vec![FileChange::new("logo.png", FileAction::Created, 0)]);
    }

    #[test]
    fn test_scratch_paths_are_not_meaningful() {
        assert!(!is_meaningful_change(&FileChange::new(".convoy/instructions/A.md", FileAction::Created, 1)));
        assert!(!is_meaningful_change(&FileChange::new("worker.log", FileAction::Created, 1)));
        assert!(is_meaningful_change(&FileChange::new("src/a.rs", FileAction::Created, 1)));
    }
}
