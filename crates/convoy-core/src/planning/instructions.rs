//! Worker instructions rendered as markdown.

use super::ProjectContext;
use crate::state::{FileAction, FileChange, TestResult, WorkItem, WorkerType};

/// Role-specific input for an instruction.
#[derive(Debug, Clone, Copy)]
pub enum RoleInput<'a> {
    /// The item's own worker
    Work,
    /// Verify the changes of a code-producing item
    Test { files: &'a [FileChange] },
    /// Review the changes of a code-producing item
    Review {
        files: &'a [FileChange],
        test: Option<&'a TestResult>,
    },
}

/// Turns a work item into the text a worker reads.
pub trait InstructionRenderer: Send + Sync {
    fn render(&self, item: &WorkItem, context: &ProjectContext, role: RoleInput<'_>) -> String;
}

/// Default renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownInstructions;

impl InstructionRenderer for MarkdownInstructions {
    fn render(&self, item: &WorkItem, context: &ProjectContext, role: RoleInput<'_>) -> String {
        match role {
            RoleInput::Work => render_work(item, context),
            RoleInput::Test { files } => render_test(item, context, files),
            RoleInput::Review { files, test } => render_review(item, context, files, test),
        }
    }
}

fn render_work(item: &WorkItem, context: &ProjectContext) -> String {
    let mut out = format!("# Work Item: {}\n\n", item.id);

    out.push_str("## Objective\n\n");
    out.push_str(&item.description);
    out.push_str("\n\n");

    if !item.input_context.trim().is_empty() {
        out.push_str("## Additional Context\n\n");
        out.push_str(&item.input_context);
        out.push_str("\n\n");
    }

    push_project_context(&mut out, context);

    out.push_str("## Success Criteria\n\n");
    if item.success_criteria.trim().is_empty() {
        out.push_str("The objective is met and the project still builds.\n\n");
    } else {
        out.push_str(&item.success_criteria);
        out.push_str("\n\n");
    }

    if !item.target_files.is_empty() {
        out.push_str("## File Ownership\n\n");
        out.push_str("Create or modify only these files:\n\n");
        for file in &item.target_files {
            out.push_str(&format!("- `{}`\n", file));
        }
        out.push_str("\nOther items own every other file. Reading them is fine.\n\n");
    }

    out.push_str("## Constraints\n\n");
    out.push_str("- Work under `/workspace`, the project root.\n");
    out.push_str("- Never write inside `.convoy/`.\n");
    match item.worker_type {
        WorkerType::Implementer | WorkerType::Refactorer => {
            out.push_str("- Write the code. An attempt that changes no files fails.\n");
            out.push_str("- Leave tests to the tester.\n");
        }
        WorkerType::Researcher => {
            out.push_str("- Read only. Report findings without modifying files.\n");
        }
        WorkerType::Deployer => {
            out.push_str("- Print `DEPLOYMENT FAILED` if the deployment does not succeed.\n");
        }
        WorkerType::Tester | WorkerType::Reviewer => {}
    }
    out.push_str("- Fix errors you hit before reporting failure.\n");

    out
}

fn render_test(item: &WorkItem, context: &ProjectContext, files: &[FileChange]) -> String {
    let mut out = format!("# Test Run for: {}\n\n", item.id);

    out.push_str("## Objective\n\n");
    out.push_str(&format!("Run the tests to verify the changes made by {}.\n\n", item.id));

    out.push_str("## What Was Changed\n\n");
    out.push_str(&item.description);
    out.push_str("\n\n");

    push_files(&mut out, files);
    push_project_context(&mut out, context);

    out.push_str("## Test Instructions\n\n");
    out.push_str("- Run every existing test with the project's build tool.\n");
    out.push_str("- Do not change any code.\n");
    out.push_str("- Include failure messages when tests fail.\n\n");

    out.push_str("## Output Format\n\n");
    out.push_str("Tests run: X, Failures: Y, Errors: Z\n");

    out
}

fn render_review(
    item: &WorkItem,
    context: &ProjectContext,
    files: &[FileChange],
    test: Option<&TestResult>,
) -> String {
    let mut out = format!("# Code Review for: {}\n\n", item.id);

    out.push_str("## Objective\n\n");
    out.push_str(&format!("Review the changes made by {}.\n\n", item.id));

    out.push_str("## What Was Changed\n\n");
    out.push_str(&item.description);
    out.push_str("\n\n");

    push_files(&mut out, files);

    out.push_str("## Test Results\n\n");
    match test {
        Some(test) => {
            out.push_str(&format!("- Passed: {}\n", test.passed));
            out.push_str(&format!(
                "- Total: {}, Failed: {}\n",
                test.total_tests, test.failed_tests
            ));
            out.push_str(&format!("- Duration: {}ms\n\n", test.duration_ms));
        }
        None => out.push_str("- No test results available\n\n"),
    }

    push_project_context(&mut out, context);

    out.push_str("## Review Scope\n\n");
    out.push_str("Judge only whether this item met its own objective. ");
    out.push_str("Other items own tests, deployment, and unrelated features.\n\n");
    out.push_str("- Does the code do what the description asks?\n");
    out.push_str("- Is every file syntactically complete?\n");
    out.push_str("- Are there logic bugs in this change?\n");
    out.push_str("- Score 4 or lower when core functionality is missing or broken.\n\n");

    out.push_str("## Output Format\n\n");
    out.push_str("Score: X/10\n");
    out.push_str("Approved: yes/no\n");
    out.push_str("Summary: one paragraph\n");
    out.push_str("Issues:\n- at most three\n");
    out.push_str("Suggestions:\n- at most three\n");

    out
}

fn push_project_context(out: &mut String, context: &ProjectContext) {
    if context.file_count == 0 && context.language.is_none() {
        return;
    }

    out.push_str("## Project Context\n\n");
    out.push_str(&format!(
        "- **Language:** {}\n",
        context.language.as_deref().unwrap_or("unknown")
    ));
    out.push_str(&format!("- **Files:** {}\n", context.file_count));

    if !context.file_tree.is_empty() {
        out.push_str("\n```\n");
        out.push_str(&context.file_tree.join("\n"));
        if context.truncated() > 0 {
            out.push_str(&format!("\n... and {} more files", context.truncated()));
        }
        out.push_str("\n```\n");
    }
    out.push('\n');
}

fn push_files(out: &mut String, files: &[FileChange]) {
    out.push_str("## Files Modified\n\n");
    if files.is_empty() {
        out.push_str("- none recorded\n\n");
        return;
    }
    for file in files {
        let action = match file.action {
            FileAction::Created => "created",
            FileAction::Modified => "modified",
            FileAction::Deleted => "deleted",
        };
        out.push_str(&format!("- `{}` ({})\n", file.path, action));
    }
    out.push('\n');
}
