//! Agent prompt rendering.
//!
//! The prompt is plain text written to the run's artifact directory and
//! handed to the agent as `{{PROMPT_FILE}}`. Templates use the same
//! `{{TOKEN}}` syntax as agent command lines.

use std::collections::BTreeMap;

use crate::paths::render_template;
use crate::task::{TaskSpec, WorkerType};

/// Used when no `prompt_template` is configured.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
You are working on task {{TASK_ID}} in repository {{REPO}}.

## Task
{{DESCRIPTION}}

## Target files
{{TARGET_FILES}}

## Context files
{{CONTEXT_FILES}}

Make the change directly in the working tree. Do not commit.
";

fn bullet_list(files: &[String]) -> String {
    if files.is_empty() {
        return "(none)".to_string();
    }
    files
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the prompt for one run.
pub fn render_prompt(
    template: Option<&str>,
    task: &TaskSpec,
    worker: WorkerType,
    context_files: &[String],
) -> String {
    let mut tokens = BTreeMap::new();
    tokens.insert("TASK_ID", task.id.clone());
    tokens.insert("REPO", task.repo.clone());
    tokens.insert("WORKER_TYPE", worker.as_str().to_string());
    tokens.insert("COMPLEXITY", task.complexity.as_str().to_string());
    tokens.insert("DESCRIPTION", task.description.trim().to_string());
    tokens.insert("TARGET_FILES", bullet_list(&task.target_files));
    tokens.insert("CONTEXT_FILES", bullet_list(context_files));
    render_template(template.unwrap_or(DEFAULT_PROMPT_TEMPLATE), &tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::parse_catalog;

    fn task() -> TaskSpec {
        parse_catalog(
            "- {id: t-7, repo: widgets, complexity: T3, description: '  Add retries.  ', target_files: [src/net.ts]}",
        )
        .unwrap()
        .remove(0)
    }

    #[test]
    fn default_template_lists_targets_and_context() {
        let prompt = render_prompt(
            None,
            &task(),
            WorkerType::Treatment,
            &["README.md".to_string(), "src/net.ts".to_string()],
        );
        assert!(prompt.contains("task t-7 in repository widgets"));
        assert!(prompt.contains("Add retries."));
        assert!(prompt.contains("- src/net.ts"));
        assert!(prompt.contains("- README.md"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn empty_context_renders_none_marker() {
        let prompt = render_prompt(None, &task(), WorkerType::Control, &[]);
        assert!(prompt.contains("## Context files\n(none)"));
    }

    #[test]
    fn custom_template_is_honored() {
        let prompt = render_prompt(
            Some("{{WORKER_TYPE}}/{{COMPLEXITY}}: {{DESCRIPTION}}"),
            &task(),
            WorkerType::Control,
            &[],
        );
        assert_eq!(prompt, "control/T3: Add retries.");
    }
}
