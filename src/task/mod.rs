//! Task catalog: the immutable benchmark items an experiment runs.
//!
//! Catalog files are YAML (JSON is accepted too, being a YAML subset), either
//! a bare list of tasks or a `{tasks: [...]}` document. Each raw entry is
//! validated into a [`TaskSpec`] at load time, so mode-specific fields are
//! guaranteed present before any workspace is touched.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::normalize_rel_path;

/// Task complexity tier, least to most complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Complexity {
    T1,
    T2,
    T3,
    T4,
    T5,
}

impl Complexity {
    pub const ALL: [Complexity; 5] = [Self::T1, Self::T2, Self::T3, Self::T4, Self::T5];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::T1 => "T1",
            Self::T2 => "T2",
            Self::T3 => "T3",
            Self::T4 => "T4",
            Self::T5 => "T5",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Experiment arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// No extra context.
    Control,
    /// Context-resolver-augmented.
    Treatment,
}

impl WorkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Treatment => "treatment",
        }
    }
}

/// Drop repeated arms, keeping first-seen order.
pub fn distinct_workers(workers: &[WorkerType]) -> Vec<WorkerType> {
    let mut seen = Vec::with_capacity(workers.len());
    for &worker in workers {
        if !seen.contains(&worker) {
            seen.push(worker);
        }
    }
    seen
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control" => Ok(Self::Control),
            "treatment" => Ok(Self::Treatment),
            other => anyhow::bail!("unknown worker type '{other}' (expected control or treatment)"),
        }
    }
}

/// A literal search/replace edit applied to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub file: String,
    pub search: String,
    pub replace: String,
}

/// Agent command line, either one template for both arms or per-arm variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentCommandTemplate {
    Single(String),
    Variants {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        control: Option<String>,
        #[serde(default)]
        treatment: Option<String>,
    },
}

impl AgentCommandTemplate {
    /// The template for `worker`: the arm-specific variant if set, else the default.
    pub fn for_worker(&self, worker: WorkerType) -> Option<&str> {
        match self {
            Self::Single(cmd) => Some(cmd.as_str()),
            Self::Variants {
                default,
                control,
                treatment,
            } => {
                let specific = match worker {
                    WorkerType::Control => control,
                    WorkerType::Treatment => treatment,
                };
                specific
                    .as_deref()
                    .or(default.as_deref())
                    .filter(|s| !s.trim().is_empty())
            }
        }
    }
}

/// How a task's change gets made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TaskMode {
    DeterministicEdit {
        edits: Vec<FileEdit>,
    },
    AgentCommand {
        /// Per-task override of the experiment-level agent command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<AgentCommandTemplate>,
        /// Edits applied when no agent command is available and fallback is allowed.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fallback_edits: Vec<FileEdit>,
    },
}

impl TaskMode {
    pub fn is_agent(&self) -> bool {
        matches!(self, Self::AgentCommand { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::DeterministicEdit { .. } => "deterministic_edit",
            Self::AgentCommand { .. } => "agent_command",
        }
    }
}

/// Ordered command lists per verification phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSpec {
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub baseline: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub typecheck: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    /// The baseline must fail before the change is applied.
    #[serde(default)]
    pub require_baseline_failure: bool,
}

impl VerificationSpec {
    /// Commands across the post-change phases (tests, typecheck, build).
    pub fn verification_command_count(&self) -> usize {
        self.tests.len() + self.typecheck.len() + self.build.len()
    }
}

/// One benchmark item, validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub repo: String,
    pub complexity: Complexity,
    pub description: String,
    pub context_level: u8,
    pub target_files: Vec<String>,
    #[serde(flatten)]
    pub mode: TaskMode,
    pub verification: VerificationSpec,
    /// Treatment runs fail when the resolver yields no usable context.
    pub require_treatment_context: bool,
    /// The run fails unless at least one target file changed.
    pub require_target_file_modified: bool,
}

/// Why a catalog entry was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("task #{index}: id must not be empty")]
    EmptyId { index: usize },
    #[error("task '{id}': repo must not be empty")]
    EmptyRepo { id: String },
    #[error("duplicate task id '{id}'")]
    DuplicateId { id: String },
    #[error("task '{id}': context_level {level} is outside 0..=5")]
    ContextLevelOutOfRange { id: String, level: u8 },
    #[error("task '{id}': unknown mode '{mode}' (expected deterministic_edit or agent_command)")]
    UnknownMode { id: String, mode: String },
    #[error("task '{id}': deterministic_edit mode requires at least one edit")]
    MissingEdits { id: String },
    #[error("task '{id}': edit for '{file}' has an empty search string")]
    EmptySearch { id: String, file: String },
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    repo: String,
    complexity: Complexity,
    #[serde(default)]
    description: String,
    #[serde(default)]
    context_level: u8,
    #[serde(default)]
    target_files: Vec<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    edits: Vec<FileEdit>,
    #[serde(default)]
    agent_command: Option<AgentCommandTemplate>,
    #[serde(default)]
    verification: VerificationSpec,
    #[serde(default = "default_true")]
    require_treatment_context: bool,
    #[serde(default)]
    require_target_file_modified: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCatalog {
    List(Vec<RawTask>),
    Document { tasks: Vec<RawTask> },
}

fn default_true() -> bool {
    true
}

fn validate_edits(id: &str, edits: Vec<FileEdit>) -> Result<Vec<FileEdit>, CatalogError> {
    edits
        .into_iter()
        .map(|edit| {
            if edit.search.is_empty() {
                return Err(CatalogError::EmptySearch {
                    id: id.to_string(),
                    file: edit.file,
                });
            }
            Ok(FileEdit {
                file: normalize_rel_path(&edit.file),
                ..edit
            })
        })
        .collect()
}

impl RawTask {
    fn validate(self, index: usize) -> Result<TaskSpec, CatalogError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(CatalogError::EmptyId { index });
        }
        if self.repo.trim().is_empty() {
            return Err(CatalogError::EmptyRepo { id });
        }
        if self.context_level > 5 {
            return Err(CatalogError::ContextLevelOutOfRange {
                id,
                level: self.context_level,
            });
        }

        // Mode defaults to deterministic when edits are present, agent otherwise.
        let mode_name = self.mode.unwrap_or_else(|| {
            if self.edits.is_empty() {
                "agent_command".to_string()
            } else {
                "deterministic_edit".to_string()
            }
        });
        let mode = match mode_name.as_str() {
            "deterministic_edit" => {
                if self.edits.is_empty() {
                    return Err(CatalogError::MissingEdits { id });
                }
                TaskMode::DeterministicEdit {
                    edits: validate_edits(&id, self.edits)?,
                }
            }
            "agent_command" => TaskMode::AgentCommand {
                command: self.agent_command,
                fallback_edits: validate_edits(&id, self.edits)?,
            },
            other => {
                return Err(CatalogError::UnknownMode {
                    id,
                    mode: other.to_string(),
                });
            }
        };

        Ok(TaskSpec {
            id,
            repo: self.repo.trim().to_string(),
            complexity: self.complexity,
            description: self.description,
            context_level: self.context_level,
            target_files: self
                .target_files
                .iter()
                .map(|f| normalize_rel_path(f))
                .filter(|f| !f.is_empty())
                .collect(),
            mode,
            verification: self.verification,
            require_treatment_context: self.require_treatment_context,
            require_target_file_modified: self.require_target_file_modified,
        })
    }
}

/// Parse and validate a catalog from its string content.
pub fn parse_catalog(content: &str) -> Result<Vec<TaskSpec>> {
    let raw: RawCatalog = serde_yaml::from_str(content).context("failed to parse task catalog")?;
    let raw_tasks = match raw {
        RawCatalog::List(tasks) => tasks,
        RawCatalog::Document { tasks } => tasks,
    };

    let mut seen = BTreeSet::new();
    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (index, raw) in raw_tasks.into_iter().enumerate() {
        let task = raw.validate(index)?;
        if !seen.insert(task.id.clone()) {
            return Err(CatalogError::DuplicateId { id: task.id }.into());
        }
        tasks.push(task);
    }
    Ok(tasks)
}

/// Load a catalog file.
pub fn load_catalog(path: &Path) -> Result<Vec<TaskSpec>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task catalog: {}", path.display()))?;
    let tasks = parse_catalog(&contents)
        .with_context(|| format!("invalid task catalog: {}", path.display()))?;
    tracing::debug!(path = %path.display(), tasks = tasks.len(), "loaded task catalog");
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
tasks:
  - id: fix-format
    repo: widgets
    complexity: T1
    description: Fix the number formatter.
    context_level: 5
    target_files: ["./src/format.ts"]
    edits:
      - file: src/format.ts
        search: "toFixed(1)"
        replace: "toFixed(2)"
    verification:
      tests: ["npm test"]
  - id: add-retry
    repo: widgets
    complexity: T4
    mode: agent_command
    target_files: [src/net.ts]
    agent_command:
      default: "agent run {{PROMPT_FILE}}"
      treatment: "agent run --context {{CONTEXT_FILE}} {{PROMPT_FILE}}"
    require_target_file_modified: true
    verification:
      baseline: ["npm test -- net"]
      require_baseline_failure: true
      tests: ["npm test -- net"]
      build: ["npm run build"]
"#;

    #[test]
    fn repeated_workers_collapse_in_order() {
        use WorkerType::*;
        assert_eq!(
            distinct_workers(&[Treatment, Control, Treatment, Control]),
            vec![Treatment, Control]
        );
        assert!(distinct_workers(&[]).is_empty());
    }

    #[test]
    fn parse_document_catalog() {
        let tasks = parse_catalog(CATALOG).unwrap();
        assert_eq!(tasks.len(), 2);

        let first = &tasks[0];
        assert_eq!(first.id, "fix-format");
        assert_eq!(first.complexity, Complexity::T1);
        assert_eq!(first.target_files, vec!["src/format.ts"]);
        assert!(first.require_treatment_context);
        assert!(!first.require_target_file_modified);
        match &first.mode {
            TaskMode::DeterministicEdit { edits } => {
                assert_eq!(edits.len(), 1);
                assert_eq!(edits[0].replace, "toFixed(2)");
            }
            other => panic!("expected deterministic edit, got {other:?}"),
        }

        let second = &tasks[1];
        assert!(second.mode.is_agent());
        assert!(second.verification.require_baseline_failure);
        assert_eq!(second.verification.verification_command_count(), 2);
    }

    #[test]
    fn parse_bare_list_json_catalog() {
        let json = r#"[{"id": "a", "repo": "r", "complexity": "T3", "edits": [{"file": "x.rs", "search": "a", "replace": "b"}]}]"#;
        let tasks = parse_catalog(json).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].mode.label(), "deterministic_edit");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let yaml = r#"
- {id: a, repo: r, complexity: T1}
- {id: a, repo: r, complexity: T2}
"#;
        let err = parse_catalog(yaml).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::DuplicateId { id: "a".into() })
        );
    }

    #[test]
    fn rejects_out_of_range_context_level() {
        let yaml = "- {id: a, repo: r, complexity: T1, context_level: 6}";
        let err = parse_catalog(yaml).unwrap_err();
        assert!(err.to_string().contains("outside 0..=5"));
    }

    #[test]
    fn rejects_deterministic_mode_without_edits() {
        let yaml = "- {id: a, repo: r, complexity: T1, mode: deterministic_edit}";
        let err = parse_catalog(yaml).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CatalogError>(),
            Some(&CatalogError::MissingEdits { id: "a".into() })
        );
    }

    #[test]
    fn rejects_empty_search_text() {
        let yaml = r#"- {id: a, repo: r, complexity: T1, edits: [{file: x, search: "", replace: y}]}"#;
        let err = parse_catalog(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::EmptySearch { .. })
        ));
    }

    #[test]
    fn rejects_unknown_mode() {
        let yaml = "- {id: a, repo: r, complexity: T1, mode: magic}";
        let err = parse_catalog(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown mode 'magic'"));
    }

    #[test]
    fn agent_template_prefers_worker_variant() {
        let template = AgentCommandTemplate::Variants {
            default: Some("base".into()),
            control: None,
            treatment: Some("with-context".into()),
        };
        assert_eq!(template.for_worker(WorkerType::Control), Some("base"));
        assert_eq!(template.for_worker(WorkerType::Treatment), Some("with-context"));

        let single = AgentCommandTemplate::Single("same".into());
        assert_eq!(single.for_worker(WorkerType::Treatment), Some("same"));

        let empty = AgentCommandTemplate::Variants {
            default: None,
            control: None,
            treatment: None,
        };
        assert_eq!(empty.for_worker(WorkerType::Control), None);
    }

    #[test]
    fn task_spec_serializes_mode_tag() {
        let tasks = parse_catalog(CATALOG).unwrap();
        let json = serde_json::to_value(&tasks[1]).unwrap();
        assert_eq!(json["mode"], "agent_command");
        assert_eq!(json["complexity"], "T4");
    }

    #[test]
    fn worker_type_parses_from_str() {
        assert_eq!("control".parse::<WorkerType>().unwrap(), WorkerType::Control);
        assert!("both".parse::<WorkerType>().is_err());
    }

    #[test]
    fn load_catalog_reports_path_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.yaml");
        std::fs::write(&path, "- {id: '', repo: r, complexity: T1}").unwrap();
        let err = load_catalog(&path).unwrap_err();
        assert!(format!("{err:#}").contains("tasks.yaml"));
        assert!(format!("{err:#}").contains("id must not be empty"));
    }
}
