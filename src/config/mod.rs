use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::CommandResolverFactory;
use crate::executor::{DEFAULT_WORKSPACE_EXCLUDE, ExecutorOptions};
use crate::gate::GateThresholds;
use crate::paths::EnvMap;
use crate::selection::{SelectionMode, SelectionOptions};
use crate::stats::SignificanceOptions;
use crate::task::{AgentCommandTemplate, WorkerType};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ab-harness";

#[derive(Debug, Deserialize)]
pub struct ExperimentSettings {
    #[serde(default = "default_worker_types")]
    pub worker_types: Vec<WorkerType>,
    #[serde(default)]
    pub max_tasks: Option<usize>,
    #[serde(default)]
    pub selection: SelectionMode,
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: f64,
    #[serde(default = "default_uncertain_share")]
    pub uncertain_share: f64,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_workspace_exclude")]
    pub workspace_exclude: Vec<String>,
}

fn default_worker_types() -> Vec<WorkerType> {
    vec![WorkerType::Control, WorkerType::Treatment]
}

fn default_stable_threshold() -> f64 {
    0.2
}

fn default_uncertain_share() -> f64 {
    0.75
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("artifacts")
}

fn default_workspace_exclude() -> Vec<String> {
    DEFAULT_WORKSPACE_EXCLUDE
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_command_timeout_ms() -> u64 {
    120_000
}

fn default_agent_timeout_ms() -> u64 {
    600_000
}

fn default_max_extra_context_files() -> usize {
    20
}

fn default_resolver_timeout_ms() -> u64 {
    60_000
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            worker_types: default_worker_types(),
            max_tasks: None,
            selection: SelectionMode::default(),
            stable_threshold: default_stable_threshold(),
            uncertain_share: default_uncertain_share(),
            artifact_dir: default_artifact_dir(),
            workspace_exclude: default_workspace_exclude(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_max_extra_context_files")]
    pub max_extra_context_files: usize,
    #[serde(default)]
    pub allow_edit_fallback: bool,
    /// `{{TOKEN}}` template for the agent prompt. Built-in template when unset.
    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            agent_timeout_ms: default_agent_timeout_ms(),
            max_extra_context_files: default_max_extra_context_files(),
            allow_edit_fallback: false,
            prompt_template: None,
        }
    }
}

/// Agent command used by agent-mode tasks that carry none of their own.
///
/// ```toml
/// [agent]
/// command = "my-agent --prompt {{PROMPT_FILE}}"
///
/// # or per arm
/// [agent.command]
/// default = "my-agent {{PROMPT_FILE}}"
/// treatment = "my-agent --context {{CONTEXT_FILE}} {{PROMPT_FILE}}"
/// ```
#[derive(Debug, Deserialize, Default)]
pub struct AgentSettings {
    #[serde(default)]
    pub command: Option<AgentCommandTemplate>,
}

/// Context resolution for treatment runs.
///
/// ```toml
/// [context]
/// resolver_command = "librarian query {{SOURCE_ROOT}} {{TASK_ID}}"
///
/// [context.level_overrides]
/// "2" = ["README.md", "docs/ARCHITECTURE.md"]
/// ```
#[derive(Debug, Deserialize)]
pub struct ContextSettings {
    #[serde(default)]
    pub resolver_command: Option<String>,
    #[serde(default = "default_resolver_timeout_ms")]
    pub resolver_timeout_ms: u64,
    /// Keyed by context level as a string, since TOML keys are strings.
    #[serde(default)]
    pub level_overrides: BTreeMap<String, Vec<String>>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            resolver_command: None,
            resolver_timeout_ms: default_resolver_timeout_ms(),
            level_overrides: BTreeMap::new(),
        }
    }
}

impl ContextSettings {
    /// Overrides keyed by numeric level. Rejects keys outside 0..=5.
    pub fn level_overrides(&self) -> Result<BTreeMap<u8, Vec<String>>> {
        let mut out = BTreeMap::new();
        for (key, files) in &self.level_overrides {
            let level: u8 = key
                .trim()
                .parse()
                .with_context(|| format!("invalid context level override key '{key}'"))?;
            if level > 5 {
                bail!("context level override {level} is out of range 0..=5");
            }
            out.insert(level, files.clone());
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub experiment: ExperimentSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub gate: GateThresholds,
    #[serde(default)]
    pub significance: SignificanceOptions,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ab-harness/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn executor_options(&self) -> Result<ExecutorOptions> {
        Ok(ExecutorOptions {
            command_timeout: Duration::from_millis(self.execution.command_timeout_ms),
            agent_timeout: Duration::from_millis(self.execution.agent_timeout_ms),
            max_extra_context_files: self.execution.max_extra_context_files,
            allow_edit_fallback: self.execution.allow_edit_fallback,
            agent_command: self.agent.command.clone(),
            prompt_template: self.execution.prompt_template.clone(),
            level_overrides: self.context.level_overrides()?,
            snapshot_exclude: self.experiment.workspace_exclude.clone(),
        })
    }

    pub fn selection_options(&self) -> SelectionOptions {
        SelectionOptions {
            mode: self.experiment.selection,
            max_tasks: self.experiment.max_tasks,
            stable_threshold: self.experiment.stable_threshold,
            uncertain_share: self.experiment.uncertain_share,
        }
    }

    /// Command-backed resolver, if one is configured.
    pub fn resolver_factory(&self, env: &EnvMap) -> Option<CommandResolverFactory> {
        let command = self.context.resolver_command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        Some(CommandResolverFactory {
            command: command.to_string(),
            timeout: Duration::from_millis(self.context.resolver_timeout_ms),
            env: env.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(
            config.experiment.worker_types,
            vec![WorkerType::Control, WorkerType::Treatment]
        );
        assert_eq!(config.experiment.selection, SelectionMode::Adaptive);
        assert!(config.experiment.max_tasks.is_none());
        assert_eq!(config.experiment.stable_threshold, 0.2);
        assert_eq!(config.experiment.uncertain_share, 0.75);
        assert_eq!(
            config.experiment.artifact_dir,
            Path::new(".ab-harness/artifacts")
        );
        assert!(config.experiment.workspace_exclude.contains(&".git".to_string()));
        assert_eq!(config.execution.command_timeout_ms, 120_000);
        assert_eq!(config.execution.agent_timeout_ms, 600_000);
        assert_eq!(config.execution.max_extra_context_files, 20);
        assert!(!config.execution.allow_edit_fallback);
        assert!(config.agent.command.is_none());
        assert!(config.context.resolver_command.is_none());
        assert_eq!(config.context.resolver_timeout_ms, 60_000);
        assert_eq!(config.gate, GateThresholds::default());
        assert_eq!(config.significance, SignificanceOptions::default());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[experiment]
worker_types = ["treatment"]
max_tasks = 12
selection = "uncertainty"
stable_threshold = 0.1
uncertain_share = 0.5
artifact_dir = "out/artifacts"
workspace_exclude = [".git"]

[execution]
command_timeout_ms = 30000
agent_timeout_ms = 90000
max_extra_context_files = 8
allow_edit_fallback = true
prompt_template = "Do {{TASK_ID}}"

[agent.command]
default = "agent {{PROMPT_FILE}}"
treatment = "agent --ctx {{CONTEXT_FILE}} {{PROMPT_FILE}}"

[context]
resolver_command = "librarian {{TASK_ID}}"
resolver_timeout_ms = 5000

[context.level_overrides]
"2" = ["README.md"]

[gate]
min_t3_success_lift = 0.1
require_t3_significance = true

[significance]
alpha = 0.01
min_samples = 10
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.experiment.worker_types, vec![WorkerType::Treatment]);
        assert_eq!(config.experiment.max_tasks, Some(12));
        assert_eq!(config.experiment.selection, SelectionMode::Uncertainty);
        assert_eq!(config.experiment.workspace_exclude, vec![".git"]);
        assert_eq!(config.execution.command_timeout_ms, 30_000);
        assert!(config.execution.allow_edit_fallback);
        assert_eq!(
            config
                .agent
                .command
                .as_ref()
                .and_then(|c| c.for_worker(WorkerType::Control)),
            Some("agent {{PROMPT_FILE}}")
        );
        assert_eq!(config.gate.min_t3_success_lift, 0.1);
        assert!(config.gate.require_t3_significance);
        assert_eq!(config.gate.min_samples_per_group, 5);
        assert_eq!(config.significance.alpha, 0.01);
        assert_eq!(config.significance.min_samples, 10);

        let options = config.executor_options().unwrap();
        assert_eq!(options.command_timeout, Duration::from_secs(30));
        assert_eq!(options.level_overrides[&2], vec!["README.md"]);
        assert_eq!(options.prompt_template.as_deref(), Some("Do {{TASK_ID}}"));

        let factory = config.resolver_factory(&EnvMap::new()).unwrap();
        assert_eq!(factory.timeout, Duration::from_secs(5));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[execution]
allow_edit_fallback = true

[significance]
alpha = 0.1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(config.execution.allow_edit_fallback);
        assert_eq!(config.execution.agent_timeout_ms, 600_000);
        assert_eq!(config.significance.alpha, 0.1);
        assert_eq!(config.significance.min_samples, 5);
        assert_eq!(config.experiment.selection, SelectionMode::Adaptive);
    }

    #[test]
    fn single_string_agent_command() {
        let toml = r#"
[agent]
command = "agent run {{PROMPT_FILE}}"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        let command = config.agent.command.unwrap();
        assert_eq!(
            command.for_worker(WorkerType::Treatment),
            Some("agent run {{PROMPT_FILE}}")
        );
    }

    #[test]
    fn bad_level_override_key_is_rejected() {
        let toml = r#"
[context.level_overrides]
"nine" = ["README.md"]
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(config.executor_options().is_err());

        let toml = r#"
[context.level_overrides]
"7" = ["README.md"]
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        let err = config.context.level_overrides().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn blank_resolver_command_means_no_resolver() {
        let toml = r#"
[context]
resolver_command = "  "
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(config.resolver_factory(&EnvMap::new()).is_none());
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ab-harness");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[experiment]
max_tasks = 3
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.experiment.max_tasks, Some(3));
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.execution.max_extra_context_files, 20);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ab-harness");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[experiment]
selection = "sequential"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.experiment.selection, SelectionMode::Sequential);
    }
}
