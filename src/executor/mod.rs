//! Single-task executor.
//!
//! One call runs one task for one arm inside an already-isolated workspace:
//! resolve paths, assemble context, run the setup and baseline gates, make
//! the change, verify it, and persist an auditable artifact set. Every
//! failure ends up as a stable reason code on the returned [`RunResult`];
//! nothing here panics or returns an error to the caller.

pub mod artifacts;
pub mod edit;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{
    AGENT_COMMAND_ENV_MISSING, AGENT_COMMAND_MISSING, ARTIFACT_INCOMPLETE,
    ARTIFACT_WRITE_FAILED, BASELINE_EXPECTED_FAILURE_MISSING, BASELINE_REQUIRED_BUT_MISSING,
    CommandStage, FailureKind, LIBRARIAN_CONTEXT_UNAVAILABLE, MISSING_CONTEXT_AFTER_LIBRARIAN,
    NO_TARGET_FILE_MODIFIED, classify_command, classify_resolver_error, failure_code,
};
use crate::context::{
    ContextRequest, ContextResolver, build_base_context, merge_context, missing_targets,
    rank_extra_candidates,
};
use crate::paths::{EnvMap, expand_env_vars, render_template, resolve_case_insensitive, shell_quote};
use crate::prompt::render_prompt;
use crate::supervisor::{CommandSpec, run_command};
use crate::task::{AgentCommandTemplate, Complexity, FileEdit, TaskMode, TaskSpec, WorkerType};
use crate::verification::{
    Phase, PhaseContext, PhaseResult, VerificationOutcome, run_phase, run_pipeline,
};

use artifacts::{
    AgentCommandArtifact, ArtifactIntegrity, ArtifactKey, ArtifactRecord, ArtifactWriter,
    ContextSnapshot, PromptArtifact,
};

/// Default directory names skipped when copying or snapshotting a workspace.
pub const DEFAULT_WORKSPACE_EXCLUDE: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".venv",
    "__pycache__",
    ".next",
    "coverage",
];

/// Knobs shared by every run of an experiment.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub command_timeout: Duration,
    pub agent_timeout: Duration,
    pub max_extra_context_files: usize,
    /// Apply a task's fallback edits when no agent command is available.
    pub allow_edit_fallback: bool,
    /// Experiment-wide agent command, used when a task has none.
    pub agent_command: Option<AgentCommandTemplate>,
    pub prompt_template: Option<String>,
    pub level_overrides: BTreeMap<u8, Vec<String>>,
    /// Directory names ignored by change detection.
    pub snapshot_exclude: Vec<String>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(120_000),
            agent_timeout: Duration::from_millis(600_000),
            max_extra_context_files: 20,
            allow_edit_fallback: false,
            agent_command: None,
            prompt_template: None,
            level_overrides: BTreeMap::new(),
            snapshot_exclude: DEFAULT_WORKSPACE_EXCLUDE
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Policy facts recorded with every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub baseline_failure_required: bool,
    pub verification_command_count: usize,
    pub edit_fallback_allowed: bool,
    pub edit_fallback_used: bool,
}

/// The unit of measurement: one task executed by one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub task_id: String,
    pub repo: String,
    pub complexity: Complexity,
    pub worker_type: WorkerType,
    pub mode: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub extra_context_files: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationOutcome>,
    #[serde(default)]
    pub agent_command_executed: bool,
    #[serde(default)]
    pub policy: PolicySnapshot,
    #[serde(default)]
    pub artifacts: ArtifactIntegrity,
}

impl RunResult {
    /// A run that never reached the executor (missing repository, workspace
    /// setup failure). Nothing was written, so its artifacts are incomplete.
    pub fn infrastructure_failure(
        task: &TaskSpec,
        worker: WorkerType,
        reason: &str,
        artifact_dir: &Path,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            repo: task.repo.clone(),
            complexity: task.complexity,
            worker_type: worker,
            mode: task.mode.label().to_string(),
            success: false,
            duration_ms: 0,
            failure_reason: Some(reason.to_string()),
            context_files: Vec::new(),
            extra_context_files: Vec::new(),
            modified_files: Vec::new(),
            setup: None,
            baseline: None,
            verification: None,
            agent_command_executed: false,
            policy: policy_for(task, false, false),
            artifacts: ArtifactIntegrity {
                dir: artifact_dir.to_string_lossy().to_string(),
                complete: false,
                ..Default::default()
            },
        }
    }

    /// Verification ran at least one command in this run.
    pub fn verified_execution(&self) -> bool {
        self.verification
            .as_ref()
            .is_some_and(|v| v.executed_command_count() > 0)
    }
}

fn policy_for(task: &TaskSpec, fallback_allowed: bool, fallback_used: bool) -> PolicySnapshot {
    PolicySnapshot {
        baseline_failure_required: task.verification.require_baseline_failure,
        verification_command_count: task.verification.verification_command_count(),
        edit_fallback_allowed: fallback_allowed,
        edit_fallback_used: fallback_used,
    }
}

/// Everything one run needs.
pub struct RunRequest<'a> {
    pub task: &'a TaskSpec,
    pub worker: WorkerType,
    /// Isolated copy of the repository. Mutated in place.
    pub workspace: &'a Path,
    /// This run's own artifact directory.
    pub artifact_dir: PathBuf,
    pub options: &'a ExecutorOptions,
    pub env: &'a EnvMap,
    /// Retrieval session for the task's repository. Only treatment runs use it.
    pub resolver: Option<&'a dyn ContextResolver>,
}

/// Budget advertised to the agent: the hard timeout minus a grace period of
/// one twentieth, clamped to 1s..=30s, so the agent can stop on its own first.
pub fn inner_agent_timeout(outer: Duration) -> Duration {
    let grace = (outer / 20).clamp(Duration::from_secs(1), Duration::from_secs(30));
    if outer > grace {
        outer - grace
    } else {
        outer / 2
    }
}

/// A stage failure carrying its reason code.
#[derive(Debug)]
struct Failure(String);

impl Failure {
    fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    fn command(stage: CommandStage, kind: FailureKind) -> Self {
        Self(failure_code(stage, kind))
    }
}

type StageResult = Result<(), Failure>;

/// Which stages were reached; decides the required artifact set.
#[derive(Debug, Default)]
struct Reached {
    context: bool,
    setup: bool,
    baseline: bool,
    agent: bool,
    verification: bool,
}

struct Run<'r, 'a> {
    req: &'r RunRequest<'a>,
    artifacts: ArtifactWriter,
    reached: Reached,
    targets: Vec<String>,
    base_context: Vec<String>,
    context_files: Vec<String>,
    extra_context_files: Vec<String>,
    modified_files: Vec<String>,
    setup: Option<PhaseResult>,
    baseline: Option<PhaseResult>,
    verification: Option<VerificationOutcome>,
    agent_executed: bool,
    fallback_used: bool,
}

/// Execute one task for one arm.
pub async fn execute_task(req: &RunRequest<'_>) -> RunResult {
    let started = Instant::now();
    info!(
        task = %req.task.id,
        worker = req.worker.as_str(),
        mode = req.task.mode.label(),
        "run started"
    );

    let mut run = Run {
        req,
        artifacts: ArtifactWriter::create(req.artifact_dir.clone()),
        reached: Reached::default(),
        targets: Vec::new(),
        base_context: Vec::new(),
        context_files: Vec::new(),
        extra_context_files: Vec::new(),
        modified_files: Vec::new(),
        setup: None,
        baseline: None,
        verification: None,
        agent_executed: false,
        fallback_used: false,
    };

    let outcome = if run.artifacts.init_error().is_some() {
        Err(Failure::new(ARTIFACT_WRITE_FAILED))
    } else {
        run.execute().await
    };
    let result = run.finish(outcome, started.elapsed());

    info!(
        task = %result.task_id,
        worker = result.worker_type.as_str(),
        success = result.success,
        reason = result.failure_reason.as_deref().unwrap_or(""),
        duration_ms = result.duration_ms,
        "run finished"
    );
    result
}

impl Run<'_, '_> {
    fn phase_context(&self) -> PhaseContext<'_> {
        PhaseContext {
            work_dir: self.req.workspace,
            env: self.req.env,
            command_timeout: self.req.options.command_timeout,
        }
    }

    fn resolve(&self, rel: &str) -> String {
        resolve_case_insensitive(self.req.workspace, rel).unwrap_or_else(|| rel.to_string())
    }

    async fn execute(&mut self) -> StageResult {
        let task = self.req.task;
        self.artifacts.write(ArtifactRecord::Task(task));
        self.targets = task.target_files.iter().map(|t| self.resolve(t)).collect();
        // Taken before setup so generated files stay out of the listing.
        self.base_context = self.build_base();

        self.run_setup().await?;
        self.run_baseline().await?;
        self.assemble_context().await?;
        self.apply_change().await?;
        self.check_target_modified()?;
        self.run_verification().await
    }

    async fn run_setup(&mut self) -> StageResult {
        let commands = &self.req.task.verification.setup;
        if commands.is_empty() {
            return Ok(());
        }
        self.reached.setup = true;
        let result = run_phase(Phase::Setup, commands, &self.phase_context()).await;
        self.artifacts.write(ArtifactRecord::Setup(&result));
        let failure = result
            .failing_command()
            .map(|c| classify_command(CommandStage::Setup, c));
        self.setup = Some(result);

        match failure {
            Some(kind) => Err(Failure::command(CommandStage::Setup, kind)),
            None => Ok(()),
        }
    }

    async fn run_baseline(&mut self) -> StageResult {
        let spec = &self.req.task.verification;
        if spec.baseline.is_empty() {
            if spec.require_baseline_failure {
                return Err(Failure::new(BASELINE_REQUIRED_BUT_MISSING));
            }
            return Ok(());
        }

        self.reached.baseline = true;
        let result = run_phase(Phase::Baseline, &spec.baseline, &self.phase_context()).await;
        self.artifacts.write(ArtifactRecord::Baseline(&result));
        let failure = result
            .failing_command()
            .map(|c| classify_command(CommandStage::Baseline, c));
        self.baseline = Some(result);

        match failure {
            None if spec.require_baseline_failure => {
                Err(Failure::new(BASELINE_EXPECTED_FAILURE_MISSING))
            }
            None => Ok(()),
            // An ordinary red baseline is what a bug-fix task starts from.
            Some(FailureKind::Failed) => Ok(()),
            Some(kind) => Err(Failure::command(CommandStage::Baseline, kind)),
        }
    }

    fn build_base(&self) -> Vec<String> {
        let req = self.req;
        match build_base_context(
            req.workspace,
            req.task.context_level,
            &self.targets,
            &req.options.level_overrides,
        ) {
            Ok(base) => base,
            Err(e) => {
                warn!(task = %req.task.id, error = %format!("{e:#}"), "base context unavailable");
                Vec::new()
            }
        }
    }

    async fn assemble_context(&mut self) -> StageResult {
        let req = self.req;
        let task = req.task;
        let workspace = req.workspace;
        let level = task.context_level;

        let base = std::mem::take(&mut self.base_context);
        let mut snapshot = ContextSnapshot {
            level,
            base_files: base.clone(),
            ..Default::default()
        };

        let mut extra = Vec::new();
        if req.worker == WorkerType::Treatment {
            let request = ContextRequest {
                task,
                repo_root: workspace,
                context_level: level,
                context_files: &base,
            };
            let resolved = match req.resolver {
                Some(resolver) => resolver
                    .resolve_extra_context(&request)
                    .await
                    .map_err(|e| format!("{e:#}")),
                None => Err("no context resolver configured".to_string()),
            };

            let mut pool = Vec::new();
            match resolved {
                Ok(candidates) => {
                    debug!(task = %task.id, candidates = candidates.len(), "resolver returned");
                    pool = candidates
                        .iter()
                        .filter_map(|c| resolve_case_insensitive(workspace, c))
                        .filter(|c| workspace.join(c).is_file())
                        .collect();
                    snapshot.resolver_candidates = candidates;
                    if pool.is_empty() && task.require_treatment_context {
                        return self.fail_context(snapshot, LIBRARIAN_CONTEXT_UNAVAILABLE);
                    }
                }
                Err(message) => {
                    let code = classify_resolver_error(&message);
                    warn!(task = %task.id, error = %message, code, "context resolver failed");
                    snapshot.resolver_error = Some(message);
                    if task.require_treatment_context {
                        return self.fail_context(snapshot, code);
                    }
                }
            }

            let recovered: Vec<String> = missing_targets(&merge_context(&base, &pool), &self.targets)
                .into_iter()
                .filter(|t| workspace.join(t).is_file())
                .collect();
            pool.extend(recovered.iter().cloned());
            snapshot.recovered_targets = recovered;

            extra = rank_extra_candidates(&pool, &self.targets, req.options.max_extra_context_files)
                .into_iter()
                .filter(|f| !base.contains(f))
                .collect();
        }

        let combined = merge_context(&base, &extra);
        snapshot.extra_files = extra.clone();
        if req.worker == WorkerType::Treatment {
            snapshot.missing_targets = missing_targets(&combined, &self.targets);
        }
        self.context_files = combined;
        self.extra_context_files = extra;

        if !snapshot.missing_targets.is_empty() {
            return self.fail_context(snapshot, MISSING_CONTEXT_AFTER_LIBRARIAN);
        }
        self.reached.context = true;
        self.artifacts.write(ArtifactRecord::Context(&snapshot));
        Ok(())
    }

    fn fail_context(&mut self, snapshot: ContextSnapshot, code: &str) -> StageResult {
        self.reached.context = true;
        self.artifacts.write(ArtifactRecord::Context(&snapshot));
        Err(Failure::new(code))
    }

    async fn apply_change(&mut self) -> StageResult {
        let req = self.req;
        match &req.task.mode {
            TaskMode::DeterministicEdit { edits } => self.apply_edits(edits),
            TaskMode::AgentCommand {
                command,
                fallback_edits,
            } => {
                let template = command
                    .as_ref()
                    .and_then(|t| t.for_worker(req.worker))
                    .or_else(|| {
                        req.options
                            .agent_command
                            .as_ref()
                            .and_then(|t| t.for_worker(req.worker))
                    });
                match template {
                    Some(template) => self.run_agent(template).await,
                    None if req.options.allow_edit_fallback && !fallback_edits.is_empty() => {
                        info!(task = %req.task.id, "no agent command; applying fallback edits");
                        self.fallback_used = true;
                        self.apply_edits(fallback_edits)
                    }
                    None => Err(Failure::new(AGENT_COMMAND_MISSING)),
                }
            }
        }
    }

    fn apply_edits(&mut self, edits: &[FileEdit]) -> StageResult {
        let resolved: Vec<FileEdit> = edits
            .iter()
            .map(|e| FileEdit {
                file: self.resolve(&e.file),
                ..e.clone()
            })
            .collect();
        match edit::apply_edits(self.req.workspace, &resolved) {
            Ok(modified) => {
                self.modified_files = modified;
                Ok(())
            }
            Err(e) => {
                warn!(task = %self.req.task.id, error = %e, "edit failed");
                Err(Failure::new(e.reason_code()))
            }
        }
    }

    async fn run_agent(&mut self, template: &str) -> StageResult {
        let req = self.req;
        let task = req.task;
        let options = req.options;
        self.reached.agent = true;

        let prompt = render_prompt(
            options.prompt_template.as_deref(),
            task,
            req.worker,
            &self.context_files,
        );
        let prompt_path = self
            .artifacts
            .write_text("prompt.txt", &prompt)
            .unwrap_or_else(|| self.artifacts.dir().join("prompt.txt"));
        self.artifacts.write(ArtifactRecord::Prompt(&PromptArtifact {
            path: prompt_path.to_string_lossy().to_string(),
            text: prompt,
        }));

        let inner_timeout = inner_agent_timeout(options.agent_timeout);
        let mut record = AgentCommandArtifact {
            template: template.to_string(),
            rendered: None,
            missing_env: Vec::new(),
            timeout_ms: options.agent_timeout.as_millis() as u64,
            inner_timeout_ms: inner_timeout.as_millis() as u64,
        };

        let expanded = match expand_env_vars(template, req.env) {
            Ok(expanded) => expanded,
            Err(missing) => {
                let code = format!("{AGENT_COMMAND_ENV_MISSING}:{}", missing.0.join(","));
                record.missing_env = missing.0;
                self.artifacts.write(ArtifactRecord::AgentCommand(&record));
                return Err(Failure::new(code));
            }
        };

        let dir = self.artifacts.dir().to_string_lossy().to_string();
        let workspace = req.workspace.to_string_lossy().to_string();
        let context_file = self.artifacts.path(ArtifactKey::Context);
        let task_file = self.artifacts.path(ArtifactKey::Task);
        let mut tokens = BTreeMap::new();
        tokens.insert("TASK_ID", shell_quote(&task.id));
        tokens.insert("WORKER_TYPE", req.worker.as_str().to_string());
        tokens.insert("WORKSPACE_ROOT", shell_quote(&workspace));
        tokens.insert("ARTIFACT_DIR", shell_quote(&dir));
        tokens.insert("PROMPT_FILE", shell_quote(&prompt_path.to_string_lossy()));
        tokens.insert("CONTEXT_FILE", shell_quote(&context_file.to_string_lossy()));
        tokens.insert("TASK_FILE", shell_quote(&task_file.to_string_lossy()));
        let rendered = render_template(&expanded, &tokens);
        record.rendered = Some(rendered.clone());
        self.artifacts.write(ArtifactRecord::AgentCommand(&record));

        let mut env = req.env.clone();
        env.insert("AB_HARNESS_TASK_ID".into(), task.id.clone());
        env.insert("AB_HARNESS_WORKER_TYPE".into(), req.worker.as_str().into());
        env.insert("AB_HARNESS_WORKSPACE_ROOT".into(), workspace);
        env.insert("AB_HARNESS_ARTIFACT_DIR".into(), dir);
        env.insert(
            "AB_HARNESS_PROMPT_FILE".into(),
            prompt_path.to_string_lossy().to_string(),
        );
        env.insert(
            "AB_HARNESS_TIMEOUT_MS".into(),
            inner_timeout.as_millis().to_string(),
        );

        let exclude = &options.snapshot_exclude;
        let before = edit::snapshot_tree(req.workspace, exclude).ok();

        info!(task = %task.id, worker = req.worker.as_str(), "running agent command");
        let result = run_command(&CommandSpec {
            command: &rendered,
            cwd: req.workspace,
            env: &env,
            timeout: options.agent_timeout,
        })
        .await;
        self.agent_executed = true;
        self.artifacts.write(ArtifactRecord::AgentCommandResult(&result));

        match (before, edit::snapshot_tree(req.workspace, exclude)) {
            (Some(before), Ok(after)) => {
                self.modified_files = edit::diff_snapshots(&before, &after);
            }
            (_, Err(e)) => {
                warn!(task = %task.id, error = %format!("{e:#}"), "workspace snapshot failed");
            }
            (None, _) => warn!(task = %task.id, "workspace snapshot before agent run failed"),
        }

        if result.passed() {
            Ok(())
        } else {
            Err(Failure::command(
                CommandStage::Agent,
                classify_command(CommandStage::Agent, &result),
            ))
        }
    }

    fn check_target_modified(&self) -> StageResult {
        if !self.req.task.require_target_file_modified {
            return Ok(());
        }
        let touched = self
            .modified_files
            .iter()
            .any(|m| self.targets.iter().any(|t| t == m));
        if touched {
            Ok(())
        } else {
            Err(Failure::new(NO_TARGET_FILE_MODIFIED))
        }
    }

    async fn run_verification(&mut self) -> StageResult {
        self.reached.verification = true;
        let outcome = run_pipeline(&self.req.task.verification, &self.phase_context()).await;
        self.artifacts.write(ArtifactRecord::Verification(&outcome));
        let failure = outcome
            .failing_command()
            .map(|c| classify_command(CommandStage::Verification, c));
        let success = outcome.success;
        self.verification = Some(outcome);

        match failure {
            Some(kind) => Err(Failure::command(CommandStage::Verification, kind)),
            None if !success => Err(Failure::command(
                CommandStage::Verification,
                FailureKind::Failed,
            )),
            None => Ok(()),
        }
    }

    fn required_artifacts(&self) -> BTreeSet<ArtifactKey> {
        let mut required: BTreeSet<ArtifactKey> = [ArtifactKey::Task, ArtifactKey::Result].into();
        if self.reached.context {
            required.insert(ArtifactKey::Context);
        }
        if self.reached.setup {
            required.insert(ArtifactKey::Setup);
        }
        if self.reached.baseline {
            required.insert(ArtifactKey::Baseline);
        }
        if self.reached.agent {
            required.insert(ArtifactKey::Prompt);
            required.insert(ArtifactKey::AgentCommand);
        }
        if self.agent_executed {
            required.insert(ArtifactKey::AgentCommandResult);
        }
        if self.reached.verification {
            required.insert(ArtifactKey::Verification);
        }
        required
    }

    fn finish(mut self, outcome: StageResult, elapsed: Duration) -> RunResult {
        let task = self.req.task;
        let (mut success, mut failure_reason) = match outcome {
            Ok(()) => (true, None),
            Err(Failure(code)) => (false, Some(code)),
        };

        let required = self.required_artifacts();
        // Everything but result.json must already be on disk.
        let mut integrity = self.artifacts.integrity(&required);
        integrity.missing.retain(|k| *k != ArtifactKey::Result);
        if !integrity.present.contains(&ArtifactKey::Result) {
            integrity.present.push(ArtifactKey::Result);
            integrity.present.sort();
        }
        integrity.complete = integrity.missing.is_empty();
        if !integrity.complete && success {
            success = false;
            failure_reason = Some(ARTIFACT_INCOMPLETE.to_string());
        }

        let mut result = RunResult {
            task_id: task.id.clone(),
            repo: task.repo.clone(),
            complexity: task.complexity,
            worker_type: self.req.worker,
            mode: task.mode.label().to_string(),
            success,
            duration_ms: elapsed.as_millis() as u64,
            failure_reason,
            context_files: std::mem::take(&mut self.context_files),
            extra_context_files: std::mem::take(&mut self.extra_context_files),
            modified_files: std::mem::take(&mut self.modified_files),
            setup: self.setup.take(),
            baseline: self.baseline.take(),
            verification: self.verification.take(),
            agent_command_executed: self.agent_executed,
            policy: policy_for(task, self.req.options.allow_edit_fallback, self.fallback_used),
            artifacts: integrity,
        };

        if !self.artifacts.write(ArtifactRecord::Result(&result)) {
            let integrity = self.artifacts.integrity(&required);
            if result.success {
                result.success = false;
                result.failure_reason = Some(ARTIFACT_INCOMPLETE.to_string());
            }
            result.artifacts = integrity;
        }
        result
    }
}

/// Whether a failure reason was produced by the context stage.
pub fn is_context_failure(reason: &str) -> bool {
    reason.starts_with("librarian_") || reason == MISSING_CONTEXT_AFTER_LIBRARIAN
}

/// Whether a failure reason is a timeout of any command stage.
pub fn is_timeout_failure(reason: &str) -> bool {
    reason.ends_with(FailureKind::Timeout.suffix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    use crate::paths::capture_process_env;
    use crate::task::parse_catalog;

    struct FixedResolver(Vec<String>);

    #[async_trait]
    impl ContextResolver for FixedResolver {
        async fn resolve_extra_context(&self, _request: &ContextRequest<'_>) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenResolver(&'static str);

    #[async_trait]
    impl ContextResolver for BrokenResolver {
        async fn resolve_extra_context(&self, _request: &ContextRequest<'_>) -> Result<Vec<String>> {
            Err(anyhow!(self.0))
        }
    }

    fn task(yaml: &str) -> TaskSpec {
        parse_catalog(yaml).unwrap().remove(0)
    }

    fn workspace() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("README.md"), "# demo\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src").join("Format.ts"), "export const digits = 1;\n").unwrap();
        std::fs::write(tmp.path().join("src").join("util.ts"), "export {};\n").unwrap();
        tmp
    }

    async fn run(
        task: &TaskSpec,
        worker: WorkerType,
        ws: &Path,
        artifacts: &Path,
        options: &ExecutorOptions,
        resolver: Option<&dyn ContextResolver>,
    ) -> RunResult {
        let env = capture_process_env();
        execute_task(&RunRequest {
            task,
            worker,
            workspace: ws,
            artifact_dir: artifacts.join(&task.id).join(worker.as_str()),
            options,
            env: &env,
            resolver,
        })
        .await
    }

    const EDIT_TASK: &str = r#"
- id: fmt
  repo: demo
  complexity: T1
  context_level: 1
  target_files: [src/format.ts]
  require_target_file_modified: true
  edits:
    - {file: src/format.ts, search: "digits = 1", replace: "digits = 2"}
  verification:
    tests: ["grep -q 'digits = 2' src/Format.ts"]
"#;

    #[tokio::test]
    async fn deterministic_edit_resolves_case_and_verifies() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let task = task(EDIT_TASK);
        let result = run(&task, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;

        assert!(result.success, "{:?}", result.failure_reason);
        assert_eq!(result.modified_files, vec!["src/Format.ts"]);
        assert!(result.verified_execution());
        assert!(result.artifacts.complete);
        assert!(result.artifacts.required.contains(&ArtifactKey::Verification));
        assert!(result.extra_context_files.is_empty());

        let on_disk: RunResult = serde_json::from_str(
            &std::fs::read_to_string(art.path().join("fmt").join("control").join("result.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk, result);
    }

    #[tokio::test]
    async fn treatment_without_usable_context_fails_when_required() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let task = task(EDIT_TASK);
        let resolver: &dyn ContextResolver = &FixedResolver(vec!["does/not/exist.ts".into()]);
        let result = run(
            &task,
            WorkerType::Treatment,
            ws.path(),
            art.path(),
            &ExecutorOptions::default(),
            Some(resolver),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.failure_reason.as_deref(), Some(LIBRARIAN_CONTEXT_UNAVAILABLE));
        assert!(result.modified_files.is_empty());
        assert!(result.artifacts.complete);
        assert!(result.artifacts.required.contains(&ArtifactKey::Context));
    }

    #[tokio::test]
    async fn treatment_recovers_omitted_targets() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let task = task(EDIT_TASK);
        let resolver: &dyn ContextResolver = &FixedResolver(vec!["SRC/UTIL.TS".into()]);
        let result = run(
            &task,
            WorkerType::Treatment,
            ws.path(),
            art.path(),
            &ExecutorOptions::default(),
            Some(resolver),
        )
        .await;

        assert!(result.success, "{:?}", result.failure_reason);
        assert_eq!(result.extra_context_files[0], "src/Format.ts");
        assert!(result.extra_context_files.contains(&"src/util.ts".to_string()));
        assert!(result.context_files.contains(&"README.md".to_string()));
    }

    #[tokio::test]
    async fn provider_errors_from_resolver_are_classified() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let task = task(EDIT_TASK);
        let resolver: &dyn ContextResolver = &BrokenResolver("embedding provider: rate limit exceeded");
        let result = run(
            &task,
            WorkerType::Treatment,
            ws.path(),
            art.path(),
            &ExecutorOptions::default(),
            Some(resolver),
        )
        .await;
        assert_eq!(
            result.failure_reason.as_deref(),
            Some(crate::classify::LIBRARIAN_PROVIDER_UNAVAILABLE)
        );
    }

    #[tokio::test]
    async fn optional_treatment_context_proceeds_after_resolver_error() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut task = task(EDIT_TASK);
        task.require_treatment_context = false;
        let resolver: Arc<dyn ContextResolver> = Arc::new(BrokenResolver("index offline"));
        let result = run(
            &task,
            WorkerType::Treatment,
            ws.path(),
            art.path(),
            &ExecutorOptions::default(),
            Some(resolver.as_ref()),
        )
        .await;
        assert!(result.success, "{:?}", result.failure_reason);
        assert_eq!(result.extra_context_files, vec!["src/Format.ts"]);
    }

    #[tokio::test]
    async fn baseline_policy_is_enforced() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();

        let mut t = task(EDIT_TASK);
        t.verification.require_baseline_failure = true;
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some(BASELINE_REQUIRED_BUT_MISSING));
        assert!(result.policy.baseline_failure_required);

        t.verification.baseline = vec!["true".into()];
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(
            result.failure_reason.as_deref(),
            Some(BASELINE_EXPECTED_FAILURE_MISSING)
        );
        assert!(result.baseline.is_some());
        assert!(result.verification.is_none());
    }

    #[tokio::test]
    async fn failing_baseline_is_tolerated_but_missing_tool_is_not() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();

        let mut t = task(EDIT_TASK);
        t.verification.baseline = vec!["grep -q 'digits = 2' src/Format.ts".into()];
        t.verification.require_baseline_failure = true;
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert!(result.success, "{:?}", result.failure_reason);

        let ws = workspace();
        t.verification.baseline = vec!["definitely-not-a-real-binary-xyz".into()];
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some("baseline_command_missing"));
    }

    #[tokio::test]
    async fn setup_failure_stops_the_run() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(EDIT_TASK);
        t.verification.setup = vec!["exit 3".into()];
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some("setup_command_failed"));
        assert!(result.modified_files.is_empty());
        assert!(result.artifacts.required.contains(&ArtifactKey::Setup));
        assert!(!result.artifacts.required.contains(&ArtifactKey::Context));
        assert!(result.artifacts.complete);
    }

    #[tokio::test]
    async fn missing_search_text_reports_file() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let t = task(
            "- {id: e, repo: demo, complexity: T2, edits: [{file: src/util.ts, search: nope, replace: x}]}",
        );
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some("edit_not_found:src/util.ts"));
    }

    const AGENT_TASK: &str = r#"
- id: agent
  repo: demo
  complexity: T3
  mode: agent_command
  target_files: [src/util.ts]
  require_target_file_modified: true
  agent_command: "test -s {{PROMPT_FILE}} && echo \"$AB_HARNESS_TASK_ID\" > src/util.ts"
  verification:
    tests: ["grep -q agent src/util.ts"]
"#;

    #[tokio::test]
    async fn agent_command_runs_and_changes_are_detected() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let t = task(AGENT_TASK);
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;

        assert!(result.success, "{:?}", result.failure_reason);
        assert!(result.agent_command_executed);
        assert_eq!(result.modified_files, vec!["src/util.ts"]);
        for key in [ArtifactKey::Prompt, ArtifactKey::AgentCommand, ArtifactKey::AgentCommandResult] {
            assert!(result.artifacts.present.contains(&key), "{key:?}");
        }
        assert!(art.path().join("agent").join("control").join("prompt.txt").is_file());
    }

    #[tokio::test]
    async fn agent_that_touches_nothing_fails_target_check() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(AGENT_TASK);
        if let TaskMode::AgentCommand { command, .. } = &mut t.mode {
            *command = Some(AgentCommandTemplate::Single("echo hi > notes.txt".into()));
        }
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some(NO_TARGET_FILE_MODIFIED));
        assert_eq!(result.modified_files, vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn missing_env_vars_are_listed() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(AGENT_TASK);
        if let TaskMode::AgentCommand { command, .. } = &mut t.mode {
            *command = Some(AgentCommandTemplate::Single(
                "agent --key ${AB_TEST_UNSET_KEY_B} ${AB_TEST_UNSET_KEY_A}".into(),
            ));
        }
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(
            result.failure_reason.as_deref(),
            Some("agent_command_env_missing:AB_TEST_UNSET_KEY_A,AB_TEST_UNSET_KEY_B")
        );
        assert!(!result.agent_command_executed);
        assert!(result.artifacts.complete);
    }

    #[tokio::test]
    async fn agent_mode_without_command_uses_fallback_only_when_allowed() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let t = task(
            r#"
- id: fb
  repo: demo
  complexity: T2
  mode: agent_command
  target_files: [src/util.ts]
  edits: [{file: src/util.ts, search: "export", replace: "// patched\nexport"}]
"#,
        );

        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;
        assert_eq!(result.failure_reason.as_deref(), Some(AGENT_COMMAND_MISSING));
        assert!(!result.policy.edit_fallback_used);

        let options = ExecutorOptions {
            allow_edit_fallback: true,
            ..Default::default()
        };
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &options, None).await;
        assert!(result.success, "{:?}", result.failure_reason);
        assert!(result.policy.edit_fallback_used);
        assert!(!result.agent_command_executed);
    }

    #[tokio::test]
    async fn agent_timeout_is_classified() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(AGENT_TASK);
        if let TaskMode::AgentCommand { command, .. } = &mut t.mode {
            *command = Some(AgentCommandTemplate::Single("sleep 30".into()));
        }
        let options = ExecutorOptions {
            agent_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &options, None).await;
        assert_eq!(result.failure_reason.as_deref(), Some("agent_command_timeout"));
        assert!(result.agent_command_executed);
    }

    #[tokio::test]
    async fn unwritable_artifact_dir_fails_the_run() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let blocker = art.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let t = task(EDIT_TASK);
        let result = run(&t, WorkerType::Control, ws.path(), &blocker, &ExecutorOptions::default(), None).await;
        assert!(!result.success);
        assert_eq!(result.failure_reason.as_deref(), Some(ARTIFACT_WRITE_FAILED));
        assert!(!result.artifacts.complete);
        // The workspace was never touched.
        assert!(
            std::fs::read_to_string(ws.path().join("src").join("Format.ts"))
                .unwrap()
                .contains("digits = 1")
        );
    }

    #[tokio::test]
    async fn agent_edits_under_nested_build_directory_are_detected() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join("src").join("build")).unwrap();
        std::fs::write(ws.path().join("src").join("build").join("gen.ts"), "old\n").unwrap();
        let t = task(
            r#"
- id: nested
  repo: demo
  complexity: T2
  mode: agent_command
  target_files: [src/build/gen.ts]
  require_target_file_modified: true
  agent_command: "echo new > src/build/gen.ts"
  verification:
    tests: ["grep -q new src/build/gen.ts"]
"#,
        );
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;

        assert!(result.success, "{:?}", result.failure_reason);
        assert_eq!(result.modified_files, vec!["src/build/gen.ts"]);
    }

    #[tokio::test]
    async fn deleted_required_artifact_downgrades_success() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(AGENT_TASK);
        if let TaskMode::AgentCommand { command, .. } = &mut t.mode {
            *command = Some(AgentCommandTemplate::Single(
                "rm -f {{TASK_FILE}} && echo agent > src/util.ts".into(),
            ));
        }
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason.as_deref(), Some(ARTIFACT_INCOMPLETE));
        assert!(!result.artifacts.complete);
        assert_eq!(result.artifacts.missing, vec![ArtifactKey::Task]);
        // Verification itself passed; only the audit trail is broken.
        assert!(result.verification.as_ref().is_some_and(|v| v.success));
    }

    #[tokio::test]
    async fn files_created_by_setup_stay_out_of_base_context() {
        let ws = workspace();
        let art = tempfile::tempdir().unwrap();
        let mut t = task(EDIT_TASK);
        t.verification.setup = vec!["echo generated > setup-output.log".into()];
        let result = run(&t, WorkerType::Control, ws.path(), art.path(), &ExecutorOptions::default(), None).await;

        assert!(result.success, "{:?}", result.failure_reason);
        assert!(ws.path().join("setup-output.log").is_file());
        assert!(result.context_files.contains(&"README.md".to_string()));
        assert!(!result.context_files.contains(&"setup-output.log".to_string()));
    }

    #[test]
    fn inner_timeout_leaves_grace() {
        assert_eq!(
            inner_agent_timeout(Duration::from_secs(600)),
            Duration::from_secs(570)
        );
        assert_eq!(
            inner_agent_timeout(Duration::from_secs(10)),
            Duration::from_secs(9)
        );
        assert_eq!(
            inner_agent_timeout(Duration::from_millis(800)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn reason_helpers() {
        assert!(is_context_failure("librarian_context_unavailable"));
        assert!(is_context_failure(MISSING_CONTEXT_AFTER_LIBRARIAN));
        assert!(!is_context_failure("verification_command_failed"));
        assert!(is_timeout_failure("agent_command_timeout"));
        assert!(!is_timeout_failure("agent_command_failed"));
    }
}
