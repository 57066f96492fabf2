//! Runs one experiment end to end.
//!
//! It:
//! 1. Selects which tasks fit the budget
//! 2. Copies each task's repository into a fresh temporary workspace per run
//! 3. Executes every (task × worker type) pair in order
//! 4. Reuses one context-resolver session per repository
//! 5. Aggregates statistics and evaluates the release gate
//!
//! Execution is serialized. Only a workspace copy or cleanup failure aborts
//! the experiment; everything else becomes a failed run result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::classify::{DefaultReasonClassifier, MISSING_REPO};
use crate::context::{ContextResolver, FailedSession, ResolverFactory};
use crate::executor::{
    DEFAULT_WORKSPACE_EXCLUDE, ExecutorOptions, RunRequest, RunResult, execute_task,
};
use crate::gate::GateThresholds;
use crate::log::{ExecutionLog, LogEvent};
use crate::paths::EnvMap;
use crate::report::{ExperimentReport, analyze};
use crate::selection::{HistoryIndex, SelectionOptions, select_ab_tasks_for_execution};
use crate::stats::SignificanceOptions;
use crate::task::{TaskSpec, WorkerType, distinct_workers};

/// Configuration for one experiment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding one subdirectory per repository, named as in the catalog.
    pub repos_root: PathBuf,
    /// Root of the per-run artifact directories.
    pub artifact_root: PathBuf,
    /// Worker types to run for every task, in order.
    pub worker_types: Vec<WorkerType>,
    pub selection: SelectionOptions,
    pub executor: ExecutorOptions,
    /// Top-level names skipped when copying a repository into a workspace.
    pub workspace_exclude: Vec<String>,
    pub thresholds: GateThresholds,
    pub significance: SignificanceOptions,
    /// Environment captured once at startup.
    pub env: EnvMap,
}

impl OrchestratorConfig {
    pub fn new(repos_root: PathBuf, artifact_root: PathBuf, env: EnvMap) -> Self {
        Self {
            repos_root,
            artifact_root,
            worker_types: vec![WorkerType::Control, WorkerType::Treatment],
            selection: SelectionOptions::default(),
            executor: ExecutorOptions::default(),
            workspace_exclude: DEFAULT_WORKSPACE_EXCLUDE
                .iter()
                .map(|s| s.to_string())
                .collect(),
            thresholds: GateThresholds::default(),
            significance: SignificanceOptions::default(),
            env,
        }
    }
}

/// Artifact directory for one run: `<root>/<task_id>/<worker>-<suffix>`.
pub fn run_artifact_dir(root: &Path, task_id: &str, worker: WorkerType, run_id: &str) -> PathBuf {
    let suffix: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    root.join(task_id).join(format!("{}-{suffix}", worker.as_str()))
}

/// Copy `src` into `dst`, skipping any entry whose relative path starts with
/// an excluded component (`.git`, `node_modules`, ...). Symlinks are not followed.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[String]) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create workspace {}", dst.display()))?;
    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        let Ok(rel) = entry.path().strip_prefix(src) else {
            return true;
        };
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked outside the source tree")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Per-repository resolver sessions, opened lazily.
struct SessionCache<'f> {
    factory: Option<&'f dyn ResolverFactory>,
    sessions: HashMap<String, Arc<dyn ContextResolver>>,
}

impl<'f> SessionCache<'f> {
    fn new(factory: Option<&'f dyn ResolverFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
        }
    }

    /// The session for `repo`. A failure to open is cached as a failing
    /// session so every treatment run against the repo still classifies it.
    async fn get(&mut self, repo: &str, repo_root: &Path) -> Option<Arc<dyn ContextResolver>> {
        let factory = self.factory?;
        if let Some(session) = self.sessions.get(repo) {
            return Some(Arc::clone(session));
        }
        let session: Arc<dyn ContextResolver> = match factory.open_session(repo, repo_root).await {
            Ok(session) => session,
            Err(e) => {
                warn!(repo, error = %e, "failed to open context resolver session");
                Arc::new(FailedSession::new(format!("{e:#}")))
            }
        };
        self.sessions.insert(repo.to_string(), Arc::clone(&session));
        Some(session)
    }

    async fn shutdown(self) {
        for (repo, session) in self.sessions {
            if let Err(e) = session.shutdown().await {
                warn!(repo = %repo, error = %e, "context resolver shutdown failed");
            }
        }
    }
}

fn log_event(log: Option<&ExecutionLog>, event: LogEvent) {
    let Some(log) = log else {
        return;
    };
    if let Err(e) = log.log(event) {
        warn!(error = %e, "failed to write execution log");
    }
}

fn log_run(log: Option<&ExecutionLog>, result: &RunResult) {
    let phases = result
        .setup
        .iter()
        .chain(result.baseline.iter())
        .chain(result.verification.iter().flat_map(|v| v.phases()));
    for phase in phases.filter(|p| p.attempted) {
        log_event(
            log,
            LogEvent::PhaseFinished {
                task_id: result.task_id.clone(),
                worker: result.worker_type,
                phase: phase.phase.as_str().to_string(),
                passed: phase.passed,
                commands: phase.commands.len(),
            },
        );
    }
    log_event(
        log,
        LogEvent::RunFinished {
            task_id: result.task_id.clone(),
            worker: result.worker_type,
            success: result.success,
            failure_reason: result.failure_reason.clone(),
            duration_ms: result.duration_ms,
        },
    );
}

/// Execute one (task, worker) pair in its own workspace copy.
async fn run_one(
    config: &OrchestratorConfig,
    task: &TaskSpec,
    worker: WorkerType,
    run_id: &str,
    sessions: &mut SessionCache<'_>,
) -> Result<RunResult> {
    let artifact_dir = run_artifact_dir(&config.artifact_root, &task.id, worker, run_id);
    let repo_root = config.repos_root.join(&task.repo);
    if !repo_root.is_dir() {
        warn!(task_id = %task.id, repo = %task.repo, "repository not found");
        return Ok(RunResult::infrastructure_failure(
            task,
            worker,
            MISSING_REPO,
            &artifact_dir,
        ));
    }

    let session = match worker {
        WorkerType::Treatment => sessions.get(&task.repo, &repo_root).await,
        WorkerType::Control => None,
    };

    let tmp = tempfile::Builder::new()
        .prefix("ab-harness-")
        .tempdir()
        .context("failed to create temporary workspace")?;
    let workspace = tmp.path().join(&task.repo);
    copy_dir_filtered(&repo_root, &workspace, &config.workspace_exclude)
        .with_context(|| format!("failed to prepare workspace for task '{}'", task.id))?;
    debug!(task_id = %task.id, worker = %worker, workspace = %workspace.display(), "workspace ready");

    let result = execute_task(&RunRequest {
        task,
        worker,
        workspace: &workspace,
        artifact_dir,
        options: &config.executor,
        env: &config.env,
        resolver: session.as_deref(),
    })
    .await;

    tmp.close()
        .with_context(|| format!("failed to remove workspace for task '{}'", task.id))?;
    Ok(result)
}

async fn run_all(
    config: &OrchestratorConfig,
    workers: &[WorkerType],
    selected: &[&TaskSpec],
    run_id: &str,
    sessions: &mut SessionCache<'_>,
    log: Option<&ExecutionLog>,
) -> Result<Vec<RunResult>> {
    let mut results = Vec::with_capacity(selected.len() * workers.len());
    for task in selected {
        for &worker in workers {
            info!(task_id = %task.id, worker = %worker, complexity = %task.complexity, "run started");
            log_event(
                log,
                LogEvent::RunStarted {
                    task_id: task.id.clone(),
                    worker,
                },
            );
            let result = run_one(config, task, worker, run_id, sessions).await?;
            log_run(log, &result);
            results.push(result);
        }
    }
    Ok(results)
}

/// Run the experiment over `tasks` and produce its report.
///
/// Resolver sessions are shut down on every exit path, including a fatal
/// workspace error.
pub async fn run_experiment(
    config: &OrchestratorConfig,
    tasks: &[TaskSpec],
    history: &HistoryIndex,
    factory: Option<&dyn ResolverFactory>,
    log: Option<&ExecutionLog>,
) -> Result<ExperimentReport> {
    // Repeated arms would share an artifact directory.
    let workers = distinct_workers(&config.worker_types);
    if workers.is_empty() {
        bail!("no worker types configured");
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();

    let scored = select_ab_tasks_for_execution(tasks, history, &config.selection);
    let selected: Vec<&TaskSpec> = scored.iter().map(|s| s.task).collect();
    let selected_task_ids: Vec<String> = selected.iter().map(|t| t.id.clone()).collect();
    info!(
        run_id = %run_id,
        mode = %config.selection.mode,
        available = tasks.len(),
        selected = selected.len(),
        "experiment started"
    );
    log_event(
        log,
        LogEvent::ExperimentStarted {
            run_id: run_id.clone(),
            task_count: selected.len(),
            worker_types: workers.clone(),
        },
    );
    log_event(
        log,
        LogEvent::TasksSelected {
            mode: config.selection.mode.to_string(),
            task_ids: selected_task_ids.clone(),
        },
    );

    let mut sessions = SessionCache::new(factory);
    let outcome = run_all(config, &workers, &selected, &run_id, &mut sessions, log).await;
    sessions.shutdown().await;
    let results = outcome?;

    let analysis = analyze(
        &results,
        &config.thresholds,
        config.significance,
        &DefaultReasonClassifier,
    );
    log_event(
        log,
        LogEvent::GateEvaluated {
            passed: analysis.gate.passed,
            reasons: analysis.gate.reasons.clone(),
        },
    );

    Ok(ExperimentReport {
        run_id,
        started_at,
        completed_at: Utc::now(),
        selection_mode: config.selection.mode,
        selected_task_ids,
        worker_types: workers,
        results,
        analysis,
    })
}
