//! Boundary with the retrieval subsystem.
//!
//! The harness only needs `resolve_extra_context(request) -> paths`. A
//! [`ResolverFactory`] opens one session per repository; the orchestrator
//! caches sessions for the length of an experiment and shuts them down at
//! the end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tracing::debug;

use crate::paths::{EnvMap, render_template, shell_quote};
use crate::supervisor::{CommandSpec, run_command};
use crate::task::TaskSpec;

/// What the resolver is asked for.
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub task: &'a TaskSpec,
    /// Workspace copy the treatment run operates on.
    pub repo_root: &'a Path,
    pub context_level: u8,
    /// Base context already selected for the run.
    pub context_files: &'a [String],
}

/// A per-repository retrieval session.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    /// Repository-relative candidate paths for the request.
    async fn resolve_extra_context(&self, request: &ContextRequest<'_>) -> Result<Vec<String>>;

    /// Release the session. Failures are reported but never fatal.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens resolver sessions.
#[async_trait]
pub trait ResolverFactory: Send + Sync {
    async fn open_session(&self, repo: &str, repo_root: &Path) -> Result<Arc<dyn ContextResolver>>;
}

/// Stand-in session for a repository whose session could not be opened.
/// Every request fails with the original error text so it still classifies.
pub struct FailedSession {
    message: String,
}

impl FailedSession {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ContextResolver for FailedSession {
    async fn resolve_extra_context(&self, _request: &ContextRequest<'_>) -> Result<Vec<String>> {
        Err(anyhow!("resolver session unavailable: {}", self.message))
    }
}

/// Resolver backed by an external command.
///
/// The command template accepts `{{REPO_ROOT}}`, `{{SOURCE_ROOT}}`,
/// `{{TASK_ID}}`, `{{CONTEXT_LEVEL}}`, `{{DESCRIPTION}}` and
/// `{{TARGET_FILES}}` (comma-separated). Its stdout must be a JSON array of
/// paths or one path per line.
pub struct CommandResolverFactory {
    pub command: String,
    pub timeout: Duration,
    pub env: EnvMap,
}

struct CommandSession {
    command: String,
    source_root: PathBuf,
    timeout: Duration,
    env: EnvMap,
}

#[async_trait]
impl ResolverFactory for CommandResolverFactory {
    async fn open_session(&self, repo: &str, repo_root: &Path) -> Result<Arc<dyn ContextResolver>> {
        if !repo_root.is_dir() {
            bail!("repository '{repo}' not found at {}", repo_root.display());
        }
        debug!(repo, root = %repo_root.display(), "opened command resolver session");
        Ok(Arc::new(CommandSession {
            command: self.command.clone(),
            source_root: repo_root.to_path_buf(),
            timeout: self.timeout,
            env: self.env.clone(),
        }))
    }
}

#[async_trait]
impl ContextResolver for CommandSession {
    async fn resolve_extra_context(&self, request: &ContextRequest<'_>) -> Result<Vec<String>> {
        let mut tokens = BTreeMap::new();
        tokens.insert("REPO_ROOT", shell_quote(&request.repo_root.to_string_lossy()));
        tokens.insert("SOURCE_ROOT", shell_quote(&self.source_root.to_string_lossy()));
        tokens.insert("TASK_ID", shell_quote(&request.task.id));
        tokens.insert("CONTEXT_LEVEL", request.context_level.to_string());
        tokens.insert("DESCRIPTION", shell_quote(&request.task.description));
        tokens.insert("TARGET_FILES", shell_quote(&request.task.target_files.join(",")));
        let command = render_template(&self.command, &tokens);

        let result = run_command(&CommandSpec {
            command: &command,
            cwd: request.repo_root,
            env: &self.env,
            timeout: self.timeout,
        })
        .await;

        if result.timed_out {
            bail!("context resolver timed out after {}ms", self.timeout.as_millis());
        }
        if !result.passed() {
            bail!(
                "context resolver exited with {:?}: {}",
                result.exit_code,
                result.combined_output().trim()
            );
        }
        Ok(parse_resolver_output(&result.stdout))
    }
}

/// Accept a JSON array of strings, or fall back to one path per line.
pub fn parse_resolver_output(stdout: &str) -> Vec<String> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('[') {
        if let Ok(paths) = serde_json::from_str::<Vec<String>>(trimmed) {
            return paths;
        }
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
