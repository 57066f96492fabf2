//! Per-run artifact files.
//!
//! Every run writes a fixed set of JSON documents under
//! `<artifact_root>/<task_id>/<worker>-<suffix>/`. Each [`ArtifactKey`] is
//! bound to exactly one payload type through [`ArtifactRecord`], and the
//! integrity check reads the directory back instead of trusting the writer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::supervisor::CommandResult;
use crate::task::TaskSpec;
use crate::verification::{PhaseResult, VerificationOutcome};

use super::RunResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKey {
    Task,
    Context,
    Setup,
    Baseline,
    Verification,
    Prompt,
    AgentCommand,
    AgentCommandResult,
    Result,
}

impl ArtifactKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Context => "context",
            Self::Setup => "setup",
            Self::Baseline => "baseline",
            Self::Verification => "verification",
            Self::Prompt => "prompt",
            Self::AgentCommand => "agent_command",
            Self::AgentCommandResult => "agent_command_result",
            Self::Result => "result",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.json", self.as_str())
    }
}

/// What the run showed the agent, and where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub level: u8,
    pub base_files: Vec<String>,
    /// Paths as the resolver returned them, before filtering.
    #[serde(default)]
    pub resolver_candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_error: Option<String>,
    pub extra_files: Vec<String>,
    /// Targets added back because the resolver omitted them.
    #[serde(default)]
    pub recovered_targets: Vec<String>,
    #[serde(default)]
    pub missing_targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArtifact {
    /// Plain-text copy handed to the agent.
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommandArtifact {
    pub template: String,
    /// `None` when the template could not be rendered.
    pub rendered: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_env: Vec<String>,
    pub timeout_ms: u64,
    /// Budget advertised to the agent, below the hard timeout.
    pub inner_timeout_ms: u64,
}

/// A payload paired with the key it is stored under.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ArtifactRecord<'a> {
    Task(&'a TaskSpec),
    Context(&'a ContextSnapshot),
    Setup(&'a PhaseResult),
    Baseline(&'a PhaseResult),
    Verification(&'a VerificationOutcome),
    Prompt(&'a PromptArtifact),
    AgentCommand(&'a AgentCommandArtifact),
    AgentCommandResult(&'a CommandResult),
    Result(&'a RunResult),
}

impl ArtifactRecord<'_> {
    pub fn key(&self) -> ArtifactKey {
        match self {
            Self::Task(_) => ArtifactKey::Task,
            Self::Context(_) => ArtifactKey::Context,
            Self::Setup(_) => ArtifactKey::Setup,
            Self::Baseline(_) => ArtifactKey::Baseline,
            Self::Verification(_) => ArtifactKey::Verification,
            Self::Prompt(_) => ArtifactKey::Prompt,
            Self::AgentCommand(_) => ArtifactKey::AgentCommand,
            Self::AgentCommandResult(_) => ArtifactKey::AgentCommandResult,
            Self::Result(_) => ArtifactKey::Result,
        }
    }
}

/// Audit of a run's artifact directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIntegrity {
    pub dir: String,
    pub required: Vec<ArtifactKey>,
    pub present: Vec<ArtifactKey>,
    pub missing: Vec<ArtifactKey>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_errors: Vec<String>,
}

/// Write to a sibling temp file, then rename into place.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = path.with_file_name(format!(".{name}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Writes one run's artifacts and remembers what failed.
pub struct ArtifactWriter {
    dir: PathBuf,
    init_error: Option<String>,
    write_errors: Vec<String>,
}

impl ArtifactWriter {
    /// Create the run directory. A failure is recorded, not returned, so the
    /// executor can still produce a result describing it.
    pub fn create(dir: PathBuf) -> Self {
        let init_error = std::fs::create_dir_all(&dir)
            .err()
            .map(|e| format!("failed to create artifact dir {}: {e}", dir.display()));
        if let Some(err) = &init_error {
            warn!(error = %err, "artifact directory unavailable");
        }
        Self {
            dir,
            init_error,
            write_errors: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn path(&self, key: ArtifactKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Serialize and write a record. Returns whether the write succeeded.
    pub fn write(&mut self, record: ArtifactRecord<'_>) -> bool {
        let key = record.key();
        let result = serde_json::to_vec_pretty(&record)
            .map_err(std::io::Error::other)
            .and_then(|bytes| atomic_write(&self.path(key), &bytes));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(artifact = key.as_str(), error = %e, "artifact write failed");
                self.write_errors.push(format!("{}: {e}", key.as_str()));
                false
            }
        }
    }

    /// Write a non-JSON side file (such as the prompt text) into the run directory.
    pub fn write_text(&mut self, name: &str, text: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        match atomic_write(&path, text.as_bytes()) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(file = name, error = %e, "artifact write failed");
                self.write_errors.push(format!("{name}: {e}"));
                None
            }
        }
    }

    /// Check which required keys exist on disk right now.
    pub fn integrity(&self, required: &BTreeSet<ArtifactKey>) -> ArtifactIntegrity {
        check_integrity(&self.dir, required, &self.write_errors)
    }
}

/// Compare `required` with the files actually present in `dir`.
pub fn check_integrity(
    dir: &Path,
    required: &BTreeSet<ArtifactKey>,
    write_errors: &[String],
) -> ArtifactIntegrity {
    let (present, missing): (Vec<ArtifactKey>, Vec<ArtifactKey>) = required
        .iter()
        .copied()
        .partition(|key| dir.join(key.file_name()).is_file());
    ArtifactIntegrity {
        dir: dir.to_string_lossy().to_string(),
        required: required.iter().copied().collect(),
        complete: missing.is_empty(),
        present,
        missing,
        write_errors: write_errors.to_vec(),
    }
}
