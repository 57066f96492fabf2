//! Verification pipeline: command-gated completion.
//!
//! Phases run in a fixed order: setup → baseline → tests → typecheck → build.
//! Each phase is an ordered command list that stops at the first failing or
//! timed-out command. Setup and baseline are up-front gates owned by the
//! executor; [`run_pipeline`] covers the post-change phases and stops at the
//! first phase that fails, leaving later phases unattempted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::paths::EnvMap;
use crate::supervisor::{CommandResult, CommandSpec, run_command};
use crate::task::VerificationSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Baseline,
    Tests,
    Typecheck,
    Build,
}

impl Phase {
    pub const POST_CHANGE: [Phase; 3] = [Self::Tests, Self::Typecheck, Self::Build];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Baseline => "baseline",
            Self::Tests => "tests",
            Self::Typecheck => "typecheck",
            Self::Build => "build",
        }
    }

    pub fn commands(self, spec: &VerificationSpec) -> &[String] {
        match self {
            Self::Setup => &spec.setup,
            Self::Baseline => &spec.baseline,
            Self::Tests => &spec.tests,
            Self::Typecheck => &spec.typecheck,
            Self::Build => &spec.build,
        }
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    /// Every configured command ran and passed. Vacuously true when none are configured.
    pub passed: bool,
    /// The phase was reached and started.
    pub attempted: bool,
    /// Number of commands configured for the phase.
    pub configured: usize,
    /// Results for the commands that actually ran, in order.
    pub commands: Vec<CommandResult>,
}

impl PhaseResult {
    fn skipped(phase: Phase, configured: usize) -> Self {
        Self {
            phase,
            passed: false,
            attempted: false,
            configured,
            commands: Vec::new(),
        }
    }

    /// The command that stopped the phase, if any.
    pub fn failing_command(&self) -> Option<&CommandResult> {
        self.commands.iter().find(|c| !c.passed())
    }
}

/// Where and how phase commands run.
#[derive(Debug, Clone)]
pub struct PhaseContext<'a> {
    pub work_dir: &'a Path,
    pub env: &'a EnvMap,
    pub command_timeout: Duration,
}

/// Run one phase, stopping at the first failing command.
pub async fn run_phase(phase: Phase, commands: &[String], ctx: &PhaseContext<'_>) -> PhaseResult {
    let mut results = Vec::with_capacity(commands.len());
    let mut passed = true;

    for command in commands {
        info!(phase = phase.as_str(), command = %command, "running verification command");
        let result = run_command(&CommandSpec {
            command,
            cwd: ctx.work_dir,
            env: ctx.env,
            timeout: ctx.command_timeout,
        })
        .await;

        let ok = result.passed();
        debug!(
            phase = phase.as_str(),
            passed = ok,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            "verification command finished"
        );
        results.push(result);
        if !ok {
            warn!(phase = phase.as_str(), command = %command, "phase failed");
            passed = false;
            break;
        }
    }

    PhaseResult {
        phase,
        passed,
        attempted: true,
        configured: commands.len(),
        commands: results,
    }
}

/// Outcome of the post-change phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub success: bool,
    pub failed_phase: Option<Phase>,
    pub tests: PhaseResult,
    pub typecheck: PhaseResult,
    pub build: PhaseResult,
}

impl VerificationOutcome {
    pub fn phases(&self) -> [&PhaseResult; 3] {
        [&self.tests, &self.typecheck, &self.build]
    }

    /// Commands that actually executed across all phases.
    pub fn executed_command_count(&self) -> usize {
        self.phases().iter().map(|p| p.commands.len()).sum()
    }

    /// The command that failed verification, if any.
    pub fn failing_command(&self) -> Option<&CommandResult> {
        self.phases().into_iter().find_map(|p| p.failing_command())
    }
}

async fn run_unless_failed(
    phase: Phase,
    spec: &VerificationSpec,
    ctx: &PhaseContext<'_>,
    failed_phase: &mut Option<Phase>,
) -> PhaseResult {
    let commands = phase.commands(spec);
    if failed_phase.is_some() {
        return PhaseResult::skipped(phase, commands.len());
    }
    let result = run_phase(phase, commands, ctx).await;
    if !result.passed {
        *failed_phase = Some(phase);
    }
    result
}

/// Run tests → typecheck → build, stopping at the first failing phase.
pub async fn run_pipeline(spec: &VerificationSpec, ctx: &PhaseContext<'_>) -> VerificationOutcome {
    let mut failed_phase = None;
    let tests = run_unless_failed(Phase::Tests, spec, ctx, &mut failed_phase).await;
    let typecheck = run_unless_failed(Phase::Typecheck, spec, ctx, &mut failed_phase).await;
    let build = run_unless_failed(Phase::Build, spec, ctx, &mut failed_phase).await;

    VerificationOutcome {
        success: failed_phase.is_none(),
        failed_phase,
        tests,
        typecheck,
        build,
    }
}
