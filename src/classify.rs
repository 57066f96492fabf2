//! Data-driven failure classification.
//!
//! Three rule tables live here, each independent of the executor so they can
//! be tested and extended on their own:
//! - command output → [`FailureKind`] (timeout / missing tool / provider
//!   unavailable / generic failure)
//! - context-resolver error text → librarian reason code
//! - run failure reason → critical or not, for the release gate
//!
//! plus the default severity/category [`ReasonClassifier`] used when
//! reporting gate reasons.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::supervisor::CommandResult;

pub const BASELINE_REQUIRED_BUT_MISSING: &str = "baseline_required_but_missing";
pub const BASELINE_EXPECTED_FAILURE_MISSING: &str = "baseline_expected_failure_missing";
pub const NO_TARGET_FILE_MODIFIED: &str = "no_target_file_modified";
pub const MISSING_CONTEXT_AFTER_LIBRARIAN: &str = "missing_context_after_librarian";
pub const LIBRARIAN_CONTEXT_UNAVAILABLE: &str = "librarian_context_unavailable";
pub const LIBRARIAN_PROVIDER_UNAVAILABLE: &str = "librarian_provider_unavailable";
pub const AGENT_COMMAND_MISSING: &str = "agent_command_missing";
pub const AGENT_COMMAND_ENV_MISSING: &str = "agent_command_env_missing";
pub const ARTIFACT_INCOMPLETE: &str = "artifact_incomplete";
pub const ARTIFACT_WRITE_FAILED: &str = "artifact_write_failed";
pub const EDIT_NOT_FOUND: &str = "edit_not_found";
pub const EDIT_FILE_MISSING: &str = "edit_file_missing";
pub const MISSING_REPO: &str = "missing_repo";
pub const CLONE_FAILED: &str = "clone_failed";
pub const CHECKOUT_FAILED: &str = "checkout_failed";

/// Coarse cause of a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Missing,
    ProviderUnavailable,
    Failed,
}

impl FailureKind {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Missing => "missing",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Failed => "failed",
        }
    }
}

/// Which harness stage a failing command belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStage {
    Setup,
    Baseline,
    Agent,
    Verification,
}

impl CommandStage {
    fn prefix(self) -> &'static str {
        match self {
            Self::Setup => "setup_command",
            Self::Baseline => "baseline_command",
            Self::Agent => "agent_command",
            Self::Verification => "verification_command",
        }
    }
}

/// Stable reason code such as `setup_command_timeout`.
pub fn failure_code(stage: CommandStage, kind: FailureKind) -> String {
    format!("{}_{}", stage.prefix(), kind.suffix())
}

struct OutputRule {
    pattern: Regex,
    kind: FailureKind,
    /// Stages whose output this rule may inspect.
    stages: &'static [CommandStage],
}

const ALL_STAGES: &[CommandStage] = &[
    CommandStage::Setup,
    CommandStage::Baseline,
    CommandStage::Agent,
    CommandStage::Verification,
];

/// Ordered output patterns; the first match wins.
pub struct OutputClassifier {
    rules: Vec<OutputRule>,
}

impl OutputClassifier {
    pub fn default_rules() -> Self {
        Self {
            rules: vec![
                // Provider error shapes. Only the agent talks to a provider;
                // project output mentioning billing or a 429 is a test failure.
                OutputRule {
                    pattern: Regex::new(r"(?i)rate[ _-]?limit(?:ed| exceeded| reached|_error)|too many requests|insufficient[_ ]quota|quota exceeded|credit balance is too low|billing (?:hard limit|issue|error)|invalid[ _]api[ _-]?key|api[ _-]?key (?:not set|missing|invalid)|overloaded_error|provider unavailable").unwrap(),
                    kind: FailureKind::ProviderUnavailable,
                    stages: &[CommandStage::Agent],
                },
                // Shell "command not found" in its sh/bash/zsh/cmd spellings
                OutputRule {
                    pattern: Regex::new(r"(?i)command not found|: not found|is not recognized as an internal or external command|no such file or directory.*(?:exec|spawn)|ENOENT").unwrap(),
                    kind: FailureKind::Missing,
                    stages: ALL_STAGES,
                },
            ],
        }
    }

    /// Classify a failed command from `stage`. Timeouts and unspawnable
    /// commands are decided from the result flags before any text is
    /// inspected.
    pub fn classify(&self, stage: CommandStage, result: &CommandResult) -> FailureKind {
        if result.timed_out {
            return FailureKind::Timeout;
        }
        if result.spawn_error.is_some() {
            return FailureKind::Missing;
        }
        let output = result.combined_output();
        for rule in &self.rules {
            if rule.stages.contains(&stage) && rule.pattern.is_match(&output) {
                return rule.kind;
            }
        }
        match result.exit_code {
            Some(126) | Some(127) => FailureKind::Missing,
            _ => FailureKind::Failed,
        }
    }
}

static OUTPUT_RULES: LazyLock<OutputClassifier> = LazyLock::new(OutputClassifier::default_rules);

/// Classify with the default rule table.
pub fn classify_command(stage: CommandStage, result: &CommandResult) -> FailureKind {
    OUTPUT_RULES.classify(stage, result)
}

static PROVIDER_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|api[ _-]?key|quota|billing|unauthorized|\b40[13]\b|\b429\b|provider[ _](?:unavailable|error)|overloaded").unwrap()
});

/// Map a context-resolver error message to a librarian reason code.
///
/// Provider-side trouble (credentials, quota, rate limits) is kept separate
/// from an index that simply has nothing to offer (`empty_storage`, no
/// matches), since only the former is an infrastructure problem.
pub fn classify_resolver_error(message: &str) -> &'static str {
    if PROVIDER_ERROR_RE.is_match(message) {
        LIBRARIAN_PROVIDER_UNAVAILABLE
    } else {
        LIBRARIAN_CONTEXT_UNAVAILABLE
    }
}

const CRITICAL_PREFIXES: &[&str] = &[
    "agent_command_provider_unavailable",
    "agent_command_missing",
    "agent_command_env_missing",
    "librarian_provider_unavailable",
    "setup_command_missing",
    "baseline_command_missing",
    "verification_command_missing",
    "baseline_required_but_missing",
    "baseline_expected_failure_missing",
    "artifact_incomplete",
    "artifact_write_failed",
    "missing_repo",
    "clone_failed",
    "checkout_failed",
];

const CRITICAL_SUBSTRINGS: &[&str] = &["provider_unavailable", "_env_missing"];

/// Whether a run failure reason should, in aggregate, block a release.
pub fn is_critical_failure_reason(reason: &str) -> bool {
    CRITICAL_PREFIXES.iter().any(|p| reason.starts_with(p))
        || CRITICAL_SUBSTRINGS.iter().any(|s| reason.contains(s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    Lift,
    Significance,
    SampleSize,
    Ceiling,
    Diagnostics,
    Integrity,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedReason {
    pub reason: String,
    pub severity: Severity,
    pub category: ReasonCategory,
}

/// Assigns severity and category to gate reasons for reporting.
pub trait ReasonClassifier {
    fn classify(&self, reason: &str) -> ClassifiedReason;
}

/// Prefix table covering every reason the gate emits.
pub struct DefaultReasonClassifier;

const REASON_TABLE: &[(&str, Severity, ReasonCategory)] = &[
    ("critical_failures_present", Severity::Critical, ReasonCategory::Infrastructure),
    ("artifact_integrity_share", Severity::Critical, ReasonCategory::Integrity),
    ("verified_execution_share", Severity::Major, ReasonCategory::Diagnostics),
    ("agent_command_share", Severity::Major, ReasonCategory::Diagnostics),
    ("fallback_share", Severity::Major, ReasonCategory::Diagnostics),
    ("success_ceiling_", Severity::Major, ReasonCategory::Ceiling),
    ("t3_plus_lift", Severity::Major, ReasonCategory::Lift),
    ("t3_plus_not_significant", Severity::Major, ReasonCategory::Significance),
    ("t3_plus_significance_inconclusive", Severity::Minor, ReasonCategory::Significance),
    ("insufficient_samples", Severity::Minor, ReasonCategory::SampleSize),
];

impl ReasonClassifier for DefaultReasonClassifier {
    fn classify(&self, reason: &str) -> ClassifiedReason {
        let (severity, category) = REASON_TABLE
            .iter()
            .find(|(prefix, _, _)| reason.starts_with(prefix))
            .map(|(_, s, c)| (*s, *c))
            .unwrap_or((Severity::Major, ReasonCategory::Diagnostics));
        ClassifiedReason {
            reason: reason.to_string(),
            severity,
            category,
        }
    }
}
