//! Release gate.
//!
//! Turns statistics and run diagnostics into an ordered list of violated
//! thresholds. An empty list passes. Reasons are stable strings with the
//! offending values appended after a `:` so they can be grouped by prefix.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify::{ClassifiedReason, ReasonClassifier, is_critical_failure_reason};
use crate::executor::RunResult;
use crate::stats::{GroupStats, LiftSummary, ratio};

/// Absolute tolerance on the delta for the success-ceiling predicate.
pub const CEILING_DELTA_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    /// Minimum absolute success-rate delta on the T3+ slice.
    pub min_t3_success_lift: f64,
    pub require_t3_significance: bool,
    pub min_samples_per_group: usize,
    /// Both arms at or above this rate count as saturated.
    pub ceiling_rate: f64,
    /// Required time reduction when saturated.
    pub ceiling_min_time_reduction: f64,
    pub min_agent_command_share: f64,
    pub min_verified_execution_share: f64,
    pub min_artifact_integrity_share: f64,
    pub max_fallback_share: f64,
    pub require_no_critical_failures: bool,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_t3_success_lift: 0.05,
            require_t3_significance: false,
            min_samples_per_group: 5,
            ceiling_rate: 0.999,
            ceiling_min_time_reduction: 0.1,
            min_agent_command_share: 0.0,
            min_verified_execution_share: 0.0,
            min_artifact_integrity_share: 1.0,
            max_fallback_share: 0.0,
            require_no_critical_failures: true,
        }
    }
}

/// Execution-quality shares over every run of the experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub total_runs: usize,
    /// Runs where an agent command actually executed.
    pub agent_command_share: f64,
    /// Runs where verification executed at least one command.
    pub verified_execution_share: f64,
    pub artifact_integrity_share: f64,
    pub fallback_share: f64,
    pub critical_failure_count: usize,
    pub critical_failures: BTreeMap<String, usize>,
}

pub fn diagnostics(results: &[RunResult]) -> Diagnostics {
    let total = results.len();
    let count = |pred: fn(&RunResult) -> bool| results.iter().filter(|r| pred(r)).count();

    let mut critical_failures = BTreeMap::new();
    for reason in results.iter().filter_map(|r| r.failure_reason.as_deref()) {
        if is_critical_failure_reason(reason) {
            *critical_failures.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    Diagnostics {
        total_runs: total,
        agent_command_share: ratio(count(|r| r.agent_command_executed), total),
        verified_execution_share: ratio(count(RunResult::verified_execution), total),
        artifact_integrity_share: ratio(count(|r| r.artifacts.complete), total),
        fallback_share: ratio(count(|r| r.policy.edit_fallback_used), total),
        critical_failure_count: critical_failures.values().sum(),
        critical_failures,
    }
}

/// What the gate looks at: the T3+ slice and experiment-wide diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub control: &'a GroupStats,
    pub treatment: &'a GroupStats,
    pub lift: &'a LiftSummary,
    pub diagnostics: &'a Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    /// The saturated-success branch was evaluated instead of the lift branch.
    pub success_ceiling: bool,
    pub reasons: Vec<String>,
    pub classified: Vec<ClassifiedReason>,
}

/// Both arms saturated with no measurable difference.
pub fn is_success_ceiling(lift: &LiftSummary, ceiling_rate: f64) -> bool {
    lift.control_success_rate >= ceiling_rate
        && lift.treatment_success_rate >= ceiling_rate
        && lift.absolute_success_rate_delta.abs() < CEILING_DELTA_EPSILON
}

/// Ordered violated-threshold reasons. Empty means the gate passes.
pub fn gate_reasons(input: &GateInput<'_>, thresholds: &GateThresholds) -> Vec<String> {
    let mut reasons = Vec::new();
    let diag = input.diagnostics;

    if thresholds.require_no_critical_failures && diag.critical_failure_count > 0 {
        reasons.push(format!("critical_failures_present:{}", diag.critical_failure_count));
    }
    if diag.artifact_integrity_share < thresholds.min_artifact_integrity_share {
        reasons.push(format!(
            "artifact_integrity_share_below_threshold:{:.3}<{:.3}",
            diag.artifact_integrity_share, thresholds.min_artifact_integrity_share
        ));
    }
    if diag.verified_execution_share < thresholds.min_verified_execution_share {
        reasons.push(format!(
            "verified_execution_share_below_threshold:{:.3}<{:.3}",
            diag.verified_execution_share, thresholds.min_verified_execution_share
        ));
    }
    if diag.agent_command_share < thresholds.min_agent_command_share {
        reasons.push(format!(
            "agent_command_share_below_threshold:{:.3}<{:.3}",
            diag.agent_command_share, thresholds.min_agent_command_share
        ));
    }
    if diag.fallback_share > thresholds.max_fallback_share {
        reasons.push(format!(
            "fallback_share_above_threshold:{:.3}>{:.3}",
            diag.fallback_share, thresholds.max_fallback_share
        ));
    }

    let min = thresholds.min_samples_per_group;
    let (control_n, treatment_n) = (input.control.count, input.treatment.count);
    let lift = input.lift;

    if is_success_ceiling(lift, thresholds.ceiling_rate) {
        if control_n < min || treatment_n < min {
            reasons.push(format!(
                "success_ceiling_insufficient_samples:control={control_n},treatment={treatment_n},min={min}"
            ));
        }
        if lift.time_reduction < thresholds.ceiling_min_time_reduction {
            reasons.push(format!(
                "success_ceiling_time_reduction_below_threshold:{:.3}<{:.3}",
                lift.time_reduction, thresholds.ceiling_min_time_reduction
            ));
        }
        return reasons;
    }

    if control_n < min || treatment_n < min {
        reasons.push(format!(
            "insufficient_samples:control={control_n},treatment={treatment_n},min={min}"
        ));
    }
    if lift.absolute_success_rate_delta < thresholds.min_t3_success_lift {
        reasons.push(format!(
            "t3_plus_lift_below_threshold:{:.3}<{:.3}",
            lift.absolute_success_rate_delta, thresholds.min_t3_success_lift
        ));
    }
    if thresholds.require_t3_significance {
        let sig = &lift.significance;
        match (sig.significant, sig.inconclusive_reason) {
            (Some(true), _) => {}
            (Some(false), _) => reasons.push(format!(
                "t3_plus_not_significant:p={:.4}",
                sig.p_value.unwrap_or(1.0)
            )),
            (None, reason) => reasons.push(format!(
                "t3_plus_significance_inconclusive:{}",
                reason.map(|r| r.as_str()).unwrap_or("unknown")
            )),
        }
    }
    reasons
}

/// Evaluate the gate and classify its reasons for reporting.
pub fn evaluate_gate(
    input: &GateInput<'_>,
    thresholds: &GateThresholds,
    classifier: &dyn ReasonClassifier,
) -> GateResult {
    let reasons = gate_reasons(input, thresholds);
    let classified = reasons.iter().map(|r| classifier.classify(r)).collect();
    let result = GateResult {
        passed: reasons.is_empty(),
        success_ceiling: is_success_ceiling(input.lift, thresholds.ceiling_rate),
        reasons,
        classified,
    };
    info!(
        passed = result.passed,
        ceiling = result.success_ceiling,
        reasons = result.reasons.len(),
        "gate evaluated"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{DefaultReasonClassifier, Severity};
    use crate::executor::PolicySnapshot;
    use crate::executor::artifacts::ArtifactIntegrity;
    use crate::stats::{SignificanceOptions, group_stats, lift_summary};
    use crate::task::{Complexity, WorkerType};

    fn run(worker: WorkerType, success: bool, ms: u64) -> RunResult {
        RunResult {
            task_id: "t".into(),
            repo: "r".into(),
            complexity: Complexity::T3,
            worker_type: worker,
            mode: "deterministic_edit".into(),
            success,
            duration_ms: ms,
            failure_reason: (!success).then(|| "verification_command_failed".to_string()),
            context_files: Vec::new(),
            extra_context_files: Vec::new(),
            modified_files: Vec::new(),
            setup: None,
            baseline: None,
            verification: None,
            agent_command_executed: false,
            policy: PolicySnapshot::default(),
            artifacts: ArtifactIntegrity {
                complete: true,
                ..Default::default()
            },
        }
    }

    fn runs(control: (usize, usize, u64), treatment: (usize, usize, u64)) -> Vec<RunResult> {
        let mut out = Vec::new();
        for i in 0..control.1 {
            out.push(run(WorkerType::Control, i < control.0, control.2));
        }
        for i in 0..treatment.1 {
            out.push(run(WorkerType::Treatment, i < treatment.0, treatment.2));
        }
        out
    }

    fn evaluate(results: &[RunResult], thresholds: &GateThresholds) -> GateResult {
        let control = group_stats(WorkerType::Control, results);
        let treatment = group_stats(WorkerType::Treatment, results);
        let lift = lift_summary(&control, &treatment, SignificanceOptions::default());
        let diag = diagnostics(results);
        evaluate_gate(
            &GateInput {
                control: &control,
                treatment: &treatment,
                lift: &lift,
                diagnostics: &diag,
            },
            thresholds,
            &DefaultReasonClassifier,
        )
    }

    #[test]
    fn clear_lift_passes() {
        let results = runs((4, 10, 1000), (9, 10, 1000));
        let gate = evaluate(&results, &GateThresholds::default());
        assert!(gate.passed, "{:?}", gate.reasons);
        assert!(!gate.success_ceiling);
    }

    #[test]
    fn small_lift_fails() {
        let results = runs((5, 10, 1000), (5, 10, 1000));
        let gate = evaluate(&results, &GateThresholds::default());
        assert!(!gate.passed);
        assert_eq!(gate.reasons, vec!["t3_plus_lift_below_threshold:0.000<0.050"]);
    }

    #[test]
    fn saturated_arms_use_time_reduction_branch() {
        let results = runs((5, 5, 1000), (5, 5, 1000));
        let control = group_stats(WorkerType::Control, &results);
        let treatment = group_stats(WorkerType::Treatment, &results);
        let lift = lift_summary(&control, &treatment, SignificanceOptions::default());
        assert!(lift.significance.sample_size_adequate);

        let gate = evaluate(&results, &GateThresholds::default());
        assert!(gate.success_ceiling);
        assert_eq!(
            gate.reasons,
            vec!["success_ceiling_time_reduction_below_threshold:0.000<0.100"]
        );
        assert!(!gate.reasons.iter().any(|r| r.starts_with("t3_plus_lift")));
    }

    #[test]
    fn saturated_and_faster_passes() {
        let results = runs((6, 6, 1000), (6, 6, 800));
        let gate = evaluate(&results, &GateThresholds::default());
        assert!(gate.success_ceiling);
        assert!(gate.passed, "{:?}", gate.reasons);
    }

    #[test]
    fn saturated_with_few_samples_fails() {
        let results = runs((2, 2, 1000), (2, 2, 500));
        let gate = evaluate(&results, &GateThresholds::default());
        assert_eq!(
            gate.reasons,
            vec!["success_ceiling_insufficient_samples:control=2,treatment=2,min=5"]
        );
    }

    #[test]
    fn critical_failures_fail_gate_first() {
        let mut results = runs((4, 10, 1000), (9, 10, 1000));
        results[0].failure_reason = Some("agent_command_provider_unavailable".into());
        results[1].failure_reason = Some("missing_repo".into());
        results[1].artifacts.complete = false;

        let gate = evaluate(&results, &GateThresholds::default());
        assert_eq!(gate.reasons[0], "critical_failures_present:2");
        assert!(gate.reasons[1].starts_with("artifact_integrity_share_below_threshold:0.950"));
        assert_eq!(gate.classified[0].severity, Severity::Critical);

        let lenient = GateThresholds {
            require_no_critical_failures: false,
            min_artifact_integrity_share: 0.9,
            ..Default::default()
        };
        assert!(evaluate(&results, &lenient).passed);
    }

    #[test]
    fn fallback_usage_is_limited() {
        let mut results = runs((4, 10, 1000), (9, 10, 1000));
        results[12].policy.edit_fallback_used = true;
        let gate = evaluate(&results, &GateThresholds::default());
        assert_eq!(gate.reasons, vec!["fallback_share_above_threshold:0.050>0.000"]);
    }

    #[test]
    fn significance_requirement_reports_inconclusive() {
        let thresholds = GateThresholds {
            require_t3_significance: true,
            ..Default::default()
        };
        let results = runs((0, 3, 1000), (3, 3, 1000));
        let gate = evaluate(&results, &thresholds);
        assert_eq!(
            gate.reasons,
            vec![
                "insufficient_samples:control=3,treatment=3,min=5",
                "t3_plus_significance_inconclusive:insufficient_samples",
            ]
        );

        let results = runs((5, 10, 1000), (6, 10, 1000));
        let gate = evaluate(&results, &thresholds);
        assert!(gate.reasons.iter().any(|r| r.starts_with("t3_plus_not_significant:p=")));
    }

    #[test]
    fn diagnostics_shares_use_all_runs() {
        let mut results = runs((1, 2, 10), (1, 2, 10));
        results[0].agent_command_executed = true;
        let diag = diagnostics(&results);
        assert_eq!(diag.total_runs, 4);
        assert_eq!(diag.agent_command_share, 0.25);
        assert_eq!(diag.verified_execution_share, 0.0);
        assert_eq!(diag.artifact_integrity_share, 1.0);
        assert_eq!(diag.critical_failure_count, 0);
    }
}
