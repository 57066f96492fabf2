//! Experiment report: every run result plus the statistics and gate verdict
//! derived from them.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ReasonClassifier;
use crate::executor::RunResult;
use crate::executor::artifacts::atomic_write;
use crate::gate::{Diagnostics, GateInput, GateResult, GateThresholds, diagnostics, evaluate_gate};
use crate::selection::SelectionMode;
use crate::stats::{
    GroupStats, LiftSummary, SignificanceOptions, at_least, failure_histogram, group_stats,
    lift_summary,
};
use crate::task::{Complexity, WorkerType};

/// Control/treatment comparison over one slice of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceSummary {
    pub control: GroupStats,
    pub treatment: GroupStats,
    pub lift: LiftSummary,
}

impl SliceSummary {
    pub fn from_results(results: &[RunResult], significance: SignificanceOptions) -> Self {
        let control = group_stats(WorkerType::Control, results);
        let treatment = group_stats(WorkerType::Treatment, results);
        let lift = lift_summary(&control, &treatment, significance);
        Self {
            control,
            treatment,
            lift,
        }
    }
}

/// Everything computed from a finished set of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub overall: SliceSummary,
    /// Tasks of complexity T3 and above. The gate decides on this slice.
    pub t3_plus: SliceSummary,
    pub failure_reasons: BTreeMap<WorkerType, BTreeMap<String, usize>>,
    pub diagnostics: Diagnostics,
    pub thresholds: GateThresholds,
    pub gate: GateResult,
}

/// Aggregate results, compare the groups and evaluate the gate.
pub fn analyze(
    results: &[RunResult],
    thresholds: &GateThresholds,
    significance: SignificanceOptions,
    classifier: &dyn ReasonClassifier,
) -> Analysis {
    let overall = SliceSummary::from_results(results, significance);
    let t3_plus = SliceSummary::from_results(&at_least(results, Complexity::T3), significance);

    let mut failure_reasons = BTreeMap::new();
    for worker in [WorkerType::Control, WorkerType::Treatment] {
        let histogram = failure_histogram(results.iter().filter(|r| r.worker_type == worker));
        if !histogram.is_empty() {
            failure_reasons.insert(worker, histogram);
        }
    }

    let diagnostics = diagnostics(results);
    let gate = evaluate_gate(
        &GateInput {
            control: &t3_plus.control,
            treatment: &t3_plus.treatment,
            lift: &t3_plus.lift,
            diagnostics: &diagnostics,
        },
        thresholds,
        classifier,
    );

    Analysis {
        overall,
        t3_plus,
        failure_reasons,
        diagnostics,
        thresholds: thresholds.clone(),
        gate,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub selection_mode: SelectionMode,
    pub selected_task_ids: Vec<String>,
    pub worker_types: Vec<WorkerType>,
    pub results: Vec<RunResult>,
    #[serde(flatten)]
    pub analysis: Analysis,
}

impl ExperimentReport {
    /// Write the report as pretty JSON, replacing any previous file atomically.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("failed to serialize report")?;
        atomic_write(path, &bytes)
            .with_context(|| format!("failed to write report: {}", path.display()))
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse report: {}", path.display()))
    }

    /// Short human summary for the terminal.
    pub fn summary_lines(&self) -> Vec<String> {
        let a = &self.analysis;
        let mut lines = vec![format!(
            "run {}: {} tasks, {} runs, selection={}",
            self.run_id,
            self.selected_task_ids.len(),
            self.results.len(),
            self.selection_mode
        )];
        for (label, slice) in [("overall", &a.overall), ("t3+", &a.t3_plus)] {
            lines.push(format!(
                "{label:<8} control {}/{} ({:.1}%)  treatment {}/{} ({:.1}%)  delta {:+.3}  95% CI [{:.3}, {:.3}]",
                slice.control.success_count,
                slice.control.count,
                slice.control.success_rate * 100.0,
                slice.treatment.success_count,
                slice.treatment.count,
                slice.treatment.success_rate * 100.0,
                slice.lift.absolute_success_rate_delta,
                slice.lift.confidence_interval.lower,
                slice.lift.confidence_interval.upper,
            ));
        }
        let sig = &a.t3_plus.lift.significance;
        lines.push(match (sig.p_value, sig.inconclusive_reason) {
            (Some(p), _) => format!("t3+ significance: p={p:.4} (alpha {})", sig.alpha),
            (None, Some(reason)) => format!("t3+ significance: inconclusive ({})", reason.as_str()),
            (None, None) => "t3+ significance: inconclusive".to_string(),
        });
        for (worker, histogram) in &a.failure_reasons {
            let top: Vec<String> = histogram.iter().map(|(r, n)| format!("{r}={n}")).collect();
            lines.push(format!("{worker} failures: {}", top.join(", ")));
        }
        if a.gate.passed {
            lines.push(if a.gate.success_ceiling {
                "gate: PASS (success ceiling)".to_string()
            } else {
                "gate: PASS".to_string()
            });
        } else {
            lines.push("gate: FAIL".to_string());
            for reason in &a.gate.reasons {
                lines.push(format!("  - {reason}"));
            }
        }
        lines
    }
}
