//! Task selection under a budget.
//!
//! When fewer tasks may run than the catalog holds, prior run history
//! decides which ones. Tasks with no history are maximally uncertain.
//! Every ordering has a total tie-break, so identical inputs always yield
//! identical selections.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::executor::{RunResult, is_context_failure, is_timeout_failure};
use crate::task::TaskSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Catalog order.
    Sequential,
    /// Most uncertain first.
    Uncertainty,
    /// Mostly uncertain tasks plus a few stable ones as a control check.
    #[default]
    Adaptive,
}

impl SelectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Uncertainty => "uncertainty",
            Self::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "uncertainty" => Ok(Self::Uncertainty),
            "adaptive" => Ok(Self::Adaptive),
            other => bail!("unknown selection mode '{other}' (expected sequential, uncertainty or adaptive)"),
        }
    }
}

/// Outcome counts for one task across prior runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub runs: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub context_failures: usize,
}

impl TaskHistory {
    fn rate(&self, n: usize) -> f64 {
        if self.runs == 0 { 0.0 } else { n as f64 / self.runs as f64 }
    }

    /// 1.0 when outcomes split evenly, 0.0 when they always agree.
    pub fn disagreement(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        2.0 * self.successes.min(self.failures) as f64 / self.runs as f64
    }
}

/// Per-task history keyed by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryIndex {
    tasks: BTreeMap<String, TaskHistory>,
}

impl HistoryIndex {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a RunResult>) -> Self {
        let mut tasks: BTreeMap<String, TaskHistory> = BTreeMap::new();
        for run in results {
            let entry = tasks.entry(run.task_id.clone()).or_default();
            entry.runs += 1;
            if run.success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            if let Some(reason) = run.failure_reason.as_deref() {
                if is_timeout_failure(reason) {
                    entry.timeouts += 1;
                }
                if is_context_failure(reason) {
                    entry.context_failures += 1;
                }
            }
        }
        Self { tasks }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskHistory> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Weighted blend of failure, timeout, context-failure and disagreement
    /// rates in `0.0..=1.0`. Unknown tasks score 1.0.
    pub fn uncertainty_score(&self, task_id: &str) -> f64 {
        match self.tasks.get(task_id) {
            None => 1.0,
            Some(h) if h.runs == 0 => 1.0,
            Some(h) => {
                0.4 * h.rate(h.failures)
                    + 0.2 * h.rate(h.timeouts)
                    + 0.2 * h.rate(h.context_failures)
                    + 0.2 * h.disagreement()
            }
        }
    }
}

/// Read history files. Each is either an experiment report (its `results`
/// are used) or a bare JSON array of run results.
pub fn load_history(paths: &[std::path::PathBuf]) -> Result<Vec<RunResult>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HistoryFile {
        Runs(Vec<RunResult>),
        Report { results: Vec<RunResult> },
    }

    let mut runs = Vec::new();
    for path in paths {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history file: {}", path.display()))?;
        let parsed: HistoryFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid history file: {}", path.display()))?;
        match parsed {
            HistoryFile::Runs(r) | HistoryFile::Report { results: r } => runs.extend(r),
        }
    }
    Ok(runs)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionOptions {
    pub mode: SelectionMode,
    /// `None` runs the whole catalog.
    pub max_tasks: Option<usize>,
    /// Tasks at or below this score count as stable.
    pub stable_threshold: f64,
    /// Share of the budget reserved for uncertain tasks in adaptive mode.
    pub uncertain_share: f64,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Adaptive,
            max_tasks: None,
            stable_threshold: 0.2,
            uncertain_share: 0.75,
        }
    }
}

/// A selected task with the score it was selected on.
#[derive(Debug, Clone, Copy)]
pub struct ScoredTask<'a> {
    pub task: &'a TaskSpec,
    pub uncertainty: f64,
}

impl PartialEq for ScoredTask<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id && self.uncertainty.to_bits() == other.uncertainty.to_bits()
    }
}

/// Score descending, then complexity descending, then id ascending.
fn most_uncertain_first(a: &ScoredTask<'_>, b: &ScoredTask<'_>) -> Ordering {
    b.uncertainty
        .total_cmp(&a.uncertainty)
        .then_with(|| b.task.complexity.cmp(&a.task.complexity))
        .then_with(|| a.task.id.cmp(&b.task.id))
}

/// Score ascending, then complexity descending, then id ascending.
fn most_stable_first(a: &ScoredTask<'_>, b: &ScoredTask<'_>) -> Ordering {
    a.uncertainty
        .total_cmp(&b.uncertainty)
        .then_with(|| b.task.complexity.cmp(&a.task.complexity))
        .then_with(|| a.task.id.cmp(&b.task.id))
}

/// Choose which tasks to execute.
pub fn select_ab_tasks_for_execution<'a>(
    tasks: &'a [TaskSpec],
    history: &HistoryIndex,
    options: &SelectionOptions,
) -> Vec<ScoredTask<'a>> {
    let scored: Vec<ScoredTask<'a>> = tasks
        .iter()
        .map(|task| ScoredTask {
            task,
            uncertainty: history.uncertainty_score(&task.id),
        })
        .collect();

    let budget = match options.max_tasks {
        Some(n) if n < scored.len() => n,
        _ => return scored,
    };
    if budget == 0 {
        return Vec::new();
    }

    let selected = match options.mode {
        SelectionMode::Sequential => scored.into_iter().take(budget).collect(),
        SelectionMode::Uncertainty => {
            let mut ranked = scored;
            ranked.sort_by(most_uncertain_first);
            ranked.truncate(budget);
            ranked
        }
        SelectionMode::Adaptive => adaptive(scored, budget, options),
    };
    debug!(
        mode = options.mode.as_str(),
        budget,
        selected = selected.len(),
        "selected tasks"
    );
    selected
}

fn adaptive<'a>(
    scored: Vec<ScoredTask<'a>>,
    budget: usize,
    options: &SelectionOptions,
) -> Vec<ScoredTask<'a>> {
    let mut ranked = scored;
    ranked.sort_by(most_uncertain_first);

    let quota = ((budget as f64 * options.uncertain_share).round() as usize).clamp(1, budget);
    let mut selected: Vec<ScoredTask<'a>> = ranked.iter().take(quota).copied().collect();
    let mut taken: BTreeSet<&str> = selected.iter().map(|s| s.task.id.as_str()).collect();

    let mut rest: Vec<ScoredTask<'a>> = ranked
        .iter()
        .filter(|s| !taken.contains(s.task.id.as_str()))
        .copied()
        .collect();
    rest.sort_by(most_stable_first);

    let stable: Vec<ScoredTask<'a>> = rest
        .iter()
        .filter(|s| s.uncertainty <= options.stable_threshold)
        .copied()
        .collect();
    let stable_pool = if stable.is_empty() { rest } else { stable };

    for candidate in stable_pool {
        if selected.len() >= budget {
            break;
        }
        taken.insert(candidate.task.id.as_str());
        selected.push(candidate);
    }

    // Too few stable tasks: pad with the next most uncertain.
    for candidate in &ranked {
        if selected.len() >= budget {
            break;
        }
        if taken.insert(candidate.task.id.as_str()) {
            selected.push(*candidate);
        }
    }
    selected
}
