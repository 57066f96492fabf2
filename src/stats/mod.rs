//! Statistics over run results.
//!
//! Pure functions: group aggregation, control-vs-treatment lift, a 95%
//! normal-approximation interval on the success-rate delta, and a pooled
//! two-proportion z-test. Degenerate inputs (empty groups, zero variance)
//! produce explicit point intervals or inconclusive verdicts, never NaN.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::executor::RunResult;
use crate::task::{Complexity, WorkerType};

/// Two-sided 95% critical value of the standard normal.
pub const Z_95: f64 = 1.959963984540054;

/// Control averages below this are noise; time reduction is reported as 0.
pub const MIN_MEANINGFUL_DURATION_MS: f64 = 50.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub count: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

impl TierStats {
    fn from_runs<'a>(runs: impl IntoIterator<Item = &'a RunResult>) -> Self {
        let mut count = 0usize;
        let mut success_count = 0usize;
        let mut total_ms = 0u64;
        for run in runs {
            count += 1;
            if run.success {
                success_count += 1;
            }
            total_ms += run.duration_ms;
        }
        Self {
            count,
            success_count,
            success_rate: ratio(success_count, count),
            avg_duration_ms: if count == 0 {
                0.0
            } else {
                total_ms as f64 / count as f64
            },
        }
    }
}

/// Aggregate over one arm's runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub worker_type: WorkerType,
    pub count: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub by_complexity: BTreeMap<Complexity, TierStats>,
}

/// `num / den`, or 0 for an empty denominator.
pub fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Aggregate the runs of `worker`. Other arms' runs are ignored.
pub fn group_stats(worker: WorkerType, results: &[RunResult]) -> GroupStats {
    let runs: Vec<&RunResult> = results.iter().filter(|r| r.worker_type == worker).collect();
    let overall = TierStats::from_runs(runs.iter().copied());

    let mut by_complexity = BTreeMap::new();
    for tier in Complexity::ALL {
        let tier_runs: Vec<&RunResult> = runs
            .iter()
            .copied()
            .filter(|r| r.complexity == tier)
            .collect();
        if !tier_runs.is_empty() {
            by_complexity.insert(tier, TierStats::from_runs(tier_runs));
        }
    }

    GroupStats {
        worker_type: worker,
        count: overall.count,
        success_count: overall.success_count,
        success_rate: overall.success_rate,
        avg_duration_ms: overall.avg_duration_ms,
        by_complexity,
    }
}

/// Runs at or above `min` complexity.
pub fn at_least(results: &[RunResult], min: Complexity) -> Vec<RunResult> {
    results
        .iter()
        .filter(|r| r.complexity >= min)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconclusiveReason {
    InsufficientSamples,
    ZeroStandardError,
}

impl InconclusiveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientSamples => "insufficient_samples",
            Self::ZeroStandardError => "zero_standard_error",
        }
    }
}

/// Two-proportion z-test verdict. `significant` is `None` when the test
/// could not be evaluated; `inconclusive_reason` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    pub alpha: f64,
    pub min_samples: usize,
    pub sample_size_adequate: bool,
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: Option<bool>,
    pub inconclusive_reason: Option<InconclusiveReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceOptions {
    pub alpha: f64,
    pub min_samples: usize,
}

impl Default for SignificanceOptions {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_samples: 5,
        }
    }
}

/// Treatment compared with control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftSummary {
    pub control_success_rate: f64,
    pub treatment_success_rate: f64,
    pub absolute_success_rate_delta: f64,
    /// Delta relative to control; equals the delta when control is 0.
    pub success_rate_lift: f64,
    pub control_avg_duration_ms: f64,
    pub treatment_avg_duration_ms: f64,
    pub time_reduction: f64,
    pub confidence_interval: ConfidenceInterval,
    pub significance: Significance,
}

/// Compare two groups.
pub fn lift_summary(
    control: &GroupStats,
    treatment: &GroupStats,
    options: SignificanceOptions,
) -> LiftSummary {
    let p1 = control.success_rate;
    let p2 = treatment.success_rate;
    let delta = p2 - p1;
    let success_rate_lift = if p1 == 0.0 { delta } else { delta / p1 };

    let time_reduction = if control.avg_duration_ms >= MIN_MEANINGFUL_DURATION_MS {
        (control.avg_duration_ms - treatment.avg_duration_ms) / control.avg_duration_ms
    } else {
        0.0
    };

    LiftSummary {
        control_success_rate: p1,
        treatment_success_rate: p2,
        absolute_success_rate_delta: delta,
        success_rate_lift,
        control_avg_duration_ms: control.avg_duration_ms,
        treatment_avg_duration_ms: treatment.avg_duration_ms,
        time_reduction,
        confidence_interval: delta_confidence_interval(p1, control.count, p2, treatment.count),
        significance: two_proportion_z_test(
            control.success_count,
            control.count,
            treatment.success_count,
            treatment.count,
            options,
        ),
    }
}

/// 95% interval on `p2 - p1` using the unpooled normal approximation.
/// Collapses to the point estimate when the standard error is unusable.
pub fn delta_confidence_interval(p1: f64, n1: usize, p2: f64, n2: usize) -> ConfidenceInterval {
    let delta = p2 - p1;
    let se = (p1 * (1.0 - p1) / n1 as f64 + p2 * (1.0 - p2) / n2 as f64).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return ConfidenceInterval {
            lower: delta,
            upper: delta,
            level: 0.95,
        };
    }
    ConfidenceInterval {
        lower: delta - Z_95 * se,
        upper: delta + Z_95 * se,
        level: 0.95,
    }
}

/// Pooled two-proportion z-test of treatment against control, two-sided.
pub fn two_proportion_z_test(
    control_successes: usize,
    control_n: usize,
    treatment_successes: usize,
    treatment_n: usize,
    options: SignificanceOptions,
) -> Significance {
    let adequate = control_n >= options.min_samples && treatment_n >= options.min_samples;
    let mut verdict = Significance {
        alpha: options.alpha,
        min_samples: options.min_samples,
        sample_size_adequate: adequate,
        z_score: None,
        p_value: None,
        significant: None,
        inconclusive_reason: None,
    };
    if !adequate || control_n == 0 || treatment_n == 0 {
        verdict.inconclusive_reason = Some(InconclusiveReason::InsufficientSamples);
        return verdict;
    }

    let n1 = control_n as f64;
    let n2 = treatment_n as f64;
    let p1 = control_successes as f64 / n1;
    let p2 = treatment_successes as f64 / n2;
    let pooled = (control_successes + treatment_successes) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        verdict.inconclusive_reason = Some(InconclusiveReason::ZeroStandardError);
        return verdict;
    }

    let z = (p2 - p1) / se;
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);
    verdict.z_score = Some(z);
    verdict.p_value = Some(p_value);
    verdict.significant = Some(p_value < options.alpha);
    verdict
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26, max error about 1.5e-7.
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Failure reason counts for one arm's runs.
pub fn failure_histogram<'a>(runs: impl IntoIterator<Item = &'a RunResult>) -> BTreeMap<String, usize> {
    let mut histogram = BTreeMap::new();
    for run in runs {
        if let Some(reason) = &run.failure_reason {
            *histogram.entry(reason.clone()).or_insert(0) += 1;
        }
    }
    histogram
}
