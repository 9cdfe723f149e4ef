//! Repeated-run stability analysis: evaluate the same suite N times, track
//! per-case pass history and flag flaky, consistently-failing and
//! quarantine-worthy cases. Runs execute sequentially so that live-agent
//! attempts from different runs never interleave.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::engine::{EvalRunner, ProposeExecuteRepairRunner};
use crate::errors::CoreError;
use crate::judge::{JudgeRegistry, DEFAULT_JUDGES};
use crate::model::{utc_now_iso, EvalSuite, ExecutionConfig, ExecutionMode, RunConfig};

#[derive(Debug, Clone)]
pub struct StabilityOptions {
    pub runs: u32,
    pub execution_mode: ExecutionMode,
    pub execution_config: ExecutionConfig,
    /// Flaky cases below this pass rate get a quarantine recommendation.
    pub quarantine_min_pass_rate: f64,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            runs: 5,
            execution_mode: ExecutionMode::TraceScore,
            execution_config: ExecutionConfig::default(),
            quarantine_min_pass_rate: 0.98,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub run_index: u32,
    pub run_id: String,
    pub pass_rate: f64,
    pub hard_fail_rate: f64,
    pub passed_cases: u64,
    pub failed_cases: u64,
    pub hard_fail_cases: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStabilityRow {
    pub case_id: String,
    pub runs: u32,
    pub pass_count: u32,
    pub hard_fail_count: u32,
    pub pass_rate: f64,
    pub confidence_95: ConfidenceInterval,
    pub flaky: bool,
    pub consistently_failing: bool,
    pub quarantine_recommended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilitySummary {
    pub avg_pass_rate: f64,
    pub pass_rate_stddev: f64,
    pub flaky_cases: usize,
    pub consistently_failing_cases: usize,
    pub quarantine_recommended_cases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityReport {
    pub dataset_id: String,
    pub runs: u32,
    pub execution_mode: ExecutionMode,
    pub judge_names: Vec<String>,
    pub run_results: Vec<RunRow>,
    pub case_stability: Vec<CaseStabilityRow>,
    pub flaky_case_ids: Vec<String>,
    pub consistently_failing_case_ids: Vec<String>,
    pub quarantine_recommended_case_ids: Vec<String>,
    pub summary: StabilitySummary,
}

/// 95% Wilson score interval for `successes` out of `trials`.
pub(crate) fn wilson_interval(successes: u32, trials: u32) -> ConfidenceInterval {
    const Z: f64 = 1.96;
    if trials == 0 {
        return ConfidenceInterval { low: 0.0, high: 0.0 };
    }
    let n = trials as f64;
    let p = successes as f64 / n;
    let z2 = Z * Z;
    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let margin = Z * ((p * (1.0 - p) / n) + z2 / (4.0 * n * n)).sqrt() / denom;
    ConfidenceInterval {
        low: (center - margin).max(0.0),
        high: (center + margin).min(1.0),
    }
}

fn build_run_config(
    suite: &EvalSuite,
    judge_names: &[String],
    judge_configs: &BTreeMap<String, Value>,
    execution_mode: ExecutionMode,
    execution_config: &ExecutionConfig,
    run_index: u32,
) -> RunConfig {
    RunConfig {
        run_id: format!("stability-{}", run_index + 1),
        dataset_id: suite.dataset_id.clone(),
        agent_version: "stability-check".into(),
        model: "unknown".into(),
        started_at: utc_now_iso(),
        seed: u64::from(run_index),
        judges: judge_names.to_vec(),
        judge_configs: judge_configs.clone(),
        execution_mode,
        execution_config: execution_config.clone(),
        ..Default::default()
    }
}

/// Evaluate `suite` repeatedly and report per-case stability.
///
/// Errors only on bad setup (too few runs, unknown judge, missing propose
/// command); individual run anomalies show up in the report, not as `Err`.
pub fn run_stability_check(
    suite: &EvalSuite,
    registry: &JudgeRegistry,
    judge_names: &[String],
    judge_configs: &BTreeMap<String, Value>,
    options: &StabilityOptions,
) -> Result<StabilityReport, CoreError> {
    if options.runs < 2 {
        return Err(CoreError::NotEnoughRuns(options.runs));
    }

    let resolved_judges: Vec<String> = if judge_names.is_empty() {
        DEFAULT_JUDGES.iter().map(|s| s.to_string()).collect()
    } else {
        judge_names.to_vec()
    };
    let judges = registry.instantiate_all(&resolved_judges, judge_configs)?;
    let eval_runner = EvalRunner::new(judges);

    let loop_runner = match options.execution_mode {
        ExecutionMode::ProposeExecuteRepair => Some(ProposeExecuteRepairRunner::new(
            &eval_runner,
            &options.execution_config,
        )?),
        ExecutionMode::TraceScore => None,
    };

    let mut run_rows = Vec::with_capacity(options.runs as usize);
    let mut pass_history: BTreeMap<String, Vec<bool>> = suite
        .cases
        .iter()
        .map(|case| (case.case_id.clone(), Vec::new()))
        .collect();
    let mut hard_history: BTreeMap<String, Vec<bool>> = pass_history.clone();

    for run_index in 0..options.runs {
        let executed;
        let run_suite = match &loop_runner {
            Some(runner) => {
                executed = runner.run(suite);
                &executed
            }
            None => suite,
        };

        let run_config = build_run_config(
            run_suite,
            &resolved_judges,
            judge_configs,
            options.execution_mode,
            &options.execution_config,
            run_index,
        );
        let (case_results, summary) = eval_runner.run(run_suite, &run_config);
        info!(
            run_id = %run_config.run_id,
            pass_rate = summary.pass_rate,
            "stability run complete"
        );
        run_rows.push(RunRow {
            run_index,
            run_id: run_config.run_id,
            pass_rate: summary.pass_rate,
            hard_fail_rate: summary.hard_fail_rate,
            passed_cases: summary.passed_cases,
            failed_cases: summary.failed_cases,
            hard_fail_cases: summary.hard_fail_cases,
        });

        for result in &case_results {
            pass_history
                .entry(result.case_id.clone())
                .or_default()
                .push(result.passed);
            hard_history
                .entry(result.case_id.clone())
                .or_default()
                .push(result.hard_failed);
        }
    }

    let mut case_rows = Vec::with_capacity(pass_history.len());
    let mut flaky_case_ids = Vec::new();
    let mut consistently_failing_case_ids = Vec::new();
    let mut quarantine_recommended_case_ids = Vec::new();

    for (case_id, history) in &pass_history {
        let total = history.len() as u32;
        let pass_count = history.iter().filter(|passed| **passed).count() as u32;
        let hard_fail_count = hard_history
            .get(case_id)
            .map(|h| h.iter().filter(|hard| **hard).count() as u32)
            .unwrap_or(0);
        let pass_rate = if total == 0 {
            0.0
        } else {
            f64::from(pass_count) / f64::from(total)
        };
        let flaky = pass_count != 0 && pass_count != total;
        let consistently_failing = pass_count == 0;
        let quarantine = flaky && pass_rate < options.quarantine_min_pass_rate;

        if flaky {
            flaky_case_ids.push(case_id.clone());
        }
        if consistently_failing {
            consistently_failing_case_ids.push(case_id.clone());
        }
        if quarantine {
            quarantine_recommended_case_ids.push(case_id.clone());
        }
        case_rows.push(CaseStabilityRow {
            case_id: case_id.clone(),
            runs: total,
            pass_count,
            hard_fail_count,
            pass_rate,
            confidence_95: wilson_interval(pass_count, total),
            flaky,
            consistently_failing,
            quarantine_recommended: quarantine,
        });
    }

    let avg_pass_rate =
        run_rows.iter().map(|row| row.pass_rate).sum::<f64>() / run_rows.len() as f64;
    let variance = run_rows
        .iter()
        .map(|row| (row.pass_rate - avg_pass_rate).powi(2))
        .sum::<f64>()
        / run_rows.len() as f64;

    Ok(StabilityReport {
        dataset_id: suite.dataset_id.clone(),
        runs: options.runs,
        execution_mode: options.execution_mode,
        judge_names: resolved_judges,
        summary: StabilitySummary {
            avg_pass_rate,
            pass_rate_stddev: variance.max(0.0).sqrt(),
            flaky_cases: flaky_case_ids.len(),
            consistently_failing_cases: consistently_failing_case_ids.len(),
            quarantine_recommended_cases: quarantine_recommended_case_ids.len(),
        },
        run_results: run_rows,
        case_stability: case_rows,
        flaky_case_ids,
        consistently_failing_case_ids,
        quarantine_recommended_case_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvalCase, PolicySpec, TraceEvent};
    use serde_json::json;

    fn passing_case(case_id: &str) -> EvalCase {
        EvalCase {
            case_id: case_id.into(),
            trace: vec![TraceEvent {
                idx: 0,
                actor: "assistant".into(),
                event_type: "message".into(),
                output: Some(json!("done")),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn failing_case(case_id: &str) -> EvalCase {
        let mut case = passing_case(case_id);
        case.policy = PolicySpec {
            required_tools: vec!["search".into()],
            forbidden_tools: Vec::new(),
        };
        case
    }

    #[test]
    fn requires_at_least_two_runs() {
        let suite = EvalSuite {
            dataset_id: "d1".into(),
            ..Default::default()
        };
        let err = run_stability_check(
            &suite,
            &JudgeRegistry::builtin(),
            &[],
            &BTreeMap::new(),
            &StabilityOptions {
                runs: 1,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NotEnoughRuns(1)));
    }

    #[test]
    fn deterministic_suite_is_never_flaky() {
        let suite = EvalSuite {
            dataset_id: "d1".into(),
            cases: vec![passing_case("ok"), failing_case("bad")],
            ..Default::default()
        };
        let report = run_stability_check(
            &suite,
            &JudgeRegistry::builtin(),
            &[],
            &BTreeMap::new(),
            &StabilityOptions {
                runs: 3,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(report.run_results.len(), 3);
        assert!(report.flaky_case_ids.is_empty());
        assert_eq!(report.consistently_failing_case_ids, vec!["bad".to_string()]);
        assert!(report.quarantine_recommended_case_ids.is_empty());
        assert_eq!(report.summary.avg_pass_rate, 0.5);
        assert_eq!(report.summary.pass_rate_stddev, 0.0);

        let bad = report
            .case_stability
            .iter()
            .find(|row| row.case_id == "bad")
            .unwrap();
        assert!(bad.consistently_failing);
        assert_eq!(bad.pass_count, 0);
        assert_eq!(bad.runs, 3);
    }

    #[test]
    fn run_ids_and_seeds_are_sequential() {
        let suite = EvalSuite {
            dataset_id: "d1".into(),
            cases: vec![passing_case("ok")],
            ..Default::default()
        };
        let report = run_stability_check(
            &suite,
            &JudgeRegistry::builtin(),
            &[],
            &BTreeMap::new(),
            &StabilityOptions {
                runs: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.run_results[0].run_id, "stability-1");
        assert_eq!(report.run_results[1].run_id, "stability-2");
    }

    #[test]
    fn propose_mode_without_command_is_rejected() {
        let suite = EvalSuite {
            dataset_id: "d1".into(),
            ..Default::default()
        };
        let err = run_stability_check(
            &suite,
            &JudgeRegistry::builtin(),
            &[],
            &BTreeMap::new(),
            &StabilityOptions {
                execution_mode: ExecutionMode::ProposeExecuteRepair,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingProposeCommand));
    }

    #[test]
    fn wilson_interval_brackets_the_point_estimate() {
        let ci = wilson_interval(4, 5);
        assert!(ci.low < 0.8 && 0.8 < ci.high);
        assert!(ci.low >= 0.0 && ci.high <= 1.0);

        let certain = wilson_interval(5, 5);
        assert!(certain.low > 0.5);
        assert_eq!(wilson_interval(0, 0), ConfidenceInterval { low: 0.0, high: 0.0 });
    }
}
