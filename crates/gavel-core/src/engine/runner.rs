//! Trace-scoring runner: applies the replay-contract validator plus the
//! configured judge list to every case in suite order, then aggregates a run
//! summary. Pure over its inputs; two invocations over the same suite and
//! judge set produce identical results.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, info};

use crate::model::{CaseResult, EvalCase, EvalSuite, JudgeResult, RunConfig, RunSummary};
use crate::judge::Judge;
use crate::validate::validate_trace;

#[derive(Debug)]
pub struct EvalRunner {
    judges: Vec<Box<dyn Judge>>,
}

impl EvalRunner {
    pub fn new(judges: Vec<Box<dyn Judge>>) -> Self {
        Self { judges }
    }

    /// Evaluate one case. The replay-contract verdict always comes first in
    /// `judge_results`; the configured judges follow in registration order.
    pub fn evaluate_case(&self, case: &EvalCase) -> CaseResult {
        let replay_issues = validate_trace(&case.trace);
        let replay_passed = replay_issues.is_empty();
        let replay_result = JudgeResult::new(
            "replay_contract",
            &case.case_id,
            if replay_passed { 1.0 } else { 0.0 },
            replay_passed,
            if replay_passed {
                "replay checks passed"
            } else {
                "replay contract violations"
            },
            true,
            json!({ "issues": replay_issues }),
        );

        let mut results = vec![replay_result];
        for judge in &self.judges {
            let result = judge.evaluate(case);
            debug!(
                case_id = %case.case_id,
                judge_id = %result.judge_id,
                passed = result.passed,
                skipped = result.skipped,
                score = result.score,
                "judge verdict"
            );
            results.push(result);
        }

        let passed = results.iter().filter(|r| !r.skipped).all(|r| r.passed);
        let hard_failed = results.iter().any(|r| !r.passed && r.hard_fail);
        CaseResult {
            case_id: case.case_id.clone(),
            passed,
            hard_failed,
            judge_results: results,
            replay_issues,
        }
    }

    /// Evaluate a whole suite sequentially, in suite order, and roll the
    /// per-case verdicts up into a summary. Skipped judge results are
    /// excluded from every rate.
    pub fn run(&self, suite: &EvalSuite, run_config: &RunConfig) -> (Vec<CaseResult>, RunSummary) {
        let mut case_results = Vec::with_capacity(suite.cases.len());
        let mut judge_total: BTreeMap<String, u64> = BTreeMap::new();
        let mut judge_passed: BTreeMap<String, u64> = BTreeMap::new();

        for case in &suite.cases {
            let case_result = self.evaluate_case(case);
            for result in &case_result.judge_results {
                if result.skipped {
                    continue;
                }
                *judge_total.entry(result.judge_id.clone()).or_insert(0) += 1;
                if result.passed {
                    *judge_passed.entry(result.judge_id.clone()).or_insert(0) += 1;
                }
            }
            case_results.push(case_result);
        }

        let total_cases = case_results.len() as u64;
        let passed_cases = case_results.iter().filter(|r| r.passed).count() as u64;
        let hard_fail_cases = case_results.iter().filter(|r| r.hard_failed).count() as u64;
        let failed_cases = total_cases - passed_cases;
        let rate = |count: u64| {
            if total_cases == 0 {
                0.0
            } else {
                count as f64 / total_cases as f64
            }
        };
        let judge_pass_rates = judge_total
            .iter()
            .map(|(judge_id, total)| {
                let passed = judge_passed.get(judge_id).copied().unwrap_or(0);
                (judge_id.clone(), passed as f64 / *total as f64)
            })
            .collect();

        let summary = RunSummary {
            run_id: run_config.run_id.clone(),
            dataset_id: suite.dataset_id.clone(),
            total_cases,
            passed_cases,
            failed_cases,
            hard_fail_cases,
            pass_rate: rate(passed_cases),
            hard_fail_rate: rate(hard_fail_cases),
            judge_pass_rates,
            schema_version: run_config.schema_version.clone(),
        };
        info!(
            run_id = %summary.run_id,
            dataset_id = %summary.dataset_id,
            total = summary.total_cases,
            passed = summary.passed_cases,
            hard_failed = summary.hard_fail_cases,
            "run complete"
        );
        (case_results, summary)
    }
}
