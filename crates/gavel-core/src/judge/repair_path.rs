//! Checks the repair history recorded by the loop runner: attempt ids must
//! be unique and monotonically non-decreasing. Score rewards short paths
//! (`1/attempts_used`). Soft failure.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "repair_path";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepairPathConfig {}

#[derive(Debug, Default)]
pub struct RepairPathJudge {
    _config: RepairPathConfig,
}

impl RepairPathJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

impl Judge for RepairPathJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if case.attempt_history.is_empty() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no repair attempts available", false);
        }

        let attempt_ids: Vec<u32> = case.attempt_history.iter().map(|a| a.attempt).collect();
        let mut violations: Vec<&str> = Vec::new();
        if attempt_ids.windows(2).any(|pair| pair[0] > pair[1]) {
            violations.push("attempt ids are not monotonic");
        }
        let mut deduped = attempt_ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        if deduped.len() != attempt_ids.len() {
            violations.push("duplicate attempt ids detected");
        }

        let attempts_used = attempt_ids.len();
        let passed = violations.is_empty();
        let score = if passed {
            1.0 / attempts_used.max(1) as f64
        } else {
            0.0
        };

        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            score,
            passed,
            if passed {
                "repair path checks passed"
            } else {
                "repair path violations"
            },
            false,
            json!({
                "attempts_used": attempts_used,
                "attempt_ids": attempt_ids,
                "violations": violations,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentResponse, AttemptRecord};

    fn record(attempt: u32) -> AttemptRecord {
        AttemptRecord {
            attempt,
            passed: false,
            hard_failed: false,
            response: AgentResponse::default(),
            judge_results: Vec::new(),
            replay_issues: Vec::new(),
        }
    }

    #[test]
    fn skips_without_history() {
        let case = EvalCase {
            case_id: "c1".into(),
            ..Default::default()
        };
        let result = RepairPathJudge::default().evaluate(&case);
        assert!(result.skipped);
        assert!(!result.hard_fail);
    }

    #[test]
    fn single_attempt_scores_one() {
        let case = EvalCase {
            case_id: "c1".into(),
            attempt_history: vec![record(0)],
            ..Default::default()
        };
        let result = RepairPathJudge::default().evaluate(&case);
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn score_decays_with_attempts_used() {
        let case = EvalCase {
            case_id: "c1".into(),
            attempt_history: vec![record(0), record(1), record(2)],
            ..Default::default()
        };
        let result = RepairPathJudge::default().evaluate(&case);
        assert!(result.passed);
        assert!((result.score - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn non_monotonic_attempts_fail() {
        let case = EvalCase {
            case_id: "c1".into(),
            attempt_history: vec![record(1), record(0)],
            ..Default::default()
        };
        let result = RepairPathJudge::default().evaluate(&case);
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn duplicate_attempts_fail() {
        let case = EvalCase {
            case_id: "c1".into(),
            attempt_history: vec![record(0), record(0)],
            ..Default::default()
        };
        let result = RepairPathJudge::default().evaluate(&case);
        assert!(!result.passed);
        assert!(result.evidence["violations"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v.as_str().unwrap().contains("duplicate")));
    }
}
