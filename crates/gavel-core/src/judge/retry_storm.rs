//! Detects repeated identical tool calls. Calls are fingerprinted by tool
//! name plus canonicalized arguments; every repeat beyond the first counts
//! as a retry. Soft failure.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{canonical_json, parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "retry_storm";

fn default_max_retries_per_call() -> u32 {
    2
}

fn default_max_total_retries() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryStormConfig {
    pub max_retries_per_call: u32,
    pub max_total_retries: u32,
}

impl Default for RetryStormConfig {
    fn default() -> Self {
        Self {
            max_retries_per_call: default_max_retries_per_call(),
            max_total_retries: default_max_total_retries(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RetryStormJudge {
    config: RetryStormConfig,
}

impl RetryStormJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            config: parse_config(JUDGE_ID, value)?,
        })
    }
}

fn fingerprint(tool: Option<&str>, input: Option<&Value>) -> String {
    let args = input
        .map(canonical_json)
        .unwrap_or_else(|| "null".to_string());
    format!("{}::{}", tool.unwrap_or("unknown"), args)
}

impl Judge for RetryStormJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        let mut call_counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut errors_seen = 0u32;
        for event in &case.trace {
            if event.event_type == "tool_call" {
                let key = fingerprint(event.tool.as_deref(), event.input.as_ref());
                *call_counts.entry(key).or_insert(0) += 1;
            }
            if event.error.is_some() {
                errors_seen += 1;
            }
        }

        if call_counts.is_empty() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no tool calls to evaluate retries", false);
        }

        let total_retries: u32 = call_counts.values().map(|count| count - 1).sum();
        let mut high_retry_calls = Vec::new();
        for (key, count) in &call_counts {
            let retries = count - 1;
            if retries > self.config.max_retries_per_call {
                high_retry_calls.push(json!({ "call": key, "retries": retries }));
            }
        }

        // One violation per check, however many calls trip it; per-call
        // detail stays in high_retry_calls.
        let mut violations = Vec::new();
        if !high_retry_calls.is_empty() {
            violations.push(format!(
                "{} call(s) repeated beyond per-call limit {}",
                high_retry_calls.len(),
                self.config.max_retries_per_call
            ));
        }
        if total_retries > self.config.max_total_retries {
            violations.push(format!(
                "total retries {total_retries} exceed limit {}",
                self.config.max_total_retries
            ));
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), 2),
            passed,
            if passed {
                "retry checks passed"
            } else {
                "retry storm detected"
            },
            false,
            json!({
                "errors_seen": errors_seen,
                "distinct_calls": call_counts.len(),
                "total_retries": total_retries,
                "high_retry_calls": high_retry_calls,
                "violations": violations,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TraceEvent;

    fn call(idx: u32, tool: &str, input: Value) -> TraceEvent {
        TraceEvent {
            idx,
            actor: "agent".into(),
            event_type: "tool_call".into(),
            tool: Some(tool.into()),
            input: Some(input),
            ..Default::default()
        }
    }

    #[test]
    fn skips_without_tool_calls() {
        let case = EvalCase {
            case_id: "c1".into(),
            ..Default::default()
        };
        assert!(RetryStormJudge::default().evaluate(&case).skipped);
    }

    #[test]
    fn identical_repeated_calls_trip_per_call_limit() {
        let case = EvalCase {
            case_id: "c1".into(),
            trace: vec![
                call(0, "search", json!({"q": "weather"})),
                call(1, "search", json!({"q": "weather"})),
                call(2, "search", json!({"q": "weather"})),
            ],
            ..Default::default()
        };
        let judge = RetryStormJudge::from_config(&json!({"max_retries_per_call": 1})).unwrap();
        let result = judge.evaluate(&case);
        assert!(!result.passed);
        assert_eq!(result.evidence["total_retries"], 2);
        assert_eq!(result.evidence["high_retry_calls"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn noisy_fingerprints_share_one_violation() {
        let case = EvalCase {
            case_id: "c1".into(),
            trace: vec![
                call(0, "search", json!({"q": "a"})),
                call(1, "search", json!({"q": "a"})),
                call(2, "search", json!({"q": "a"})),
                call(3, "fetch", json!({"url": "x"})),
                call(4, "fetch", json!({"url": "x"})),
                call(5, "fetch", json!({"url": "x"})),
            ],
            ..Default::default()
        };
        let judge = RetryStormJudge::from_config(&json!({"max_retries_per_call": 1})).unwrap();
        let result = judge.evaluate(&case);
        assert!(!result.passed);
        assert_eq!(result.evidence["high_retry_calls"].as_array().unwrap().len(), 2);
        assert_eq!(result.evidence["violations"].as_array().unwrap().len(), 1);
        assert_eq!(result.score, 0.5);
    }

    #[test]
    fn errors_seen_counts_any_event_carrying_an_error() {
        let mut failed_result = TraceEvent {
            idx: 1,
            actor: "tool".into(),
            event_type: "tool_result".into(),
            tool: Some("search".into()),
            ..Default::default()
        };
        failed_result.error = Some("upstream 500".into());
        let mut env_error = TraceEvent {
            idx: 2,
            actor: "env".into(),
            event_type: "error".into(),
            ..Default::default()
        };
        env_error.error = Some("sandbox fault".into());
        let case = EvalCase {
            case_id: "c1".into(),
            trace: vec![call(0, "search", json!({})), failed_result, env_error],
            ..Default::default()
        };
        let result = RetryStormJudge::default().evaluate(&case);
        assert_eq!(result.evidence["errors_seen"], 2);
    }

    #[test]
    fn argument_key_order_does_not_split_fingerprints() {
        let case = EvalCase {
            case_id: "c1".into(),
            trace: vec![
                call(0, "fetch", json!({"a": 1, "b": 2})),
                call(1, "fetch", json!({"b": 2, "a": 1})),
            ],
            ..Default::default()
        };
        let result = RetryStormJudge::default().evaluate(&case);
        assert_eq!(result.evidence["distinct_calls"], 1);
        assert_eq!(result.evidence["total_retries"], 1);
    }

    #[test]
    fn distinct_calls_are_not_retries() {
        let case = EvalCase {
            case_id: "c1".into(),
            trace: vec![
                call(0, "search", json!({"q": "a"})),
                call(1, "search", json!({"q": "b"})),
            ],
            ..Default::default()
        };
        let result = RetryStormJudge::default().evaluate(&case);
        assert!(result.passed);
        assert_eq!(result.evidence["total_retries"], 0);
    }

    #[test]
    fn total_retry_budget_enforced_across_calls() {
        let mut trace = Vec::new();
        for tool in ["a", "b", "c", "d"] {
            for repeat in 0..3u32 {
                trace.push(call(trace.len() as u32 + repeat, tool, json!({})));
            }
        }
        let case = EvalCase {
            case_id: "c1".into(),
            trace,
            ..Default::default()
        };
        // 4 tools * 2 retries each = 8 > 6 default, no per-call violation.
        let result = RetryStormJudge::default().evaluate(&case);
        assert!(!result.passed);
        assert_eq!(result.score, 0.5);
    }
}
