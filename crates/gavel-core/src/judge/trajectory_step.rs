//! Checks call/result pairing: every `tool_call` must be followed, within
//! the same attempt, by exactly one matching `tool_result`; no orphaned
//! calls or results. Hard-fail.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult, TraceEvent};

const JUDGE_ID: &str = "trajectory_step";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrajectoryStepConfig {}

#[derive(Debug, Default)]
pub struct TrajectoryStepJudge {
    _config: TrajectoryStepConfig,
}

impl TrajectoryStepJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

fn attempt_key(event: &TraceEvent) -> u32 {
    event.attempt.unwrap_or(0)
}

impl Judge for TrajectoryStepJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if case.trace.is_empty() {
            return JudgeResult::new(
                JUDGE_ID,
                &case.case_id,
                0.0,
                false,
                "empty trace",
                true,
                json!({ "violations": ["trace is empty"] }),
            );
        }

        let mut violations = Vec::new();
        // At most one pending call per attempt number.
        let mut pending_calls: BTreeMap<u32, Option<String>> = BTreeMap::new();
        let mut checks = 0usize;

        for event in &case.trace {
            let attempt = attempt_key(event);
            match event.event_type.as_str() {
                "tool_call" => {
                    pending_calls.insert(attempt, event.tool.clone());
                    checks += 1;
                }
                "tool_result" => {
                    checks += 1;
                    let Some(expected_tool) = pending_calls.remove(&attempt) else {
                        violations.push(json!({
                            "event_idx": event.idx,
                            "attempt": attempt,
                            "error": "tool_result without prior tool_call",
                            "tool": event.tool,
                        }));
                        continue;
                    };
                    if let Some(expected) = expected_tool {
                        if event.tool.as_deref().is_some_and(|tool| tool != expected) {
                            violations.push(json!({
                                "event_idx": event.idx,
                                "attempt": attempt,
                                "error": "tool_result tool mismatch",
                                "expected_tool": expected,
                                "actual_tool": event.tool,
                            }));
                        }
                    }
                }
                _ => {}
            }
        }

        for (attempt, tool) in &pending_calls {
            violations.push(json!({
                "attempt": attempt,
                "error": "unresolved tool_call without tool_result",
                "tool": tool,
            }));
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), checks),
            passed,
            if passed {
                "trajectory checks passed"
            } else {
                "trajectory step violations"
            },
            true,
            json!({ "violations": violations, "checks": checks }),
        )
    }
}
