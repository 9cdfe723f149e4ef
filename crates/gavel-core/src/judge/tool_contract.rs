//! Checks every `tool_call` against the per-tool argument contracts
//! declared on the case: required argument names present, forbidden names
//! absent. Hard-fail.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "tool_contract";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolContractConfig {}

#[derive(Debug, Default)]
pub struct ToolContractJudge {
    _config: ToolContractConfig,
}

impl ToolContractJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

impl Judge for ToolContractJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        let mut calls_checked = 0usize;
        let mut violations = Vec::new();

        for event in &case.trace {
            if event.event_type != "tool_call" {
                continue;
            }
            let Some(tool) = event.tool.as_deref() else {
                continue;
            };
            let Some(contract) = case.tool_contracts.get(tool) else {
                continue;
            };

            calls_checked += 1;
            let empty = serde_json::Map::new();
            let args = event
                .input
                .as_ref()
                .and_then(Value::as_object)
                .unwrap_or(&empty);
            let missing: Vec<&str> = contract
                .required_args
                .iter()
                .filter(|key| !args.contains_key(*key))
                .map(String::as_str)
                .collect();
            let forbidden: Vec<&str> = contract
                .forbidden_args
                .iter()
                .filter(|key| args.contains_key(*key))
                .map(String::as_str)
                .collect();

            if !missing.is_empty() || !forbidden.is_empty() {
                violations.push(json!({
                    "event_idx": event.idx,
                    "tool": tool,
                    "missing_required_args": missing,
                    "forbidden_args_present": forbidden,
                }));
            }
        }

        if calls_checked == 0 && case.tool_contracts.is_empty() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no tool contracts configured", true);
        }

        if calls_checked == 0 {
            let contracts: Vec<&str> = case.tool_contracts.keys().map(String::as_str).collect();
            return JudgeResult::new(
                JUDGE_ID,
                &case.case_id,
                0.0,
                false,
                "tool contracts configured but no matching tool calls were found",
                true,
                json!({ "contracts": contracts }),
            );
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), calls_checked),
            passed,
            if passed {
                "all tool contract checks passed"
            } else {
                "tool contract violations"
            },
            true,
            json!({ "violations": violations, "calls_checked": calls_checked }),
        )
    }
}
