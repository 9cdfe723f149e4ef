//! Checks the distinct tools the agent invoked against the case policy:
//! required tools used at least once, forbidden tools never used. Hard-fail.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "policy";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {}

#[derive(Debug, Default)]
pub struct PolicyJudge {
    _config: PolicyConfig,
}

impl PolicyJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

impl Judge for PolicyJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if case.policy.is_empty() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no policy constraints configured", true);
        }

        let used_tools: BTreeSet<&str> = case
            .trace
            .iter()
            .filter(|event| event.event_type == "tool_call")
            .filter_map(|event| event.tool.as_deref())
            .collect();

        let forbidden_used: Vec<&str> = case
            .policy
            .forbidden_tools
            .iter()
            .map(String::as_str)
            .filter(|tool| used_tools.contains(tool))
            .collect();
        let missing_required: Vec<&str> = case
            .policy
            .required_tools
            .iter()
            .map(String::as_str)
            .filter(|tool| !used_tools.contains(tool))
            .collect();

        let violations = forbidden_used.len() + missing_required.len();
        let total_rules = case.policy.forbidden_tools.len() + case.policy.required_tools.len();
        let passed = violations == 0;

        let mut forbidden_used = forbidden_used;
        let mut missing_required = missing_required;
        forbidden_used.sort_unstable();
        missing_required.sort_unstable();

        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations, total_rules),
            passed,
            if passed {
                "policy checks passed"
            } else {
                "policy violations detected"
            },
            true,
            json!({
                "forbidden_tools_used": forbidden_used,
                "missing_required_tools": missing_required,
                "used_tools": used_tools,
            }),
        )
    }
}
