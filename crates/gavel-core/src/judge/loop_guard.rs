//! Flags runaway loops: too many trace steps, too many repair attempts, or
//! the same assistant message repeated verbatim. Hard-fail.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "loop_guard";

fn default_max_steps() -> u32 {
    40
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_identical_assistant_messages() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopGuardConfig {
    pub max_steps: u32,
    pub max_attempts: u32,
    pub max_identical_assistant_messages: u32,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_attempts: default_max_attempts(),
            max_identical_assistant_messages: default_max_identical_assistant_messages(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoopGuardJudge {
    config: LoopGuardConfig,
}

impl LoopGuardJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            config: parse_config(JUDGE_ID, value)?,
        })
    }
}

impl Judge for LoopGuardJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        let steps = case.trace.len();

        let mut attempt_ids: BTreeSet<u32> = case
            .trace
            .iter()
            .filter_map(|event| event.attempt)
            .collect();
        attempt_ids.extend(case.attempt_history.iter().map(|record| record.attempt));
        let attempts_used = attempt_ids.len().max(usize::from(!case.trace.is_empty()));

        let mut message_counts: BTreeMap<String, u32> = BTreeMap::new();
        for event in &case.trace {
            if event.actor != "assistant" && event.actor != "agent" {
                continue;
            }
            if let Some(Value::String(text)) = &event.output {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    *message_counts.entry(trimmed.to_string()).or_insert(0) += 1;
                }
            }
        }
        let max_identical = message_counts.values().copied().max().unwrap_or(0);

        let mut violations = Vec::new();
        if steps as u32 > self.config.max_steps {
            violations.push(format!(
                "trace has {steps} steps, limit is {}",
                self.config.max_steps
            ));
        }
        if attempts_used as u32 > self.config.max_attempts {
            violations.push(format!(
                "{attempts_used} attempts used, limit is {}",
                self.config.max_attempts
            ));
        }
        if max_identical > self.config.max_identical_assistant_messages {
            violations.push(format!(
                "assistant repeated the same message {max_identical} times, limit is {}",
                self.config.max_identical_assistant_messages
            ));
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), 3),
            passed,
            if passed {
                "loop guard checks passed"
            } else {
                "loop guard violations"
            },
            true,
            json!({
                "steps": steps,
                "attempts_used": attempts_used,
                "max_identical_assistant_messages": max_identical,
                "violations": violations,
            }),
        )
    }
}
