//! Sums token/cost usage from case metadata and trace attributes and checks
//! it against configured ceilings. Cost is the directly reported figure when
//! present, otherwise `tokens/1000 x rate`. Soft failure; skips when no
//! budget is configured.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "cost_budget";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostBudgetConfig {
    pub max_input_tokens: Option<f64>,
    pub max_output_tokens: Option<f64>,
    pub max_total_tokens: Option<f64>,
    pub max_cost_usd: Option<f64>,
    pub input_cost_per_1k: Option<f64>,
    pub output_cost_per_1k: Option<f64>,
}

impl CostBudgetConfig {
    fn has_budget(&self) -> bool {
        self.max_input_tokens.is_some()
            || self.max_output_tokens.is_some()
            || self.max_total_tokens.is_some()
            || self.max_cost_usd.is_some()
    }

    fn checks(&self) -> usize {
        [
            self.max_input_tokens,
            self.max_output_tokens,
            self.max_total_tokens,
            self.max_cost_usd,
        ]
        .iter()
        .filter(|t| t.is_some())
        .count()
    }
}

#[derive(Debug, Default)]
pub struct CostBudgetJudge {
    config: CostBudgetConfig,
}

impl CostBudgetJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            config: parse_config(JUDGE_ID, value)?,
        })
    }
}

fn as_f64(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

struct Usage {
    input_tokens: f64,
    output_tokens: f64,
    direct_cost: Option<f64>,
}

fn extract_usage(case: &EvalCase) -> Usage {
    let mut usage = Usage {
        input_tokens: 0.0,
        output_tokens: 0.0,
        direct_cost: None,
    };

    if let Some(Value::Object(token_usage)) = case.metadata.get("token_usage") {
        usage.input_tokens += token_usage.get("input_tokens").map(as_f64).unwrap_or(0.0);
        usage.output_tokens += token_usage.get("output_tokens").map(as_f64).unwrap_or(0.0);
        if let Some(cost) = token_usage.get("cost_usd").and_then(Value::as_f64) {
            usage.direct_cost = Some(cost);
        }
    }

    for event in &case.trace {
        let attrs = &event.attributes;
        usage.input_tokens += attrs
            .get("usage.input_tokens")
            .or_else(|| attrs.get("gen_ai.usage.input_tokens"))
            .map(as_f64)
            .unwrap_or(0.0);
        usage.output_tokens += attrs
            .get("usage.output_tokens")
            .or_else(|| attrs.get("gen_ai.usage.output_tokens"))
            .map(as_f64)
            .unwrap_or(0.0);
        if let Some(cost) = attrs.get("cost_usd").and_then(Value::as_f64) {
            usage.direct_cost = Some(cost);
        }
    }

    usage
}

impl Judge for CostBudgetJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if !self.config.has_budget() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no cost/token budgets configured", false);
        }

        let usage = extract_usage(case);
        let total_tokens = usage.input_tokens + usage.output_tokens;
        let estimated_cost = usage.direct_cost.unwrap_or_else(|| {
            (usage.input_tokens / 1000.0) * self.config.input_cost_per_1k.unwrap_or(0.0)
                + (usage.output_tokens / 1000.0) * self.config.output_cost_per_1k.unwrap_or(0.0)
        });

        let mut violations = Vec::new();
        if let Some(max) = self.config.max_input_tokens {
            if usage.input_tokens > max {
                violations.push(format!(
                    "input_tokens {:.0} exceeds max_input_tokens {max:.0}",
                    usage.input_tokens
                ));
            }
        }
        if let Some(max) = self.config.max_output_tokens {
            if usage.output_tokens > max {
                violations.push(format!(
                    "output_tokens {:.0} exceeds max_output_tokens {max:.0}",
                    usage.output_tokens
                ));
            }
        }
        if let Some(max) = self.config.max_total_tokens {
            if total_tokens > max {
                violations.push(format!(
                    "total_tokens {total_tokens:.0} exceeds max_total_tokens {max:.0}"
                ));
            }
        }
        if let Some(max) = self.config.max_cost_usd {
            if estimated_cost > max {
                violations.push(format!(
                    "cost_usd {estimated_cost:.6} exceeds max_cost_usd {max:.6}"
                ));
            }
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), self.config.checks()),
            passed,
            if passed { "budget checks passed" } else { "budget violations" },
            false,
            json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "total_tokens": total_tokens,
                "cost_usd": estimated_cost,
                "violations": violations,
            }),
        )
    }
}
