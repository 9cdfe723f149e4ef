//! Matches the case's final textual output against every configured
//! pattern. Patterns live on the case; the judge itself has no settings.
//! Hard-fail.

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{extract_final_output, output_text, parse_config, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "regex";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegexConfig {}

#[derive(Debug, Default)]
pub struct RegexJudge {
    _config: RegexConfig,
}

impl RegexJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            _config: parse_config(JUDGE_ID, value)?,
        })
    }
}

impl Judge for RegexJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if case.regex_patterns.is_empty() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no regex patterns configured", true);
        }

        let Some(output) = extract_final_output(case) else {
            return JudgeResult::new(
                JUDGE_ID,
                &case.case_id,
                0.0,
                false,
                "final output missing for regex evaluation",
                true,
                json!({ "patterns": case.regex_patterns }),
            );
        };

        let text = output_text(&output);
        let mut missing = Vec::new();
        for pattern in &case.regex_patterns {
            match Regex::new(pattern) {
                Ok(regex) if regex.is_match(&text) => {}
                // An invalid pattern cannot match anything; count it missing.
                _ => missing.push(pattern.as_str()),
            }
        }

        let matched = case.regex_patterns.len() - missing.len();
        let score = matched as f64 / case.regex_patterns.len() as f64;
        let passed = missing.is_empty();

        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            score,
            passed,
            if passed {
                "regex checks passed"
            } else {
                "regex pattern mismatch"
            },
            true,
            json!({
                "patterns": case.regex_patterns,
                "missing_patterns": missing,
            }),
        )
    }
}
