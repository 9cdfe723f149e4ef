//! Per-event and aggregate latency against configured ceilings, including
//! p95/p99. Percentile is the value at index `ceil(pct/100 * n) - 1` of the
//! sorted latency list. Soft failure; skips when no SLO is configured.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CoreError;
use crate::judge::{parse_config, violation_score, Judge};
use crate::model::{EvalCase, JudgeResult};

const JUDGE_ID: &str = "latency_slo";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LatencySloConfig {
    pub max_event_latency_ms: Option<f64>,
    pub max_total_latency_ms: Option<f64>,
    pub max_p95_latency_ms: Option<f64>,
    pub max_p99_latency_ms: Option<f64>,
}

impl LatencySloConfig {
    fn has_slo(&self) -> bool {
        self.max_event_latency_ms.is_some()
            || self.max_total_latency_ms.is_some()
            || self.max_p95_latency_ms.is_some()
            || self.max_p99_latency_ms.is_some()
    }

    fn checks(&self) -> usize {
        [
            self.max_event_latency_ms,
            self.max_total_latency_ms,
            self.max_p95_latency_ms,
            self.max_p99_latency_ms,
        ]
        .iter()
        .filter(|t| t.is_some())
        .count()
    }
}

#[derive(Debug, Default)]
pub struct LatencySloJudge {
    config: LatencySloConfig,
}

impl LatencySloJudge {
    pub fn from_config(value: &Value) -> Result<Self, CoreError> {
        Ok(Self {
            config: parse_config(JUDGE_ID, value)?,
        })
    }
}

pub(crate) fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.total_cmp(b));
    let raw = ((pct / 100.0) * ordered.len() as f64).ceil() as usize;
    let idx = raw.saturating_sub(1).min(ordered.len() - 1);
    ordered[idx]
}

fn collect_latencies(case: &EvalCase) -> Vec<f64> {
    let mut latencies = Vec::new();
    for event in &case.trace {
        if let Some(latency) = event.latency_ms {
            latencies.push(latency as f64);
            continue;
        }
        if let Some(value) = event.attributes.get("latency_ms").and_then(Value::as_f64) {
            latencies.push(value);
        }
    }
    latencies
}

impl Judge for LatencySloJudge {
    fn id(&self) -> &'static str {
        JUDGE_ID
    }

    fn evaluate(&self, case: &EvalCase) -> JudgeResult {
        if !self.config.has_slo() {
            return JudgeResult::skipped(JUDGE_ID, &case.case_id, "no latency SLO configured", false);
        }

        let latencies = collect_latencies(case);
        if latencies.is_empty() {
            return JudgeResult::new(
                JUDGE_ID,
                &case.case_id,
                0.0,
                false,
                "latency SLO configured but no latency data",
                false,
                json!({ "violations": ["missing latency metrics"] }),
            );
        }

        let total: f64 = latencies.iter().sum();
        let worst = latencies.iter().copied().fold(f64::MIN, f64::max);
        let p95 = percentile(&latencies, 95.0);
        let p99 = percentile(&latencies, 99.0);

        let mut violations = Vec::new();
        if let Some(max) = self.config.max_event_latency_ms {
            if worst > max {
                violations.push(format!(
                    "max_event_latency_ms {worst:.2} exceeds limit {max:.2}"
                ));
            }
        }
        if let Some(max) = self.config.max_total_latency_ms {
            if total > max {
                violations.push(format!("total_latency_ms {total:.2} exceeds limit {max:.2}"));
            }
        }
        if let Some(max) = self.config.max_p95_latency_ms {
            if p95 > max {
                violations.push(format!("p95_latency_ms {p95:.2} exceeds limit {max:.2}"));
            }
        }
        if let Some(max) = self.config.max_p99_latency_ms {
            if p99 > max {
                violations.push(format!("p99_latency_ms {p99:.2} exceeds limit {max:.2}"));
            }
        }

        let passed = violations.is_empty();
        JudgeResult::new(
            JUDGE_ID,
            &case.case_id,
            violation_score(violations.len(), self.config.checks()),
            passed,
            if passed { "latency SLO passed" } else { "latency SLO violations" },
            false,
            json!({
                "latency_count": latencies.len(),
                "max_latency_ms": worst,
                "total_latency_ms": total,
                "p95_latency_ms": p95,
                "p99_latency_ms": p99,
                "violations": violations,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TraceEvent;

    fn case_with_latencies(latencies: &[i64]) -> EvalCase {
        EvalCase {
            case_id: "c1".into(),
            trace: latencies
                .iter()
                .enumerate()
                .map(|(idx, latency)| TraceEvent {
                    idx: idx as u32,
                    actor: "agent".into(),
                    event_type: "message".into(),
                    latency_ms: Some(*latency),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn skips_without_slo() {
        let case = case_with_latencies(&[10_000]);
        let judge = LatencySloJudge::from_config(&Value::Null).unwrap();
        assert!(judge.evaluate(&case).skipped);
    }

    #[test]
    fn percentile_index_formula() {
        // ceil(0.95 * 3) - 1 = 2
        assert_eq!(percentile(&[120.0, 250.0, 410.0], 95.0), 410.0);
        assert_eq!(percentile(&[120.0, 250.0, 410.0], 50.0), 250.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn p95_violation_over_three_events() {
        let case = case_with_latencies(&[120, 250, 410]);
        let judge = LatencySloJudge::from_config(&json!({"max_p95_latency_ms": 300})).unwrap();
        let result = judge.evaluate(&case);
        assert!(!result.passed);
        assert_eq!(result.evidence["p95_latency_ms"], 410.0);
    }

    #[test]
    fn slo_without_latency_data_fails() {
        let case = EvalCase {
            case_id: "c1".into(),
            ..Default::default()
        };
        let judge = LatencySloJudge::from_config(&json!({"max_total_latency_ms": 100})).unwrap();
        let result = judge.evaluate(&case);
        assert!(!result.passed);
        assert!(!result.skipped);
    }

    #[test]
    fn attribute_latency_used_when_field_absent() {
        let mut case = EvalCase {
            case_id: "c1".into(),
            ..Default::default()
        };
        let mut event = TraceEvent {
            idx: 0,
            actor: "agent".into(),
            event_type: "message".into(),
            ..Default::default()
        };
        event.attributes.insert("latency_ms".into(), json!(950));
        case.trace.push(event);

        let judge = LatencySloJudge::from_config(&json!({"max_event_latency_ms": 500})).unwrap();
        assert!(!judge.evaluate(&case).passed);
    }

    #[test]
    fn within_slo_passes() {
        let case = case_with_latencies(&[100, 150, 200]);
        let judge = LatencySloJudge::from_config(&json!({
            "max_event_latency_ms": 300,
            "max_total_latency_ms": 500,
            "max_p95_latency_ms": 250,
        }))
        .unwrap();
        let result = judge.evaluate(&case);
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }
}
