//! Judge framework: a judge is configured once and exposes a pure
//! `evaluate(case) -> JudgeResult`, with no I/O beyond what the case already
//! carries, so replay can reproduce its verdict exactly.
//!
//! Judges are resolved through an explicit registration table, never by
//! parsing module paths at runtime; external plugins register a constructor
//! under their own id at process start.

pub mod cost_budget;
pub mod json_schema;
pub mod latency_slo;
pub mod loop_guard;
pub mod policy;
pub mod prompt_injection;
pub mod regex;
pub mod repair_path;
pub mod retry_storm;
pub mod tool_abuse;
pub mod tool_contract;
pub mod trajectory_step;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::CoreError;
use crate::model::{EvalCase, JudgeResult};

/// Judge ids run by default when the caller selects none.
pub const DEFAULT_JUDGES: &[&str] = &[
    "tool_contract",
    "policy",
    "trajectory_step",
    "regex",
    "json_schema",
];

/// A configured verdict function over a single case.
///
/// Evaluation is total: a judge cannot fail at evaluation time. Invalid
/// configuration is rejected at construction, before any case is scored.
pub trait Judge: Send + Sync {
    fn id(&self) -> &'static str;
    fn evaluate(&self, case: &EvalCase) -> JudgeResult;
}

impl std::fmt::Debug for dyn Judge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Judge").field("id", &self.id()).finish()
    }
}

type JudgeCtor = Box<dyn Fn(&Value) -> Result<Box<dyn Judge>, CoreError> + Send + Sync>;

/// Registration table mapping stable judge ids to constructors.
pub struct JudgeRegistry {
    ctors: BTreeMap<String, JudgeCtor>,
}

impl JudgeRegistry {
    /// Empty registry, for callers that want full control over the table.
    pub fn new() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with every built-in judge.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("tool_contract", |cfg| {
            Ok(Box::new(tool_contract::ToolContractJudge::from_config(cfg)?))
        });
        registry.register("policy", |cfg| {
            Ok(Box::new(policy::PolicyJudge::from_config(cfg)?))
        });
        registry.register("regex", |cfg| {
            Ok(Box::new(regex::RegexJudge::from_config(cfg)?))
        });
        registry.register("json_schema", |cfg| {
            Ok(Box::new(json_schema::JsonSchemaJudge::from_config(cfg)?))
        });
        registry.register("trajectory_step", |cfg| {
            Ok(Box::new(trajectory_step::TrajectoryStepJudge::from_config(cfg)?))
        });
        registry.register("repair_path", |cfg| {
            Ok(Box::new(repair_path::RepairPathJudge::from_config(cfg)?))
        });
        registry.register("cost_budget", |cfg| {
            Ok(Box::new(cost_budget::CostBudgetJudge::from_config(cfg)?))
        });
        registry.register("latency_slo", |cfg| {
            Ok(Box::new(latency_slo::LatencySloJudge::from_config(cfg)?))
        });
        registry.register("retry_storm", |cfg| {
            Ok(Box::new(retry_storm::RetryStormJudge::from_config(cfg)?))
        });
        registry.register("loop_guard", |cfg| {
            Ok(Box::new(loop_guard::LoopGuardJudge::from_config(cfg)?))
        });
        registry.register("tool_abuse", |cfg| {
            Ok(Box::new(tool_abuse::ToolAbuseJudge::from_config(cfg)?))
        });
        registry.register("prompt_injection", |cfg| {
            Ok(Box::new(prompt_injection::PromptInjectionJudge::from_config(cfg)?))
        });
        registry
    }

    /// Register (or replace) a constructor under a stable id. This is the
    /// plugin surface: out-of-tree judges call this at process start.
    pub fn register<F>(&mut self, id: &str, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Judge>, CoreError> + Send + Sync + 'static,
    {
        self.ctors.insert(id.to_string(), Box::new(ctor));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ctors.contains_key(id)
    }

    /// Registered judge ids, sorted.
    pub fn names(&self) -> Vec<String> {
        self.ctors.keys().cloned().collect()
    }

    /// Build one judge from its id and free-form config value.
    pub fn instantiate(&self, id: &str, config: &Value) -> Result<Box<dyn Judge>, CoreError> {
        let ctor = self
            .ctors
            .get(id)
            .ok_or_else(|| CoreError::UnknownJudge(id.to_string()))?;
        ctor(config)
    }

    /// Build the ordered judge list for a run, pulling each judge's config
    /// from the per-judge config map (missing entries mean "defaults").
    pub fn instantiate_all(
        &self,
        names: &[String],
        configs: &BTreeMap<String, Value>,
    ) -> Result<Vec<Box<dyn Judge>>, CoreError> {
        names
            .iter()
            .map(|name| {
                let config = configs.get(name).cloned().unwrap_or(Value::Null);
                self.instantiate(name, &config)
            })
            .collect()
    }
}

impl Default for JudgeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Deserialize a typed judge config, treating `null` as "all defaults".
pub(crate) fn parse_config<T>(judge: &str, value: &Value) -> Result<T, CoreError>
where
    T: Default + serde::de::DeserializeOwned,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|source| CoreError::JudgeConfig {
        judge: judge.to_string(),
        source,
    })
}

/// Uniform score rule shared by every multi-check judge: `1 - violations/checks`,
/// clamped to [0, 1]. Preserved exactly for replay comparability.
pub(crate) fn violation_score(violations: usize, checks: usize) -> f64 {
    let checks = checks.max(1) as f64;
    (1.0 - violations as f64 / checks).clamp(0.0, 1.0)
}

/// The final textual output of a case: the last assistant/agent output,
/// falling back to the last non-empty output, falling back to the expected
/// output (`None` when that too is null).
pub(crate) fn extract_final_output(case: &EvalCase) -> Option<Value> {
    for event in case.trace.iter().rev() {
        if event.output.is_some() && matches!(event.actor.as_str(), "assistant" | "agent") {
            return event.output.clone();
        }
    }
    for event in case.trace.iter().rev() {
        if event.output.is_some() {
            return event.output.clone();
        }
    }
    (!case.expected_output.is_null()).then(|| case.expected_output.clone())
}

/// Render an output value as text for pattern matching: strings verbatim,
/// everything else as compact JSON.
pub(crate) fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON with recursively sorted object keys, so identical arguments always
/// fingerprint identically regardless of key order.
pub(crate) fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}
