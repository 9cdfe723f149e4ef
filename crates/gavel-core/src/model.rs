//! Canonical data model: trace events, cases, suites, judge/case results,
//! run configuration and summary.
//!
//! Everything here is plain data plus invariant checks; no I/O. Maps are
//! `BTreeMap` so that serialized artifacts are byte-stable regardless of
//! insertion order, which the replay engine relies on for structural
//! equality checks.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CoreError;

/// Schema version stamped on run configs and summaries.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// RFC-3339 timestamp for "now", used wherever artifacts record generation time.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// One step of a recorded execution.
///
/// `idx` is dense and zero-based; `span_id` values are unique within the
/// trace and every event after the first chains to its predecessor via
/// `parent_span_id` unless an importer overrode the linkage. The
/// replay-contract validator enforces these invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub idx: u32,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub actor: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Repair-loop iteration that produced this event; 0 for single-shot traces.
    #[serde(default)]
    pub attempt: Option<u32>,
}

/// Per-tool argument contract: names that must be present and names that
/// must never appear in a `tool_call` input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContractSpec {
    #[serde(default, alias = "required")]
    pub required_args: Vec<String>,
    #[serde(default, alias = "forbidden")]
    pub forbidden_args: Vec<String>,
}

/// Tools the agent must invoke at least once / must never invoke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
}

impl PolicySpec {
    pub fn is_empty(&self) -> bool {
        self.required_tools.is_empty() && self.forbidden_tools.is_empty()
    }
}

/// One tool invocation requested by the agent over the subprocess wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default, alias = "name")]
    pub tool: Option<String>,
    #[serde(default, alias = "input")]
    pub arguments: Value,
}

/// Parsed response of one propose/repair subprocess invocation.
///
/// Wire contract: the command receives a JSON request on stdin and must emit
/// exactly one JSON object `{assistant_output, tool_calls, error?, metadata?}`
/// on stdout. Non-JSON stdout and process failures are mapped onto this type
/// rather than raised (the error is carried in `error`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, alias = "output")]
    pub assistant_output: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Bookkeeping for one iteration of the propose/execute/repair loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub passed: bool,
    pub hard_failed: bool,
    pub response: AgentResponse,
    pub judge_results: Vec<JudgeResult>,
    pub replay_issues: Vec<String>,
}

/// One evaluable unit: an input, the recorded trace, and the declarative
/// pass/fail criteria the judges check against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalCase {
    pub case_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, alias = "expected")]
    pub expected_output: Value,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
    #[serde(default)]
    pub tool_contracts: BTreeMap<String, ToolContractSpec>,
    #[serde(default)]
    pub policy: PolicySpec,
    #[serde(default, alias = "regex")]
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub json_schema: Option<Value>,
    /// Canned tool results the repair loop resolves `tool_call`s against.
    #[serde(default)]
    pub tool_responses: BTreeMap<String, Value>,
    /// Full repair history; written by the loop runner, read by `repair_path`.
    #[serde(default)]
    pub attempt_history: Vec<AttemptRecord>,
    /// Attempt number whose trace this case carries, once the loop has run.
    #[serde(default)]
    pub selected_attempt: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Ordered collection of cases sharing a dataset id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSuite {
    pub dataset_id: String,
    #[serde(default)]
    pub cases: Vec<EvalCase>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl EvalSuite {
    /// Parse a suite from a JSON value and check structural invariants.
    pub fn from_value(payload: Value) -> Result<Self, CoreError> {
        let suite: EvalSuite =
            serde_json::from_value(payload).map_err(|source| CoreError::SuiteParse {
                path: "<value>".into(),
                source,
            })?;
        suite.check_case_ids()?;
        Ok(suite)
    }

    /// Load a suite document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::SuiteRead {
            path: path.display().to_string(),
            source,
        })?;
        let suite: EvalSuite =
            serde_json::from_str(&raw).map_err(|source| CoreError::SuiteParse {
                path: path.display().to_string(),
                source,
            })?;
        suite.check_case_ids()?;
        Ok(suite)
    }

    fn check_case_ids(&self) -> Result<(), CoreError> {
        let mut seen = BTreeSet::new();
        for case in &self.cases {
            if !seen.insert(case.case_id.as_str()) {
                return Err(CoreError::DuplicateCaseId {
                    dataset_id: self.dataset_id.clone(),
                    case_id: case.case_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Verdict of a single judge over a single case.
///
/// `skipped=true` means the judge had nothing to check (no applicable
/// configuration); a skipped result always carries `passed=true` and is
/// excluded from every aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub judge_id: String,
    pub case_id: String,
    pub score: f64,
    pub passed: bool,
    pub reason: String,
    pub hard_fail: bool,
    #[serde(default)]
    pub evidence: Value,
    #[serde(default)]
    pub skipped: bool,
}

impl JudgeResult {
    pub fn new(
        judge_id: &str,
        case_id: &str,
        score: f64,
        passed: bool,
        reason: impl Into<String>,
        hard_fail: bool,
        evidence: Value,
    ) -> Self {
        Self {
            judge_id: judge_id.to_string(),
            case_id: case_id.to_string(),
            score: score.clamp(0.0, 1.0),
            passed,
            reason: reason.into(),
            hard_fail,
            evidence,
            skipped: false,
        }
    }

    /// A judge with no applicable configuration declines to evaluate.
    pub fn skipped(judge_id: &str, case_id: &str, reason: impl Into<String>, hard_fail: bool) -> Self {
        Self {
            judge_id: judge_id.to_string(),
            case_id: case_id.to_string(),
            score: 1.0,
            passed: true,
            reason: reason.into(),
            hard_fail,
            evidence: Value::Null,
            skipped: true,
        }
    }
}

/// Aggregated verdict for one case: AND over non-skipped judge results,
/// with hard failure when any failing result was flagged `hard_fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub passed: bool,
    pub hard_failed: bool,
    pub judge_results: Vec<JudgeResult>,
    #[serde(default)]
    pub replay_issues: Vec<String>,
}

/// How a run produced its traces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    TraceScore,
    ProposeExecuteRepair,
}

fn default_max_repairs() -> u32 {
    2
}

fn default_command_timeout() -> u64 {
    30
}

/// Settings for the propose/execute/repair loop, persisted so that
/// execution replay can re-invoke the exact same commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub propose_command: Option<String>,
    pub repair_command: Option<String>,
    pub max_repairs: u32,
    pub command_timeout_seconds: u64,
    pub strict_side_effects: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            propose_command: None,
            repair_command: None,
            max_repairs: default_max_repairs(),
            command_timeout_seconds: default_command_timeout(),
            strict_side_effects: false,
        }
    }
}

/// Environment facts pinned at run time and re-checked at replay time.
///
/// Empty/absent fields were never pinned and are skipped by the comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinnedEnvironment {
    pub harness_version: Option<String>,
    pub platform: Option<String>,
    pub machine: Option<String>,
    pub git_commit: Option<String>,
    pub dependency_lock_hash: Option<String>,
    pub container_image: Option<String>,
    pub prompt_hash: Option<String>,
    pub policy_hash: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Identity and configuration of one evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub dataset_id: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub seed: u64,
    /// Judge ids in evaluation order; order is part of the replay contract.
    #[serde(default)]
    pub judges: Vec<String>,
    #[serde(default)]
    pub judge_configs: BTreeMap<String, Value>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
    #[serde(default)]
    pub pinned_env: PinnedEnvironment,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

/// Run-level counts and rates. Per-judge pass rates are computed only over
/// that judge's non-skipped evaluations.
///
/// Field aliases keep summaries from older schema revisions readable; the
/// comparison engine depends on this so diffs never fail on schema drift.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default, alias = "total")]
    pub total_cases: u64,
    #[serde(default, alias = "passed")]
    pub passed_cases: u64,
    #[serde(default, alias = "failed")]
    pub failed_cases: u64,
    #[serde(default, alias = "hard_fail_count", alias = "hard_failed")]
    pub hard_fail_cases: u64,
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub hard_fail_rate: f64,
    #[serde(default, alias = "judge_rates")]
    pub judge_pass_rates: BTreeMap<String, f64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}
