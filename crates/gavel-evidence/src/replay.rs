//! Replay verification of saved runs.
//!
//! Score replay rebuilds the suite from the saved trajectories, re-runs the
//! exact judges named in the saved config and checks that every verdict,
//! the summary and the pinned environment still agree. Execution replay
//! additionally re-drives the propose/execute/repair loop with the saved
//! commands and compares the regenerated traces (normalized by dropping
//! volatile fields) against the saved ones. Mismatches are reported, never
//! corrected.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use gavel_core::engine::{EvalRunner, ProposeExecuteRepairRunner};
use gavel_core::environment::{capture_environment, compare_pins, EnvMismatch};
use gavel_core::judge::JudgeRegistry;
use gavel_core::model::{CaseResult, EvalCase, ExecutionMode, RunConfig, RunSummary};

use crate::errors::EvidenceError;
use crate::pack::{read_run_config, read_saved_verdicts, read_suite_from_pack, read_summary, write_json};

/// A trace event with volatile fields (timestamps, trace/span ids) removed,
/// used for execution-replay trace equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub idx: u32,
    pub actor: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub tool: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempt: Option<u32>,
}

pub fn normalize_trace(case: &EvalCase) -> Vec<NormalizedEvent> {
    case.trace
        .iter()
        .map(|event| NormalizedEvent {
            idx: event.idx,
            actor: event.actor.clone(),
            event_type: event.event_type.clone(),
            tool: event.tool.clone(),
            input: event.input.clone(),
            output: event.output.clone(),
            error: event.error.clone(),
            attempt: event.attempt,
        })
        .collect()
}

/// One case whose replayed verdict diverged from the saved one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseMismatch {
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_hard_failed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_hard_failed: Option<bool>,
}

/// One case whose regenerated trace or selected attempt diverged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceMismatch {
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_selected_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_selected_attempt: Option<u32>,
    #[serde(default)]
    pub saved_event_count: usize,
    #[serde(default)]
    pub replayed_event_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub run_id: String,
    pub dataset_id: String,
    pub replay_passed: bool,
    pub summary_match: bool,
    pub saved_summary: RunSummary,
    pub replayed_summary: RunSummary,
    pub case_mismatches: Vec<CaseMismatch>,
    pub env_mismatches: Vec<EnvMismatch>,
    pub out: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReplayReport {
    pub run_id: String,
    pub dataset_id: String,
    pub execution_replay_passed: bool,
    pub summary_match: bool,
    pub saved_summary: RunSummary,
    pub replayed_summary: RunSummary,
    pub case_mismatches: Vec<CaseMismatch>,
    pub trace_mismatches: Vec<TraceMismatch>,
    pub env_mismatches: Vec<EnvMismatch>,
    pub out: PathBuf,
}

fn build_runner(run_config: &RunConfig) -> Result<EvalRunner, EvidenceError> {
    let judges = JudgeRegistry::builtin()
        .instantiate_all(&run_config.judges, &run_config.judge_configs)?;
    Ok(EvalRunner::new(judges))
}

fn verdict_mismatches(
    replayed: &[CaseResult],
    saved: &std::collections::BTreeMap<String, CaseResult>,
) -> Vec<CaseMismatch> {
    let mut mismatches = Vec::new();
    for case_result in replayed {
        let Some(saved_verdict) = saved.get(&case_result.case_id) else {
            mismatches.push(CaseMismatch {
                case_id: case_result.case_id.clone(),
                error: Some("missing saved case verdict".into()),
                saved_passed: None,
                replayed_passed: None,
                saved_hard_failed: None,
                replayed_hard_failed: None,
            });
            continue;
        };
        if saved_verdict.passed != case_result.passed
            || saved_verdict.hard_failed != case_result.hard_failed
        {
            mismatches.push(CaseMismatch {
                case_id: case_result.case_id.clone(),
                error: None,
                saved_passed: Some(saved_verdict.passed),
                replayed_passed: Some(case_result.passed),
                saved_hard_failed: Some(saved_verdict.hard_failed),
                replayed_hard_failed: Some(case_result.hard_failed),
            });
        }
    }
    mismatches
}

/// Score replay: recompute verdicts from the saved trajectories and compare
/// everything against the saved artifacts.
pub fn replay_run(
    pack_dir: &Path,
    out_path: Option<&Path>,
) -> Result<ReplayReport, EvidenceError> {
    let run_config = read_run_config(pack_dir)?;
    let suite = read_suite_from_pack(pack_dir)?;
    let saved_summary = read_summary(pack_dir)?;
    let saved_verdicts = read_saved_verdicts(pack_dir)?;

    let runner = build_runner(&run_config)?;
    let (replayed_cases, replayed_summary) = runner.run(&suite, &run_config);

    let case_mismatches = verdict_mismatches(&replayed_cases, &saved_verdicts);
    let summary_match = replayed_summary == saved_summary;
    let env_mismatches = compare_pins(&run_config.pinned_env, &capture_environment(None));
    let replay_passed = summary_match && case_mismatches.is_empty() && env_mismatches.is_empty();

    let out = out_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| pack_dir.join("compare").join("replay_report.json"));
    let report = ReplayReport {
        run_id: run_config.run_id,
        dataset_id: run_config.dataset_id,
        replay_passed,
        summary_match,
        saved_summary,
        replayed_summary,
        case_mismatches,
        env_mismatches,
        out: out.clone(),
    };
    write_json(&out, &report)?;
    info!(
        run_id = %report.run_id,
        replay_passed = report.replay_passed,
        "score replay complete"
    );
    Ok(report)
}

/// Execution replay: re-run the saved propose/execute/repair loop and
/// require byte-stable verdicts, summaries and normalized traces.
pub fn replay_execute_run(
    pack_dir: &Path,
    out_path: Option<&Path>,
) -> Result<ExecutionReplayReport, EvidenceError> {
    let run_config = read_run_config(pack_dir)?;
    if run_config.execution_mode != ExecutionMode::ProposeExecuteRepair {
        return Err(EvidenceError::NotExecutionRun);
    }

    let saved_suite = read_suite_from_pack(pack_dir)?;
    let saved_summary = read_summary(pack_dir)?;
    let saved_verdicts = read_saved_verdicts(pack_dir)?;

    let eval_runner = build_runner(&run_config)?;
    let loop_runner = ProposeExecuteRepairRunner::new(&eval_runner, &run_config.execution_config)?;
    let replayed_suite = loop_runner.run(&saved_suite);
    let (replayed_cases, replayed_summary) = eval_runner.run(&replayed_suite, &run_config);

    let case_mismatches = verdict_mismatches(&replayed_cases, &saved_verdicts);

    let mut trace_mismatches = Vec::new();
    for replayed_case in &replayed_suite.cases {
        let Some(saved_case) = saved_suite
            .cases
            .iter()
            .find(|case| case.case_id == replayed_case.case_id)
        else {
            trace_mismatches.push(TraceMismatch {
                case_id: replayed_case.case_id.clone(),
                error: Some("missing saved trajectory".into()),
                saved_selected_attempt: None,
                replayed_selected_attempt: None,
                saved_event_count: 0,
                replayed_event_count: 0,
            });
            continue;
        };
        let saved_trace = normalize_trace(saved_case);
        let replayed_trace = normalize_trace(replayed_case);
        if saved_trace != replayed_trace
            || saved_case.selected_attempt != replayed_case.selected_attempt
        {
            trace_mismatches.push(TraceMismatch {
                case_id: replayed_case.case_id.clone(),
                error: None,
                saved_selected_attempt: saved_case.selected_attempt,
                replayed_selected_attempt: replayed_case.selected_attempt,
                saved_event_count: saved_trace.len(),
                replayed_event_count: replayed_trace.len(),
            });
        }
    }

    let summary_match = replayed_summary == saved_summary;
    let env_mismatches = compare_pins(&run_config.pinned_env, &capture_environment(None));
    let execution_replay_passed = summary_match
        && case_mismatches.is_empty()
        && trace_mismatches.is_empty()
        && env_mismatches.is_empty();

    let out = out_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| pack_dir.join("compare").join("replay_exec_report.json"));
    let report = ExecutionReplayReport {
        run_id: run_config.run_id,
        dataset_id: run_config.dataset_id,
        execution_replay_passed,
        summary_match,
        saved_summary,
        replayed_summary,
        case_mismatches,
        trace_mismatches,
        env_mismatches,
        out: out.clone(),
    };
    write_json(&out, &report)?;
    info!(
        run_id = %report.run_id,
        execution_replay_passed = report.execution_replay_passed,
        "execution replay complete"
    );
    Ok(report)
}
