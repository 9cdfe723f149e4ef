//! Propose/execute/repair loop. Each attempt shells out to the configured
//! agent command (stdin: JSON request, stdout: JSON response), resolves the
//! proposed tool calls against the case's recorded tool responses, rebuilds
//! a trace for the attempt and scores it with the evaluation runner. Failed
//! attempts are retried with the repair command until `max_repairs` is
//! exhausted.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::runner::EvalRunner;
use crate::errors::CoreError;
use crate::model::{
    AgentResponse, AttemptRecord, EvalCase, EvalSuite, ExecutionConfig, TraceEvent,
};
use crate::process::ChildExt;

/// Split a command line into argv, honoring single quotes, double quotes
/// and backslash escapes outside single quotes.
pub(crate) fn split_command(command: &str) -> Result<Vec<String>, CoreError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match quote {
            Some('\'') => {
                if ch == '\'' {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            Some('"') => match ch {
                '"' => quote = None,
                '\\' => {
                    let Some(next) = chars.next() else {
                        return Err(CoreError::UnbalancedCommand(command.to_string()));
                    };
                    if next != '"' && next != '\\' {
                        current.push('\\');
                    }
                    current.push(next);
                }
                _ => current.push(ch),
            },
            _ => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                '\\' => {
                    let Some(next) = chars.next() else {
                        return Err(CoreError::UnbalancedCommand(command.to_string()));
                    };
                    current.push(next);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        parts.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(CoreError::UnbalancedCommand(command.to_string()));
    }
    if in_word {
        parts.push(current);
    }
    if parts.is_empty() {
        return Err(CoreError::EmptyCommand);
    }
    Ok(parts)
}

fn error_response(error: String) -> AgentResponse {
    AgentResponse {
        error: Some(error),
        ..Default::default()
    }
}

/// Invoke an agent command once. Process failures never propagate as `Err`:
/// they come back as an `AgentResponse` whose `error` is set, and the loop
/// records them on the attempt like any other bad answer.
fn run_agent_command(command: &[String], payload: &Value, timeout: Duration) -> AgentResponse {
    let mut child = match Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return error_response(format!("failed to spawn '{}': {err}", command[0])),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let request = payload.to_string();
        if let Err(err) = stdin.write_all(request.as_bytes()) {
            warn!(command = %command[0], "failed to write request: {err}");
        }
        // Dropping stdin closes the pipe so the child sees EOF.
    }

    // Drain the pipes off-thread so a chatty child cannot deadlock against
    // the timeout poll below.
    let stdout_reader = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let collect = |handle: Option<std::thread::JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|h| h.join().ok())
            .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
            .unwrap_or_default()
    };

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = collect(stdout_reader);
            let _ = collect(stderr_reader);
            return error_response(format!("command timed out after {}s", timeout.as_secs()));
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return error_response(format!("failed to wait for command: {err}"));
        }
    };

    let stdout = collect(stdout_reader);
    let stderr = collect(stderr_reader);

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return error_response(format!("command exited {code}: {stderr}"));
    }

    if stdout.is_empty() {
        return AgentResponse {
            assistant_output: Some(json!("")),
            ..Default::default()
        };
    }

    let Ok(parsed) = serde_json::from_str::<Value>(&stdout) else {
        // Plain-text answers are allowed; the whole stdout becomes the output.
        return AgentResponse {
            assistant_output: Some(Value::String(stdout)),
            ..Default::default()
        };
    };
    if parsed.is_object() {
        match serde_json::from_value::<AgentResponse>(parsed) {
            Ok(response) => response,
            Err(err) => error_response(format!("malformed agent response: {err}")),
        }
    } else {
        AgentResponse {
            assistant_output: Some(parsed),
            ..Default::default()
        }
    }
}

struct TraceBuilder {
    trace_id: String,
    base_ts: DateTime<Utc>,
    attempt: u32,
    events: Vec<TraceEvent>,
}

impl TraceBuilder {
    fn new(attempt: u32) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            base_ts: Utc::now(),
            attempt,
            events: Vec::new(),
        }
    }

    fn push(
        &mut self,
        actor: &str,
        event_type: &str,
        input: Option<Value>,
        output: Option<Value>,
        tool: Option<String>,
        error: Option<String>,
    ) {
        let idx = self.events.len() as u32;
        let mut event = TraceEvent {
            idx,
            ts: (self.base_ts + chrono::Duration::seconds(i64::from(idx))).to_rfc3339(),
            actor: actor.to_string(),
            event_type: event_type.to_string(),
            input,
            output,
            tool: tool.clone(),
            error,
            trace_id: Some(self.trace_id.clone()),
            span_id: Some(format!("{:016x}", u64::from(idx) + 1)),
            parent_span_id: (idx > 0).then(|| format!("{:016x}", u64::from(idx))),
            attempt: Some(self.attempt),
            ..Default::default()
        };
        event
            .attributes
            .insert("gen_ai.operation.name".into(), json!(event_type));
        event
            .attributes
            .insert("gen_ai.tool.name".into(), json!(tool));
        self.events.push(event);
    }
}

/// Reconstruct a replayable trace for one attempt from the agent's response
/// and the case's canned tool responses.
fn build_attempt_trace(
    case: &EvalCase,
    attempt: u32,
    response: &AgentResponse,
    strict_side_effects: bool,
) -> Vec<TraceEvent> {
    let mut builder = TraceBuilder::new(attempt);
    builder.push("user", "message", Some(case.input.clone()), None, None, None);

    if let Some(error) = &response.error {
        builder.push(
            "agent",
            "message",
            None,
            response.assistant_output.clone(),
            None,
            Some(error.clone()),
        );
        return builder.events;
    }

    let mut unmatched_tools = Vec::new();
    for call in &response.tool_calls {
        let tool_name = call.tool.clone().unwrap_or_else(|| "unknown".into());
        builder.push(
            "agent",
            "tool_call",
            Some(call.arguments.clone()),
            None,
            Some(tool_name.clone()),
            None,
        );

        let (output, error) = match case.tool_responses.get(&tool_name) {
            Some(Value::Object(map)) if map.contains_key("error") => {
                let message = map
                    .get("error")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                (map.get("output").cloned(), Some(message))
            }
            Some(other) => (Some(other.clone()), None),
            None => {
                unmatched_tools.push(tool_name.clone());
                (None, Some("unknown_tool".to_string()))
            }
        };
        builder.push("tool", "tool_result", None, output, Some(tool_name), error);
    }

    // Strict side effects: a call the fixtures cannot answer means the
    // execution diverged from the recorded world, and the trace says so.
    if strict_side_effects && !unmatched_tools.is_empty() {
        builder.push(
            "env",
            "error",
            None,
            None,
            None,
            Some(format!(
                "no recorded responses for tools: {}",
                unmatched_tools.join(", ")
            )),
        );
    }

    builder.push(
        "assistant",
        "message",
        None,
        response.assistant_output.clone(),
        None,
        None,
    );
    builder.events
}

fn attempt_wire_record(record: &AttemptRecord) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

/// Drives live agent execution over a suite and returns a new suite whose
/// cases carry the traces of their selected attempts, ready for trace
/// scoring or archiving.
#[derive(Debug)]
pub struct ProposeExecuteRepairRunner<'a> {
    eval_runner: &'a EvalRunner,
    propose_command: Vec<String>,
    repair_command: Option<Vec<String>>,
    max_repairs: u32,
    timeout: Duration,
    strict_side_effects: bool,
}

impl<'a> ProposeExecuteRepairRunner<'a> {
    pub fn new(eval_runner: &'a EvalRunner, config: &ExecutionConfig) -> Result<Self, CoreError> {
        let propose = config
            .propose_command
            .as_deref()
            .ok_or(CoreError::MissingProposeCommand)?;
        Ok(Self {
            eval_runner,
            propose_command: split_command(propose)?,
            repair_command: config
                .repair_command
                .as_deref()
                .map(split_command)
                .transpose()?,
            max_repairs: config.max_repairs,
            timeout: Duration::from_secs(config.command_timeout_seconds),
            strict_side_effects: config.strict_side_effects,
        })
    }

    fn run_case_attempt(
        &self,
        case: &EvalCase,
        attempt: u32,
        previous_attempts: &[Value],
    ) -> (EvalCase, AgentResponse) {
        let (command, mode) = if attempt > 0 && self.repair_command.is_some() {
            (self.repair_command.as_deref().unwrap_or_default(), "repair")
        } else {
            (self.propose_command.as_slice(), "propose")
        };

        let payload = json!({
            "mode": mode,
            "case_id": case.case_id,
            "input": case.input,
            "expected_output": case.expected_output,
            "attempt": attempt,
            "previous_attempts": previous_attempts,
            "tool_contracts": case.tool_contracts,
            "policy": case.policy,
            "metadata": case.metadata,
        });

        debug!(case_id = %case.case_id, attempt, mode, "invoking agent command");
        let response = run_agent_command(command, &payload, self.timeout);
        let trace = build_attempt_trace(case, attempt, &response, self.strict_side_effects);

        let attempt_case = EvalCase {
            trace,
            attempt_history: Vec::new(),
            selected_attempt: None,
            ..case.clone()
        };
        (attempt_case, response)
    }

    /// Run the loop over every case and return the executed suite.
    pub fn run(&self, suite: &EvalSuite) -> EvalSuite {
        let mut output_cases = Vec::with_capacity(suite.cases.len());

        for case in &suite.cases {
            let mut history: Vec<AttemptRecord> = Vec::new();
            let mut wire_history: Vec<Value> = Vec::new();
            let mut selected: Option<(EvalCase, bool)> = None;

            for attempt in 0..=self.max_repairs {
                let (attempt_case, response) =
                    self.run_case_attempt(case, attempt, &wire_history);
                let case_result = self.eval_runner.evaluate_case(&attempt_case);
                info!(
                    case_id = %case.case_id,
                    attempt,
                    passed = case_result.passed,
                    hard_failed = case_result.hard_failed,
                    "attempt scored"
                );

                let record = AttemptRecord {
                    attempt,
                    passed: case_result.passed,
                    hard_failed: case_result.hard_failed,
                    response,
                    judge_results: case_result.judge_results,
                    replay_issues: case_result.replay_issues,
                };
                wire_history.push(attempt_wire_record(&record));
                history.push(record);

                let passed = case_result.passed;
                selected = Some((attempt_case, passed));
                if passed {
                    break;
                }
            }

            let (mut selected_case, loop_passed) = match selected {
                Some(pair) => pair,
                None => {
                    // max_repairs is unsigned, so the loop always ran; this
                    // arm only keeps the original case as a safe fallback.
                    let result = self.eval_runner.evaluate_case(case);
                    (case.clone(), result.passed)
                }
            };

            selected_case.selected_attempt = history.last().map(|record| record.attempt);
            selected_case.attempt_history = history;
            selected_case
                .metadata
                .insert("max_repairs".into(), json!(self.max_repairs));
            selected_case
                .metadata
                .insert("loop_passed".into(), json!(loop_passed));
            output_cases.push(selected_case);
        }

        let mut metadata = suite.metadata.clone();
        metadata.insert("execution_mode".into(), json!("propose_execute_repair"));
        EvalSuite {
            dataset_id: suite.dataset_id.clone(),
            cases: output_cases,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCallRequest;
    use crate::validate::validate_trace;

    #[test]
    fn split_command_handles_quotes_and_escapes() {
        assert_eq!(
            split_command(r#"python agent.py --name 'two words' --x "a \"b\"" c\ d"#).unwrap(),
            vec!["python", "agent.py", "--name", "two words", "--x", r#"a "b""#, "c d"],
        );
    }

    #[test]
    fn split_command_rejects_empty_and_unbalanced() {
        assert!(matches!(split_command("   "), Err(CoreError::EmptyCommand)));
        assert!(matches!(
            split_command("echo 'oops"),
            Err(CoreError::UnbalancedCommand(_))
        ));
    }

    fn case_with_fixture() -> EvalCase {
        let mut case = EvalCase {
            case_id: "c1".into(),
            input: json!("what is the weather?"),
            ..Default::default()
        };
        case.tool_responses
            .insert("weather".into(), json!({"temp_f": 72}));
        case
    }

    fn response_with_calls(tools: &[&str]) -> AgentResponse {
        AgentResponse {
            assistant_output: Some(json!("72F")),
            tool_calls: tools
                .iter()
                .map(|tool| ToolCallRequest {
                    tool: Some((*tool).into()),
                    arguments: json!({"city": "SF"}),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn attempt_trace_satisfies_the_replay_contract() {
        let case = case_with_fixture();
        let trace = build_attempt_trace(&case, 0, &response_with_calls(&["weather"]), false);
        assert!(validate_trace(&trace).is_empty(), "{:?}", validate_trace(&trace));
        let kinds: Vec<&str> = trace.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["message", "tool_call", "tool_result", "message"]);
        assert!(trace.iter().all(|e| e.attempt == Some(0)));
        // Span ids chain event to predecessor.
        assert_eq!(trace[1].parent_span_id, trace[0].span_id);
    }

    #[test]
    fn fixture_output_lands_on_the_tool_result() {
        let case = case_with_fixture();
        let trace = build_attempt_trace(&case, 0, &response_with_calls(&["weather"]), false);
        assert_eq!(trace[2].output, Some(json!({"temp_f": 72})));
        assert_eq!(trace[2].error, None);
    }

    #[test]
    fn unknown_tool_yields_error_result_not_panic() {
        let case = case_with_fixture();
        let trace = build_attempt_trace(&case, 0, &response_with_calls(&["nuke"]), false);
        assert_eq!(trace[2].error.as_deref(), Some("unknown_tool"));
        assert!(!trace.iter().any(|e| e.event_type == "error"));
    }

    #[test]
    fn strict_side_effects_record_an_error_event() {
        let case = case_with_fixture();
        let trace = build_attempt_trace(&case, 1, &response_with_calls(&["nuke"]), true);
        let error_event = trace.iter().find(|e| e.event_type == "error").unwrap();
        assert!(error_event.error.as_deref().unwrap().contains("nuke"));
    }

    #[test]
    fn fixture_error_objects_split_into_output_and_error() {
        let mut case = case_with_fixture();
        case.tool_responses.insert(
            "weather".into(),
            json!({"error": "upstream down", "output": {"partial": true}}),
        );
        let trace = build_attempt_trace(&case, 0, &response_with_calls(&["weather"]), false);
        assert_eq!(trace[2].error.as_deref(), Some("upstream down"));
        assert_eq!(trace[2].output, Some(json!({"partial": true})));
    }

    #[test]
    fn command_error_short_circuits_the_trace() {
        let case = case_with_fixture();
        let response = AgentResponse {
            error: Some("command exited 1: boom".into()),
            ..Default::default()
        };
        let trace = build_attempt_trace(&case, 0, &response, false);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[1].error.as_deref(), Some("command exited 1: boom"));
    }

    #[test]
    fn runner_requires_a_propose_command() {
        let eval_runner = EvalRunner::new(Vec::new());
        let err = ProposeExecuteRepairRunner::new(&eval_runner, &ExecutionConfig::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingProposeCommand));
    }

    #[test]
    #[cfg(unix)]
    fn failing_command_becomes_an_error_response() {
        let response = run_agent_command(
            &["false".to_string()],
            &json!({}),
            Duration::from_secs(5),
        );
        assert!(response.error.as_deref().unwrap().starts_with("command exited 1"));
    }

    #[test]
    #[cfg(unix)]
    fn plain_text_stdout_becomes_assistant_output() {
        let response = run_agent_command(
            &["sh".to_string(), "-c".to_string(), "cat >/dev/null; echo hello".to_string()],
            &json!({}),
            Duration::from_secs(5),
        );
        assert_eq!(response.assistant_output, Some(json!("hello")));
        assert!(response.error.is_none());
    }

    #[test]
    #[cfg(unix)]
    fn json_stdout_is_parsed_into_the_wire_shape() {
        let script = r#"cat >/dev/null; echo '{"assistant_output": "42", "tool_calls": [{"tool": "search", "arguments": {"q": "x"}}]}'"#;
        let response = run_agent_command(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            &json!({}),
            Duration::from_secs(5),
        );
        assert_eq!(response.assistant_output, Some(json!("42")));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].tool.as_deref(), Some("search"));
    }

    #[test]
    #[cfg(unix)]
    fn slow_command_times_out() {
        let response = run_agent_command(
            &["sleep".to_string(), "10".to_string()],
            &json!({}),
            Duration::from_millis(200),
        );
        assert!(response.error.as_deref().unwrap().contains("timed out"));
    }
}
