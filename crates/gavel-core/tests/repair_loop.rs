//! End-to-end propose/execute/repair runs against shell-script agents.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use gavel_core::engine::{EvalRunner, ProposeExecuteRepairRunner};
use gavel_core::judge::JudgeRegistry;
use gavel_core::model::{EvalCase, EvalSuite, ExecutionConfig, PolicySpec};

const GOOD_ANSWER: &str = r#"{"assistant_output": "72F and ok", "tool_calls": [{"tool": "search_weather", "arguments": {"city": "SF"}}]}"#;
const BAD_ANSWER: &str = r#"{"assistant_output": "no idea", "tool_calls": []}"#;

fn write_agent_script(dir: &Path, name: &str, stdout_line: &str) -> String {
    let path: PathBuf = dir.join(name);
    let script = format!("#!/bin/sh\ncat >/dev/null\necho '{stdout_line}'\n");
    std::fs::write(&path, script).unwrap();
    format!("sh {}", path.display())
}

fn weather_suite() -> EvalSuite {
    let mut case = EvalCase {
        case_id: "weather-1".into(),
        input: json!("weather in SF?"),
        policy: PolicySpec {
            required_tools: vec!["search_weather".into()],
            forbidden_tools: Vec::new(),
        },
        regex_patterns: vec!["72F".into()],
        ..Default::default()
    };
    case.tool_responses
        .insert("search_weather".into(), json!({"temp_f": 72}));
    EvalSuite {
        dataset_id: "weather".into(),
        cases: vec![case],
        ..Default::default()
    }
}

fn runner() -> EvalRunner {
    let names: Vec<String> = vec!["policy".into(), "regex".into(), "trajectory_step".into()];
    EvalRunner::new(
        JudgeRegistry::builtin()
            .instantiate_all(&names, &BTreeMap::new())
            .unwrap(),
    )
}

#[test]
fn passing_agent_finishes_in_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let eval_runner = runner();
    let config = ExecutionConfig {
        propose_command: Some(write_agent_script(dir.path(), "agent.sh", GOOD_ANSWER)),
        ..Default::default()
    };
    let loop_runner = ProposeExecuteRepairRunner::new(&eval_runner, &config).unwrap();

    let executed = loop_runner.run(&weather_suite());
    assert_eq!(executed.metadata["execution_mode"], "propose_execute_repair");

    let case = &executed.cases[0];
    assert_eq!(case.attempt_history.len(), 1);
    assert!(case.attempt_history[0].passed);
    assert_eq!(case.selected_attempt, Some(0));
    assert_eq!(case.metadata["loop_passed"], json!(true));

    let kinds: Vec<&str> = case.trace.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, vec!["message", "tool_call", "tool_result", "message"]);
    assert_eq!(case.trace[2].output, Some(json!({"temp_f": 72})));

    // The executed suite scores clean on a fresh evaluation.
    let result = eval_runner.evaluate_case(case);
    assert!(result.passed, "{:#?}", result.judge_results);
}

#[test]
fn repair_command_rescues_a_failing_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let eval_runner = runner();
    let config = ExecutionConfig {
        propose_command: Some(write_agent_script(dir.path(), "propose.sh", BAD_ANSWER)),
        repair_command: Some(write_agent_script(dir.path(), "repair.sh", GOOD_ANSWER)),
        ..Default::default()
    };
    let loop_runner = ProposeExecuteRepairRunner::new(&eval_runner, &config).unwrap();

    let executed = loop_runner.run(&weather_suite());
    let case = &executed.cases[0];

    assert_eq!(case.attempt_history.len(), 2);
    assert!(!case.attempt_history[0].passed);
    assert!(case.attempt_history[1].passed);
    assert_eq!(case.selected_attempt, Some(1));
    assert_eq!(case.metadata["loop_passed"], json!(true));
    assert!(case.trace.iter().all(|e| e.attempt == Some(1)));

    // First attempt kept the failing response for diagnosis.
    assert_eq!(
        case.attempt_history[0].response.assistant_output,
        Some(json!("no idea"))
    );
}

#[test]
fn exhausted_repairs_keep_the_last_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let eval_runner = runner();
    let config = ExecutionConfig {
        propose_command: Some(write_agent_script(dir.path(), "bad.sh", BAD_ANSWER)),
        max_repairs: 1,
        ..Default::default()
    };
    let loop_runner = ProposeExecuteRepairRunner::new(&eval_runner, &config).unwrap();

    let executed = loop_runner.run(&weather_suite());
    let case = &executed.cases[0];

    assert_eq!(case.attempt_history.len(), 2);
    assert!(case.attempt_history.iter().all(|a| !a.passed));
    assert_eq!(case.selected_attempt, Some(1));
    assert_eq!(case.metadata["loop_passed"], json!(false));
}

#[test]
fn crashing_agent_is_recorded_as_an_error_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.sh");
    std::fs::write(&path, "#!/bin/sh\ncat >/dev/null\necho boom >&2\nexit 3\n").unwrap();

    let eval_runner = runner();
    let config = ExecutionConfig {
        propose_command: Some(format!("sh {}", path.display())),
        max_repairs: 0,
        ..Default::default()
    };
    let loop_runner = ProposeExecuteRepairRunner::new(&eval_runner, &config).unwrap();

    let executed = loop_runner.run(&weather_suite());
    let case = &executed.cases[0];

    assert_eq!(case.attempt_history.len(), 1);
    assert!(!case.attempt_history[0].passed);
    let error = case.attempt_history[0].response.error.as_deref().unwrap();
    assert!(error.contains("exited 3"), "{error}");
    assert!(error.contains("boom"), "{error}");

    // The attempt trace ends at the error message event.
    assert_eq!(case.trace.len(), 2);
    assert_eq!(case.trace[1].error.as_deref(), Some(error));
}
