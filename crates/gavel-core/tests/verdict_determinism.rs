//! Runner-level invariants: verdict aggregation, score bounds and
//! bit-for-bit determinism of repeated evaluation.

use std::collections::BTreeMap;

use serde_json::json;

use gavel_core::engine::EvalRunner;
use gavel_core::judge::JudgeRegistry;
use gavel_core::model::{
    EvalCase, EvalSuite, PolicySpec, RunConfig, ToolContractSpec, TraceEvent,
};

fn all_judges_runner() -> EvalRunner {
    let registry = JudgeRegistry::builtin();
    let names = registry.names();
    EvalRunner::new(registry.instantiate_all(&names, &BTreeMap::new()).unwrap())
}

fn event(idx: u32, actor: &str, event_type: &str) -> TraceEvent {
    TraceEvent {
        idx,
        actor: actor.into(),
        event_type: event_type.into(),
        ..Default::default()
    }
}

fn weather_case() -> EvalCase {
    let mut call = event(0, "agent", "tool_call");
    call.tool = Some("search_weather".into());
    call.input = Some(json!({"city": "SF"}));
    let mut result = event(1, "tool", "tool_result");
    result.tool = Some("search_weather".into());
    result.output = Some(json!({"temp_f": 72}));
    let mut answer = event(2, "assistant", "message");
    answer.output = Some(json!(r#"{"answer":"72F","status":"ok"}"#));

    let mut tool_contracts = BTreeMap::new();
    tool_contracts.insert(
        "search_weather".to_string(),
        ToolContractSpec {
            required_args: vec!["city".into()],
            forbidden_args: vec!["api_key".into()],
        },
    );

    EvalCase {
        case_id: "weather-1".into(),
        input: json!("weather in SF?"),
        trace: vec![call, result, answer],
        tool_contracts,
        policy: PolicySpec {
            required_tools: vec!["search_weather".into()],
            forbidden_tools: vec!["delete_database".into()],
        },
        regex_patterns: vec!["72F".into(), "ok".into()],
        json_schema: Some(json!({
            "type": "object",
            "required": ["answer", "status"],
            "properties": {"status": {"type": "string", "enum": ["ok", "retry"]}},
        })),
        ..Default::default()
    }
}

fn broken_case() -> EvalCase {
    // Orphaned tool_call plus a policy violation.
    let mut call = event(0, "agent", "tool_call");
    call.tool = Some("delete_database".into());
    EvalCase {
        case_id: "broken-1".into(),
        trace: vec![call],
        policy: PolicySpec {
            required_tools: vec!["search_weather".into()],
            forbidden_tools: vec!["delete_database".into()],
        },
        ..Default::default()
    }
}

#[test]
fn case_verdict_is_the_and_of_non_skipped_results() {
    let runner = all_judges_runner();
    for case in [weather_case(), broken_case()] {
        let result = runner.evaluate_case(&case);
        let expected_passed = result
            .judge_results
            .iter()
            .filter(|r| !r.skipped)
            .all(|r| r.passed);
        let expected_hard = result
            .judge_results
            .iter()
            .any(|r| !r.passed && r.hard_fail);
        assert_eq!(result.passed, expected_passed, "{}", case.case_id);
        assert_eq!(result.hard_failed, expected_hard, "{}", case.case_id);
    }
}

#[test]
fn scores_are_bounded_and_skipped_implies_passed() {
    let runner = all_judges_runner();
    for case in [weather_case(), broken_case()] {
        for result in runner.evaluate_case(&case).judge_results {
            assert!(
                (0.0..=1.0).contains(&result.score),
                "{} score {} out of range",
                result.judge_id,
                result.score
            );
            if result.skipped {
                assert!(result.passed, "{} skipped but not passed", result.judge_id);
            }
        }
    }
}

#[test]
fn fully_specified_case_passes_every_judge() {
    let runner = all_judges_runner();
    let result = runner.evaluate_case(&weather_case());
    assert!(result.passed, "{:#?}", result.judge_results);
    assert!(!result.hard_failed);
}

#[test]
fn broken_case_hard_fails_with_policy_evidence() {
    let runner = all_judges_runner();
    let result = runner.evaluate_case(&broken_case());
    assert!(!result.passed);
    assert!(result.hard_failed);

    let policy = result
        .judge_results
        .iter()
        .find(|r| r.judge_id == "policy")
        .unwrap();
    assert!(!policy.passed);
    assert_eq!(
        policy.evidence["missing_required_tools"],
        json!(["search_weather"])
    );
    assert_eq!(
        policy.evidence["forbidden_tools_used"],
        json!(["delete_database"])
    );
}

#[test]
fn repeated_runs_are_byte_identical() -> anyhow::Result<()> {
    let suite = EvalSuite {
        dataset_id: "determinism".into(),
        cases: vec![weather_case(), broken_case()],
        ..Default::default()
    };
    let run_config = RunConfig {
        run_id: "r1".into(),
        dataset_id: "determinism".into(),
        ..Default::default()
    };
    let runner = all_judges_runner();

    let (results_a, summary_a) = runner.run(&suite, &run_config);
    let (results_b, summary_b) = runner.run(&suite, &run_config);

    assert_eq!(summary_a, summary_b);
    assert_eq!(
        serde_json::to_string(&results_a)?,
        serde_json::to_string(&results_b)?
    );
    Ok(())
}

#[test]
fn judge_order_follows_configuration() {
    let names: Vec<String> = vec!["regex".into(), "policy".into(), "tool_contract".into()];
    let runner = EvalRunner::new(
        JudgeRegistry::builtin()
            .instantiate_all(&names, &BTreeMap::new())
            .unwrap(),
    );
    let result = runner.evaluate_case(&weather_case());
    let order: Vec<&str> = result
        .judge_results
        .iter()
        .map(|r| r.judge_id.as_str())
        .collect();
    assert_eq!(
        order,
        vec!["replay_contract", "regex", "policy", "tool_contract"]
    );
}
