//! Evidence-pack layout and IO.
//!
//! ```text
//! <pack>/
//!   manifest.json
//!   report.json
//!   run/config.json
//!   run/summary.json
//!   run/events.jsonl
//!   judges/<judge_id>.json
//!   cases/<case_id>/trajectory.json
//!   cases/<case_id>/verdicts.json
//!   cases/<case_id>/artifacts/
//!   compare/
//! ```
//!
//! All JSON is written with a trailing newline and deterministic key order
//! (the data model uses ordered maps throughout), so identical runs produce
//! byte-identical packs apart from the manifest's generation timestamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use gavel_core::model::{utc_now_iso, CaseResult, EvalCase, EvalSuite, RunConfig, RunSummary};

use crate::errors::EvidenceError;

/// Write a value as pretty-printed JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<(), EvidenceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EvidenceError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let mut rendered =
        serde_json::to_string_pretty(payload).map_err(|source| EvidenceError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    rendered.push('\n');
    std::fs::write(path, rendered).map_err(|source| EvidenceError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write rows as JSON lines, creating parent directories.
pub fn write_jsonl(path: &Path, rows: &[Value]) -> Result<(), EvidenceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EvidenceError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.to_string());
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|source| EvidenceError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, EvidenceError> {
    let raw = std::fs::read_to_string(path).map_err(|source| EvidenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| EvidenceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn sha256_file(path: &Path) -> Result<String, EvidenceError> {
    let data = std::fs::read(path).map_err(|source| EvidenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Persist one evaluated run as an evidence pack rooted at `output_dir`.
pub fn write_evidence_pack(
    output_dir: &Path,
    suite: &EvalSuite,
    run_config: &RunConfig,
    summary: &RunSummary,
    case_results: &[CaseResult],
) -> Result<PathBuf, EvidenceError> {
    let base = output_dir.to_path_buf();
    let run_dir = base.join("run");
    let judges_dir = base.join("judges");
    let cases_dir = base.join("cases");
    for dir in [&run_dir, &judges_dir, &cases_dir, &base.join("compare")] {
        std::fs::create_dir_all(dir).map_err(|source| EvidenceError::Write {
            path: dir.clone(),
            source,
        })?;
    }

    let mut event_rows = Vec::new();
    for case in &suite.cases {
        for event in &case.trace {
            let mut row = match to_value(event) {
                Value::Object(map) => map,
                _ => continue,
            };
            row.insert("run_id".into(), json!(run_config.run_id));
            row.insert("dataset_id".into(), json!(suite.dataset_id));
            row.insert("case_id".into(), json!(case.case_id));
            event_rows.push(Value::Object(row));
        }
    }

    let mut written: Vec<String> = Vec::new();

    write_json(&run_dir.join("config.json"), run_config)?;
    write_json(&run_dir.join("summary.json"), summary)?;
    write_jsonl(&run_dir.join("events.jsonl"), &event_rows)?;
    written.extend([
        "run/config.json".to_string(),
        "run/summary.json".to_string(),
        "run/events.jsonl".to_string(),
    ]);

    let case_index: BTreeMap<&str, &EvalCase> = suite
        .cases
        .iter()
        .map(|case| (case.case_id.as_str(), case))
        .collect();
    let mut by_judge: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for case_result in case_results {
        for judge_result in &case_result.judge_results {
            by_judge
                .entry(judge_result.judge_id.clone())
                .or_default()
                .push(to_value(judge_result));
        }

        let case_dir = cases_dir.join(&case_result.case_id);
        if let Some(case) = case_index.get(case_result.case_id.as_str()) {
            write_json(&case_dir.join("trajectory.json"), case)?;
            written.push(format!("cases/{}/trajectory.json", case_result.case_id));
        }
        write_json(&case_dir.join("verdicts.json"), case_result)?;
        written.push(format!("cases/{}/verdicts.json", case_result.case_id));
        let artifacts = case_dir.join("artifacts");
        std::fs::create_dir_all(&artifacts).map_err(|source| EvidenceError::Write {
            path: artifacts,
            source,
        })?;
    }

    for (judge_id, results) in &by_judge {
        write_json(&judges_dir.join(format!("{judge_id}.json")), results)?;
        written.push(format!("judges/{judge_id}.json"));
    }

    write_json(
        &base.join("report.json"),
        &json!({
            "run_config": run_config,
            "summary": summary,
            "cases": case_results,
        }),
    )?;
    written.push("report.json".to_string());

    // Content digests over every written file, keyed by pack-relative path.
    let mut sha256: BTreeMap<String, String> = BTreeMap::new();
    for relative in &written {
        sha256.insert(relative.clone(), sha256_file(&base.join(relative))?);
    }
    write_json(
        &base.join("manifest.json"),
        &json!({
            "version": run_config.schema_version,
            "generated_at": utc_now_iso(),
            "run_id": run_config.run_id,
            "dataset_id": suite.dataset_id,
            "files": {
                "report": "report.json",
                "run_config": "run/config.json",
                "run_summary": "run/summary.json",
                "events": "run/events.jsonl",
                "judges_dir": "judges/",
                "cases_dir": "cases/",
                "compare_dir": "compare/",
            },
            "sha256": sha256,
        }),
    )?;

    info!(pack = %base.display(), run_id = %run_config.run_id, "evidence pack written");
    Ok(base)
}

/// Load the run config saved in a pack.
pub fn read_run_config(pack_dir: &Path) -> Result<RunConfig, EvidenceError> {
    read_json(&pack_dir.join("run").join("config.json"))
}

/// Load a run summary from either a summary file or a pack directory.
pub fn read_summary(path: &Path) -> Result<RunSummary, EvidenceError> {
    if path.is_file() {
        return read_json(path);
    }
    let summary_path = path.join("run").join("summary.json");
    if summary_path.is_file() {
        return read_json(&summary_path);
    }
    Err(EvidenceError::MissingSummary(path.to_path_buf()))
}

fn sorted_case_dirs(pack_dir: &Path) -> Vec<PathBuf> {
    let cases_dir = pack_dir.join("cases");
    let Ok(entries) = std::fs::read_dir(&cases_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Load every saved per-case verdict, keyed by case id.
pub fn read_saved_verdicts(
    pack_dir: &Path,
) -> Result<BTreeMap<String, CaseResult>, EvidenceError> {
    let mut verdicts = BTreeMap::new();
    for case_dir in sorted_case_dirs(pack_dir) {
        let path = case_dir.join("verdicts.json");
        if !path.is_file() {
            continue;
        }
        let verdict: CaseResult = read_json(&path)?;
        verdicts.insert(verdict.case_id.clone(), verdict);
    }
    Ok(verdicts)
}

/// Rebuild an evaluable suite purely from the saved trajectory files.
pub fn read_suite_from_pack(pack_dir: &Path) -> Result<EvalSuite, EvidenceError> {
    let mut cases = Vec::new();
    for case_dir in sorted_case_dirs(pack_dir) {
        let path = case_dir.join("trajectory.json");
        if !path.is_file() {
            continue;
        }
        cases.push(read_json::<EvalCase>(&path)?);
    }
    let dataset_id = read_summary(pack_dir)
        .map(|summary| summary.dataset_id)
        .unwrap_or_else(|_| "dataset-unknown".to_string());
    Ok(EvalSuite {
        dataset_id,
        cases,
        metadata: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_core::model::{JudgeResult, TraceEvent};

    fn sample_suite() -> EvalSuite {
        EvalSuite {
            dataset_id: "weather".into(),
            cases: vec![EvalCase {
                case_id: "c1".into(),
                input: json!("weather in SF?"),
                trace: vec![TraceEvent {
                    idx: 0,
                    actor: "assistant".into(),
                    event_type: "message".into(),
                    output: Some(json!("72F")),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn sample_results() -> Vec<CaseResult> {
        vec![CaseResult {
            case_id: "c1".into(),
            passed: true,
            hard_failed: false,
            judge_results: vec![JudgeResult::new(
                "replay_contract",
                "c1",
                1.0,
                true,
                "replay checks passed",
                true,
                json!({"issues": []}),
            )],
            replay_issues: Vec::new(),
        }]
    }

    #[test]
    fn pack_layout_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let suite = sample_suite();
        let run_config = RunConfig {
            run_id: "r1".into(),
            dataset_id: "weather".into(),
            ..Default::default()
        };
        let summary = RunSummary {
            run_id: "r1".into(),
            dataset_id: "weather".into(),
            total_cases: 1,
            passed_cases: 1,
            pass_rate: 1.0,
            ..Default::default()
        };
        let results = sample_results();

        let pack = write_evidence_pack(dir.path(), &suite, &run_config, &summary, &results)
            .unwrap();
        for relative in [
            "manifest.json",
            "report.json",
            "run/config.json",
            "run/summary.json",
            "run/events.jsonl",
            "judges/replay_contract.json",
            "cases/c1/trajectory.json",
            "cases/c1/verdicts.json",
        ] {
            assert!(pack.join(relative).is_file(), "missing {relative}");
        }
        assert!(pack.join("cases/c1/artifacts").is_dir());
        assert!(pack.join("compare").is_dir());

        let manifest: Value = serde_json::from_str(
            &std::fs::read_to_string(pack.join("manifest.json")).unwrap(),
        )
        .unwrap();
        let summary_bytes = std::fs::read(pack.join("run/summary.json")).unwrap();
        assert_eq!(
            manifest["sha256"]["run/summary.json"],
            json!(hex::encode(Sha256::digest(&summary_bytes)))
        );

        assert_eq!(read_run_config(&pack).unwrap().run_id, "r1");
        assert_eq!(read_summary(&pack).unwrap().passed_cases, 1);
        let verdicts = read_saved_verdicts(&pack).unwrap();
        assert!(verdicts["c1"].passed);
        let reloaded = read_suite_from_pack(&pack).unwrap();
        assert_eq!(reloaded.dataset_id, "weather");
        assert_eq!(reloaded.cases.len(), 1);
        assert_eq!(reloaded.cases[0].trace[0].output, Some(json!("72F")));
    }

    #[test]
    fn summary_reads_from_file_or_pack() {
        let dir = tempfile::tempdir().unwrap();
        let summary = RunSummary {
            run_id: "r1".into(),
            total_cases: 3,
            ..Default::default()
        };
        let file = dir.path().join("summary.json");
        write_json(&file, &summary).unwrap();
        assert_eq!(read_summary(&file).unwrap().total_cases, 3);

        let missing = dir.path().join("nothing-here");
        assert!(matches!(
            read_summary(&missing),
            Err(EvidenceError::MissingSummary(_))
        ));
    }

    #[test]
    fn events_rows_are_tagged_with_run_and_case() {
        let dir = tempfile::tempdir().unwrap();
        let suite = sample_suite();
        let run_config = RunConfig {
            run_id: "r1".into(),
            ..Default::default()
        };
        write_evidence_pack(
            dir.path(),
            &suite,
            &run_config,
            &RunSummary::default(),
            &sample_results(),
        )
        .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("run/events.jsonl")).unwrap();
        let row: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(row["run_id"], "r1");
        assert_eq!(row["dataset_id"], "weather");
        assert_eq!(row["case_id"], "c1");
        assert_eq!(row["idx"], 0);
    }
}
