//! Baseline-vs-candidate comparison of two run artifacts.
//!
//! Each side is either a summary/report file or an evidence-pack directory.
//! The report covers metric deltas, per-case regressions, failure-cluster
//! shifts, a compatibility check, a coarse risk level and a 0-100 release
//! impact score with a recommendation. Output ordering is deterministic so
//! the same two runs always produce the same report.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use gavel_core::model::{utc_now_iso, CaseResult, RunSummary};

use crate::errors::EvidenceError;
use crate::pack::{read_saved_verdicts, read_summary, write_json};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Fail with an error on the first compatibility violation instead of
    /// soft-reporting it.
    pub enforce_compatibility: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub name: String,
    pub baseline: f64,
    pub candidate: f64,
    pub delta: f64,
}

impl MetricDelta {
    fn new(name: &str, baseline: f64, candidate: f64) -> Self {
        Self {
            name: name.to_string(),
            baseline,
            candidate,
            delta: candidate - baseline,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRegression {
    pub case_id: String,
    pub baseline_passed: Option<bool>,
    pub candidate_passed: Option<bool>,
    pub baseline_hard_failed: Option<bool>,
    pub candidate_hard_failed: Option<bool>,
    pub regressed: bool,
    pub improved: bool,
    pub judge_score_deltas: BTreeMap<String, MetricDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityCheck {
    pub check: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compatibility {
    pub compatible: bool,
    pub checks: Vec<CompatibilityCheck>,
}

/// Count shift of one `judge_id:reason` failure cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCluster {
    pub cluster: String,
    pub baseline_count: u64,
    pub candidate_count: u64,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageEntry {
    pub cluster: String,
    pub judge_id: String,
    pub delta: i64,
    pub hint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseImpact {
    pub score: f64,
    pub level: String,
    pub recommendation: String,
    pub regressed_cases: usize,
    pub new_hard_fail_cases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    pub generated_at: String,
    pub baseline_run_id: String,
    pub candidate_run_id: String,
    pub dataset_id: String,
    pub compatibility: Compatibility,
    pub metrics: BTreeMap<String, MetricDelta>,
    pub judge_metrics: BTreeMap<String, MetricDelta>,
    pub case_regressions: Vec<CaseRegression>,
    pub regressions: Vec<String>,
    pub failure_clusters: Vec<FailureCluster>,
    pub triage: Vec<TriageEntry>,
    pub risk_level: RiskLevel,
    pub release_impact: ReleaseImpact,
    pub overview: String,
    pub top_regressed_judges: Vec<MetricDelta>,
    pub new_hard_fail_case_ids: Vec<String>,
    pub resolved_hard_fail_case_ids: Vec<String>,
}

const TRIAGE_CAP: usize = 15;

fn triage_hint(judge_id: &str) -> &'static str {
    match judge_id {
        "replay_contract" => "trace structure broke; inspect the producing exporter or importer",
        "tool_contract" => "check tool-call argument shapes against the declared contracts",
        "policy" => "the agent changed which tools it uses; review required/forbidden tool lists",
        "trajectory_step" => "tool calls and results no longer pair up; look for dropped events",
        "regex" => "final output text drifted; diff prompts or output formatting",
        "json_schema" => "structured output shape changed; align the schema or the agent output",
        "repair_path" => "repair loop is retrying differently; inspect attempt ordering",
        "cost_budget" => "token/cost usage grew; profile prompt sizes and tool payloads",
        "latency_slo" => "latency regressed; check model/tool response times",
        "retry_storm" => "identical calls are being retried; add backoff or fix the failing tool",
        "loop_guard" => "the agent loops or repeats itself; review stop conditions",
        "tool_abuse" => "tool usage exceeds limits or touches forbidden tools; audit tool policy",
        "prompt_injection" => "injection indicators appeared in the trace; review input sources",
        _ => "investigate the failing judge's evidence for affected cases",
    }
}

struct RunArtifact {
    summary: RunSummary,
    cases: BTreeMap<String, CaseResult>,
}

fn cases_from_report_value(payload: &Value) -> BTreeMap<String, CaseResult> {
    let mut cases = BTreeMap::new();
    if let Some(rows) = payload.get("cases").and_then(Value::as_array) {
        for row in rows {
            if let Ok(case) = serde_json::from_value::<CaseResult>(row.clone()) {
                cases.insert(case.case_id.clone(), case);
            }
        }
    }
    cases
}

fn load_artifact(path: &Path) -> Result<RunArtifact, EvidenceError> {
    if path.is_file() {
        let raw = std::fs::read_to_string(path).map_err(|source| EvidenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let payload: Value =
            serde_json::from_str(&raw).map_err(|source| EvidenceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        // A report.json carries summary and cases; anything else is read as
        // a bare summary document.
        let summary_value = payload.get("summary").cloned().unwrap_or(payload.clone());
        let summary: RunSummary =
            serde_json::from_value(summary_value).map_err(|source| EvidenceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        return Ok(RunArtifact {
            summary,
            cases: cases_from_report_value(&payload),
        });
    }

    let summary = read_summary(path)?;
    let report_path = path.join("report.json");
    let cases = if report_path.is_file() {
        let raw = std::fs::read_to_string(&report_path).map_err(|source| EvidenceError::Read {
            path: report_path.clone(),
            source,
        })?;
        let payload: Value =
            serde_json::from_str(&raw).map_err(|source| EvidenceError::Parse {
                path: report_path,
                source,
            })?;
        cases_from_report_value(&payload)
    } else {
        read_saved_verdicts(path)?
    };
    Ok(RunArtifact { summary, cases })
}

fn judge_scores(case: &CaseResult) -> BTreeMap<String, f64> {
    case.judge_results
        .iter()
        .map(|result| (result.judge_id.clone(), result.score))
        .collect()
}

fn case_regressions(
    baseline: &BTreeMap<String, CaseResult>,
    candidate: &BTreeMap<String, CaseResult>,
) -> Vec<CaseRegression> {
    let all_ids: BTreeSet<&String> = baseline.keys().chain(candidate.keys()).collect();
    let mut rows = Vec::new();

    for case_id in all_ids {
        let base = baseline.get(case_id);
        let cand = candidate.get(case_id);
        let base_passed = base.map(|c| c.passed);
        let cand_passed = cand.map(|c| c.passed);
        let base_hard = base.map(|c| c.hard_failed);
        let cand_hard = cand.map(|c| c.hard_failed);

        let base_scores = base.map(judge_scores).unwrap_or_default();
        let cand_scores = cand.map(judge_scores).unwrap_or_default();
        let judge_ids: BTreeSet<&String> = base_scores.keys().chain(cand_scores.keys()).collect();
        let judge_score_deltas: BTreeMap<String, MetricDelta> = judge_ids
            .into_iter()
            .map(|judge_id| {
                (
                    judge_id.clone(),
                    MetricDelta::new(
                        judge_id,
                        base_scores.get(judge_id).copied().unwrap_or(0.0),
                        cand_scores.get(judge_id).copied().unwrap_or(0.0),
                    ),
                )
            })
            .collect();

        let regressed = (base_passed == Some(true) && cand_passed == Some(false))
            || (base_hard == Some(false) && cand_hard == Some(true));
        let improved = (base_passed == Some(false) && cand_passed == Some(true))
            || (base_hard == Some(true) && cand_hard == Some(false));

        if base_passed != cand_passed || base_hard != cand_hard || regressed || improved {
            rows.push(CaseRegression {
                case_id: case_id.clone(),
                baseline_passed: base_passed,
                candidate_passed: cand_passed,
                baseline_hard_failed: base_hard,
                candidate_hard_failed: cand_hard,
                regressed,
                improved,
                judge_score_deltas,
            });
        }
    }
    rows
}

fn failure_cluster_counts(cases: &BTreeMap<String, CaseResult>) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for case in cases.values() {
        for result in &case.judge_results {
            if result.skipped || result.passed {
                continue;
            }
            let key = format!("{}:{}", result.judge_id, result.reason);
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
}

fn failure_clusters(
    baseline: &BTreeMap<String, CaseResult>,
    candidate: &BTreeMap<String, CaseResult>,
) -> Vec<FailureCluster> {
    let base_counts = failure_cluster_counts(baseline);
    let cand_counts = failure_cluster_counts(candidate);
    let keys: BTreeSet<&String> = base_counts.keys().chain(cand_counts.keys()).collect();
    let mut clusters: Vec<FailureCluster> = keys
        .into_iter()
        .map(|key| {
            let baseline_count = base_counts.get(key).copied().unwrap_or(0);
            let candidate_count = cand_counts.get(key).copied().unwrap_or(0);
            FailureCluster {
                cluster: key.clone(),
                baseline_count,
                candidate_count,
                delta: candidate_count as i64 - baseline_count as i64,
            }
        })
        .collect();
    clusters.sort_by(|a, b| b.delta.cmp(&a.delta).then(a.cluster.cmp(&b.cluster)));
    clusters
}

fn compatibility(baseline: &RunArtifact, candidate: &RunArtifact) -> Compatibility {
    let mut checks = Vec::new();

    let base_dataset = &baseline.summary.dataset_id;
    let cand_dataset = &candidate.summary.dataset_id;
    if !base_dataset.is_empty() && !cand_dataset.is_empty() {
        checks.push(CompatibilityCheck {
            check: "dataset_id".into(),
            ok: base_dataset == cand_dataset,
            detail: format!("baseline '{base_dataset}' vs candidate '{cand_dataset}'"),
        });
    }

    let base_total = baseline.summary.total_cases;
    let cand_total = candidate.summary.total_cases;
    if base_total > 0 && cand_total > 0 {
        checks.push(CompatibilityCheck {
            check: "total_cases".into(),
            ok: base_total == cand_total,
            detail: format!("baseline {base_total} vs candidate {cand_total}"),
        });
    }

    if !baseline.cases.is_empty() && !candidate.cases.is_empty() {
        let base_ids: BTreeSet<&String> = baseline.cases.keys().collect();
        let cand_ids: BTreeSet<&String> = candidate.cases.keys().collect();
        let only_base: Vec<&&String> = base_ids.difference(&cand_ids).collect();
        let only_cand: Vec<&&String> = cand_ids.difference(&base_ids).collect();
        checks.push(CompatibilityCheck {
            check: "case_id_sets".into(),
            ok: only_base.is_empty() && only_cand.is_empty(),
            detail: format!(
                "{} case(s) only in baseline, {} only in candidate",
                only_base.len(),
                only_cand.len()
            ),
        });
    }

    Compatibility {
        compatible: checks.iter().all(|check| check.ok),
        checks,
    }
}

fn risk_level(
    pass_delta: f64,
    hard_fail_delta: f64,
    regressed_cases: usize,
) -> RiskLevel {
    if hard_fail_delta > 0.10 || regressed_cases >= 10 {
        RiskLevel::High
    } else if pass_delta < -0.03 || hard_fail_delta > 0.02 || regressed_cases > 0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn release_impact(
    pass_delta: f64,
    hard_fail_delta: f64,
    regressed_cases: usize,
    new_hard_fail_cases: usize,
) -> ReleaseImpact {
    let score = ((-pass_delta).max(0.0) * 120.0
        + hard_fail_delta.max(0.0) * 150.0
        + regressed_cases as f64 * 2.5
        + new_hard_fail_cases as f64 * 5.0)
        .clamp(0.0, 100.0);
    let (level, recommendation) = if score >= 60.0 {
        ("critical", "block")
    } else if score >= 30.0 {
        ("high", "block_or_explicit_waiver")
    } else if score >= 12.0 {
        ("medium", "review_before_release")
    } else {
        ("low", "proceed")
    };
    ReleaseImpact {
        score,
        level: level.into(),
        recommendation: recommendation.into(),
        regressed_cases,
        new_hard_fail_cases,
    }
}

/// Diff two run artifacts into a comparison report.
pub fn compare_runs(
    baseline_path: &Path,
    candidate_path: &Path,
    options: &CompareOptions,
) -> Result<CompareReport, EvidenceError> {
    let baseline = load_artifact(baseline_path)?;
    let candidate = load_artifact(candidate_path)?;

    let compatibility = compatibility(&baseline, &candidate);
    if options.enforce_compatibility {
        if let Some(failed) = compatibility.checks.iter().find(|check| !check.ok) {
            return Err(EvidenceError::Incompatible(format!(
                "{} mismatch: {}",
                failed.check, failed.detail
            )));
        }
    }

    let mut metrics = BTreeMap::new();
    metrics.insert(
        "pass_rate".to_string(),
        MetricDelta::new(
            "pass_rate",
            baseline.summary.pass_rate,
            candidate.summary.pass_rate,
        ),
    );
    metrics.insert(
        "hard_fail_rate".to_string(),
        MetricDelta::new(
            "hard_fail_rate",
            baseline.summary.hard_fail_rate,
            candidate.summary.hard_fail_rate,
        ),
    );
    let pass_delta = metrics["pass_rate"].delta;
    let hard_fail_delta = metrics["hard_fail_rate"].delta;

    let judge_ids: BTreeSet<&String> = baseline
        .summary
        .judge_pass_rates
        .keys()
        .chain(candidate.summary.judge_pass_rates.keys())
        .collect();
    let judge_metrics: BTreeMap<String, MetricDelta> = judge_ids
        .into_iter()
        .map(|judge_id| {
            (
                judge_id.clone(),
                MetricDelta::new(
                    judge_id,
                    baseline
                        .summary
                        .judge_pass_rates
                        .get(judge_id)
                        .copied()
                        .unwrap_or(0.0),
                    candidate
                        .summary
                        .judge_pass_rates
                        .get(judge_id)
                        .copied()
                        .unwrap_or(0.0),
                ),
            )
        })
        .collect();

    let case_regressions = case_regressions(&baseline.cases, &candidate.cases);
    let regressed_cases: Vec<&CaseRegression> =
        case_regressions.iter().filter(|row| row.regressed).collect();

    let new_hard_fail_case_ids: Vec<String> = case_regressions
        .iter()
        .filter(|row| {
            row.candidate_hard_failed == Some(true) && row.baseline_hard_failed != Some(true)
        })
        .map(|row| row.case_id.clone())
        .collect();
    let resolved_hard_fail_case_ids: Vec<String> = case_regressions
        .iter()
        .filter(|row| {
            row.baseline_hard_failed == Some(true) && row.candidate_hard_failed != Some(true)
        })
        .map(|row| row.case_id.clone())
        .collect();

    let mut regressions = Vec::new();
    if pass_delta < 0.0 {
        regressions.push("pass_rate decreased".to_string());
    }
    if hard_fail_delta > 0.0 {
        regressions.push("hard_fail_rate increased".to_string());
    }
    for (judge_id, metric) in &judge_metrics {
        if metric.delta < 0.0 {
            regressions.push(format!("{judge_id} pass rate decreased"));
        }
    }
    for row in &regressed_cases {
        regressions.push(format!("case regressed: {}", row.case_id));
    }

    let failure_clusters = failure_clusters(&baseline.cases, &candidate.cases);
    let triage: Vec<TriageEntry> = failure_clusters
        .iter()
        .filter(|cluster| cluster.delta > 0)
        .take(TRIAGE_CAP)
        .map(|cluster| {
            let judge_id = cluster
                .cluster
                .split(':')
                .next()
                .unwrap_or(&cluster.cluster)
                .to_string();
            TriageEntry {
                cluster: cluster.cluster.clone(),
                hint: triage_hint(&judge_id).to_string(),
                judge_id,
                delta: cluster.delta,
            }
        })
        .collect();

    let mut top_regressed_judges: Vec<MetricDelta> = judge_metrics
        .values()
        .filter(|metric| metric.delta < 0.0)
        .cloned()
        .collect();
    top_regressed_judges.sort_by(|a, b| a.delta.total_cmp(&b.delta).then(a.name.cmp(&b.name)));
    top_regressed_judges.truncate(5);

    let risk_level = risk_level(pass_delta, hard_fail_delta, regressed_cases.len());
    let release_impact = release_impact(
        pass_delta,
        hard_fail_delta,
        regressed_cases.len(),
        new_hard_fail_case_ids.len(),
    );

    let overview = format!(
        "pass rate {:.1}% -> {:.1}%, hard-fail rate {:.1}% -> {:.1}%, {} regressed case(s), {} new hard failure(s)",
        baseline.summary.pass_rate * 100.0,
        candidate.summary.pass_rate * 100.0,
        baseline.summary.hard_fail_rate * 100.0,
        candidate.summary.hard_fail_rate * 100.0,
        regressed_cases.len(),
        new_hard_fail_case_ids.len(),
    );

    let dataset_id = if candidate.summary.dataset_id.is_empty() {
        baseline.summary.dataset_id.clone()
    } else {
        candidate.summary.dataset_id.clone()
    };
    let report = CompareReport {
        generated_at: utc_now_iso(),
        baseline_run_id: baseline.summary.run_id.clone(),
        candidate_run_id: candidate.summary.run_id.clone(),
        dataset_id,
        compatibility,
        metrics,
        judge_metrics,
        case_regressions,
        regressions,
        failure_clusters,
        triage,
        risk_level,
        release_impact,
        overview,
        top_regressed_judges,
        new_hard_fail_case_ids,
        resolved_hard_fail_case_ids,
    };
    info!(
        baseline = %report.baseline_run_id,
        candidate = %report.candidate_run_id,
        risk = ?report.risk_level,
        impact = report.release_impact.score,
        "comparison complete"
    );
    Ok(report)
}

/// Persist a comparison report as pretty JSON.
pub fn write_compare_report(
    report: &CompareReport,
    out_path: &Path,
) -> Result<(), EvidenceError> {
    write_json(out_path, report)
}
