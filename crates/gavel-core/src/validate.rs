//! Replay-contract validator: a structural linter over an ordered trace,
//! independent of any judge. The runner always contributes its verdict as a
//! hard-fail `replay_contract` result ahead of the user-selected judges.

use std::collections::BTreeSet;

use chrono::DateTime;

use crate::model::TraceEvent;

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Check the structural invariants of a trace; an empty list means valid.
///
/// A desynchronized `idx` is reported once and the expected counter resumes
/// from the observed value, so a single gap does not cascade into one error
/// per following event.
pub fn validate_trace(trace: &[TraceEvent]) -> Vec<String> {
    let mut issues = Vec::new();
    let mut expected_idx: u32 = 0;
    let mut seen_span_ids: BTreeSet<&str> = BTreeSet::new();

    for event in trace {
        if event.idx != expected_idx {
            issues.push(format!(
                "event idx mismatch: expected {}, received {}",
                expected_idx, event.idx
            ));
            expected_idx = event.idx.saturating_add(1);
        } else {
            expected_idx = expected_idx.saturating_add(1);
        }

        if event.actor.is_empty() {
            issues.push(format!("event {}: actor is required", event.idx));
        }
        if event.event_type.is_empty() {
            issues.push(format!("event {}: type is required", event.idx));
        }
        if event.event_type == "tool_call" && event.tool.as_deref().unwrap_or("").is_empty() {
            issues.push(format!("event {}: tool_call missing tool name", event.idx));
        }
        if let Some(latency) = event.latency_ms {
            if latency < 0 {
                issues.push(format!("event {}: latency_ms must be >= 0", event.idx));
            }
        }

        if let Some(trace_id) = event.trace_id.as_deref() {
            if !trace_id.is_empty() && !is_lower_hex(trace_id, 32) {
                issues.push(format!(
                    "event {}: trace_id must be 32 lowercase hex chars",
                    event.idx
                ));
            }
        }
        if let Some(span_id) = event.span_id.as_deref() {
            if !span_id.is_empty() {
                if !is_hex(span_id, 16) {
                    issues.push(format!("event {}: span_id must be 16 hex chars", event.idx));
                } else if !seen_span_ids.insert(span_id) {
                    issues.push(format!("event {}: duplicate span_id {}", event.idx, span_id));
                }
            }
        }
        if let Some(parent) = event.parent_span_id.as_deref() {
            if !parent.is_empty() && !is_hex(parent, 16) {
                issues.push(format!(
                    "event {}: parent_span_id must be 16 hex chars",
                    event.idx
                ));
            }
        }

        if !event.ts.is_empty() && DateTime::parse_from_rfc3339(&event.ts).is_err() {
            issues.push(format!("event {}: ts is not RFC-3339", event.idx));
        }
    }

    issues
}
