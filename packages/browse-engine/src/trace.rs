//! Decision Trace visualiser & debug store (§4.13).
//!
//! Grounded on `seesaw::core::EventEnvelope`/`CorrelationId`'s
//! append-only, correlation-tracked record conventions, applied here to
//! rendering a sealed `DecisionTrace` rather than dispatching it; the
//! schema-version field mirrors the KV store's own `v` field (§6).

use crate::error::{StoreError, StoreResult};
use crate::kv_store::{KvStore, TypedStore};
use crate::types::decision_trace::DecisionTrace;
use crate::types::TenantId;

pub const DEBUG_TRACES_NAMESPACE: &str = "debug_traces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceView {
    Ascii,
    Compact,
    Detailed,
    Html,
    Json,
}

/// Persists a sealed trace into the debug store when `record_debug_trace`
/// is enabled (§4.13). Keyed by `(url, timestamp)` so repeated fetches of
/// the same URL don't overwrite each other's history.
pub async fn record_debug_trace<S: KvStore + ?Sized>(
    store: &S,
    tenant: &TenantId,
    url: &str,
    trace: &DecisionTrace,
) -> StoreResult<()> {
    let key = format!("{url}:{}", chrono::Utc::now().timestamp_millis());
    TypedStore::new(store).put_json(tenant, DEBUG_TRACES_NAMESPACE, &key, trace).await
}

pub async fn load_debug_trace<S: KvStore + ?Sized>(
    store: &S,
    tenant: &TenantId,
    key: &str,
) -> StoreResult<DecisionTrace> {
    TypedStore::new(store)
        .get_json(tenant, DEBUG_TRACES_NAMESPACE, key)
        .await?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
}

/// Renders a trace in one of five views (§4.13).
pub fn render(trace: &DecisionTrace, view: TraceView) -> String {
    match view {
        TraceView::Ascii => render_ascii(trace),
        TraceView::Compact => render_compact(trace),
        TraceView::Detailed => render_detailed(trace),
        TraceView::Html => render_html(trace),
        TraceView::Json => serde_json::to_string_pretty(trace).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
    }
}

fn render_ascii(trace: &DecisionTrace) -> String {
    let mut out = String::new();
    out.push_str("DecisionTrace\n");
    out.push_str(&format!("schema_version: {}\n", trace.schema_version));
    for (i, attempt) in trace.tier_attempts.iter().enumerate() {
        let marker = if attempt.success { "OK" } else { "FAIL" };
        out.push_str(&format!(
            "  [{i}] {:<12} {:>4} {:>6}ms {}\n",
            attempt.tier.as_str(),
            marker,
            attempt.duration_ms,
            attempt.failure_reason.as_deref().unwrap_or("")
        ));
    }
    if let Some(anomaly) = &trace.anomaly {
        out.push_str(&format!("  anomaly: {} (confidence {:.2}, action {})\n", anomaly.anomaly_type, anomaly.confidence, anomaly.action));
    }
    for validation in &trace.validation {
        out.push_str(&format!(
            "  validation: passed={} confidence={:.2} errors={}\n",
            validation.passed,
            validation.confidence,
            validation.errors.join("; ")
        ));
    }
    out
}

fn render_compact(trace: &DecisionTrace) -> String {
    let tiers: Vec<String> = trace
        .tier_attempts
        .iter()
        .map(|a| format!("{}:{}", a.tier.as_str(), if a.success { "ok" } else { "fail" }))
        .collect();
    format!(
        "v{} tiers=[{}] errors={} anomaly={}",
        trace.schema_version,
        tiers.join(","),
        trace.errors.len(),
        trace.anomaly.as_ref().map(|a| a.anomaly_type.as_str()).unwrap_or("none")
    )
}

fn render_detailed(trace: &DecisionTrace) -> String {
    let mut out = render_ascii(trace);
    out.push_str(&format!(
        "network: {} requests, {} bytes\n",
        trace.network_summary.request_count, trace.network_summary.total_bytes
    ));
    out.push_str(&format!(
        "budget: latency_exceeded={} tiers_skipped={:?}\n",
        trace.budget.latency_exceeded, trace.budget.tiers_skipped
    ));
    out.push_str(&format!("skills: matched={:?} applied={:?}\n", trace.skills.matched, trace.skills.applied));
    for selector_attempt in &trace.selector_attempts {
        out.push_str(&format!(
            "  selector [{}] {} matched={} len={}\n",
            selector_attempt.content_type, selector_attempt.selector, selector_attempt.matched, selector_attempt.text_len
        ));
    }
    for title_attempt in &trace.title_attempts {
        out.push_str(&format!(
            "  title [{}] matched={} confidence={:.2}\n",
            title_attempt.source, title_attempt.matched, title_attempt.confidence_score
        ));
    }
    for error in &trace.errors {
        out.push_str(&format!("  error [{}] {} recovered={:?}\n", error.error_type, error.message, error.recovery_succeeded));
    }
    out
}

fn render_html(trace: &DecisionTrace) -> String {
    let mut out = String::from("<div class=\"decision-trace\">\n");
    out.push_str(&format!("<p>schema_version: {}</p>\n<ol>\n", trace.schema_version));
    for attempt in &trace.tier_attempts {
        let class = if attempt.success { "ok" } else { "fail" };
        out.push_str(&format!(
            "<li class=\"{class}\">{} — {}ms{}</li>\n",
            attempt.tier.as_str(),
            attempt.duration_ms,
            attempt
                .failure_reason
                .as_ref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        ));
    }
    out.push_str("</ol>\n</div>");
    out
}

#[derive(Debug, Clone)]
pub struct TraceDiff {
    pub tier_sequence_changed: bool,
    pub new_errors: Vec<String>,
    pub resolved_errors: Vec<String>,
    pub confidence_delta: f32,
}

/// Diffs two sealed traces for regression comparison (§4.13 `compare`).
pub fn compare(trace_a: &DecisionTrace, trace_b: &DecisionTrace) -> TraceDiff {
    let tiers_a: Vec<&str> = trace_a.tier_attempts.iter().map(|t| t.tier.as_str()).collect();
    let tiers_b: Vec<&str> = trace_b.tier_attempts.iter().map(|t| t.tier.as_str()).collect();

    let errors_a: std::collections::HashSet<&str> = trace_a.errors.iter().map(|e| e.message.as_str()).collect();
    let errors_b: std::collections::HashSet<&str> = trace_b.errors.iter().map(|e| e.message.as_str()).collect();

    let new_errors: Vec<String> = errors_b.difference(&errors_a).map(|s| s.to_string()).collect();
    let resolved_errors: Vec<String> = errors_a.difference(&errors_b).map(|s| s.to_string()).collect();

    let confidence_a = trace_a.validation.last().map(|v| v.confidence).unwrap_or(0.0);
    let confidence_b = trace_b.validation.last().map(|v| v.confidence).unwrap_or(0.0);

    TraceDiff {
        tier_sequence_changed: tiers_a != tiers_b,
        new_errors,
        resolved_errors,
        confidence_delta: confidence_b - confidence_a,
    }
}

/// Light summary of debug-store contents for a URL, used by
/// `get_domain_intelligence`-style callers that want recent trace
/// history without deserialising every full trace.
pub async fn list_trace_keys<S: KvStore + ?Sized>(store: &S, tenant: &TenantId) -> StoreResult<Vec<String>> {
    store.keys(tenant, DEBUG_TRACES_NAMESPACE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decision_trace::{AnomalyNote, TierAttempt, Validation};
    use crate::types::request::RenderTier;

    fn sample_trace() -> DecisionTrace {
        let mut trace = DecisionTrace::new();
        trace.push_tier_attempt(TierAttempt {
            tier: RenderTier::Intelligence,
            success: false,
            duration_ms: 120,
            failure_reason: Some("content_too_short".to_string()),
            validation_details: None,
        });
        trace.push_tier_attempt(TierAttempt {
            tier: RenderTier::Lightweight,
            success: true,
            duration_ms: 340,
            failure_reason: None,
            validation_details: None,
        });
        trace.validation.push(Validation {
            passed: true,
            confidence: 0.82,
            checks: vec!["content length".to_string()],
            errors: Vec::new(),
            warnings: Vec::new(),
        });
        trace
    }

    #[test]
    fn ascii_view_lists_each_tier_attempt() {
        let rendered = render(&sample_trace(), TraceView::Ascii);
        assert!(rendered.contains("intelligence"));
        assert!(rendered.contains("lightweight"));
    }

    #[test]
    fn compact_view_is_single_line_per_call() {
        let rendered = render(&sample_trace(), TraceView::Compact);
        assert!(!rendered.contains('\n'));
        assert!(rendered.contains("tiers=["));
    }

    #[test]
    fn json_view_round_trips_schema_version() {
        let rendered = render(&sample_trace(), TraceView::Json);
        assert!(rendered.contains("\"schema_version\": 1"));
    }

    #[test]
    fn compare_detects_new_tier_in_sequence() {
        let mut trace_a = sample_trace();
        trace_a.tier_attempts.pop();
        let trace_b = sample_trace();
        let diff = compare(&trace_a, &trace_b);
        assert!(diff.tier_sequence_changed);
    }

    #[test]
    fn compare_reports_confidence_delta() {
        let trace_a = sample_trace();
        let mut trace_b = sample_trace();
        trace_b.validation.push(Validation {
            passed: true,
            confidence: 0.95,
            checks: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        });
        let diff = compare(&trace_a, &trace_b);
        assert!(diff.confidence_delta > 0.0);
    }
}
