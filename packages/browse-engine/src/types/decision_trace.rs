//! `DecisionTrace` and its constituents (§3, §4.13).
//!
//! Schema-versioned per the SPEC_FULL.md "Open Questions" decision: a
//! single `schema_version` field rides on both the in-memory trace and
//! its debug-store serialisation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::RenderTier;

pub const TRACE_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: RenderTier,
    pub success: bool,
    pub duration_ms: u64,
    pub failure_reason: Option<String>,
    pub validation_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorAttempt {
    pub selector: String,
    pub content_type: String,
    pub matched: bool,
    pub text_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleAttempt {
    pub source: String,
    pub matched: bool,
    pub confidence_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    pub confidence: f32,
    pub checks: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceError {
    pub error_type: String,
    pub message: String,
    pub recovery_attempted: bool,
    pub recovery_succeeded: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyNote {
    pub anomaly_type: String,
    pub confidence: f32,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsNote {
    pub matched: Vec<String>,
    pub applied: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetOutcome {
    pub latency_exceeded: bool,
    pub tiers_skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub request_count: usize,
    pub total_bytes: usize,
}

/// Append-only; sealed on result (§3). Construction pushes entries in
/// wall-clock order, matching §5's ordering guarantee for the trace
/// fields within a single `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub schema_version: u16,
    pub tier_attempts: Vec<TierAttempt>,
    pub selector_attempts: Vec<SelectorAttempt>,
    pub title_attempts: Vec<TitleAttempt>,
    pub validation: Vec<Validation>,
    pub network_summary: NetworkSummary,
    pub errors: Vec<TraceError>,
    pub anomaly: Option<AnomalyNote>,
    pub skills: SkillsNote,
    pub budget: BudgetOutcome,
    sealed: bool,
}

impl Default for DecisionTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionTrace {
    pub fn new() -> Self {
        Self {
            schema_version: TRACE_SCHEMA_VERSION,
            tier_attempts: Vec::new(),
            selector_attempts: Vec::new(),
            title_attempts: Vec::new(),
            validation: Vec::new(),
            network_summary: NetworkSummary::default(),
            errors: Vec::new(),
            anomaly: None,
            skills: SkillsNote::default(),
            budget: BudgetOutcome::default(),
            sealed: false,
        }
    }

    pub fn push_tier_attempt(&mut self, attempt: TierAttempt) {
        debug_assert!(!self.sealed, "cannot mutate a sealed DecisionTrace");
        self.tier_attempts.push(attempt);
    }

    pub fn push_error(&mut self, error: TraceError) {
        debug_assert!(!self.sealed, "cannot mutate a sealed DecisionTrace");
        self.errors.push(error);
    }

    /// Checks tier monotonicity (§8 property 2): tiers must appear in
    /// non-decreasing cost order unless a `force_tier` was set (callers
    /// pass `force_tier_set=true` to skip the check entirely).
    pub fn is_tier_monotone(&self, force_tier_set: bool) -> bool {
        if force_tier_set {
            return true;
        }
        self.tier_attempts
            .windows(2)
            .all(|w| w[0].tier <= w[1].tier)
    }

    /// Seals the trace; further mutation is a logic error (enforced via
    /// `debug_assert!` to avoid paying the cost in release builds).
    pub fn seal(mut self) -> Self {
        self.sealed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(tier: RenderTier) -> TierAttempt {
        TierAttempt {
            tier,
            success: false,
            duration_ms: 10,
            failure_reason: Some("content_too_short".into()),
            validation_details: None,
        }
    }

    #[test]
    fn tier_monotonicity_holds_for_ascending_attempts() {
        let mut trace = DecisionTrace::new();
        trace.push_tier_attempt(attempt(RenderTier::Intelligence));
        trace.push_tier_attempt(attempt(RenderTier::Lightweight));
        trace.push_tier_attempt(attempt(RenderTier::Playwright));
        assert!(trace.is_tier_monotone(false));
    }

    #[test]
    fn tier_monotonicity_violated_by_descending_attempts() {
        let mut trace = DecisionTrace::new();
        trace.push_tier_attempt(attempt(RenderTier::Playwright));
        trace.push_tier_attempt(attempt(RenderTier::Intelligence));
        assert!(!trace.is_tier_monotone(false));
    }

    #[test]
    fn force_tier_bypasses_monotonicity_check() {
        let mut trace = DecisionTrace::new();
        trace.push_tier_attempt(attempt(RenderTier::Playwright));
        trace.push_tier_attempt(attempt(RenderTier::Intelligence));
        assert!(trace.is_tier_monotone(true));
    }
}
