//! `DomainEntry`, `SelectorPattern`, `PaginationPattern` (§3, §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::request::RenderTier;

const FAILURE_RING_CAPACITY: usize = 20;
const DEFAULT_SUCCESS_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    MainContent,
    Article,
    Title,
    Price,
    Product,
    List,
    Nav,
    Footer,
    Other,
}

/// Unique per (domain, content_type, selector) (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorPattern {
    pub selector: String,
    pub content_type: ContentType,
    pub success_count: u64,
    pub failure_count: u64,
}

impl SelectorPattern {
    pub fn new(selector: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            selector: selector.into(),
            content_type,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationType {
    NextButton,
    QueryParam,
    PathSegment,
    Cursor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationPattern {
    pub kind: PaginationType,
    pub selector: Option<String>,
    pub param_name: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    Timeout,
    BotChallenge,
    HttpError,
    ParseError,
    RateLimited,
    Captcha,
    EmptyContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub failure_type: FailureType,
    pub error_message: String,
    pub recovery_attempted: bool,
    pub recovery_succeeded: Option<bool>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRule {
    pub min_text_length: Option<usize>,
    pub required_substrings: Vec<String>,
    pub forbidden_substrings: Vec<String>,
    pub language: Option<String>,
    pub min_link_count: Option<usize>,
}

impl ValidatorRule {
    pub fn validate(&self, text: &str, language: Option<&str>, link_count: usize) -> Vec<String> {
        let mut reasons = Vec::new();
        if let Some(min) = self.min_text_length {
            if text.len() < min {
                reasons.push(format!("text length {} below minimum {}", text.len(), min));
            }
        }
        for required in &self.required_substrings {
            if !text.contains(required.as_str()) {
                reasons.push(format!("missing required substring '{}'", required));
            }
        }
        for forbidden in &self.forbidden_substrings {
            if text.contains(forbidden.as_str()) {
                reasons.push(format!("contains forbidden substring '{}'", forbidden));
            }
        }
        if let (Some(expected), Some(actual)) = (&self.language, language) {
            if expected != actual {
                reasons.push(format!("language mismatch: expected {}, got {}", expected, actual));
            }
        }
        if let Some(min_links) = self.min_link_count {
            if link_count < min_links {
                reasons.push(format!("link count {} below floor {}", link_count, min_links));
            }
        }
        reasons
    }
}

/// Per-domain record owned by the Learning Engine (§3, §4.9). Invariants
/// enforced by the owning engine, not here: selector lists ordered by
/// descending historical success; failure ring bounded at
/// `FAILURE_RING_CAPACITY`; `overall_success_rate` computed over the last
/// `success_window` outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub domain: String,
    pub api_pattern_ids: Vec<uuid::Uuid>,
    pub selector_chains: HashMap<ContentType, Vec<SelectorPattern>>,
    pub validators: Vec<ValidatorRule>,
    pub pagination_patterns: HashMap<String, PaginationPattern>,
    pub form_patterns: HashMap<String, serde_json::Value>,
    pub recent_failures: VecDeque<FailureReport>,
    pub recent_outcomes: VecDeque<bool>,
    pub success_window: usize,
    pub domain_group: Option<String>,
    pub preferred_tier: Option<RenderTier>,
}

impl DomainEntry {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            api_pattern_ids: Vec::new(),
            selector_chains: HashMap::new(),
            validators: Vec::new(),
            pagination_patterns: HashMap::new(),
            form_patterns: HashMap::new(),
            recent_failures: VecDeque::with_capacity(FAILURE_RING_CAPACITY),
            recent_outcomes: VecDeque::with_capacity(DEFAULT_SUCCESS_WINDOW),
            success_window: DEFAULT_SUCCESS_WINDOW,
            domain_group: None,
            preferred_tier: None,
        }
    }

    pub fn record_failure(&mut self, report: FailureReport) {
        if self.recent_failures.len() == FAILURE_RING_CAPACITY {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(report);
        self.record_outcome(false);
    }

    pub fn record_outcome(&mut self, success: bool) {
        if self.recent_outcomes.len() == self.success_window {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
    }

    pub fn overall_success_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 0.0;
        }
        let successes = self.recent_outcomes.iter().filter(|s| **s).count();
        successes as f64 / self.recent_outcomes.len() as f64
    }

    /// Backoff when >= 3 failures of the same class within the last hour
    /// (§4.9 `get_failure_patterns`).
    pub fn should_backoff(&self, now: DateTime<Utc>) -> (bool, Option<FailureType>) {
        let one_hour_ago = now - chrono::Duration::hours(1);
        let mut counts: HashMap<&'static str, (usize, FailureType)> = HashMap::new();
        for failure in self.recent_failures.iter() {
            if failure.occurred_at < one_hour_ago {
                continue;
            }
            let key = failure_type_key(failure.failure_type);
            let entry = counts.entry(key).or_insert((0, failure.failure_type));
            entry.0 += 1;
        }
        counts
            .into_values()
            .find(|(count, _)| *count >= 3)
            .map(|(_, ty)| (true, Some(ty)))
            .unwrap_or((false, None))
    }

    /// Inserts or reinforces a selector; reorders the chain so higher
    /// success-rate selectors sort first (§4.9 `learn_selector`).
    pub fn learn_selector(&mut self, content_type: ContentType, selector: &str) {
        let chain = self.selector_chains.entry(content_type).or_default();
        if let Some(existing) = chain.iter_mut().find(|p| p.selector == selector) {
            existing.success_count += 1;
        } else {
            let mut pattern = SelectorPattern::new(selector, content_type);
            pattern.success_count = 1;
            chain.push(pattern);
        }
        chain.sort_by(|a, b| b.success_rate().partial_cmp(&a.success_rate()).unwrap());
    }

    pub fn record_selector_failure(&mut self, content_type: ContentType, selector: &str) {
        let chain = self.selector_chains.entry(content_type).or_default();
        if let Some(existing) = chain.iter_mut().find(|p| p.selector == selector) {
            existing.failure_count += 1;
        } else {
            chain.push(SelectorPattern::new(selector, content_type));
            chain.last_mut().unwrap().failure_count = 1;
        }
        chain.sort_by(|a, b| b.success_rate().partial_cmp(&a.success_rate()).unwrap());
    }

    pub fn selector_chain(&self, content_type: ContentType) -> Vec<String> {
        self.selector_chains
            .get(&content_type)
            .map(|chain| chain.iter().map(|p| p.selector.clone()).collect())
            .unwrap_or_default()
    }
}

fn failure_type_key(ty: FailureType) -> &'static str {
    match ty {
        FailureType::Timeout => "timeout",
        FailureType::BotChallenge => "bot_challenge",
        FailureType::HttpError => "http_error",
        FailureType::ParseError => "parse_error",
        FailureType::RateLimited => "rate_limited",
        FailureType::Captcha => "captcha",
        FailureType::EmptyContent => "empty_content",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_reinforcement_reorders_chain() {
        let mut entry = DomainEntry::new("example.com");
        entry.learn_selector(ContentType::MainContent, "main");
        entry.learn_selector(ContentType::MainContent, ".content");
        for _ in 0..3 {
            entry.learn_selector(ContentType::MainContent, ".content");
        }
        assert_eq!(entry.selector_chain(ContentType::MainContent)[0], ".content");
    }

    #[test]
    fn failure_ring_is_bounded() {
        let mut entry = DomainEntry::new("example.com");
        for i in 0..30 {
            entry.record_failure(FailureReport {
                failure_type: FailureType::Timeout,
                error_message: format!("timeout {i}"),
                recovery_attempted: false,
                recovery_succeeded: None,
                occurred_at: Utc::now(),
            });
        }
        assert_eq!(entry.recent_failures.len(), FAILURE_RING_CAPACITY);
    }

    #[test]
    fn backoff_triggers_after_three_same_class_failures_within_hour() {
        let mut entry = DomainEntry::new("example.com");
        for _ in 0..3 {
            entry.record_failure(FailureReport {
                failure_type: FailureType::BotChallenge,
                error_message: "challenge".into(),
                recovery_attempted: false,
                recovery_succeeded: None,
                occurred_at: Utc::now(),
            });
        }
        let (should_backoff, kind) = entry.should_backoff(Utc::now());
        assert!(should_backoff);
        assert_eq!(kind, Some(FailureType::BotChallenge));
    }
}
