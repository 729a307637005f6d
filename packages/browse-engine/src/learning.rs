//! Learning Engine (§4.9): owns the per-tenant `DomainEntry` map and is
//! the home for selector reinforcement, validators, failure/backoff
//! tracking, anomaly detection, and pagination-pattern learning.
//!
//! Grounded on `packages/intelligent-crawler/src/detector.rs`'s
//! heuristic + AI hybrid confidence-scoring shape, generalised here to
//! heuristic-only scoring since no LLM dependency is carried (§1
//! Non-goals: this is not an AI extraction pipeline), combined with
//! `src/config.rs::Heuristic`'s enum-of-checks style for
//! `detect_content_anomalies`.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::HeuristicsConfig;
use crate::error::{RenderError, StoreResult};
use crate::kv_store::{KvStore, TypedStore};
use crate::types::domain_entry::{ContentType, FailureType, PaginationPattern, ValidatorRule};
use crate::types::request::RenderTier;
use crate::types::{DomainEntry, FailureReport, TenantId};

const DOMAIN_ENTRIES_NAMESPACE: &str = "domain_entries";

/// Observed page-state classification driving corrective action (§4.9
/// `detect_content_anomalies`, glossary "Anomaly").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyType {
    BotChallenge,
    Captcha,
    ErrorPage,
    EmptyShell,
    RateLimited,
    TopicDrift,
}

impl AnomalyType {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyType::BotChallenge => "bot_challenge",
            AnomalyType::Captcha => "captcha",
            AnomalyType::ErrorPage => "error_page",
            AnomalyType::EmptyShell => "empty_shell",
            AnomalyType::RateLimited => "rate_limited",
            AnomalyType::TopicDrift => "topic_drift",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedAction {
    Wait,
    Retry,
    UseSession,
    ChangeAgent,
    Skip,
}

impl SuggestedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SuggestedAction::Wait => "wait",
            SuggestedAction::Retry => "retry",
            SuggestedAction::UseSession => "use_session",
            SuggestedAction::ChangeAgent => "change_agent",
            SuggestedAction::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedAnomaly {
    pub is_anomaly: bool,
    pub anomaly_type: Option<AnomalyType>,
    pub confidence: f32,
    pub reasons: Vec<String>,
    pub suggested_action: Option<SuggestedAction>,
    pub wait_time_ms: Option<u64>,
}

impl DetectedAnomaly {
    fn none() -> Self {
        Self {
            is_anomaly: false,
            anomaly_type: None,
            confidence: 0.0,
            reasons: Vec::new(),
            suggested_action: None,
            wait_time_ms: None,
        }
    }

    fn of(anomaly_type: AnomalyType, confidence: f32, reason: impl Into<String>, action: SuggestedAction) -> Self {
        let mut result = Self {
            is_anomaly: true,
            anomaly_type: Some(anomaly_type),
            confidence,
            reasons: vec![reason.into()],
            suggested_action: Some(action),
            wait_time_ms: None,
        };
        if matches!(anomaly_type, AnomalyType::RateLimited) {
            result.wait_time_ms = Some(60_000);
        }
        result
    }
}

const CHALLENGE_MARKERS: &[&str] = &["Just a moment", "cf-browser-verification", "challenge-platform"];
const CAPTCHA_MARKERS: &[&str] = &["g-recaptcha", "h-captcha", "hcaptcha", "recaptcha"];
const ERROR_TITLE_MARKERS: &[&str] = &["404", "not found", "page not found"];
const RATE_LIMIT_MARKERS: &[&str] = &["429", "too many requests", "rate limit exceeded"];
const SHELL_BODY_TEXT_FLOOR: usize = 1000;

/// Layered anomaly checks, evaluated in the order enumerated in §4.9:
/// challenge markers, error pages, empty/shell DOM, captcha markers,
/// rate-limit signatures, then topic drift when an `expected_topic` is
/// supplied.
pub fn detect_content_anomalies(html: &str, expected_topic: Option<&str>, body_text: &str) -> DetectedAnomaly {
    let lower = html.to_ascii_lowercase();

    if CHALLENGE_MARKERS.iter().any(|m| html.contains(m)) {
        return DetectedAnomaly::of(AnomalyType::BotChallenge, 0.9, "challenge marker present", SuggestedAction::Wait);
    }

    if CAPTCHA_MARKERS.iter().any(|m| lower.contains(m)) {
        return DetectedAnomaly::of(AnomalyType::Captcha, 0.9, "captcha widget present", SuggestedAction::ChangeAgent);
    }

    if let Some(title) = extract_title_lower(&lower) {
        if ERROR_TITLE_MARKERS.iter().any(|m| title.contains(m)) && body_text.trim().len() < 500 {
            return DetectedAnomaly::of(AnomalyType::ErrorPage, 0.85, "404-shaped title and short body", SuggestedAction::Skip);
        }
    }

    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return DetectedAnomaly::of(AnomalyType::RateLimited, 0.8, "rate-limit signature present", SuggestedAction::Wait);
    }

    let root_is_empty = lower.contains(r#"id="root""#) || lower.contains(r#"id="app""#);
    if root_is_empty && body_text.trim().len() < SHELL_BODY_TEXT_FLOOR {
        return DetectedAnomaly::of(AnomalyType::EmptyShell, 0.75, "empty SPA shell", SuggestedAction::Retry);
    }

    if let Some(topic) = expected_topic {
        if !body_text.to_ascii_lowercase().contains(&topic.to_ascii_lowercase()) {
            let mut anomaly = DetectedAnomaly::of(
                AnomalyType::TopicDrift,
                0.5,
                format!("expected topic '{topic}' not found in content"),
                SuggestedAction::Retry,
            );
            anomaly.confidence = 0.5;
            return anomaly;
        }
    }

    DetectedAnomaly::none()
}

fn extract_title_lower(lower_html: &str) -> Option<String> {
    let start = lower_html.find("<title")? + 6;
    let tag_end = lower_html[start..].find('>')? + start + 1;
    let end = lower_html[tag_end..].find("</title>")? + tag_end;
    Some(lower_html[tag_end..end].to_string())
}

#[derive(Debug, Clone)]
pub struct SuccessProfile {
    pub tier: RenderTier,
    pub response_time_ms: u64,
    pub content_length: usize,
    pub has_structured_data: bool,
    pub has_framework_data: bool,
    pub has_bypassable_apis: bool,
}

#[derive(Debug, Clone)]
pub struct FailurePatternSummary {
    pub should_backoff: bool,
    pub most_common_type: Option<FailureType>,
}

/// Owns the per-tenant `DomainEntry` map (§4.9). Mutations are written
/// through to the KV store's `domain_entries` namespace so a fresh
/// `LearningEngine` rehydrates on demand rather than starting cold
/// every process restart.
pub struct LearningEngine<S: KvStore + ?Sized> {
    store: std::sync::Arc<S>,
    cache: RwLock<HashMap<(String, String), DomainEntry>>,
    heuristics: std::sync::Arc<HeuristicsConfig>,
}

impl<S: KvStore + ?Sized> LearningEngine<S> {
    pub fn new(store: std::sync::Arc<S>, heuristics: std::sync::Arc<HeuristicsConfig>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            heuristics,
        }
    }

    fn cache_key(tenant: &TenantId, domain: &str) -> (String, String) {
        (tenant.0.clone(), domain.to_string())
    }

    /// Returns the domain's entry, loading from the KV store on first
    /// access and falling back to a fresh `DomainEntry` otherwise.
    pub async fn get_entry(&self, tenant: &TenantId, domain: &str) -> DomainEntry {
        let key = Self::cache_key(tenant, domain);
        if let Some(entry) = self.cache.read().await.get(&key).cloned() {
            return entry;
        }
        let typed = TypedStore::new(self.store.as_ref());
        let loaded: Option<DomainEntry> = typed
            .get_json(tenant, DOMAIN_ENTRIES_NAMESPACE, domain)
            .await
            .unwrap_or(None);
        let entry = loaded.unwrap_or_else(|| {
            let mut fresh = DomainEntry::new(domain);
            fresh.domain_group = self.heuristics.find_domain_group(domain).map(|g| g.name);
            fresh
        });
        self.cache.write().await.insert(key, entry.clone());
        entry
    }

    async fn persist(&self, tenant: &TenantId, entry: &DomainEntry) -> StoreResult<()> {
        TypedStore::new(self.store.as_ref())
            .put_json(tenant, DOMAIN_ENTRIES_NAMESPACE, &entry.domain, entry)
            .await
    }

    async fn mutate<F>(&self, tenant: &TenantId, domain: &str, f: F) -> DomainEntry
    where
        F: FnOnce(&mut DomainEntry),
    {
        let mut entry = self.get_entry(tenant, domain).await;
        f(&mut entry);
        let key = Self::cache_key(tenant, domain);
        self.cache.write().await.insert(key, entry.clone());
        let _ = self.persist(tenant, &entry).await;
        entry
    }

    pub async fn get_selector_chain(&self, tenant: &TenantId, domain: &str, content_type: ContentType) -> Vec<String> {
        self.get_entry(tenant, domain).await.selector_chain(content_type)
    }

    pub async fn learn_selector(&self, tenant: &TenantId, domain: &str, selector: &str, content_type: ContentType) {
        self.mutate(tenant, domain, |entry| entry.learn_selector(content_type, selector))
            .await;
    }

    pub async fn record_selector_failure(&self, tenant: &TenantId, domain: &str, selector: &str, content_type: ContentType) {
        self.mutate(tenant, domain, |entry| entry.record_selector_failure(content_type, selector))
            .await;
    }

    /// Infers a compact validator rule from an observed good extraction:
    /// a floor at 80% of the observed length, plus the domain's known
    /// forbidden phrases (§4.9 `learn_validator`).
    pub async fn learn_validator(&self, tenant: &TenantId, domain: &str, text: &str, _url: &str) {
        let floor = (text.len() as f64 * 0.8) as usize;
        self.mutate(tenant, domain, |entry| {
            entry.validators.push(ValidatorRule {
                min_text_length: Some(floor),
                required_substrings: Vec::new(),
                forbidden_substrings: vec!["Access Denied".to_string(), "403 Forbidden".to_string()],
                language: None,
                min_link_count: None,
            });
        })
        .await;
    }

    pub async fn validate_content(&self, tenant: &TenantId, domain: &str, text: &str) -> (bool, Vec<String>) {
        let entry = self.get_entry(tenant, domain).await;
        let mut reasons = Vec::new();
        for validator in &entry.validators {
            reasons.extend(validator.validate(text, None, 0));
        }
        (reasons.is_empty(), reasons)
    }

    pub async fn record_failure(
        &self,
        tenant: &TenantId,
        domain: &str,
        failure_type: FailureType,
        error_message: impl Into<String>,
        recovery_attempted: bool,
        recovery_succeeded: Option<bool>,
    ) {
        let report = FailureReport {
            failure_type,
            error_message: error_message.into(),
            recovery_attempted,
            recovery_succeeded,
            occurred_at: Utc::now(),
        };
        self.mutate(tenant, domain, |entry| entry.record_failure(report)).await;
    }

    pub async fn record_outcome(&self, tenant: &TenantId, domain: &str, success: bool) {
        self.mutate(tenant, domain, |entry| entry.record_outcome(success)).await;
    }

    /// Backoff when >= 3 failures of the same class within the last hour
    /// (§4.9 `get_failure_patterns`).
    pub async fn get_failure_patterns(&self, tenant: &TenantId, domain: &str) -> FailurePatternSummary {
        let entry = self.get_entry(tenant, domain).await;
        let (should_backoff, most_common_type) = entry.should_backoff(Utc::now());
        FailurePatternSummary {
            should_backoff,
            most_common_type,
        }
    }

    pub async fn record_success(&self, tenant: &TenantId, domain: &str, profile: SuccessProfile) {
        self.mutate(tenant, domain, |entry| {
            entry.preferred_tier = Some(profile.tier);
            entry.record_outcome(true);
        })
        .await;
    }

    pub async fn learn_pagination_pattern(&self, tenant: &TenantId, domain: &str, path: &str, pattern: PaginationPattern) {
        self.mutate(tenant, domain, |entry| {
            entry.pagination_patterns.insert(path.to_string(), pattern);
        })
        .await;
    }

    pub async fn get_pagination_pattern(&self, tenant: &TenantId, domain: &str, path: &str) -> Option<PaginationPattern> {
        self.get_entry(tenant, domain).await.pagination_patterns.get(path).cloned()
    }

    /// Observer entry point for form-submission learning (Open Question
    /// decision #2 in SPEC_FULL.md): stores the raw method/content-type
    /// keyed by path without attempting REST/GraphQL/multipart schema
    /// harmonisation.
    pub async fn learn_from_form_submission(&self, tenant: &TenantId, domain: &str, path: &str, method: &str, content_type: &str, fields: HashMap<String, String>) {
        let key = format!("{method}:{content_type}:{path}");
        let value = serde_json::json!({ "fields": fields });
        self.mutate(tenant, domain, |entry| {
            entry.form_patterns.insert(key, value);
        })
        .await;
    }

    pub fn get_domain_group(&self, domain: &str) -> Option<crate::config::DomainGroup> {
        self.heuristics.find_domain_group(domain)
    }

    /// Maps a renderer failure onto the Learning Engine's failure
    /// taxonomy (§4.9 `classify_error`).
    pub fn classify_error(error: &RenderError) -> FailureType {
        match error {
            RenderError::Timeout => FailureType::Timeout,
            RenderError::BotChallenge => FailureType::BotChallenge,
            RenderError::HttpError { .. } => FailureType::HttpError,
            RenderError::ParseError(_) | RenderError::ScriptError(_) => FailureType::ParseError,
            RenderError::Network(_) => FailureType::HttpError,
            RenderError::ContentTooShort => FailureType::EmptyContent,
            RenderError::ValidationFailed(_) => FailureType::EmptyContent,
            RenderError::Cancelled => FailureType::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::memory::MemoryKvStore;

    fn engine() -> LearningEngine<MemoryKvStore> {
        LearningEngine::new(std::sync::Arc::new(MemoryKvStore::new()), std::sync::Arc::new(HeuristicsConfig::empty()))
    }

    #[tokio::test]
    async fn selector_reinforcement_persists_across_cache_eviction() {
        let engine = engine();
        let tenant = TenantId::new("t1");
        for _ in 0..3 {
            engine.learn_selector(&tenant, "example.com", ".content", ContentType::MainContent).await;
        }
        let chain = engine.get_selector_chain(&tenant, "example.com", ContentType::MainContent).await;
        assert_eq!(chain[0], ".content");
    }

    #[tokio::test]
    async fn detects_bot_challenge_marker() {
        let anomaly = detect_content_anomalies("<title>Just a moment...</title>", None, "");
        assert!(anomaly.is_anomaly);
        assert_eq!(anomaly.anomaly_type, Some(AnomalyType::BotChallenge));
    }

    #[tokio::test]
    async fn detects_empty_spa_shell() {
        let anomaly = detect_content_anomalies(r#"<body><div id="root"></div></body>"#, None, "");
        assert!(anomaly.is_anomaly);
        assert_eq!(anomaly.anomaly_type, Some(AnomalyType::EmptyShell));
    }

    #[tokio::test]
    async fn clean_page_is_not_anomalous() {
        let body = "a".repeat(2000);
        let anomaly = detect_content_anomalies(&format!("<body>{body}</body>"), None, &body);
        assert!(!anomaly.is_anomaly);
    }

    #[tokio::test]
    async fn backoff_after_repeated_failures() {
        let engine = engine();
        let tenant = TenantId::new("t1");
        for _ in 0..3 {
            engine
                .record_failure(&tenant, "slow.example", FailureType::Timeout, "timed out", false, None)
                .await;
        }
        let summary = engine.get_failure_patterns(&tenant, "slow.example").await;
        assert!(summary.should_backoff);
    }
}
