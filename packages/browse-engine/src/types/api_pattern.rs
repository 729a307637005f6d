//! `ApiPattern` (§3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiPatternMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failure_reason: Option<String>,
    pub avg_response_ms: f64,
}

/// A learned bypass pattern: a URL template mapped to a JSON API endpoint
/// whose response contains the same content as the rendered page (§3,
/// glossary "Bypass pattern").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPattern {
    pub id: Uuid,
    pub url_pattern: String,
    pub method: String,
    pub content_mapping: HashMap<String, String>,
    pub category: String,
    pub contributor: Option<String>,
    pub confidence: f32,
    pub metrics: ApiPatternMetrics,
    pub learned_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Consecutive-failure counter backing the quarantine rule (§4.8):
    /// three consecutive failures trigger a cooldown.
    pub consecutive_failures: u32,
    pub quarantined_until: Option<DateTime<Utc>>,
}

impl ApiPattern {
    pub fn new(url_pattern: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            url_pattern: url_pattern.into(),
            method: method.into(),
            content_mapping: HashMap::new(),
            category: "general".to_string(),
            contributor: None,
            confidence: 0.5,
            metrics: ApiPatternMetrics::default(),
            learned_at: Utc::now(),
            last_used_at: None,
            consecutive_failures: 0,
            quarantined_until: None,
        }
    }

    /// Number of fixed (non-`{id}`) path tokens — used to rank matches
    /// by specificity (§4.8 `find_matching`).
    pub fn specificity(&self) -> usize {
        self.url_pattern
            .split(['/', '?', '&'])
            .filter(|tok| !tok.is_empty() && *tok != "{id}")
            .count()
    }

    /// Retired when confidence < 0.1 AND failure_count >= 5 (§3).
    pub fn is_retired(&self) -> bool {
        self.confidence < 0.1 && self.metrics.failure_count >= 5
    }

    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        matches!(self.quarantined_until, Some(until) if now < until)
    }

    /// Confidence update rule (§4.8):
    /// `c <- clamp(c + (success ? +alpha/(n+1) : -beta), 0, 1)`.
    pub fn update_metrics(&mut self, success: bool, duration_ms: u64, failure_reason: Option<String>) {
        const ALPHA: f32 = 0.5;
        const BETA: f32 = 0.2;
        const COOLDOWN_MINUTES: i64 = 15;

        let n = self.metrics.success_count + self.metrics.failure_count;
        if success {
            self.metrics.success_count += 1;
            self.consecutive_failures = 0;
            self.confidence = (self.confidence + ALPHA / (n as f32 + 1.0)).clamp(0.0, 1.0);
        } else {
            self.metrics.failure_count += 1;
            self.metrics.last_failure_reason = failure_reason;
            self.consecutive_failures += 1;
            self.confidence = (self.confidence - BETA).clamp(0.0, 1.0);
            if self.consecutive_failures >= 3 {
                self.quarantined_until =
                    Some(Utc::now() + chrono::Duration::minutes(COOLDOWN_MINUTES));
            }
        }

        let total = (n + 1) as f64;
        self.metrics.avg_response_ms =
            (self.metrics.avg_response_ms * (total - 1.0) + duration_ms as f64) / total;
        self.last_used_at = Some(Utc::now());
    }
}

/// Replaces long numeric or uuid-like path segments with `{id}` so that
/// repeated observations of the same endpoint shape reinforce a single
/// template (§4.8, §8 property 5).
pub fn templatize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_numeric_or_uuid_like(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_numeric_or_uuid_like(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let is_long_numeric = segment.len() >= 4 && segment.chars().all(|c| c.is_ascii_digit());
    let is_uuid = Uuid::parse_str(segment).is_ok();
    let is_hex_id = segment.len() >= 6
        && segment.chars().all(|c| c.is_ascii_hexdigit())
        && segment.chars().any(|c| c.is_ascii_digit());
    is_long_numeric || is_uuid || is_hex_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templatizes_numeric_and_uuid_segments() {
        assert_eq!(templatize_path("/posts/123456/comments"), "/posts/{id}/comments");
        assert_eq!(
            templatize_path("/users/550e8400-e29b-41d4-a716-446655440000"),
            "/users/{id}"
        );
        assert_eq!(templatize_path("/r/rust/comments"), "/r/rust/comments");
    }

    #[test]
    fn confidence_rises_on_success_and_falls_on_failure() {
        let mut p = ApiPattern::new("/posts/{id}", "GET");
        let before = p.confidence;
        p.update_metrics(true, 100, None);
        assert!(p.confidence >= before);

        let mut p2 = ApiPattern::new("/posts/{id}", "GET");
        let before2 = p2.confidence;
        p2.update_metrics(false, 100, Some("http_error".into()));
        assert!(p2.confidence <= before2);
    }

    #[test]
    fn three_consecutive_failures_quarantine() {
        let mut p = ApiPattern::new("/posts/{id}", "GET");
        for _ in 0..3 {
            p.update_metrics(false, 50, Some("timeout".into()));
        }
        assert!(p.is_quarantined(Utc::now()));
    }
}
