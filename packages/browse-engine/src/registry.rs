//! API Pattern Registry (§4.8): a domain-indexed collection of learned
//! `ApiPattern`s with a seeded bootstrap set for common publishing
//! platforms, wired to `seesaw::EventBus` for the change-event stream.
//!
//! Grounded on the domain-indexed-map shape already used by
//! `DomainEntry` (`types/domain_entry.rs`); the confidence/quarantine
//! mechanics themselves live on `ApiPattern` (`types/api_pattern.rs`)
//! and are only orchestrated here.

use std::collections::HashMap;

use seesaw::EventBus;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::PatternChangeEvent;
use crate::types::api_pattern::templatize_path;
use crate::types::ApiPattern;

/// §4.8's minimum-viable-pattern floor: below this response body length a
/// captured call is almost certainly a beacon or empty ack, not a content
/// API worth templatizing.
const MIN_VIABLE_BODY_LEN: usize = 100;

/// Searches a JSON value depth-first for a string field equal to or
/// containing `needle`, returning a dotted/indexed path to it (§4.8:
/// "searching the structured response for the extracted title/text
/// values and recording the JSON path").
fn find_json_path(value: &serde_json::Value, needle: &str) -> Option<String> {
    fn walk(value: &serde_json::Value, needle: &str, path: &str) -> Option<String> {
        match value {
            serde_json::Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() && (s == needle || (needle.len() > 8 && s.contains(needle))) {
                    Some(path.to_string())
                } else {
                    None
                }
            }
            serde_json::Value::Object(map) => map.iter().find_map(|(key, child)| {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                walk(child, needle, &child_path)
            }),
            serde_json::Value::Array(items) => items.iter().enumerate().find_map(|(i, child)| {
                walk(child, needle, &format!("{path}[{i}]"))
            }),
            _ => None,
        }
    }

    let needle = needle.trim();
    if needle.is_empty() {
        return None;
    }
    walk(value, needle, "")
}

/// Builds the content mapping for a captured JSON API call by searching
/// for the page's own extracted title/text, falling back to the
/// conventional `title`/`description` keys when neither is found in the
/// body (§4.8).
fn derive_content_mapping(body: &serde_json::Value, title: Option<&str>, text: Option<&str>) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    if let Some(title) = title {
        if let Some(path) = find_json_path(body, title) {
            mapping.insert("title".to_string(), path);
        }
    }
    if let Some(text) = text {
        let snippet: String = text.chars().take(200).collect();
        if let Some(path) = find_json_path(body, &snippet) {
            mapping.insert("description".to_string(), path);
        }
    }
    if mapping.is_empty() {
        mapping.insert("title".to_string(), "title".to_string());
        mapping.insert("description".to_string(), "description".to_string());
    }
    mapping
}

/// Seeds well-known bypass patterns for high-traffic publishing
/// platforms so that cold-start domains still have a chance at an
/// intelligence-tier hit (§4.8 "pre-populated with common patterns").
fn seed_patterns() -> Vec<(&'static str, ApiPattern)> {
    let mut seeds = Vec::new();

    let mut reddit = ApiPattern::new("/r/{id}/comments/{id}", "GET");
    reddit.category = "json_suffix".to_string();
    reddit.confidence = 0.8;
    seeds.push(("reddit.com", reddit));

    let mut npm = ApiPattern::new("/{id}", "GET");
    npm.category = "package_registry".to_string();
    npm.confidence = 0.8;
    seeds.push(("registry.npmjs.org", npm));

    let mut pypi = ApiPattern::new("/pypi/{id}/json", "GET");
    pypi.category = "package_registry".to_string();
    pypi.confidence = 0.8;
    seeds.push(("pypi.org", pypi));

    let mut github = ApiPattern::new("/repos/{id}/{id}", "GET");
    github.category = "rest_api".to_string();
    github.confidence = 0.85;
    seeds.push(("github.com", github));

    let mut wikipedia = ApiPattern::new("/w/api.php", "GET");
    wikipedia.category = "mediawiki_api".to_string();
    wikipedia.confidence = 0.85;
    seeds.push(("wikipedia.org", wikipedia));

    let mut hacker_news = ApiPattern::new("/v0/item/{id}.json", "GET");
    hacker_news.category = "json_endpoint".to_string();
    hacker_news.confidence = 0.85;
    seeds.push(("news.ycombinator.com", hacker_news));

    let mut stackoverflow = ApiPattern::new("/2.3/questions/{id}", "GET");
    stackoverflow.category = "rest_api".to_string();
    stackoverflow.confidence = 0.8;
    seeds.push(("stackoverflow.com", stackoverflow));

    let mut devto = ApiPattern::new("/api/articles/{id}", "GET");
    devto.category = "rest_api".to_string();
    devto.confidence = 0.8;
    seeds.push(("dev.to", devto));

    seeds
}

/// Domain-indexed collection of learned and seeded `ApiPattern`s.
pub struct PatternRegistry {
    domains: RwLock<HashMap<String, Vec<ApiPattern>>>,
    bus: EventBus,
}

impl PatternRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Builds a registry with the seeded bootstrap set already loaded.
    /// Synchronous because construction happens before the registry is
    /// shared, so no lock contention is possible yet; `CoreContext::new`
    /// (itself sync) relies on this to make §4.8's "new installations are
    /// useful immediately" bootstrap guarantee hold without an async ctor.
    pub fn new_with_seed(bus: EventBus) -> Self {
        let mut domains: HashMap<String, Vec<ApiPattern>> = HashMap::new();
        for (domain, pattern) in seed_patterns() {
            domains.entry(domain.to_string()).or_default().push(pattern);
        }
        Self {
            domains: RwLock::new(domains),
            bus,
        }
    }

    /// Async convenience wrapper over `new_with_seed`, kept for call sites
    /// already in an async context.
    pub async fn with_seed_bootstrap(bus: EventBus) -> Self {
        Self::new_with_seed(bus)
    }

    /// Finds the highest-specificity, non-quarantined, non-retired
    /// pattern matching `path`'s templatized shape (§4.8 `find_matching`).
    pub async fn find_matching(&self, domain: &str, path: &str) -> Option<ApiPattern> {
        let templatized = templatize_path(path);
        let now = chrono::Utc::now();
        let domains = self.domains.read().await;
        domains
            .get(domain)?
            .iter()
            .filter(|p| p.url_pattern == templatized)
            .filter(|p| !p.is_quarantined(now) && !p.is_retired())
            .max_by_key(|p| p.specificity())
            .cloned()
    }

    pub async fn list(&self, domain: &str) -> Vec<ApiPattern> {
        self.domains
            .read()
            .await
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Records a newly observed API call as a bypass candidate, either
    /// reinforcing an existing pattern with the same templatized shape
    /// or creating a new one (§4.8 `learn_from_extraction`). Gated on the
    /// minimum-viable-pattern rule: the call must carry a JSON response of
    /// at least `MIN_VIABLE_BODY_LEN` bytes, and the resulting content
    /// mapping (searched from the extracted title/text, falling back to
    /// `title`/`description`) must carry at least one field. Non-JSON
    /// requests (analytics beacons, static assets, HTML navigations) are
    /// not candidates and return `None`.
    pub async fn learn_from_extraction(
        &self,
        domain: &str,
        url_path: &str,
        method: &str,
        content_type: Option<&str>,
        response_body: Option<&str>,
        extracted_title: Option<&str>,
        extracted_text: Option<&str>,
        contributor: Option<String>,
    ) -> Option<Uuid> {
        let is_json = content_type.map(|ct| ct.to_ascii_lowercase().contains("json")).unwrap_or(false);
        if !is_json {
            return None;
        }
        let body = response_body?;
        if body.len() < MIN_VIABLE_BODY_LEN {
            return None;
        }
        let parsed_body: serde_json::Value = serde_json::from_str(body).ok()?;
        let content_mapping = derive_content_mapping(&parsed_body, extracted_title, extracted_text);
        if content_mapping.is_empty() {
            return None;
        }

        let templatized = templatize_path(url_path);
        let mut domains = self.domains.write().await;
        let patterns = domains.entry(domain.to_string()).or_default();

        if let Some(existing) = patterns
            .iter_mut()
            .find(|p| p.url_pattern == templatized && p.method == method)
        {
            existing.content_mapping.extend(content_mapping);
            let id = existing.id;
            self.bus.emit(PatternChangeEvent::applied(domain, id));
            return Some(id);
        }

        let mut pattern = ApiPattern::new(templatized, method);
        pattern.content_mapping = content_mapping;
        pattern.contributor = contributor;
        let id = pattern.id;
        patterns.push(pattern);
        self.bus
            .emit(PatternChangeEvent::learned(domain, id, "new pattern observed"));
        Some(id)
    }

    /// Updates a pattern's metrics after use, emitting quarantine/retire
    /// events as the confidence rule dictates (§4.8).
    pub async fn update_metrics(
        &self,
        domain: &str,
        pattern_id: Uuid,
        success: bool,
        duration_ms: u64,
        failure_reason: Option<String>,
    ) {
        let mut domains = self.domains.write().await;
        let Some(patterns) = domains.get_mut(domain) else {
            return;
        };
        let Some(pattern) = patterns.iter_mut().find(|p| p.id == pattern_id) else {
            return;
        };

        let was_quarantined = pattern.is_quarantined(chrono::Utc::now());
        pattern.update_metrics(success, duration_ms, failure_reason);
        let is_quarantined = pattern.is_quarantined(chrono::Utc::now());
        let is_retired = pattern.is_retired();

        if !was_quarantined && is_quarantined {
            self.bus.emit(PatternChangeEvent::quarantined(domain, pattern_id));
        }
        if is_retired {
            self.bus.emit(PatternChangeEvent::retired(domain, pattern_id));
        }
    }

    /// Transfers a pattern learned on one domain to a sibling domain in
    /// the same domain group, at reduced confidence (§4.8 cross-domain
    /// transfer within a `DomainGroup`).
    pub async fn transfer(&self, from_domain: &str, to_domain: &str, pattern_id: Uuid) -> Option<Uuid> {
        let mut domains = self.domains.write().await;
        let source = domains.get(from_domain)?.iter().find(|p| p.id == pattern_id)?.clone();
        let mut transferred = source.clone();
        transferred.id = Uuid::now_v7();
        transferred.confidence *= 0.5;
        transferred.metrics = Default::default();
        transferred.consecutive_failures = 0;
        transferred.quarantined_until = None;
        let new_id = transferred.id;
        domains.entry(to_domain.to_string()).or_default().push(transferred);
        self.bus
            .emit(PatternChangeEvent::transferred(to_domain, new_id, from_domain));
        Some(new_id)
    }

    pub async fn remove(&self, domain: &str, pattern_id: Uuid) {
        if let Some(patterns) = self.domains.write().await.get_mut(domain) {
            patterns.retain(|p| p.id != pattern_id);
        }
    }

    pub async fn clear(&self, domain: &str) {
        self.domains.write().await.remove(domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A JSON body that clears the minimum-viable-pattern floor (>= 100
    /// bytes) and contains a field findable by title/text search.
    const VIABLE_BODY: &str = r#"{"title": "Example Post", "body": "This article body runs well past one hundred characters so the pattern registry treats it as a real content API response."}"#;

    #[tokio::test]
    async fn seeded_domains_are_queryable() {
        let registry = PatternRegistry::with_seed_bootstrap(EventBus::new()).await;
        let found = registry.find_matching("pypi.org", "/pypi/requests/json").await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn learn_from_extraction_reinforces_same_shape() {
        let registry = PatternRegistry::new(EventBus::new());
        let id1 = registry
            .learn_from_extraction(
                "example.com",
                "/posts/123456",
                "GET",
                Some("application/json"),
                Some(VIABLE_BODY),
                Some("Example Post"),
                None,
                None,
            )
            .await
            .unwrap();
        let id2 = registry
            .learn_from_extraction(
                "example.com",
                "/posts/789012",
                "GET",
                Some("application/json"),
                Some(VIABLE_BODY),
                Some("Example Post"),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(registry.list("example.com").await.len(), 1);
        let pattern = registry.list("example.com").await.into_iter().next().unwrap();
        assert_eq!(pattern.content_mapping.get("title"), Some(&"title".to_string()));
    }

    #[tokio::test]
    async fn non_json_or_undersized_responses_do_not_spawn_a_pattern() {
        let registry = PatternRegistry::new(EventBus::new());
        let html_response = registry
            .learn_from_extraction("example.com", "/posts/1", "GET", Some("text/html"), Some(VIABLE_BODY), None, None, None)
            .await;
        assert!(html_response.is_none());

        let short_body = registry
            .learn_from_extraction("example.com", "/posts/1", "GET", Some("application/json"), Some("{}"), None, None, None)
            .await;
        assert!(short_body.is_none());

        assert!(registry.list("example.com").await.is_empty());
    }

    #[tokio::test]
    async fn quarantine_emits_event() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        let registry = PatternRegistry::new(bus);
        let id = registry
            .learn_from_extraction(
                "example.com",
                "/posts/123",
                "GET",
                Some("application/json"),
                Some(VIABLE_BODY),
                Some("Example Post"),
                None,
                None,
            )
            .await
            .unwrap();
        for _ in 0..3 {
            registry
                .update_metrics("example.com", id, false, 50, Some("timeout".into()))
                .await;
        }
        let envelope = receiver.recv().await.unwrap();
        let _ = envelope;
    }

    #[tokio::test]
    async fn transfer_reduces_confidence_and_resets_metrics() {
        let registry = PatternRegistry::new(EventBus::new());
        let id = registry
            .learn_from_extraction(
                "a.example.com",
                "/posts/123",
                "GET",
                Some("application/json"),
                Some(VIABLE_BODY),
                Some("Example Post"),
                None,
                None,
            )
            .await
            .unwrap();
        registry.update_metrics("a.example.com", id, true, 50, None).await;
        let new_id = registry
            .transfer("a.example.com", "b.example.com", id)
            .await
            .unwrap();
        let transferred = registry
            .list("b.example.com")
            .await
            .into_iter()
            .find(|p| p.id == new_id)
            .unwrap();
        assert_eq!(transferred.metrics.success_count, 0);
    }
}
