//! Tiered Fetcher (§4.3): the orchestrator that ties the URL gate, rate
//! limiter, API pattern registry, per-tier renderers, extractor,
//! verifier, learning engine, and procedural memory into a single
//! `fetch` call.
//!
//! Grounded on `packages/intelligent-crawler/src/effects/discovery.rs`'s
//! `DiscoveryEffect<S, F, E, R>` shape: a struct generic over one trait
//! per capability, an `execute`-style entry point that pattern-matches
//! on intent and delegates to private async steps which accumulate a
//! result incrementally and never let a single failed sub-step abort
//! the whole operation. Here the "command" is always "fetch a URL," so
//! `execute` collapses into `fetch`, and the accumulator is the
//! `DecisionTrace` rather than a `Vec<Event>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::HeuristicsConfig;
use crate::error::{FetchError, RenderError, Result};
use crate::extractor;
use crate::kv_store::{KvStore, TypedStore};
use crate::learning::{self, DetectedAnomaly, LearningEngine, SuccessProfile};
use crate::procedural_memory::ProceduralMemory;
use crate::rate_limiter::RateLimiter;
use crate::registry::PatternRegistry;
use crate::renderers::{RenderOutput, Renderer};
use crate::types::api_pattern::ApiPattern;
use crate::types::browse_result::{BrowseResult, LearningSummary};
use crate::types::decision_trace::{DecisionTrace, TierAttempt};
use crate::types::domain_entry::{ContentType, PaginationPattern, PaginationType};
use crate::types::page_context::PageContext;
use crate::types::request::{BrowseOptions, FreshnessRequirement, RenderTier, Request};
use crate::trace;
use crate::types::trajectory::{ActionType, BrowsingTrajectory};
use crate::types::url::{normalize_domain, ParsedUrl, TenantId};
use crate::url_gate::UrlGate;

/// Domains back off for this long once `get_failure_patterns` reports
/// three same-class failures within the last hour (§4.3 step 3).
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// An API pattern below this confidence is not worth a first-shot try
/// (§4.3 step 4).
const PATTERN_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// KV namespace for the page-level cache consulted in §4.3 step 2 (§6
/// persisted-state layout lists `page_cache` alongside the other
/// namespaces this crate owns).
const PAGE_CACHE_NAMESPACE: &str = "page_cache";

/// A cached page result along with the timestamp it was written, so
/// `freshness` can be checked against `page_cache_ttl_ms` without a
/// separate TTL index. `content_hash` is the sha256 of the extracted
/// text, giving the cache entry the `(url, content-hash)` key shape §3
/// describes — a second fetch that lands the same hash can skip
/// re-learning signals even when the TTL alone would call it stale.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CachedPage {
    result: BrowseResult,
    cached_at: chrono::DateTime<chrono::Utc>,
    content_hash: String,
}

/// Hex-encoded sha256 of `text`, used as the content-hash half of the
/// page cache's `(url, content-hash)` key (§3).
fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

/// Best-effort pagination pattern inferred straight from a URL's own
/// shape, used the first time a domain is fetched with
/// `follow_pagination` before any learned pattern exists (§4.9
/// `learn_pagination_pattern`). Only query-param and path-segment
/// pagination are URL-addressable without a live DOM; next-button and
/// cursor pagination require a selector/token this crate has no way to
/// observe from a one-shot render, so this never infers those kinds.
fn infer_pagination_pattern(url: &str) -> Option<PaginationPattern> {
    let parsed = url::Url::parse(url).ok()?;
    for (key, value) in parsed.query_pairs() {
        if matches!(key.as_ref(), "page" | "p" | "pg" | "offset") && value.parse::<u64>().is_ok() {
            return Some(PaginationPattern {
                kind: PaginationType::QueryParam,
                selector: None,
                param_name: Some(key.into_owned()),
                template: None,
            });
        }
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    if segments.iter().any(|s| s.parse::<u64>().is_ok()) {
        return Some(PaginationPattern {
            kind: PaginationType::PathSegment,
            selector: None,
            param_name: None,
            template: None,
        });
    }
    None
}

/// Computes the next page's URL from a learned/inferred pagination
/// pattern. `NextButton`/`Cursor` patterns need a live DOM selector or an
/// opaque cursor token this crate cannot resolve outside an interactive
/// session, so they return `None` here rather than guess (§4.9).
fn next_page_url(pattern: &PaginationPattern, current_url: &str) -> Option<String> {
    match pattern.kind {
        PaginationType::QueryParam => {
            let param = pattern.param_name.as_deref().unwrap_or("page");
            let mut url = url::Url::parse(current_url).ok()?;
            let current: u64 = url
                .query_pairs()
                .find(|(k, _)| k == param)
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            let remaining: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != param)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                for (k, v) in &remaining {
                    pairs.append_pair(k, v);
                }
                pairs.append_pair(param, &(current + 1).to_string());
            }
            Some(url.to_string())
        }
        PaginationType::PathSegment => {
            let mut url = url::Url::parse(current_url).ok()?;
            let segments: Vec<String> = url.path_segments()?.map(|s| s.to_string()).collect();
            let mut next_segments = segments;
            let last_numeric = next_segments.iter().rposition(|s| s.parse::<u64>().is_ok())?;
            let current: u64 = next_segments[last_numeric].parse().ok()?;
            next_segments[last_numeric] = (current + 1).to_string();
            url.set_path(&next_segments.join("/"));
            Some(url.to_string())
        }
        PaginationType::NextButton | PaginationType::Cursor => None,
    }
}

/// Renderers keyed by tier, dispatched at runtime since the three tiers
/// have different constructors and feature gates (§4.6's `full_browser`
/// is conditionally compiled).
pub struct RendererSet {
    renderers: HashMap<RenderTier, Arc<dyn Renderer>>,
}

impl RendererSet {
    pub fn new() -> Self {
        Self {
            renderers: HashMap::new(),
        }
    }

    pub fn with(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderers.insert(renderer.tier(), renderer);
        self
    }

    fn get(&self, tier: RenderTier) -> Option<&Arc<dyn Renderer>> {
        self.renderers.get(&tier)
    }
}

impl Default for RendererSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrates one `fetch` call end to end, holding shared handles to
/// every capability it composes. Generic only over the KV-store
/// backend, mirroring `LearningEngine<S>`/`ProceduralMemory<S>`;
/// renderers are boxed trait objects since `RendererSet` already erases
/// their concrete types.
pub struct TieredFetcher<S: KvStore + ?Sized> {
    pub store: Arc<S>,
    pub url_gate: Arc<UrlGate>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: Arc<PatternRegistry>,
    pub learning: Arc<LearningEngine<S>>,
    pub procedural_memory: Arc<ProceduralMemory<S>>,
    pub renderers: Arc<RendererSet>,
    pub heuristics: Arc<HeuristicsConfig>,
    pub page_cache_ttl_ms: u64,
    pub debug_trace_enabled: bool,
}

impl<S: KvStore + ?Sized> TieredFetcher<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        url_gate: Arc<UrlGate>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<PatternRegistry>,
        learning: Arc<LearningEngine<S>>,
        procedural_memory: Arc<ProceduralMemory<S>>,
        renderers: Arc<RendererSet>,
        heuristics: Arc<HeuristicsConfig>,
        page_cache_ttl_ms: u64,
    ) -> Self {
        Self::with_debug_trace(
            store,
            url_gate,
            rate_limiter,
            registry,
            learning,
            procedural_memory,
            renderers,
            heuristics,
            page_cache_ttl_ms,
            false,
        )
    }

    /// Like `new`, but also sets whether a sealed trace is persisted to
    /// the debug store after every `fetch` call (§4.13, §6
    /// `DEBUG_TRACE_ENABLED`). `CoreContext::new` uses this so the flag
    /// tracks `EnvConfig` without every existing `new` call site having
    /// to thread it through.
    #[allow(clippy::too_many_arguments)]
    pub fn with_debug_trace(
        store: Arc<S>,
        url_gate: Arc<UrlGate>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<PatternRegistry>,
        learning: Arc<LearningEngine<S>>,
        procedural_memory: Arc<ProceduralMemory<S>>,
        renderers: Arc<RendererSet>,
        heuristics: Arc<HeuristicsConfig>,
        page_cache_ttl_ms: u64,
        debug_trace_enabled: bool,
    ) -> Self {
        Self {
            store,
            url_gate,
            rate_limiter,
            registry,
            learning,
            procedural_memory,
            renderers,
            heuristics,
            page_cache_ttl_ms,
            debug_trace_enabled,
        }
    }

    /// Runs the full §4.3 algorithm for a single request. `cancel`
    /// propagates to every suspension point; a request budget
    /// (`opts.max_latency_ms`) and a per-attempt tier budget
    /// (`opts.tier_timeout_ms`) race it independently.
    pub async fn fetch(&self, request: &Request, cancel: CancellationToken) -> Result<BrowseResult> {
        let started = Instant::now();
        let mut trace = DecisionTrace::new();

        // Step 1: gate + rate-limit.
        self.url_gate
            .validate_with_dns(&request.url)
            .await
            .map_err(FetchError::SsrfBlocked)?;
        let parsed = ParsedUrl::parse(&request.url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let domain = normalize_domain(&parsed.host);

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        self.rate_limiter.acquire(&domain).await;

        // Step 2: page-level cache, only ever short-circuits in `cached`
        // freshness mode; `any` consults it but still always fetches, per
        // §4.3's literal wording ("if fresh and freshness=cached, return").
        if request.options.freshness != FreshnessRequirement::Realtime {
            if let Some(cached) = self.lookup_cache(&request.tenant_id, &request.url).await {
                if request.options.freshness == FreshnessRequirement::Cached {
                    return Ok(cached);
                }
            }
        }

        // Step 3: consult failure pattern and back off if warranted.
        let failure_patterns = self.learning.get_failure_patterns(&request.tenant_id, &domain).await;
        if failure_patterns.should_backoff {
            tokio::select! {
                _ = tokio::time::sleep(DEFAULT_BACKOFF) => {}
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            }
        }

        let request_budget = request.options.max_latency_ms.map(Duration::from_millis);

        // Step 4: API pattern registry first-shot attempt.
        if let Some(pattern) = self.registry.find_matching(&domain, &parsed.path).await {
            if pattern.confidence >= PATTERN_CONFIDENCE_THRESHOLD {
                if let Some(outcome) = self
                    .try_api_pattern(request, &domain, &pattern, &mut trace, &cancel, started, request_budget)
                    .await
                {
                    return self.finish(request, &domain, &parsed, started, trace, outcome).await;
                }
            }
        }

        // Step 5: choose the starting tier.
        let entry = self.learning.get_entry(&request.tenant_id, &domain).await;
        let start_tier = self.choose_starting_tier(request, &domain, entry.preferred_tier);

        // Steps 6-8: execute, falling back up the tier ordering.
        let mut tier = start_tier;
        loop {
            if let Some(budget) = request_budget {
                if started.elapsed() >= budget {
                    trace.budget.latency_exceeded = true;
                    break;
                }
            }
            if let Some(max_cost) = request.options.max_cost_tier {
                if tier > max_cost {
                    trace.budget.tiers_skipped.push(tier.as_str().to_string());
                    match tier.next() {
                        Some(next) => {
                            tier = next;
                            continue;
                        }
                        None => break,
                    }
                }
            }

            match self.attempt_tier(request, &domain, tier, &mut trace, &cancel, started, request_budget).await {
                Some(outcome) => {
                    return self.finish(request, &domain, &parsed, started, trace, outcome).await;
                }
                None => match tier.next() {
                    Some(next) => tier = next,
                    None => break,
                },
            }
        }

        // Step 10: terminal failure.
        let trace = trace.seal();
        if self.debug_trace_enabled {
            let _ = trace::record_debug_trace(&*self.store, &request.tenant_id, &request.url, &trace).await;
        }
        let mut result = BrowseResult::failed(&request.url, trace);
        if request.options.enable_learning {
            self.learning
                .record_failure(
                    &request.tenant_id,
                    &domain,
                    crate::types::domain_entry::FailureType::Timeout,
                    "all tiers exhausted",
                    false,
                    None,
                )
                .await;
        }
        result.warnings.push("all render tiers failed or were exhausted".to_string());
        Err(FetchError::AllTiersFailed { url: request.url.clone() })
    }

    /// Looks up a cached result for `url`, returning it only if written
    /// within `page_cache_ttl_ms` (§4.3 step 2).
    async fn lookup_cache(&self, tenant: &crate::types::url::TenantId, url: &str) -> Option<BrowseResult> {
        let typed = TypedStore::new(&*self.store);
        let cached: CachedPage = typed.get_json(tenant, PAGE_CACHE_NAMESPACE, url).await.ok().flatten()?;
        let age_ms = (chrono::Utc::now() - cached.cached_at).num_milliseconds().max(0) as u64;
        if age_ms <= self.page_cache_ttl_ms {
            Some(cached.result)
        } else {
            None
        }
    }

    async fn store_cache(&self, tenant: &crate::types::url::TenantId, url: &str, result: &BrowseResult) {
        let typed = TypedStore::new(&*self.store);
        let entry = CachedPage {
            content_hash: content_hash(&result.content.text),
            result: result.clone(),
            cached_at: chrono::Utc::now(),
        };
        let _ = typed.put_json(tenant, PAGE_CACHE_NAMESPACE, url, &entry).await;
    }

    /// Chooses the starting tier per §4.3 step 5: forced tier wins, then
    /// heuristics-config domain classification, then the learned
    /// per-domain preference, then the intelligence-tier default.
    fn choose_starting_tier(&self, request: &Request, domain: &str, preferred_tier: Option<RenderTier>) -> RenderTier {
        if let Some(forced) = request.options.force_tier {
            return forced;
        }
        if self.heuristics.is_browser_required(domain) {
            return RenderTier::Playwright;
        }
        if self.heuristics.is_static_domain(domain) {
            return RenderTier::Intelligence;
        }
        preferred_tier.unwrap_or(RenderTier::Intelligence)
    }

    /// Tries the registry-matched API pattern as an intelligence-tier
    /// shortcut (§4.3 step 4). Returns `Some` on a usable result,
    /// `None` to fall through to the normal tier cascade.
    #[allow(clippy::too_many_arguments)]
    async fn try_api_pattern(
        &self,
        request: &Request,
        domain: &str,
        pattern: &ApiPattern,
        trace: &mut DecisionTrace,
        cancel: &CancellationToken,
        call_started: Instant,
        request_budget: Option<Duration>,
    ) -> Option<Outcome> {
        let attempt_started = Instant::now();
        let outcome = self
            .attempt_tier(request, domain, RenderTier::Intelligence, trace, cancel, call_started, request_budget)
            .await;

        let duration_ms = attempt_started.elapsed().as_millis() as u64;
        let success = outcome.is_some();
        self.registry
            .update_metrics(domain, pattern.id, success, duration_ms, if success { None } else { Some("http_error".to_string()) })
            .await;
        outcome
    }

    /// Executes a single tier attempt end-to-end: render, extract,
    /// verify, and append the corresponding `TierAttempt` (§4.3 steps
    /// 6-8). Returns `Some(Outcome)` when the result passes verification
    /// and meets the minimum content length.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_tier(
        &self,
        request: &Request,
        domain: &str,
        tier: RenderTier,
        trace: &mut DecisionTrace,
        cancel: &CancellationToken,
        call_started: Instant,
        request_budget: Option<Duration>,
    ) -> Option<Outcome> {
        let Some(renderer) = self.renderers.get(tier) else {
            trace.push_tier_attempt(TierAttempt {
                tier,
                success: false,
                duration_ms: 0,
                failure_reason: Some("renderer_unavailable".to_string()),
                validation_details: None,
            });
            return None;
        };

        let attempt_started = Instant::now();
        let tier_budget = Duration::from_millis(request.options.tier_timeout_ms);
        let remaining_request_budget = request_budget.map(|b| b.saturating_sub(call_started.elapsed()));
        let effective_budget = match remaining_request_budget {
            Some(remaining) => tier_budget.min(remaining),
            None => tier_budget,
        };

        let render_result = tokio::select! {
            result = timeout(effective_budget, renderer.render(&request.url, &request.options)) => result,
            _ = cancel.cancelled() => {
                let duration_ms = attempt_started.elapsed().as_millis() as u64;
                trace.push_tier_attempt(TierAttempt {
                    tier,
                    success: false,
                    duration_ms,
                    failure_reason: Some("cancelled".to_string()),
                    validation_details: None,
                });
                return None;
            }
        };

        let duration_ms = attempt_started.elapsed().as_millis() as u64;

        let output = match render_result {
            Ok(Ok(output)) => output,
            Ok(Err(render_error)) => {
                self.record_attempt_failure(request, domain, tier, duration_ms, &render_error, trace).await;
                return None;
            }
            Err(_elapsed) => {
                let render_error = RenderError::Timeout;
                self.record_attempt_failure(request, domain, tier, duration_ms, &render_error, trace).await;
                return None;
            }
        };

        self.evaluate_output(request, domain, tier, duration_ms, output, trace).await
    }

    async fn record_attempt_failure(
        &self,
        request: &Request,
        domain: &str,
        tier: RenderTier,
        duration_ms: u64,
        error: &RenderError,
        trace: &mut DecisionTrace,
    ) {
        trace.push_tier_attempt(TierAttempt {
            tier,
            success: false,
            duration_ms,
            failure_reason: Some(error.failure_reason().to_string()),
            validation_details: None,
        });
        if request.options.enable_learning {
            let failure_type = LearningEngine::<S>::classify_error(error);
            self.learning
                .record_failure(&request.tenant_id, domain, failure_type, error.failure_reason(), false, None)
                .await;
        }
    }

    /// Extracts, detects anomalies, and verifies a successful render
    /// (§4.3 step 6, §4.7, §4.9, §4.11). Returns `Some(Outcome)` only if
    /// the result clears the verifier gate.
    async fn evaluate_output(
        &self,
        request: &Request,
        domain: &str,
        tier: RenderTier,
        duration_ms: u64,
        output: RenderOutput,
        trace: &mut DecisionTrace,
    ) -> Option<Outcome> {
        let selector_chain = self.learning.get_selector_chain(&request.tenant_id, domain, ContentType::MainContent).await;
        let (extracted, extraction_trace) = extractor::extract_with_trace(&output.html, &output.final_url, &selector_chain);
        trace.selector_attempts.extend(extraction_trace.selector_attempts);
        trace.title_attempts.extend(extraction_trace.title_attempts);

        let anomaly = learning::detect_content_anomalies(&output.html, None, &extracted.content.text);

        let entry = self.learning.get_entry(&request.tenant_id, domain).await;
        let matched_pattern = self.registry.find_matching(domain, &ParsedUrl::parse(&output.final_url).map(|p| p.path).unwrap_or_default()).await;
        let validation = crate::verifier::verify(
            request.options.verify,
            &output.html,
            &extracted,
            request.options.min_content_length,
            &anomaly,
            &entry.validators,
            matched_pattern.as_ref(),
            None,
        );
        let passed = validation.passed && extracted.content.text.trim().len() >= request.options.min_content_length;
        trace.validation.push(validation.clone());

        trace.push_tier_attempt(TierAttempt {
            tier,
            success: passed,
            duration_ms,
            failure_reason: if passed {
                None
            } else if extracted.content.text.trim().len() < request.options.min_content_length {
                Some("content_too_short".to_string())
            } else {
                Some("validation_failed".to_string())
            },
            validation_details: Some(validation.checks.join("; ")),
        });

        if !passed {
            if request.options.enable_learning {
                self.learning
                    .record_failure(
                        &request.tenant_id,
                        domain,
                        crate::types::domain_entry::FailureType::ParseError,
                        "verification failed",
                        false,
                        None,
                    )
                    .await;
            }
            return None;
        }

        Some(Outcome {
            output,
            extracted,
            anomaly,
            tier,
            duration_ms,
        })
    }

    /// Matches and applies a learned skill against the page just fetched
    /// (§4.10). Skill *matching* is driven off the extracted content,
    /// which is available regardless of tier; skill *execution* assumes
    /// a live, steerable page, which the one-shot `Renderer` trait does
    /// not expose at any tier. Non-interactive action kinds (extract,
    /// wait, scroll, dismiss-banner) are treated as already satisfied by
    /// the render that already happened; a critical action (click, fill,
    /// select) has no session to act against and is reported as failed,
    /// which `execute_skill` already treats as an abort. This keeps the
    /// registry/telemetry surface (`retrieve_skills`, `execute_skill`,
    /// `record_skill_execution`, `DecisionTrace.skills`) wired end to end
    /// without pretending this renderer layer can drive a browser click.
    async fn apply_skills(
        &self,
        request: &Request,
        domain: &str,
        extracted: &extractor::ExtractedContent,
        final_url: &str,
        trace: &mut DecisionTrace,
    ) {
        if !request.options.use_skills {
            return;
        }

        let page_context = PageContext::classify(
            final_url.to_string(),
            domain.to_string(),
            extracted.title.clone(),
            Vec::new(),
            extracted.content.text.len(),
            false,
            false,
            !extracted.tables.is_empty(),
        );
        let matches = self
            .procedural_memory
            .retrieve_skills(&request.tenant_id, &page_context, 3, None)
            .await;
        trace.skills.matched = matches.iter().map(|m| m.skill.name.clone()).collect();

        let Some(best) = matches.into_iter().find(|m| m.preconditions_met) else {
            return;
        };

        let skill = best.skill;
        let execution_trace = self
            .procedural_memory
            .execute_skill(&skill, |action| async move {
                match action.action_type {
                    ActionType::Extract | ActionType::Wait | ActionType::Scroll | ActionType::DismissBanner => {
                        (true, 0, None)
                    }
                    ActionType::Click | ActionType::Fill | ActionType::Select | ActionType::Navigate => {
                        (false, 0, Some("no interactive session available at this render tier".to_string()))
                    }
                }
            })
            .await;

        self.procedural_memory
            .record_skill_execution(&request.tenant_id, domain, skill.id, !execution_trace.used_fallback, 0)
            .await;
        trace.skills.applied = Some(skill.name);
    }

    /// Follows a learned or inferred pagination pattern up to
    /// `max_pages`, re-entering `fetch` for each subsequent page with
    /// pagination following disabled to avoid unbounded recursion (§4.3,
    /// §4.9). Only URL-addressable pagination kinds (query-param,
    /// path-segment) can be followed without a live DOM; returns the
    /// followed pages' final URLs in fetch order.
    async fn follow_additional_pages(&self, request: &Request, domain: &str, path: &str, first_page_url: &str) -> Vec<String> {
        if !request.options.follow_pagination || request.options.max_pages <= 1 {
            return Vec::new();
        }

        let pattern = match self.learning.get_pagination_pattern(&request.tenant_id, domain, path).await {
            Some(pattern) => pattern,
            None => {
                let Some(inferred) = infer_pagination_pattern(first_page_url) else {
                    return Vec::new();
                };
                self.learning
                    .learn_pagination_pattern(&request.tenant_id, domain, path, inferred.clone())
                    .await;
                inferred
            }
        };

        let sub_options = BrowseOptions {
            follow_pagination: false,
            record_trajectory: false,
            capture_screenshot: false,
            ..request.options.clone()
        };

        let mut pages = Vec::new();
        let mut current_url = first_page_url.to_string();
        for _ in 1..request.options.max_pages {
            let Some(next_url) = next_page_url(&pattern, &current_url) else {
                break;
            };
            if next_url == current_url {
                break;
            }
            let sub_request = Request::new(next_url, request.tenant_id.clone(), sub_options.clone());
            match Box::pin(self.fetch(&sub_request, CancellationToken::new())).await {
                Ok(page) => {
                    current_url = page.final_url.clone();
                    pages.push(page.final_url);
                }
                Err(_) => break,
            }
        }
        pages
    }

    /// Step 9: emits all learning/registry/procedural-memory
    /// observations for a successful tier attempt and assembles the
    /// final `BrowseResult`.
    async fn finish(
        &self,
        request: &Request,
        domain: &str,
        parsed: &ParsedUrl,
        started: Instant,
        mut trace: DecisionTrace,
        outcome: Outcome,
    ) -> Result<BrowseResult> {
        let Outcome {
            mut output,
            extracted,
            tier,
            duration_ms,
            ..
        } = outcome;

        if request.options.enable_learning {
            self.learning
                .record_success(
                    &request.tenant_id,
                    domain,
                    SuccessProfile {
                        tier,
                        response_time_ms: duration_ms,
                        content_length: extracted.content.text.len(),
                        has_structured_data: !extracted.tables.is_empty(),
                        has_framework_data: false,
                        has_bypassable_apis: !output.network.is_empty(),
                    },
                )
                .await;

            for network_request in &output.network {
                if let Ok(api_path) = ParsedUrl::parse(&network_request.url).map(|p| p.path) {
                    self.registry
                        .learn_from_extraction(
                            domain,
                            &api_path,
                            &network_request.method,
                            network_request.content_type.as_deref(),
                            network_request.response_body.as_deref(),
                            extracted.title.as_deref(),
                            Some(extracted.content.text.as_str()),
                            None,
                        )
                        .await;
                }
            }
        }

        if request.options.record_trajectory {
            let page_context = PageContext::classify(
                output.final_url.clone(),
                domain.to_string(),
                extracted.title.clone(),
                Vec::new(),
                extracted.content.text.len(),
                false,
                false,
                !extracted.tables.is_empty(),
            );
            let mut trajectory = BrowsingTrajectory::new(domain, &request.url);
            trajectory.end_url = output.final_url.clone();
            trajectory.success = true;
            trajectory.total_duration_ms = started.elapsed().as_millis() as u64;
            self.procedural_memory
                .record_trajectory(&request.tenant_id, page_type_str(page_context.page_type), trajectory)
                .await;
        }

        self.apply_skills(request, domain, &extracted, &output.final_url, &mut trace).await;

        let screenshot_png_base64 = output
            .screenshot_png
            .take()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes));

        let trace = trace.seal();
        if self.debug_trace_enabled {
            let _ = trace::record_debug_trace(&*self.store, &request.tenant_id, &request.url, &trace).await;
        }
        let mut result = BrowseResult {
            url: parsed.raw.clone(),
            final_url: output.final_url,
            title: extracted.title,
            content: extracted.content,
            tables: extracted.tables,
            discovered_apis: Vec::new(),
            network: Some(output.network),
            console: Some(output.console),
            screenshot_png_base64,
            metadata: HashMap::new(),
            learning: LearningSummary {
                render_tier: Some(tier.as_str().to_string()),
                confidence_level: None,
                preferred_tier_updated: request.options.enable_learning,
            },
            field_confidence: extracted.field_confidence,
            decision_trace: Some(trace),
            additional_pages: Vec::new(),
            success: true,
            warnings: Vec::new(),
        };
        result.metadata.insert("tier".to_string(), tier.as_str().to_string());
        result.metadata.insert("content_hash".to_string(), content_hash(&result.content.text));

        result.additional_pages = self
            .follow_additional_pages(request, domain, &parsed.path, &result.final_url)
            .await;

        if request.options.freshness != FreshnessRequirement::Realtime {
            self.store_cache(&request.tenant_id, &request.url, &result).await;
        }
        Ok(result)
    }
}

fn page_type_str(page_type: crate::types::page_context::PageType) -> &'static str {
    use crate::types::page_context::PageType;
    match page_type {
        PageType::Login => "login",
        PageType::Search => "search",
        PageType::Form => "form",
        PageType::List => "list",
        PageType::Detail => "detail",
        PageType::Unknown => "unknown",
    }
}

/// A successful tier attempt's carryover into `finish` (step 9), kept
/// separate from `BrowseResult` since not every field is settled until
/// learning observations have run.
struct Outcome {
    output: RenderOutput,
    extracted: extractor::ExtractedContent,
    #[allow(dead_code)]
    anomaly: DetectedAnomaly,
    tier: RenderTier,
    duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeuristicsConfig;
    use crate::error::RenderResult;
    use crate::kv_store::memory::MemoryKvStore;
    use crate::types::request::BrowseOptions;
    use async_trait::async_trait;
    use seesaw::EventBus;

    struct StubRenderer {
        tier: RenderTier,
        html: &'static str,
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        fn tier(&self) -> RenderTier {
            self.tier
        }

        async fn render(&self, url: &str, _options: &BrowseOptions) -> RenderResult<RenderOutput> {
            Ok(RenderOutput {
                html: self.html.to_string(),
                final_url: url.to_string(),
                network: Vec::new(),
                console: Vec::new(),
                rendered_at: chrono::Utc::now(),
                screenshot_png: None,
            })
        }
    }

    fn make_fetcher(html: &'static str) -> TieredFetcher<MemoryKvStore> {
        let store = Arc::new(MemoryKvStore::new());
        let heuristics = Arc::new(HeuristicsConfig::empty());
        let renderers = Arc::new(RendererSet::new().with(Arc::new(StubRenderer {
            tier: RenderTier::Intelligence,
            html,
        })));
        TieredFetcher::new(
            store.clone(),
            Arc::new(UrlGate::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(PatternRegistry::new(EventBus::new())),
            Arc::new(LearningEngine::new(store.clone(), heuristics.clone())),
            Arc::new(ProceduralMemory::new(store)),
            renderers,
            heuristics,
            3_600_000,
        )
    }

    #[tokio::test]
    async fn fetch_succeeds_on_first_tier_with_enough_content() {
        let html = format!("<html><head><title>Example</title></head><body><main>{}</main></body></html>", "word ".repeat(200));
        let fetcher = make_fetcher(Box::leak(html.into_boxed_str()));
        let request = Request::new("https://example.com/article", TenantId::new("default"), BrowseOptions::default());
        let result = fetcher.fetch(&request, CancellationToken::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.title.as_deref(), Some("Example"));
    }

    #[tokio::test]
    async fn fetch_fails_when_no_renderer_covers_any_tier() {
        let store = Arc::new(MemoryKvStore::new());
        let heuristics = Arc::new(HeuristicsConfig::empty());
        let fetcher = TieredFetcher::new(
            store.clone(),
            Arc::new(UrlGate::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(PatternRegistry::new(EventBus::new())),
            Arc::new(LearningEngine::new(store.clone(), heuristics.clone())),
            Arc::new(ProceduralMemory::new(store)),
            Arc::new(RendererSet::new()),
            heuristics,
            3_600_000,
        );
        let request = Request::new("https://example.com/article", TenantId::new("default"), BrowseOptions::default());
        let result = fetcher.fetch(&request, CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::AllTiersFailed { .. })));
    }

    #[tokio::test]
    async fn fetch_rejects_ssrf_blocked_hosts() {
        let fetcher = make_fetcher("<html></html>");
        let request = Request::new("http://169.254.169.254/latest/meta-data", TenantId::new("default"), BrowseOptions::default());
        let result = fetcher.fetch(&request, CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::SsrfBlocked(_))));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_rendering() {
        let fetcher = make_fetcher("<html></html>");
        let request = Request::new("https://example.com/article", TenantId::new("default"), BrowseOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher.fetch(&request, cancel).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[test]
    fn content_hash_is_stable_and_sensitive_to_changes() {
        assert_eq!(content_hash("same text"), content_hash("same text"));
        assert_ne!(content_hash("same text"), content_hash("different text"));
    }

    #[tokio::test]
    async fn successful_fetch_records_a_content_hash() {
        let html = format!("<html><head><title>Example</title></head><body><main>{}</main></body></html>", "word ".repeat(200));
        let fetcher = make_fetcher(Box::leak(html.into_boxed_str()));
        let request = Request::new("https://example.com/article", TenantId::new("default"), BrowseOptions::default());
        let result = fetcher.fetch(&request, CancellationToken::new()).await.unwrap();
        assert!(result.metadata.contains_key("content_hash"));
    }

    #[tokio::test]
    async fn debug_trace_enabled_persists_a_trace_to_the_store() {
        let store = Arc::new(MemoryKvStore::new());
        let heuristics = Arc::new(HeuristicsConfig::empty());
        let html = format!("<html><head><title>Example</title></head><body><main>{}</main></body></html>", "word ".repeat(200));
        let renderers = Arc::new(RendererSet::new().with(Arc::new(StubRenderer {
            tier: RenderTier::Intelligence,
            html: Box::leak(html.into_boxed_str()),
        })));
        let fetcher = TieredFetcher::with_debug_trace(
            store.clone(),
            Arc::new(UrlGate::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(PatternRegistry::new(EventBus::new())),
            Arc::new(LearningEngine::new(store.clone(), heuristics.clone())),
            Arc::new(ProceduralMemory::new(store.clone())),
            renderers,
            heuristics,
            3_600_000,
            true,
        );
        let tenant = TenantId::new("default");
        let request = Request::new("https://example.com/article", tenant.clone(), BrowseOptions::default());
        let result = fetcher.fetch(&request, CancellationToken::new()).await.unwrap();
        assert!(result.success);
        let keys = crate::trace::list_trace_keys(&*store, &tenant).await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn debug_trace_disabled_by_default_persists_nothing() {
        let fetcher = make_fetcher("<html></html>");
        let tenant = TenantId::new("default");
        let request = Request::new("https://example.com/article", tenant.clone(), BrowseOptions::default());
        let _ = fetcher.fetch(&request, CancellationToken::new()).await;
        let keys = crate::trace::list_trace_keys(&*fetcher.store, &tenant).await.unwrap();
        assert!(keys.is_empty());
    }
}
