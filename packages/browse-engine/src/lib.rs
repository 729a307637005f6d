//! Tiered intelligent web browsing engine (§1-§9).
//!
//! `CoreContext` is the single entry point this crate exposes: it owns
//! every capability (URL gate, rate limiter, pattern registry, learning
//! engine, procedural memory, renderers, tiered fetcher) and wires them
//! once, replacing the global singletons the source system used (§9
//! "Global singletons... Replace with an explicit CoreContext").

pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod fetcher;
pub mod kv_store;
pub mod learning;
pub mod procedural_memory;
pub mod rate_limiter;
pub mod registry;
pub mod renderers;
pub mod trace;
pub mod types;
pub mod url_gate;
pub mod verifier;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use config::{EnvConfig, HeuristicsConfig};
use error::{FetchError, Result};
use fetcher::{RendererSet, TieredFetcher};
use kv_store::KvStore;
use learning::LearningEngine;
use procedural_memory::ProceduralMemory;
use rate_limiter::RateLimiter;
use registry::PatternRegistry;
use renderers::static_renderer::StaticRenderer;
use renderers::lightweight::LightweightRenderer;
use trace::TraceView;
use types::browse_result::BrowseResult;
use types::request::{BrowseOptions, RenderTier, Request};
use types::url::TenantId;

/// Bundles every capability this crate composes behind one handle
/// (§9). Generic over the KV-store backend only, the same shape
/// `LearningEngine`/`ProceduralMemory`/`TieredFetcher` already use.
pub struct CoreContext<S: KvStore + ?Sized> {
    pub store: Arc<S>,
    pub heuristics: Arc<HeuristicsConfig>,
    pub registry: Arc<PatternRegistry>,
    pub learning: Arc<LearningEngine<S>>,
    pub procedural_memory: Arc<ProceduralMemory<S>>,
    pub fetcher: Arc<TieredFetcher<S>>,
    pub env: EnvConfig,
}

impl<S: KvStore + ?Sized> CoreContext<S> {
    /// Assembles a `CoreContext` from a KV-store backend and optional
    /// heuristics file, reading renderer/rate-limit defaults from
    /// `EnvConfig` (§6 environment configuration).
    pub fn new(store: Arc<S>, env: EnvConfig, heuristics: Arc<HeuristicsConfig>) -> Self {
        let registry = Arc::new(PatternRegistry::new_with_seed(seesaw::EventBus::new()));
        let learning = Arc::new(LearningEngine::new(store.clone(), heuristics.clone()));
        let procedural_memory = Arc::new(ProceduralMemory::new(store.clone()));
        let rate_limiter = Arc::new(RateLimiter::with_default_rpm(env.rate_limit_default_rpm));
        let url_gate = Arc::new(url_gate::UrlGate::new());

        let mut renderers = RendererSet::new();
        let static_renderer: Arc<dyn renderers::Renderer> =
            Arc::new(StaticRenderer::new(env.render_user_agent.clone(), env.tenant_id_default.clone()));
        renderers = renderers.with(static_renderer);
        let lightweight_renderer: Arc<dyn renderers::Renderer> = Arc::new(LightweightRenderer::new(
            env.render_user_agent.clone(),
            env.tenant_id_default.clone(),
            heuristics.clone(),
        ));
        renderers = renderers.with(lightweight_renderer);
        #[cfg(feature = "full-browser")]
        {
            let full_browser: Arc<dyn renderers::Renderer> =
                Arc::new(renderers::full_browser::FullBrowserRenderer::new(renderers::full_browser::FullBrowserConfig {
                    bot_challenge_max_ms: env.bot_challenge_max_ms,
                    proxy: None,
                }));
            renderers = renderers.with(full_browser);
        }
        let renderers = Arc::new(renderers);

        let fetcher = Arc::new(TieredFetcher::with_debug_trace(
            store.clone(),
            url_gate,
            rate_limiter,
            registry.clone(),
            learning.clone(),
            procedural_memory.clone(),
            renderers,
            heuristics.clone(),
            env.page_cache_ttl_ms,
            env.debug_trace_enabled,
        ));

        Self {
            store,
            heuristics,
            registry,
            learning,
            procedural_memory,
            fetcher,
            env,
        }
    }

    /// `fetch(url, opts) → BrowseResult` (§6). The tenant defaults to
    /// `EnvConfig::tenant_id_default`; callers needing multi-tenant
    /// isolation build their own `Request` and call `self.fetcher.fetch`
    /// directly.
    pub async fn fetch(&self, url: &str, opts: BrowseOptions) -> Result<BrowseResult> {
        let request = Request::new(url, TenantId::new(self.env.tenant_id_default.clone()), opts);
        self.fetcher.fetch(&request, CancellationToken::new()).await
    }

    /// `screenshot(url, opts) → ScreenshotResult` (§6). Relies on the
    /// full-browser tier being forced; the intelligence/lightweight
    /// tiers carry no DOM-to-bitmap capability.
    pub async fn screenshot(&self, url: &str, opts: ScreenshotOptions) -> ScreenshotResult {
        let started = Instant::now();
        let mut options = BrowseOptions {
            force_tier: Some(RenderTier::Playwright),
            wait_for_selector: opts.wait_for_selector.clone(),
            session_profile: opts.session_profile.clone(),
            enable_learning: false,
            record_trajectory: false,
            capture_screenshot: true,
            ..BrowseOptions::default()
        };
        if let Some(selector) = &opts.wait_for_selector {
            options.wait_for_selector = Some(selector.clone());
        }

        match self.fetch(url, options).await {
            Ok(result) => ScreenshotResult {
                ok: true,
                png_base64: result.screenshot_png_base64.clone(),
                final_url: result.final_url,
                title: result.title,
                viewport: (opts.width.unwrap_or(1280), opts.height.unwrap_or(720)),
                ts: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                err: None,
            },
            Err(err) => ScreenshotResult {
                ok: false,
                png_base64: None,
                final_url: url.to_string(),
                title: None,
                viewport: (opts.width.unwrap_or(1280), opts.height.unwrap_or(720)),
                ts: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                err: Some(ErrorDetail {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            },
        }
    }

    /// `export_har(url, opts) → HarExport` (§6). The `entries` come
    /// straight from the captured `NetworkRequest`s, already in
    /// wall-clock order per §4.3's ordering guarantee.
    pub async fn export_har(&self, url: &str, opts: HarOptions) -> HarExport {
        let started = Instant::now();
        let options = BrowseOptions {
            session_profile: opts.session_profile.clone(),
            wait_for_selector: opts.wait_for_selector.clone(),
            ..BrowseOptions::default()
        };

        match self.fetch(url, options).await {
            Ok(result) => {
                let network = result.network.unwrap_or_default();
                let entries: Vec<HarEntry> = network
                    .iter()
                    .map(|request| HarEntry {
                        started_at: request.timestamp,
                        method: request.method.clone(),
                        url: request.url.clone(),
                        status: request.status,
                        content_type: request.content_type.clone(),
                        request_body: if opts.include_bodies {
                            truncate_body(request.request_body.as_deref(), opts.max_body_bytes)
                        } else {
                            None
                        },
                        response_body: if opts.include_bodies {
                            truncate_body(request.response_body.as_deref(), opts.max_body_bytes)
                        } else {
                            None
                        },
                    })
                    .collect();
                HarExport {
                    ok: true,
                    har: Some(Har {
                        version: "1.2".to_string(),
                        creator: HarCreator {
                            name: "browse-engine".to_string(),
                            version: env!("CARGO_PKG_VERSION").to_string(),
                        },
                        entries,
                    }),
                    final_url: result.final_url,
                    title: result.title,
                    entry_count: network.len(),
                    ts: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    err: None,
                }
            }
            Err(err) => HarExport {
                ok: false,
                har: None,
                final_url: url.to_string(),
                title: None,
                entry_count: 0,
                ts: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                err: Some(ErrorDetail {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            },
        }
    }

    /// `get_domain_intelligence(domain) → DomainIntelligence` (§6): a
    /// read-only summary of everything the Learning Engine and API
    /// Pattern Registry have accumulated for `domain`.
    pub async fn get_domain_intelligence(&self, domain: &str) -> DomainIntelligence {
        let tenant = TenantId::new(self.env.tenant_id_default.clone());
        let entry = self.learning.get_entry(&tenant, domain).await;
        let known_patterns = self.registry.list(domain).await;
        let failure_patterns = self.learning.get_failure_patterns(&tenant, domain).await;

        let selector_chains = entry
            .selector_chains
            .iter()
            .map(|(content_type, chain)| (format!("{content_type:?}"), chain.iter().map(|p| p.selector.clone()).collect()))
            .collect();

        DomainIntelligence {
            known_patterns,
            selector_chains,
            validators: entry.validators.clone(),
            pagination_patterns: entry.pagination_patterns.clone(),
            recent_failures: entry.recent_failures.iter().cloned().collect(),
            success_rate: entry.overall_success_rate(),
            domain_group: entry.domain_group.clone(),
            recommended_wait_strategy: if failure_patterns.should_backoff { "wait".to_string() } else { "none".to_string() },
            should_use_session: entry.preferred_tier == Some(RenderTier::Playwright),
        }
    }

    /// `get_domain_capabilities(domain) → DomainCapabilities` (§6): a
    /// coarser, recommendation-oriented view derived from the same
    /// `DomainEntry`, meant for callers deciding *whether* to fetch
    /// rather than *how*.
    pub async fn get_domain_capabilities(&self, domain: &str) -> DomainCapabilities {
        let tenant = TenantId::new(self.env.tenant_id_default.clone());
        let entry = self.learning.get_entry(&tenant, domain).await;
        let success_rate = entry.overall_success_rate();
        let sample_size = entry.recent_outcomes.len();

        let level = if sample_size < 5 {
            "unknown"
        } else if success_rate > 0.8 {
            "high"
        } else if success_rate > 0.4 {
            "medium"
        } else {
            "low"
        };

        let mut recommendations = Vec::new();
        if entry.preferred_tier == Some(RenderTier::Playwright) {
            recommendations.push("force the playwright tier; lighter tiers are known to fail here".to_string());
        }
        if self.heuristics.is_browser_required(domain) {
            recommendations.push("heuristics config classifies this domain as browser-required".to_string());
        }
        let (backs_off, _) = entry.should_backoff(Utc::now());
        if backs_off {
            recommendations.push("back off: repeated same-class failures within the last hour".to_string());
        }

        DomainCapabilities {
            capabilities: Capabilities {
                has_api_patterns: !self.registry.list(domain).await.is_empty(),
                has_selector_chains: !entry.selector_chains.is_empty(),
                has_validators: !entry.validators.is_empty(),
                has_pagination: !entry.pagination_patterns.is_empty(),
            },
            confidence: ConfidenceSummary {
                level: level.to_string(),
                score: success_rate,
                basis: format!("{sample_size} recorded outcomes"),
            },
            performance: PerformanceSummary {
                preferred_tier: entry.preferred_tier.map(|t| t.as_str().to_string()),
                avg_response_ms: None,
                success_rate,
            },
            recommendations,
            details: HashMap::new(),
        }
    }

    /// `batch_fetch(urls, opts, batch_opts) → [BatchItemResult]` (§6).
    /// Runs up to `batch_opts.concurrency` fetches at a time; a
    /// rate-limited URL does not abort the batch unless
    /// `stop_on_error` is set and `continue_on_rate_limit` is false.
    pub async fn batch_fetch(&self, urls: Vec<String>, opts: BrowseOptions, batch_opts: BatchOptions) -> Vec<BatchItemResult>
    where
        S: 'static,
    {
        use futures::stream::{self, StreamExt};

        let concurrency = batch_opts.concurrency.max(1);
        let total_deadline = batch_opts.total_timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        let results = stream::iter(urls.into_iter().enumerate())
            .map(|(index, url)| {
                let opts = opts.clone();
                let batch_opts = &batch_opts;
                async move {
                    if let Some(deadline) = total_deadline {
                        if Instant::now() >= deadline {
                            return BatchItemResult {
                                url,
                                status: BatchStatus::Skipped,
                                result: None,
                                err: None,
                                duration_ms: 0,
                                index,
                            };
                        }
                    }

                    let started = Instant::now();
                    let per_url_opts = if let Some(timeout_ms) = batch_opts.per_url_timeout_ms {
                        BrowseOptions {
                            tier_timeout_ms: timeout_ms,
                            ..opts
                        }
                    } else {
                        opts
                    };

                    match self.fetch(&url, per_url_opts).await {
                        Ok(result) => BatchItemResult {
                            url,
                            status: BatchStatus::Success,
                            result: Some(result),
                            err: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                            index,
                        },
                        Err(FetchError::RateLimited { domain, retry_after_ms }) => BatchItemResult {
                            url,
                            status: BatchStatus::RateLimited,
                            result: None,
                            err: Some(ErrorDetail {
                                code: "RATE_LIMITED".to_string(),
                                message: format!("rate limited on {domain}, retry after {retry_after_ms}ms"),
                            }),
                            duration_ms: started.elapsed().as_millis() as u64,
                            index,
                        },
                        Err(err) => BatchItemResult {
                            url,
                            status: BatchStatus::Error,
                            result: None,
                            err: Some(ErrorDetail {
                                code: err.code().to_string(),
                                message: err.to_string(),
                            }),
                            duration_ms: started.elapsed().as_millis() as u64,
                            index,
                        },
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut results = results;
        results.sort_by_key(|r| r.index);

        if batch_opts.stop_on_error {
            let mut truncated = Vec::with_capacity(results.len());
            for item in results {
                let should_stop = item.status == BatchStatus::Error
                    || (item.status == BatchStatus::RateLimited && !batch_opts.continue_on_rate_limit);
                truncated.push(item);
                if should_stop {
                    break;
                }
            }
            truncated
        } else {
            results
        }
    }

    /// Renders a decision trace view for debugging (§4.13), given a
    /// key previously returned by `fetch`'s recorded debug trace.
    pub async fn render_debug_trace(&self, key: &str, view: TraceView) -> error::StoreResult<String> {
        let tenant = TenantId::new(self.env.tenant_id_default.clone());
        let trace = trace::load_debug_trace(&*self.store, &tenant, key).await?;
        Ok(trace::render(&trace, view))
    }
}

fn truncate_body(body: Option<&str>, max_bytes: Option<usize>) -> Option<String> {
    let body = body?;
    match max_bytes {
        Some(limit) if body.len() > limit => Some(body[..limit].to_string()),
        _ => Some(body.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScreenshotOptions {
    pub full_page: bool,
    pub element: Option<String>,
    pub wait_for_selector: Option<String>,
    pub session_profile: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResult {
    pub ok: bool,
    pub png_base64: Option<String>,
    pub final_url: String,
    pub title: Option<String>,
    pub viewport: (u32, u32),
    pub ts: DateTime<Utc>,
    pub duration_ms: u64,
    pub err: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Default)]
pub struct HarOptions {
    pub include_bodies: bool,
    pub max_body_bytes: Option<usize>,
    pub session_profile: Option<String>,
    pub wait_for_selector: Option<String>,
}

/// HAR 1.2 creator block (§6 wire formats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarEntry {
    pub started_at: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

/// Minimal HAR 1.2 log (§6): entries are already ordered by start time
/// since `NetworkRequest`s are appended in capture order (§4.3, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarExport {
    pub ok: bool,
    pub har: Option<Har>,
    pub final_url: String,
    pub title: Option<String>,
    pub entry_count: usize,
    pub ts: DateTime<Utc>,
    pub duration_ms: u64,
    pub err: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainIntelligence {
    pub known_patterns: Vec<types::api_pattern::ApiPattern>,
    pub selector_chains: HashMap<String, Vec<String>>,
    pub validators: Vec<types::domain_entry::ValidatorRule>,
    pub pagination_patterns: HashMap<String, types::domain_entry::PaginationPattern>,
    pub recent_failures: Vec<types::domain_entry::FailureReport>,
    pub success_rate: f64,
    pub domain_group: Option<String>,
    pub recommended_wait_strategy: String,
    pub should_use_session: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_api_patterns: bool,
    pub has_selector_chains: bool,
    pub has_validators: bool,
    pub has_pagination: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceSummary {
    pub level: String,
    pub score: f64,
    pub basis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub preferred_tier: Option<String>,
    pub avg_response_ms: Option<f64>,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCapabilities {
    pub capabilities: Capabilities,
    pub confidence: ConfidenceSummary,
    pub performance: PerformanceSummary,
    pub recommendations: Vec<String>,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub stop_on_error: bool,
    pub continue_on_rate_limit: bool,
    pub per_url_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            stop_on_error: false,
            continue_on_rate_limit: true,
            per_url_timeout_ms: None,
            total_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Error,
    Skipped,
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub url: String,
    pub status: BatchStatus,
    pub result: Option<BrowseResult>,
    pub err: Option<ErrorDetail>,
    pub duration_ms: u64,
    pub index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::memory::MemoryKvStore;

    fn context() -> CoreContext<MemoryKvStore> {
        CoreContext::new(Arc::new(MemoryKvStore::new()), EnvConfig::default(), Arc::new(HeuristicsConfig::empty()))
    }

    #[tokio::test]
    async fn fetch_rejects_invalid_urls() {
        let ctx = context();
        let result = ctx.fetch("not a url", BrowseOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_domain_intelligence_on_unseen_domain_is_empty_but_well_formed() {
        let ctx = context();
        let intelligence = ctx.get_domain_intelligence("never-seen.example").await;
        assert!(intelligence.known_patterns.is_empty());
        assert_eq!(intelligence.success_rate, 0.0);
    }

    #[tokio::test]
    async fn get_domain_capabilities_reports_unknown_confidence_with_no_history() {
        let ctx = context();
        let capabilities = ctx.get_domain_capabilities("never-seen.example").await;
        assert_eq!(capabilities.confidence.level, "unknown");
    }

    #[tokio::test]
    async fn batch_fetch_preserves_input_order_in_results() {
        let ctx = context();
        let urls = vec!["not a url".to_string(), "also not a url".to_string()];
        let results = ctx.batch_fetch(urls, BrowseOptions::default(), BatchOptions::default()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[1].index, 1);
    }
}
