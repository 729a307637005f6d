//! `Request`, `BrowseOptions`, `RenderTier`, `FreshnessRequirement` (§3,
//! §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::url::TenantId;

/// A total ordering over the three rendering tiers. Monotone cost and
/// latency: `intelligence < lightweight < playwright` (§3, §8 property 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RenderTier {
    Intelligence,
    Lightweight,
    Playwright,
}

impl RenderTier {
    pub const ORDER: [RenderTier; 3] = [
        RenderTier::Intelligence,
        RenderTier::Lightweight,
        RenderTier::Playwright,
    ];

    pub fn next(self) -> Option<RenderTier> {
        match self {
            RenderTier::Intelligence => Some(RenderTier::Lightweight),
            RenderTier::Lightweight => Some(RenderTier::Playwright),
            RenderTier::Playwright => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenderTier::Intelligence => "intelligence",
            RenderTier::Lightweight => "lightweight",
            RenderTier::Playwright => "playwright",
        }
    }
}

/// Caller-supplied freshness policy (§3 glossary, §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FreshnessRequirement {
    /// Never use the cache.
    Realtime,
    /// Prefer the cache if a fresh entry exists.
    Cached,
    /// Use the cache if fresh, otherwise fetch. Default.
    #[default]
    Any,
}

/// Verification strictness (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VerifyMode {
    Off,
    #[default]
    Basic,
    Standard,
    Thorough,
}

/// Per-tier (or whole-browser-renderer) proxy configuration. Per the
/// "Open Questions" decision in SPEC_FULL.md, this is only threaded to
/// the Full Browser Renderer's launch configuration; Static/Lightweight
/// accept it but treat it as advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
}

/// Options accepted by `fetch(url, opts)` (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseOptions {
    pub force_tier: Option<RenderTier>,
    pub min_content_length: usize,
    pub tier_timeout_ms: u64,
    pub max_latency_ms: Option<u64>,
    pub max_cost_tier: Option<RenderTier>,
    pub freshness: FreshnessRequirement,
    pub session_profile: Option<String>,
    pub wait_for: Option<String>,
    pub wait_for_selector: Option<String>,
    pub scroll_to_load: bool,
    pub dismiss_cookie_banner: bool,
    pub verify: VerifyMode,
    pub follow_pagination: bool,
    pub max_pages: usize,
    pub enable_learning: bool,
    pub use_skills: bool,
    pub record_trajectory: bool,
    pub proxy: Option<ProxyConfig>,
    /// Asks the Full Browser Renderer for a rasterized screenshot
    /// alongside the usual HTML/network/console capture (§4.6). Ignored
    /// by the lower tiers, which carry no DOM-to-bitmap capability.
    pub capture_screenshot: bool,
}

impl Default for BrowseOptions {
    fn default() -> Self {
        Self {
            force_tier: None,
            min_content_length: 500,
            tier_timeout_ms: 10_000,
            max_latency_ms: None,
            max_cost_tier: None,
            freshness: FreshnessRequirement::Any,
            session_profile: None,
            wait_for: None,
            wait_for_selector: None,
            scroll_to_load: false,
            dismiss_cookie_banner: true,
            verify: VerifyMode::Basic,
            follow_pagination: false,
            max_pages: 5,
            enable_learning: true,
            use_skills: true,
            record_trajectory: true,
            proxy: None,
            capture_screenshot: false,
        }
    }
}

/// One invocation. Immutable; discarded after the result is produced
/// (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub options: BrowseOptions,
    pub tenant_id: TenantId,
    pub session_profile: Option<String>,
    pub start_timestamp: DateTime<Utc>,
}

impl Request {
    pub fn new(url: impl Into<String>, tenant_id: TenantId, options: BrowseOptions) -> Self {
        let session_profile = options.session_profile.clone();
        Self {
            url: url.into(),
            options,
            tenant_id,
            session_profile,
            start_timestamp: Utc::now(),
        }
    }
}
