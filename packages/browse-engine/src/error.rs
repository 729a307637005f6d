//! Typed errors for the browsing engine.
//!
//! Mirrors the teacher's `thiserror`-for-libraries convention. Transient
//! and protocol errors never surface as `Err` from the public entry
//! points; they are recorded as `TierAttempt` failures inside a still-`Ok`
//! `BrowseResult` per the propagation policy. Only input and policy
//! errors are returned directly.

use thiserror::Error;

/// SSRF / URL Safety Gate failures (§4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("disallowed URL scheme: {0}")]
    DisallowedScheme(String),

    #[error("blocked host: {0}")]
    BlockedHost(String),

    #[error("blocked IP range: {0}")]
    BlockedCidr(String),

    #[error("URL has no host")]
    NoHost,

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("URL parse error: {0}")]
    UrlParse(String),
}

/// Renderer-tier failures (§4.4-4.6), matching the `FailureReason` enum
/// attached to each `TierAttempt`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("content shorter than minimum")]
    ContentTooShort,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("bot challenge detected")]
    BotChallenge,

    #[error("http error: {status}")]
    HttpError { status: u16 },

    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("script error: {0}")]
    ScriptError(String),

    #[error("cancelled")]
    Cancelled,
}

impl RenderError {
    /// Maps to the `failure_reason` vocabulary enumerated in §4.3 step 8.
    pub fn failure_reason(&self) -> &'static str {
        match self {
            RenderError::ContentTooShort => "content_too_short",
            RenderError::ValidationFailed(_) => "validation_failed",
            RenderError::BotChallenge => "bot_challenge",
            RenderError::HttpError { .. } => "http_error",
            RenderError::Timeout => "timeout",
            RenderError::Network(_) => "network",
            RenderError::ParseError(_) => "parse_error",
            RenderError::ScriptError(_) => "parse_error",
            RenderError::Cancelled => "cancelled",
        }
    }
}

/// Tenant-aware KV store failures (§4.12).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant isolation violation: namespace {namespace} not owned by tenant {tenant}")]
    TenantIsolation { tenant: String, namespace: String },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("shared pool admission denied: tenant {0} has not opted in")]
    SharedPoolDenied(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error surfaced on the public boundary. Only input and policy
/// errors per §7 are represented here; the `code()` mapping matches §6's
/// enumerated error codes exactly.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    SsrfBlocked(#[from] SecurityError),

    #[error("rate limited: domain {domain} retry after {retry_after_ms}ms")]
    RateLimited { domain: String, retry_after_ms: u64 },

    #[error("tier budget exceeded: {tier} after {elapsed_ms}ms")]
    TierBudgetExceeded { tier: String, elapsed_ms: u64 },

    #[error("all tiers failed for {url}")]
    AllTiersFailed { url: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("anomaly unrecoverable: {0}")]
    AnomalyUnrecoverable(String),

    #[error("renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    /// The surfaced error code enumerated in §6.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "INVALID_URL",
            FetchError::SsrfBlocked(_) => "SSRF_BLOCKED",
            FetchError::RateLimited { .. } => "RATE_LIMITED",
            FetchError::TierBudgetExceeded { .. } => "TIER_BUDGET_EXCEEDED",
            FetchError::AllTiersFailed { .. } => "ALL_TIERS_FAILED",
            FetchError::ValidationFailed(_) => "VALIDATION_FAILED",
            FetchError::AnomalyUnrecoverable(_) => "ANOMALY_UNRECOVERABLE",
            FetchError::RendererUnavailable(_) => "RENDERER_UNAVAILABLE",
            FetchError::Cancelled => "CANCELLED",
            FetchError::Store(_) => "STORE_ERROR",
        }
    }
}

pub type SecurityResult<T> = std::result::Result<T, SecurityError>;
pub type RenderResult<T> = std::result::Result<T, RenderError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, FetchError>;
