//! `BrowseResult`, `NetworkRequest`, `FieldConfidence` (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::api_pattern::ApiPattern;
use super::decision_trace::DecisionTrace;

/// One HTTP exchange captured by the lightweight or full-browser tiers
/// (§3). The static renderer emits exactly one of these per §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Provenance for a single extracted field (§3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldSource {
    SelectorMatch,
    ApiResponse,
    Heuristic,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfidence {
    pub score: f32,
    pub source: FieldSource,
    pub reason: String,
}

impl FieldConfidence {
    pub fn new(score: f32, source: FieldSource, reason: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            source,
            reason: reason.into(),
        }
    }
}

/// Extracted tables, one per `<table>` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    pub html: String,
    pub text: String,
    pub markdown: String,
}

/// Domain-knowledge recommendations riding along with a result (feeds
/// `learning.*` fields referenced across §8's scenarios).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningSummary {
    pub render_tier: Option<String>,
    pub confidence_level: Option<String>,
    pub preferred_tier_updated: bool,
}

/// Produced once per `Request`; immutable (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseResult {
    pub url: String,
    pub final_url: String,
    pub title: Option<String>,
    pub content: ContentBlock,
    pub tables: Vec<ExtractedTable>,
    pub discovered_apis: Vec<ApiPattern>,
    pub network: Option<Vec<NetworkRequest>>,
    pub console: Option<Vec<String>>,
    /// Base64-encoded PNG, present only when the caller asked for
    /// `BrowseOptions::capture_screenshot` and the full-browser tier ran.
    pub screenshot_png_base64: Option<String>,
    pub metadata: HashMap<String, String>,
    pub learning: LearningSummary,
    pub field_confidence: HashMap<String, FieldConfidence>,
    pub decision_trace: Option<DecisionTrace>,
    pub additional_pages: Vec<String>,
    pub success: bool,
    pub warnings: Vec<String>,
}

impl BrowseResult {
    pub fn failed(url: impl Into<String>, trace: DecisionTrace) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            title: None,
            content: ContentBlock::default(),
            tables: Vec::new(),
            discovered_apis: Vec::new(),
            network: None,
            console: None,
            screenshot_png_base64: None,
            metadata: HashMap::new(),
            learning: LearningSummary::default(),
            field_confidence: HashMap::new(),
            decision_trace: Some(trace),
            additional_pages: Vec::new(),
            success: false,
            warnings: Vec::new(),
        }
    }
}
