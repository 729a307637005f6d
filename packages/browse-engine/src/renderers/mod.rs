//! Renderer trait and its three tiers (§4.4, §4.5, §4.6).
//!
//! Grounded on the capability-interface pattern in
//! `packages/intelligent-crawler/src/traits.rs` (a small async trait per
//! capability, implementations swappable behind `Box<dyn Trait>`).

pub mod full_browser;
pub mod lightweight;
pub mod static_renderer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::RenderResult;
use crate::types::browse_result::NetworkRequest;
use crate::types::request::{BrowseOptions, RenderTier};

/// Raw output of a single tier attempt, before extraction/validation
/// (§4.3 step 4-6).
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub html: String,
    pub final_url: String,
    pub network: Vec<NetworkRequest>,
    pub console: Vec<String>,
    pub rendered_at: DateTime<Utc>,
    /// Raw PNG bytes, populated only by a tier that can rasterize a page
    /// (§4.6) and only when `BrowseOptions::capture_screenshot` asked for it.
    pub screenshot_png: Option<Vec<u8>>,
}

/// One rendering tier. Each tier's `render` either returns a best-effort
/// `RenderOutput` or a `RenderError` carrying a `failure_reason()`
/// mapped to §4.3's vocabulary so the caller can decide whether to
/// escalate. `#[cfg_attr(test, automock)]` gives every consumer of this
/// trait (the Tiered Fetcher's tests chief among them) a generated
/// `MockRenderer` instead of a hand-rolled stub (SPEC_FULL.md B.5).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    fn tier(&self) -> RenderTier;

    async fn render(&self, url: &str, options: &BrowseOptions) -> RenderResult<RenderOutput>;
}

pub(crate) fn empty_headers() -> HashMap<String, String> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;

    #[tokio::test]
    async fn mock_renderer_reports_configured_tier_and_output() {
        let mut mock = MockRenderer::new();
        mock.expect_tier().return_const(RenderTier::Lightweight);
        mock.expect_render().returning(|url, _opts| {
            Ok(RenderOutput {
                html: "<html><body>ok</body></html>".to_string(),
                final_url: url.to_string(),
                network: Vec::new(),
                console: Vec::new(),
                rendered_at: Utc::now(),
                screenshot_png: None,
            })
        });

        assert_eq!(mock.tier(), RenderTier::Lightweight);
        let output = mock.render("https://example.com", &BrowseOptions::default()).await.unwrap();
        assert_eq!(output.final_url, "https://example.com");
    }

    #[tokio::test]
    async fn mock_renderer_can_simulate_a_failure() {
        let mut mock = MockRenderer::new();
        mock.expect_tier().return_const(RenderTier::Playwright);
        mock.expect_render().returning(|_, _| Err(RenderError::Timeout));

        let result = mock.render("https://example.com", &BrowseOptions::default()).await;
        assert!(matches!(result, Err(RenderError::Timeout)));
    }
}
