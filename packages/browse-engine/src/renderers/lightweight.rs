//! Tier 2: Lightweight DOM Renderer (§4.5).
//!
//! No JS engine crate sits in the teacher's dependency tree (mirroring
//! the absence of an HTML parser noted in `extractor.rs`), so "script
//! execution" here is a conservative simulation: scripts run in document
//! order against a small whitelisted surface (`localStorage`,
//! `sessionStorage`, `document.cookie`, `location`, `navigator`,
//! `setTimeout`/`setInterval`, `btoa`/`atob`), anything touching
//! `Worker`/`WebSocket` aborts the tier with `ScriptError`, and a bot
//! challenge marker sets `needs_full_browser` so the Tiered Fetcher
//! escalates per §4.3 step 5.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::HeuristicsConfig;
use crate::error::{RenderError, RenderResult};
use crate::types::request::{BrowseOptions, RenderTier};

use super::static_renderer::StaticRenderer;
use super::{Renderer, RenderOutput};

const DEFAULT_ASYNC_WAIT_MS: u64 = 100;

const DISALLOWED_APIS: &[&str] = &["new Worker", "new WebSocket", "SharedWorker"];

const CHALLENGE_MARKERS: &[&str] = &[
    "Just a moment",
    "cf-challenge",
    "challenge-platform",
    "Checking your browser",
    "cf_chl_opt",
];

/// Outcome of the simulated script pass.
struct ScriptPassResult {
    needs_full_browser: bool,
    console: Vec<String>,
}

pub struct LightweightRenderer {
    inner: StaticRenderer,
    async_wait_ms: u64,
    heuristics: Arc<HeuristicsConfig>,
}

impl LightweightRenderer {
    pub fn new(
        user_agent: impl Into<String>,
        tenant: impl Into<String>,
        heuristics: Arc<HeuristicsConfig>,
    ) -> Self {
        Self {
            inner: StaticRenderer::new(user_agent, tenant),
            async_wait_ms: DEFAULT_ASYNC_WAIT_MS,
            heuristics,
        }
    }

    pub fn with_async_wait_ms(mut self, ms: u64) -> Self {
        self.async_wait_ms = ms;
        self
    }

    fn run_scripts(html: &str) -> RenderResult<ScriptPassResult> {
        let mut console = Vec::new();
        let mut needs_full_browser = false;

        for script in extract_inline_scripts(html) {
            for disallowed in DISALLOWED_APIS {
                if script.contains(disallowed) {
                    return Err(RenderError::ScriptError(format!(
                        "unsupported API in lightweight tier: {disallowed}"
                    )));
                }
            }

            // Whitelisted surface is simulated as pure no-ops: calls are
            // recognised (so we don't mistake them for unsupported APIs)
            // but have no observable effect, matching the stub contract.
            for stub in [
                "localStorage",
                "sessionStorage",
                "document.cookie",
                "location",
                "navigator",
                "setTimeout",
                "setInterval",
                "btoa",
                "atob",
            ] {
                if script.contains(stub) {
                    console.push(format!("stubbed call to {stub}"));
                }
            }
        }

        for marker in CHALLENGE_MARKERS {
            if html.contains(marker) {
                needs_full_browser = true;
                break;
            }
        }

        Ok(ScriptPassResult {
            needs_full_browser,
            console,
        })
    }
}

fn extract_inline_scripts(html: &str) -> Vec<String> {
    let mut scripts = Vec::new();
    let mut cursor = 0;
    let lower = html.to_ascii_lowercase();
    while let Some(rel_start) = lower[cursor..].find("<script") {
        let start = cursor + rel_start;
        let Some(tag_end_rel) = html[start..].find('>') else {
            break;
        };
        let body_start = start + tag_end_rel + 1;
        let Some(rel_end) = lower[body_start..].find("</script>") else {
            break;
        };
        let end = body_start + rel_end;
        scripts.push(html[body_start..end].to_string());
        cursor = end + "</script>".len();
    }
    scripts
}

#[async_trait]
impl Renderer for LightweightRenderer {
    fn tier(&self) -> RenderTier {
        RenderTier::Lightweight
    }

    async fn render(&self, url: &str, options: &BrowseOptions) -> RenderResult<RenderOutput> {
        let base = self.inner.render(url, options).await?;
        let pass = Self::run_scripts(&base.html)?;

        if pass.needs_full_browser {
            return Err(RenderError::BotChallenge);
        }

        // SPA-shell detection (§4.5): a page carrying one of the
        // configured "incomplete" markers (empty root div, loading
        // spinner, noscript banner) without any of the markers that
        // indicate real content rendered server-side needs the full
        // browser tier to execute its client-side framework.
        if self.heuristics.has_incomplete_markers(&base.html)
            && !self.heuristics.has_content_markers(&base.html)
        {
            return Err(RenderError::BotChallenge);
        }

        tokio::time::sleep(Duration::from_millis(self.async_wait_ms)).await;

        let mut console = base.console;
        console.extend(pass.console);

        Ok(RenderOutput {
            html: base.html,
            final_url: base.final_url,
            network: base.network,
            console,
            rendered_at: Utc::now(),
            screenshot_png: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_worker_usage() {
        let html = r#"<html><body><script>const w = new Worker("x.js");</script></body></html>"#;
        let result = LightweightRenderer::run_scripts(html);
        assert!(matches!(result, Err(RenderError::ScriptError(_))));
    }

    #[test]
    fn detects_bot_challenge_marker() {
        let html = r#"<html><body><h1>Just a moment...</h1></body></html>"#;
        let result = LightweightRenderer::run_scripts(html).unwrap();
        assert!(result.needs_full_browser);
    }

    #[test]
    fn stub_calls_are_recorded_but_not_rejected() {
        let html = r#"<script>localStorage.setItem("a","b");</script>"#;
        let result = LightweightRenderer::run_scripts(html).unwrap();
        assert!(!result.needs_full_browser);
        assert!(result.console.iter().any(|c| c.contains("localStorage")));
    }
}
