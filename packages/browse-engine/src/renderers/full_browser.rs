//! Tier 3: Full Browser Renderer (§4.6).
//!
//! Grounded on `dashflow-playwright`'s `BrowserState`/`NavigateTool`
//! (`Playwright::initialize` → `chromium().launcher().headless(true)` →
//! `context_builder()` → `new_page()`, `page.eval::<T>(script)`,
//! `page.title()`) — the same launch/navigate/eval shape, wrapped here
//! behind the `Renderer` trait instead of a `Tool`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{RenderError, RenderResult};
use crate::types::browse_result::NetworkRequest;
use crate::types::request::{BrowseOptions, ProxyConfig, RenderTier};

use super::{Renderer, RenderOutput};

/// Injected once per session before navigation: wraps `window.fetch` and
/// the console methods so the captured network/console activity can be
/// read back with a single `page.eval` call, mirroring how the
/// Lightweight Renderer instruments scripts without a native DevTools
/// protocol client in this crate's dependency tree (§4.6).
const CAPTURE_INIT_SCRIPT: &str = r#"() => {
    if (window.__browseEngineCapture) { return; }
    window.__browseEngineCapture = { network: [], console: [] };
    const origFetch = window.fetch;
    if (origFetch) {
        window.fetch = function(input, init) {
            const url = typeof input === 'string' ? input : (input && input.url) || String(input);
            const method = (init && init.method) || 'GET';
            return origFetch.apply(this, arguments).then((response) => {
                response.clone().text().then((body) => {
                    window.__browseEngineCapture.network.push({
                        url,
                        method,
                        status: response.status,
                        content_type: response.headers.get('content-type'),
                        response_body: body,
                        timestamp_ms: Date.now(),
                    });
                }).catch(() => {});
                return response;
            });
        };
    }
    ['log', 'warn', 'error', 'info'].forEach((level) => {
        const orig = console[level];
        if (!orig) { return; }
        console[level] = function(...args) {
            window.__browseEngineCapture.console.push(`[${level}] ${args.map(String).join(' ')}`);
            return orig.apply(console, args);
        };
    });
}"#;

const DRAIN_CAPTURE_SCRIPT: &str =
    "() => window.__browseEngineCapture || { network: [], console: [] }";

#[derive(Debug, serde::Deserialize, Default)]
struct CapturedActivity {
    #[serde(default)]
    network: Vec<CapturedRequest>,
    #[serde(default)]
    console: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CapturedRequest {
    url: String,
    method: String,
    status: u16,
    content_type: Option<String>,
    response_body: Option<String>,
    timestamp_ms: i64,
}

impl From<CapturedRequest> for NetworkRequest {
    fn from(entry: CapturedRequest) -> Self {
        NetworkRequest {
            url: entry.url,
            method: entry.method,
            status: entry.status,
            headers: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_body: entry.response_body,
            content_type: entry.content_type,
            timestamp: chrono::DateTime::from_timestamp_millis(entry.timestamp_ms).unwrap_or_else(Utc::now),
        }
    }
}

const CHALLENGE_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_BOT_CHALLENGE_MAX_MS: u64 = 30_000;
const SCROLL_SWEEP_STEPS: u32 = 6;

const CHALLENGE_MARKERS: &[&str] = &[
    "Just a moment",
    "cf-challenge",
    "challenge-platform",
    "Checking your browser",
];

/// Launch configuration for the headless browser. Proxy is the only
/// tier-specific option per the Open Questions decision recorded in
/// SPEC_FULL.md — other tiers treat `BrowseOptions::proxy` as advisory.
#[derive(Debug, Clone)]
pub struct FullBrowserConfig {
    pub bot_challenge_max_ms: u64,
    pub proxy: Option<ProxyConfig>,
}

impl Default for FullBrowserConfig {
    fn default() -> Self {
        Self {
            bot_challenge_max_ms: DEFAULT_BOT_CHALLENGE_MAX_MS,
            proxy: None,
        }
    }
}

/// Headless-browser wrapper. Behind the `full-browser` feature a real
/// `playwright::api::Playwright` session backs this; with the feature
/// off (e.g. in CI without a Chromium install) `render` always returns
/// `RendererUnavailable`-shaped failures via `RenderError::Network`.
pub struct FullBrowserRenderer {
    config: FullBrowserConfig,
}

impl FullBrowserRenderer {
    pub fn new(config: FullBrowserConfig) -> Self {
        Self { config }
    }

    /// Polls the rendered HTML for challenge markers, re-evaluating the
    /// page up to `bot_challenge_max_ms` before giving up (§4.6).
    async fn wait_out_challenge<F, Fut>(&self, mut current_html: String, refetch: F) -> RenderResult<String>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = RenderResult<String>>,
    {
        let deadline = Instant::now() + Duration::from_millis(self.config.bot_challenge_max_ms);
        while is_challenge_page(&current_html) {
            if Instant::now() >= deadline {
                return Err(RenderError::BotChallenge);
            }
            tokio::time::sleep(Duration::from_millis(CHALLENGE_POLL_INTERVAL_MS)).await;
            current_html = refetch().await?;
        }
        Ok(current_html)
    }
}

fn is_challenge_page(html: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| html.contains(marker))
}

#[cfg(feature = "full-browser")]
mod backend {
    use super::*;
    use playwright::api::{BrowserContext, Page, Playwright};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    pub struct Session {
        // Held alive to keep `Page` valid per Playwright's ownership model.
        _context: Arc<Mutex<BrowserContext>>,
        page: Arc<Mutex<Page>>,
    }

    impl Session {
        pub async fn launch(proxy: Option<&ProxyConfig>) -> RenderResult<Self> {
            let playwright = Playwright::initialize()
                .await
                .map_err(|e| RenderError::Network(format!("playwright init failed: {e}")))?;
            playwright
                .install_chromium()
                .map_err(|e| RenderError::Network(format!("chromium install failed: {e}")))?;
            let chromium = playwright.chromium();
            let mut launcher = chromium.launcher().headless(true);
            if let Some(proxy) = proxy {
                launcher = launcher.proxy(playwright::api::browser::Proxy {
                    server: proxy.url.clone(),
                    bypass: None,
                    username: proxy.username.clone(),
                    password: None,
                });
            }
            let browser = launcher
                .launch()
                .await
                .map_err(|e| RenderError::Network(format!("browser launch failed: {e}")))?;
            let context = browser
                .context_builder()
                .build()
                .await
                .map_err(|e| RenderError::Network(format!("context build failed: {e}")))?;
            let page = context
                .new_page()
                .await
                .map_err(|e| RenderError::Network(format!("new page failed: {e}")))?;
            Ok(Self {
                _context: Arc::new(Mutex::new(context)),
                page: Arc::new(Mutex::new(page)),
            })
        }

        /// Installs the network/console capture wrapper. Must run before
        /// `goto` so the instrumented `fetch`/`console` are in place
        /// before the page's own scripts execute.
        pub async fn install_capture(&self) -> RenderResult<()> {
            let page = self.page.lock().await;
            page.eval::<()>(super::CAPTURE_INIT_SCRIPT)
                .await
                .map_err(|e| RenderError::ScriptError(e.to_string()))
        }

        pub async fn drain_capture(&self) -> RenderResult<super::CapturedActivity> {
            let page = self.page.lock().await;
            page.eval::<super::CapturedActivity>(super::DRAIN_CAPTURE_SCRIPT)
                .await
                .map_err(|e| RenderError::ParseError(e.to_string()))
        }

        pub async fn screenshot(&self, full_page: bool) -> RenderResult<Vec<u8>> {
            let page = self.page.lock().await;
            page.screenshot_builder()
                .full_page(full_page)
                .screenshot()
                .await
                .map_err(|e| RenderError::Network(format!("screenshot failed: {e}")))
        }

        pub async fn goto(&self, url: &str) -> RenderResult<()> {
            let page = self.page.lock().await;
            page.goto_builder(url)
                .goto()
                .await
                .map_err(|e| RenderError::Network(format!("navigation failed: {e}")))?;
            Ok(())
        }

        pub async fn html(&self) -> RenderResult<String> {
            let page = self.page.lock().await;
            page.eval::<String>("() => document.documentElement.outerHTML")
                .await
                .map_err(|e| RenderError::ParseError(e.to_string()))
        }

        pub async fn current_url(&self) -> RenderResult<String> {
            let page = self.page.lock().await;
            page.url()
                .map_err(|e| RenderError::Network(e.to_string()))
        }

        /// Lazy-content scroll sweep: scroll to the bottom in fixed steps,
        /// letting lazy-loaded sections mount between each (§4.6).
        pub async fn scroll_sweep(&self, steps: u32) -> RenderResult<()> {
            let page = self.page.lock().await;
            for _ in 0..steps {
                page.eval::<()>(
                    "() => (document.scrollingElement || document.body).scrollTop += window.innerHeight",
                )
                .await
                .map_err(|e| RenderError::ScriptError(e.to_string()))?;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(())
        }
    }
}

#[async_trait]
impl Renderer for FullBrowserRenderer {
    fn tier(&self) -> RenderTier {
        RenderTier::Playwright
    }

    #[cfg(feature = "full-browser")]
    async fn render(&self, url: &str, options: &BrowseOptions) -> RenderResult<RenderOutput> {
        let proxy = options.proxy.as_ref().or(self.config.proxy.as_ref());
        let session = backend::Session::launch(proxy).await?;
        session.install_capture().await?;
        session.goto(url).await?;

        let initial_html = session.html().await?;
        let html = self
            .wait_out_challenge(initial_html, || async { session.html().await })
            .await?;

        let html = if options.scroll_to_load {
            session.scroll_sweep(SCROLL_SWEEP_STEPS).await?;
            session.html().await?
        } else {
            html
        };
        let final_url = session.current_url().await?;

        let activity = session.drain_capture().await.unwrap_or_default();
        let network = activity.network.into_iter().map(NetworkRequest::from).collect();

        let screenshot_png = if options.capture_screenshot {
            Some(session.screenshot(true).await?)
        } else {
            None
        };

        Ok(RenderOutput {
            html,
            final_url,
            network,
            console: activity.console,
            rendered_at: Utc::now(),
            screenshot_png,
        })
    }

    #[cfg(not(feature = "full-browser"))]
    async fn render(&self, _url: &str, _options: &BrowseOptions) -> RenderResult<RenderOutput> {
        Err(RenderError::Network(
            "full-browser feature disabled; no headless browser backend available".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_challenge_markers() {
        assert!(is_challenge_page("<title>Just a moment...</title>"));
        assert!(!is_challenge_page("<title>Normal Page</title>"));
    }

    #[tokio::test]
    async fn wait_out_challenge_gives_up_after_deadline() {
        let renderer = FullBrowserRenderer::new(FullBrowserConfig {
            bot_challenge_max_ms: 50,
            proxy: None,
        });
        let result = renderer
            .wait_out_challenge("Just a moment".to_string(), || async {
                Ok::<_, RenderError>("Just a moment".to_string())
            })
            .await;
        assert!(matches!(result, Err(RenderError::BotChallenge)));
    }
}
