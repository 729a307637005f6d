//! Tier 1: Static HTTP Renderer (§4.4).
//!
//! Grounded on `packages/extraction`'s plain `reqwest::Client` usage for
//! non-JS-rendered fetches — no crawler abstraction layered on top, just
//! a GET with a cookie jar and redirect policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::redirect::Policy;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::error::{RenderError, RenderResult};
use crate::types::browse_result::NetworkRequest;
use crate::types::request::{BrowseOptions, RenderTier};

use super::{Renderer, RenderOutput};

const MAX_REDIRECTS: usize = 10;

/// Cookie jars are kept per `(tenant, session_profile)` so that two
/// browsing sessions for the same tenant don't bleed state (§4.4, and
/// generalising the per-tenant isolation invariant from §4.12). Values
/// are held as `SecretString` (per SPEC_FULL.md B.2/supplement) so a
/// stray `{:?}` on the jar never prints session-cookie contents.
#[derive(Default)]
struct CookieStore {
    jars: Mutex<HashMap<String, HashMap<String, SecretString>>>,
}

impl CookieStore {
    fn key(tenant: &str, session_profile: Option<&str>) -> String {
        format!("{tenant}:{}", session_profile.unwrap_or("default"))
    }

    async fn header_for(&self, tenant: &str, session_profile: Option<&str>) -> Option<String> {
        let jars = self.jars.lock().await;
        let jar = jars.get(&Self::key(tenant, session_profile))?;
        if jar.is_empty() {
            return None;
        }
        Some(
            jar.iter()
                .map(|(k, v)| format!("{k}={}", v.expose_secret()))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    async fn store(&self, tenant: &str, session_profile: Option<&str>, set_cookie: &[String]) {
        if set_cookie.is_empty() {
            return;
        }
        let mut jars = self.jars.lock().await;
        let jar = jars.entry(Self::key(tenant, session_profile)).or_default();
        for raw in set_cookie {
            if let Some((pair, _attrs)) = raw.split_once(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    jar.insert(name.trim().to_string(), SecretString::from(value.trim().to_string()));
                }
            } else if let Some((name, value)) = raw.split_once('=') {
                jar.insert(name.trim().to_string(), SecretString::from(value.trim().to_string()));
            }
        }
    }
}

pub struct StaticRenderer {
    client: Client,
    user_agent: String,
    cookies: Arc<CookieStore>,
    tenant: String,
}

impl StaticRenderer {
    pub fn new(user_agent: impl Into<String>, tenant: impl Into<String>) -> Self {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            client,
            user_agent: user_agent.into(),
            cookies: Arc::new(CookieStore::default()),
            tenant: tenant.into(),
        }
    }
}

#[async_trait]
impl Renderer for StaticRenderer {
    fn tier(&self) -> RenderTier {
        RenderTier::Intelligence
    }

    async fn render(&self, url: &str, options: &BrowseOptions) -> RenderResult<RenderOutput> {
        let session_profile = options.session_profile.as_deref();
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", &self.user_agent)
            .timeout(Duration::from_millis(options.tier_timeout_ms));

        if let Some(cookie_header) = self.cookies.header_for(&self.tenant, session_profile).await {
            request = request.header("Cookie", cookie_header);
        }

        let request_headers: HashMap<String, String> = [
            ("User-Agent".to_string(), self.user_agent.clone()),
        ]
        .into_iter()
        .collect();

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                RenderError::Timeout
            } else {
                RenderError::Network(err.to_string())
            }
        })?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let content_type = headers.get("content-type").cloned();
        let set_cookie: Vec<String> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok().map(|s| s.to_string()))
            .collect();

        if !status.is_success() {
            return Err(RenderError::HttpError {
                status: status.as_u16(),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|err| RenderError::Network(err.to_string()))?;

        self.cookies.store(&self.tenant, session_profile, &set_cookie).await;

        let network = vec![NetworkRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            status: status.as_u16(),
            headers,
            request_headers,
            request_body: None,
            response_body: Some(html.clone()),
            content_type,
            timestamp: Utc::now(),
        }];

        Ok(RenderOutput {
            html,
            final_url,
            network,
            console: Vec::new(),
            rendered_at: Utc::now(),
            screenshot_png: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_store_keys_by_tenant_and_session() {
        assert_ne!(
            CookieStore::key("tenant-a", Some("work")),
            CookieStore::key("tenant-b", Some("work"))
        );
        assert_ne!(
            CookieStore::key("tenant-a", Some("work")),
            CookieStore::key("tenant-a", Some("personal"))
        );
    }
}
