//! Rate Limiter (§4.2): per-domain token bucket with learned rates.
//!
//! Grounded on `packages/extraction/src/crawlers/rate_limited.rs`'s use
//! of the `governor` crate. That wrapper rate-limits a single crawler
//! instance; here the limiter is domain-keyed directly, since the
//! Tiered Fetcher needs one bucket per *domain*, not per renderer.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::sync::Mutex;

type DomainLimiter =
    GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

#[derive(Debug, Clone, Copy)]
pub struct DomainRateConfig {
    pub rpm: u32,
    pub min_delay_ms: u64,
}

impl Default for DomainRateConfig {
    fn default() -> Self {
        Self {
            rpm: 30,
            min_delay_ms: 0,
        }
    }
}

struct DomainState {
    limiter: Arc<DomainLimiter>,
    config: DomainRateConfig,
    last_acquired_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct RateStatus {
    pub domain: String,
    pub limit_rpm: u32,
    pub recent: u64,
    pub can_request: bool,
}

/// Per-domain token bucket. Unknown domains get the default rate (30 rpm,
/// §4.2); `min_delay_ms` is enforced on top of the bucket as a strict
/// minimum spacing between consecutive acquisitions for the same domain.
pub struct RateLimiter {
    domains: Mutex<HashMap<String, DomainState>>,
    default_config: DomainRateConfig,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            default_config: DomainRateConfig::default(),
        }
    }

    pub fn with_default_rpm(rpm: u32) -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            default_config: DomainRateConfig {
                rpm,
                min_delay_ms: 0,
            },
        }
    }

    pub async fn set_domain_config(&self, domain: &str, config: DomainRateConfig) {
        let mut domains = self.domains.lock().await;
        let state = Self::build_state(config);
        domains.insert(domain.to_string(), state);
    }

    fn build_state(config: DomainRateConfig) -> DomainState {
        let rpm = NonZeroU32::new(config.rpm.max(1)).unwrap();
        let quota = Quota::per_minute(rpm);
        DomainState {
            limiter: Arc::new(GovernorLimiter::direct(quota)),
            config,
            last_acquired_at: None,
        }
    }

    /// Blocks until a slot is free, honouring both the domain's token
    /// bucket and its strict minimum spacing (§4.2, §8 property 4).
    pub async fn acquire(&self, domain: &str) {
        let limiter = {
            let mut domains = self.domains.lock().await;
            let state = domains
                .entry(domain.to_string())
                .or_insert_with(|| Self::build_state(self.default_config));
            state.limiter.clone()
        };

        limiter.until_ready().await;

        let min_delay = {
            let mut domains = self.domains.lock().await;
            let state = domains.get_mut(domain).expect("state inserted above");
            let delay_needed = match state.last_acquired_at {
                Some(last) => {
                    let elapsed = last.elapsed();
                    let min_delay = Duration::from_millis(state.config.min_delay_ms);
                    min_delay.checked_sub(elapsed)
                }
                None => None,
            };
            state.last_acquired_at = Some(Instant::now());
            delay_needed
        };

        if let Some(delay) = min_delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Non-blocking read of current limiter state (§4.2 `status`).
    pub async fn status(&self, domain: &str) -> RateStatus {
        let domains = self.domains.lock().await;
        let config = domains
            .get(domain)
            .map(|s| s.config)
            .unwrap_or(self.default_config);
        let can_request = domains
            .get(domain)
            .map(|s| s.limiter.check().is_ok())
            .unwrap_or(true);
        RateStatus {
            domain: domain.to_string(),
            limit_rpm: config.rpm,
            recent: 0,
            can_request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_minimum_spacing_for_same_domain() {
        let limiter = RateLimiter::new();
        limiter
            .set_domain_config(
                "example.com",
                DomainRateConfig {
                    rpm: 6000,
                    min_delay_ms: 50,
                },
            )
            .await;

        let start = Instant::now();
        limiter.acquire("example.com").await;
        limiter.acquire("example.com").await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn unknown_domains_get_default_rate() {
        let limiter = RateLimiter::new();
        let status = limiter.status("never-configured.example").await;
        assert_eq!(status.limit_rpm, 30);
    }
}
