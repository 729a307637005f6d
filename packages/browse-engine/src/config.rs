//! `EnvConfig` (ambient, SPEC_FULL.md B.4) and `HeuristicsConfig` (§4.14).
//!
//! `HeuristicsConfig`'s builder idiom is generalised from
//! `packages/intelligent-crawler/src/config.rs`'s `DetectionConfig`/
//! `RelationshipRule` (`new`/`with_*` chains) applied to a whole
//! declarative rule file rather than a single rule.

use std::sync::RwLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Environment-sourced defaults (§6). Every field here is only ever a
/// *source* for `BrowseOptions`/`HeuristicsConfig` defaults; nothing in
/// the pipeline consults `std::env` directly mid-request.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub render_user_agent: String,
    pub tier_default_timeout_ms: u64,
    pub bot_challenge_max_ms: u64,
    pub browser_pool_max: usize,
    pub rate_limit_default_rpm: u32,
    pub page_cache_ttl_ms: u64,
    pub debug_trace_enabled: bool,
    pub tenant_id_default: String,
    pub heuristics_config_path: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            render_user_agent: "browse-engine/0.1".to_string(),
            tier_default_timeout_ms: 10_000,
            bot_challenge_max_ms: 30_000,
            browser_pool_max: 4,
            rate_limit_default_rpm: 30,
            page_cache_ttl_ms: 3_600_000,
            debug_trace_enabled: false,
            tenant_id_default: "default".to_string(),
            heuristics_config_path: None,
        }
    }
}

impl EnvConfig {
    /// Loads `.env` via `dotenvy` (best-effort, matching the teacher's
    /// `dev-cli`/`server` startup convention) then reads the enumerated
    /// environment variables, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            render_user_agent: std::env::var("RENDER_USER_AGENT")
                .unwrap_or(defaults.render_user_agent),
            tier_default_timeout_ms: parse_env_or(
                "TIER_DEFAULT_TIMEOUT_MS",
                defaults.tier_default_timeout_ms,
            ),
            bot_challenge_max_ms: parse_env_or(
                "BOT_CHALLENGE_MAX_MS",
                defaults.bot_challenge_max_ms,
            ),
            browser_pool_max: parse_env_or("BROWSER_POOL_MAX", defaults.browser_pool_max),
            rate_limit_default_rpm: parse_env_or(
                "RATE_LIMIT_DEFAULT_RPM",
                defaults.rate_limit_default_rpm,
            ),
            page_cache_ttl_ms: parse_env_or("PAGE_CACHE_TTL_MS", defaults.page_cache_ttl_ms),
            debug_trace_enabled: parse_env_or(
                "DEBUG_TRACE_ENABLED",
                defaults.debug_trace_enabled,
            ),
            tenant_id_default: std::env::var("TENANT_ID_DEFAULT")
                .unwrap_or(defaults.tenant_id_default),
            heuristics_config_path: std::env::var("HEURISTICS_CONFIG_PATH").ok(),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// A group of domains sharing cookie-banner/content/nav selectors and a
/// language (§4.14).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainGroup {
    pub name: String,
    pub member_domains: Vec<String>,
    pub cookie_banner_selectors: Vec<String>,
    pub content_selectors: Vec<String>,
    pub nav_selectors: Vec<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierRules {
    pub static_domains: Vec<String>,
    pub browser_required: Vec<String>,
    pub content_markers: Vec<String>,
    pub incomplete_markers: Vec<String>,
}

/// On-disk declarative shape loaded via `toml`/`serde` (§4.14).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeuristicsConfigFile {
    pub domain_groups: Vec<DomainGroup>,
    pub tier_rules: TierRules,
}

struct CompiledRules {
    static_domains: RegexSet,
    browser_required: RegexSet,
}

/// Declarative, hot-reloadable rule set (§4.14). Compiled `RegexSet`s are
/// memoised behind a `RwLock` and rebuilt on `reload`.
pub struct HeuristicsConfig {
    file: RwLock<HeuristicsConfigFile>,
    compiled: RwLock<CompiledRules>,
}

impl HeuristicsConfig {
    pub fn from_file(file: HeuristicsConfigFile) -> Self {
        let compiled = compile(&file.tier_rules);
        Self {
            file: RwLock::new(file),
            compiled: RwLock::new(compiled),
        }
    }

    pub fn empty() -> Self {
        Self::from_file(HeuristicsConfigFile::default())
    }

    /// Loads and parses a TOML heuristics file from disk.
    pub fn load(path: &str) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)?;
        let file: HeuristicsConfigFile = toml::from_str(&contents)?;
        Ok(Self::from_file(file))
    }

    /// Replaces the in-memory rule set and recompiles regex sets,
    /// invalidating the previous memoisation (§4.14).
    pub fn reload(&self, file: HeuristicsConfigFile) {
        let compiled = compile(&file.tier_rules);
        *self.file.write().unwrap() = file;
        *self.compiled.write().unwrap() = compiled;
    }

    pub fn find_domain_group(&self, host: &str) -> Option<DomainGroup> {
        self.file
            .read()
            .unwrap()
            .domain_groups
            .iter()
            .find(|g| g.member_domains.iter().any(|d| d == host))
            .cloned()
    }

    pub fn is_static_domain(&self, host: &str) -> bool {
        self.compiled.read().unwrap().static_domains.is_match(host)
    }

    pub fn is_browser_required(&self, host: &str) -> bool {
        self.compiled
            .read()
            .unwrap()
            .browser_required
            .is_match(host)
    }

    pub fn has_content_markers(&self, html: &str) -> bool {
        self.file
            .read()
            .unwrap()
            .tier_rules
            .content_markers
            .iter()
            .any(|m| html.contains(m.as_str()))
    }

    pub fn has_incomplete_markers(&self, html: &str) -> bool {
        self.file
            .read()
            .unwrap()
            .tier_rules
            .incomplete_markers
            .iter()
            .any(|m| html.contains(m.as_str()))
    }
}

fn compile(rules: &TierRules) -> CompiledRules {
    CompiledRules {
        static_domains: RegexSet::new(&rules.static_domains).unwrap_or_else(|_| RegexSet::empty()),
        browser_required: RegexSet::new(&rules.browser_required)
            .unwrap_or_else(|_| RegexSet::empty()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read heuristics config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse heuristics config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_domain_regex_matches() {
        let file = HeuristicsConfigFile {
            domain_groups: vec![],
            tier_rules: TierRules {
                static_domains: vec![r"^(www\.)?wikipedia\.org$".to_string()],
                browser_required: vec![],
                content_markers: vec![],
                incomplete_markers: vec![],
            },
        };
        let config = HeuristicsConfig::from_file(file);
        assert!(config.is_static_domain("wikipedia.org"));
        assert!(!config.is_static_domain("example.com"));
    }

    #[test]
    fn reload_invalidates_previous_rules() {
        let config = HeuristicsConfig::empty();
        assert!(!config.is_browser_required("spa-heavy.example"));
        config.reload(HeuristicsConfigFile {
            domain_groups: vec![],
            tier_rules: TierRules {
                static_domains: vec![],
                browser_required: vec!["spa-heavy\\.example".to_string()],
                content_markers: vec![],
                incomplete_markers: vec![],
            },
        });
        assert!(config.is_browser_required("spa-heavy.example"));
    }
}
