//! `Url` and `TenantId` (§3).

use serde::{Deserialize, Serialize};

/// A parsed, absolute URL restricted to http/https (the gate enforces
/// this before a `ParsedUrl` is ever constructed). Derived attributes
/// follow §3: *domain* is the registrable host, lowercased, with a
/// leading "www." stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUrl {
    pub raw: String,
    pub scheme: String,
    pub host: String,
    pub domain: String,
    pub path: String,
    pub query: Option<String>,
}

impl ParsedUrl {
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        let parsed = url::Url::parse(raw)?;
        let host = parsed.host_str().unwrap_or("").to_string();
        let domain = normalize_domain(&host);
        Ok(Self {
            raw: raw.to_string(),
            scheme: parsed.scheme().to_string(),
            host,
            domain,
            path: parsed.path().to_string(),
            query: parsed.query().map(|q| q.to_string()),
        })
    }
}

/// Lowercase and strip a leading "www." label, matching §3's definition
/// of *domain* for grouping/rate-limiting/learning purposes.
pub fn normalize_domain(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

/// Opaque tenant identifier. All persisted data is keyed by
/// `(tenant, namespace, entity_key)` (§3, §4.12).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_www_and_lowercases() {
        assert_eq!(normalize_domain("WWW.Example.COM"), "example.com");
        assert_eq!(normalize_domain("example.com"), "example.com");
    }

    #[test]
    fn parses_domain_path_query() {
        let u = ParsedUrl::parse("https://www.Reddit.com/r/rust/comments/abc123?x=1").unwrap();
        assert_eq!(u.domain, "reddit.com");
        assert_eq!(u.path, "/r/rust/comments/abc123");
        assert_eq!(u.query.as_deref(), Some("x=1"));
    }
}
