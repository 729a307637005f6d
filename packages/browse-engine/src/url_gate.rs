//! URL Safety Gate (§4.1).
//!
//! Grounded directly on `packages/extraction/src/traits/crawler.rs`'s
//! `UrlValidator`: scheme allowlist, host/CIDR blocklist, with an async
//! DNS-rebinding-aware variant. Generalised here to return this crate's
//! own `SecurityError` and to expose the synchronous/async split the
//! Tiered Fetcher needs (sync re-check on redirect Location headers,
//! async check with DNS resolution on the initial request).

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{SecurityError, SecurityResult};

/// Validates any URL before I/O (§4.1). No fetcher may be called without
/// a prior success from this gate.
#[derive(Debug, Clone)]
pub struct UrlGate {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<IpNet>,
    allowed_hosts: HashSet<String>,
}

impl Default for UrlGate {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlGate {
    pub fn new() -> Self {
        let mut allowed_schemes = HashSet::new();
        allowed_schemes.insert("http".to_string());
        allowed_schemes.insert("https".to_string());

        let mut blocked_hosts = HashSet::new();
        for host in [
            "localhost",
            "127.0.0.1",
            "::1",
            "[::1]",
            "0.0.0.0",
            "metadata.google.internal",
            "metadata.gke.internal",
            "instance-data",
        ] {
            blocked_hosts.insert(host.to_string());
        }

        let blocked_cidrs = [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "169.254.0.0/16", // link-local / cloud metadata (169.254.169.254)
            "127.0.0.0/8",
            "100.64.0.0/10", // carrier-grade NAT (RFC 6598)
            "224.0.0.0/4", // IPv4 multicast
            "::1/128",
            "fc00::/7", // IPv6 unique local (private)
            "fe80::/10", // IPv6 link-local
            "ff00::/8", // IPv6 multicast
        ]
        .iter()
        .map(|c| c.parse().unwrap())
        .collect();

        Self {
            allowed_schemes,
            blocked_hosts,
            blocked_cidrs,
            allowed_hosts: HashSet::new(),
        }
    }

    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into());
        self
    }

    pub fn block_cidr(mut self, cidr: IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    /// Synchronous check: scheme, blocklist/allowlist, and (when the host
    /// is already a literal IP) CIDR containment. Used to re-validate
    /// each redirect `Location` without paying for another DNS lookup
    /// when not needed.
    pub fn validate(&self, url: &str) -> SecurityResult<()> {
        let parsed = url::Url::parse(url).map_err(|e| SecurityError::UrlParse(e.to_string()))?;

        if !self.allowed_schemes.contains(parsed.scheme()) {
            return Err(SecurityError::DisallowedScheme(parsed.scheme().to_string()));
        }

        let host = parsed.host_str().ok_or(SecurityError::NoHost)?.to_string();

        if self.allowed_hosts.contains(&host) {
            return Ok(());
        }

        if self.blocked_hosts.contains(&host) {
            return Err(SecurityError::BlockedHost(host));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if self.blocked_cidrs.iter().any(|net| net.contains(&ip)) {
                return Err(SecurityError::BlockedCidr(host));
            }
        }

        Ok(())
    }

    /// Async check that additionally resolves DNS and re-checks every
    /// resolved address against the CIDR blocklist, defeating
    /// DNS-rebinding SSRF attacks where a hostname validates at check
    /// time but resolves to a private address at connect time.
    pub async fn validate_with_dns(&self, url: &str) -> SecurityResult<()> {
        self.validate(url)?;

        let parsed = url::Url::parse(url).map_err(|e| SecurityError::UrlParse(e.to_string()))?;
        let host = parsed.host_str().ok_or(SecurityError::NoHost)?.to_string();

        if self.allowed_hosts.contains(&host) || host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let port = parsed.port().unwrap_or(match parsed.scheme() {
            "https" => 443,
            _ => 80,
        });

        let addrs = tokio::net::lookup_host(format!("{host}:{port}"))
            .await
            .map_err(|e| SecurityError::DnsResolution(e.to_string()))?;

        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            let ip = addr.ip();
            if self.blocked_cidrs.iter().any(|net| net.contains(&ip)) {
                return Err(SecurityError::BlockedCidr(ip.to_string()));
            }
        }

        if !resolved_any {
            return Err(SecurityError::DnsResolution(format!(
                "no addresses resolved for {host}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_localhost() {
        let gate = UrlGate::new();
        assert!(gate.validate("http://localhost/admin").is_err());
        assert!(gate.validate_with_dns("http://localhost/admin").await.is_err());
    }

    #[tokio::test]
    async fn blocks_private_ips() {
        let gate = UrlGate::new();
        assert!(gate.validate("http://10.0.0.5/").is_err());
        assert!(gate.validate("http://192.168.1.1/").is_err());
        assert!(gate.validate("http://169.254.169.254/latest/meta-data").is_err());
    }

    #[test]
    fn blocks_multicast_and_carrier_grade_nat() {
        let gate = UrlGate::new();
        assert!(gate.validate("http://224.0.0.1/").is_err());
        assert!(gate.validate("http://100.64.0.1/").is_err());
        assert!(gate.validate("http://[ff02::1]/").is_err());
    }

    #[test]
    fn blocks_non_http_schemes() {
        let gate = UrlGate::new();
        assert!(gate.validate("file:///etc/passwd").is_err());
        assert!(gate.validate("ftp://example.com/").is_err());
    }

    #[test]
    fn allows_public_urls() {
        let gate = UrlGate::new();
        assert!(gate.validate("https://example.com/path?q=1").is_ok());
    }

    #[test]
    fn allowed_hosts_bypass_blocklist() {
        let gate = UrlGate::new().allow_host("localhost");
        assert!(gate.validate("http://localhost/health").is_ok());
    }
}
