//! Network capability policy.
//!
//! Decides whether sandboxed code may reach a URL. The SSRF address check
//! always runs before the capability-level branch, so no level or approval
//! can unlock an internal address.

use crate::ssrf::{is_blocked_ip, is_metadata_host};
use async_trait::async_trait;
use extbox_types::NetworkCapabilityLevel;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

/// Why a URL was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkDenial {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not allowed")]
    SchemeNotAllowed(String),

    #[error("urls with credentials are not allowed")]
    UserInfo,

    #[error("url has no host")]
    MissingHost,

    #[error("host '{0}' is a cloud metadata endpoint")]
    MetadataHost(String),

    #[error("host '{0}' could not be resolved")]
    Unresolvable(String),

    #[error("host '{host}' resolves to blocked address {addr}")]
    BlockedAddress { host: String, addr: IpAddr },

    #[error("extension has no network capability")]
    CapabilityNone,

    #[error("host '{0}' is not on the allowlist")]
    NotAllowlisted(String),

    #[error("network capability '{0}' has not been approved")]
    NotApproved(String),
}

/// A URL that passed validation, with the addresses the connection must use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

/// Resolves hostnames for the SSRF check. Pluggable so tests need no DNS.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Fixed host table. Unknown hosts fail to resolve.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("unknown host {host}"))
            })
    }
}

/// Hostname allowlist: exact names plus `*.suffix` wildcards, case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowlist {
    exact: HashSet<String>,
    wildcard_suffixes: Vec<String>,
}

impl HostAllowlist {
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut list = Self::default();
        list.extend(entries);
        list
    }

    /// Adds entries. A bare `*` is ignored: `allowlist_only` never means "any host".
    pub fn extend<S: AsRef<str>>(&mut self, entries: &[S]) {
        for entry in entries {
            let entry = entry.as_ref().trim().trim_end_matches('.').to_lowercase();
            if entry.is_empty() || entry == "*" {
                continue;
            }
            if let Some(suffix) = entry.strip_prefix("*.") {
                let suffix = format!(".{suffix}");
                if !self.wildcard_suffixes.contains(&suffix) {
                    self.wildcard_suffixes.push(suffix);
                }
            } else {
                self.exact.insert(entry);
            }
        }
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        self.exact.contains(&host) || self.wildcard_suffixes.iter().any(|s| host.ends_with(s))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty()
    }
}

/// Stateless decision function over URLs. The only I/O is name resolution.
pub struct CapabilityPolicy {
    default_allowlist: HostAllowlist,
    resolver: Arc<dyn HostResolver>,
}

impl CapabilityPolicy {
    pub fn new(default_allowlist: HostAllowlist, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            default_allowlist,
            resolver,
        }
    }

    pub fn default_allowlist(&self) -> &HostAllowlist {
        &self.default_allowlist
    }

    /// Validates `url` for an extension with the given capability.
    ///
    /// `tenant_allowlist` is unioned with the default allowlist and only
    /// consulted at `allowlist_only`.
    pub async fn validate(
        &self,
        url: &str,
        level: NetworkCapabilityLevel,
        approved: bool,
        tenant_allowlist: &[String],
    ) -> Result<ValidatedUrl, NetworkDenial> {
        let parsed = Url::parse(url).map_err(|e| NetworkDenial::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(NetworkDenial::SchemeNotAllowed(other.to_string())),
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(NetworkDenial::UserInfo);
        }
        let port = parsed.port_or_known_default().unwrap_or(443);

        let (host, addrs) = match parsed.host() {
            None => return Err(NetworkDenial::MissingHost),
            Some(Host::Ipv4(ip)) => (ip.to_string(), vec![SocketAddr::new(ip.into(), port)]),
            Some(Host::Ipv6(ip)) => (ip.to_string(), vec![SocketAddr::new(ip.into(), port)]),
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                if is_metadata_host(&domain) {
                    return Err(NetworkDenial::MetadataHost(domain));
                }
                let addrs = self
                    .resolver
                    .resolve(&domain, port)
                    .await
                    .map_err(|_| NetworkDenial::Unresolvable(domain.clone()))?;
                if addrs.is_empty() {
                    return Err(NetworkDenial::Unresolvable(domain));
                }
                (domain, addrs)
            }
        };

        // Every resolved address must be public; one bad record poisons the host.
        if let Some(bad) = addrs.iter().find(|a| is_blocked_ip(&a.ip())) {
            debug!(host = %host, addr = %bad.ip(), "SSRF check rejected address");
            return Err(NetworkDenial::BlockedAddress {
                host,
                addr: bad.ip(),
            });
        }

        match level {
            NetworkCapabilityLevel::None => return Err(NetworkDenial::CapabilityNone),
            NetworkCapabilityLevel::AllowlistOnly => {
                let tenant = HostAllowlist::from_entries(tenant_allowlist);
                if !self.default_allowlist.is_allowed(&host) && !tenant.is_allowed(&host) {
                    return Err(NetworkDenial::NotAllowlisted(host));
                }
            }
            NetworkCapabilityLevel::Network | NetworkCapabilityLevel::NetworkAdvanced => {
                if !approved {
                    return Err(NetworkDenial::NotApproved(level.as_str().to_string()));
                }
            }
        }

        Ok(ValidatedUrl {
            url: parsed,
            host,
            addrs,
        })
    }
}
