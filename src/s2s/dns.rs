//! DNS SRV resolution for S2S federation (RFC 6120 Section 3.2).
//!
//! Resolution order: `_xmpp-server._tcp.{domain}` SRV records sorted by
//! priority ascending and weight descending, then A/AAAA on port 5269 as
//! the fallback.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::{ResolveError, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default XMPP S2S port.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Resolver construction failed
    #[error("failed to create DNS resolver: {0}")]
    ResolverCreation(#[from] ResolveError),

    /// The domain has no usable records
    #[error("no DNS records found for domain: {0}")]
    NoRecords(String),

    /// The lookup itself failed
    #[error("DNS resolution failed for {domain}: {message}")]
    ResolutionFailed {
        /// The domain being resolved
        domain: String,
        /// The underlying resolver message
        message: String,
    },
}

/// A resolved S2S connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Hostname to connect to
    pub host: String,
    /// TCP port
    pub port: u16,
    /// SRV priority (lower first)
    pub priority: u16,
    /// SRV weight (higher first within a priority)
    pub weight: u16,
}

impl ResolvedTarget {
    /// A target from an SRV record.
    pub fn new(host: String, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host,
            port,
            priority,
            weight,
        }
    }

    /// The A/AAAA fallback target on the default port.
    pub fn fallback(host: String) -> Self {
        Self {
            host,
            port: DEFAULT_S2S_PORT,
            priority: 0,
            weight: 0,
        }
    }
}

/// Sort targets by priority ascending, weight descending.
pub fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
}

type TokioResolver = Resolver<TokioConnectionProvider>;

/// SRV resolver for outbound federation.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
}

impl SrvResolver {
    /// Create a resolver with default configuration.
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Create a resolver with explicit configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Resolve connection targets for a peer domain.
    #[instrument(skip(self), name = "s2s.dns.resolve")]
    pub async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        let srv_name = format!("_xmpp-server._tcp.{}", domain);
        debug!(srv_name = %srv_name, "resolving S2S SRV records");

        match self.resolver.srv_lookup(&srv_name).await {
            Ok(response) => {
                let records: Vec<&SRV> = response.iter().collect();
                let mut targets = process_srv_records(&records);
                if targets.is_empty() {
                    debug!("no usable SRV targets, falling back to A/AAAA");
                    return self.resolve_fallback(domain).await;
                }
                sort_targets(&mut targets);
                debug!(count = targets.len(), "resolved S2S targets via SRV");
                Ok(targets)
            }
            Err(e) => {
                warn!(error = %e, "SRV lookup failed, falling back to A/AAAA");
                self.resolve_fallback(domain).await
            }
        }
    }

    /// Fall back to A/AAAA records on port 5269.
    async fn resolve_fallback(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(response) => {
                if response.iter().next().is_none() {
                    return Err(DnsError::NoRecords(domain.to_string()));
                }
                Ok(vec![ResolvedTarget::fallback(domain.to_string())])
            }
            Err(e) => Err(DnsError::ResolutionFailed {
                domain: domain.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Resolve a target hostname to socket addresses for dialing.
    pub async fn resolve_host_to_addrs(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(response) => {
                let addrs: Vec<SocketAddr> = response
                    .iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect();
                if addrs.is_empty() {
                    return Err(DnsError::NoRecords(host.to_string()));
                }
                Ok(addrs)
            }
            Err(e) => Err(DnsError::ResolutionFailed {
                domain: host.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn process_srv_records(records: &[&SRV]) -> Vec<ResolvedTarget> {
    records
        .iter()
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            // The root target "." means the service is explicitly absent.
            if target == "." || target.is_empty() {
                return None;
            }
            Some(ResolvedTarget::new(
                target.trim_end_matches('.').to_string(),
                srv.port(),
                srv.priority(),
                srv.weight(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_uses_default_port() {
        let target = ResolvedTarget::fallback("example.org".to_string());
        assert_eq!(target.port, DEFAULT_S2S_PORT);
        assert_eq!(target.host, "example.org");
    }

    #[test]
    fn sorting_prefers_low_priority_then_high_weight() {
        let mut targets = vec![
            ResolvedTarget::new("c.example.org".into(), 5269, 20, 50),
            ResolvedTarget::new("a.example.org".into(), 5269, 10, 30),
            ResolvedTarget::new("b.example.org".into(), 5269, 10, 70),
        ];
        sort_targets(&mut targets);
        assert_eq!(targets[0].host, "b.example.org");
        assert_eq!(targets[1].host, "a.example.org");
        assert_eq!(targets[2].host, "c.example.org");
    }
}
