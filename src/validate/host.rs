//! Host classification: literal addresses, domain grammar, and DNS re-checks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::{debug, warn};

use super::ip_range::{is_blocked_ip, is_blocked_ipv4, is_blocked_ipv6};
use super::{ValidationResult, ViolationCode};

const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LABEL_LEN: usize = 63;
const MAX_DOMAIN_LEN: usize = 253;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("DNS lookup timed out")]
    Timeout,

    #[error("DNS lookup failed: {0}")]
    Lookup(#[from] std::io::Error),
}

/// DNS resolver abstraction. Returns both A and AAAA answers for `host`.
/// Mock implementations let tests drive the resolves-to-private path without
/// real network lookups.
pub trait DnsResolver: Send + Sync {
    fn lookup(&self, host: &str) -> impl Future<Output = Result<Vec<IpAddr>, DnsError>> + Send;
}

/// Production resolver backed by the system resolver through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDnsResolver;

impl DnsResolver for TokioDnsResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        lookup_system(host).await
    }
}

pub(crate) async fn lookup_system(host: &str) -> Result<Vec<IpAddr>, DnsError> {
    let lookup = tokio::net::lookup_host((host, 0));
    let addrs = tokio::time::timeout(DNS_LOOKUP_TIMEOUT, lookup)
        .await
        .map_err(|_| DnsError::Timeout)??;
    Ok(addrs.map(|a| a.ip()).collect())
}

/// Classify a host taken from a parsed URL.
///
/// Literal addresses are checked against the blocked tables directly. Domains
/// must pass the label grammar, must not be a reserved internal name, and
/// every A/AAAA answer must be public: one blocked answer rejects the whole
/// host, and a lookup that fails or comes back empty is treated as unsafe.
pub async fn validate_host(host: &str, resolver: &impl DnsResolver) -> ValidationResult {
    if let Some(result) = classify_literal(host) {
        return result;
    }

    let domain = host.strip_suffix('.').unwrap_or(host);
    if !is_valid_domain(domain) {
        return ValidationResult::from_violation(ViolationCode::InvalidFormat);
    }

    if is_reserved_name(domain) {
        warn!(host = %domain, "blocked reserved internal hostname");
        return ValidationResult::from_violation(ViolationCode::DnsResolutionBlocked);
    }

    let addrs = match resolver.lookup(domain).await {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(host = %domain, error = %e, "DNS resolution failed");
            return ValidationResult::from_violation(ViolationCode::DnsResolutionFailed);
        }
    };

    if addrs.is_empty() {
        debug!(host = %domain, "DNS returned no records");
        return ValidationResult::from_violation(ViolationCode::DnsResolutionFailed);
    }

    if let Some(ip) = addrs.iter().copied().find(|ip| is_blocked_ip(*ip)) {
        warn!(host = %domain, ip = %ip, "DNS resolves to private IP");
        return ValidationResult::from_violation(ViolationCode::DnsResolutionBlocked);
    }

    ValidationResult::valid()
}

/// `None` when `host` is not an address literal.
fn classify_literal(host: &str) -> Option<ValidationResult> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Some(if is_blocked_ipv4(v4) {
            warn!(ip = %v4, "blocked private IPv4 literal");
            ValidationResult::from_violation(ViolationCode::PrivateIp)
        } else {
            ValidationResult::valid()
        });
    }

    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(v6) = unbracketed.parse::<Ipv6Addr>() {
        return Some(if is_blocked_ipv6(v6) {
            warn!(ip = %v6, "blocked private IPv6 literal");
            ValidationResult::from_violation(ViolationCode::PrivateIpv6)
        } else {
            ValidationResult::valid()
        });
    }

    None
}

/// Dot-separated labels of ASCII alphanumerics and internal hyphens.
pub(crate) fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    domain.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn is_reserved_name(domain: &str) -> bool {
    let lower = domain.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
        || lower.ends_with(".arpa")
}
