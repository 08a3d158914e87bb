//! Connect-time DNS screening for the HTTP client.
//!
//! Validation resolves a host once; the client resolves it again when it
//! connects, and the answer may have changed in between (DNS rebinding). This
//! resolver sits inside the client so the addresses it actually dials are the
//! ones that passed the blocked-range check.

use std::net::{IpAddr, SocketAddr};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::warn;

use crate::validate::host::lookup_system;
use crate::validate::ip_range::is_blocked_ip;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Raised when a host resolves to a blocked address at connect time.
#[derive(Debug, thiserror::Error)]
#[error("destination resolves to a private network address")]
pub struct ConnectBlocked;

/// `reqwest` resolver that fails closed: if any answer is blocked, none are
/// returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let ips = lookup_system(&host)
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?;
            let ips = screen(&host, ips).map_err(|e| -> BoxError { Box::new(e) })?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

pub(crate) fn screen(host: &str, ips: Vec<IpAddr>) -> Result<Vec<IpAddr>, ConnectBlocked> {
    if ips.is_empty() {
        warn!(host = %host, "connect-time DNS returned no addresses");
        return Err(ConnectBlocked);
    }
    if let Some(ip) = ips.iter().find(|ip| is_blocked_ip(**ip)) {
        warn!(host = %host, ip = %ip, "connect-time DNS resolves to private IP");
        return Err(ConnectBlocked);
    }
    Ok(ips)
}
