//! Runtime configuration, with optional overrides from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitPolicy;

pub const USER_AGENT: &str = concat!("feedguard/", env!("CARGO_PKG_VERSION"));

const DEFAULT_MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Ceilings applied by the fetch gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLimits {
    /// Per-request timeout, covering connect, headers, and body.
    pub request_timeout_secs: u64,
    /// Ceiling for the whole fetch, redirects included.
    pub max_duration_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_redirects: usize,
    pub max_response_bytes: usize,
    pub user_agent: String,
}

impl FetchLimits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            max_duration_secs: 15,
            connect_timeout_secs: 10,
            max_redirects: 3,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    pub fetch: FetchLimits,
    pub rate_limit: RateLimitPolicy,
}

impl GuardConfig {
    /// Defaults with overrides from `FEEDGUARD_*` environment variables:
    /// - `FEEDGUARD_REQUEST_TIMEOUT_SECS`
    /// - `FEEDGUARD_MAX_DURATION_SECS`
    /// - `FEEDGUARD_MAX_REDIRECTS`
    /// - `FEEDGUARD_MAX_RESPONSE_BYTES`
    /// - `FEEDGUARD_USER_AGENT`
    ///
    /// The rate-limit policy is fixed and not read from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut fetch = FetchLimits::default();

        if let Some(v) = parse_var(&lookup, "FEEDGUARD_REQUEST_TIMEOUT_SECS")? {
            fetch.request_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDGUARD_MAX_DURATION_SECS")? {
            fetch.max_duration_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDGUARD_MAX_REDIRECTS")? {
            fetch.max_redirects = v;
        }
        if let Some(v) = parse_var(&lookup, "FEEDGUARD_MAX_RESPONSE_BYTES")? {
            fetch.max_response_bytes = v;
        }
        if let Some(ua) = read_var(&lookup, "FEEDGUARD_USER_AGENT") {
            fetch.user_agent = ua;
        }

        Ok(Self {
            fetch,
            rate_limit: RateLimitPolicy::default(),
        })
    }
}

fn read_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    read_var(lookup, name)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}
