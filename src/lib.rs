//! SSRF-safe gatekeeping for user-supplied feed URLs.
//!
//! - [`validate`] / [`is_url_safe`]: normalize a URL and reject anything that
//!   is malformed, not HTTP(S), or that points (literally or through DNS) at
//!   loopback, private, link-local, or IPv4-mapped addresses.
//! - [`SecureFetcher`]: an outbound GET that re-validates every redirect hop
//!   and screens the addresses it actually connects to.
//! - [`RateLimiter`]: a per-identifier sliding window over a shared store.

pub mod config;
pub mod fetch;
pub mod rate_limit;
pub mod validate;

pub use config::{ConfigError, FetchLimits, GuardConfig};
pub use fetch::{FetchError, FetchedFeed, SecureFetcher};
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use validate::{
    UrlValidator, ValidationResult, ViolationCode, is_url_safe, normalize, validate,
};
