//! URL security validation: normalize, bound, parse, check scheme, classify host.

pub mod host;
pub mod ip_range;
pub mod normalize;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::debug;
use url::Url;

pub use host::{DnsError, DnsResolver, TokioDnsResolver, validate_host};
pub use normalize::normalize;

/// Longest accepted URL, measured after normalization.
pub const MAX_URL_LENGTH: usize = 2048;

const MSG_INVALID_FORMAT: &str = "Invalid URL format";
const MSG_TOO_LONG: &str = "URL exceeds maximum length";
const MSG_PRIVATE_NETWORK: &str = "Access to private networks not allowed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    LengthViolation,
    InvalidFormat,
    InvalidScheme,
    PrivateIp,
    PrivateIpv6,
    DnsResolutionBlocked,
    DnsResolutionFailed,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LengthViolation => "length_violation",
            Self::InvalidFormat => "invalid_format",
            Self::InvalidScheme => "invalid_scheme",
            Self::PrivateIp => "private_ip",
            Self::PrivateIpv6 => "private_ipv6",
            Self::DnsResolutionBlocked => "dns_resolution_blocked",
            Self::DnsResolutionFailed => "dns_resolution_failed",
        }
    }

    /// Caller-facing message. Never carries the offending host, address,
    /// port, or path. Resolution failures share the private-network message.
    pub fn message(self) -> &'static str {
        match self {
            Self::LengthViolation => MSG_TOO_LONG,
            Self::InvalidFormat | Self::InvalidScheme => MSG_INVALID_FORMAT,
            Self::PrivateIp
            | Self::PrivateIpv6
            | Self::DnsResolutionBlocked
            | Self::DnsResolutionFailed => MSG_PRIVATE_NETWORK,
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one URL. Valid exactly when there are no violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    valid: bool,
    message: &'static str,
    violations: BTreeSet<ViolationCode>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            message: "",
            violations: BTreeSet::new(),
        }
    }

    /// An empty `violations` set is recorded as `InvalidFormat` so the result
    /// can never claim to be invalid without a reason.
    pub fn invalid(
        message: &'static str,
        violations: impl IntoIterator<Item = ViolationCode>,
    ) -> Self {
        let mut violations: BTreeSet<_> = violations.into_iter().collect();
        if violations.is_empty() {
            violations.insert(ViolationCode::InvalidFormat);
        }
        Self {
            valid: false,
            message,
            violations,
        }
    }

    pub fn from_violation(code: ViolationCode) -> Self {
        Self::invalid(code.message(), [code])
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn violations(&self) -> &BTreeSet<ViolationCode> {
        &self.violations
    }

    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.contains(&code)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            f.write_str("valid")
        } else {
            f.write_str(self.message)
        }
    }
}

/// Runs the validation pipeline with a pluggable DNS resolver.
#[derive(Debug, Clone, Default)]
pub struct UrlValidator<R = TokioDnsResolver> {
    resolver: R,
}

impl UrlValidator<TokioDnsResolver> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: DnsResolver> UrlValidator<R> {
    pub fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }

    pub async fn validate(&self, raw: &str) -> ValidationResult {
        match self.check(raw).await {
            Ok(_) => ValidationResult::valid(),
            Err(rejected) => rejected,
        }
    }

    pub async fn is_url_safe(&self, raw: &str) -> bool {
        self.validate(raw).await.is_valid()
    }

    /// Validate `raw` and hand back the URL to request.
    ///
    /// Checks run on the normalized form, but the returned URL is `raw` as
    /// supplied (trimmed), so encoded reserved characters such as `%2B` or
    /// `%2F` keep their meaning. It is only returned when it addresses the
    /// same scheme, host, and port as the normalized form that passed.
    pub async fn check(&self, raw: &str) -> Result<Url, ValidationResult> {
        let normalized = check_syntax(raw)?;
        // check_syntax guarantees a host
        let host = normalized.host_str().unwrap_or_default();
        let verdict = validate_host(host, &self.resolver).await;
        if !verdict.is_valid() {
            return Err(verdict);
        }
        request_url(raw, &normalized)
    }
}

/// Parse the trimmed input and require that it targets the same origin as
/// the validated, normalized URL.
fn request_url(raw: &str, validated: &Url) -> Result<Url, ValidationResult> {
    let invalid = || ValidationResult::from_violation(ViolationCode::InvalidFormat);
    let request = Url::parse(raw.trim()).map_err(|_| invalid())?;

    let same_target = request.scheme() == validated.scheme()
        && request.host() == validated.host()
        && request.port_or_known_default() == validated.port_or_known_default()
        && request.username().is_empty()
        && request.password().is_none();
    if !same_target {
        debug!(
            url = %redact_url_credentials(raw.trim()),
            "URL targets a different origin once decoded"
        );
        return Err(invalid());
    }
    Ok(request)
}

/// Every check that needs no network: normalize, length, parse, credentials,
/// scheme, and host presence, short-circuiting on the first failure.
pub fn check_syntax(raw: &str) -> Result<Url, ValidationResult> {
    let normalized = normalize(raw);

    if normalized.len() > MAX_URL_LENGTH {
        return Err(ValidationResult::from_violation(ViolationCode::LengthViolation));
    }

    let parsed = Url::parse(&normalized).map_err(|e| {
        debug!(error = %e, "URL failed to parse");
        ValidationResult::from_violation(ViolationCode::InvalidFormat)
    })?;

    let has_credentials = !parsed.username().is_empty() || parsed.password().is_some();
    if parsed.scheme().is_empty() || has_credentials {
        debug!(url = %redact_url_credentials(&normalized), "URL carries credentials");
        return Err(ValidationResult::from_violation(ViolationCode::InvalidFormat));
    }

    if !matches!(parsed.scheme(), "http" | "https") {
        debug!(scheme = parsed.scheme(), "disallowed URL scheme");
        return Err(ValidationResult::from_violation(ViolationCode::InvalidScheme));
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ValidationResult::from_violation(ViolationCode::InvalidFormat));
    }

    Ok(parsed)
}

/// Validate with the system resolver.
pub async fn validate(raw: &str) -> ValidationResult {
    UrlValidator::new().validate(raw).await
}

pub async fn is_url_safe(raw: &str) -> bool {
    validate(raw).await.is_valid()
}

/// Strip userinfo (username:password) from URLs before logging.
pub fn redact_url_credentials(raw: &str) -> Cow<'_, str> {
    if !raw.contains('@') {
        return Cow::Borrowed(raw);
    }
    if let Ok(mut parsed) = Url::parse(raw)
        && (!parsed.username().is_empty() || parsed.password().is_some())
    {
        let _ = parsed.set_username("");
        let _ = parsed.set_password(None);
        return Cow::Owned(parsed.to_string());
    }
    Cow::Borrowed(raw)
}
