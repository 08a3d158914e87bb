//! Guarded outbound GET for feed URLs.
//!
//! Every hop is validated before it is requested: the initial URL and each
//! redirect target go through the URL validator, and the client's own DNS
//! resolution is screened again at connect time by [`GuardedResolver`].

mod body;
pub mod resolver;

use std::error::Error as _;
use std::sync::Arc;

use reqwest::header::{
    ACCEPT, AUTHORIZATION, COOKIE, HeaderMap, LOCATION, PROXY_AUTHORIZATION, USER_AGENT,
};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

pub use body::decode_text;
pub use resolver::{ConnectBlocked, GuardedResolver};

use crate::config::FetchLimits;
use crate::validate::{
    DnsResolver, UrlValidator, ValidationResult, ViolationCode, redact_url_credentials,
};

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/feed+json, \
     application/json;q=0.9, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The URL, a redirect target, or the connected address failed validation.
    #[error("{0}")]
    Blocked(ValidationResult),

    #[error("too many redirects (max {max})")]
    RedirectLimitExceeded { max: usize },

    #[error("redirect without Location header")]
    MissingLocation,

    #[error("response too large (>{limit} bytes)")]
    TooLarge { limit: usize },

    #[error("fetch timed out")]
    Timeout,

    #[error("fetch failed: status {0}")]
    Status(u16),

    #[error("fetch failed: {0}")]
    Http(#[source] reqwest::Error),
}

impl FetchError {
    /// Validation failures are final; transport failures may succeed on retry.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Blocked(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        let mut source = e.source();
        while let Some(cause) = source {
            if cause.is::<ConnectBlocked>() {
                return Self::Blocked(ValidationResult::from_violation(
                    ViolationCode::DnsResolutionBlocked,
                ));
            }
            source = cause.source();
        }
        Self::Http(e)
    }
}

/// Decides whether a URL may be requested, returning the exact URL to use.
pub trait UrlGate: Send + Sync {
    fn admit(&self, url: &str) -> impl Future<Output = Result<Url, ValidationResult>> + Send;
}

impl<R: DnsResolver> UrlGate for UrlValidator<R> {
    async fn admit(&self, url: &str) -> Result<Url, ValidationResult> {
        self.check(url).await
    }
}

#[derive(Debug)]
pub struct FetchedFeed {
    /// URL of the final hop.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// Every URL that answered with a redirect, in order.
    pub redirects: Vec<String>,
    pub body: Vec<u8>,
}

impl FetchedFeed {
    pub fn text(&self) -> String {
        decode_text(&self.body, self.content_type.as_deref())
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// Build the client the gate uses: no automatic redirects, no proxies (a
/// proxy would resolve hosts outside the gate), and connect-time screening.
pub fn build_client(limits: &FetchLimits) -> Result<Client, FetchError> {
    Client::builder()
        .connect_timeout(limits.connect_timeout())
        .timeout(limits.request_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .dns_resolver(Arc::new(GuardedResolver))
        .build()
        .map_err(FetchError::Http)
}

pub struct SecureFetcher<G = UrlValidator> {
    http: Client,
    gate: G,
    limits: FetchLimits,
}

impl SecureFetcher {
    pub fn new(limits: FetchLimits) -> Result<Self, FetchError> {
        Ok(Self {
            http: build_client(&limits)?,
            gate: UrlValidator::new(),
            limits,
        })
    }
}

impl<G: UrlGate> SecureFetcher<G> {
    /// `http` should come from [`build_client`]; anything else loses the
    /// connect-time check.
    pub fn with_gate(http: Client, gate: G, limits: FetchLimits) -> Self {
        Self { http, gate, limits }
    }

    pub fn limits(&self) -> &FetchLimits {
        &self.limits
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        self.fetch_with_headers(url, HeaderMap::new()).await
    }

    /// `headers` override the defaults (e.g. `If-None-Match` for conditional
    /// refresh). Credentials among them are dropped once a redirect leaves
    /// the host and port they were sent to.
    pub async fn fetch_with_headers(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedFeed, FetchError> {
        let result = tokio::time::timeout(self.limits.max_duration(), self.follow(url, headers))
            .await
            .unwrap_or(Err(FetchError::Timeout));

        match &result {
            Ok(feed) => info!(
                url = %feed.url,
                status = feed.status,
                bytes = feed.body.len(),
                redirects = feed.redirects.len(),
                "feed fetched"
            ),
            Err(e) => {
                warn!(url = %redact_url_credentials(url), error = %e, "feed fetch failed")
            }
        }
        result
    }

    async fn follow(&self, url: &str, mut headers: HeaderMap) -> Result<FetchedFeed, FetchError> {
        let mut current = self.gate.admit(url).await.map_err(FetchError::Blocked)?;
        let mut redirects = Vec::new();

        loop {
            let response = self.send(&current, &headers).await?;
            let status = response.status();

            if is_followable_redirect(status) {
                if redirects.len() >= self.limits.max_redirects {
                    return Err(FetchError::RedirectLimitExceeded {
                        max: self.limits.max_redirects,
                    });
                }
                let next = redirect_target(&current, &response)?;
                debug!(
                    from = %current,
                    to = %redact_url_credentials(next.as_str()),
                    "following redirect"
                );
                let admitted = self.gate.admit(next.as_str()).await.map_err(|rejected| {
                    warn!(from = %current, "redirect target rejected");
                    FetchError::Blocked(rejected)
                })?;
                strip_credentials_across_hosts(&mut headers, &current, &admitted);
                redirects.push(current.to_string());
                current = admitted;
                continue;
            }

            if !status.is_success() && status != StatusCode::NOT_MODIFIED {
                return Err(FetchError::Status(status.as_u16()));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = body::read_limited(response, self.limits.max_response_bytes).await?;

            return Ok(FetchedFeed {
                url: current.to_string(),
                status: status.as_u16(),
                content_type,
                redirects,
                body,
            });
        }
    }

    async fn send(&self, url: &Url, headers: &HeaderMap) -> Result<Response, FetchError> {
        let response = self
            .http
            .get(url.clone())
            .header(USER_AGENT, &self.limits.user_agent)
            .header(ACCEPT, FEED_ACCEPT)
            .headers(headers.clone())
            .send()
            .await?;
        Ok(response)
    }
}

fn is_followable_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Same rule as reqwest's own redirect policy: a change of host or port
/// drops the caller's credentials for the rest of the chain.
fn strip_credentials_across_hosts(headers: &mut HeaderMap, from: &Url, to: &Url) {
    let same_host = from.host_str() == to.host_str()
        && from.port_or_known_default() == to.port_or_known_default();
    if !same_host {
        for name in [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION] {
            headers.remove(name);
        }
    }
}

/// Resolve `Location` (possibly relative) against the current hop.
fn redirect_target(current: &Url, response: &Response) -> Result<Url, FetchError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(FetchError::MissingLocation)?;
    current.join(location).map_err(|_| {
        FetchError::Blocked(ValidationResult::from_violation(
            ViolationCode::InvalidFormat,
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::{HeaderValue, IF_NONE_MATCH};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::validate::tests::{StaticDns, public_validator};

    /// Admits the mock server's origin as-is; everything else goes through a
    /// real validator whose DNS answers are public.
    struct MockOriginGate {
        origin: String,
        inner: UrlValidator<StaticDns>,
    }

    impl UrlGate for MockOriginGate {
        async fn admit(&self, url: &str) -> Result<Url, ValidationResult> {
            if url.starts_with(&self.origin) {
                return Url::parse(url)
                    .map_err(|_| ValidationResult::from_violation(ViolationCode::InvalidFormat));
            }
            self.inner.admit(url).await
        }
    }

    /// Only parses; leaves every host decision to the connect-time resolver.
    struct ParseOnlyGate;

    impl UrlGate for ParseOnlyGate {
        async fn admit(&self, url: &str) -> Result<Url, ValidationResult> {
            Url::parse(url)
                .map_err(|_| ValidationResult::from_violation(ViolationCode::InvalidFormat))
        }
    }

    fn parse_only_fetcher() -> SecureFetcher<ParseOnlyGate> {
        let limits = FetchLimits::default();
        SecureFetcher::with_gate(build_client(&limits).unwrap(), ParseOnlyGate, limits)
    }

    fn fetcher(server: &MockServer, limits: FetchLimits) -> SecureFetcher<MockOriginGate> {
        let gate = MockOriginGate {
            origin: server.uri(),
            inner: public_validator(),
        };
        SecureFetcher::with_gate(build_client(&limits).unwrap(), gate, limits)
    }

    fn redirect_to(location: &str) -> ResponseTemplate {
        ResponseTemplate::new(302).insert_header("Location", location)
    }

    #[tokio::test]
    async fn fetch_returns_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/rss+xml; charset=iso-8859-1")
                    .set_body_bytes(b"<rss>caf\xe9</rss>".to_vec()),
            )
            .mount(&server)
            .await;

        let feed = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/feed.xml", server.uri()))
            .await
            .unwrap();

        assert_eq!(feed.status, 200);
        assert!(feed.url.ends_with("/feed.xml"));
        assert!(feed.redirects.is_empty());
        assert_eq!(feed.text(), "<rss>café</rss>");
    }

    #[tokio::test]
    async fn sends_default_and_caller_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("user-agent", "reader-test/1.0"))
            .and(header("x-feed-id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let limits = FetchLimits {
            user_agent: "reader-test/1.0".to_string(),
            ..FetchLimits::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-feed-id", HeaderValue::from_static("42"));

        let feed = fetcher(&server, limits)
            .fetch_with_headers(&format!("{}/feed", server.uri()), headers)
            .await
            .unwrap();
        assert_eq!(feed.body, b"ok");
    }

    #[tokio::test]
    async fn not_modified_is_returned_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"v1\""));
        let feed = fetcher(&server, FetchLimits::default())
            .fetch_with_headers(&format!("{}/feed", server.uri()), headers)
            .await
            .unwrap();
        assert!(feed.is_not_modified());
        assert!(feed.body.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let limits = FetchLimits {
            max_response_bytes: 1024,
            ..FetchLimits::default()
        };
        let err = fetcher(&server, limits)
            .fetch(&format!("{}/huge", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn follows_relative_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(redirect_to("/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<feed/>"))
            .mount(&server)
            .await;

        let feed = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/old", server.uri()))
            .await
            .unwrap();
        assert!(feed.url.ends_with("/new"));
        assert_eq!(feed.redirects.len(), 1);
        assert!(feed.redirects[0].ends_with("/old"));
    }

    #[tokio::test]
    async fn redirect_chain_is_capped() {
        let server = MockServer::start().await;
        for hop in 0..4 {
            Mock::given(method("GET"))
                .and(path(format!("/r{hop}")))
                .respond_with(redirect_to(&format!("/r{}", hop + 1)))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/r4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fetcher(&server, FetchLimits::default());
        let err = f.fetch(&format!("{}/r0", server.uri())).await.unwrap_err();
        assert!(matches!(err, FetchError::RedirectLimitExceeded { max: 3 }));

        let feed = f.fetch(&format!("{}/r1", server.uri())).await.unwrap();
        assert_eq!(feed.redirects.len(), 3);
    }

    #[tokio::test]
    async fn redirect_to_metadata_endpoint_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jump"))
            .respond_with(redirect_to("http://169.254.169.254/latest/meta-data/"))
            .mount(&server)
            .await;

        let err = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/jump", server.uri()))
            .await
            .unwrap_err();
        match err {
            FetchError::Blocked(result) => {
                assert!(result.has(ViolationCode::PrivateIp));
                assert!(!err_message_leaks(&result));
            }
            other => panic!("expected Blocked, got: {other:?}"),
        }
    }

    fn err_message_leaks(result: &ValidationResult) -> bool {
        result.message().contains("169.254") || result.message().contains("meta-data")
    }

    #[tokio::test]
    async fn redirect_to_other_scheme_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jump"))
            .respond_with(redirect_to("file:///etc/passwd"))
            .mount(&server)
            .await;

        let err = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/jump", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(&err, FetchError::Blocked(r) if r.has(ViolationCode::InvalidScheme)));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn redirect_without_location_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bare"))
            .respond_with(ResponseTemplate::new(301))
            .mount(&server)
            .await;

        let err = fetcher(&server, FetchLimits::default())
            .fetch(&format!("{}/bare", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingLocation));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let limits = FetchLimits {
            request_timeout_secs: 1,
            ..FetchLimits::default()
        };
        let err = fetcher(&server, limits)
            .fetch(&format!("{}/slow", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[tokio::test]
    async fn credentials_are_dropped_on_cross_host_redirect() {
        let origin = MockServer::start().await;
        let other = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(redirect_to(&format!("{}/feed", other.uri())))
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<feed/>"))
            .mount(&other)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert(COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert("x-feed-id", HeaderValue::from_static("42"));

        let feed = parse_only_fetcher()
            .fetch_with_headers(&format!("{}/start", origin.uri()), headers)
            .await
            .unwrap();
        assert_eq!(feed.redirects.len(), 1);

        let first = origin.received_requests().await.unwrap();
        assert!(first[0].headers.contains_key("authorization"));

        let requests = other.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
        assert!(!requests[0].headers.contains_key("cookie"));
        assert!(requests[0].headers.contains_key("x-feed-id"));
    }

    #[tokio::test]
    async fn credentials_survive_same_host_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(redirect_to("/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<feed/>"))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let feed = fetcher(&server, FetchLimits::default())
            .fetch_with_headers(&format!("{}/old", server.uri()), headers)
            .await
            .unwrap();
        assert!(feed.url.ends_with("/new"));
    }

    #[tokio::test]
    async fn validation_and_fetch_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}

        let validator = public_validator();
        let validating = validator.validate("https://example.com/");
        assert_send(&validating);

        let fetcher = parse_only_fetcher();
        let fetching = fetcher.fetch("https://example.com/");
        assert_send(&fetching);
    }

    #[tokio::test]
    async fn connect_time_resolution_refuses_loopback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("internal"))
            .mount(&server)
            .await;

        let url = format!("http://localhost:{}/", server.address().port());
        let err = parse_only_fetcher().fetch(&url).await.unwrap_err();
        match &err {
            FetchError::Blocked(result) => {
                assert!(result.has(ViolationCode::DnsResolutionBlocked));
            }
            other => panic!("expected Blocked, got: {other:?}"),
        }
        assert!(!err.is_transport());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn private_literal_is_blocked_before_any_request() {
        let fetcher = SecureFetcher::new(FetchLimits::default()).unwrap();
        let err = fetcher.fetch("http://127.0.0.1/secret").await.unwrap_err();
        assert!(matches!(&err, FetchError::Blocked(r) if r.has(ViolationCode::PrivateIp)));
    }

    #[tokio::test]
    async fn mock_server_is_blocked_by_default_gate() {
        let server = MockServer::start().await;
        let fetcher = SecureFetcher::new(FetchLimits::default()).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
