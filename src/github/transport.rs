// src/github/transport.rs
// =============================================================================
// The one place that sends HTTP requests.
//
// Every API call and every file download goes through `Transport`, which:
// - Adds the optional "Authorization: Bearer <token>" header
// - Retries transient failures with exponential backoff
//   (timeouts, connection errors, HTTP 429/502/503/504)
// - Gives up on a server that never sends response headers
// - Stops waiting as soon as the user cancels (Ctrl-C)
// - Turns GitHub API error statuses into errors a user can act on
//
// One Transport is built in main.rs and shared (behind an Arc) by the
// listing resolver and all download workers, so they share one connection
// pool.
//
// Rust concepts:
// - tokio::select!: wait for whichever of two futures finishes first
// - Generic functions: api_get::<T>() decodes any JSON shape we ask for
// =============================================================================

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::Endpoints;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("tree-fetch/", env!("CARGO_PKG_VERSION"));
const API_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a file request may sit silent.
///
/// `response` bounds the wait for status line and headers, `idle` bounds
/// the gap between two body chunks (applied by the fetcher while streaming).
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub response: Duration,
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(10),
            idle: Duration::from_secs(30),
        }
    }
}

/// Bounded exponential backoff: base, 2x base, 4x base, ... capped at max.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

pub struct Transport {
    client: Client,
    token: Option<String>,
    endpoints: Endpoints,
    retry: RetryPolicy,
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(
        endpoints: Endpoints,
        token: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        // No overall timeout on the client: large files can legitimately take
        // longer than any fixed limit. Headers and body gaps are bounded by
        // `Timeouts` instead, API calls also set a total timeout below.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            token: token.filter(|t| !t.is_empty()),
            endpoints,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            cancel,
        })
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[cfg(test)]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    /// GET with retry. The caller decides what a non-200 status means.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send_with_retry(url, || self.request(Method::GET, url))
            .await
    }

    /// HEAD with retry.
    pub async fn head(&self, url: &str) -> Result<Response> {
        self.send_with_retry(url, || self.request(Method::HEAD, url))
            .await
    }

    /// GET `{api}/{path}` and decode the JSON body.
    ///
    /// 404 becomes `Error::NotFound`, which the listing resolver relies on to
    /// detect branch names containing slashes.
    pub async fn api_get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.endpoints.api, path.trim_start_matches('/'));

        let response = self
            .send_with_retry(&url, || {
                self.request(Method::GET, &url)
                    .header(ACCEPT, "application/vnd.github+json")
                    .timeout(API_TIMEOUT)
            })
            .await?;

        check_api_status(response.status(), response.headers(), &url)?;

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode {
            url,
            message: e.to_string(),
        })
    }

    // Sends a freshly built request per attempt. Cancellation is checked
    // before each attempt and during the backoff sleep. An attempt whose
    // headers don't arrive within `timeouts.response` counts as transient.
    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            trace!(url, retry, "sending request");
            let attempt = tokio::time::timeout(self.timeouts.response, build().send()).await;

            let (reason, outcome) = match attempt {
                Ok(Ok(response)) if is_retryable_status(response.status()) => {
                    let reason = format!("HTTP {}", response.status().as_u16());
                    (Some(reason), Ok(response))
                }
                Ok(Ok(response)) => (None, Ok(response)),
                Ok(Err(e)) if is_retryable_error(&e) => (Some(e.to_string()), Err(Error::from(e))),
                Ok(Err(e)) => (None, Err(Error::from(e))),
                Err(_) => (
                    Some("no response headers".to_string()),
                    Err(Error::Timeout {
                        url: url.to_string(),
                        after: self.timeouts.response,
                    }),
                ),
            };

            match reason {
                Some(reason) if retry < self.retry.max_retries => {
                    drop(outcome);
                    let delay = self.retry.delay(retry);
                    debug!(url, retry = retry + 1, ?delay, %reason, "transient failure, retrying");

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry += 1;
                }
                // Out of retries: hand back the last response or error so
                // the caller reports the real status.
                _ => return outcome,
            }
        }
    }
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

// Maps GitHub API error statuses to our error kinds.
fn check_api_status(status: StatusCode, headers: &HeaderMap, url: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    match status {
        StatusCode::FORBIDDEN => {
            if header_value(headers, "x-ratelimit-remaining").as_deref() == Some("0") {
                let reset = header_value(headers, "x-ratelimit-reset")
                    .unwrap_or_else(|| "unknown".to_string());
                Err(Error::RateLimited { reset })
            } else {
                Err(Error::Forbidden)
            }
        }
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RetryAfter {
            seconds: header_value(headers, "retry-after").unwrap_or_else(|| "unknown".to_string()),
        }),
        StatusCode::UNAUTHORIZED => Err(Error::InvalidToken),
        StatusCode::NOT_FOUND => Err(Error::NotFound {
            resource: url.to_string(),
        }),
        other => Err(Error::HttpStatus {
            status: other.as_u16(),
            url: url.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn transport_for(server: &MockServer, token: Option<&str>) -> Transport {
        let endpoints = Endpoints {
            api: server.uri(),
            raw: server.uri(),
            media: server.uri(),
        };
        Transport::new(endpoints, token.map(String::from), CancellationToken::new())
            .unwrap()
            .with_retry_policy(fast_retry())
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
        assert_eq!(policy.delay(100), Duration::from_secs(10));
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [429, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404, 500] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn test_check_api_status_rate_limit() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1700000000".parse().unwrap());

        let err = check_api_status(StatusCode::FORBIDDEN, &headers, "u").unwrap_err();
        assert!(matches!(err, Error::RateLimited { ref reset } if reset == "1700000000"));

        let err = check_api_status(StatusCode::FORBIDDEN, &HeaderMap::new(), "u").unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[test]
    fn test_check_api_status_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "60".parse().unwrap());

        let err = check_api_status(StatusCode::TOO_MANY_REQUESTS, &headers, "u").unwrap_err();
        assert!(matches!(err, Error::RetryAfter { ref seconds } if seconds == "60"));
    }

    #[tokio::test]
    async fn test_retries_transient_status_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"private": false})))
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        let value: serde_json::Value = transport.api_get("repos/o/r").await.unwrap();

        assert_eq!(value["private"], false);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        let result: Result<serde_json::Value> = transport.api_get("repos/o/r").await;

        assert!(matches!(result, Err(Error::HttpStatus { status: 502, .. })));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        let result: Result<serde_json::Value> = transport.api_get("repos/o/r").await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server, Some("secret-token"));
        let response = transport
            .get(&format!("{}/file.txt", server.uri()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let endpoints = Endpoints {
            api: server.uri(),
            raw: server.uri(),
            media: server.uri(),
        };
        let transport = Transport::new(endpoints, None, cancel.clone())
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            });

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = transport.get(&format!("{}/slow", server.uri())).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn short_timeouts() -> Timeouts {
        Timeouts {
            response: Duration::from_millis(200),
            idle: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_slow_headers_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
            .mount(&server)
            .await;

        let transport = transport_for(&server, None).with_timeouts(short_timeouts());
        let response = transport
            .get(&format!("{}/slow.bin", server.uri()))
            .await
            .unwrap();

        assert_eq!(response.text().await.unwrap(), "finally");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stalled_server_becomes_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
            .mount(&server)
            .await;

        let transport = transport_for(&server, None).with_timeouts(short_timeouts());
        let started = Instant::now();
        let result = transport.get(&format!("{}/stuck.bin", server.uri())).await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        // 4 attempts x 200ms plus tiny backoffs
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_send_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        transport.cancel_token().cancel();

        let result = transport.get(&format!("{}/x", server.uri())).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
