//! Throttled HTTP client shared by the API connectors.

use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    /// Credentials were rejected; retrying cannot help.
    Unauthorized,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::Unauthorized
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Like [`classify_status`], but a 403 that reports an exhausted rate limit
/// is a throttle signal rather than an authorization failure.
fn classify_response(status: StatusCode, headers: &HeaderMap) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN && header_u64(headers, "x-ratelimit-remaining") == Some(0) {
        return RetryDisposition::Retryable;
    }
    classify_status(status)
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Delay requested by a `Retry-After` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, "retry-after").map(Duration::from_secs)
}

/// Time to hold further requests when the upstream reports that fewer than
/// `floor` requests remain in the current window. The reset header is read
/// as unix epoch seconds; the wait is capped at `cap`.
pub fn rate_limit_wait(
    headers: &HeaderMap,
    floor: u64,
    now: DateTime<Utc>,
    cap: Duration,
) -> Option<Duration> {
    let remaining = header_u64(headers, "x-ratelimit-remaining")?;
    if remaining >= floor {
        return None;
    }
    let reset = header_u64(headers, "x-ratelimit-reset")? as i64;
    let wait_secs = (reset - now.timestamp() + 1).max(1) as u64;
    Some(Duration::from_secs(wait_secs).min(cap))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between consecutive requests of one fetcher.
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Requests left in the upstream window below which the fetcher pauses.
    pub rate_limit_floor: u64,
    pub max_rate_limit_wait: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            min_interval: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
            rate_limit_floor: 10,
            max_rate_limit_wait: Duration::from_secs(900),
        }
    }
}

/// Spaces requests at least `min_interval` apart and honors holds requested
/// by upstream rate-limit signals.
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ThrottleState {
    next_allowed: Option<Instant>,
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub async fn wait(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            match state.next_allowed {
                Some(at) if at > now => {
                    let sleep_for = at - now;
                    drop(state);
                    tokio::time::sleep(sleep_for).await;
                }
                _ => {
                    state.next_allowed = Some(now + self.min_interval);
                    return;
                }
            }
        }
    }

    /// Holds the next request for at least `wait`. Never shortens an
    /// existing hold.
    pub async fn hold_for(&self, wait: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + wait;
        if state.next_allowed.map_or(true, |at| until > at) {
            state.next_allowed = Some(until);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json: Option<JsonValue>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            json: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("credentials rejected (http status {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Failures a later run may not see again: network trouble, throttling
    /// and upstream server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Unauthorized { .. } | FetchError::Decode { .. } => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: RequestThrottle,
    backoff: BackoffPolicy,
    rate_limit_floor: u64,
    max_rate_limit_wait: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            throttle: RequestThrottle::new(config.min_interval),
            backoff: config.backoff,
            rate_limit_floor: config.rate_limit_floor,
            max_rate_limit_wait: config.max_rate_limit_wait,
        })
    }

    pub async fn send(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, method = %request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            self.throttle.wait().await;

            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.json {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let headers = resp.headers().clone();

                    if let Some(wait) = rate_limit_wait(
                        &headers,
                        self.rate_limit_floor,
                        Utc::now(),
                        self.max_rate_limit_wait,
                    ) {
                        warn!(wait_secs = wait.as_secs(), "upstream rate limit nearly exhausted");
                        self.throttle.hold_for(wait).await;
                    }

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            headers,
                            body,
                        });
                    }

                    match classify_response(status, &headers) {
                        RetryDisposition::Unauthorized => {
                            return Err(FetchError::Unauthorized {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                            let delay = retry_after(&headers)
                                .map(|d| d.min(self.max_rate_limit_wait))
                                .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                            debug!(status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "retrying");
                            self.throttle.hold_for(delay).await;
                            attempt += 1;
                            continue;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
