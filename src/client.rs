//! HTTP client module for fetching temperature readings from the Nature Remo API.
//!
//! This module provides the single-attempt client, the classification of
//! failures into retryable and fatal outcomes, and the retry loop with
//! exponential backoff that drives it.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::{Config, Credential};

/// Delay before the first retry; doubles for each following retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Longest server-requested wait that is honored.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Response bodies are cut to this many characters inside error messages.
const MAX_BODY_IN_ERROR: usize = 200;

/// Errors that can occur while fetching a reading.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The API rejected the credential
    #[error("Authentication failed ({status}): invalid or expired API token")]
    Authentication { status: StatusCode },

    /// The API asked us to slow down
    #[error("Rate limited by API{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Server returned a 5xx status code
    #[error("Server error ({status}): {body}")]
    Server { status: StatusCode, body: String },

    /// Server returned a non-retryable status code
    #[error("Client error ({status}): {body}")]
    Client { status: StatusCode, body: String },

    /// Request timeout
    #[error("Request timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },

    /// Connection failed or was reset
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be understood
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// All retry attempts exhausted
    #[error("All {attempts} attempts exhausted. Last error: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<FetchError>,
    },

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

impl FetchError {
    /// Server-supplied wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Name of the failure class, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Authentication { .. } => "AuthenticationFailure",
            FetchError::RateLimited { .. } => "RateLimited",
            FetchError::Server { .. } => "ServerError",
            FetchError::Client { .. } => "ClientError",
            FetchError::Timeout { .. } => "Timeout",
            FetchError::Network(_) => "NetworkError",
            FetchError::MalformedResponse(_) => "MalformedResponse",
            FetchError::Exhausted { .. } => "RetriesExhausted",
            FetchError::Config(_) => "ClientConfigError",
        }
    }
}

/// Result of one attempt, tagged with whether another attempt may help.
#[derive(Debug)]
pub enum Attempt<T> {
    Ok(T),
    Retryable(FetchError),
    Fatal(FetchError),
}

/// Unvalidated reading extracted from the API payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    /// Temperature in Celsius
    pub value: f64,

    /// Time the sensor event was recorded, when the API reports it
    pub observed_at: Option<String>,
}

/// Something that can make one attempt at producing a reading.
pub trait ReadingSource {
    fn fetch_once(&self) -> impl Future<Output = Attempt<RawReading>>;
}

/// Backoff schedule for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry - 1).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Delay before retry number `retry`, honoring a server hint when present.
    pub fn delay_for(&self, retry: u32, cause: &FetchError) -> Duration {
        match cause.retry_after() {
            Some(hint) => hint.min(MAX_RETRY_AFTER),
            None => self.backoff_delay(retry),
        }
    }

    /// Drive `op` until it succeeds, fails fatally, or the budget runs out.
    ///
    /// Emits one log line per attempt with the attempt number and the delay
    /// that preceded it.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut delay = Duration::ZERO;
        let mut attempt = 1;

        loop {
            match op().await {
                Attempt::Ok(value) => {
                    info!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt succeeded"
                    );
                    return Ok(value);
                }
                Attempt::Fatal(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = e.kind(),
                        error = %e,
                        "Attempt failed with non-retryable error"
                    );
                    return Err(e);
                }
                Attempt::Retryable(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = e.kind(),
                        error = %e,
                        "Attempt failed with retryable error"
                    );

                    if attempt >= max_attempts {
                        return Err(FetchError::Exhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }

                    delay = self.delay_for(attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Wraps a [`ReadingSource`] with the retry policy.
pub struct RetryingFetcher<S> {
    source: S,
    policy: RetryPolicy,
    span: Span,
}

impl<S: ReadingSource> RetryingFetcher<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            span: info_span!("fetcher", component = "fetcher"),
        }
    }

    /// Fetch the freshest reading, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the fatal error as-is, or `FetchError::Exhausted` carrying the
    /// last retryable cause once the budget is spent.
    pub async fn fetch(&self) -> Result<RawReading, FetchError> {
        let source = &self.source;
        self.policy
            .run(move || source.fetch_once())
            .instrument(self.span.clone())
            .await
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

/// Device list entry as returned by `GET /1/devices`.
#[derive(Debug, Deserialize)]
struct Device {
    newest_events: NewestEvents,
}

#[derive(Debug, Deserialize)]
struct NewestEvents {
    /// Temperature event
    te: Option<SensorEvent>,
}

#[derive(Debug, Deserialize)]
struct SensorEvent {
    val: f64,
    #[serde(default)]
    created_at: Option<String>,
}

/// Extract the first device's newest temperature event from a devices payload.
///
/// # Errors
///
/// Returns `FetchError::MalformedResponse` if the body is not JSON, has no
/// devices, lacks a temperature event, or the value is not a number.
pub fn extract_reading(body: &str) -> Result<RawReading, FetchError> {
    // Only the first device has to match the expected shape
    let devices: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("unexpected devices payload: {}", e)))?;

    let first = devices
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::MalformedResponse("no devices found in API response".to_string()))?;
    let device: Device = serde_json::from_value(first)
        .map_err(|e| FetchError::MalformedResponse(format!("unexpected device data: {}", e)))?;

    let event = device.newest_events.te.ok_or_else(|| {
        FetchError::MalformedResponse("no temperature event in device data".to_string())
    })?;

    Ok(RawReading {
        value: event.val,
        observed_at: event.created_at,
    })
}

/// Classify a completed HTTP exchange.
pub fn classify_response(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Attempt<RawReading> {
    if status.is_success() {
        return match extract_reading(body) {
            Ok(reading) => Attempt::Ok(reading),
            Err(e) => Attempt::Fatal(e),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Attempt::Fatal(FetchError::Authentication { status })
        }
        StatusCode::TOO_MANY_REQUESTS => Attempt::Retryable(FetchError::RateLimited { retry_after }),
        s if s.is_server_error() => Attempt::Retryable(FetchError::Server {
            status,
            body: truncate_body(body),
        }),
        _ => Attempt::Fatal(FetchError::Client {
            status,
            body: truncate_body(body),
        }),
    }
}

/// Read a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored and the regular schedule applies.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_BODY_IN_ERROR {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_BODY_IN_ERROR).collect();
        format!("{}...", cut)
    }
}

/// HTTP client for the Nature Remo devices endpoint.
///
/// Each call to [`ReadingSource::fetch_once`] performs exactly one
/// authenticated request bounded by the configured timeout.
pub struct NatureRemoClient {
    /// The underlying HTTP client
    client: Client,

    /// URL for the devices endpoint
    devices_url: String,

    /// Bearer token; only exposed when building the request
    credential: Credential,

    /// Request timeout duration
    timeout: Duration,
}

impl NatureRemoClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Self::with_settings(
            config.devices_url.clone(),
            config.credential.clone(),
            config.request_timeout,
        )
    }

    /// Create a new client with custom settings.
    pub fn with_settings(
        devices_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Config(e.to_string()))?;

        Ok(Self::with_http_client(client, devices_url, credential, timeout))
    }

    /// Create a client around an already configured `reqwest::Client`.
    ///
    /// `timeout` is only used to describe timeout errors; the request timeout
    /// itself is whatever `client` was built with.
    pub fn with_http_client(
        client: Client,
        devices_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            devices_url: devices_url.into(),
            credential,
            timeout,
        }
    }

    /// Get the configured devices URL.
    pub fn devices_url(&self) -> &str {
        &self.devices_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn classify_transport_error(&self, err: reqwest::Error) -> Attempt<RawReading> {
        // Drop the URL so nothing request-specific ends up in logs
        let err = err.without_url();
        if err.is_timeout() {
            Attempt::Retryable(FetchError::Timeout {
                timeout: self.timeout,
            })
        } else if err.is_decode() {
            Attempt::Fatal(FetchError::MalformedResponse(err.to_string()))
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Attempt::Retryable(FetchError::Network(err.to_string()))
        } else {
            Attempt::Fatal(FetchError::Network(err.to_string()))
        }
    }
}

impl ReadingSource for NatureRemoClient {
    async fn fetch_once(&self) -> Attempt<RawReading> {
        debug!(url = %self.devices_url, "Sending request");

        let response = match self
            .client
            .get(&self.devices_url)
            .bearer_auth(self.credential.expose())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return self.classify_transport_error(e),
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        debug!(status = status.as_u16(), "Received response");

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return self.classify_transport_error(e),
        };

        classify_response(status, retry_after, &body)
    }
}
