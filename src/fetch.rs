use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("gigsync/0.1 (+https://github.com/gigsync/gigsync)")
        .build()
        .expect("http client")
});

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(10);
const DEFAULT_BREAKER_THRESHOLD: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure on the final attempt.
    #[error("request failed for {url}: {reason}")]
    Transient { url: String, reason: String },
    /// Terminal non-success status (4xx other than 404/429).
    #[error("status {status} for {url}")]
    Status { status: u16, url: String },
    /// 404: definitive, never retried.
    #[error("not found: {0}")]
    NotFound(String),
    /// The per-run circuit breaker tripped; the call was not attempted.
    #[error("circuit open, sub-fetch abandoned")]
    CircuitOpen,
    /// Retry budget exhausted on retryable conditions.
    #[error("unavailable after {attempts} attempts: {url}")]
    Unavailable { attempts: u32, url: String },
}

impl FetchError {
    /// A 404 means "the item is definitively absent", which some callers
    /// treat as an answer rather than an error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

/// Exponential backoff schedule: floor doubling per attempt up to a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            floor: DEFAULT_BACKOFF_FLOOR,
            ceiling: DEFAULT_BACKOFF_CEILING,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .floor
            .checked_mul(1u32 << attempt.saturating_sub(1).min(16))
            .unwrap_or(self.ceiling);
        doubled.min(self.ceiling)
    }
}

/// Consecutive-failure trip wire for adapters fanning out into many
/// dependent sub-fetches. Scoped to one adapter run; never auto-closes.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold && !self.open.swap(true, Ordering::Relaxed) {
            warn!(failures, "circuit breaker opened, abandoning remaining sub-fetches");
        }
    }
}

/// Per-adapter-run fetch session: admission gate, retry with backoff, and a
/// circuit breaker, all owned exclusively by one adapter invocation.
pub struct Fetcher {
    gate: Semaphore,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Fetcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            gate: Semaphore::new(concurrency),
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::new(DEFAULT_BREAKER_THRESHOLD),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker = CircuitBreaker::new(threshold);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn client(&self) -> &'static Client {
        &CLIENT
    }

    /// Runs one outbound call through the gate with retry. `build` is invoked
    /// once per attempt because a `RequestBuilder` is consumed on send.
    pub async fn execute<F>(&self, url: &str, build: F) -> Result<Response, FetchError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        if self.breaker.is_open() {
            return Err(FetchError::CircuitOpen);
        }

        let _permit = self.gate.acquire().await.expect("fetch gate closed");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match build(&CLIENT).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success();
                        return Ok(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        // Definitive answer; does not count against the breaker.
                        return Err(FetchError::NotFound(url.to_string()));
                    }
                    if !retryable_status(status) {
                        self.breaker.record_failure();
                        return Err(FetchError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    debug!(%url, %status, attempt, "retryable status");
                }
                Err(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                    debug!(%url, error = %err, attempt, "transient transport error");
                }
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(FetchError::Transient {
                        url: url.to_string(),
                        reason: err.to_string(),
                    });
                }
            }

            if attempt >= self.retry.max_attempts {
                self.breaker.record_failure();
                return Err(FetchError::Unavailable {
                    attempts: attempt,
                    url: url.to_string(),
                });
            }
            sleep(self.retry.delay(attempt)).await;
        }
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.execute(url, |client| client.get(url)).await?;
        response.text().await.map_err(|err| FetchError::Transient {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let response = self.execute(url, |client| client.get(url)).await?;
        response.json().await.map_err(|err| FetchError::Transient {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
