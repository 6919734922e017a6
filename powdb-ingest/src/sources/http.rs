//! HTTP transport shared by the source adapters
//!
//! Rate limiting, bounded retry with exponential backoff, and status code
//! classification:
//! - 2xx: body returned
//! - 429 / 5xx / network errors: retried, then `SourceUnavailable`
//! - any other status: `SourceQueryRejected`, never retried

use crate::config::QueryLimits;
use crate::error::{snippet, SourceError, SourceResult};
use crate::types::SourceId;
use governor::{Quota, RateLimiter};
use powdb_common::human_size::format_bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("powdata/", env!("CARGO_PKG_VERSION"));

/// Grace period on top of the server-side query timeout
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Upper bound for a server-provided Retry-After
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Successful response body
#[derive(Debug, Clone)]
pub struct HttpBody {
    pub text: String,
    pub elapsed: Duration,
}

impl HttpBody {
    pub fn bytes(&self) -> u64 {
        self.text.len() as u64
    }
}

/// Per-source HTTP client
pub struct HttpTransport {
    client: Client,
    source_id: SourceId,
    rate_limiter: DirectRateLimiter,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpTransport {
    pub fn new(source_id: SourceId, limits: &QueryLimits) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(limits.timeout() + CLIENT_TIMEOUT_GRACE)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SourceError::SourceUnavailable {
                source_id: source_id.clone(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let per_second = NonZeroU32::new(limits.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            source_id,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            max_attempts: limits.max_attempts.max(1),
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// Override the first retry delay (doubles on each further retry)
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send a request built by `build`, retrying transient failures
    ///
    /// `build` is called once per attempt.
    pub async fn send<F>(&self, build: F) -> SourceResult<HttpBody>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let started = Instant::now();
        let mut backoff = self.initial_backoff;
        let mut last_failure = String::new();

        for attempt in 1..=self.max_attempts {
            self.rate_limiter.until_ready().await;

            let wait = match build(&self.client).send().await {
                Ok(response) if response.status().is_success() => {
                    let text = response.text().await.map_err(|e| self.unavailable(e))?;
                    debug!(
                        source = %self.source_id,
                        size = %format_bytes(text.len() as u64),
                        attempt,
                        "Response received"
                    );
                    return Ok(HttpBody {
                        text,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(response) if is_transient(response.status()) => {
                    let status = response.status();
                    last_failure = format!("HTTP {}", status);
                    retry_after(&response).unwrap_or(backoff)
                }
                Ok(response) => return Err(self.rejected(response).await),
                Err(e) => {
                    last_failure = e.to_string();
                    backoff
                }
            };

            if attempt < self.max_attempts {
                warn!(
                    source = %self.source_id,
                    "Retry {}/{} in {:?} ({})",
                    attempt,
                    self.max_attempts - 1,
                    wait,
                    last_failure
                );
                tokio::time::sleep(wait).await;
                backoff = next_backoff(backoff);
            }
        }

        Err(SourceError::SourceUnavailable {
            source_id: self.source_id.clone(),
            message: format!(
                "{} after {} attempt(s)",
                last_failure, self.max_attempts
            ),
        })
    }

    fn unavailable(&self, e: reqwest::Error) -> SourceError {
        SourceError::SourceUnavailable {
            source_id: self.source_id.clone(),
            message: format!("Failed to read response body: {}", e),
        }
    }

    async fn rejected(&self, response: Response) -> SourceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        SourceError::SourceQueryRejected {
            source_id: self.source_id.clone(),
            status: Some(status.as_u16()),
            message: if body.trim().is_empty() {
                status.to_string()
            } else {
                snippet(body.trim())
            },
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Doubled retry delay, saturating instead of overflowing
fn next_backoff(backoff: Duration) -> Duration {
    backoff.saturating_mul(2)
}

/// Retry-After in seconds, capped
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}
