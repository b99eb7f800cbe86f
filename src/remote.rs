//! # Remote calls
//!
//! Plumbing shared by the embedding and generation clients: credential rotation, retry with
//! exponential backoff, and a per-call timeout around an OpenAI-compatible JSON endpoint.
//!
//! ## Credential rotation
//! [`CredentialPool`] picks a credential from the wall clock: the time is cut into windows of
//! `window` seconds and the window number (plus the retry attempt) is taken modulo the pool
//! size. Separate processes therefore spread load over the pool without talking to each
//! other. This is a best-effort quota-spreading heuristic, not a correctness mechanism: a
//! credential whose quota is exhausted keeps being picked for first attempts until its window
//! rotates out, and only the retry moves on to the next one.
//!
//! ## Failure classes
//! Network errors, timeouts, HTTP 408, 429 and 5xx are transient and retried. Any other
//! non-success status and undecodable bodies are permanent and returned at once.

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered set of API credentials, selected by time bucket.
#[derive(Clone, Default)]
pub struct CredentialPool {
    credentials: Vec<String>,
    window_secs: u64,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credentials", &self.credentials.len())
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl CredentialPool {
    pub fn new(credentials: Vec<String>, window: Duration) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .filter(|c| !c.trim().is_empty())
                .collect(),
            window_secs: window.as_secs().max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Index of the credential to use at `unix_secs` for retry `attempt`.
    ///
    /// Pure function of its inputs; `None` for an empty pool.
    pub fn index_at(&self, unix_secs: i64, attempt: u32) -> Option<usize> {
        if self.credentials.is_empty() {
            return None;
        }
        let bucket = unix_secs.max(0) as u64 / self.window_secs;
        let n = self.credentials.len() as u64;
        Some(((bucket % n + u64::from(attempt) % n) % n) as usize)
    }

    pub fn select(&self, unix_secs: i64, attempt: u32) -> Option<(usize, &str)> {
        self.index_at(unix_secs, attempt)
            .map(|index| (index, self.credentials[index].as_str()))
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(4))
    }
}

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
enum AttemptError {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent(String),
}

/// Final failure after retries, handed to the client to map into its own error.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub attempts: u32,
    pub reason: String,
}

/// JSON-over-HTTP client with credential rotation, retry and timeout.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialPool,
    retry: RetryPolicy,
    timeout: Duration,
    clock: fn() -> i64,
}

fn wall_clock() -> i64 {
    Utc::now().timestamp()
}

impl RemoteClient {
    pub fn new(
        base_url: &str,
        credentials: CredentialPool,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            retry,
            timeout,
            clock: wall_clock,
        }
    }

    /// Replace the wall clock used for credential selection.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// POST `body` to `{base_url}/{endpoint}` and decode the JSON answer.
    pub async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> Result<R, RemoteFailure>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut attempt = 0u32;

        loop {
            let credential = self.credentials.select((self.clock)(), attempt);
            match self.attempt(&url, credential.map(|(_, key)| key), body).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Permanent(reason)) => {
                    warn!("{} failed permanently: {}", url, reason);
                    return Err(RemoteFailure {
                        attempts: attempt + 1,
                        reason,
                    });
                }
                Err(AttemptError::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= self.retry.max_retries {
                        warn!(
                            "{} failed after {} attempt(s): {}",
                            url,
                            attempt + 1,
                            reason
                        );
                        return Err(RemoteFailure {
                            attempts: attempt + 1,
                            reason,
                        });
                    }

                    let delay = retry_after
                        .map(|d| d.min(self.retry.max_delay))
                        .unwrap_or_else(|| self.retry.delay_for(attempt));
                    warn!(
                        "{} attempt {} with credential #{} failed ({}), retrying in {:?}",
                        url,
                        attempt + 1,
                        credential.map(|(index, _)| index).unwrap_or_default(),
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt<B, R>(
        &self,
        url: &str,
        credential: Option<&str>,
        body: &B,
    ) -> Result<R, AttemptError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(url).timeout(self.timeout).json(body);
        if let Some(key) = credential {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| AttemptError::Transient {
            reason: if e.is_timeout() {
                format!("timed out after {:?}", self.timeout)
            } else {
                e.to_string()
            },
            retry_after: None,
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {}", truncate(&text, 200));

            return Err(
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
                {
                    AttemptError::Transient {
                        reason,
                        retry_after,
                    }
                } else {
                    AttemptError::Permanent(reason)
                },
            );
        }

        let bytes = response.bytes().await.map_err(|e| AttemptError::Transient {
            reason: e.to_string(),
            retry_after: None,
        })?;
        debug!("{} answered {} bytes", url, bytes.len());
        serde_json::from_slice(&bytes)
            .map_err(|e| AttemptError::Permanent(format!("malformed response: {e}")))
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
