//! HTTP client for the upstream catalog API with request pacing, bounded
//! retry and unbounded rate-limit backoff.
//!
//! The upstream has no SLA and rate-limits aggressively. Every request is
//! paced through a rate limiter so the normal case stays under the threshold;
//! a 429 anyway triggers a long cooldown that does not consume a retry,
//! because rate limiting is expected to clear where a genuine outage is not.

use anyhow::{anyhow, Context, Result};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// The upstream rejects non-browser clients, so we present a browser UA.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    /// Minimum spacing between requests, applied before every send.
    pub request_pacing_ms: u64,
    /// Total attempts for a failing request (not counting rate-limit waits).
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Cooldown after a 429, as a multiple of `retry_delay_ms`.
    pub rate_limit_cooldown_factor: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            timeout_seconds: 30,
            request_pacing_ms: 1_500,
            retry_count: 3,
            retry_delay_ms: 2_000,
            rate_limit_cooldown_factor: 10,
        }
    }
}

/// Paced JSON fetcher shared by every phase of the pipeline.
pub struct PacedClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl PacedClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        let period = Duration::from_millis(config.request_pacing_ms.max(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| anyhow!("Request pacing must be greater than 0"))?;
        let rate_limiter = RateLimiter::direct(quota);

        Ok(Self { client, rate_limiter, config })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Fetch a JSON resource with the configured retry budget.
    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        self.fetch_json_with_retry(url, self.config.retry_count).await
    }

    /// Fetch a JSON resource, making at most `retries` attempts.
    ///
    /// A 429 response waits out the cooldown and retries without consuming an
    /// attempt. Any other failure (network error, non-2xx status, body that is
    /// not JSON) consumes one attempt; once the budget is spent the last error
    /// propagates to the caller.
    pub async fn fetch_json_with_retry(
        &self,
        url: &str,
        retries: u32,
    ) -> Result<serde_json::Value> {
        let retries = retries.max(1);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let cooldown = retry_delay * self.config.rate_limit_cooldown_factor;
        let mut attempts_left = retries;

        loop {
            self.rate_limiter.until_ready().await;
            debug!("Fetching {url} ({attempts_left} attempts left)");

            let error = match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!("Rate limited by upstream on {url}, cooling down {cooldown:?}");
                    tokio::time::sleep(cooldown).await;
                    continue;
                }
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .with_context(|| format!("Invalid JSON body from {url}"));
                }
                Ok(response) => anyhow!("HTTP {} for {url}", response.status()),
                Err(e) => {
                    anyhow::Error::from(e).context(format!("Failed to fetch {url}"))
                }
            };

            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(error.context(format!("Giving up on {url} after {retries} attempts")));
            }
            warn!("Fetch failed, retrying in {retry_delay:?}: {error:#}");
            tokio::time::sleep(retry_delay).await;
        }
    }
}
