use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::config::CrawlerConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("connection failed for {url}: {message}")]
    Connect { url: String, message: String },
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("failed to read body of {url}: {message}")]
    Body { url: String, message: String },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect { .. } | Self::Body { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Cancelled => false,
        }
    }
}

/// One outbound request, no retry and no delay.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch_once(&self, url: &str, encoding: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &CrawlerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build chapter http client")?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn fetch_once(&self, url: &str, encoding: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        response
            .text_with_charset(encoding)
            .await
            .map_err(|err| FetchError::Body {
                url: url.to_owned(),
                message: err.to_string(),
            })
    }
}

fn classify_reqwest_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_owned(),
        };
    }
    if let Some(status) = err.status() {
        return FetchError::Status {
            status: status.as_u16(),
            url: url.to_owned(),
        };
    }
    FetchError::Connect {
        url: url.to_owned(),
        message: err.to_string(),
    }
}

/// Politeness delay and bounded retry around a [`FetchTransport`].
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn FetchTransport>,
    delay: Duration,
    max_retries: usize,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn FetchTransport>, config: &CrawlerConfig) -> Self {
        Self {
            transport,
            delay: config.delay(),
            max_retries: config.max_retries,
        }
    }

    /// The delay is applied before every request, including the first.
    pub async fn fetch(
        &self,
        url: &str,
        encoding: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let attempts = self.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = self.transport.fetch_once(url, encoding) => result,
            };

            match result {
                Ok(body) => return Ok(body),
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(url, %err, "fetch failed; not retrying");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(url, attempt, attempts, %err, "fetch failed; retrying");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            url: url.to_owned(),
        }))
    }
}
