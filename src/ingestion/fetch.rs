//! Fetch functions - retrieve raw bytes from source URLs

use crate::ingestion::retry::{wait, WaitOptions, WaitStatus};
use crate::ingestion::utils::{build_http_client, is_retryable_status, is_transient_error};
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Download failures; every variant is fatal for the source
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL {url}: only http(s) URLs can be fetched")]
    InvalidUrl { url: String },

    #[error("HTTP request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP request to {url} failed: {status}")]
    Status { url: String, status: StatusCode },

    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// HTTP status of the failed response, if the server answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Download settings
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub retry: WaitOptions,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            timeout: Duration::from_secs(300), // 5 min timeout
            retry: WaitOptions::default(),
        }
    }
}

/// HTTP downloader with bounded timeout and retry
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    retry: WaitOptions,
}

impl Fetcher {
    pub fn new(options: FetchOptions) -> Result<Self, FetchError> {
        let client = build_http_client(options.timeout).map_err(FetchError::Client)?;
        Ok(Fetcher {
            client,
            retry: options.retry,
        })
    }

    /// Download a URL and return the full response body
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        info!("Downloading from {}", url);

        let bytes = wait(&self.retry, || {
            let parsed = parsed.clone();
            async move { self.attempt(parsed).await }
        })
        .await?;

        info!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }

    async fn attempt(&self, url: Url) -> WaitStatus<Bytes, FetchError> {
        let url_str = url.to_string();

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(source) => {
                let temporary = is_transient_error(&source);
                let err = FetchError::Transport {
                    url: url_str,
                    source,
                };
                return if temporary {
                    WaitStatus::FailedTemporarily(err)
                } else {
                    WaitStatus::FailedPermanently(err)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = FetchError::Status {
                url: url_str,
                status,
            };
            return if is_retryable_status(status) {
                WaitStatus::FailedTemporarily(err)
            } else {
                WaitStatus::FailedPermanently(err)
            };
        }

        // A body cut off mid-stream is as transient as a dropped connection
        match response.bytes().await {
            Ok(bytes) => WaitStatus::Finished(bytes),
            Err(source) => WaitStatus::FailedTemporarily(FetchError::Transport {
                url: url_str,
                source,
            }),
        }
    }
}
