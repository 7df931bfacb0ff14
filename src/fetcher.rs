//! HTTP access: size and range probes plus streamed (ranged) fetches.
//!
//! The fetcher is stateless across requests. Redirects are followed by
//! hand (the client has automatic redirects disabled) so every hop can be
//! reported to the task, and response decompression stays off so the
//! server's `Content-Length` matches the bytes that arrive.
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use reqwest::header::{CONTENT_LENGTH, LOCATION, RANGE};
use reqwest::{Client, Method, Response, StatusCode, Url, header, redirect};
use tokio_util::sync::CancellationToken;

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result};

pub type ArcRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Invoked with `(from, to)` whenever a request hops to a different URL.
pub type RedirectHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

const MAX_REDIRECTS: usize = 5;

/// Receives the body of a fetch, one chunk at a time.
///
/// `write_chunk` must complete before the next chunk is pulled off the
/// socket; the fetcher provides that back-pressure. `report_bytes` receives
/// the cumulative byte count for the current fetch call.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()>;
    async fn report_bytes(&mut self, cumulative: u64) -> Result<()>;
}

pub struct HttpFetcher {
    client: Client,
    retries: u32,
    retry_delay: std::time::Duration,
    limiter: Option<ArcRateLimiter>,
    redirect_hook: Option<RedirectHook>,
}

impl HttpFetcher {
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in &config.headers {
            match (
                header::HeaderName::from_bytes(name.as_bytes()),
                header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid header"),
            }
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(redirect::Policy::none())
            .default_headers(headers)
            .build()?;

        let limiter = config
            .max_download_speed
            .and_then(NonZeroU32::new)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

        Ok(Self {
            client,
            retries: config.retries,
            retry_delay: config.retry_delay,
            limiter,
            redirect_hook: None,
        })
    }

    pub fn with_redirect_hook(mut self, hook: RedirectHook) -> Self {
        self.redirect_hook = Some(hook);
        self
    }

    /// HEAD probe for the authoritative total size.
    ///
    /// # Errors
    ///
    /// `SizeUnknown` when the response carries no parsable `Content-Length`.
    pub async fn probe_size(&self, url: &str, cancel: &CancellationToken) -> Result<u64> {
        let response = self
            .send_with_retry(Method::HEAD, url, None, cancel)
            .await?;
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(DownloadError::SizeUnknown)
    }

    /// HEAD probe with `Range: bytes=0-0`; true iff the server answers 206.
    /// Every failure, including network errors, reads as "no ranges".
    pub async fn supports_range(&self, url: &str, cancel: &CancellationToken) -> bool {
        match self
            .send_with_retry(Method::HEAD, url, Some("bytes=0-0".into()), cancel)
            .await
        {
            Ok(response) => response.status() == StatusCode::PARTIAL_CONTENT,
            Err(err) => {
                tracing::debug!(%url, error = %err, "range probe failed");
                false
            }
        }
    }

    /// Streams `[start_byte, end_byte]` into `sink`.
    ///
    /// On a retryable failure mid-body the next attempt re-issues the range
    /// from `start_byte + received`, so the sink never sees a byte twice and
    /// `report_bytes` stays cumulative across attempts.
    pub async fn fetch_range(
        &self,
        url: &str,
        start_byte: u64,
        end_byte: u64,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut received = 0u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let range = format!("bytes={}-{}", start_byte + received, end_byte);
            match self
                .stream_once(url, Some(range), sink, cancel, &mut received)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() || attempt >= self.retries.max(1) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(%url, attempt, error = %err, "ranged fetch failed, retrying");
                    self.backoff(cancel).await?;
                }
            }
        }
    }

    /// Streams the whole resource into `sink`, for servers without range
    /// support. Once bytes have been consumed a failure is terminal because
    /// the sink cannot be rewound.
    pub async fn fetch_full(
        &self,
        url: &str,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut received = 0u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.stream_once(url, None, sink, cancel, &mut received).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if received > 0 || !err.is_retryable() || attempt >= self.retries.max(1) =>
                {
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(%url, attempt, error = %err, "full fetch failed, retrying");
                    self.backoff(cancel).await?;
                }
            }
        }
    }

    async fn stream_once(
        &self,
        url: &str,
        range: Option<String>,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
        received: &mut u64,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut response = self
            .send_following_redirects(Method::GET, url, range.as_deref(), cancel)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }

        loop {
            let maybe_chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(bytes) = maybe_chunk else {
                return Ok(());
            };

            if let Some(limiter) = &self.limiter
                && let Some(n) = NonZeroU32::new(bytes.len() as u32)
            {
                let _ = limiter.until_n_ready(n).await;
            }

            sink.write_chunk(&bytes).await?;
            *received += bytes.len() as u64;
            sink.report_bytes(*received).await?;
        }
    }

    /// Sends one request, applying the retry budget to transport errors and
    /// non-success statuses alike. Cancellation is never retried.
    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        range: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .send_following_redirects(method.clone(), url, range.as_deref(), cancel)
                .await
                .and_then(|response| {
                    let status = response.status();
                    if status.is_success() {
                        Ok(response)
                    } else {
                        Err(DownloadError::HttpStatus(status.as_u16()))
                    }
                });
            match result {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_retryable() || attempt >= self.retries.max(1) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(%url, attempt, error = %err, "request failed, retrying");
                    self.backoff(cancel).await?;
                }
            }
        }
    }

    async fn send_following_redirects(
        &self,
        method: Method,
        url: &str,
        range: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut current = Url::parse(url)
            .map_err(|err| DownloadError::Network(format!("invalid URL {url:?}: {err}")))?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.request(method.clone(), current.clone());
            if let Some(range) = range {
                request = request.header(RANGE, range);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                result = request.send() => result?,
            };

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| DownloadError::HttpStatus(response.status().as_u16()))?;
                let next = current.join(location).map_err(|err| {
                    DownloadError::Network(format!("invalid redirect location: {err}"))
                })?;
                if next != current
                    && let Some(hook) = &self.redirect_hook
                {
                    hook(current.as_str(), next.as_str());
                }
                tracing::debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            return Ok(response);
        }

        Err(DownloadError::Network(format!(
            "stopped after {MAX_REDIRECTS} redirects"
        )))
    }

    async fn backoff(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(self.retry_delay) => Ok(()),
        }
    }
}
