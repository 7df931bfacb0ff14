//! Error types shared across the download engine.
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Everything that can go wrong while probing, fetching or writing a download.
///
/// Segment-level failures (`Timeout`, `Network`, `HttpStatus`) are retried by
/// the fetcher up to its budget; the remaining variants terminate the task.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The server's HEAD response carried no `Content-Length`.
    #[error("server did not report a content length")]
    SizeUnknown,

    /// The caller supplied an empty URL list.
    #[error("no download URLs were provided")]
    NoUrls,

    /// Strict resume was requested but the target exists without a control file.
    #[error("refusing to restart: {} exists but has no control file", .0.display())]
    ResumeRequired(PathBuf),

    /// Strict resume was requested but the control file no longer matches the remote size.
    #[error("control file describes {recorded} bytes but the server reports {actual}")]
    ResumeMismatch { recorded: u64, actual: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),

    /// The task's cancellation token was tripped.
    #[error("download was cancelled")]
    Cancelled,

    /// Segments exhausted the retry budget and none are left to schedule.
    #[error("{failed} segment(s) exhausted their retry budget")]
    SegmentsFailed { failed: usize },

    /// A size string like "20MB" could not be parsed.
    #[error("invalid size string: {0:?}")]
    InvalidSize(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("control file serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the fetcher should retry the request that produced this error.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network(_) | Self::HttpStatus(_)
        )
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}
