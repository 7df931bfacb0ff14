//! Downloader configuration.
//!
//! `DownloaderConfig` collects every knob the engine understands; each
//! download inherits a copy of it from the `Downloader` that spawned the
//! task. `parse_size` turns human-friendly strings like `"20MB"` into byte
//! counts for the minimum-segment-size option.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DownloadError;

/// How the output file is sized when it is first opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileAllocation {
    /// Leave the file alone; it grows as positional writes land.
    None,
    /// Set the file length up front (sparse on most filesystems).
    #[default]
    Trunc,
    /// Set the length, then zero-fill the whole range in 1 MiB buffers.
    Prealloc,
    /// Reserve blocks up front. Falls back to `Trunc` where the
    /// filesystem offers nothing better.
    Falloc,
}

impl FromStr for FileAllocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "trunc" => Ok(Self::Trunc),
            "prealloc" => Ok(Self::Prealloc),
            "falloc" => Ok(Self::Falloc),
            other => Err(format!(
                "unknown allocation method {other:?} (expected none, trunc, prealloc or falloc)"
            )),
        }
    }
}

/// Options shared by every task a `Downloader` spawns.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Upper bound on the number of segments per download.
    pub split: usize,
    /// Minimum target size per segment, in bytes.
    pub segment_size: u64,
    /// Cap on simultaneously active tasks.
    pub max_concurrent_downloads: usize,
    /// Cap on simultaneous in-flight segments per task.
    pub max_connections_per_server: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempt budget for HEAD and GET requests.
    pub retries: u32,
    /// Base delay between retry attempts.
    pub retry_delay: Duration,
    /// Fixed headers added to every request.
    pub headers: Vec<(String, String)>,
    /// Output-file allocation strategy.
    pub file_allocation: FileAllocation,
    /// Persist and load the control sidecar.
    pub resume_downloads: bool,
    /// Interval between periodic control saves; zero disables the loop.
    pub auto_save_interval: Duration,
    /// Fail instead of restarting when the target exists without a control file.
    pub always_resume: bool,
    /// Default output directory when a download omits one.
    pub output_directory: PathBuf,
    /// Download speed cap in bytes per second; `None` means unlimited.
    pub max_download_speed: Option<u32>,
    /// User-Agent sent with every request.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            split: 5,
            segment_size: 20 * 1024 * 1024,
            max_concurrent_downloads: 3,
            max_connections_per_server: 4,
            timeout: Duration::from_secs(30),
            retries: 5,
            retry_delay: Duration::from_secs(2),
            headers: Vec::new(),
            file_allocation: FileAllocation::default(),
            resume_downloads: true,
            auto_save_interval: Duration::from_secs(60),
            always_resume: false,
            output_directory: PathBuf::from("."),
            max_download_speed: None,
            user_agent: concat!("paradl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Parses a size string such as `"20MB"`, `"512kb"` or `"1048576"`.
///
/// Units are `B`, `KB`, `MB` and `GB` (case-insensitive, 1024-based); a bare
/// number is taken as bytes.
///
/// # Errors
///
/// Returns `DownloadError::InvalidSize` for empty input, unknown units or a
/// missing numeric part.
pub fn parse_size(input: &str) -> Result<u64, DownloadError> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);

    let value: u64 = number
        .parse()
        .map_err(|_| DownloadError::InvalidSize(input.to_string()))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return Err(DownloadError::InvalidSize(input.to_string())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| DownloadError::InvalidSize(input.to_string()))
}
