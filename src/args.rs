//! Command-line argument definitions for the `paradl` binary.
use std::path::PathBuf;

use clap::Parser;
use paradl::FileAllocation;

/// A resumable, segmented parallel file downloader.
///
/// Fetches a file in parallel byte-range segments and keeps a control file
/// next to the output so interrupted downloads can be resumed.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// URLs pointing at the same file; extra URLs are used as mirrors.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// The directory to save the file in.
    #[arg(short = 'd', long, default_value = ".")]
    pub dir: PathBuf,

    /// The output file name. Derived from the URL if not provided.
    #[arg(short = 'o', long)]
    pub out: Option<String>,

    /// Maximum number of downloads running at once.
    #[arg(short = 'j', long, default_value_t = 3)]
    pub max_concurrent_downloads: usize,

    /// Maximum number of segments per download.
    #[arg(short = 's', long, default_value_t = 5)]
    pub split: usize,

    /// Maximum number of connections per server.
    #[arg(short = 'x', long, default_value_t = 4)]
    pub max_connections_per_server: usize,

    /// Minimum segment size, e.g. "20MB" or a plain byte count.
    #[arg(long, default_value = "20MB")]
    pub min_segment_size: String,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Retry attempts per request.
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Disable resume support; no control file is written.
    #[arg(long)]
    pub no_resume: bool,

    /// Seconds between periodic control-file saves.
    #[arg(long, default_value_t = 60)]
    pub auto_save_interval: u64,

    /// Restart from scratch when the target exists without a control file.
    #[arg(long)]
    pub no_always_resume: bool,

    /// File allocation method: none, trunc, prealloc or falloc.
    #[arg(long, default_value = "trunc")]
    pub file_allocation: FileAllocation,

    /// Download speed cap in bytes per second.
    #[arg(long)]
    pub max_download_speed: Option<u32>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Shortcut for --log-level debug.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}
