//! paradl — resumable segmented downloads
//!
//! `paradl` fetches a file over HTTP(S) in parallel byte-range segments,
//! writes them at their offsets in a single output file, and keeps a JSON
//! control sidecar next to the output so interrupted downloads resume
//! without refetching completed bytes. It is usable both as an embedded
//! library and through the bundled CLI.
//!
//! # Example
//!
//! ```no_run
//! use paradl::{DownloadRequest, Downloader, DownloaderConfig};
//! # async {
//! let downloader = Downloader::new(DownloaderConfig::default());
//! downloader
//!     .download_and_wait(DownloadRequest {
//!         urls: vec!["https://example.com/file.bin".into()],
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//! # };
//! ```

pub mod chunk_manager;
pub mod config;
pub mod control;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod progress;
pub mod segment;
pub mod task;
pub mod utils;
pub mod writer;

pub use config::{DownloaderConfig, FileAllocation, parse_size};
pub use downloader::{DownloadHandle, Downloader};
pub use error::{DownloadError, Result};
pub use events::DownloadEvent;
pub use progress::Progress;
pub use segment::{Segment, SegmentStatus};
pub use task::{DownloadRequest, DownloadTask, TaskId, TaskInfo, TaskStatus};
