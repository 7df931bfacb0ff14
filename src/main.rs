//! Command-line entrypoint for `paradl`.
mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use args::Args;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paradl::{
    DownloadError, DownloadEvent, DownloadRequest, Downloader, DownloaderConfig, parse_size, utils,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = DownloaderConfig {
        split: args.split,
        segment_size: parse_size(&args.min_segment_size)?,
        max_concurrent_downloads: args.max_concurrent_downloads,
        max_connections_per_server: args.max_connections_per_server,
        timeout: Duration::from_secs(args.timeout),
        retries: args.retries,
        file_allocation: args.file_allocation,
        resume_downloads: !args.no_resume,
        auto_save_interval: Duration::from_secs(args.auto_save_interval),
        always_resume: !args.no_always_resume,
        output_directory: args.dir.clone(),
        max_download_speed: args.max_download_speed,
        ..DownloaderConfig::default()
    };

    // Resolve the output name. An explicit -o is used as-is; otherwise a
    // matching control file in the target directory wins (resume it), and
    // failing that a clashing name gets a numeric suffix.
    let filename = match &args.out {
        Some(name) => name.clone(),
        None => {
            let derived = utils::filename_from_url(&args.urls[0]);
            match utils::find_resumable_filename(&args.dir, &derived) {
                Some(resumable) => {
                    println!("Found partial download, resuming {}", resumable);
                    resumable
                }
                None => utils::unique_filename(&args.dir, &derived),
            }
        }
    };

    let downloader = Arc::new(Downloader::new(config));

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("=>-"),
    );
    progress_bar.set_message(filename.clone());

    let mut events = downloader.subscribe();
    let pb = progress_bar.clone();
    let renderer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DownloadEvent::Progress { progress, .. }) => {
                    pb.set_length(progress.total_bytes);
                    pb.set_position(progress.downloaded_bytes);
                }
                Ok(DownloadEvent::Redirected { to, .. }) => {
                    tracing::info!(%to, "redirected");
                }
                Ok(DownloadEvent::SegmentFailed { segment, error, .. }) => {
                    pb.println(format!("⚠️  segment {} failed: {}", segment, error));
                }
                Ok(
                    DownloadEvent::Completed { .. }
                    | DownloadEvent::Cancelled { .. }
                    | DownloadEvent::Failed { .. },
                ) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // SIGINT cancels every active task; each one saves its control file on
    // the way out so the next invocation can resume.
    {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n🛑 Interrupted, saving progress...");
                downloader.cancel_all();
            }
        });
    }

    let handle = downloader.download(DownloadRequest {
        urls: args.urls.clone(),
        filename: Some(filename.clone()),
        output_dir: None,
    });

    let result = handle.wait().await;
    let _ = renderer.await;

    match result {
        Ok(()) => {
            progress_bar.finish();
            println!("✅ Finished {}", filename);
            Ok(())
        }
        Err(DownloadError::Cancelled) => {
            progress_bar.abandon();
            println!("Download cancelled; progress saved for resume.");
            Ok(())
        }
        Err(err) => {
            progress_bar.abandon();
            Err(err.into())
        }
    }
}
