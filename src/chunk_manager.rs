//! The segmentation authority for a single download.
//!
//! The chunk manager decides the segment layout (fresh or reconciled from
//! a control record), owns the file writer and the control store, mediates
//! every positional write, and keeps the task-wide byte counter that
//! progress snapshots are derived from.
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::config::FileAllocation;
use crate::control::{CONTROL_VERSION, ControlRecord, ControlStore};
use crate::error::{DownloadError, Result};
use crate::progress::Progress;
use crate::segment::{Segment, SegmentStatus, plan_segments};
use crate::writer::FileWriter;

/// Everything needed to bring a chunk manager up.
pub struct ChunkManagerOptions {
    pub total_size: u64,
    pub segment_size: u64,
    pub max_splits: usize,
    pub output_path: PathBuf,
    pub file_allocation: FileAllocation,
    pub resume_downloads: bool,
    pub always_resume: bool,
    pub urls: Vec<String>,
}

#[derive(Debug)]
pub struct ChunkManager {
    total_size: u64,
    output_path: PathBuf,
    urls: Vec<String>,
    resume_downloads: bool,
    segments: Vec<Segment>,
    downloaded_bytes: u64,
    writer: FileWriter,
    store: ControlStore,
    created_at: i64,
}

impl ChunkManager {
    /// Opens the output file and decides the segment layout.
    ///
    /// A valid control record is adopted after normalization: per-segment
    /// counters are clamped, and any `downloading` status left behind by a
    /// crashed run becomes `pending` again. A record whose segment span
    /// does not cover the current total size is discarded (or, under
    /// strict resume, rejected with `ResumeMismatch`).
    pub async fn initialize(opts: ChunkManagerOptions) -> Result<Self> {
        let store = ControlStore::for_target(&opts.output_path);

        // Probed before the writer is opened so a strict-resume rejection
        // leaves the target untouched.
        let (file_exists, file_size) = FileWriter::probe(&opts.output_path).await;
        if opts.resume_downloads
            && opts.always_resume
            && file_exists
            && file_size > 0
            && !store.exists().await
        {
            return Err(DownloadError::ResumeRequired(opts.output_path));
        }

        let record = if opts.resume_downloads {
            store.load().await
        } else {
            None
        };

        let mut adopted: Option<Vec<Segment>> = None;
        let mut created_at = Utc::now().timestamp_millis();
        if let Some(record) = record
            && !record.segments.is_empty()
        {
            let mut segments = record.segments;
            for segment in &mut segments {
                let full = segment.full_size();
                segment.downloaded_bytes = segment.downloaded_bytes.min(full);
                segment.status = if segment.downloaded_bytes == full {
                    SegmentStatus::Completed
                } else {
                    SegmentStatus::Pending
                };
            }

            let span: u64 = segments.iter().map(Segment::full_size).sum();
            if span == opts.total_size {
                tracing::info!(
                    path = %opts.output_path.display(),
                    segments = segments.len(),
                    "resuming from control file"
                );
                created_at = record.created_at;
                adopted = Some(segments);
            } else if opts.always_resume {
                return Err(DownloadError::ResumeMismatch {
                    recorded: span,
                    actual: opts.total_size,
                });
            } else {
                tracing::warn!(
                    path = %opts.output_path.display(),
                    recorded = span,
                    actual = opts.total_size,
                    "control file does not match the remote size, restarting"
                );
            }
        }

        let resumed = adopted.is_some();
        let segments = adopted
            .unwrap_or_else(|| plan_segments(opts.total_size, opts.segment_size, opts.max_splits));
        let downloaded_bytes = if resumed {
            segments
                .iter()
                .map(|s| s.downloaded_bytes)
                .sum::<u64>()
                .min(opts.total_size)
        } else {
            0
        };

        // Re-applying an allocation strategy to a resumed file would wipe
        // the bytes we are resuming from.
        let allocation = if resumed {
            FileAllocation::None
        } else {
            opts.file_allocation
        };
        let writer = FileWriter::open(&opts.output_path, opts.total_size, allocation).await?;

        let mut manager = Self {
            total_size: opts.total_size,
            output_path: opts.output_path,
            urls: opts.urls,
            resume_downloads: opts.resume_downloads,
            segments,
            downloaded_bytes,
            writer,
            store,
            created_at,
        };

        if manager.resume_downloads {
            manager.save_progress().await?;
        }

        Ok(manager)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn total_downloaded(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn control_path(&self) -> &Path {
        self.store.path()
    }

    /// Index of the first pending segment, if any.
    pub fn next_pending(&self) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| s.status == SegmentStatus::Pending)
    }

    pub fn all_completed(&self) -> bool {
        self.segments.iter().all(Segment::is_completed)
    }

    pub fn failed_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .count()
    }

    pub fn mark_downloading(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.status = SegmentStatus::Downloading;
        }
    }

    pub fn mark_failed(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.status = SegmentStatus::Failed;
        }
    }

    /// Marks a segment done, folds any residual delta into the task total
    /// and persists the control record.
    pub async fn mark_completed(&mut self, index: usize) -> Result<()> {
        if let Some(segment) = self.segments.get_mut(index) {
            let full = segment.full_size();
            let residual = full.saturating_sub(segment.downloaded_bytes);
            segment.downloaded_bytes = full;
            segment.status = SegmentStatus::Completed;
            self.downloaded_bytes += residual;
        }
        self.save_progress().await
    }

    /// Writes `bytes` at `offset` within segment `index`. Counters are not
    /// touched; `update_segment_progress` is the bookkeeping side.
    pub async fn write_chunk_at(&mut self, index: usize, offset: u64, bytes: &[u8]) -> Result<()> {
        let Some(segment) = self.segments.get(index) else {
            return Ok(());
        };
        let position = segment.start_byte + offset;
        self.writer.write_at(position, bytes).await
    }

    /// Sets segment `index`'s counter to `cumulative` bytes and applies the
    /// delta against the prior value to the task-wide counter.
    ///
    /// This is a set, not an add: callers report
    /// `initial_downloaded + bytes_this_fetch`, so repeating a value is
    /// harmless and resumed segments are not double-counted.
    pub fn update_segment_progress(&mut self, index: usize, cumulative: u64) {
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        let clamped = cumulative.min(segment.full_size());
        let prior = segment.downloaded_bytes;
        segment.downloaded_bytes = clamped;
        if clamped >= prior {
            self.downloaded_bytes += clamped - prior;
        } else {
            self.downloaded_bytes -= prior - clamped;
        }
    }

    /// Writes the current control record if resume is enabled.
    pub async fn save_progress(&mut self) -> Result<()> {
        if !self.resume_downloads {
            return Ok(());
        }
        let filename = self
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let record = ControlRecord {
            version: CONTROL_VERSION.to_string(),
            urls: self.urls.clone(),
            filename,
            output_path: self.output_path.to_string_lossy().into_owned(),
            total_size: self.total_size,
            segments: self.segments.clone(),
            created_at: self.created_at,
            last_modified: Utc::now().timestamp_millis(),
        };
        self.store.save(&record).await
    }

    /// Closes the writer; on success the control file is deleted so a
    /// finished download leaves nothing behind.
    pub async fn cleanup(&mut self, success: bool) -> Result<()> {
        self.writer.close().await?;
        if success && self.resume_downloads {
            self.store.delete().await?;
        }
        Ok(())
    }

    /// Raw progress snapshot; the task layers smoothed speed on top.
    pub fn progress(&self, elapsed: Duration) -> Progress {
        Progress::compute(self.total_size, self.downloaded_bytes, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options(path: &Path) -> ChunkManagerOptions {
        ChunkManagerOptions {
            total_size: 100,
            segment_size: 25,
            max_splits: 4,
            output_path: path.to_path_buf(),
            file_allocation: FileAllocation::Trunc,
            resume_downloads: true,
            always_resume: false,
            urls: vec!["http://example.com/file.bin".into()],
        }
    }

    async fn write_record(path: &Path, segments: Vec<Segment>, total_size: u64) {
        let store = ControlStore::for_target(path);
        let record = ControlRecord {
            version: CONTROL_VERSION.to_string(),
            urls: vec!["http://example.com/file.bin".into()],
            filename: "file.bin".into(),
            output_path: path.to_string_lossy().into_owned(),
            total_size,
            segments,
            created_at: 0,
            last_modified: 0,
        };
        store.save(&record).await.unwrap();
    }

    #[tokio::test]
    async fn fresh_initialization_plans_and_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut manager = ChunkManager::initialize(options(&path)).await.unwrap();
        assert_eq!(manager.segments().len(), 4);
        assert_eq!(manager.total_downloaded(), 0);
        assert!(manager.control_path().exists());
        manager.cleanup(false).await.unwrap();
        assert!(manager.control_path().exists());
    }

    #[tokio::test]
    async fn reload_normalizes_downloading_to_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut crashed = Segment::new(0, 0, 49);
        crashed.downloaded_bytes = 30;
        crashed.status = SegmentStatus::Downloading;
        let mut done = Segment::new(1, 50, 99);
        done.downloaded_bytes = 50;
        done.status = SegmentStatus::Completed;
        write_record(&path, vec![crashed, done], 100).await;

        let manager = ChunkManager::initialize(options(&path)).await.unwrap();
        assert_eq!(manager.segments().len(), 2);
        assert_eq!(manager.segments()[0].status, SegmentStatus::Pending);
        assert_eq!(manager.segments()[0].downloaded_bytes, 30);
        assert_eq!(manager.segments()[1].status, SegmentStatus::Completed);
        assert_eq!(manager.total_downloaded(), 80);
        assert_eq!(manager.next_pending(), Some(0));
    }

    #[tokio::test]
    async fn reload_clamps_oversized_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut bogus = Segment::new(0, 0, 99);
        bogus.downloaded_bytes = 5000;
        bogus.status = SegmentStatus::Downloading;
        write_record(&path, vec![bogus], 100).await;

        let manager = ChunkManager::initialize(options(&path)).await.unwrap();
        // Clamped to the full size, which also promotes it to completed.
        assert_eq!(manager.segments()[0].downloaded_bytes, 100);
        assert_eq!(manager.segments()[0].status, SegmentStatus::Completed);
        assert!(manager.all_completed());
    }

    #[tokio::test]
    async fn span_mismatch_rebuilds_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        write_record(&path, vec![Segment::new(0, 0, 49)], 50).await;

        let manager = ChunkManager::initialize(options(&path)).await.unwrap();
        assert_eq!(manager.segments().len(), 4);
        assert_eq!(manager.total_downloaded(), 0);
    }

    #[tokio::test]
    async fn span_mismatch_fails_under_strict_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        write_record(&path, vec![Segment::new(0, 0, 49)], 50).await;

        let mut opts = options(&path);
        opts.always_resume = true;
        let err = ChunkManager::initialize(opts).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::ResumeMismatch {
                recorded: 50,
                actual: 100
            }
        ));
    }

    #[tokio::test]
    async fn existing_file_without_record_fails_under_strict_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        tokio::fs::write(&path, vec![1u8; 100]).await.unwrap();

        let mut opts = options(&path);
        opts.always_resume = true;
        let err = ChunkManager::initialize(opts).await.unwrap_err();
        assert!(matches!(err, DownloadError::ResumeRequired(_)));

        // The rejection must leave the file untouched.
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, vec![1u8; 100]);
    }

    #[tokio::test]
    async fn progress_updates_are_set_semantics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut manager = ChunkManager::initialize(options(&path)).await.unwrap();
        manager.update_segment_progress(0, 10);
        manager.update_segment_progress(0, 10);
        assert_eq!(manager.total_downloaded(), 10);
        manager.update_segment_progress(0, 25);
        manager.update_segment_progress(1, 5);
        assert_eq!(manager.total_downloaded(), 30);
        // Counters never exceed the segment size.
        manager.update_segment_progress(1, 9999);
        assert_eq!(manager.segments()[1].downloaded_bytes, 25);
        assert_eq!(manager.total_downloaded(), 50);
    }

    #[tokio::test]
    async fn mark_completed_folds_residual_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut manager = ChunkManager::initialize(options(&path)).await.unwrap();
        manager.update_segment_progress(0, 20);
        manager.mark_completed(0).await.unwrap();
        assert_eq!(manager.segments()[0].downloaded_bytes, 25);
        assert_eq!(manager.total_downloaded(), 25);

        let reloaded = ControlStore::for_target(&path).load().await.unwrap();
        assert_eq!(reloaded.segments[0].downloaded_bytes, 25);
    }

    #[tokio::test]
    async fn cleanup_deletes_control_only_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut manager = ChunkManager::initialize(options(&path)).await.unwrap();
        let control = manager.control_path().to_path_buf();
        assert!(control.exists());
        manager.cleanup(true).await.unwrap();
        assert!(!control.exists());
    }

    #[tokio::test]
    async fn writes_are_offset_by_segment_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");

        let mut manager = ChunkManager::initialize(options(&path)).await.unwrap();
        // Segment 1 covers [25, 49]; offset 5 lands at absolute 30.
        manager.write_chunk_at(1, 5, b"xyz").await.unwrap();
        manager.cleanup(false).await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&content[30..33], b"xyz");
    }
}
