//! Lifecycle orchestration for a single download.
//!
//! A `DownloadTask` probes the remote resource, builds a `ChunkManager`,
//! schedules segment fetches under a per-task connection cap with mirror
//! rotation, publishes throttled progress events, and honors pause, resume
//! and cancel. Tasks are normally created through the `Downloader`.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex as StateMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk_manager::{ChunkManager, ChunkManagerOptions};
use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result};
use crate::events::{DownloadEvent, EVENT_CHANNEL_CAPACITY};
use crate::fetcher::{ChunkSink, HttpFetcher, RedirectHook};
use crate::progress::{Progress, ProgressThrottle, SpeedEstimator};
use crate::segment::Segment;
use crate::utils;

/// Stable identifier carried in every event a task emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// What a download should fetch and where it should land.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    /// URLs pointing at the same payload; extra entries act as mirrors.
    pub urls: Vec<String>,
    /// Explicit output filename; derived from the URL when absent.
    pub filename: Option<String>,
    /// Output directory; falls back to the configured default.
    pub output_dir: Option<PathBuf>,
}

/// Snapshot of a task for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    pub urls: Vec<String>,
    pub filename: String,
    pub output_path: String,
    pub total_size: u64,
    pub segments: Vec<Segment>,
    pub status: TaskStatus,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// Aggregates byte counts into throttled `Progress` events.
struct ProgressReporter {
    id: TaskId,
    total_size: u64,
    started: Instant,
    speed: SpeedEstimator,
    throttle: ProgressThrottle,
    events: broadcast::Sender<DownloadEvent>,
    last: Progress,
}

impl ProgressReporter {
    fn new(id: TaskId, total_size: u64, events: broadcast::Sender<DownloadEvent>) -> Self {
        Self {
            id,
            total_size,
            started: Instant::now(),
            speed: SpeedEstimator::default(),
            throttle: ProgressThrottle::default(),
            events,
            last: Progress {
                total_bytes: total_size,
                ..Progress::default()
            },
        }
    }

    fn publish(&mut self, downloaded: u64, force: bool) {
        let elapsed = self.started.elapsed();
        let mut progress = Progress::compute(self.total_size, downloaded, elapsed);
        let smoothed = self.speed.record(progress.downloaded_bytes, elapsed);
        progress.speed = smoothed;
        progress.eta = if smoothed > 0.0 {
            (progress.total_bytes - progress.downloaded_bytes) as f64 / smoothed
        } else {
            0.0
        };
        self.last = progress;
        if self.throttle.should_emit(progress.percent, force) {
            let _ = self.events.send(DownloadEvent::Progress {
                id: self.id,
                progress,
            });
        }
    }
}

struct TaskState {
    status: TaskStatus,
    error: Option<String>,
    filename: String,
    output_path: PathBuf,
    total_size: u64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    manager: Option<Arc<Mutex<ChunkManager>>>,
    reporter: Option<Arc<StateMutex<ProgressReporter>>>,
    autosave_stop: Option<CancellationToken>,
}

pub struct DownloadTask {
    id: TaskId,
    config: DownloaderConfig,
    request: DownloadRequest,
    events: broadcast::Sender<DownloadEvent>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    state: StateMutex<TaskState>,
}

impl DownloadTask {
    pub fn new(config: DownloaderConfig, request: DownloadRequest) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (pause, _) = watch::channel(false);
        Arc::new(Self {
            id: TaskId::new(),
            config,
            request,
            events,
            cancel: CancellationToken::new(),
            pause,
            state: StateMutex::new(TaskState {
                status: TaskStatus::Pending,
                error: None,
                filename: String::new(),
                output_path: PathBuf::new(),
                total_size: 0,
                started_at: None,
                finished_at: None,
                manager: None,
                reporter: None,
                autosave_stop: None,
            }),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Receiver for this task's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Current snapshot of the task for observers.
    pub async fn info(&self) -> TaskInfo {
        let (status, error, filename, output_path, total_size, started_at, finished_at, manager, reporter) = {
            let state = self.state.lock();
            (
                state.status,
                state.error.clone(),
                state.filename.clone(),
                state.output_path.clone(),
                state.total_size,
                state.started_at,
                state.finished_at,
                state.manager.clone(),
                state.reporter.clone(),
            )
        };
        let segments = match &manager {
            Some(manager) => manager.lock().await.segments().to_vec(),
            None => Vec::new(),
        };
        let progress = reporter
            .map(|reporter| reporter.lock().last)
            .unwrap_or_default();
        TaskInfo {
            id: self.id,
            urls: self.request.urls.clone(),
            filename,
            output_path: output_path.to_string_lossy().into_owned(),
            total_size,
            segments,
            status,
            progress,
            error,
            start_time: started_at,
            end_time: finished_at,
        }
    }

    /// Stops scheduling new segments. In-flight fetches keep running.
    /// Only legal while downloading.
    pub fn pause(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Downloading {
                return false;
            }
            state.status = TaskStatus::Paused;
        }
        let _ = self.pause.send(true);
        self.emit(DownloadEvent::Paused { id: self.id });
        true
    }

    /// Resumes a paused task.
    pub fn resume(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Paused {
                return false;
            }
            state.status = TaskStatus::Downloading;
        }
        let _ = self.pause.send(false);
        self.emit(DownloadEvent::Resumed { id: self.id });
        true
    }

    /// Trips the cancellation token. In-flight fetches abort promptly; the
    /// task finishes with a `Cancelled` event and keeps its control file.
    pub fn cancel(&self) -> bool {
        let status = self.state.lock().status;
        if matches!(
            status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Runs the download to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the terminal error, `DownloadError::Cancelled` included, after
    /// the matching event has been emitted and progress persisted.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let result = self.clone().run().await;

        let (manager, autosave) = {
            let mut state = self.state.lock();
            (state.manager.clone(), state.autosave_stop.take())
        };
        if let Some(stop) = autosave {
            stop.cancel();
        }

        match &result {
            Ok(()) => {
                self.set_terminal(TaskStatus::Completed, None);
                if let Some(manager) = &manager {
                    let mut manager = manager.lock().await;
                    if let Err(err) = manager.cleanup(true).await {
                        tracing::warn!(id = %self.id, error = %err, "cleanup failed");
                    }
                }
                self.emit(DownloadEvent::Completed { id: self.id });
            }
            Err(DownloadError::Cancelled) => {
                self.set_terminal(TaskStatus::Cancelled, None);
                self.finish_interrupted(manager.as_ref()).await;
                self.emit(DownloadEvent::Cancelled { id: self.id });
            }
            Err(err) => {
                self.set_terminal(TaskStatus::Failed, Some(err.to_string()));
                self.finish_interrupted(manager.as_ref()).await;
                self.emit(DownloadEvent::Failed {
                    id: self.id,
                    error: err.to_string(),
                });
            }
        }

        result
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        {
            let mut state = self.state.lock();
            state.status = TaskStatus::Downloading;
            state.started_at = Some(Utc::now().timestamp_millis());
        }

        if self.request.urls.is_empty() {
            return Err(DownloadError::NoUrls);
        }

        let hook: RedirectHook = {
            let events = self.events.clone();
            let id = self.id;
            Arc::new(move |from: &str, to: &str| {
                let _ = events.send(DownloadEvent::Redirected {
                    id,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            })
        };
        let fetcher = Arc::new(HttpFetcher::new(&self.config)?.with_redirect_hook(hook));

        let total_size = fetcher.probe_size(&self.request.urls[0], &self.cancel).await?;
        if total_size == 0 {
            return Err(DownloadError::SizeUnknown);
        }

        let filename = self
            .request
            .filename
            .clone()
            .unwrap_or_else(|| utils::filename_from_url(&self.request.urls[0]));
        let output_dir = self
            .request
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.output_directory.clone());
        let output_path = output_dir.join(&filename);
        {
            let mut state = self.state.lock();
            state.filename = filename;
            state.output_path = output_path.clone();
            state.total_size = total_size;
        }

        // Without range support the whole file is one stream, so the plan
        // collapses to a single segment before the manager is built.
        let range_supported = fetcher
            .supports_range(&self.request.urls[0], &self.cancel)
            .await;
        tracing::debug!(id = %self.id, total_size, range_supported, "probe finished");

        let manager = Arc::new(Mutex::new(
            ChunkManager::initialize(ChunkManagerOptions {
                total_size,
                segment_size: self.config.segment_size,
                max_splits: if range_supported { self.config.split } else { 1 },
                output_path,
                file_allocation: self.config.file_allocation,
                resume_downloads: self.config.resume_downloads,
                always_resume: self.config.always_resume,
                urls: self.request.urls.clone(),
            })
            .await?,
        ));

        let reporter = Arc::new(StateMutex::new(ProgressReporter::new(
            self.id,
            total_size,
            self.events.clone(),
        )));
        {
            let mut state = self.state.lock();
            state.manager = Some(manager.clone());
            state.reporter = Some(reporter.clone());
        }

        if self.config.resume_downloads && !self.config.auto_save_interval.is_zero() {
            let stop = self.spawn_autosave(manager.clone());
            self.state.lock().autosave_stop = Some(stop);
        }

        self.emit(DownloadEvent::Started { id: self.id });

        // Seed the meter so resumed byte counts show up before the first chunk.
        let resumed = manager.lock().await.total_downloaded();
        reporter.lock().publish(resumed, false);

        if range_supported {
            self.run_segmented(&manager, &reporter, &fetcher).await?;
        } else {
            self.run_single(&manager, &reporter, &fetcher).await?;
        }

        // A forced progress event always precedes completion.
        let downloaded = manager.lock().await.total_downloaded();
        reporter.lock().publish(downloaded, true);
        Ok(())
    }

    /// Single-stream path for servers without range support.
    async fn run_single(
        self: &Arc<Self>,
        manager: &Arc<Mutex<ChunkManager>>,
        reporter: &Arc<StateMutex<ProgressReporter>>,
        fetcher: &Arc<HttpFetcher>,
    ) -> Result<()> {
        let Some((index, initial)) = ({
            let mut manager = manager.lock().await;
            manager.next_pending().map(|index| {
                manager.mark_downloading(index);
                (index, manager.segments()[index].downloaded_bytes)
            })
        }) else {
            return Ok(());
        };

        let mut sink = SegmentSink {
            manager: manager.clone(),
            reporter: reporter.clone(),
            index,
            offset: initial,
            initial,
        };
        fetcher
            .fetch_full(&self.request.urls[0], &mut sink, &self.cancel)
            .await?;
        manager.lock().await.mark_completed(index).await?;
        Ok(())
    }

    /// Segmented path: every pending segment becomes one job, gated by the
    /// per-task connection semaphore and assigned a mirror round-robin.
    async fn run_segmented(
        self: &Arc<Self>,
        manager: &Arc<Mutex<ChunkManager>>,
        reporter: &Arc<StateMutex<ProgressReporter>>,
        fetcher: &Arc<HttpFetcher>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections_per_server.max(1)));
        let mut jobs = Vec::new();
        let mut round_robin = 0usize;

        // Failed segments never return to pending within a run, so a single
        // drain schedules the whole plan.
        loop {
            let next = {
                let mut manager = manager.lock().await;
                manager.next_pending().map(|index| {
                    manager.mark_downloading(index);
                    manager.segments()[index].clone()
                })
            };
            let Some(segment) = next else { break };

            let url = self.request.urls[round_robin % self.request.urls.len()].clone();
            round_robin += 1;

            let task = self.clone();
            let manager = manager.clone();
            let reporter = reporter.clone();
            let fetcher = fetcher.clone();
            let semaphore = semaphore.clone();
            jobs.push(tokio::spawn(async move {
                task.run_segment_job(segment, url, manager, reporter, fetcher, semaphore)
                    .await
            }));
        }

        for result in join_all(jobs).await {
            match result {
                Ok(job_result) => job_result?,
                Err(err) => {
                    return Err(DownloadError::Network(format!("segment job panicked: {err}")));
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let manager = manager.lock().await;
        if manager.all_completed() {
            Ok(())
        } else {
            Err(DownloadError::SegmentsFailed {
                failed: manager.failed_count(),
            })
        }
    }

    async fn run_segment_job(
        self: Arc<Self>,
        segment: Segment,
        url: String,
        manager: Arc<Mutex<ChunkManager>>,
        reporter: Arc<StateMutex<ProgressReporter>>,
        fetcher: Arc<HttpFetcher>,
        semaphore: Arc<Semaphore>,
    ) -> Result<()> {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return Ok(());
        };
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        // Pause keeps queued segments from starting; running fetches proceed.
        if self.wait_while_paused().await.is_err() {
            return Ok(());
        }

        let index = segment.index;
        let initial = segment.downloaded_bytes;
        let mut sink = SegmentSink {
            manager: manager.clone(),
            reporter: reporter.clone(),
            index,
            offset: initial,
            initial,
        };

        // The range picks up where the segment left off; the sink's write
        // offset starts at the same place.
        let result = fetcher
            .fetch_range(
                &url,
                segment.start_byte + initial,
                segment.end_byte,
                &mut sink,
                &self.cancel,
            )
            .await;
        match result {
            Ok(()) => {
                let downloaded = {
                    let mut manager = manager.lock().await;
                    manager.mark_completed(index).await?;
                    manager.total_downloaded()
                };
                reporter.lock().publish(downloaded, true);
                self.emit(DownloadEvent::SegmentCompleted {
                    id: self.id,
                    segment: index,
                });
                Ok(())
            }
            Err(err) if err.is_cancelled() || self.cancel.is_cancelled() => Ok(()),
            // Writer or control-store failures sink the whole task.
            Err(err @ (DownloadError::Io(_) | DownloadError::Json(_))) => Err(err),
            Err(err) => {
                manager.lock().await.mark_failed(index);
                tracing::warn!(id = %self.id, segment = index, error = %err, "segment failed");
                self.emit(DownloadEvent::SegmentFailed {
                    id: self.id,
                    segment: index,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn wait_while_paused(&self) -> Result<()> {
        let mut paused = self.pause.subscribe();
        while *paused.borrow() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_autosave(&self, manager: Arc<Mutex<ChunkManager>>) -> CancellationToken {
        let stop = CancellationToken::new();
        let watcher = stop.clone();
        let interval = self.config.auto_save_interval;
        let id = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        // try_lock keeps saves single-slot: while a save or
                        // write holds the manager, this tick is skipped.
                        if let Ok(mut manager) = manager.try_lock()
                            && let Err(err) = manager.save_progress().await
                        {
                            tracing::warn!(id = %id, error = %err, "periodic save failed");
                        }
                    }
                }
            }
        });
        stop
    }

    async fn finish_interrupted(&self, manager: Option<&Arc<Mutex<ChunkManager>>>) {
        let Some(manager) = manager else { return };
        let mut manager = manager.lock().await;
        if let Err(err) = manager.save_progress().await {
            tracing::warn!(id = %self.id, error = %err, "final save failed");
        }
        if let Err(err) = manager.cleanup(false).await {
            tracing::warn!(id = %self.id, error = %err, "cleanup failed");
        }
    }

    fn set_terminal(&self, status: TaskStatus, error: Option<String>) {
        let mut state = self.state.lock();
        state.status = status;
        state.error = error;
        state.finished_at = Some(Utc::now().timestamp_millis());
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }
}

/// Streams one segment's chunks into the chunk manager at the right offsets
/// and translates per-fetch byte counts into per-segment cumulative ones.
struct SegmentSink {
    manager: Arc<Mutex<ChunkManager>>,
    reporter: Arc<StateMutex<ProgressReporter>>,
    index: usize,
    offset: u64,
    initial: u64,
}

#[async_trait]
impl ChunkSink for SegmentSink {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let mut manager = self.manager.lock().await;
        manager.write_chunk_at(self.index, self.offset, bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    async fn report_bytes(&mut self, cumulative: u64) -> Result<()> {
        let downloaded = {
            let mut manager = self.manager.lock().await;
            // The fetcher counts bytes for this fetch only; the segment may
            // carry a resumed base, hence the addition.
            manager.update_segment_progress(self.index, self.initial + cumulative);
            manager.total_downloaded()
        };
        self.reporter.lock().publish(downloaded, false);
        Ok(())
    }
}
