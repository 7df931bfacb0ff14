//! Multi-task coordination.
//!
//! The `Downloader` owns a registry of active tasks, caps how many run at
//! once, and re-broadcasts every task's events on its own channel so
//! consumers can attach a single listener.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result};
use crate::events::{DownloadEvent, EVENT_CHANNEL_CAPACITY};
use crate::task::{DownloadRequest, DownloadTask, TaskId, TaskInfo};

/// A started download: the task for control and inspection, plus a handle
/// that resolves when the scheduled job has fully finished.
pub struct DownloadHandle {
    pub task: Arc<DownloadTask>,
    join: JoinHandle<Result<()>>,
}

impl DownloadHandle {
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Waits for the download to reach a terminal state.
    pub async fn wait(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(DownloadError::Network(format!(
                "download task panicked: {err}"
            ))),
        }
    }
}

pub struct Downloader {
    config: DownloaderConfig,
    events: broadcast::Sender<DownloadEvent>,
    tasks: Arc<Mutex<HashMap<TaskId, Arc<DownloadTask>>>>,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        Self {
            config,
            events,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            semaphore,
        }
    }

    /// Receiver for the merged event stream of all tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Creates a task, enqueues it under the global concurrency cap and
    /// returns immediately. Task errors are absorbed by the scheduler so
    /// sibling downloads keep running; `DownloadHandle::wait` still
    /// surfaces them to the caller.
    pub fn download(&self, request: DownloadRequest) -> DownloadHandle {
        let task = DownloadTask::new(self.config.clone(), request);
        let id = task.id();

        // Re-emit everything the task publishes on the downloader channel.
        let mut task_events = task.subscribe();
        let forward = self.events.clone();
        tokio::spawn(async move {
            loop {
                match task_events.recv().await {
                    Ok(event) => {
                        let _ = forward.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(%id, skipped, "event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().insert(id, task.clone());

        let semaphore = self.semaphore.clone();
        let registry = self.tasks.clone();
        let job = task.clone();
        let join = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(DownloadError::Cancelled),
            };
            let result = job.start().await;
            if let Err(err) = &result {
                tracing::warn!(%id, error = %err, "download finished with error");
            }
            registry.lock().remove(&id);
            result
        });

        DownloadHandle { task, join }
    }

    /// Starts a download and waits for it to finish.
    pub async fn download_and_wait(&self, request: DownloadRequest) -> Result<()> {
        self.download(request).wait().await
    }

    fn get(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Snapshot of every active task.
    pub async fn task_infos(&self) -> Vec<TaskInfo> {
        let tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        let mut infos = Vec::with_capacity(tasks.len());
        for task in tasks {
            infos.push(task.info().await);
        }
        infos
    }

    pub fn pause(&self, id: TaskId) -> bool {
        self.get(id).is_some_and(|task| task.pause())
    }

    pub fn resume(&self, id: TaskId) -> bool {
        self.get(id).is_some_and(|task| task.resume())
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.get(id).is_some_and(|task| task.cancel())
    }

    pub fn pause_all(&self) {
        for task in self.tasks.lock().values() {
            task.pause();
        }
    }

    pub fn resume_all(&self) {
        for task in self.tasks.lock().values() {
            task.resume();
        }
    }

    pub fn cancel_all(&self) {
        for task in self.tasks.lock().values() {
            task.cancel();
        }
    }

    /// Number of tasks that have not reached a terminal state yet.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }
}
