//! Lifecycle events published by tasks and re-broadcast by the downloader.
//!
//! Events are delivered over a `tokio::sync::broadcast` channel; call
//! `Downloader::subscribe` (or `DownloadTask::subscribe`) to receive them.
//! The enum serializes as a tagged union so it can cross process
//! boundaries unchanged.
use serde::{Deserialize, Serialize};

use crate::progress::Progress;
use crate::task::TaskId;

/// Number of events buffered per broadcast channel before slow
/// subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Every observable state change of a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// The task finished probing and began downloading.
    Started { id: TaskId },

    /// Aggregate progress, throttled to one event per percent or second.
    Progress { id: TaskId, progress: Progress },

    /// One segment finished.
    SegmentCompleted { id: TaskId, segment: usize },

    /// One segment exhausted its retry budget.
    SegmentFailed {
        id: TaskId,
        segment: usize,
        error: String,
    },

    /// A request was redirected to a different URL.
    Redirected {
        id: TaskId,
        from: String,
        to: String,
    },

    Paused { id: TaskId },

    Resumed { id: TaskId },

    /// The task was cancelled; the control file is kept for a later resume.
    Cancelled { id: TaskId },

    /// Every segment completed and the control file was removed.
    Completed { id: TaskId },

    /// The task terminated with an error.
    Failed { id: TaskId, error: String },
}

impl DownloadEvent {
    /// The task this event belongs to.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { id }
            | Self::Progress { id, .. }
            | Self::SegmentCompleted { id, .. }
            | Self::SegmentFailed { id, .. }
            | Self::Redirected { id, .. }
            | Self::Paused { id }
            | Self::Resumed { id }
            | Self::Cancelled { id }
            | Self::Completed { id }
            | Self::Failed { id, .. } => *id,
        }
    }
}
