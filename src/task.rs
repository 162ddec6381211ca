//! Download tasks and their lifecycle.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::notify::{ChannelId, MessageId};
use crate::transport::SourceHandle;

/// Unique identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task. Moves only forward:
/// `Queued -> Downloading -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Downloading)
                | (Self::Downloading, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Declares that a submission belongs to a group of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRef {
    pub id: String,
    /// Number of files the submitter announced.
    pub total_files: usize,
    /// Combined size of all files, `0` if unknown.
    pub total_size_hint: u64,
}

impl BatchRef {
    #[must_use]
    pub fn new(id: impl Into<String>, total_files: usize) -> Self {
        Self {
            id: id.into(),
            total_files,
            total_size_hint: 0,
        }
    }

    #[must_use]
    pub const fn with_size_hint(mut self, bytes: u64) -> Self {
        self.total_size_hint = bytes;
        self
    }
}

/// A request to download one file.
#[derive(Debug, Clone)]
pub struct Submission {
    pub source: SourceHandle,
    pub destination: PathBuf,
    /// Size in bytes, `0` when unknown until the transfer starts.
    pub expected_size: u64,
    /// Where status messages go.
    pub channel: ChannelId,
    /// Existing message to edit. A new one is sent when absent.
    pub status_message: Option<MessageId>,
    pub batch: Option<BatchRef>,
}

impl Submission {
    #[must_use]
    pub fn new(source: SourceHandle, destination: impl Into<PathBuf>, channel: ChannelId) -> Self {
        Self {
            source,
            destination: destination.into(),
            expected_size: 0,
            channel,
            status_message: None,
            batch: None,
        }
    }

    #[must_use]
    pub const fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_status_message(mut self, message: MessageId) -> Self {
        self.status_message = Some(message);
        self
    }

    #[must_use]
    pub fn in_batch(mut self, batch: BatchRef) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// A task's place inside its batch, fixed at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMembership {
    pub id: String,
    /// Zero-based arrival index.
    pub position: usize,
    pub total: usize,
}

/// One file transfer with its own lifecycle.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: TaskId,
    pub source: SourceHandle,
    pub destination: PathBuf,
    pub expected_size: u64,
    pub channel: ChannelId,
    pub status_message: Option<MessageId>,
    pub batch: Option<BatchMembership>,
    pub downloaded_bytes: u64,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    status: TaskStatus,
}

impl DownloadTask {
    /// Builds a queued task from a submission.
    #[must_use]
    pub fn from_submission(submission: Submission, batch: Option<BatchMembership>) -> Self {
        Self {
            id: TaskId::new(),
            source: submission.source,
            destination: submission.destination,
            expected_size: submission.expected_size,
            channel: submission.channel,
            status_message: submission.status_message,
            batch,
            downloaded_bytes: 0,
            retry_count: 0,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: TaskStatus::Queued,
        }
    }

    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.source.file_name
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_become(next) {
            log::warn!("Task {} cannot move from {} to {next}", self.id, self.status);
            return false;
        }
        self.status = next;
        true
    }

    /// Moves a queued task to `Downloading`.
    pub fn start(&mut self) -> bool {
        let moved = self.transition(TaskStatus::Downloading);
        if moved {
            self.started_at = Some(Utc::now());
        }
        moved
    }

    /// Moves a downloading task to its terminal state.
    pub fn finish(&mut self, success: bool) -> bool {
        let next = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let moved = self.transition(next);
        if moved {
            self.finished_at = Some(Utc::now());
        }
        moved
    }

    /// Records the byte count observed by the transfer. A count beyond the
    /// announced size raises the size instead of breaking
    /// `downloaded_bytes <= expected_size`.
    pub fn record_bytes(&mut self, downloaded: u64) {
        self.downloaded_bytes = downloaded;
        if self.expected_size > 0 && downloaded > self.expected_size {
            self.expected_size = downloaded;
        }
    }
}
