//! tele-dl - A download queue and concurrent transfer manager for media files.
//!
//! Submissions are queued in order, started by a bounded pool of workers, and
//! reported to a chat-style [`NotificationSink`] through rate-limited status
//! messages. Failed transfers are retried with backoff, finished files are
//! verified, and outcomes are counted in persisted statistics.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tele_dl::{
//!     ChannelId, DownloadConfig, DownloadManager, HttpTransport, LogSink, ShutdownMode,
//!     SourceHandle, Submission, TransportSet,
//! };
//!
//! # async fn example() -> tele_dl::Result<()> {
//! let http = reqwest::Client::new();
//! let transports = TransportSet::new(Arc::new(HttpTransport::simple(http)));
//! let sink = Arc::new(LogSink::new());
//! let manager = DownloadManager::builder(DownloadConfig::default(), transports, sink)
//!     .start()
//!     .await;
//!
//! let source = SourceHandle::new("https://example.com/video.mp4", "video.mp4");
//! manager
//!     .enqueue(Submission::new(source, "downloads/video.mp4", ChannelId(0)))
//!     .await?;
//!
//! manager.wait_idle().await;
//! println!("{}", manager.stats_report());
//! manager.shutdown(ShutdownMode::Graceful).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod batch;
pub mod categorize;
pub mod config;
pub mod error;
pub mod format;
pub mod fs;
pub mod limiter;
pub mod manager;
pub mod notify;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod task;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use batch::{BatchRegistry, BatchTracker, BatchUpdate};
pub use categorize::{Categorizer, KeepInPlace};
pub use config::{AppConfig, DownloadConfig, PathConfig};
pub use error::{Error, ErrorKind, Result};
pub use format::{format_bytes, format_duration, format_speed};
pub use fs::{FileSystem, TokioFileSystem};
pub use limiter::{RateLimiter, SpeedLimiter};
pub use manager::{Admission, DownloadManager, DownloadManagerBuilder, ShutdownMode};
pub use notify::{ChannelId, LogSink, MessageId, NotificationSink, Notifier};
pub use progress::{ProgressPolicy, ProgressTracker};
pub use retry::{RetryDecision, RetryPolicy};
pub use stats::{Stats, StatsManager};
pub use task::{BatchRef, DownloadTask, Submission, TaskId, TaskStatus};
pub use transport::{
    ChunkListener, HttpTransport, SourceHandle, Transport, TransportKind, TransportSet,
};
pub use verify::{VerifyPolicy, verify_download};
