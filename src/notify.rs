//! Status message delivery.
//!
//! The chat transport implements [`NotificationSink`]. Everything inside the
//! crate talks to it through [`Notifier`], which turns failed edits into log
//! lines instead of errors.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// Identifies where status messages for a task are posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a message previously sent to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interface the manager uses to create and edit status messages.
///
/// Implementations must be safe to call concurrently from several workers.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Posts a new message and returns its id.
    async fn send(&self, channel: ChannelId, text: &str) -> Result<MessageId>;

    /// Replaces the text of an existing message.
    async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) -> Result<()>;
}

/// Best-effort front for a [`NotificationSink`].
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Sends a message, logging and returning `None` on failure.
    pub async fn send(&self, channel: ChannelId, text: &str) -> Option<MessageId> {
        match self.sink.send(channel, text).await {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to send status to {channel}: {e}");
                None
            }
        }
    }

    /// Edits a message. Failures are logged, never returned.
    pub async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) {
        if let Err(e) = self.sink.edit(channel, message, text).await {
            log::debug!("Status edit {channel}/{message} failed (might be rate limited): {e}");
        }
    }

    /// Edits `message` when present, otherwise sends a new one.
    pub async fn post(&self, channel: ChannelId, message: Option<MessageId>, text: &str) {
        match message {
            Some(id) => self.edit(channel, id, text).await,
            None => {
                self.send(channel, text).await;
            }
        }
    }
}

/// A sink that writes every status message to the log.
///
/// Used by the command line front end, where there is no chat to post to.
#[derive(Debug)]
pub struct LogSink {
    next_id: AtomicI64,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, channel: ChannelId, text: &str) -> Result<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::info!("[{channel}#{id}] {}", text.replace('\n', " | "));
        Ok(id)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) -> Result<()> {
        log::info!("[{channel}#{message}] {}", text.replace('\n', " | "));
        Ok(())
    }
}
