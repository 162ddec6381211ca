//! Aggregated progress for groups of files submitted together.
//!
//! A [`BatchRegistry`] admits members into groups keyed by batch id, drops
//! duplicate sources, and hands out the shared [`BatchTracker`] that renders
//! one combined status message per group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::format::{format_bytes, format_duration, format_speed, percent, render_bar};
use crate::limiter::RateLimiter;
use crate::notify::{ChannelId, MessageId, Notifier};
use crate::task::{BatchMembership, BatchRef};

/// Counter deltas applied to a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    /// Bytes finished since the last update.
    pub downloaded: u64,
    /// Files that completed since the last update.
    pub completed: usize,
    /// Files that failed since the last update.
    pub failed: usize,
    /// Name and percent of the file currently transferring.
    pub current_file: Option<(String, f64)>,
}

impl BatchUpdate {
    /// One member finished with `bytes`.
    #[must_use]
    pub fn completed(bytes: u64) -> Self {
        Self {
            downloaded: bytes,
            completed: 1,
            ..Self::default()
        }
    }

    /// One member failed.
    #[must_use]
    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }

    /// Progress of the file in flight.
    #[must_use]
    pub fn current(name: impl Into<String>, percent: f64) -> Self {
        Self {
            current_file: Some((name.into(), percent)),
            ..Self::default()
        }
    }
}

/// Point-in-time counters of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub total_files: usize,
    pub completed: usize,
    pub failed: usize,
    pub downloaded: u64,
    pub finalized: bool,
}

#[derive(Debug)]
struct BatchState {
    total_files: usize,
    total_size: u64,
    completed: usize,
    failed: usize,
    downloaded: u64,
    current_file: Option<(String, f64)>,
    started: Instant,
    last_emit: Instant,
    finalized: bool,
}

impl BatchState {
    const fn done(&self) -> usize {
        self.completed + self.failed
    }
}

/// Combined status for the members of one batch.
#[derive(Debug)]
pub struct BatchTracker {
    id: String,
    notifier: Notifier,
    rate_limiter: Arc<RateLimiter>,
    channel: ChannelId,
    message: Option<MessageId>,
    update_interval: Duration,
    state: Mutex<BatchState>,
}

impl BatchTracker {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        notifier: Notifier,
        rate_limiter: Arc<RateLimiter>,
        channel: ChannelId,
        message: Option<MessageId>,
        total_files: usize,
        total_size: u64,
        update_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            notifier,
            rate_limiter,
            channel,
            message,
            update_interval,
            state: Mutex::new(BatchState {
                total_files,
                total_size,
                completed: 0,
                failed: 0,
                downloaded: 0,
                current_file: None,
                started: now,
                last_emit: now,
                finalized: false,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Applies counter deltas. Returns true if this update closed the batch.
    ///
    /// Counts beyond the declared total are dropped. The batch closes the
    /// moment completed plus failed reaches the total, and never again.
    pub async fn update(&self, update: BatchUpdate) -> bool {
        let mut state = self.state.lock().await;
        if state.finalized {
            if update.completed + update.failed > 0 {
                log::warn!("Batch {} got a result after it closed", self.id);
            }
            return false;
        }

        let room = state.total_files.saturating_sub(state.done());
        let completed = update.completed.min(room);
        let failed = update.failed.min(room - completed);
        if completed + failed < update.completed + update.failed {
            log::warn!("Batch {} got more results than files", self.id);
        }
        state.completed += completed;
        state.failed += failed;
        state.downloaded += update.downloaded;
        if let Some(current) = update.current_file {
            state.current_file = Some(current);
        }

        if state.done() >= state.total_files {
            self.finalize(&mut state).await;
            return true;
        }

        let now = Instant::now();
        if now.duration_since(state.last_emit) >= self.update_interval
            && self.message.is_some()
            && self.rate_limiter.can_update(&self.channel.to_string())
        {
            state.last_emit = now;
            let text = self.render_progress(&state);
            if let Some(message) = self.message {
                self.notifier.edit(self.channel, message, &text).await;
            }
        }
        false
    }

    /// Changes the expected member count, never below the results already
    /// recorded. Returns true if the batch closed because of it.
    pub async fn resize(&self, total_files: usize) -> bool {
        let mut state = self.state.lock().await;
        self.resize_locked(&mut state, total_files).await
    }

    /// Expects one member fewer, e.g. after a queued member was cancelled.
    pub async fn drop_member(&self) -> bool {
        let mut state = self.state.lock().await;
        let total = state.total_files.saturating_sub(1);
        self.resize_locked(&mut state, total).await
    }

    async fn resize_locked(&self, state: &mut BatchState, total_files: usize) -> bool {
        if state.finalized {
            return false;
        }
        state.total_files = total_files.max(state.done());
        if state.done() >= state.total_files {
            self.finalize(state).await;
            return true;
        }
        false
    }

    pub async fn snapshot(&self) -> BatchSnapshot {
        let state = self.state.lock().await;
        BatchSnapshot {
            total_files: state.total_files,
            completed: state.completed,
            failed: state.failed,
            downloaded: state.downloaded,
            finalized: state.finalized,
        }
    }

    async fn finalize(&self, state: &mut BatchState) {
        state.finalized = true;
        log::info!(
            "Batch {} finished: {} ok, {} failed of {}",
            self.id,
            state.completed,
            state.failed,
            state.total_files
        );
        let summary = self.render_summary(state);
        self.notifier.post(self.channel, self.message, &summary).await;

        if state.completed > 0 {
            let line = format!(
                "✅ Batch download complete! {}/{} files downloaded.",
                state.completed, state.total_files
            );
            self.notifier.send(self.channel, &line).await;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn average_speed(state: &BatchState) -> f64 {
        let secs = state.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            state.downloaded as f64 / secs
        } else {
            0.0
        }
    }

    fn render_progress(&self, state: &BatchState) -> String {
        let pct = percent(state.done() as u64, state.total_files as u64);
        let remaining = state.total_files.saturating_sub(state.done());
        let speed = Self::average_speed(state);

        let mut text = format!(
            "📦 BATCH DOWNLOAD PROGRESS (ID: {})\n\n✅ Completed: {}  |  ❌ Failed: {}  |  ⏳ Remaining: {remaining}\n[{}]  {pct:.1}%\n\n📊 Overall Progress:\nDownloaded: {}",
            self.id,
            state.completed,
            state.failed,
            render_bar(pct),
            format_bytes(state.downloaded),
        );
        if state.total_size > 0 {
            text.push_str(&format!(" of {}", format_bytes(state.total_size)));
        }
        text.push_str(&format!("\nSpeed: {}", format_speed(speed)));
        if speed > 0.0 && state.total_size > state.downloaded {
            #[allow(clippy::cast_precision_loss)]
            let left = (state.total_size - state.downloaded) as f64 / speed;
            if let Ok(eta) = Duration::try_from_secs_f64(left) {
                text.push_str(&format!("\nETA: {}", format_duration(eta)));
            }
        }
        if let Some((name, file_pct)) = &state.current_file {
            let position = state.done() + 1;
            if position <= state.total_files {
                text.push_str(&format!(
                    "\n🔽 CURRENT FILE ({position}/{}):\n{name}",
                    state.total_files
                ));
                if *file_pct > 0.0 {
                    text.push_str(&format!(" ({file_pct:.0}% complete)"));
                }
            }
        }
        text
    }

    fn render_summary(&self, state: &BatchState) -> String {
        let success_rate = percent(state.completed as u64, state.total_files as u64);
        format!(
            "✅ BATCH DOWNLOAD COMPLETE (ID: {})\n\n📊 Summary:\nTotal files: {}\n✓ Successfully downloaded: {} ({success_rate:.1}%)\n✗ Failed: {}\n💾 Total downloaded: {}\n⏱️ Time taken: {}\n🚀 Average speed: {}",
            self.id,
            state.total_files,
            state.completed,
            state.failed,
            format_bytes(state.downloaded),
            format_duration(state.started.elapsed()),
            format_speed(Self::average_speed(state)),
        )
    }
}

/// Result of admitting a source into a batch.
#[derive(Debug, Clone)]
pub enum BatchAdmission {
    /// The source is a new member.
    Joined {
        tracker: Arc<BatchTracker>,
        membership: BatchMembership,
        /// True if this member opened the group.
        opened: bool,
    },
    /// The source is already a member; nothing should be queued.
    Duplicate,
}

#[derive(Debug)]
struct BatchGroup {
    tracker: Arc<BatchTracker>,
    members: HashSet<String>,
    /// Members that left the queue without running.
    dropped: usize,
    declared_total: usize,
    sealed: bool,
}

impl BatchGroup {
    /// Members still expected to report a result.
    fn expected(&self) -> usize {
        self.members.len().saturating_sub(self.dropped)
    }
}

/// Open batches keyed by id.
#[derive(Debug)]
pub struct BatchRegistry {
    notifier: Notifier,
    rate_limiter: Arc<RateLimiter>,
    window: Duration,
    update_interval: Duration,
    groups: Mutex<HashMap<String, BatchGroup>>,
}

impl BatchRegistry {
    #[must_use]
    pub fn new(
        notifier: Notifier,
        rate_limiter: Arc<RateLimiter>,
        window: Duration,
        update_interval: Duration,
    ) -> Self {
        Self {
            notifier,
            rate_limiter,
            window,
            update_interval,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// How long a group collects members after its first one arrives.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Adds `source_id` to the batch described by `batch`, opening the group
    /// and its status message on first arrival.
    ///
    /// # Errors
    ///
    /// [`Error::BatchClosed`] once the collection window is over, and
    /// [`Error::BatchFull`] when every declared member already arrived.
    pub async fn admit(
        &self,
        batch: &BatchRef,
        source_id: &str,
        channel: ChannelId,
    ) -> Result<BatchAdmission> {
        let mut groups = self.groups.lock().await;

        if let Some(group) = groups.get_mut(&batch.id) {
            if group.members.contains(source_id) {
                log::info!("Dropping duplicate {source_id} in batch {}", batch.id);
                return Ok(BatchAdmission::Duplicate);
            }
            if group.sealed {
                return Err(Error::BatchClosed(batch.id.clone()));
            }
            if group.members.len() >= group.declared_total {
                return Err(Error::BatchFull {
                    batch: batch.id.clone(),
                    total: group.declared_total,
                });
            }
            group.members.insert(source_id.to_string());
            return Ok(BatchAdmission::Joined {
                tracker: Arc::clone(&group.tracker),
                membership: BatchMembership {
                    id: batch.id.clone(),
                    position: group.members.len() - 1,
                    total: group.declared_total,
                },
                opened: false,
            });
        }

        let declared_total = batch.total_files.max(1);
        let message = self
            .notifier
            .send(
                channel,
                &format!(
                    "📦 Batch {}: collecting {declared_total} files...",
                    batch.id
                ),
            )
            .await;
        let tracker = Arc::new(BatchTracker::new(
            batch.id.clone(),
            self.notifier.clone(),
            Arc::clone(&self.rate_limiter),
            channel,
            message,
            declared_total,
            batch.total_size_hint,
            self.update_interval,
        ));
        groups.insert(
            batch.id.clone(),
            BatchGroup {
                tracker: Arc::clone(&tracker),
                members: HashSet::from([source_id.to_string()]),
                dropped: 0,
                declared_total,
                sealed: false,
            },
        );
        log::info!("Opened batch {} for {declared_total} files", batch.id);

        Ok(BatchAdmission::Joined {
            tracker,
            membership: BatchMembership {
                id: batch.id.clone(),
                position: 0,
                total: declared_total,
            },
            opened: true,
        })
    }

    /// Ends the collection window of `batch_id`.
    ///
    /// The expected total shrinks to the members that actually arrived so a
    /// short batch can still close. Closed groups are forgotten.
    pub async fn seal(&self, batch_id: &str) {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get_mut(batch_id) else {
            return;
        };
        group.sealed = true;
        if group.members.len() < group.declared_total {
            log::info!(
                "Batch {batch_id} sealed with {} of {} files",
                group.expected(),
                group.declared_total
            );
            group.tracker.resize(group.expected()).await;
        }
        if group.tracker.snapshot().await.finalized {
            groups.remove(batch_id);
        }
    }

    /// Stops expecting a member that will never run, e.g. a cancelled queued
    /// task. Its source id stays known so a resubmission is still a
    /// duplicate. Returns true if the batch closed because of it.
    pub async fn drop_member(&self, batch_id: &str) -> bool {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get_mut(batch_id) else {
            return false;
        };
        group.dropped += 1;
        let closed = group.tracker.drop_member().await;
        if group.sealed && group.tracker.snapshot().await.finalized {
            groups.remove(batch_id);
        }
        closed
    }

    /// Forgets `batch_id` if its window is over and it has closed.
    pub async fn release(&self, batch_id: &str) {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get(batch_id) else {
            return;
        };
        if group.sealed && group.tracker.snapshot().await.finalized {
            groups.remove(batch_id);
        }
    }

    /// Returns the tracker of an open batch.
    pub async fn tracker(&self, batch_id: &str) -> Option<Arc<BatchTracker>> {
        self.groups
            .lock()
            .await
            .get(batch_id)
            .map(|g| Arc::clone(&g.tracker))
    }

    /// Number of batches currently held.
    pub async fn len(&self) -> usize {
        self.groups.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    fn tracker(sink: &Arc<RecordingSink>, total: usize) -> BatchTracker {
        BatchTracker::new(
            "BDL-1",
            Notifier::new(sink.clone()),
            Arc::new(RateLimiter::new(Duration::from_secs(2))),
            ChannelId(5),
            Some(MessageId(50)),
            total,
            3_000,
            Duration::from_secs(5),
        )
    }

    fn registry(sink: &Arc<RecordingSink>) -> BatchRegistry {
        BatchRegistry::new(
            Notifier::new(sink.clone()),
            Arc::new(RateLimiter::default()),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn closes_exactly_once_when_all_members_report() {
        let sink = Arc::new(RecordingSink::new());
        let batch = tracker(&sink, 3);

        assert!(!batch.update(BatchUpdate::completed(1_000)).await);
        assert!(!batch.update(BatchUpdate::failed()).await);
        assert!(!batch.snapshot().await.finalized);
        assert!(batch.update(BatchUpdate::completed(1_000)).await);

        let snap = batch.snapshot().await;
        assert_eq!((snap.completed, snap.failed), (2, 1));
        assert!(snap.finalized);

        assert!(!batch.update(BatchUpdate::completed(1)).await);
        assert!(!batch.resize(1).await);

        let summaries: Vec<_> = sink
            .texts()
            .into_iter()
            .filter(|t| t.contains("BATCH DOWNLOAD COMPLETE"))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].contains("Successfully downloaded: 2 (66.7%)"));
        assert!(sink.texts().iter().any(|t| t.contains("2/3 files downloaded")));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failed_batch_skips_success_line() {
        let sink = Arc::new(RecordingSink::new());
        let batch = tracker(&sink, 1);
        assert!(batch.update(BatchUpdate::failed()).await);
        assert!(!sink.texts().iter().any(|t| t.contains("files downloaded.")));
    }

    #[tokio::test(start_paused = true)]
    async fn counts_never_exceed_total() {
        let sink = Arc::new(RecordingSink::new());
        let batch = tracker(&sink, 2);
        let closed = batch
            .update(BatchUpdate {
                completed: 5,
                failed: 5,
                ..BatchUpdate::default()
            })
            .await;
        assert!(closed);
        let snap = batch.snapshot().await;
        assert_eq!(snap.completed + snap.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_throttled_and_shows_current_file() {
        let sink = Arc::new(RecordingSink::new());
        let batch = tracker(&sink, 3);

        batch.update(BatchUpdate::current("ep1.mkv", 40.0)).await;
        assert!(sink.edits().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        batch.update(BatchUpdate::current("ep1.mkv", 55.0)).await;
        let edits = sink.edits();
        assert_eq!(edits.len(), 1);
        assert!(edits[0].text.contains("CURRENT FILE (1/3)"));
        assert!(edits[0].text.contains("ep1.mkv (55% complete)"));
        assert!(edits[0].text.contains("Remaining: 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_total_can_close_batch() {
        let sink = Arc::new(RecordingSink::new());
        let batch = tracker(&sink, 3);
        batch.update(BatchUpdate::completed(10)).await;
        assert!(!batch.drop_member().await);
        assert!(batch.drop_member().await);
        assert_eq!(batch.snapshot().await.total_files, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_drops_duplicate_sources() {
        let sink = Arc::new(RecordingSink::new());
        let registry = registry(&sink);
        let batch = BatchRef::new("B1", 2);

        let first = registry.admit(&batch, "src-a", ChannelId(1)).await.unwrap();
        assert!(matches!(first, BatchAdmission::Joined { opened: true, .. }));
        let dup = registry.admit(&batch, "src-a", ChannelId(1)).await.unwrap();
        assert!(matches!(dup, BatchAdmission::Duplicate));

        let BatchAdmission::Joined {
            membership, opened, ..
        } = registry.admit(&batch, "src-b", ChannelId(1)).await.unwrap()
        else {
            panic!("second source should join");
        };
        assert!(!opened);
        assert_eq!(membership.position, 1);
        assert_eq!(membership.total, 2);

        let err = registry.admit(&batch, "src-c", ChannelId(1)).await.unwrap_err();
        assert!(matches!(err, Error::BatchFull { total: 2, .. }));

        // Exactly one batch message was created.
        assert_eq!(sink.sends().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sealing_shrinks_short_batch_and_rejects_late_members() {
        let sink = Arc::new(RecordingSink::new());
        let registry = registry(&sink);
        let batch = BatchRef::new("B2", 4);

        let BatchAdmission::Joined { tracker, .. } =
            registry.admit(&batch, "a", ChannelId(1)).await.unwrap()
        else {
            panic!("expected join");
        };
        registry.admit(&batch, "b", ChannelId(1)).await.unwrap();
        tracker.update(BatchUpdate::completed(1)).await;

        registry.seal("B2").await;
        assert_eq!(tracker.snapshot().await.total_files, 2);
        assert!(matches!(
            registry.admit(&batch, "c", ChannelId(1)).await,
            Err(Error::BatchClosed(_))
        ));

        assert!(tracker.update(BatchUpdate::completed(1)).await);
        registry.release("B2").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sealing_a_finished_batch_forgets_it() {
        let sink = Arc::new(RecordingSink::new());
        let registry = registry(&sink);
        let batch = BatchRef::new("B3", 1);
        let BatchAdmission::Joined { tracker, .. } =
            registry.admit(&batch, "a", ChannelId(1)).await.unwrap()
        else {
            panic!("expected join");
        };
        assert!(tracker.update(BatchUpdate::completed(1)).await);

        // Still remembered for dedup until the window ends.
        registry.release("B3").await;
        assert!(matches!(
            registry.admit(&batch, "a", ChannelId(1)).await.unwrap(),
            BatchAdmission::Duplicate
        ));
        registry.seal("B3").await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sealing_keeps_dropped_members_out_of_the_total() {
        let sink = Arc::new(RecordingSink::new());
        let registry = registry(&sink);
        let batch = BatchRef::new("B4", 3);
        let BatchAdmission::Joined { tracker, .. } =
            registry.admit(&batch, "a", ChannelId(1)).await.unwrap()
        else {
            panic!("expected join");
        };
        registry.admit(&batch, "b", ChannelId(1)).await.unwrap();

        assert!(!registry.drop_member("B4").await);
        assert!(!tracker.update(BatchUpdate::completed(5)).await);

        registry.seal("B4").await;
        let snapshot = tracker.snapshot().await;
        assert!(snapshot.finalized);
        assert_eq!(snapshot.total_files, 1);
        assert_eq!(snapshot.completed, 1);
        assert!(registry.is_empty().await);
        assert_eq!(sink.count_containing("BATCH DOWNLOAD COMPLETE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_pending_member_of_sealed_batch_forgets_it() {
        let sink = Arc::new(RecordingSink::new());
        let registry = registry(&sink);
        let batch = BatchRef::new("B5", 2);
        let BatchAdmission::Joined { tracker, .. } =
            registry.admit(&batch, "a", ChannelId(1)).await.unwrap()
        else {
            panic!("expected join");
        };
        registry.admit(&batch, "b", ChannelId(1)).await.unwrap();
        registry.seal("B5").await;
        tracker.update(BatchUpdate::failed()).await;

        assert!(registry.drop_member("B5").await);
        assert!(registry.is_empty().await);
        assert!(!registry.drop_member("B5").await);
    }
}
