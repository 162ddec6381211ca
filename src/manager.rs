//! The download manager: admission, dispatch, workers and reporting.
//!
//! Submissions enter a FIFO [`TaskQueue`]. One dispatch loop takes a worker
//! slot from a semaphore *before* popping the head task, so tasks start in
//! queue order while finishing in whatever order their transfers allow.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::{BatchAdmission, BatchRegistry, BatchTracker, BatchUpdate};
use crate::categorize::{Categorizer, KeepInPlace};
use crate::config::{DownloadConfig, PathConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::format::{format_bytes, format_duration, format_speed, percent, truncate};
use crate::fs::{FileSystem, TokioFileSystem, part_path};
use crate::limiter::{RateLimiter, SpeedLimiter};
use crate::notify::{ChannelId, NotificationSink, Notifier};
use crate::progress::{Completion, ProgressPolicy, ProgressTracker, TrackerLabel};
use crate::queue::TaskQueue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::stats::{Outcome, Stats, StatsManager};
use crate::task::{DownloadTask, Submission, TaskId, TaskStatus};
use crate::transport::{ChunkListener, Transport, TransportSet};
use crate::verify::{VerifyPolicy, verify_download};

/// Finished tasks kept for status lookups.
const RECENT_CAPACITY: usize = 256;
/// Longest pause between two long-download checks.
const WATCHDOG_TICK: Duration = Duration::from_secs(300);
/// Queued files listed by [`DownloadManager::queue_status`].
const QUEUE_PREVIEW: usize = 5;
/// Longest error detail shown to users.
const ERROR_DETAIL_CHARS: usize = 100;

/// Result of [`DownloadManager::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The task is waiting at `position` (1-based).
    Queued { id: TaskId, position: usize },
    /// The source is already a member of the same batch.
    Duplicate,
}

/// How [`DownloadManager::shutdown`] treats transfers in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let running transfers finish.
    Graceful,
    /// Interrupt running transfers, fail them and delete their files.
    Abort,
}

#[derive(Debug)]
struct ActiveDownload {
    file_name: String,
    channel: ChannelId,
    tracker: Arc<ProgressTracker>,
    started: Instant,
    last_notice: Option<Instant>,
}

struct Inner {
    config: DownloadConfig,
    retry: RetryPolicy,
    verify: VerifyPolicy,
    progress: ProgressPolicy,
    queue: TaskQueue,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<TaskId, ActiveDownload>>,
    recent: Mutex<VecDeque<DownloadTask>>,
    stats: Arc<StatsManager>,
    batches: BatchRegistry,
    transports: TransportSet,
    notifier: Notifier,
    rate_limiter: Arc<RateLimiter>,
    categorizer: Arc<dyn Categorizer>,
    fs: Arc<dyn FileSystem>,
    accepting: AtomicBool,
    fatal: Mutex<Option<String>>,
    outstanding: AtomicUsize,
    idle: Notify,
    stop_dispatch: CancellationToken,
    stop_background: CancellationToken,
    abort: CancellationToken,
    tasks: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a [`DownloadManager`].
pub struct DownloadManagerBuilder {
    config: DownloadConfig,
    transports: TransportSet,
    sink: Arc<dyn NotificationSink>,
    stats_file: PathBuf,
    categorizer: Arc<dyn Categorizer>,
    fs: Arc<dyn FileSystem>,
}

impl DownloadManagerBuilder {
    /// Where statistics are persisted.
    #[must_use]
    pub fn stats_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_file = path.into();
        self
    }

    #[must_use]
    pub fn categorizer(mut self, categorizer: Arc<dyn Categorizer>) -> Self {
        self.categorizer = categorizer;
        self
    }

    #[must_use]
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Loads statistics and starts the dispatch loop, the stats flusher and
    /// the long-download watchdog.
    pub async fn start(self) -> DownloadManager {
        let stats = Arc::new(StatsManager::load(self.stats_file).await);
        let config = self.config;
        let notifier = Notifier::new(self.sink);
        let rate_limiter = Arc::new(RateLimiter::new(config.notify_min_interval()));
        let progress = ProgressPolicy {
            update_interval: config.progress_update_interval(),
            eta_inflation_threshold: config.eta_inflation_threshold_bytes,
            eta_inflation_factor: config.eta_inflation_factor,
        };

        let inner = Arc::new(Inner {
            retry: RetryPolicy::from_config(&config),
            verify: VerifyPolicy::default().with_min_size_ratio(config.verify_min_size_ratio),
            progress,
            queue: TaskQueue::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            active: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            stats,
            batches: BatchRegistry::new(
                notifier.clone(),
                Arc::clone(&rate_limiter),
                config.batch_window(),
                config.progress_update_interval(),
            ),
            transports: self.transports,
            notifier,
            rate_limiter,
            categorizer: self.categorizer,
            fs: self.fs,
            accepting: AtomicBool::new(true),
            fatal: Mutex::new(None),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            stop_dispatch: CancellationToken::new(),
            stop_background: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        });

        log::info!(
            "Download manager started with {} worker slot(s), {:?}",
            inner.config.max_concurrent_downloads.max(1),
            inner.transports
        );
        inner.tasks.spawn(Inner::dispatch(Arc::clone(&inner)));
        inner.tasks.spawn(Inner::watchdog(Arc::clone(&inner)));
        inner.stats.spawn_flusher(
            inner.config.stats_flush_interval(),
            inner.stop_background.clone(),
            &inner.tasks,
        );

        DownloadManager { inner }
    }
}

/// Queue, worker pool and reporting for media downloads.
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("queued", &self.inner.queue.len())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.inner.stop_dispatch.cancel();
        self.inner.stop_background.cancel();
    }
}

impl DownloadManager {
    /// Starts building a manager around `transports`, posting status to `sink`.
    #[must_use]
    pub fn builder(
        config: DownloadConfig,
        transports: TransportSet,
        sink: Arc<dyn NotificationSink>,
    ) -> DownloadManagerBuilder {
        DownloadManagerBuilder {
            config,
            transports,
            sink,
            stats_file: PathConfig::default().stats_file,
            categorizer: Arc::new(KeepInPlace),
            fs: Arc::new(TokioFileSystem),
        }
    }

    /// Admits a submission into the queue.
    ///
    /// Sends a "Queued" message when the submission has no status message,
    /// and a queue-position update when it does not start right away.
    ///
    /// # Errors
    ///
    /// [`Error::NotAccepting`] after shutdown or a fatal error, and the batch
    /// errors of [`BatchRegistry::admit`].
    pub async fn enqueue(&self, submission: Submission) -> Result<Admission> {
        let inner = &self.inner;
        inner.ensure_accepting()?;

        let membership = match &submission.batch {
            Some(batch) => {
                match inner
                    .batches
                    .admit(batch, &submission.source.id, submission.channel)
                    .await?
                {
                    BatchAdmission::Duplicate => return Ok(Admission::Duplicate),
                    BatchAdmission::Joined {
                        membership, opened, ..
                    } => {
                        if opened {
                            inner.schedule_seal(membership.id.clone());
                        }
                        Some(membership)
                    }
                }
            }
            None => None,
        };

        let mut task = DownloadTask::from_submission(submission, membership);
        if task.status_message.is_none() {
            task.status_message = inner
                .notifier
                .send(task.channel, &format!("📥 Queued: {}", task.file_name()))
                .await;
        }

        let id = task.id;
        let channel = task.channel;
        let message = task.status_message;
        let name = task.file_name().to_string();

        inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let position = inner.queue.push(task);
        if !inner.accepting.load(Ordering::SeqCst) {
            // Stopped between the check and the push.
            if let Some(task) = inner.queue.remove(id) {
                inner.forget_queued(&task).await;
                return Err(inner.not_accepting());
            }
        }
        log::info!("Added {name} to download queue (position {position})");

        if position > 1 {
            inner
                .notifier
                .post(
                    channel,
                    message,
                    &format!("⏳ In download queue... (position: {position})\n📂 {name}"),
                )
                .await;
        }
        Ok(Admission::Queued { id, position })
    }

    /// Removes a task that has not started. Returns false if it is unknown
    /// or already running.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let Some(task) = self.inner.queue.remove(id) else {
            return false;
        };
        log::info!("Cancelled queued download {}", task.file_name());
        self.inner
            .notifier
            .post(
                task.channel,
                task.status_message,
                &format!("🚫 Download cancelled: {}", task.file_name()),
            )
            .await;
        self.inner.forget_queued(&task).await;
        true
    }

    /// Resolves once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stops admission and dispatch, settles running transfers according to
    /// `mode`, drops queued tasks and flushes statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the final stats flush fails.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        let inner = &self.inner;
        log::info!("Shutting down download manager ({mode:?})");
        inner.accepting.store(false, Ordering::SeqCst);
        inner.stop_dispatch.cancel();
        if mode == ShutdownMode::Abort {
            inner.abort.cancel();
        }
        inner
            .abandon_queued("🚫 Download cancelled: the downloader is shutting down")
            .await;
        inner.stop_background.cancel();

        inner.tasks.close();
        inner.tasks.wait().await;
        inner.stats.save().await
    }

    /// Reason the manager stopped itself, if it did.
    #[must_use]
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.inner.fatal).clone()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    /// Where a task is in its lifecycle, if it is still known.
    #[must_use]
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        if self.inner.queue.snapshot().iter().any(|e| e.id == id) {
            return Some(TaskStatus::Queued);
        }
        if lock(&self.inner.active).contains_key(&id) {
            return Some(TaskStatus::Downloading);
        }
        self.finished_task(id).map(|t| t.status())
    }

    /// A recently finished task.
    #[must_use]
    pub fn finished_task(&self, id: TaskId) -> Option<DownloadTask> {
        lock(&self.inner.recent).iter().find(|t| t.id == id).cloned()
    }

    /// Human-readable view of running and waiting downloads.
    #[must_use]
    pub fn queue_status(&self) -> String {
        let inner = &self.inner;
        let queued = inner.queue.snapshot();
        let active: Vec<(String, u64, u64)> = {
            let mut rows: Vec<_> = lock(&inner.active)
                .values()
                .map(|a| {
                    let name = a.file_name.clone();
                    (a.started, name, a.tracker.downloaded(), a.tracker.total())
                })
                .collect();
            rows.sort_by_key(|row| row.0);
            rows.into_iter()
                .map(|(_, name, done, total)| (name, done, total))
                .collect()
        };

        if queued.is_empty() && active.is_empty() {
            return "No active downloads or queued files.".to_string();
        }

        let mut status = format!(
            "📋 DOWNLOAD QUEUE STATUS\n\n⏳ Active downloads: {}/{}\n🔄 Queued files: {}\n",
            active.len(),
            inner.config.max_concurrent_downloads.max(1),
            queued.len()
        );

        if !active.is_empty() {
            status.push_str("\n🔽 CURRENTLY DOWNLOADING:\n");
            for (i, (name, done, total)) in active.iter().enumerate() {
                let progress = if *total > 0 {
                    format!(" ({:.0}% complete)", percent(*done, *total))
                } else {
                    String::new()
                };
                status.push_str(&format!("{}. {name}{progress}\n", i + 1));
            }
        }

        if !queued.is_empty() {
            let shown = queued.len().min(QUEUE_PREVIEW);
            if shown < queued.len() {
                status.push_str(&format!(
                    "\n⏭️ NEXT IN QUEUE (showing {shown} of {}):\n",
                    queued.len()
                ));
            } else {
                status.push_str("\n⏭️ NEXT IN QUEUE:\n");
            }
            for (i, entry) in queued.iter().take(shown).enumerate() {
                let size = if entry.expected_size > 0 {
                    format!(" ({})", format_bytes(entry.expected_size))
                } else {
                    String::new()
                };
                status.push_str(&format!("{}. {}{size}\n", i + 1, entry.file_name));
            }
            if shown < queued.len() {
                status.push_str(&format!("...and {} more files", queued.len() - shown));
            }
        }
        status
    }

    /// Human-readable summary of the persisted statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats_report(&self) -> String {
        let stats = self.stats();
        let uptime = stats.uptime();
        let secs = uptime.as_secs_f64();

        let (avg_speed, avg_time) =
            if stats.successful_downloads > 0 && stats.total_bytes > 0 && secs > 0.0 {
                let per_file = u32::try_from(stats.successful_downloads).unwrap_or(u32::MAX);
                (
                    format_speed(stats.total_bytes as f64 / secs),
                    format_duration(uptime / per_file),
                )
            } else {
                ("N/A".to_string(), "N/A".to_string())
            };

        format!(
            "📊 DOWNLOAD STATISTICS\n\n📆 Uptime: {}\n📥 Files handled: {}\n\nDOWNLOADS:\n✅ Successful: {} ({:.1}%)\n❌ Failed: {} ({:.1}%)\n💾 Total data: {}\n\nPERFORMANCE:\n⚡ Average speed: {avg_speed}\n⏱️ Average time per file: {avg_time}\n📊 Peak concurrent downloads: {}/{}\n\n⏳ Current status: {} active, {} queued",
            format_duration(uptime),
            stats.total_downloads,
            stats.successful_downloads,
            stats.success_rate(),
            stats.failed_downloads,
            stats.failure_rate(),
            format_bytes(stats.total_bytes),
            stats.peak_concurrent,
            self.inner.config.max_concurrent_downloads.max(1),
            self.active_count(),
            self.queued_count(),
        )
    }
}

/// Removes a task from the active set when its worker ends, even by panic.
struct ActiveGuard<'a> {
    inner: &'a Inner,
    id: TaskId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.active).remove(&self.id);
        self.inner.settle();
    }
}

/// Feeds transport chunks into the speed limiter, the task tracker and the
/// batch tracker.
struct TaskProgress<'a> {
    tracker: &'a ProgressTracker,
    batch: Option<&'a BatchTracker>,
    speed: SpeedLimiter,
}

#[async_trait]
impl ChunkListener for TaskProgress<'_> {
    async fn on_chunk(&self, bytes: u64, total_known: u64) {
        self.speed.limit(bytes).await;
        if total_known > 0 {
            self.tracker.set_total_if_unknown(total_known);
        }
        self.tracker.update(bytes).await;
        if let Some(batch) = self.batch {
            let pct = percent(self.tracker.downloaded(), self.tracker.total());
            batch
                .update(BatchUpdate::current(self.tracker.label().file_name.clone(), pct))
                .await;
        }
    }

    async fn on_resume(&self, offset: u64) {
        self.tracker.restart_at(offset).await;
    }
}

impl Inner {
    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self.not_accepting())
        }
    }

    fn not_accepting(&self) -> Error {
        let reason = lock(&self.fatal)
            .clone()
            .unwrap_or_else(|| "shutting down".to_string());
        Error::NotAccepting(reason)
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Accounts for a queued task that will never run.
    async fn forget_queued(&self, task: &DownloadTask) {
        if let Some(membership) = &task.batch {
            if self.batches.drop_member(&membership.id).await {
                log::info!("Batch {} closed after dropping a queued member", membership.id);
            }
        }
        self.settle();
    }

    async fn abandon_queued(&self, text: &str) {
        for task in self.queue.drain() {
            log::warn!("Dropping queued download {}", task.file_name());
            self.notifier.post(task.channel, task.status_message, text).await;
            self.forget_queued(&task).await;
        }
    }

    /// Stops admission and dispatch after an error that affects every task.
    async fn trip(&self, reason: &str) {
        {
            let mut fatal = lock(&self.fatal);
            if fatal.is_some() {
                return;
            }
            *fatal = Some(reason.to_string());
        }
        log::error!("Fatal error, no longer accepting downloads: {reason}");
        self.accepting.store(false, Ordering::SeqCst);
        self.stop_dispatch.cancel();
        self.abandon_queued(&format!(
            "❌ Download not started: {}",
            truncate(reason, ERROR_DETAIL_CHARS)
        ))
        .await;
    }

    fn schedule_seal(self: &Arc<Self>, batch_id: String) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(inner.batches.window()) => {}
                () = inner.stop_background.cancelled() => {}
            }
            inner.batches.seal(&batch_id).await;
        });
    }

    async fn dispatch(inner: Arc<Self>) {
        log::debug!("Dispatch loop started");
        loop {
            let permit = tokio::select! {
                biased;
                () = inner.stop_dispatch.cancelled() => break,
                permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                biased;
                () = inner.stop_dispatch.cancelled() => break,
                task = inner.queue.pop() => task,
            };
            let (task, tracker) = inner.begin(task);
            inner
                .tasks
                .spawn(Self::run(Arc::clone(&inner), task, tracker, permit));
        }
        log::debug!("Dispatch loop stopped");
    }

    /// Marks `task` as downloading and registers it as active.
    fn begin(&self, mut task: DownloadTask) -> (DownloadTask, Arc<ProgressTracker>) {
        task.start();
        let label = task.batch.as_ref().map_or_else(
            || TrackerLabel::single(task.file_name()),
            |m| TrackerLabel {
                file_name: task.file_name().to_string(),
                position: m.position,
                total_files: m.total,
            },
        );
        let tracker = Arc::new(ProgressTracker::new(
            self.notifier.clone(),
            Arc::clone(&self.rate_limiter),
            task.channel,
            task.status_message,
            label,
            task.expected_size,
            self.progress,
        ));

        let active_now = {
            let mut active = lock(&self.active);
            active.insert(
                task.id,
                ActiveDownload {
                    file_name: task.file_name().to_string(),
                    channel: task.channel,
                    tracker: Arc::clone(&tracker),
                    started: Instant::now(),
                    last_notice: None,
                },
            );
            active.len()
        };
        self.stats.observe_concurrency(active_now);
        (task, tracker)
    }

    async fn run(
        inner: Arc<Self>,
        mut task: DownloadTask,
        tracker: Arc<ProgressTracker>,
        permit: OwnedSemaphorePermit,
    ) {
        let _slot = permit;
        let _active = ActiveGuard {
            inner: &inner,
            id: task.id,
        };

        inner
            .notifier
            .post(
                task.channel,
                task.status_message,
                &format!("🔄 Starting download: {}...", task.file_name()),
            )
            .await;

        let batch = match &task.batch {
            Some(m) => inner.batches.tracker(&m.id).await,
            None => None,
        };

        let result = tokio::select! {
            result = inner.transfer(&mut task, &tracker, batch.as_deref()) => result,
            () = inner.abort.cancelled() => Err(Error::Cancelled),
        };
        inner.conclude(task, &tracker, batch.as_deref(), result).await;
    }

    /// Runs attempts until one succeeds or the retry policy gives up.
    async fn transfer(
        &self,
        task: &mut DownloadTask,
        tracker: &ProgressTracker,
        batch: Option<&BatchTracker>,
    ) -> Result<PathBuf> {
        let (kind, transport) = self.transports.select(
            &task.source,
            task.expected_size,
            self.config.bulk_threshold_bytes,
        );
        log::info!(
            "Using {} ({kind:?}) for {} ({})",
            transport.name(),
            task.file_name(),
            format_bytes(task.expected_size)
        );

        let listener = TaskProgress {
            tracker,
            batch,
            speed: SpeedLimiter::new(self.config.max_speed_mbps),
        };
        let mut attempt = 0;
        let mut verification_failures = 0;

        loop {
            attempt += 1;
            tracker.restart_at(0).await;

            let error = match self.attempt(transport.as_ref(), task, &listener).await {
                Ok(path) => return Ok(self.categorize(&path).await),
                Err(e) => e,
            };
            if error.kind() == ErrorKind::Verification {
                verification_failures += 1;
            }
            log::warn!(
                "Download attempt {attempt}/{} failed for {}: {error}",
                self.retry.max_attempts(),
                task.file_name()
            );

            let wait = match self.retry.decide(&error, attempt, verification_failures) {
                RetryDecision::GiveUp => return Err(error),
                RetryDecision::Retry(wait) => wait,
            };
            task.retry_count += 1;

            let notice = if let Error::RateLimited { .. } = error {
                format!(
                    "⏳ Rate limited by source. Retrying in {:.1}s... ({attempt}/{})",
                    wait.as_secs_f64(),
                    self.retry.max_retries
                )
            } else {
                format!(
                    "⚠️ Download interrupted. Retrying in {:.1}s... ({attempt}/{})\n{}",
                    wait.as_secs_f64(),
                    self.retry.max_retries,
                    truncate(&error.to_string(), ERROR_DETAIL_CHARS)
                )
            };
            self.notifier
                .post(task.channel, task.status_message, &notice)
                .await;
            tokio::time::sleep(wait).await;

            if let Err(e) = transport.check_connection().await {
                let extra = self.retry.backoff(attempt);
                log::warn!(
                    "{} unreachable before retry ({e}), waiting {extra:?} more",
                    transport.name()
                );
                tokio::time::sleep(extra).await;
            }
        }
    }

    /// One transport call under the overall timeout, then verification.
    async fn attempt(
        &self,
        transport: &dyn Transport,
        task: &DownloadTask,
        listener: &TaskProgress<'_>,
    ) -> Result<PathBuf> {
        let download = transport.download(&task.source, &task.destination, listener);
        let timeout = self.config.transfer_timeout();
        let path = if timeout.is_zero() {
            download.await?
        } else {
            tokio::time::timeout(timeout, download)
                .await
                .map_err(|_| Error::Timeout(timeout))??
        };

        if self.config.verify_downloads {
            let expected = if task.expected_size > 0 {
                task.expected_size
            } else {
                listener.tracker.total()
            };
            verify_download(self.fs.as_ref(), &path, expected, &self.verify).await?;
        }
        Ok(path)
    }

    async fn categorize(&self, path: &Path) -> PathBuf {
        match self.categorizer.categorize(path).await {
            Ok(final_path) => final_path,
            Err(e) => {
                log::warn!("Could not categorize {}: {e}", path.display());
                path.to_path_buf()
            }
        }
    }

    async fn remove_artifacts(&self, destination: &Path) {
        for path in [part_path(destination), destination.to_path_buf()] {
            match self.fs.remove_file(&path).await {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }

    /// Records the terminal outcome everywhere it is reported.
    async fn conclude(
        &self,
        mut task: DownloadTask,
        tracker: &ProgressTracker,
        batch: Option<&BatchTracker>,
        result: Result<PathBuf>,
    ) {
        task.record_bytes(tracker.downloaded());
        let success = result.is_ok();
        task.finish(success);

        match &result {
            Ok(final_path) => {
                log::info!(
                    "Download complete: {} ({})",
                    final_path.display(),
                    format_bytes(task.downloaded_bytes)
                );
                self.stats.record(Outcome::Completed {
                    bytes: task.downloaded_bytes,
                });
            }
            Err(e) => {
                log::error!(
                    "Download failed after {} attempt(s): {}: {e}",
                    task.retry_count + 1,
                    task.file_name()
                );
                self.remove_artifacts(&task.destination).await;
                self.stats.record(Outcome::Failed);
                if e.stops_manager() {
                    self.trip(&e.to_string()).await;
                }
            }
        }

        if let (Some(batch), Some(membership)) = (batch, &task.batch) {
            let update = if success {
                BatchUpdate::completed(task.downloaded_bytes)
            } else {
                BatchUpdate::failed()
            };
            if batch.update(update).await {
                self.batches.release(&membership.id).await;
            }
        }

        let detail;
        let completion = match &result {
            Ok(final_path) => Completion::Success { final_path },
            Err(e) => {
                detail = truncate(&e.to_string(), ERROR_DETAIL_CHARS);
                Completion::Failure { reason: &detail }
            }
        };
        tracker.complete(completion).await;

        let mut recent = lock(&self.recent);
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(task);
    }

    async fn watchdog(inner: Arc<Self>) {
        let every = inner.config.long_download_notice();
        if every.is_zero() {
            return;
        }
        let tick = every.min(WATCHDOG_TICK);
        loop {
            tokio::select! {
                () = tokio::time::sleep(tick) => {}
                () = inner.stop_background.cancelled() => break,
            }
            inner.check_long_downloads().await;
        }
    }

    /// Posts a fresh status for transfers that have been running a long time.
    async fn check_long_downloads(&self) {
        let after = self.config.long_download_after();
        let every = self.config.long_download_notice();
        let now = Instant::now();

        let due: Vec<_> = lock(&self.active)
            .values_mut()
            .filter(|a| {
                now.duration_since(a.started) >= after
                    && a.last_notice.is_none_or(|t| now.duration_since(t) >= every)
            })
            .map(|a| {
                a.last_notice = Some(now);
                (a.channel, a.file_name.clone(), Arc::clone(&a.tracker))
            })
            .collect();

        for (channel, name, tracker) in due {
            let snap = tracker.snapshot().await;
            if !snap.active {
                continue;
            }
            let eta = self
                .progress
                .eta(snap.total.saturating_sub(snap.downloaded), snap.bytes_per_sec)
                .map_or_else(|| "unknown".to_string(), format_duration);
            let text = format!(
                "📣 STATUS UPDATE - Large download in progress\n\n📂 File: {name}\n⏱️ Running for: {}\n✅ Progress: {:.1}% complete\n💾 Downloaded: {} of {}\n⚡ Current speed: {}\n🕒 New ETA: {eta} remaining\n\nDownload continuing normally...",
                format_duration(snap.elapsed),
                percent(snap.downloaded, snap.total),
                format_bytes(snap.downloaded),
                format_bytes(snap.total),
                format_speed(snap.bytes_per_sec),
            );
            self.notifier.send(channel, &text).await;
        }
    }
}
