//! Per-task progress tracking and status rendering.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::format::{format_bytes, format_duration, format_speed, percent, render_bar};
use crate::limiter::RateLimiter;
use crate::notify::{ChannelId, MessageId, Notifier};

/// Number of speed samples averaged into the displayed speed.
pub const SPEED_SAMPLES: usize = 5;

/// Knobs for how progress is reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressPolicy {
    /// Minimum time between two emitted progress messages.
    pub update_interval: Duration,
    /// Remaining bytes above which the ETA is inflated.
    pub eta_inflation_threshold: u64,
    /// Multiplier applied to an inflated ETA.
    pub eta_inflation_factor: f64,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            eta_inflation_threshold: 100 * 1024 * 1024,
            eta_inflation_factor: 1.1,
        }
    }
}

impl ProgressPolicy {
    /// Estimates the time left, or `None` while the speed or total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta(&self, remaining: u64, bytes_per_sec: f64) -> Option<Duration> {
        if !(bytes_per_sec.is_finite() && bytes_per_sec > 0.0) {
            return None;
        }
        let mut secs = remaining as f64 / bytes_per_sec;
        if remaining > self.eta_inflation_threshold {
            secs *= self.eta_inflation_factor;
        }
        Duration::try_from_secs_f64(secs).ok()
    }
}

/// Bounded ring of `(timestamp, cumulative bytes)` samples.
#[derive(Debug, Clone)]
pub struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_SAMPLES + 1),
        }
    }

    /// Records the cumulative byte count observed at `at`.
    pub fn record(&mut self, at: Instant, cumulative: u64) {
        self.samples.push_back((at, cumulative));
        while self.samples.len() > SPEED_SAMPLES + 1 {
            self.samples.pop_front();
        }
    }

    /// Drops every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean of the per-interval speeds between consecutive samples, in bytes
    /// per second. Intervals of zero length are skipped.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn speed(&self) -> f64 {
        let speeds: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|((t0, b0), (t1, b1))| {
                let dt = t1.duration_since(*t0).as_secs_f64();
                (dt > 0.0).then(|| b1.saturating_sub(*b0) as f64 / dt)
            })
            .collect();
        if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        }
    }
}

/// Where a tracker sits inside its batch, for the "File 2/5" line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerLabel {
    pub file_name: String,
    /// Zero-based position in the batch.
    pub position: usize,
    pub total_files: usize,
}

impl TrackerLabel {
    #[must_use]
    pub fn single(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            position: 0,
            total_files: 1,
        }
    }
}

/// How a tracked transfer ended.
#[derive(Debug, Clone, Copy)]
pub enum Completion<'a> {
    /// The file is in place at `final_path`.
    Success { final_path: &'a Path },
    /// The transfer failed for good.
    Failure { reason: &'a str },
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: u64,
    pub bytes_per_sec: f64,
    pub elapsed: Duration,
    pub active: bool,
}

#[derive(Debug)]
struct ProgressState {
    active: bool,
    started: Instant,
    last_emit: Instant,
    window: SpeedWindow,
}

/// Tracks bytes transferred for one task and emits throttled status text.
#[derive(Debug)]
pub struct ProgressTracker {
    notifier: Notifier,
    rate_limiter: Arc<RateLimiter>,
    channel: ChannelId,
    message: Option<MessageId>,
    label: TrackerLabel,
    policy: ProgressPolicy,
    downloaded: AtomicU64,
    total: AtomicU64,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(
        notifier: Notifier,
        rate_limiter: Arc<RateLimiter>,
        channel: ChannelId,
        message: Option<MessageId>,
        label: TrackerLabel,
        total: u64,
        policy: ProgressPolicy,
    ) -> Self {
        let now = Instant::now();
        Self {
            notifier,
            rate_limiter,
            channel,
            message,
            label,
            policy,
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(total),
            state: Mutex::new(ProgressState {
                active: true,
                started: now,
                last_emit: now,
                window: SpeedWindow::new(),
            }),
        }
    }

    /// Bytes counted so far.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Expected size, `0` while unknown.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn label(&self) -> &TrackerLabel {
        &self.label
    }

    /// Fills in the total once a transport learns it.
    pub fn set_total_if_unknown(&self, total: u64) {
        let _ = self
            .total
            .compare_exchange(0, total, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Starts a new attempt from `offset` bytes. Used before every retry and
    /// when a transport resumes from a partial file.
    pub async fn restart_at(&self, offset: u64) {
        let mut state = self.state.lock().await;
        self.downloaded.store(offset, Ordering::Relaxed);
        self.total.fetch_max(offset, Ordering::Relaxed);
        state.window.clear();
        state.window.record(Instant::now(), offset);
    }

    /// Accounts for one received chunk and emits a status message when the
    /// interval and the channel's rate limit both allow it.
    pub async fn update(&self, chunk_size: u64) {
        let downloaded = self.downloaded.fetch_add(chunk_size, Ordering::Relaxed) + chunk_size;
        // A source that delivers more than announced raises the total.
        let total = match self.total() {
            0 => 0,
            _ => self.total.fetch_max(downloaded, Ordering::Relaxed).max(downloaded),
        };

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.window.record(now, downloaded);

        if !state.active || now.duration_since(state.last_emit) < self.policy.update_interval {
            return;
        }
        let Some(message) = self.message else {
            return;
        };
        if !self.rate_limiter.can_update(&self.channel.to_string()) {
            return;
        }
        state.last_emit = now;

        let text = self.render_progress(downloaded, total, state.window.speed());
        self.notifier.edit(self.channel, message, &text).await;
    }

    /// Marks the transfer finished and sends the final message.
    ///
    /// The final message ignores rate limiting. Returns `false`, without
    /// sending anything, if the tracker was already completed.
    pub async fn complete(&self, completion: Completion<'_>) -> bool {
        let mut state = self.state.lock().await;
        if !state.active {
            return false;
        }
        state.active = false;
        let elapsed = state.started.elapsed();

        let text = match completion {
            Completion::Success { final_path } => self.render_success(elapsed, final_path),
            Completion::Failure { reason } => self.render_failure(reason),
        };
        self.notifier.post(self.channel, self.message, &text).await;
        true
    }

    /// Reads the current counters and smoothed speed.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock().await;
        ProgressSnapshot {
            downloaded: self.downloaded(),
            total: self.total(),
            bytes_per_sec: state.window.speed(),
            elapsed: state.started.elapsed(),
            active: state.active,
        }
    }

    fn batch_line(&self) -> String {
        if self.label.total_files > 1 {
            format!("File {}/{}\n", self.label.position + 1, self.label.total_files)
        } else {
            String::new()
        }
    }

    fn render_progress(&self, downloaded: u64, total: u64, speed: f64) -> String {
        let pct = percent(downloaded, total);
        let eta = if total > 0 {
            self.policy
                .eta(total.saturating_sub(downloaded), speed)
                .map_or_else(|| "Calculating...".to_string(), format_duration)
        } else {
            "Calculating...".to_string()
        };
        format!(
            "📥 Downloading: {}\n{}Progress: {pct:.1}%\n[{}]\n\n💾 {} of {}\n⚡ Speed: {}\n⏱️ ETA: {eta}",
            self.label.file_name,
            self.batch_line(),
            render_bar(pct),
            format_bytes(downloaded),
            format_bytes(total),
            format_speed(speed),
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn render_success(&self, elapsed: Duration, final_path: &Path) -> String {
        let downloaded = self.downloaded();
        let secs = elapsed.as_secs_f64();
        let average = if secs > 0.0 { downloaded as f64 / secs } else { 0.0 };
        format!(
            "✅ Download Complete!\n{}📂 File: {}\n📊 Size: {}\n⏱️ Time: {}\n🚀 Avg Speed: {}\n📁 Saved to: {}",
            self.batch_line(),
            self.label.file_name,
            format_bytes(downloaded),
            format_duration(elapsed),
            format_speed(average),
            final_path.display(),
        )
    }

    fn render_failure(&self, reason: &str) -> String {
        format!(
            "❌ Download Failed: {}\n{}🔍 ERROR: {reason}\n\nSUGGESTIONS:\n1. Check your internet connection\n2. The file may be unavailable from sender\n3. Try again later",
            self.label.file_name,
            self.batch_line(),
        )
    }
}
