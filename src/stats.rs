//! Process-wide download statistics and their persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// Persisted counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub total_bytes: u64,
    pub peak_concurrent: usize,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::fresh()
    }
}

impl Stats {
    /// Zeroed counters starting now.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            total_downloads: 0,
            successful_downloads: 0,
            failed_downloads: 0,
            total_bytes: 0,
            peak_concurrent: 0,
            start_time: Utc::now(),
            last_saved: None,
        }
    }

    /// Share of finished downloads that succeeded, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_downloads == 0 {
            0.0
        } else {
            self.successful_downloads as f64 / self.total_downloads as f64 * 100.0
        }
    }

    /// Share of finished downloads that failed, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.total_downloads == 0 {
            0.0
        } else {
            self.failed_downloads as f64 / self.total_downloads as f64 * 100.0
        }
    }

    /// Time since the counters were first created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }
}

/// Terminal result of one task, as counted by [`StatsManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { bytes: u64 },
    Failed,
}

/// Owns the [`Stats`] record and its file.
#[derive(Debug)]
pub struct StatsManager {
    path: PathBuf,
    stats: Mutex<Stats>,
    save_lock: tokio::sync::Mutex<()>,
}

impl StatsManager {
    /// Loads counters from `path`. A missing or unreadable file starts fresh.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt stats file {}: {e}", path.display());
                Stats::fresh()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Stats::fresh(),
            Err(e) => {
                log::warn!("Cannot read stats file {}: {e}", path.display());
                Stats::fresh()
            }
        };
        Self {
            path,
            stats: Mutex::new(stats),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one terminal task.
    pub fn record(&self, outcome: Outcome) {
        let mut stats = self.lock();
        stats.total_downloads += 1;
        match outcome {
            Outcome::Completed { bytes } => {
                stats.successful_downloads += 1;
                stats.total_bytes += bytes;
            }
            Outcome::Failed => stats.failed_downloads += 1,
        }
    }

    /// Raises the peak concurrency if `active` exceeds it.
    pub fn observe_concurrency(&self, active: usize) {
        let mut stats = self.lock();
        stats.peak_concurrent = stats.peak_concurrent.max(active);
    }

    #[must_use]
    pub fn snapshot(&self) -> Stats {
        self.lock().clone()
    }

    /// Writes the counters atomically (temp file, then rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub async fn save(&self) -> Result<()> {
        let _saving = self.save_lock.lock().await;

        let json = {
            let mut stats = self.lock();
            stats.last_saved = Some(Utc::now());
            serde_json::to_string_pretty(&*stats)?
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        log::debug!("Saved stats to {}", self.path.display());
        Ok(())
    }

    /// Saves every `interval` until `shutdown` fires.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        if interval.is_zero() {
            return;
        }
        let stats = Arc::clone(self);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = shutdown.cancelled() => break,
                }
                if let Err(e) = stats.save().await {
                    log::warn!("Periodic stats flush failed: {e}");
                }
            }
        });
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
