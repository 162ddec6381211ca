//! Notification rate limiting and transfer speed limiting.
//!
//! Both limiters run on the tokio clock so they suspend the calling task
//! instead of blocking a worker thread.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Bytes per second in one megabit per second (binary megabit).
const BYTES_PER_MBIT: f64 = 1024.0 * 1024.0 / 8.0;

/// Throttles how often a key (usually a chat) may receive a status update.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_update: Mutex<HashMap<String, Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl RateLimiter {
    /// Creates a limiter allowing one update per `min_interval` per key.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_update: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured interval.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns how long `key` must still wait. Claims the slot when no wait
    /// is needed.
    fn claim(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut last_update = self
            .last_update
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match last_update.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => {
                Some(self.min_interval - now.duration_since(*last))
            }
            _ => {
                last_update.insert(key.to_string(), now);
                None
            }
        }
    }

    /// Returns true and resets the timestamp of `key` if at least the minimum
    /// interval passed since its last permitted update.
    pub fn can_update(&self, key: &str) -> bool {
        self.claim(key).is_none()
    }

    /// Suspends until an update for `key` is permitted, then claims it.
    pub async fn wait_if_needed(&self, key: &str) {
        while let Some(wait) = self.claim(key) {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
struct SpeedWindow {
    started: Instant,
    bytes: u64,
}

/// Throttles the bytes per second consumed by one transfer.
#[derive(Debug)]
pub struct SpeedLimiter {
    bytes_per_sec: Option<f64>,
    window: tokio::sync::Mutex<SpeedWindow>,
}

impl SpeedLimiter {
    /// Creates a limiter for `max_speed_mbps` megabits per second.
    ///
    /// A cap of `0` (or anything not strictly positive) disables limiting.
    #[must_use]
    pub fn new(max_speed_mbps: f64) -> Self {
        let bytes_per_sec = (max_speed_mbps.is_finite() && max_speed_mbps > 0.0)
            .then(|| max_speed_mbps * BYTES_PER_MBIT);
        Self {
            bytes_per_sec,
            window: tokio::sync::Mutex::new(SpeedWindow {
                started: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    /// Returns true if a cap is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.bytes_per_sec.is_some()
    }

    /// Accounts for `bytes` just received and sleeps for any overage before
    /// the next chunk may be counted.
    pub async fn limit(&self, bytes: u64) {
        let Some(rate) = self.bytes_per_sec else {
            return;
        };

        let mut window = self.window.lock().await;
        window.bytes += bytes;

        #[allow(clippy::cast_precision_loss)]
        let earned =
            Duration::try_from_secs_f64(window.bytes as f64 / rate).unwrap_or(Duration::MAX);
        let elapsed = window.started.elapsed();
        if earned > elapsed {
            tokio::time::sleep(earned - elapsed).await;
        }

        if window.started.elapsed() >= Duration::from_secs(1) {
            window.started = Instant::now();
            window.bytes = 0;
        }
    }
}
