//! Configuration types for the download queue.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Configuration for download operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Read size used by streaming transports.
    pub chunk_size: usize,
    /// Number of transfers allowed in the `downloading` state at once.
    pub max_concurrent_downloads: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in seconds.
    pub retry_base_delay_secs: f64,
    /// Minimum time between two progress messages of one tracker.
    pub progress_update_interval_secs: f64,
    /// Minimum time between two status edits sent to the same channel.
    pub notify_min_interval_secs: f64,
    /// Per-transfer speed cap in megabits per second. `0` disables it.
    pub max_speed_mbps: f64,
    /// Whether finished files are verified before being reported.
    pub verify_downloads: bool,
    /// Smallest accepted `actual / expected` size ratio.
    pub verify_min_size_ratio: f64,
    /// Remaining bytes above which the ETA gets inflated.
    pub eta_inflation_threshold_bytes: u64,
    /// Multiplier applied to large ETAs.
    pub eta_inflation_factor: f64,
    /// Files larger than this use the bulk transport when one is available.
    pub bulk_threshold_bytes: u64,
    /// Whether the bulk transport may resume from a `.part` file.
    pub resume_support: bool,
    /// Overall timeout for a single transport call, in seconds.
    pub transfer_timeout_secs: f64,
    /// How long a batch keeps accepting members after the first one arrives.
    pub batch_window_secs: f64,
    /// How often statistics are flushed to disk.
    pub stats_flush_interval_secs: f64,
    /// A transfer running longer than this gets periodic notices.
    pub long_download_after_secs: f64,
    /// Minimum time between two long-download notices for one transfer.
    pub long_download_notice_secs: f64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: MIB as usize,
            max_concurrent_downloads: 3,
            max_retries: 3,
            retry_base_delay_secs: 5.0,
            progress_update_interval_secs: 5.0,
            notify_min_interval_secs: 2.0,
            max_speed_mbps: 0.0,
            verify_downloads: true,
            verify_min_size_ratio: 0.9,
            eta_inflation_threshold_bytes: 100 * MIB,
            eta_inflation_factor: 1.1,
            bulk_threshold_bytes: 20 * MIB,
            resume_support: true,
            transfer_timeout_secs: 7200.0,
            batch_window_secs: 10.0,
            stats_flush_interval_secs: 300.0,
            long_download_after_secs: 1800.0,
            long_download_notice_secs: 900.0,
        }
    }
}

/// Converts configured seconds into a `Duration`, treating garbage as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl DownloadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent transfers.
    #[must_use]
    pub const fn with_max_concurrent_downloads(mut self, concurrent: usize) -> Self {
        self.max_concurrent_downloads = concurrent;
        self
    }

    /// Sets the number of retries after the first attempt.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the backoff base delay.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_secs = delay.as_secs_f64();
        self
    }

    /// Sets the progress message interval.
    #[must_use]
    pub fn with_progress_update_interval(mut self, interval: Duration) -> Self {
        self.progress_update_interval_secs = interval.as_secs_f64();
        self
    }

    /// Sets the per-channel notification interval.
    #[must_use]
    pub fn with_notify_min_interval(mut self, interval: Duration) -> Self {
        self.notify_min_interval_secs = interval.as_secs_f64();
        self
    }

    /// Sets the per-transfer speed cap in megabits per second.
    #[must_use]
    pub const fn with_max_speed_mbps(mut self, mbps: f64) -> Self {
        self.max_speed_mbps = mbps;
        self
    }

    /// Enables or disables verification.
    #[must_use]
    pub const fn with_verify_downloads(mut self, verify: bool) -> Self {
        self.verify_downloads = verify;
        self
    }

    /// Sets the size above which the bulk transport is preferred.
    #[must_use]
    pub const fn with_bulk_threshold_bytes(mut self, threshold: u64) -> Self {
        self.bulk_threshold_bytes = threshold;
        self
    }

    /// Sets the overall timeout of one transport call.
    #[must_use]
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets the batch collection window.
    #[must_use]
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_secs = window.as_secs_f64();
        self
    }

    /// Sets the long-download watchdog thresholds.
    #[must_use]
    pub fn with_long_download_notices(mut self, after: Duration, every: Duration) -> Self {
        self.long_download_after_secs = after.as_secs_f64();
        self.long_download_notice_secs = every.as_secs_f64();
        self
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        secs(self.retry_base_delay_secs)
    }

    #[must_use]
    pub fn progress_update_interval(&self) -> Duration {
        secs(self.progress_update_interval_secs)
    }

    #[must_use]
    pub fn notify_min_interval(&self) -> Duration {
        secs(self.notify_min_interval_secs)
    }

    #[must_use]
    pub fn transfer_timeout(&self) -> Duration {
        secs(self.transfer_timeout_secs)
    }

    #[must_use]
    pub fn batch_window(&self) -> Duration {
        secs(self.batch_window_secs)
    }

    #[must_use]
    pub fn stats_flush_interval(&self) -> Duration {
        secs(self.stats_flush_interval_secs)
    }

    #[must_use]
    pub fn long_download_after(&self) -> Duration {
        secs(self.long_download_after_secs)
    }

    #[must_use]
    pub fn long_download_notice(&self) -> Duration {
        secs(self.long_download_notice_secs)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Config("max_concurrent_downloads must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".into()));
        }
        let non_negative = [
            ("retry_base_delay_secs", self.retry_base_delay_secs),
            ("progress_update_interval_secs", self.progress_update_interval_secs),
            ("notify_min_interval_secs", self.notify_min_interval_secs),
            ("max_speed_mbps", self.max_speed_mbps),
            ("transfer_timeout_secs", self.transfer_timeout_secs),
            ("batch_window_secs", self.batch_window_secs),
            ("stats_flush_interval_secs", self.stats_flush_interval_secs),
            ("long_download_after_secs", self.long_download_after_secs),
            ("long_download_notice_secs", self.long_download_notice_secs),
        ];
        if let Some((key, _)) = non_negative
            .iter()
            .find(|(_, value)| !value.is_finite() || *value < 0.0)
        {
            return Err(Error::Config(format!("{key} must be a non-negative number")));
        }
        if !(self.verify_min_size_ratio > 0.0 && self.verify_min_size_ratio <= 1.0) {
            return Err(Error::Config("verify_min_size_ratio must be in (0, 1]".into()));
        }
        if !self.eta_inflation_factor.is_finite() || self.eta_inflation_factor < 1.0 {
            return Err(Error::Config("eta_inflation_factor must be at least 1.0".into()));
        }
        Ok(())
    }
}

/// Path configuration for downloads and persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory where downloaded files are saved.
    pub download_dir: PathBuf,
    /// File holding the persisted statistics record.
    pub stats_file: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir: PathBuf::from("downloads"),
            stats_file: data_dir.join("tele-dl").join("download_stats.json"),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Download configuration.
    pub download: DownloadConfig,
    /// Path configuration.
    pub paths: PathConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tele-dl")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };
        config.download.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the string is not valid TOML for this schema.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }
}
