//! Post-transfer verification of downloaded files.

use std::path::Path;

use crate::error::{Error, Result};
use crate::fs::FileSystem;

/// Bytes inspected at each end of a file by the padding heuristic.
pub const EDGE_WINDOW: usize = 1024;

/// Thresholds applied by [`verify_download`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyPolicy {
    /// Smallest accepted `actual / expected` size ratio.
    pub min_size_ratio: f64,
    /// Bytes read from each end of the file.
    pub edge_window: usize,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            min_size_ratio: 0.9,
            edge_window: EDGE_WINDOW,
        }
    }
}

impl VerifyPolicy {
    #[must_use]
    pub const fn with_min_size_ratio(mut self, ratio: f64) -> Self {
        self.min_size_ratio = ratio;
        self
    }
}

#[allow(clippy::cast_precision_loss)]
fn below_ratio(actual: u64, expected: u64, ratio: f64) -> bool {
    expected > 0 && (actual as f64) < expected as f64 * ratio
}

fn all_zero(window: &[u8]) -> bool {
    !window.is_empty() && window.iter().all(|b| *b == 0)
}

/// Checks that `path` looks like a complete transfer of `expected_size` bytes.
///
/// The file must exist, must not be smaller than the policy's share of a
/// known expected size, and for files over two windows neither its head nor
/// its tail may be entirely null padding.
///
/// # Errors
///
/// Returns [`Error::Verification`] describing the first failed check.
pub async fn verify_download(
    fs: &dyn FileSystem,
    path: &Path,
    expected_size: u64,
    policy: &VerifyPolicy,
) -> Result<()> {
    let Some(actual) = fs.file_size(path).await else {
        return Err(Error::Verification(format!(
            "{} does not exist",
            path.display()
        )));
    };

    if below_ratio(actual, expected_size, policy.min_size_ratio) {
        return Err(Error::Verification(format!(
            "size mismatch: expected {expected_size} bytes, got {actual}"
        )));
    }

    if actual > (policy.edge_window as u64) * 2 {
        let edges = fs.read_edges(path, policy.edge_window).await?;
        if all_zero(&edges.head) {
            return Err(Error::Verification("file starts with null padding".into()));
        }
        if all_zero(&edges.tail) {
            return Err(Error::Verification("file ends with null padding".into()));
        }
    }

    Ok(())
}
