//! Hook for moving finished downloads into their library folder.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;

/// Decides where a verified download finally lives.
///
/// Called once per successful download; the returned path is shown in the
/// final status message.
#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Moves or links `local_path` and returns where it ended up.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be placed. The download still
    /// counts as successful and stays at `local_path`.
    async fn categorize(&self, local_path: &Path) -> Result<PathBuf>;
}

/// Leaves every file where the transport put it.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepInPlace;

#[async_trait]
impl Categorizer for KeepInPlace {
    async fn categorize(&self, local_path: &Path) -> Result<PathBuf> {
        Ok(local_path.to_path_buf())
    }
}
