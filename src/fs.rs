//! Filesystem access for verification and cleanup, plus `.part` naming.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Returns the `.part` file path used while a transfer is in flight.
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// The first and last bytes of a file, used by the corruption heuristic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEdges {
    /// Up to `window` bytes from the start.
    pub head: Vec<u8>,
    /// Up to `window` bytes from the end. Empty when the file is too small to
    /// have a distinct tail.
    pub tail: Vec<u8>,
}

/// Filesystem calls made by the manager and by verification.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Size of `path` in bytes, or `None` if it cannot be read.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;

    /// Reads the head and, for files larger than `2 * window`, the tail.
    async fn read_edges(&self, path: &Path, window: usize) -> std::io::Result<FileEdges>;
}

/// Real filesystem through `tokio::fs`. Edge reads run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn read_edges_blocking(path: &Path, window: usize) -> std::io::Result<FileEdges> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let window_len = window as u64;

    let mut head = Vec::with_capacity(window);
    (&mut file).take(window_len).read_to_end(&mut head)?;

    let mut tail = Vec::new();
    if size > window_len * 2 {
        file.seek(SeekFrom::Start(size - window_len))?;
        file.take(window_len).read_to_end(&mut tail)?;
    }

    Ok(FileEdges { head, tail })
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn read_edges(&self, path: &Path, window: usize) -> std::io::Result<FileEdges> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_edges_blocking(&path, window))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn part_path_appends_extension() {
        assert_eq!(
            part_path(Path::new("foo/bar.mkv")),
            PathBuf::from("foo/bar.mkv.part")
        );
        assert_eq!(part_path(Path::new("file")), PathBuf::from("file.part"));
    }

    #[tokio::test]
    async fn tokio_fs_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();

        let fs = TokioFileSystem::new();
        assert_eq!(fs.file_size(&path).await, Some(5));
        let missing = dir.path().join("nonexistent.txt");
        assert_eq!(fs.file_size(&missing).await, None);
    }

    #[tokio::test]
    async fn tokio_fs_remove() {
        let dir = TempDir::new().unwrap();
        let fs = TokioFileSystem::new();

        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"x").unwrap();
        fs.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        assert!(fs.remove_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn read_edges_of_small_file_has_no_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, vec![7u8; 1500]).unwrap();

        let edges = TokioFileSystem.read_edges(&path, 1024).await.unwrap();
        assert_eq!(edges.head.len(), 1024);
        assert!(edges.tail.is_empty());
    }

    #[tokio::test]
    async fn read_edges_of_large_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.bin");
        let mut data = vec![1u8; 4096];
        data[4095] = 9;
        std::fs::write(&path, &data).unwrap();

        let edges = TokioFileSystem.read_edges(&path, 1024).await.unwrap();
        assert_eq!(edges.head.len(), 1024);
        assert_eq!(edges.tail.len(), 1024);
        assert_eq!(edges.tail.last(), Some(&9));
    }
}
