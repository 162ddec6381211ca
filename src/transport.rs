//! Transfer transports and the rule that picks one per task.
//!
//! A transport pulls the bytes of one [`SourceHandle`] into a destination
//! path. It writes to `{dest}.part` while in flight and renames into place
//! on success, reporting every received chunk to a [`ChunkListener`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RANGE, RETRY_AFTER};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{Error, Result};
use crate::fs::part_path;

/// Default buffer size for the HTTP writer (1 MiB).
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Describes the remote file a task fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    /// Stable identity of the remote file, used for deduplication.
    pub id: String,
    /// Locator the simple transport fetches.
    pub locator: String,
    /// Display name, usually the destination file name.
    pub file_name: String,
    /// Richer reference required by the bulk transport. Sources without one
    /// always use the simple transport.
    pub rich: Option<String>,
}

impl SourceHandle {
    /// Creates a handle whose id and locator are the same string.
    #[must_use]
    pub fn new(locator: impl Into<String>, file_name: impl Into<String>) -> Self {
        let locator = locator.into();
        Self {
            id: locator.clone(),
            locator,
            file_name: file_name.into(),
            rich: None,
        }
    }

    /// Attaches the reference needed by the bulk transport.
    #[must_use]
    pub fn with_rich(mut self, rich: impl Into<String>) -> Self {
        self.rich = Some(rich.into());
        self
    }
}

/// Receives chunk notifications from a transport.
#[async_trait]
pub trait ChunkListener: Send + Sync {
    /// Called once per received chunk with its size and the total size if the
    /// transport knows it (`0` otherwise).
    async fn on_chunk(&self, bytes: u64, total_known: u64);

    /// Called before the first chunk when the transport continues a partial
    /// file that already holds `offset` bytes.
    async fn on_resume(&self, _offset: u64) {}
}

/// A mechanism that moves bytes from a remote source to a local file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fetches `source` into `dest` and returns the final path.
    ///
    /// # Errors
    ///
    /// Returns a classified [`Error`]; the caller decides whether to retry.
    async fn download(
        &self,
        source: &SourceHandle,
        dest: &Path,
        listener: &dyn ChunkListener,
    ) -> Result<PathBuf>;

    /// Verifies the transport can still reach its remote. Called between
    /// retry attempts.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote is unreachable.
    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

/// Which transport served a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Simple,
    Bulk,
}

/// The simple transport plus an optional bulk transport for large files.
#[derive(Clone)]
pub struct TransportSet {
    simple: Arc<dyn Transport>,
    bulk: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSet")
            .field("simple", &self.simple.name())
            .field("bulk", &self.bulk.as_ref().map(|t| t.name()))
            .finish()
    }
}

impl TransportSet {
    #[must_use]
    pub fn new(simple: Arc<dyn Transport>) -> Self {
        Self { simple, bulk: None }
    }

    #[must_use]
    pub fn with_bulk(mut self, bulk: Arc<dyn Transport>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// Picks the transport for a task.
    ///
    /// The bulk transport is used only when the file is larger than
    /// `threshold`, the source carries a rich reference, and a bulk transport
    /// is configured.
    #[must_use]
    pub fn select(
        &self,
        source: &SourceHandle,
        expected_size: u64,
        threshold: u64,
    ) -> (TransportKind, Arc<dyn Transport>) {
        match &self.bulk {
            Some(bulk) if expected_size > threshold && source.rich.is_some() => {
                (TransportKind::Bulk, Arc::clone(bulk))
            }
            _ => (TransportKind::Simple, Arc::clone(&self.simple)),
        }
    }
}

/// Streams a URL over HTTP.
///
/// In resumable mode an existing `.part` file is continued with a `Range`
/// request; a server that ignores the range restarts the file from zero.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    resume: bool,
    chunk_size: usize,
}

impl HttpTransport {
    /// Transport that always fetches the whole file.
    #[must_use]
    pub fn simple(client: reqwest::Client) -> Self {
        Self {
            client,
            resume: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Transport that continues partial files.
    #[must_use]
    pub fn resumable(client: reqwest::Client) -> Self {
        Self {
            resume: true,
            ..Self::simple(client)
        }
    }

    /// Sets the write buffer size.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        self
    }

    async fn existing_part(&self, part: &Path) -> u64 {
        if !self.resume {
            return 0;
        }
        tokio::fs::metadata(part).await.map_or(0, |m| m.len())
    }
}

/// Maps an HTTP status to the crate's error classes.
fn check_status(status: StatusCode, headers: &HeaderMap) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => match retry_after(headers) {
            Some(retry_after) => Err(Error::RateLimited { retry_after }),
            None => Err(Error::Transient(format!("HTTP {status} without Retry-After"))),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Auth(format!("HTTP {status}")))
        }
        _ => Err(Error::Transient(format!("HTTP {status}"))),
    }
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        if self.resume { "http-resumable" } else { "http" }
    }

    async fn download(
        &self,
        source: &SourceHandle,
        dest: &Path,
        listener: &dyn ChunkListener,
    ) -> Result<PathBuf> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path(dest);
        let offset = self.existing_part(&part).await;
        let url = source
            .rich
            .as_deref()
            .filter(|_| self.resume)
            .unwrap_or(source.locator.as_str());

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let mut response = request.send().await?;

        // The partial file already holds everything.
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            log::debug!("{} already complete at {offset} bytes", part.display());
            listener.on_resume(offset).await;
            tokio::fs::rename(&part, dest).await?;
            return Ok(dest.to_path_buf());
        }
        check_status(response.status(), response.headers())?;

        let start = if offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let total = response.content_length().map_or(0, |len| len + start);

        let file = if start > 0 {
            log::info!("Resuming {} from {start} bytes", source.file_name);
            listener.on_resume(start).await;
            tokio::fs::OpenOptions::new().append(true).open(&part).await?
        } else {
            tokio::fs::File::create(&part).await?
        };
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);

        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            listener.on_chunk(chunk.len() as u64, total).await;
        }
        writer.flush().await?;
        drop(writer);

        tokio::fs::rename(&part, dest).await?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;
    use reqwest::header::HeaderValue;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Records what a transport reports.
    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<(u64, u64)>>,
        resumed: Mutex<Option<u64>>,
    }

    impl Recorder {
        fn bytes(&self) -> u64 {
            self.chunks.lock().unwrap().iter().map(|(n, _)| n).sum()
        }

        fn last_total(&self) -> Option<u64> {
            self.chunks.lock().unwrap().last().map(|(_, total)| *total)
        }

        fn resumed(&self) -> Option<u64> {
            *self.resumed.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChunkListener for Recorder {
        async fn on_chunk(&self, bytes: u64, total_known: u64) {
            self.chunks.lock().unwrap().push((bytes, total_known));
        }

        async fn on_resume(&self, offset: u64) {
            *self.resumed.lock().unwrap() = Some(offset);
        }
    }

    fn reply(status: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Serves `response` to one connection and returns the request head.
    async fn serve_once(response: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/clip.mp4", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });
        (url, server)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn retry_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn too_many_requests_with_retry_after_is_rate_limited() {
        let err = check_status(StatusCode::TOO_MANY_REQUESTS, &retry_headers("7")).unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited { retry_after } if retry_after == Duration::from_secs(7)
        ));
    }

    #[test]
    fn too_many_requests_without_usable_retry_after_is_transient() {
        let bare = check_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new()).unwrap_err();
        assert!(matches!(bare, Error::Transient(_)));

        let date = retry_headers("Wed, 21 Oct 2015 07:28:00 GMT");
        let dated = check_status(StatusCode::TOO_MANY_REQUESTS, &date).unwrap_err();
        assert!(matches!(dated, Error::Transient(_)));
    }

    #[test]
    fn rejected_credentials_are_auth_errors() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = check_status(status, &HeaderMap::new()).unwrap_err();
            assert!(matches!(err, Error::Auth(_)), "{status}");
        }
    }

    #[test]
    fn other_failures_are_transient_and_success_passes() {
        for status in [StatusCode::NOT_FOUND, StatusCode::BAD_GATEWAY] {
            let err = check_status(status, &HeaderMap::new()).unwrap_err();
            assert!(matches!(err, Error::Transient(_)), "{status}");
        }
        assert!(check_status(StatusCode::OK, &HeaderMap::new()).is_ok());
        assert!(check_status(StatusCode::PARTIAL_CONTENT, &HeaderMap::new()).is_ok());
    }

    #[tokio::test]
    async fn simple_download_writes_file_and_reports_chunks() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out/clip.mp4");
        let (url, server) = serve_once(reply("200 OK", "", b"hello world")).await;

        let recorder = Recorder::default();
        let path = HttpTransport::simple(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &recorder)
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!part_path(&dest).exists());
        assert_eq!(recorder.bytes(), 11);
        assert_eq!(recorder.last_total(), Some(11));
        assert!(server.await.unwrap().starts_with("get /clip.mp4"));
    }

    #[tokio::test]
    async fn simple_transport_ignores_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(part_path(&dest), b"stale").unwrap();
        let (url, server) = serve_once(reply("200 OK", "", b"fresh")).await;

        HttpTransport::simple(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &Recorder::default())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
        assert!(!server.await.unwrap().contains("range:"));
    }

    #[tokio::test]
    async fn resume_requests_range_and_appends_partial_content() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(part_path(&dest), b"hell").unwrap();
        let (url, server) = serve_once(reply(
            "206 Partial Content",
            "Content-Range: bytes 4-10/11\r\n",
            b"o world",
        ))
        .await;

        let recorder = Recorder::default();
        HttpTransport::resumable(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &recorder)
            .await
            .unwrap();

        assert!(server.await.unwrap().contains("range: bytes=4-"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(recorder.resumed(), Some(4));
        assert_eq!(recorder.bytes(), 7);
        assert_eq!(recorder.last_total(), Some(11));
    }

    #[tokio::test]
    async fn server_ignoring_range_restarts_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(part_path(&dest), b"XXXX").unwrap();
        let (url, server) = serve_once(reply("200 OK", "", b"hello world")).await;

        let recorder = Recorder::default();
        HttpTransport::resumable(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &recorder)
            .await
            .unwrap();

        assert!(server.await.unwrap().contains("range: bytes=4-"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(recorder.resumed(), None);
    }

    #[tokio::test]
    async fn range_not_satisfiable_completes_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(part_path(&dest), b"hello world").unwrap();
        let (url, _server) = serve_once(reply("416 Range Not Satisfiable", "", b"")).await;

        let recorder = Recorder::default();
        HttpTransport::resumable(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &recorder)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!part_path(&dest).exists());
        assert_eq!(recorder.resumed(), Some(11));
    }

    #[tokio::test]
    async fn rate_limited_response_carries_wait() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        let (url, _server) =
            serve_once(reply("429 Too Many Requests", "Retry-After: 7\r\n", b"")).await;

        let err = HttpTransport::simple(client())
            .download(&SourceHandle::new(url, "clip.mp4"), &dest, &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited { retry_after } if retry_after == Duration::from_secs(7)
        ));
        assert!(!dest.exists());
    }

    fn set() -> TransportSet {
        TransportSet::new(Arc::new(MockTransport::named("simple")))
            .with_bulk(Arc::new(MockTransport::named("bulk")))
    }

    #[test]
    fn large_rich_source_uses_bulk() {
        let source = SourceHandle::new("u", "f").with_rich("msg:1");
        let (kind, transport) = set().select(&source, 2_000, 1_000);
        assert_eq!(kind, TransportKind::Bulk);
        assert_eq!(transport.name(), "bulk");
    }

    #[test]
    fn small_or_plain_sources_use_simple() {
        let rich = SourceHandle::new("u", "f").with_rich("msg:1");
        assert_eq!(set().select(&rich, 1_000, 1_000).0, TransportKind::Simple);

        let plain = SourceHandle::new("u", "f");
        assert_eq!(set().select(&plain, 5_000, 1_000).0, TransportKind::Simple);
    }

    #[test]
    fn missing_bulk_falls_back_to_simple() {
        let only_simple = TransportSet::new(Arc::new(MockTransport::named("simple")));
        let source = SourceHandle::new("u", "f").with_rich("msg:1");
        let (kind, transport) = only_simple.select(&source, u64::MAX, 0);
        assert_eq!(kind, TransportKind::Simple);
        assert_eq!(transport.name(), "simple");
    }

    #[test]
    fn http_transport_names() {
        let client = reqwest::Client::new();
        assert_eq!(HttpTransport::simple(client.clone()).name(), "http");
        assert_eq!(HttpTransport::resumable(client).name(), "http-resumable");
    }

    #[test]
    fn source_handle_defaults() {
        let source = SourceHandle::new("https://host/a.mkv", "a.mkv");
        assert_eq!(source.id, source.locator);
        assert!(source.rich.is_none());
    }
}
