//! Scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::fs::part_path;
use crate::notify::{ChannelId, MessageId, NotificationSink};
use crate::transport::{ChunkListener, SourceHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    Send,
    Edit,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub call: SinkCall,
    pub channel: ChannelId,
    pub message: MessageId,
    pub text: String,
}

/// Records every message in call order.
#[derive(Debug)]
pub struct RecordingSink {
    next_id: AtomicI64,
    log: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<Recorded> {
        self.all().into_iter().filter(|r| r.call == SinkCall::Send).collect()
    }

    pub fn edits(&self) -> Vec<Recorded> {
        self.all().into_iter().filter(|r| r.call == SinkCall::Edit).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.all().into_iter().map(|r| r.text).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, channel: ChannelId, text: &str) -> Result<MessageId> {
        let message = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.log.lock().unwrap().push(Recorded {
            call: SinkCall::Send,
            channel,
            message,
            text: text.to_string(),
        });
        Ok(message)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) -> Result<()> {
        self.log.lock().unwrap().push(Recorded {
            call: SinkCall::Edit,
            channel,
            message,
            text: text.to_string(),
        });
        Ok(())
    }
}

/// How a scripted attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Transient,
    RateLimited(Duration),
    Auth,
}

impl MockFailure {
    fn into_error(self) -> Error {
        match self {
            Self::Transient => Error::Transient("connection reset by peer".into()),
            Self::RateLimited(retry_after) => Error::RateLimited { retry_after },
            Self::Auth => Error::Auth("session revoked".into()),
        }
    }
}

/// One scripted call to [`MockTransport::download`].
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Writes every chunk and succeeds.
    Deliver(Vec<u64>),
    /// Writes the first `after` chunks, then fails.
    FailAfter {
        chunks: Vec<u64>,
        after: usize,
        failure: MockFailure,
    },
    /// Never returns.
    Hang,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport that plays back [`Attempt`]s per source id.
#[derive(Debug)]
pub struct MockTransport {
    name: &'static str,
    plans: Mutex<HashMap<String, VecDeque<Attempt>>>,
    fallback: Vec<u64>,
    chunk_delay: Duration,
    connection_ok: AtomicBool,
    calls: Mutex<Vec<(String, tokio::time::Instant)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    connection_checks: AtomicUsize,
}

impl MockTransport {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            plans: Mutex::new(HashMap::new()),
            fallback: vec![1_000],
            chunk_delay: Duration::ZERO,
            connection_ok: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            connection_checks: AtomicUsize::new(0),
        }
    }

    pub fn new() -> Self {
        Self::named("mock")
    }

    /// Sleep before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Chunks delivered for sources without a plan.
    pub fn with_fallback(mut self, chunks: Vec<u64>) -> Self {
        self.fallback = chunks;
        self
    }

    pub fn with_plan(self, source_id: &str, attempts: Vec<Attempt>) -> Self {
        self.plans
            .lock()
            .unwrap()
            .insert(source_id.to_string(), attempts.into());
        self
    }

    pub fn set_connection_ok(&self, ok: bool) {
        self.connection_ok.store(ok, Ordering::SeqCst);
    }

    /// Source ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn call_times(&self, source_id: &str) -> Vec<tokio::time::Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn attempts_for(&self, source_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == source_id).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn connection_checks(&self) -> usize {
        self.connection_checks.load(Ordering::SeqCst)
    }

    async fn play(
        &self,
        chunks: &[u64],
        fail: Option<(usize, MockFailure)>,
        dest: &Path,
        listener: &dyn ChunkListener,
    ) -> Result<PathBuf> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let total: u64 = chunks.iter().sum();
        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;

        for (index, &size) in chunks.iter().enumerate() {
            if let Some((after, failure)) = fail {
                if index == after {
                    file.flush().await?;
                    return Err(failure.into_error());
                }
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let len = usize::try_from(size).unwrap();
            file.write_all(&vec![0xAB; len]).await?;
            listener.on_chunk(size, total).await;
        }
        if let Some((_, failure)) = fail {
            return Err(failure.into_error());
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn download(
        &self,
        source: &SourceHandle,
        dest: &Path,
        listener: &dyn ChunkListener,
    ) -> Result<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .push((source.id.clone(), tokio::time::Instant::now()));
        let attempt = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&source.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Attempt::Deliver(self.fallback.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match attempt {
            Attempt::Deliver(chunks) => self.play(&chunks, None, dest, listener).await,
            Attempt::FailAfter {
                chunks,
                after,
                failure,
            } => self.play(&chunks, Some((after, failure)), dest, listener).await,
            Attempt::Hang => std::future::pending().await,
        }
    }

    async fn check_connection(&self) -> Result<()> {
        self.connection_checks.fetch_add(1, Ordering::SeqCst);
        if self.connection_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transient("offline".into()))
        }
    }
}
