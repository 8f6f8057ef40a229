//! Progressive media buffer ingestion.
//!
//! Encoded chunks arrive from a streaming socket and are appended to a
//! progressive playback source one at a time. Appends must never overlap, so
//! all chunks flow through a bounded queue drained by a single task; after
//! each successful append, content older than the retention window is trimmed
//! so a long call cannot grow the buffer without bound.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::error::CallError;

/// Errors surfaced by the external playback source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source rejected append: {0}")]
    Append(String),
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("source closed")]
    Closed,
}

/// The progressive playback source a buffer feeds.
///
/// Implemented by the embedder over the real playback element; all timing
/// values are seconds of media time.
#[async_trait]
pub trait SourceSink: Send + Sync {
    /// Resolves once the source is open and ready to accept appends.
    async fn wait_open(&self) -> Result<(), SourceError>;

    /// Append one encoded chunk. Must not be called again until the previous
    /// append resolved; [`MediaBuffer`] guarantees that.
    async fn append(&self, chunk: Bytes) -> Result<(), SourceError>;

    /// End of the buffered range, in seconds.
    async fn buffered_end(&self) -> f64;

    /// Remove buffered content in `[from, to)`.
    async fn remove(&self, from: f64, to: f64) -> Result<(), SourceError>;

    /// End the stream cleanly; further appends are invalid.
    async fn end_stream(&self);
}

#[derive(Debug, Clone)]
pub struct MediaBufferConfig {
    /// Capacity of the append queue; socket reads backpressure on it.
    pub queue_capacity: usize,
    /// How long to wait for the source to open.
    pub open_timeout: Duration,
    /// Buffered media older than this, relative to the live edge, is trimmed.
    pub retention_window: Duration,
}

impl Default for MediaBufferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            open_timeout: Duration::from_secs(4),
            retention_window: Duration::from_secs(90),
        }
    }
}

/// Bounded append queue in front of a progressive playback source.
pub struct MediaBuffer {
    sink: Arc<dyn SourceSink>,
    config: MediaBufferConfig,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    appended: watch::Receiver<u64>,
}

impl MediaBuffer {
    /// Create the buffer and spawn its drain task.
    pub fn new(sink: Arc<dyn SourceSink>, config: MediaBufferConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (appended_tx, appended_rx) = watch::channel(0u64);
        let retention = config.retention_window;
        tokio::spawn(drain(sink.clone(), rx, appended_tx, retention));
        Arc::new(Self {
            sink,
            config,
            tx: Mutex::new(Some(tx)),
            appended: appended_rx,
        })
    }

    /// Await source-open, bounded by the configured timeout.
    pub async fn open(&self) -> Result<(), CallError> {
        match timeout(self.config.open_timeout, self.sink.wait_open()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallError::Transport(e.to_string())),
            Err(_) => Err(CallError::SourceOpenTimeout),
        }
    }

    /// Enqueue one chunk, waiting if the queue is full.
    ///
    /// A chunk arriving after [`finish`](Self::finish) is dropped silently;
    /// the socket may still be flushing when the stream ends.
    pub async fn push(&self, chunk: Bytes) {
        let tx = self.tx.lock().await.clone();
        if let Some(tx) = tx {
            if tx.send(chunk).await.is_err() {
                debug!("media buffer drain task gone; dropping chunk");
            }
        }
    }

    /// Number of chunks successfully appended so far.
    pub fn appended_chunks(&self) -> u64 {
        *self.appended.borrow()
    }

    /// Resolves once at least one chunk has been appended to the source.
    pub async fn wait_first_append(&self) {
        let mut rx = self.appended.clone();
        // Only fails if the drain task is gone, in which case no chunk will
        // ever render and the caller's surrounding timeout applies.
        let _ = rx.wait_for(|count| *count >= 1).await;
    }

    /// Close the queue; the drain task ends the source stream once drained.
    pub async fn finish(&self) {
        self.tx.lock().await.take();
    }
}

async fn drain(
    sink: Arc<dyn SourceSink>,
    mut rx: mpsc::Receiver<Bytes>,
    appended: watch::Sender<u64>,
    retention: Duration,
) {
    let mut count = 0u64;
    while let Some(chunk) = rx.recv().await {
        match sink.append(chunk).await {
            Ok(()) => {
                count += 1;
                let _ = appended.send(count);
                trim(&sink, retention).await;
            }
            Err(SourceError::Closed) => {
                debug!("playback source closed mid-stream; stopping ingestion");
                return;
            }
            Err(e) => {
                // Degraded playback beats a dead call; skip the chunk.
                warn!("media append failed: {e}");
            }
        }
    }
    sink.end_stream().await;
}

async fn trim(sink: &Arc<dyn SourceSink>, retention: Duration) {
    let live_edge = sink.buffered_end().await;
    let cut = live_edge - retention.as_secs_f64();
    if cut > 0.0 {
        if let Err(e) = sink.remove(0.0, cut).await {
            debug!("retention trim failed: {e}");
        }
    }
}
