//! Segmented playback of the agent's audio stream.
//!
//! Inbound audio arrives as arbitrarily sized, arbitrarily timed chunks.
//! [`PlaybackBuffer`] feeds them to a [`SegmentSink`] strictly in arrival
//! order with at most one append in flight, and supports a hard reset that
//! discards every queued chunk when the user barges in over the agent.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("buffer is already initialized")]
    AlreadyInitialized,
    #[error("audio output unavailable: {0}")]
    Output(String),
    #[error("sink rejected segment: {0}")]
    Append(String),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

/// An audio sink fed by sequentially appended byte segments.
///
/// `append` resolves when the sink has accepted the segment; the buffer
/// issues the next append only after that, so a sink never sees overlapping
/// appends.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    async fn append(&self, chunk: Bytes) -> Result<()>;
    fn pause(&self);
    fn resume(&self);
    fn is_playing(&self) -> bool;
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPhase {
    Uninitialized,
    /// A sink is attached and no append is in flight.
    Open,
    Appending,
    Closed,
}

struct Inner {
    phase: BufferPhase,
    queue: VecDeque<Bytes>,
    sink: Option<Arc<dyn SegmentSink>>,
    /// Bumped on every reset so the completion of a stale in-flight append
    /// cannot touch state that belongs to a fresh sink.
    generation: u64,
}

pub struct PlaybackBuffer {
    inner: Mutex<Inner>,
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: BufferPhase::Uninitialized,
                queue: VecDeque::new(),
                sink: None,
                generation: 0,
            }),
        }
    }

    /// Attaches a fresh sink. Fails if a sink is already attached; call
    /// [`PlaybackBuffer::reset`] first when reinitializing after barge-in.
    pub fn initialize(&self, sink: Arc<dyn SegmentSink>) -> Result<()> {
        let mut inner = self.inner.lock().expect("playback lock poisoned");
        match inner.phase {
            BufferPhase::Open | BufferPhase::Appending => Err(PlaybackError::AlreadyInitialized),
            BufferPhase::Uninitialized | BufferPhase::Closed => {
                inner.queue.clear();
                inner.sink = Some(sink);
                inner.phase = BufferPhase::Open;
                debug!(target: "Playback", "Buffer initialized (generation {})", inner.generation);
                Ok(())
            }
        }
    }

    /// Queues one chunk for playback, starting an append immediately if
    /// none is in flight. Chunks enqueued without an attached sink are
    /// dropped: stale audio must never play after a reset.
    pub fn enqueue(self: &Arc<Self>, chunk: Bytes) {
        let mut inner = self.inner.lock().expect("playback lock poisoned");
        match inner.phase {
            BufferPhase::Open => {
                inner.queue.push_back(chunk);
                self.begin_next_locked(&mut inner);
            }
            BufferPhase::Appending => {
                inner.queue.push_back(chunk);
            }
            BufferPhase::Uninitialized | BufferPhase::Closed => {
                warn!(target: "Playback", "Dropping {} byte chunk, no sink attached", chunk.len());
            }
        }
    }

    /// Discards all queued chunks and closes the sink. Idempotent; used for
    /// both barge-in and session end. A subsequent [`PlaybackBuffer::initialize`]
    /// is required before the buffer accepts chunks again.
    pub fn reset(&self) {
        let sink = {
            let mut inner = self.inner.lock().expect("playback lock poisoned");
            let dropped = inner.queue.len();
            inner.queue.clear();
            inner.generation += 1;
            inner.phase = BufferPhase::Closed;
            if dropped > 0 {
                debug!(target: "Playback", "Reset discarded {dropped} queued chunks");
            }
            inner.sink.take()
        };
        if let Some(sink) = sink {
            sink.close();
        }
    }

    pub fn pause(&self) {
        if let Some(sink) = self.current_sink() {
            sink.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(sink) = self.current_sink() {
            sink.resume();
        }
    }

    /// True when agent audio is actually coming out of the sink. Barge-in
    /// only interrupts scheduled speech, so a voice-activity start while
    /// this is false is a playback no-op.
    pub fn is_playing(&self) -> bool {
        self.current_sink().map(|s| s.is_playing()).unwrap_or(false)
    }

    fn current_sink(&self) -> Option<Arc<dyn SegmentSink>> {
        self.inner
            .lock()
            .expect("playback lock poisoned")
            .sink
            .clone()
    }

    /// Pops the oldest queued chunk and appends it. Caller holds the lock.
    fn begin_next_locked(self: &Arc<Self>, inner: &mut Inner) {
        let Some(chunk) = inner.queue.pop_front() else {
            inner.phase = BufferPhase::Open;
            return;
        };
        let Some(sink) = inner.sink.clone() else {
            inner.phase = BufferPhase::Open;
            return;
        };

        inner.phase = BufferPhase::Appending;
        let generation = inner.generation;
        let this = self.clone();
        tokio::spawn(async move {
            let result = sink.append(chunk).await;
            this.append_complete(generation, result);
        });
    }

    fn append_complete(self: &Arc<Self>, generation: u64, result: Result<()>) {
        let mut inner = self.inner.lock().expect("playback lock poisoned");
        if inner.generation != generation {
            trace!(target: "Playback", "Ignoring append completion from generation {generation}");
            return;
        }
        if let Err(e) = result {
            // Drop the offending chunk and keep going rather than stall.
            warn!(target: "Playback", "Sink rejected segment: {e}");
        }
        if inner.phase == BufferPhase::Appending {
            self.begin_next_locked(&mut inner);
        }
    }
}

/// Real audio output via rodio. Segments are decoded and appended to a
/// shared `rodio::Sink`; the `OutputStream` is `!Send`, so a dedicated
/// thread owns it for the lifetime of the sink.
#[cfg(feature = "playback")]
pub mod rodio_sink {
    use super::{PlaybackError, Result, SegmentSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use log::debug;
    use std::sync::Arc;
    use std::sync::mpsc;

    pub struct RodioSink {
        sink: Arc<rodio::Sink>,
        shutdown_tx: mpsc::Sender<()>,
    }

    impl RodioSink {
        /// Opens the default output device.
        pub fn open() -> Result<Self> {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let (ready_tx, ready_rx) = mpsc::channel::<Result<Arc<rodio::Sink>>>();

            std::thread::spawn(move || {
                let stream = match rodio::OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::Output(e.to_string())));
                        return;
                    }
                };
                let sink = Arc::new(rodio::Sink::connect_new(stream.mixer()));
                let _ = ready_tx.send(Ok(sink.clone()));

                // Block until close; dropping the stream releases the device.
                let _ = shutdown_rx.recv();
                sink.stop();
                drop(stream);
                debug!(target: "Playback", "Output device released");
            });

            let sink = ready_rx
                .recv()
                .map_err(|_| PlaybackError::Output("output thread died".to_string()))??;

            Ok(Self { sink, shutdown_tx })
        }
    }

    #[async_trait]
    impl SegmentSink for RodioSink {
        async fn append(&self, chunk: Bytes) -> Result<()> {
            let sink = self.sink.clone();
            tokio::task::spawn_blocking(move || {
                let source = rodio::Decoder::new(std::io::Cursor::new(chunk))
                    .map_err(|e| PlaybackError::Append(e.to_string()))?;
                sink.append(source);
                Ok(())
            })
            .await
            .map_err(|e| PlaybackError::Append(e.to_string()))?
        }

        fn pause(&self) {
            self.sink.pause();
        }

        fn resume(&self) {
            self.sink.play();
        }

        fn is_playing(&self) -> bool {
            !self.sink.is_paused() && !self.sink.empty()
        }

        fn close(&self) {
            self.sink.stop();
            let _ = self.shutdown_tx.send(());
        }
    }
}
