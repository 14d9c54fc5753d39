//! Microphone capture with an in-path gain stage.
//!
//! Muting is a volume-zero operation, not a pause: the chunk cadence keeps
//! running so the remote agent still receives a (silent) stream and its
//! voice-activity detection stays consistent.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("capture device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Exclusive owner of the microphone device.
///
/// `start` produces an infinite, non-restartable sequence of encoded audio
/// chunks at a fixed cadence, delivered through the given sender.
pub trait AudioCapture: Send + Sync {
    fn start(&self, chunks: mpsc::UnboundedSender<Bytes>) -> Result<()>;

    /// Adjusts the gain stage without stopping capture or the cadence.
    fn set_muted(&self, muted: bool);

    /// Releases the device. Safe to call when never started.
    fn stop(&self);
}

#[cfg(feature = "microphone")]
pub use device::CpalCapture;

#[cfg(feature = "microphone")]
mod device {
    use super::{AudioCapture, CaptureError, Result};
    use bytes::Bytes;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use log::{debug, error, warn};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Real microphone capture via cpal. The `cpal::Stream` is `!Send`, so
    /// a dedicated thread owns it until `stop`.
    pub struct CpalCapture {
        chunk_interval: Duration,
        /// Gain as f32 bits; the input callback multiplies every sample.
        gain: Arc<AtomicU32>,
        started: AtomicBool,
        shutdown_tx: std::sync::Mutex<Option<std_mpsc::Sender<()>>>,
    }

    impl CpalCapture {
        pub fn new(chunk_interval: Duration) -> Self {
            Self {
                chunk_interval,
                gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
                started: AtomicBool::new(false),
                shutdown_tx: std::sync::Mutex::new(None),
            }
        }
    }

    impl AudioCapture for CpalCapture {
        fn start(&self, chunks: mpsc::UnboundedSender<Bytes>) -> Result<()> {
            if self.started.swap(true, Ordering::AcqRel) {
                warn!(target: "Capture", "Capture already started");
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
            let gain = self.gain.clone();
            let chunk_interval = self.chunk_interval;

            std::thread::spawn(move || {
                let stream = match build_input_stream(gain, chunk_interval, chunks) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::Device(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until stop; dropping it releases the mic.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!(target: "Capture", "Microphone released");
            });

            ready_rx
                .recv()
                .map_err(|_| CaptureError::Device("capture thread died".to_string()))??;

            *self.shutdown_tx.lock().expect("capture lock poisoned") = Some(shutdown_tx);
            debug!(target: "Capture", "Recording started");
            Ok(())
        }

        fn set_muted(&self, muted: bool) {
            let gain = if muted { 0.0f32 } else { 1.0f32 };
            self.gain.store(gain.to_bits(), Ordering::Release);
        }

        fn stop(&self) {
            if let Some(tx) = self
                .shutdown_tx
                .lock()
                .expect("capture lock poisoned")
                .take()
            {
                let _ = tx.send(());
                debug!(target: "Capture", "Recording stopped");
            }
        }
    }

    fn build_input_stream(
        gain: Arc<AtomicU32>,
        chunk_interval: Duration,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::PermissionDenied("no input device available".into()))?;
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::PermissionDenied(e.to_string()))?;

        let samples_per_chunk = (config.sample_rate().0 as u128 * config.channels() as u128
            * chunk_interval.as_millis()
            / 1000) as usize;
        let stream_config: cpal::StreamConfig = config.clone().into();

        let mut pending: Vec<u8> = Vec::with_capacity(samples_per_chunk * 2);
        let on_error = |e: cpal::StreamError| error!(target: "Capture", "Stream error: {e}");

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _| {
                        let gain = f32::from_bits(gain.load(Ordering::Acquire));
                        for &sample in data {
                            let scaled = (sample * gain).clamp(-1.0, 1.0);
                            let pcm = (scaled * i16::MAX as f32) as i16;
                            pending.extend_from_slice(&pcm.to_le_bytes());
                        }
                        flush_chunks(&mut pending, samples_per_chunk * 2, &chunks);
                    },
                    on_error,
                    None,
                )
                .map_err(|e| CaptureError::Device(e.to_string()))?,
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _| {
                        let gain = f32::from_bits(gain.load(Ordering::Acquire));
                        for &sample in data {
                            let pcm = (sample as f32 * gain) as i16;
                            pending.extend_from_slice(&pcm.to_le_bytes());
                        }
                        flush_chunks(&mut pending, samples_per_chunk * 2, &chunks);
                    },
                    on_error,
                    None,
                )
                .map_err(|e| CaptureError::Device(e.to_string()))?,
            other => {
                return Err(CaptureError::Device(format!(
                    "unsupported sample format: {other}"
                )));
            }
        };

        Ok(stream)
    }

    /// Emits complete chunks from the pending buffer. Runs inside the audio
    /// callback, so it must never block; an unbounded send is a plain push.
    fn flush_chunks(
        pending: &mut Vec<u8>,
        chunk_bytes: usize,
        chunks: &mpsc::UnboundedSender<Bytes>,
    ) {
        while pending.len() >= chunk_bytes {
            let rest = pending.split_off(chunk_bytes);
            let chunk = std::mem::replace(pending, rest);
            if chunks.send(Bytes::from(chunk)).is_err() {
                // Session side is gone; keep draining so the buffer
                // doesn't grow until stop() lands.
                pending.clear();
                return;
            }
        }
    }
}
