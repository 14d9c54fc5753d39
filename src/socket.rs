//! Duplex socket to the remote voice agent.
//!
//! [`AgentSocket`] owns the connection exclusively: it sends the setup
//! message as soon as the transport opens, wraps outbound microphone chunks
//! in `audioIn` envelopes, and classifies every inbound frame into
//! transcript events, audio chunks, and voice-activity signals, delivered
//! on a single channel in frame arrival order.

use crate::config::Config;
use crate::protocol::{ClientMessage, ServerEvent, decode_audio_payload};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::{AgentEvent, Speaker, TranscriptEvent, VoiceActivity};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

/// The exact normalized agent transcript that triggers a coaching hint.
const FILLER_TOKEN: &str = "uh,";

/// The synthetic coaching line injected when the filler token repeats.
pub const FILLER_HINT: &str =
    "I notice you're using 'uh' quite a bit. Would you like some tips to reduce filler words?";

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("setup message failed: {0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, SocketError>;

/// Registration hooks handed to [`AgentSocket::connect`].
///
/// Every classified frame goes through `events`, audio included. Splitting
/// audio onto its own channel would let it race the voice-activity events
/// it is ordered against on the wire.
///
/// The error slot is a `watch` channel on purpose: the latest transport
/// failure replaces any prior unacknowledged one, errors never queue.
pub struct SocketSinks {
    pub events: mpsc::Sender<AgentEvent>,
    pub errors: watch::Sender<Option<String>>,
}

pub struct AgentSocket {
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    is_connected: Arc<AtomicBool>,
    expected_disconnect: Arc<AtomicBool>,
    setup: ClientMessage,
    filler_hint_debounce: Duration,
}

impl AgentSocket {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &Config) -> Self {
        Self {
            factory,
            transport: Mutex::new(None),
            is_connected: Arc::new(AtomicBool::new(false)),
            expected_disconnect: Arc::new(AtomicBool::new(false)),
            setup: ClientMessage::Setup {
                api_key: config.api_key.clone(),
                output_format: config.output_format.clone(),
                output_sample_rate: config.output_sample_rate,
                input_encoding: config.input_encoding.clone(),
                input_sample_rate: config.input_sample_rate,
            },
            filler_hint_debounce: config.filler_hint_debounce,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// Opens the connection and sends the setup message.
    ///
    /// Connecting is idempotent per session: a second call while connected
    /// logs and returns without touching the existing connection.
    pub async fn connect(&self, sinks: SocketSinks) -> Result<()> {
        if self.is_connected() {
            warn!(target: "Socket", "Already connected, ignoring connect request");
            return Ok(());
        }

        let (transport, event_rx) = self
            .factory
            .create_transport()
            .await
            .map_err(|e| SocketError::Connect(e.to_string()))?;

        let setup = serde_json::to_vec(&self.setup)
            .map_err(|e| SocketError::Setup(e.to_string()))?;
        transport
            .send(&setup)
            .await
            .map_err(|e| SocketError::Setup(e.to_string()))?;

        *self.transport.lock().await = Some(transport);
        self.is_connected.store(true, Ordering::Release);
        self.expected_disconnect.store(false, Ordering::Release);

        tokio::spawn(classify_pump(
            event_rx,
            sinks,
            self.is_connected.clone(),
            self.expected_disconnect.clone(),
            self.filler_hint_debounce,
        ));

        Ok(())
    }

    /// Forwards one captured audio chunk as a base64 `audioIn` envelope.
    ///
    /// Never fails: chunks sent while the socket is closed, or lost to a
    /// dying connection, are dropped with a log line.
    pub async fn send_audio(&self, chunk: &[u8]) {
        if !self.is_connected() {
            trace!(target: "Socket", "Not connected, dropping {} byte chunk", chunk.len());
            return;
        }

        let envelope = match serde_json::to_vec(&ClientMessage::audio_in(chunk)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(target: "Socket", "Failed to encode audioIn envelope: {e}");
                return;
            }
        };

        let guard = self.transport.lock().await;
        if let Some(transport) = guard.as_ref() {
            if let Err(e) = transport.send(&envelope).await {
                warn!(target: "Socket", "Dropped outbound chunk: {e}");
            }
        }
    }

    /// Closes the connection. Safe to call repeatedly or when never opened.
    pub async fn close(&self) {
        self.expected_disconnect.store(true, Ordering::Release);
        self.is_connected.store(false, Ordering::Release);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
            debug!(target: "Socket", "Connection closed");
        }
    }
}

/// Reads transport events and dispatches classified agent events until the
/// connection or the session goes away.
async fn classify_pump(
    mut event_rx: mpsc::Receiver<TransportEvent>,
    sinks: SocketSinks,
    is_connected: Arc<AtomicBool>,
    expected_disconnect: Arc<AtomicBool>,
    filler_hint_debounce: Duration,
) {
    let mut last_filler_hint: Option<tokio::time::Instant> = None;

    while let Some(event) = event_rx.recv().await {
        match event {
            TransportEvent::Connected => {
                debug!(target: "Socket", "Transport connected");
            }
            TransportEvent::FrameReceived(frame) => {
                if handle_frame(&frame, &sinks, &mut last_filler_hint, filler_hint_debounce)
                    .await
                    .is_err()
                {
                    // Session side hung up; nothing left to deliver to.
                    debug!(target: "Socket", "Event sinks dropped, stopping pump");
                    return;
                }
            }
            TransportEvent::Disconnected => {
                let was_connected = is_connected.swap(false, Ordering::AcqRel);
                if was_connected && !expected_disconnect.load(Ordering::Acquire) {
                    warn!(target: "Socket", "Connection lost unexpectedly");
                    let _ = sinks.errors.send(Some("Voice agent connection error".to_string()));
                }
                return;
            }
        }
    }
}

struct SinksGone;

/// Classifies one inbound frame. A malformed frame is logged and dropped;
/// it never tears down the pump.
async fn handle_frame(
    frame: &[u8],
    sinks: &SocketSinks,
    last_filler_hint: &mut Option<tokio::time::Instant>,
    filler_hint_debounce: Duration,
) -> std::result::Result<(), SinksGone> {
    let event: ServerEvent = match serde_json::from_slice(frame) {
        Ok(event) => event,
        Err(e) => {
            error!(target: "Socket", "Dropping malformed frame: {e}");
            return Ok(());
        }
    };

    match event {
        ServerEvent::UserTranscript { message } => {
            trace!(target: "Socket", "User transcript: {message}");
            sinks
                .events
                .send(AgentEvent::Transcript(TranscriptEvent {
                    speaker: Speaker::User,
                    text: message,
                    at: Utc::now(),
                }))
                .await
                .map_err(|_| SinksGone)?;
        }
        ServerEvent::AgentTranscript { message } => {
            trace!(target: "Socket", "Agent transcript: {message}");
            let is_filler = message.trim().to_lowercase() == FILLER_TOKEN;
            sinks
                .events
                .send(AgentEvent::Transcript(TranscriptEvent {
                    speaker: Speaker::Agent,
                    text: message,
                    at: Utc::now(),
                }))
                .await
                .map_err(|_| SinksGone)?;

            if is_filler {
                let now = tokio::time::Instant::now();
                let debounced = last_filler_hint
                    .map(|at| now.duration_since(at) <= filler_hint_debounce)
                    .unwrap_or(false);
                if !debounced {
                    *last_filler_hint = Some(now);
                    sinks
                        .events
                        .send(AgentEvent::Transcript(TranscriptEvent {
                            speaker: Speaker::Agent,
                            text: FILLER_HINT.to_string(),
                            at: Utc::now(),
                        }))
                        .await
                        .map_err(|_| SinksGone)?;
                }
            }
        }
        ServerEvent::AudioStream { data } => match decode_audio_payload(&data) {
            Ok(bytes) => {
                sinks
                    .events
                    .send(AgentEvent::Audio(Bytes::from(bytes)))
                    .await
                    .map_err(|_| SinksGone)?;
            }
            Err(e) => {
                error!(target: "Socket", "Dropping audio chunk with invalid base64: {e}");
            }
        },
        ServerEvent::NewAudioStream => {
            trace!(target: "Socket", "New audio stream announced");
        }
        ServerEvent::VoiceActivityStart => {
            sinks
                .events
                .send(AgentEvent::VoiceActivity(VoiceActivity::Started))
                .await
                .map_err(|_| SinksGone)?;
        }
        ServerEvent::VoiceActivityEnd => {
            sinks
                .events
                .send(AgentEvent::VoiceActivity(VoiceActivity::Stopped))
                .await
                .map_err(|_| SinksGone)?;
        }
        ServerEvent::Unknown => {
            trace!(target: "Socket", "Ignoring unrecognized server event");
        }
    }

    Ok(())
}
