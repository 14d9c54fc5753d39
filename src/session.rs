//! Session lifecycle orchestration.
//!
//! [`VoiceSession`] ties capture, socket, and playback together: it owns the
//! phase machine (idle, awaiting confirmation, active, ending), the
//! countdown, mute state, transcript accumulation, and barge-in handling.
//! The microphone, the socket, and the output sink each stay exclusively
//! owned by their component; the session only talks through their
//! interfaces.

use crate::capture::{AudioCapture, CaptureError};
use crate::config::Config;
use crate::playback::{PlaybackBuffer, PlaybackError, SegmentSink};
use crate::socket::{AgentSocket, SocketError, SocketSinks};
use crate::store::{AuthProvider, MediaStore, SessionStore};
use crate::transport::TransportFactory;
use crate::types::{AgentEvent, SessionRecord, Speaker, TranscriptLine, VoiceActivity};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already in progress")]
    AlreadyStarted,
    #[error("no session start is pending confirmation")]
    NotPending,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Produces a fresh output sink; invoked at session start and again after
/// every barge-in reset.
pub type SinkFactory =
    Box<dyn Fn() -> crate::playback::Result<Arc<dyn SegmentSink>> + Send + Sync>;

/// Wall-clock source for `started_at`/`ended_at` and the recorded duration.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingConfirmation,
    Active,
    Ending,
}

/// Snapshot of the mutable session state.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub remaining_seconds: u64,
    pub muted: bool,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct VoiceSession {
    config: Config,
    state: Mutex<SessionState>,

    socket: AgentSocket,
    playback: Arc<PlaybackBuffer>,
    capture: Arc<dyn AudioCapture>,
    sink_factory: SinkFactory,

    store: Arc<dyn SessionStore>,
    media: Arc<dyn MediaStore>,
    auth: Arc<dyn AuthProvider>,

    transcript: Mutex<Vec<TranscriptLine>>,
    user_audio: Mutex<Vec<u8>>,
    agent_audio: Mutex<Vec<u8>>,

    /// Single error slot; the latest failure replaces any prior one.
    errors: watch::Sender<Option<String>>,
    shutdown_notifier: Arc<Notify>,
    clock: Clock,
}

impl VoiceSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        transport_factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn AudioCapture>,
        sink_factory: SinkFactory,
        store: Arc<dyn SessionStore>,
        media: Arc<dyn MediaStore>,
        auth: Arc<dyn AuthProvider>,
    ) -> Arc<Self> {
        Self::new_with_clock(
            config,
            transport_factory,
            capture,
            sink_factory,
            store,
            media,
            auth,
            Arc::new(Utc::now),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_clock(
        config: Config,
        transport_factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn AudioCapture>,
        sink_factory: SinkFactory,
        store: Arc<dyn SessionStore>,
        media: Arc<dyn MediaStore>,
        auth: Arc<dyn AuthProvider>,
        clock: Clock,
    ) -> Arc<Self> {
        let socket = AgentSocket::new(transport_factory, &config);
        let session_length = config.session_length;
        Arc::new(Self {
            config,
            state: Mutex::new(SessionState {
                phase: Phase::Idle,
                remaining_seconds: session_length.as_secs(),
                muted: false,
                started_at: None,
            }),
            socket,
            playback: Arc::new(PlaybackBuffer::new()),
            capture,
            sink_factory,
            store,
            media,
            auth,
            transcript: Mutex::new(Vec::new()),
            user_audio: Mutex::new(Vec::new()),
            agent_audio: Mutex::new(Vec::new()),
            errors: watch::channel(None).0,
            shutdown_notifier: Arc::new(Notify::new()),
            clock,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    /// Transcript accumulated so far in the current session.
    pub fn transcript(&self) -> Vec<TranscriptLine> {
        self.transcript
            .lock()
            .expect("transcript lock poisoned")
            .clone()
    }

    /// Latest unacknowledged session error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.errors.borrow().clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.errors.subscribe()
    }

    /// `Idle -> AwaitingConfirmation`. No side effects; the embedding layer
    /// shows the instructions.
    pub fn request_start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if state.phase != Phase::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        state.phase = Phase::AwaitingConfirmation;
        Ok(())
    }

    /// Backs out of a pending start without touching any resources.
    pub fn cancel_start(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if state.phase == Phase::AwaitingConfirmation {
            state.phase = Phase::Idle;
        }
    }

    /// `AwaitingConfirmation -> Active`: acquires the microphone, readies
    /// playback, connects the socket, and spawns the countdown and event
    /// loops.
    ///
    /// Capture starts first so a permission refusal aborts before any
    /// transport or playback resource is allocated; playback is initialized
    /// before the socket connects so the buffer is ready for the first
    /// `audioStream` frame.
    pub async fn confirm_start(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if state.phase != Phase::AwaitingConfirmation {
                return Err(SessionError::NotPending);
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        self.capture.start(chunk_tx)?;

        let sink = match (self.sink_factory)() {
            Ok(sink) => sink,
            Err(e) => {
                self.capture.stop();
                return Err(e.into());
            }
        };
        if let Err(e) = self.playback.initialize(sink) {
            self.capture.stop();
            return Err(e.into());
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sinks = SocketSinks {
            events: event_tx,
            errors: self.errors.clone(),
        };
        if let Err(e) = self.socket.connect(sinks).await {
            self.capture.stop();
            self.playback.reset();
            return Err(e.into());
        }

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.phase = Phase::Active;
            state.started_at = Some((self.clock)());
            state.remaining_seconds = self.config.session_length.as_secs();
            state.muted = false;
        }

        tokio::spawn(self.clone().countdown_loop());
        tokio::spawn(self.clone().event_loop(event_rx, chunk_rx));

        info!(target: "Session", "Session started");
        Ok(())
    }

    /// Flips the mute state and forwards it to the capture gain stage.
    /// Mute never touches the socket or playback. Returns the new state.
    pub fn toggle_mute(&self) -> bool {
        let mut state = self.state.lock().expect("state lock poisoned");
        if state.phase != Phase::Active {
            return state.muted;
        }
        state.muted = !state.muted;
        self.capture.set_muted(state.muted);
        debug!(target: "Session", "Muted: {}", state.muted);
        state.muted
    }

    /// Ends the active session: seals the record, tears every component
    /// down, and hands the record to persistence without blocking teardown.
    /// A no-op when no session is active, so double invocation and
    /// countdown/user races are harmless.
    pub async fn end_session(&self) {
        let started_at = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.phase != Phase::Active {
                debug!(target: "Session", "No active session to end");
                return;
            }
            state.phase = Phase::Ending;
            state.started_at.take()
        };

        let ended_at = (self.clock)();
        // Wall clock is authoritative for the recorded duration; the
        // countdown remainder can drift.
        let duration_seconds = started_at
            .map(|t| (ended_at - t).num_seconds().max(0))
            .unwrap_or(0);

        let summary = format!(
            "Ended session at {} for {:02}:{:02}",
            ended_at.format("%H:%M"),
            duration_seconds / 60,
            duration_seconds % 60
        );
        info!(target: "Session", "{summary}");

        let transcript = {
            let mut transcript = self.transcript.lock().expect("transcript lock poisoned");
            transcript.push(TranscriptLine {
                speaker: Speaker::System,
                text: summary,
                at: ended_at,
            });
            std::mem::take(&mut *transcript)
        };
        let user_audio = {
            let mut audio = self.user_audio.lock().expect("audio lock poisoned");
            Bytes::from(std::mem::take(&mut *audio))
        };
        let agent_audio = {
            let mut audio = self.agent_audio.lock().expect("audio lock poisoned");
            Bytes::from(std::mem::take(&mut *audio))
        };

        self.capture.stop();
        self.socket.close().await;
        self.playback.reset();
        self.shutdown_notifier.notify_waiters();
        let _ = self.errors.send(None);

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.phase = Phase::Idle;
            state.remaining_seconds = self.config.session_length.as_secs();
            state.muted = false;
            state.started_at = None;
        }

        let record = SessionRecord {
            id: new_session_id(ended_at),
            started_at: started_at.unwrap_or(ended_at),
            ended_at,
            duration_seconds,
            transcript,
            user_audio,
            agent_audio,
        };
        self.persist(record);
    }

    /// The `end_session` path for drop/navigation-away: a session must never
    /// be left dangling with an open microphone or socket.
    pub async fn shutdown(&self) {
        self.end_session().await;
        self.shutdown_notifier.notify_waiters();
    }

    /// Hands the sealed record to the persistence collaborators on a
    /// background task. Failures are logged; the live session already
    /// completed and teardown never waits on archival.
    fn persist(&self, record: SessionRecord) {
        let Some(user_id) = self.auth.current_user() else {
            info!(target: "Session", "No signed-in user, skipping session persistence");
            return;
        };
        let store = self.store.clone();
        let media = self.media.clone();
        tokio::spawn(async move {
            match store.save_session(&user_id, &record).await {
                Ok(session_id) => {
                    debug!(target: "Session", "Session {session_id} saved");
                }
                Err(e) => {
                    error!(target: "Session", "Failed to save session: {e}");
                }
            }

            let base = format!("sessions/{user_id}/{}", record.id);
            if !record.user_audio.is_empty() {
                if let Err(e) = media
                    .upload(record.user_audio.to_vec(), &format!("{base}/user.pcm"))
                    .await
                {
                    error!(target: "Session", "Failed to upload user audio: {e}");
                }
            }
            if !record.agent_audio.is_empty() {
                if let Err(e) = media
                    .upload(record.agent_audio.to_vec(), &format!("{base}/agent.mp3"))
                    .await
                {
                    error!(target: "Session", "Failed to upload agent audio: {e}");
                }
            }
        });
    }

    /// One tick per second while active; hitting zero ends the session with
    /// the same effects as a manual end.
    async fn countdown_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let expired = {
                        let mut state = self.state.lock().expect("state lock poisoned");
                        if state.phase != Phase::Active {
                            return;
                        }
                        state.remaining_seconds = state.remaining_seconds.saturating_sub(1);
                        state.remaining_seconds == 0
                    };
                    if expired {
                        info!(target: "Session/Countdown", "Session time elapsed");
                        self.end_session().await;
                        return;
                    }
                }
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Session/Countdown", "Shutdown signaled, exiting countdown");
                    return;
                }
            }
        }
    }

    /// Routes captured chunks out and classified agent events (transcripts,
    /// audio, voice activity) into the session. Agent events arrive on one
    /// channel and are handled to completion one at a time, so barge-in
    /// always discards exactly the audio that preceded it on the wire.
    async fn event_loop(
        self: Arc<Self>,
        event_rx: mpsc::Receiver<AgentEvent>,
        chunk_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let mut event_rx = Some(event_rx);
        let mut chunk_rx = Some(chunk_rx);

        loop {
            tokio::select! {
                maybe = recv_or_pending(&mut chunk_rx) => {
                    match maybe {
                        Some(chunk) => {
                            self.user_audio
                                .lock()
                                .expect("audio lock poisoned")
                                .extend_from_slice(&chunk);
                            self.socket.send_audio(&chunk).await;
                        }
                        None => chunk_rx = None,
                    }
                }
                maybe = recv_or_pending_bounded(&mut event_rx) => {
                    match maybe {
                        Some(event) => self.handle_agent_event(event),
                        None => event_rx = None,
                    }
                }
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Session", "Shutdown signaled, exiting event loop");
                    return;
                }
            }

            if event_rx.is_none() && chunk_rx.is_none() {
                debug!(target: "Session", "All event sources closed, exiting event loop");
                return;
            }
        }
    }

    fn handle_agent_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::Audio(chunk) => {
                self.agent_audio
                    .lock()
                    .expect("audio lock poisoned")
                    .extend_from_slice(&chunk);
                self.playback.enqueue(chunk);
            }
            AgentEvent::Transcript(ev) => {
                self.transcript
                    .lock()
                    .expect("transcript lock poisoned")
                    .push(TranscriptLine {
                        speaker: ev.speaker,
                        text: ev.text,
                        at: ev.at,
                    });
            }
            AgentEvent::VoiceActivity(VoiceActivity::Started) => self.handle_barge_in(),
            AgentEvent::VoiceActivity(VoiceActivity::Stopped) => {
                // Resume whatever the barge-in pause left behind.
                self.playback.resume();
            }
        }
    }

    /// Interrupts agent playback when the user speaks over it. Only emitted
    /// scheduled speech is interrupted; if nothing is playing, the signal is
    /// a playback no-op.
    fn handle_barge_in(&self) {
        if !self.playback.is_playing() {
            debug!(target: "Session", "User started speaking, agent not playing");
            return;
        }

        info!(target: "Session", "User interrupting agent, discarding queued audio");
        self.playback.pause();
        self.playback.reset();
        match (self.sink_factory)() {
            Ok(sink) => {
                if let Err(e) = self.playback.initialize(sink) {
                    warn!(target: "Session", "Failed to reinitialize playback: {e}");
                }
            }
            Err(e) => {
                warn!(target: "Session", "Failed to open a fresh output sink: {e}");
            }
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        // Async teardown cannot run here; stop capture synchronously and
        // wake the loops so nothing outlives the session.
        self.capture.stop();
        self.shutdown_notifier.notify_waiters();
    }
}

fn new_session_id(at: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}-{:08x}", at.timestamp(), u32::from_be_bytes(bytes))
}

async fn recv_or_pending(rx: &mut Option<mpsc::UnboundedReceiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_or_pending_bounded<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
