use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::VoiceSession;
use crate::capture::{AudioCapture, CaptureError};
use crate::config::Config;
use crate::playback::{PlaybackError, SegmentSink};
use crate::store::{
    MediaStore, MemoryMediaStore, MemoryStore, SessionStore, StaticAuth, StoreError,
};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::{SessionRecord, SessionSummary};

/// A transport that records outbound frames and lets the test push inbound
/// ones through the factory.
#[derive(Default)]
pub struct ScriptedTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    disconnected: AtomicBool,
}

impl ScriptedTransport {
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent_frames()
            .iter()
            .map(|frame| serde_json::from_slice(frame).expect("outbound frame should be JSON"))
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("transport is disconnected"));
        }
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

/// Hands out one [`ScriptedTransport`] and keeps the inbound event sender so
/// tests can script the server side of the conversation.
pub struct ScriptedTransportFactory {
    transport: Arc<ScriptedTransport>,
    event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    fail_connect: AtomicBool,
}

impl Default for ScriptedTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransportFactory {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ScriptedTransport::default()),
            event_tx: Mutex::new(None),
            fail_connect: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> Arc<ScriptedTransport> {
        self.transport.clone()
    }

    /// Makes the next `create_transport` call fail.
    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::Release);
    }

    pub async fn inject_frame(&self, frame: impl Into<Bytes>) {
        let tx = self.sender();
        tx.send(TransportEvent::FrameReceived(frame.into()))
            .await
            .expect("frame pump should be alive");
    }

    pub async fn inject_json(&self, value: serde_json::Value) {
        self.inject_frame(value.to_string().into_bytes()).await;
    }

    /// Simulates the server dropping the connection.
    pub async fn drop_connection(&self) {
        let tx = self.sender();
        tx.send(TransportEvent::Disconnected)
            .await
            .expect("frame pump should be alive");
    }

    fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.event_tx
            .lock()
            .expect("event_tx lock poisoned")
            .clone()
            .expect("create_transport should have been called")
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        if self.fail_connect.swap(false, Ordering::AcqRel) {
            return Err(anyhow::anyhow!("scripted connect failure"));
        }
        let (tx, rx) = mpsc::channel(100);
        tx.send(TransportEvent::Connected)
            .await
            .expect("fresh channel accepts the connected event");
        *self.event_tx.lock().expect("event_tx lock poisoned") = Some(tx);
        Ok((self.transport.clone(), rx))
    }
}

/// A sink whose appends either complete immediately (auto mode) or block
/// until the test releases them, and whose playing state the test controls.
pub struct ManualSink {
    auto: bool,
    appended: Mutex<Vec<Bytes>>,
    pending: Mutex<VecDeque<oneshot::Sender<Result<(), PlaybackError>>>>,
    playing: AtomicBool,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl ManualSink {
    /// Appends resolve only when the test calls [`ManualSink::complete_next`].
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::with_mode(false))
    }

    /// Appends resolve immediately and mark the sink as playing.
    pub fn auto() -> Arc<Self> {
        Arc::new(Self::with_mode(true))
    }

    fn with_mode(auto: bool) -> Self {
        Self {
            auto,
            appended: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn appended(&self) -> Vec<Bytes> {
        self.appended.lock().expect("appended lock poisoned").clone()
    }

    pub fn pending_appends(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Resolves the oldest in-flight append. Returns false when none was
    /// pending.
    pub fn complete_next(&self, result: Result<(), PlaybackError>) -> bool {
        let completer = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .pop_front();
        match completer {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SegmentSink for ManualSink {
    async fn append(&self, chunk: Bytes) -> Result<(), PlaybackError> {
        self.appended
            .lock()
            .expect("appended lock poisoned")
            .push(chunk);
        if self.auto {
            self.playing.store(true, Ordering::Release);
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push_back(tx);
        rx.await
            .map_err(|_| PlaybackError::Append("sink dropped".to_string()))?
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.playing.store(false, Ordering::Release);
        // Release anything still blocked so tasks do not leak.
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        while let Some(tx) = pending.pop_front() {
            let _ = tx.send(Err(PlaybackError::Append("sink closed".to_string())));
        }
    }
}

/// Records every sink handed to the session so tests can inspect the ones
/// created after barge-in resets.
#[derive(Default)]
pub struct SinkScript {
    created: Mutex<Vec<Arc<ManualSink>>>,
}

impl SinkScript {
    pub fn created(&self) -> Vec<Arc<ManualSink>> {
        self.created.lock().expect("created lock poisoned").clone()
    }

    pub fn sink(&self, index: usize) -> Arc<ManualSink> {
        self.created()
            .get(index)
            .cloned()
            .expect("sink should have been created")
    }
}

/// A capture stage driven entirely by the test: chunks flow only when the
/// test emits them.
#[derive(Default)]
pub struct ScriptedCapture {
    chunks: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    muted: AtomicBool,
    stopped: AtomicBool,
    deny_permission: AtomicBool,
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `start` fail like a denied microphone prompt.
    pub fn deny_permission(&self) {
        self.deny_permission.store(true, Ordering::Release);
    }

    /// Emits one chunk as if the microphone produced it. Returns false when
    /// capture is not running.
    pub fn emit(&self, chunk: impl Into<Bytes>) -> bool {
        let guard = self.chunks.lock().expect("chunks lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(chunk.into()).is_ok(),
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.chunks
            .lock()
            .expect("chunks lock poisoned")
            .is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl AudioCapture for ScriptedCapture {
    fn start(&self, chunks: mpsc::UnboundedSender<Bytes>) -> Result<(), CaptureError> {
        if self.deny_permission.swap(false, Ordering::AcqRel) {
            return Err(CaptureError::PermissionDenied(
                "microphone permission denied".to_string(),
            ));
        }
        *self.chunks.lock().expect("chunks lock poisoned") = Some(chunks);
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    fn stop(&self) {
        self.chunks.lock().expect("chunks lock poisoned").take();
        self.stopped.store(true, Ordering::Release);
    }
}

/// A settable wall clock so tests can assert recorded durations exactly.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("fixed start time is valid");
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).expect("advance fits a chrono duration");
    }
}

/// Persistence collaborator whose every operation fails.
#[derive(Debug, Clone, Default)]
pub struct FailingStore;

#[async_trait]
impl SessionStore for FailingStore {
    async fn save_session(
        &self,
        _user_id: &str,
        _record: &SessionRecord,
    ) -> Result<String, StoreError> {
        Err(StoreError::Backend("scripted store failure".to_string()))
    }

    async fn list_sessions(&self, _user_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        Err(StoreError::Backend("scripted store failure".to_string()))
    }

    async fn request_report(&self, _session_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("scripted store failure".to_string()))
    }
}

#[async_trait]
impl MediaStore for FailingStore {
    async fn upload(&self, _data: Vec<u8>, _path: &str) -> Result<String, StoreError> {
        Err(StoreError::Upload("scripted upload failure".to_string()))
    }
}

/// A fully scripted [`VoiceSession`] plus handles to every collaborator.
pub struct TestHarness {
    pub session: Arc<VoiceSession>,
    pub factory: Arc<ScriptedTransportFactory>,
    pub capture: Arc<ScriptedCapture>,
    pub sinks: Arc<SinkScript>,
    pub store: Arc<MemoryStore>,
    pub media: Arc<MemoryMediaStore>,
    pub clock: TestClock,
}

pub fn create_test_session() -> TestHarness {
    create_test_session_with(StaticAuth::signed_in("user-1"), test_config())
}

pub fn create_test_session_with_auth(auth: StaticAuth) -> TestHarness {
    create_test_session_with(auth, test_config())
}

fn test_config() -> Config {
    Config {
        agent_id: "agent-test".to_string(),
        api_key: "test-key".to_string(),
        ..Config::default()
    }
}

pub fn create_test_session_with(auth: StaticAuth, config: Config) -> TestHarness {
    let factory = Arc::new(ScriptedTransportFactory::new());
    let capture = Arc::new(ScriptedCapture::new());
    let sinks = Arc::new(SinkScript::default());
    let store = Arc::new(MemoryStore::new());
    let media = Arc::new(MemoryMediaStore::new());
    let clock = TestClock::new();

    let sink_factory: crate::session::SinkFactory = {
        let sinks = sinks.clone();
        Box::new(move || {
            let sink = ManualSink::auto();
            sinks
                .created
                .lock()
                .expect("created lock poisoned")
                .push(sink.clone());
            Ok(sink as Arc<dyn SegmentSink>)
        })
    };

    let session = VoiceSession::new_with_clock(
        config,
        factory.clone(),
        capture.clone(),
        sink_factory,
        store.clone(),
        media.clone(),
        Arc::new(auth),
        {
            let clock = clock.clone();
            Arc::new(move || clock.now())
        },
    );

    TestHarness {
        session,
        factory,
        capture,
        sinks,
        store,
        media,
        clock,
    }
}
