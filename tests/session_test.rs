use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use talkcoach::Config;
use talkcoach::playback::SegmentSink;
use talkcoach::session::{Phase, SessionError};
use talkcoach::socket::FILLER_HINT;
use talkcoach::store::{SessionStore, StaticAuth};
use talkcoach::test_utils::{TestHarness, create_test_session, create_test_session_with_auth};
use talkcoach::types::Speaker;

/// Lets spawned session loops and persistence tasks run on the
/// current-thread test runtime.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn start(harness: &TestHarness) {
    harness.session.request_start().unwrap();
    harness.session.confirm_start().await.unwrap();
}

#[tokio::test]
async fn test_start_flow_connects_and_captures() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();

    assert_eq!(harness.session.state().phase, Phase::Idle);
    harness.session.request_start().unwrap();
    assert_eq!(harness.session.state().phase, Phase::AwaitingConfirmation);

    // Requesting again while a start is pending is rejected.
    assert!(matches!(
        harness.session.request_start(),
        Err(SessionError::AlreadyStarted)
    ));

    harness.session.confirm_start().await.unwrap();
    let state = harness.session.state();
    assert_eq!(state.phase, Phase::Active);
    assert_eq!(state.remaining_seconds, 300);
    assert!(!state.muted);
    assert!(state.started_at.is_some());

    assert!(harness.capture.is_started());
    let sent = harness.factory.transport().sent_json();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "setup");
}

#[tokio::test]
async fn test_confirm_without_pending_request_is_rejected() {
    let harness = create_test_session();
    assert!(matches!(
        harness.session.confirm_start().await,
        Err(SessionError::NotPending)
    ));
}

#[tokio::test]
async fn test_denied_microphone_aborts_before_any_connection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();

    harness.capture.deny_permission();
    harness.session.request_start().unwrap();
    assert!(matches!(
        harness.session.confirm_start().await,
        Err(SessionError::Capture(_))
    ));

    // Nothing was connected and the pending start survives for a retry.
    assert!(harness.factory.transport().sent_frames().is_empty());
    assert_eq!(harness.session.state().phase, Phase::AwaitingConfirmation);
    assert!(harness.sinks.created().is_empty());

    harness.session.confirm_start().await.unwrap();
    assert_eq!(harness.session.state().phase, Phase::Active);
}

#[tokio::test]
async fn test_failed_connect_releases_the_microphone() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();

    harness.factory.fail_next_connect();
    harness.session.request_start().unwrap();
    assert!(matches!(
        harness.session.confirm_start().await,
        Err(SessionError::Socket(_))
    ));

    assert!(harness.capture.is_stopped());
    assert_eq!(harness.session.state().phase, Phase::AwaitingConfirmation);
}

#[tokio::test]
async fn test_mute_silences_capture_without_touching_the_stream() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    assert!(harness.session.toggle_mute());
    assert!(harness.capture.is_muted());
    assert!(!harness.factory.transport().is_disconnected());

    // Capture keeps emitting on its cadence; muted chunks still go out.
    assert!(harness.capture.emit(&b"silent-chunk"[..]));
    settle().await;
    let sent = harness.factory.transport().sent_json();
    let last = sent.last().unwrap();
    assert_eq!(last["type"], "audioIn");
    assert_eq!(last["data"], BASE64.encode(b"silent-chunk").as_str());

    assert!(!harness.session.toggle_mute());
    assert!(!harness.capture.is_muted());
}

#[tokio::test]
async fn test_captured_chunks_flow_out_and_into_the_archive() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness.capture.emit(&b"pcm-1"[..]);
    harness.capture.emit(&b"pcm-2"[..]);
    settle().await;

    let sent = harness.factory.transport().sent_json();
    assert_eq!(sent.len(), 3); // setup + two chunks
    assert_eq!(sent[1]["data"], BASE64.encode(b"pcm-1").as_str());
    assert_eq!(sent[2]["data"], BASE64.encode(b"pcm-2").as_str());

    harness.session.end_session().await;
    settle().await;

    let listed = harness.store.list_sessions("user-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    let record = harness.store.record(&listed[0].id).unwrap();
    assert_eq!(&record.user_audio[..], b"pcm-1pcm-2");

    let blob = harness
        .media
        .blob(&format!("sessions/user-1/{}/user.pcm", record.id))
        .expect("user audio should be uploaded");
    assert_eq!(blob, b"pcm-1pcm-2");
}

#[tokio::test]
async fn test_agent_audio_plays_and_is_archived() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness
        .factory
        .inject_json(json!({"type": "audioStream", "data": BASE64.encode(b"mp3-a")}))
        .await;
    harness
        .factory
        .inject_json(json!({"type": "audioStream", "data": BASE64.encode(b"mp3-b")}))
        .await;
    settle().await;

    let sink = harness.sinks.sink(0);
    assert_eq!(sink.appended().len(), 2);

    harness.session.end_session().await;
    settle().await;

    let listed = harness.store.list_sessions("user-1").await.unwrap();
    let record = harness.store.record(&listed[0].id).unwrap();
    assert_eq!(&record.agent_audio[..], b"mp3-amp3-b");
    assert!(
        harness
            .media
            .blob(&format!("sessions/user-1/{}/agent.mp3", record.id))
            .is_some()
    );
}

#[tokio::test]
async fn test_barge_in_discards_playback_and_opens_a_fresh_sink() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness
        .factory
        .inject_json(json!({"type": "audioStream", "data": BASE64.encode(b"agent-speech")}))
        .await;
    settle().await;
    let first = harness.sinks.sink(0);
    assert_eq!(first.appended().len(), 1);

    // The interrupt and the agent's next reply arrive back to back; the
    // reply must land on the fresh sink, never the one being torn down.
    harness
        .factory
        .inject_json(json!({"type": "voiceActivityStart"}))
        .await;
    harness
        .factory
        .inject_json(json!({"type": "audioStream", "data": BASE64.encode(b"next-reply")}))
        .await;
    settle().await;

    assert!(first.is_closed());
    assert_eq!(first.appended().len(), 1);
    assert_eq!(harness.sinks.created().len(), 2);

    let second = harness.sinks.sink(1);
    assert_eq!(
        second.appended(),
        vec![bytes::Bytes::from_static(b"next-reply")]
    );

    // Both chunks still reach the archive in order.
    harness.session.end_session().await;
    settle().await;
    let listed = harness.store.list_sessions("user-1").await.unwrap();
    let record = harness.store.record(&listed[0].id).unwrap();
    assert_eq!(&record.agent_audio[..], b"agent-speechnext-reply");
}

#[tokio::test]
async fn test_voice_activity_while_agent_is_silent_changes_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness
        .factory
        .inject_json(json!({"type": "voiceActivityStart"}))
        .await;
    settle().await;

    assert_eq!(harness.sinks.created().len(), 1);
    assert!(!harness.sinks.sink(0).is_closed());
}

#[tokio::test]
async fn test_voice_activity_end_resumes_playback() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    let sink = harness.sinks.sink(0);
    sink.pause();
    assert!(sink.is_paused());

    harness
        .factory
        .inject_json(json!({"type": "voiceActivityEnd"}))
        .await;
    settle().await;

    assert!(!sink.is_paused());
}

#[tokio::test]
async fn test_transcripts_accumulate_and_seal_into_the_record() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness
        .factory
        .inject_json(json!({"type": "onUserTranscript", "message": "I want to practice"}))
        .await;
    harness
        .factory
        .inject_json(json!({"type": "onAgentTranscript", "message": "Great, let's begin"}))
        .await;
    settle().await;

    let transcript = harness.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].speaker, Speaker::User);
    assert_eq!(transcript[1].speaker, Speaker::Agent);

    harness.session.end_session().await;
    settle().await;

    // The live transcript is cleared; the record carries it plus the
    // closing system line.
    assert!(harness.session.transcript().is_empty());

    let listed = harness.store.list_sessions("user-1").await.unwrap();
    let record = harness.store.record(&listed[0].id).unwrap();
    assert_eq!(record.transcript.len(), 3);
    let closing = record.transcript.last().unwrap();
    assert_eq!(closing.speaker, Speaker::System);
    assert!(closing.text.starts_with("Ended session at "));
    assert!(closing.text.ends_with(" for 00:00"));
}

#[tokio::test]
async fn test_filler_words_inject_a_single_coaching_hint() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness
        .factory
        .inject_json(json!({"type": "onAgentTranscript", "message": "Uh, "}))
        .await;
    harness
        .factory
        .inject_json(json!({"type": "onAgentTranscript", "message": "uh,"}))
        .await;
    settle().await;

    let transcript = harness.session.transcript();
    let hints = transcript.iter().filter(|l| l.text == FILLER_HINT).count();
    assert_eq!(hints, 1);
    assert_eq!(transcript.len(), 3);
}

#[tokio::test]
async fn test_end_session_is_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    harness.session.end_session().await;
    harness.session.end_session().await;
    settle().await;

    let state = harness.session.state();
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.remaining_seconds, 300);
    assert!(state.started_at.is_none());

    assert!(harness.capture.is_stopped());
    assert!(harness.factory.transport().is_disconnected());
    assert!(harness.sinks.sink(0).is_closed());

    // Exactly one record, with exactly one closing line.
    let listed = harness.store.list_sessions("user-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    let record = harness.store.record(&listed[0].id).unwrap();
    let closings = record
        .transcript
        .iter()
        .filter(|l| l.speaker == Speaker::System)
        .count();
    assert_eq!(closings, 1);
}

#[tokio::test]
async fn test_signed_out_sessions_are_not_persisted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session_with_auth(StaticAuth::signed_out());
    start(&harness).await;

    harness.capture.emit(&b"pcm"[..]);
    settle().await;
    harness.session.end_session().await;
    settle().await;

    // The live session ran fine; it just left nothing behind.
    assert_eq!(harness.session.state().phase, Phase::Idle);
    assert!(
        harness
            .store
            .list_sessions("user-1")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_transport_failure_surfaces_one_error_and_end_clears_it() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    let mut errors = harness.session.subscribe_errors();
    harness.factory.drop_connection().await;
    tokio::time::timeout(Duration::from_secs(5), errors.changed())
        .await
        .expect("timed out waiting for the error slot")
        .unwrap();
    assert_eq!(
        harness.session.last_error().as_deref(),
        Some("Voice agent connection error")
    );

    // The session stays up in degraded form and still ends cleanly.
    assert_eq!(harness.session.state().phase, Phase::Active);
    harness.session.end_session().await;
    settle().await;
    assert!(harness.session.last_error().is_none());
    assert_eq!(
        harness.store.list_sessions("user-1").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_recorded_duration_follows_the_wall_clock() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;

    // Three minutes and change of wall time pass; the countdown has not
    // ticked at all, so the remainder still says a full session is left.
    harness.clock.advance(Duration::from_secs(187));
    assert_eq!(harness.session.state().remaining_seconds, 300);

    harness.session.end_session().await;
    settle().await;

    let listed = harness.store.list_sessions("user-1").await.unwrap();
    assert_eq!(listed[0].duration_seconds, 187);
    let record = harness.store.record(&listed[0].id).unwrap();
    assert_eq!(record.duration_seconds, 187);
    let closing = record.transcript.last().unwrap();
    assert!(closing.text.ends_with(" for 03:07"));
}

#[tokio::test]
async fn test_persistence_failure_never_disturbs_teardown() {
    use std::sync::Arc;
    use talkcoach::VoiceSession;
    use talkcoach::playback::SegmentSink;
    use talkcoach::session::SinkFactory;
    use talkcoach::test_utils::{
        FailingStore, ManualSink, ScriptedCapture, ScriptedTransportFactory,
    };

    let _ = env_logger::builder().is_test(true).try_init();

    let factory = Arc::new(ScriptedTransportFactory::new());
    let capture = Arc::new(ScriptedCapture::new());
    let sink_factory: SinkFactory =
        Box::new(|| Ok(ManualSink::auto() as Arc<dyn SegmentSink>));
    let session = VoiceSession::new(
        Config::default(),
        factory.clone(),
        capture.clone(),
        sink_factory,
        Arc::new(FailingStore),
        Arc::new(FailingStore),
        Arc::new(StaticAuth::signed_in("user-1")),
    );

    session.request_start().unwrap();
    session.confirm_start().await.unwrap();
    capture.emit(&b"pcm"[..]);
    settle().await;

    session.end_session().await;
    settle().await;

    // Both the record save and the uploads failed; the session still tore
    // down cleanly.
    assert_eq!(session.state().phase, Phase::Idle);
    assert!(capture.is_stopped());
    assert!(factory.transport().is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_countdown_expiry_ends_the_session() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = create_test_session();
    start(&harness).await;
    assert_eq!(harness.session.state().remaining_seconds, 300);

    // The wall clock tracks the full session; the countdown reaching zero
    // must end it exactly like a manual end would.
    harness.clock.advance(Duration::from_secs(300));
    tokio::time::sleep(Duration::from_secs(302)).await;
    settle().await;

    assert_eq!(harness.session.state().phase, Phase::Idle);
    let listed = harness.store.list_sessions("user-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].duration_seconds, 300);
    let record = harness.store.record(&listed[0].id).unwrap();
    let closing = record.transcript.last().unwrap();
    assert_eq!(closing.speaker, Speaker::System);
    assert!(closing.text.ends_with(" for 05:00"));
}
