use crate::types::session::Speaker;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A transcript produced by the agent's speech recognition, already
/// attributed to a speaker. Transient: the orchestrator folds these into
/// the session transcript.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Server-side voice activity detection on the user's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Started,
    Stopped,
}

/// Classified inbound event from the agent socket.
///
/// All classified frames, audio included, travel on one channel so the
/// session sees them in exact frame arrival order. Audio racing ahead of a
/// voice-activity signal (or vice versa) would make barge-in discard the
/// wrong chunks.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Transcript(TranscriptEvent),
    /// A decoded chunk of agent speech.
    Audio(Bytes),
    VoiceActivity(VoiceActivity),
}
