use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Speaker {
    User,
    Agent,
    /// Lines the session itself injects, e.g. the end-of-session summary.
    System,
}

/// One line of the session transcript.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
    /// Wall-clock time of the utterance.
    pub at: DateTime<Utc>,
}

/// A finished session, sealed when the session ends and handed to the
/// persistence collaborator as-is.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub transcript: Vec<TranscriptLine>,
    /// Captured microphone audio, concatenated in capture order.
    pub user_audio: Bytes,
    /// Agent audio as received, concatenated in arrival order.
    pub agent_audio: Bytes,
}

/// Listing entry for previous sessions, most recent first.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub report_requested: bool,
}
