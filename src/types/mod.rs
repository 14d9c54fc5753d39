pub mod events;
pub mod session;

pub use events::{AgentEvent, TranscriptEvent, VoiceActivity};
pub use session::{SessionRecord, SessionSummary, Speaker, TranscriptLine};
