use crate::store::error::Result;
use crate::types::{SessionRecord, SessionSummary};
use async_trait::async_trait;

/// Durable storage for finished sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes one sealed session record and returns its storage id.
    async fn save_session(&self, user_id: &str, record: &SessionRecord) -> Result<String>;

    /// Session summaries for a user, most recent first.
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>>;

    /// Flags a session for report generation; fire-and-forget from the
    /// session core's perspective.
    async fn request_report(&self, session_id: &str) -> Result<()>;
}

/// Object storage for recorded session audio.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Uploads a blob and returns its URL.
    async fn upload(&self, data: Vec<u8>, path: &str) -> Result<String>;
}

/// Supplies the current user identity. No identity means the live session
/// still runs; it just cannot be persisted.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
}
