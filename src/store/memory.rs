use crate::store::error::{Result, StoreError};
use crate::store::traits::{AuthProvider, MediaStore, SessionStore};
use crate::types::{SessionRecord, SessionSummary};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

struct StoredSession {
    user_id: String,
    record: SessionRecord,
    report_requested: bool,
}

/// In-memory session store, used by tests and as a default backend.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full stored record, for inspection beyond the summary view.
    pub fn record(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions
            .read()
            .expect("store lock poisoned")
            .get(session_id)
            .map(|s| s.record.clone())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, user_id: &str, record: &SessionRecord) -> Result<String> {
        let mut sessions = self.sessions.write().expect("store lock poisoned");
        sessions.insert(
            record.id.clone(),
            StoredSession {
                user_id: user_id.to_string(),
                record: record.clone(),
                report_requested: false,
            },
        );
        Ok(record.id.clone())
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.read().expect("store lock poisoned");
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| SessionSummary {
                id: s.record.id.clone(),
                started_at: s.record.started_at,
                duration_seconds: s.record.duration_seconds,
                report_requested: s.report_requested,
            })
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    async fn request_report(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("store lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.report_requested = true;
        Ok(())
    }
}

/// In-memory object storage; uploads are addressable by path.
#[derive(Default)]
pub struct MemoryMediaStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .expect("media lock poisoned")
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn upload(&self, data: Vec<u8>, path: &str) -> Result<String> {
        let mut blobs = self.blobs.write().expect("media lock poisoned");
        blobs.insert(path.to_string(), data);
        Ok(format!("memory://{path}"))
    }
}

/// Fixed identity provider.
pub struct StaticAuth {
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self { user_id: None }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<String> {
        self.user_id.clone()
    }
}
