use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("upload failed: {0}")]
    Upload(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
