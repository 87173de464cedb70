use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Attachment {0} already exists")]
    Duplicate(u64),

    #[error("Attachment not found: {0}")]
    NotFound(u64),
}
