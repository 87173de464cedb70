use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Settings validation failed")]
    Invalid(Vec<String>),

    #[error("Failed to update settings in storage")]
    UpdateFailed,
}
