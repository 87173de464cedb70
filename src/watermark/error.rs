use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("Missing required watermark options: {}", .0.join(", "))]
    MissingOptions(Vec<&'static str>),

    #[error("Invalid {field}: {message}")]
    InvalidOption {
        field: &'static str,
        message: String,
    },

    #[error("Watermark image not found: {0}")]
    WatermarkNotFound(String),

    #[error("Unsupported image format")]
    UnsupportedFormat,

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Compositing failed while trying to {stage}: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("No backup found for image {0}")]
    NoBackup(u64),

    #[error("Some image sizes failed to restore")]
    PartialRestore {
        restored_sizes: Vec<String>,
        failed_sizes: Vec<String>,
    },

    #[error("Invalid attachment ID {0}")]
    InvalidAttachment(u64),

    #[error("Image {0} is already watermarked")]
    AlreadyWatermarked(u64),

    #[error("Image {0} is already being processed")]
    Busy(u64),

    #[error("Failed to write watermarked {size} image: {source}")]
    Commit {
        size: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WatermarkError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WatermarkError::MissingOptions(_) => "invalid_watermark_options",
            WatermarkError::InvalidOption { field, .. } => match *field {
                "position" => "invalid_position",
                "opacity" => "invalid_opacity",
                "size" => "invalid_size",
                "rotation" => "invalid_rotation",
                _ => "invalid_watermark_options",
            },
            WatermarkError::WatermarkNotFound(_) => "watermark_not_found",
            WatermarkError::UnsupportedFormat => "unsupported_format",
            WatermarkError::ImageError(_) => "image_error",
            WatermarkError::Stage { .. } => "compositing_failed",
            WatermarkError::Backup(_) => "backup_failed",
            WatermarkError::NoBackup(_) => "no_backup",
            WatermarkError::PartialRestore { .. } => "restore_partial_failure",
            WatermarkError::InvalidAttachment(_) => "invalid_attachment",
            WatermarkError::AlreadyWatermarked(_) => "already_watermarked",
            WatermarkError::Busy(_) => "busy",
            WatermarkError::Commit { .. } => "commit_failed",
            WatermarkError::IoError(_) => "io_error",
        }
    }

    /// Errors raised before any file was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WatermarkError::MissingOptions(_) | WatermarkError::InvalidOption { .. }
        )
    }
}
