use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Size name of the original upload in metadata and backup records.
pub const FULL_SIZE: &str = "full";

/// Attachment flag set while an image carries a watermark.
pub const WATERMARKED_FLAG: &str = "_WM_watermarked";

/// Backup record: size name to the backed-up original file.
pub type BackupRecord = BTreeMap<String, PathBuf>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeMetadata {
    pub file: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(rename = "mime-type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    /// Full-size file, relative to the uploads root.
    pub file: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Derived sizes, stored next to the full-size file.
    #[serde(default)]
    pub sizes: BTreeMap<String, SizeMetadata>,
    #[serde(rename = "WM_backups", default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<BackupRecord>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AttachmentMetadata {
    pub fn full_path(&self, uploads_root: &Path) -> PathBuf {
        uploads_root.join(&self.file)
    }

    /// Directory holding the full-size file and its derived sizes.
    pub fn base_dir(&self, uploads_root: &Path) -> PathBuf {
        self.full_path(uploads_root)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| uploads_root.to_path_buf())
    }

    /// Live path of a named size, `full` included.
    pub fn size_path(&self, uploads_root: &Path, size: &str) -> Option<PathBuf> {
        if size == FULL_SIZE {
            return Some(self.full_path(uploads_root));
        }
        self.sizes
            .get(size)
            .map(|s| self.base_dir(uploads_root).join(&s.file))
    }

    pub fn has_backup(&self) -> bool {
        self.backups.as_ref().is_some_and(|b| !b.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub title: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<AttachmentMetadata>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentSummary {
    pub id: u64,
    pub title: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&Attachment> for AttachmentSummary {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id,
            title: attachment.title.clone(),
            mime_type: attachment.mime_type.clone(),
            uploaded_at: attachment.uploaded_at,
        }
    }
}
