use serde::Serialize;

/// Outcome of a bulk or watermark-all run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkResult {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl BulkResult {
    pub fn summary(&self) -> String {
        format!(
            "Bulk watermarking completed. {} images watermarked successfully, {} failed.",
            self.success, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatermarkedImage {
    pub id: u64,
    pub title: String,
    pub thumbnail: String,
    pub full: String,
    pub has_backup: bool,
    pub sizes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryImage {
    pub id: u64,
    pub title: String,
    pub thumbnail: String,
    pub full: String,
}

/// Where the base image of a preview came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewSource {
    Upload,
    Attachment(u64),
    Library(u64),
    Blank,
}

impl PreviewSource {
    pub fn attachment_id(&self) -> Option<u64> {
        match self {
            PreviewSource::Attachment(id) | PreviewSource::Library(id) => Some(*id),
            PreviewSource::Upload | PreviewSource::Blank => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    /// `data:image/png;base64,...`
    pub data_url: String,
    pub width: u32,
    pub height: u32,
    pub source: PreviewSource,
}
