use super::{Attachment, AttachmentError, AttachmentMetadata, AttachmentSummary, FULL_SIZE};
use crate::filesystem::SharedFilesystem;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info};

/// The media library as seen by the watermark core.
pub trait AttachmentStore: Send + Sync {
    fn exists(&self, id: u64) -> bool;

    fn is_image(&self, id: u64) -> bool;

    fn mime_type(&self, id: u64) -> Option<String>;

    /// Absolute path of the full-size file.
    fn attachment_path(&self, id: u64) -> Option<PathBuf>;

    fn metadata(&self, id: u64) -> Option<AttachmentMetadata>;

    fn update_metadata(&self, id: u64, metadata: AttachmentMetadata) -> bool;

    fn get_flag(&self, id: u64, key: &str) -> Option<String>;

    fn set_flag(&self, id: u64, key: &str, value: &str) -> bool;

    fn delete_flag(&self, id: u64, key: &str) -> bool;

    /// Every image attachment, in upload order.
    fn list_images(&self) -> Vec<AttachmentSummary>;

    /// Public URL of a size; unknown sizes fall back to the full image.
    fn attachment_url(&self, id: u64, size: Option<&str>) -> Option<String>;
}

/// Media library index persisted as a JSON document.
pub struct JsonAttachmentStore {
    fs: SharedFilesystem,
    index_path: PathBuf,
    uploads_root: PathBuf,
    base_url: String,
    attachments: RwLock<BTreeMap<u64, Attachment>>,
}

impl JsonAttachmentStore {
    pub fn load(
        fs: SharedFilesystem,
        index_path: PathBuf,
        uploads_root: PathBuf,
        base_url: String,
    ) -> Result<Self, AttachmentError> {
        let attachments = if fs.is_file(&index_path) {
            let json = fs.get_contents(&index_path)?;
            let list: Vec<Attachment> = serde_json::from_slice(&json)?;
            info!("Loaded {} attachments from {:?}", list.len(), index_path);
            list.into_iter().map(|a| (a.id, a)).collect()
        } else {
            debug!("Attachment index not found at {:?}, starting empty", index_path);
            BTreeMap::new()
        };

        Ok(Self {
            fs,
            index_path,
            uploads_root,
            base_url: base_url.trim_end_matches('/').to_string(),
            attachments: RwLock::new(attachments),
        })
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    pub fn insert(&self, attachment: Attachment) -> Result<(), AttachmentError> {
        let mut attachments = self
            .attachments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if attachments.contains_key(&attachment.id) {
            return Err(AttachmentError::Duplicate(attachment.id));
        }
        attachments.insert(attachment.id, attachment);
        self.persist(&attachments)
    }

    pub fn remove(&self, id: u64) -> Result<Attachment, AttachmentError> {
        let mut attachments = self
            .attachments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = attachments
            .remove(&id)
            .ok_or(AttachmentError::NotFound(id))?;
        self.persist(&attachments)?;
        Ok(removed)
    }

    /// Register a file that already sits under the uploads root.
    pub fn register_file(&self, relative: &str, title: &str) -> Result<u64, AttachmentError> {
        let bytes = self.fs.get_contents(&self.uploads_root.join(relative))?;
        let (width, height) = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_dimensions()
            .unwrap_or((0, 0));

        let id = self.next_id();
        self.insert(Attachment {
            id,
            title: title.to_string(),
            mime_type: mime_guess::from_path(relative)
                .first_or_octet_stream()
                .to_string(),
            uploaded_at: Utc::now(),
            metadata: Some(AttachmentMetadata {
                file: relative.to_string(),
                width,
                height,
                ..Default::default()
            }),
            flags: BTreeMap::new(),
        })?;

        info!("Registered attachment {} for {}", id, relative);
        Ok(id)
    }

    pub fn next_id(&self) -> u64 {
        self.attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1)
    }

    fn persist(&self, attachments: &BTreeMap<u64, Attachment>) -> Result<(), AttachmentError> {
        let list: Vec<&Attachment> = attachments.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;
        self.fs.put_contents(&self.index_path, &json)?;
        Ok(())
    }

    fn mutate<F>(&self, id: u64, f: F) -> bool
    where
        F: FnOnce(&mut Attachment),
    {
        let mut attachments = self
            .attachments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(attachment) = attachments.get(&id).cloned() else {
            return false;
        };

        let mut updated = attachment.clone();
        f(&mut updated);
        attachments.insert(id, updated);

        match self.persist(&attachments) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist attachment {}: {}", id, e);
                attachments.insert(id, attachment);
                false
            }
        }
    }

    fn with_attachment<T>(&self, id: u64, f: impl FnOnce(&Attachment) -> T) -> Option<T> {
        self.attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(f)
    }
}

impl AttachmentStore for JsonAttachmentStore {
    fn exists(&self, id: u64) -> bool {
        self.with_attachment(id, |_| ()).is_some()
    }

    fn is_image(&self, id: u64) -> bool {
        self.with_attachment(id, Attachment::is_image)
            .unwrap_or(false)
    }

    fn mime_type(&self, id: u64) -> Option<String> {
        self.with_attachment(id, |a| a.mime_type.clone())
    }

    fn attachment_path(&self, id: u64) -> Option<PathBuf> {
        self.with_attachment(id, |a| {
            a.metadata
                .as_ref()
                .map(|m| m.full_path(&self.uploads_root))
        })
        .flatten()
    }

    fn metadata(&self, id: u64) -> Option<AttachmentMetadata> {
        self.with_attachment(id, |a| a.metadata.clone()).flatten()
    }

    fn update_metadata(&self, id: u64, metadata: AttachmentMetadata) -> bool {
        self.mutate(id, |a| a.metadata = Some(metadata))
    }

    fn get_flag(&self, id: u64, key: &str) -> Option<String> {
        self.with_attachment(id, |a| a.flags.get(key).cloned())
            .flatten()
    }

    fn set_flag(&self, id: u64, key: &str, value: &str) -> bool {
        self.mutate(id, |a| {
            a.flags.insert(key.to_string(), value.to_string());
        })
    }

    fn delete_flag(&self, id: u64, key: &str) -> bool {
        self.mutate(id, |a| {
            a.flags.remove(key);
        })
    }

    fn list_images(&self) -> Vec<AttachmentSummary> {
        self.attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| a.is_image())
            .map(AttachmentSummary::from)
            .collect()
    }

    fn attachment_url(&self, id: u64, size: Option<&str>) -> Option<String> {
        let metadata = self.metadata(id)?;
        let file = match size.and_then(|s| metadata.sizes.get(s).map(|m| (s, m))) {
            Some((name, size_meta)) if name != FULL_SIZE => match Path::new(&metadata.file).parent()
            {
                Some(dir) if !dir.as_os_str().is_empty() => {
                    format!("{}/{}", dir.to_string_lossy(), size_meta.file)
                }
                _ => size_meta.file.clone(),
            },
            _ => metadata.file.clone(),
        };
        Some(format!("{}/{}", self.base_url, file.replace('\\', "/")))
    }
}
