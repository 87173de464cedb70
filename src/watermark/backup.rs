use super::WatermarkError;
use crate::attachments::{BackupRecord, SharedAttachmentStore, WATERMARKED_FLAG};
use crate::filesystem::{FS_CHMOD_DIR, FS_CHMOD_FILE, SharedFilesystem};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Directory under the uploads root that holds per-attachment backups.
pub const BACKUP_DIR_NAME: &str = "WM_backups";

/// Copies originals aside before they are watermarked and puts them back on
/// request. Backup records live in the attachment metadata.
pub struct BackupManager {
    fs: SharedFilesystem,
    attachments: SharedAttachmentStore,
    uploads_root: PathBuf,
}

impl BackupManager {
    pub fn new(
        fs: SharedFilesystem,
        attachments: SharedAttachmentStore,
        uploads_root: PathBuf,
    ) -> Self {
        Self {
            fs,
            attachments,
            uploads_root,
        }
    }

    pub fn backup_root(&self) -> PathBuf {
        self.uploads_root.join(BACKUP_DIR_NAME)
    }

    pub fn backup_dir(&self, id: u64) -> PathBuf {
        self.backup_root().join(id.to_string())
    }

    /// Copy every path into the attachment's backup directory and record
    /// the copies in its metadata. Nothing is left behind on failure.
    pub fn backup(
        &self,
        id: u64,
        paths: &BTreeMap<String, PathBuf>,
    ) -> Result<BackupRecord, WatermarkError> {
        if paths.is_empty() {
            return Err(WatermarkError::Backup(format!(
                "no files to back up for image {}",
                id
            )));
        }

        let mut metadata = self
            .attachments
            .metadata(id)
            .ok_or(WatermarkError::InvalidAttachment(id))?;
        if metadata.has_backup() {
            warn!("Image {} already has a backup, not overwriting it", id);
            return Err(WatermarkError::AlreadyWatermarked(id));
        }

        let dir = self.backup_dir(id);
        self.ensure_dir(&self.backup_root())?;
        self.ensure_dir(&dir)?;

        let mut record = BackupRecord::new();
        for (size, original) in paths {
            let target = dir.join(sanitize_file_name(&file_name(original)));

            let copied = if self.fs.is_file(original) {
                self.fs.copy(original, &target, true)
            } else {
                Err(crate::filesystem::not_found(original))
            };

            if let Err(e) = copied {
                error!(
                    "Backup of {} size for image {} failed ({:?}): {}",
                    size, id, original, e
                );
                self.remove_copies(&record, &dir);
                return Err(WatermarkError::Backup(format!(
                    "could not copy {} size: {}",
                    size, e
                )));
            }

            if let Err(e) = self.fs.chmod(&target, FS_CHMOD_FILE) {
                warn!("Failed to set permissions on {:?}: {}", target, e);
            }
            record.insert(size.clone(), target);
        }

        metadata.backups = Some(record.clone());
        if !self.attachments.update_metadata(id, metadata) {
            error!("Failed to store backup record for image {}", id);
            self.remove_copies(&record, &dir);
            return Err(WatermarkError::Backup(
                "could not store backup record".to_string(),
            ));
        }

        info!("Backed up {} file(s) for image {}", record.len(), id);
        Ok(record)
    }

    /// Undo a backup whose watermark never reached the live files.
    pub fn discard(&self, id: u64, record: &BackupRecord) {
        if let Some(mut metadata) = self.attachments.metadata(id) {
            metadata.backups = None;
            if !self.attachments.update_metadata(id, metadata) {
                error!("Failed to drop backup record for image {}", id);
                return;
            }
        }
        self.remove_copies(record, &self.backup_dir(id));
    }

    /// Copy every recorded original back over its live path.
    ///
    /// Only a complete restore clears the record, the watermarked flag and
    /// the backup files; otherwise state is kept so the caller can retry.
    pub fn restore(&self, id: u64) -> Result<Vec<String>, WatermarkError> {
        if !self.attachments.exists(id) {
            return Err(WatermarkError::InvalidAttachment(id));
        }
        let mut metadata = self
            .attachments
            .metadata(id)
            .ok_or(WatermarkError::NoBackup(id))?;
        let record = match &metadata.backups {
            Some(record) if !record.is_empty() => record.clone(),
            _ => return Err(WatermarkError::NoBackup(id)),
        };

        let mut restored_sizes = Vec::new();
        let mut failed_sizes = Vec::new();

        for (size, backup_path) in &record {
            match self.restore_size(&metadata, size, backup_path) {
                Ok(()) => restored_sizes.push(size.clone()),
                Err(reason) => {
                    warn!("Restore of {} size for image {} failed: {}", size, id, reason);
                    failed_sizes.push(size.clone());
                }
            }
        }

        if !failed_sizes.is_empty() {
            return Err(WatermarkError::PartialRestore {
                restored_sizes,
                failed_sizes,
            });
        }

        metadata.backups = None;
        if !self.attachments.update_metadata(id, metadata) {
            return Err(WatermarkError::Backup(
                "could not clear backup record".to_string(),
            ));
        }
        self.attachments.delete_flag(id, WATERMARKED_FLAG);
        self.remove_copies(&record, &self.backup_dir(id));

        info!("Restored {} size(s) of image {}", restored_sizes.len(), id);
        Ok(restored_sizes)
    }

    fn restore_size(
        &self,
        metadata: &crate::attachments::AttachmentMetadata,
        size: &str,
        backup_path: &Path,
    ) -> Result<(), String> {
        if !self.fs.is_file(backup_path) {
            return Err(format!("backup file {:?} is missing", backup_path));
        }
        let live = metadata
            .size_path(&self.uploads_root, size)
            .ok_or_else(|| "size no longer exists in metadata".to_string())?;

        if let Some(parent) = live.parent().filter(|p| !self.fs.is_dir(p)) {
            self.fs.mkdir_p(parent).map_err(|e| e.to_string())?;
        }

        self.fs
            .copy(backup_path, &live, true)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.fs.chmod(&live, FS_CHMOD_FILE) {
            warn!("Failed to set permissions on {:?}: {}", live, e);
        }
        Ok(())
    }

    /// Delete everything kept for an attachment, record or not.
    pub fn remove_all(&self, id: u64) {
        let dir = self.backup_dir(id);
        if !self.fs.is_dir(&dir) {
            return;
        }
        match self.fs.dirlist(&dir) {
            Ok(entries) => {
                for entry in entries.iter().filter(|e| e.is_file()) {
                    if let Err(e) = self.fs.delete(&entry.path) {
                        warn!("Failed to delete backup {:?}: {}", entry.path, e);
                    }
                }
            }
            Err(e) => warn!("Failed to list backups in {:?}: {}", dir, e),
        }
        self.remove_dir_if_empty(&dir);
    }

    fn remove_copies(&self, record: &BackupRecord, dir: &Path) {
        for path in record.values() {
            if !self.fs.is_file(path) {
                continue;
            }
            if let Err(e) = self.fs.delete(path) {
                warn!("Failed to delete backup {:?}: {}", path, e);
            }
        }
        self.remove_dir_if_empty(dir);
    }

    fn remove_dir_if_empty(&self, dir: &Path) {
        let empty = self
            .fs
            .dirlist(dir)
            .map(|entries| entries.is_empty())
            .unwrap_or(false);
        if empty {
            match self.fs.rmdir(dir) {
                Ok(()) => debug!("Removed backup directory {:?}", dir),
                Err(e) => warn!("Failed to remove backup directory {:?}: {}", dir, e),
            }
        }
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), WatermarkError> {
        if self.fs.is_dir(dir) {
            return Ok(());
        }
        self.fs.mkdir_p(dir).map_err(|e| {
            WatermarkError::Backup(format!("could not create {}: {}", dir.display(), e))
        })?;
        if let Err(e) = self.fs.chmod(dir, FS_CHMOD_DIR) {
            warn!("Failed to set permissions on {:?}: {}", dir, e);
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reduce a file name to characters that are safe on any filesystem.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let mapped = match c {
            c if c.is_ascii_alphanumeric() => Some(c),
            '.' | '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        };
        if let Some(c) = mapped {
            if c == '-' && out.ends_with('-') {
                continue;
            }
            out.push(c);
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '-' || c == '_');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}
