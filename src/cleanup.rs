use crate::attachments::SharedAttachmentStore;
use crate::filesystem::{EntryKind, SharedFilesystem};
use crate::watermark::BACKUP_DIR_NAME;
use crate::watermark::raster::is_staging_file;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scratch directory inside the uploads root.
pub const TEMP_DIR_NAME: &str = "WM-temp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub temp_files: usize,
    pub staged_files: usize,
    pub backup_dirs: usize,
}

/// Periodic removal of files the watermark core leaves behind.
pub struct CleanupJob {
    fs: SharedFilesystem,
    attachments: SharedAttachmentStore,
    uploads_root: PathBuf,
    temp_expiry: Duration,
    backup_retention: Duration,
}

impl CleanupJob {
    pub fn new(
        fs: SharedFilesystem,
        attachments: SharedAttachmentStore,
        uploads_root: PathBuf,
        temp_expiry: Duration,
        backup_retention: Duration,
    ) -> Self {
        Self {
            fs,
            attachments,
            uploads_root,
            temp_expiry,
            backup_retention,
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.uploads_root.join(TEMP_DIR_NAME)
    }

    pub fn run(&self) -> CleanupReport {
        self.run_at(SystemTime::now())
    }

    pub fn run_at(&self, now: SystemTime) -> CleanupReport {
        let report = CleanupReport {
            temp_files: self.remove_temp_files(now),
            staged_files: self.remove_staged_files(&self.uploads_root, now),
            backup_dirs: self.remove_orphaned_backups(now),
        };
        info!(
            "Cleanup removed {} temp file(s), {} staged file(s), {} orphaned backup dir(s)",
            report.temp_files, report.staged_files, report.backup_dirs
        );
        report
    }

    fn is_older(&self, modified: SystemTime, now: SystemTime, limit: Duration) -> bool {
        now.duration_since(modified)
            .map(|age| age > limit)
            .unwrap_or(false)
    }

    fn remove_temp_files(&self, now: SystemTime) -> usize {
        let dir = self.temp_dir();
        if !self.fs.is_dir(&dir) {
            return 0;
        }
        let entries = match self.fs.dirlist(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list temp directory {:?}: {}", dir, e);
                return 0;
            }
        };

        entries
            .iter()
            .filter(|e| e.is_file() && self.is_older(e.modified, now, self.temp_expiry))
            .filter(|e| self.delete(&e.path))
            .count()
    }

    /// Staged outputs abandoned by an interrupted watermark run.
    fn remove_staged_files(&self, dir: &Path, now: SystemTime) -> usize {
        let Ok(entries) = self.fs.dirlist(dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries {
            match entry.kind {
                EntryKind::Directory if entry.name == BACKUP_DIR_NAME => {}
                EntryKind::Directory => removed += self.remove_staged_files(&entry.path, now),
                EntryKind::File => {
                    if is_staging_file(&entry.name)
                        && self.is_older(entry.modified, now, self.temp_expiry)
                        && self.delete(&entry.path)
                    {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Backup directories no attachment points at any more.
    fn remove_orphaned_backups(&self, now: SystemTime) -> usize {
        let root = self.uploads_root.join(BACKUP_DIR_NAME);
        if !self.fs.is_dir(&root) {
            return 0;
        }
        let Ok(entries) = self.fs.dirlist(&root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.iter().filter(|e| e.kind == EntryKind::Directory) {
            let referenced = entry.name.parse::<u64>().is_ok_and(|id| {
                self.attachments
                    .metadata(id)
                    .is_some_and(|metadata| metadata.has_backup())
            });
            if referenced {
                continue;
            }

            let Ok(files) = self.fs.dirlist(&entry.path) else {
                continue;
            };
            let newest = files
                .iter()
                .map(|f| f.modified)
                .max()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if !self.is_older(newest, now, self.backup_retention) {
                debug!("Keeping recent unreferenced backups in {:?}", entry.path);
                continue;
            }

            for file in files.iter().filter(|f| f.is_file()) {
                self.delete(&file.path);
            }
            match self.fs.rmdir(&entry.path) {
                Ok(()) => {
                    info!("Removed orphaned backup directory {:?}", entry.path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove {:?}: {}", entry.path, e),
            }
        }
        removed
    }

    fn delete(&self, path: &Path) -> bool {
        match self.fs.delete(path) {
            Ok(()) => {
                debug!("Deleted {:?}", path);
                true
            }
            Err(e) => {
                warn!("Failed to delete {:?}: {}", path, e);
                false
            }
        }
    }

    /// Run the job every `interval` until `cancel` fires.
    pub fn start_background(
        job: Arc<CleanupJob>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cleanup job stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        info!("Starting scheduled cleanup");
                        let job = job.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || job.run()).await {
                            error!("Cleanup task failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{
        Attachment, AttachmentMetadata, AttachmentStore, BackupRecord, JsonAttachmentStore,
    };
    use crate::filesystem::{Filesystem, MemoryFilesystem};
    use chrono::Utc;
    use std::collections::BTreeMap;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn fixture() -> (Arc<MemoryFilesystem>, Arc<JsonAttachmentStore>, CleanupJob) {
        let fs = Arc::new(MemoryFilesystem::new());
        fs.mkdir_p(Path::new("/data")).unwrap();
        fs.mkdir_p(Path::new("/up/WM-temp")).unwrap();
        let attachments = Arc::new(
            JsonAttachmentStore::load(
                fs.clone(),
                PathBuf::from("/data/attachments.json"),
                PathBuf::from("/up"),
                "http://localhost/uploads".to_string(),
            )
            .unwrap(),
        );
        let job = CleanupJob::new(
            fs.clone(),
            attachments.clone(),
            PathBuf::from("/up"),
            DAY,
            30 * DAY,
        );
        (fs, attachments, job)
    }

    fn aged(fs: &MemoryFilesystem, path: &str, age: Duration) {
        fs.insert_file(path, b"x".to_vec());
        fs.set_modified(path, SystemTime::now() - age);
    }

    #[test]
    fn test_removes_only_expired_temp_files() {
        let (fs, _, job) = fixture();
        aged(&fs, "/up/WM-temp/old.png", 2 * DAY);
        aged(&fs, "/up/WM-temp/new.png", Duration::from_secs(60));

        let report = job.run();

        assert_eq!(report.temp_files, 1);
        assert!(!fs.exists(Path::new("/up/WM-temp/old.png")));
        assert!(fs.exists(Path::new("/up/WM-temp/new.png")));
    }

    #[test]
    fn test_removes_abandoned_staged_files() {
        let (fs, _, job) = fixture();
        aged(&fs, "/up/2024/.photo.jpg.wm-staged-abc", 2 * DAY);
        aged(&fs, "/up/2024/.photo.jpg.wm-staged-def", Duration::from_secs(5));
        aged(&fs, "/up/2024/photo.jpg", 400 * DAY);

        let report = job.run();

        assert_eq!(report.staged_files, 1);
        assert!(fs.exists(Path::new("/up/2024/.photo.jpg.wm-staged-def")));
        assert!(fs.exists(Path::new("/up/2024/photo.jpg")));
    }

    #[test]
    fn test_orphaned_backups_removed_after_retention() {
        let (fs, attachments, job) = fixture();
        let mut record = BackupRecord::new();
        record.insert("full".to_string(), PathBuf::from("/up/WM_backups/1/a.jpg"));
        attachments
            .insert(Attachment {
                id: 1,
                title: "Kept".to_string(),
                mime_type: "image/jpeg".to_string(),
                uploaded_at: Utc::now(),
                metadata: Some(AttachmentMetadata {
                    file: "a.jpg".to_string(),
                    backups: Some(record),
                    ..Default::default()
                }),
                flags: BTreeMap::new(),
            })
            .unwrap();

        aged(&fs, "/up/WM_backups/1/a.jpg", 90 * DAY);
        aged(&fs, "/up/WM_backups/2/b.jpg", 90 * DAY);
        aged(&fs, "/up/WM_backups/3/c.jpg", 2 * DAY);

        let report = job.run();

        assert_eq!(report.backup_dirs, 1);
        assert!(fs.exists(Path::new("/up/WM_backups/1/a.jpg")));
        assert!(!fs.exists(Path::new("/up/WM_backups/2")));
        assert!(fs.exists(Path::new("/up/WM_backups/3/c.jpg")));
        assert!(attachments.metadata(1).unwrap().has_backup());
    }

    #[test]
    fn test_missing_directories_are_fine() {
        let fs = Arc::new(MemoryFilesystem::new());
        fs.mkdir_p(Path::new("/data")).unwrap();
        let attachments = Arc::new(
            JsonAttachmentStore::load(
                fs.clone(),
                PathBuf::from("/data/attachments.json"),
                PathBuf::from("/nowhere"),
                "http://localhost/uploads".to_string(),
            )
            .unwrap(),
        );
        let job = CleanupJob::new(fs, attachments, PathBuf::from("/nowhere"), DAY, DAY);
        assert_eq!(job.run(), CleanupReport::default());
    }

    #[tokio::test]
    async fn test_background_job_stops_on_cancel() {
        let (_, _, job) = fixture();
        let cancel = CancellationToken::new();
        let handle =
            CleanupJob::start_background(Arc::new(job), Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
