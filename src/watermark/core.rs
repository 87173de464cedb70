use super::backup::BackupManager;
use super::compositor::composite;
use super::raster::{self, RasterFormat};
use super::resolver::{ResolverConfig, WatermarkPathResolver};
use super::{
    BulkResult, LibraryImage, Preview, PreviewSource, WatermarkConfig, WatermarkError,
    WatermarkOptions, WatermarkedImage,
};
use crate::attachments::{
    AttachmentMetadata, FULL_SIZE, SharedAttachmentStore, WATERMARKED_FLAG,
};
use crate::filesystem::SharedFilesystem;
use crate::settings::WatermarkSettings;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Size of the blank canvas used when no preview image is available.
pub const BLANK_PREVIEW_SIZE: (u32, u32) = (800, 600);

/// Mime types watermarked automatically on upload.
const AUTO_WATERMARK_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

const FLAG_WRITE_ATTEMPTS: usize = 2;

/// Applies and removes watermarks on media library images.
///
/// All methods block on file I/O and image work; async callers should run
/// them on the blocking pool.
pub struct WatermarkService {
    fs: SharedFilesystem,
    attachments: SharedAttachmentStore,
    resolver: WatermarkPathResolver,
    backups: BackupManager,
    uploads_root: PathBuf,
    busy: Mutex<HashSet<u64>>,
}

/// Marks an attachment as in use until dropped.
pub(crate) struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<u64>>,
    id: u64,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A composited size written next to its live file, waiting to replace it.
struct StagedSize {
    size: String,
    live: PathBuf,
    staged: PathBuf,
}

impl WatermarkService {
    pub fn new(
        fs: SharedFilesystem,
        attachments: SharedAttachmentStore,
        resolver_config: ResolverConfig,
    ) -> Self {
        let uploads_root = resolver_config.uploads_root.clone();
        Self {
            resolver: WatermarkPathResolver::new(fs.clone(), attachments.clone(), resolver_config),
            backups: BackupManager::new(fs.clone(), attachments.clone(), uploads_root.clone()),
            uploads_root,
            fs,
            attachments,
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn resolver(&self) -> &WatermarkPathResolver {
        &self.resolver
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn attachments(&self) -> &SharedAttachmentStore {
        &self.attachments
    }

    pub(crate) fn acquire(&self, id: u64) -> Result<BusyGuard<'_>, WatermarkError> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(id) {
            return Err(WatermarkError::Busy(id));
        }
        Ok(BusyGuard {
            busy: &self.busy,
            id,
        })
    }

    /// An image with a backup record counts as watermarked even when the
    /// flag is missing, so its originals stay restorable.
    pub fn is_watermarked(&self, id: u64) -> bool {
        self.attachments.get_flag(id, WATERMARKED_FLAG).as_deref() == Some("1")
            || self
                .attachments
                .metadata(id)
                .is_some_and(|metadata| metadata.has_backup())
    }

    /// Watermark the full size and every derived size of an image.
    ///
    /// Originals are backed up first. Every size is composited to a staged
    /// file before any live file is replaced, so a failing size leaves the
    /// image untouched. Returns the sizes that were watermarked.
    pub fn apply_watermark(
        &self,
        id: u64,
        options: &WatermarkOptions,
    ) -> Result<Vec<String>, WatermarkError> {
        let config = options.validate()?;
        self.apply_config(id, &config)
    }

    pub fn apply_config(
        &self,
        id: u64,
        config: &WatermarkConfig,
    ) -> Result<Vec<String>, WatermarkError> {
        if !self.attachments.is_image(id) {
            return Err(WatermarkError::InvalidAttachment(id));
        }
        let _guard = self.acquire(id)?;

        if self.is_watermarked(id) {
            return Err(WatermarkError::AlreadyWatermarked(id));
        }

        let metadata = self
            .attachments
            .metadata(id)
            .ok_or(WatermarkError::InvalidAttachment(id))?;
        let sizes = self.live_sizes(&metadata)?;

        let watermark_path = self.resolver.resolve(&config.source)?;
        let watermark = raster::load(self.fs.as_ref(), &watermark_path)?.image;

        let paths: BTreeMap<String, PathBuf> = sizes.iter().cloned().collect();
        let record = self.backups.backup(id, &paths)?;

        let mut staged = Vec::with_capacity(sizes.len());
        for (size, live) in sizes {
            match self.stage_size(&live, &watermark, config) {
                Ok(path) => staged.push(StagedSize {
                    size,
                    live,
                    staged: path,
                }),
                Err(e) => {
                    error!("Failed to watermark {} size of image {}: {}", size, id, e);
                    self.discard_staged(&staged);
                    self.backups.discard(id, &record);
                    return Err(e);
                }
            }
        }

        let mut committed = Vec::with_capacity(staged.len());
        for (index, entry) in staged.iter().enumerate() {
            if let Err(source) = raster::commit(self.fs.as_ref(), &entry.staged, &entry.live) {
                error!(
                    "Failed to move watermarked {} size of image {} into place: {}",
                    entry.size, id, source
                );
                self.discard_staged(&staged[index..]);
                if committed.is_empty() {
                    self.backups.discard(id, &record);
                } else {
                    // Some live files changed; keep the backup restorable
                    self.store_flag(id);
                }
                return Err(WatermarkError::Commit {
                    size: entry.size.clone(),
                    source,
                });
            }
            committed.push(entry.size.clone());
        }

        if !self.store_flag(id) {
            // The backup record stays, which keeps the image restorable
            error!("Failed to flag image {} as watermarked", id);
            return Err(WatermarkError::IoError(std::io::Error::other(
                "could not store watermarked flag",
            )));
        }

        info!("Watermarked {} size(s) of image {}", committed.len(), id);
        Ok(committed)
    }

    fn store_flag(&self, id: u64) -> bool {
        (0..FLAG_WRITE_ATTEMPTS).any(|attempt| {
            if attempt > 0 {
                warn!("Retrying watermarked flag for image {}", id);
            }
            self.attachments.set_flag(id, WATERMARKED_FLAG, "1")
        })
    }

    /// Full size first, then every derived size whose file exists.
    fn live_sizes(
        &self,
        metadata: &AttachmentMetadata,
    ) -> Result<Vec<(String, PathBuf)>, WatermarkError> {
        let full = metadata.full_path(&self.uploads_root);
        if !self.fs.is_file(&full) {
            return Err(WatermarkError::IoError(crate::filesystem::not_found(&full)));
        }

        let mut sizes = vec![(FULL_SIZE.to_string(), full)];
        for name in metadata.sizes.keys() {
            if name == FULL_SIZE {
                continue;
            }
            match metadata.size_path(&self.uploads_root, name) {
                Some(path) if self.fs.is_file(&path) => sizes.push((name.clone(), path)),
                Some(path) => debug!("Skipping missing {} size at {:?}", name, path),
                None => {}
            }
        }
        Ok(sizes)
    }

    fn stage_size(
        &self,
        live: &std::path::Path,
        watermark: &DynamicImage,
        config: &WatermarkConfig,
    ) -> Result<PathBuf, WatermarkError> {
        let source = raster::load(self.fs.as_ref(), live)?;
        let output = composite(&source.image, watermark, config)?;
        raster::write_staged(self.fs.as_ref(), &output, source.format, live)
    }

    fn discard_staged(&self, staged: &[StagedSize]) {
        let paths: Vec<PathBuf> = staged.iter().map(|s| s.staged.clone()).collect();
        raster::discard(self.fs.as_ref(), &paths);
    }

    /// Watermark each id independently; one failure never stops the rest.
    pub fn bulk_watermark(
        &self,
        ids: &[u64],
        options: &WatermarkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, WatermarkError> {
        let mut result = BulkResult::default();
        if options.is_empty() {
            result.failed = ids.len();
            result.errors.push("No watermark options provided".to_string());
            return Ok(result);
        }
        let config = options.validate()?;

        for (index, &id) in ids.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    "Bulk watermark cancelled after {} of {} images",
                    index,
                    ids.len()
                );
                result.cancelled = true;
                break;
            }

            if !self.attachments.is_image(id) {
                result.failed += 1;
                result.errors.push(format!("ID {} is not a valid image", id));
                continue;
            }

            match self.apply_config(id, &config) {
                Ok(_) => result.success += 1,
                Err(WatermarkError::AlreadyWatermarked(_)) => {
                    result.failed += 1;
                    result
                        .errors
                        .push(format!("Image {} is already watermarked", id));
                }
                Err(e) => {
                    result.failed += 1;
                    result
                        .errors
                        .push(format!("Failed to watermark image {}: {}", id, e));
                }
            }
        }

        info!(
            "Bulk watermark completed. Success: {}, Failed: {}",
            result.success, result.failed
        );
        Ok(result)
    }

    /// Watermark every image that does not carry the watermarked flag yet.
    pub fn watermark_all_images(
        &self,
        options: &WatermarkOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkResult, WatermarkError> {
        let ids: Vec<u64> = self
            .attachments
            .list_images()
            .into_iter()
            .map(|image| image.id)
            .filter(|&id| !self.is_watermarked(id))
            .collect();
        info!("Watermarking {} unwatermarked images", ids.len());
        self.bulk_watermark(&ids, options, cancel)
    }

    /// Put the originals back; see [`BackupManager::restore`].
    pub fn restore_original(&self, id: u64) -> Result<Vec<String>, WatermarkError> {
        let _guard = self.acquire(id)?;
        self.backups.restore(id)
    }

    pub fn get_watermarked_images(&self) -> Vec<WatermarkedImage> {
        self.attachments
            .list_images()
            .into_iter()
            .filter(|image| self.is_watermarked(image.id))
            .map(|image| {
                let metadata = self.attachments.metadata(image.id);
                WatermarkedImage {
                    id: image.id,
                    thumbnail: self.url(image.id, "thumbnail"),
                    full: self.url(image.id, FULL_SIZE),
                    has_backup: metadata.as_ref().is_some_and(|m| m.has_backup()),
                    sizes: metadata
                        .map(|m| m.sizes.keys().cloned().collect())
                        .unwrap_or_default(),
                    title: image.title,
                }
            })
            .collect()
    }

    pub fn get_unwatermarked_images(&self) -> Vec<LibraryImage> {
        self.attachments
            .list_images()
            .into_iter()
            .filter(|image| !self.is_watermarked(image.id))
            .map(|image| LibraryImage {
                id: image.id,
                thumbnail: self.url(image.id, "thumbnail"),
                full: self.url(image.id, FULL_SIZE),
                title: image.title,
            })
            .collect()
    }

    fn url(&self, id: u64, size: &str) -> String {
        self.attachments
            .attachment_url(id, Some(size))
            .unwrap_or_default()
    }

    /// Composite onto a throwaway image and return it as a PNG data URL.
    ///
    /// The base image is the first usable of: the uploaded bytes, the given
    /// attachment, the most recent library image, a blank white canvas.
    pub fn generate_preview(
        &self,
        options: &WatermarkOptions,
        image_data: Option<&[u8]>,
        preview_id: Option<u64>,
    ) -> Result<Preview, WatermarkError> {
        let config = options.validate()?;
        let (base, source) = self.preview_base(image_data, preview_id);

        let watermark_path = self.resolver.resolve(&config.source)?;
        let watermark = raster::load(self.fs.as_ref(), &watermark_path)?.image;

        let output = composite(&base, &watermark, &config)?;
        let png = raster::encode(&output, RasterFormat::Png)?;

        debug!("Generated {}x{} preview from {:?}", output.width(), output.height(), source);
        Ok(Preview {
            data_url: format!("data:image/png;base64,{}", STANDARD.encode(png)),
            width: output.width(),
            height: output.height(),
            source,
        })
    }

    fn preview_base(
        &self,
        image_data: Option<&[u8]>,
        preview_id: Option<u64>,
    ) -> (DynamicImage, PreviewSource) {
        if let Some(bytes) = image_data {
            match raster::decode(bytes) {
                Ok(raster) => return (raster.image, PreviewSource::Upload),
                Err(e) => debug!("Uploaded preview image unusable: {}", e),
            }
        }

        if let Some(id) = preview_id.filter(|&id| id > 0) {
            if let Some(image) = self.load_attachment_image(id) {
                return (image, PreviewSource::Attachment(id));
            }
        }

        let latest = self
            .attachments
            .list_images()
            .into_iter()
            .max_by_key(|image| (image.uploaded_at, image.id));
        if let Some(latest) = latest {
            if let Some(image) = self.load_attachment_image(latest.id) {
                return (image, PreviewSource::Library(latest.id));
            }
        }

        let (width, height) = BLANK_PREVIEW_SIZE;
        (
            DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))),
            PreviewSource::Blank,
        )
    }

    fn load_attachment_image(&self, id: u64) -> Option<DynamicImage> {
        let path = self.attachments.attachment_path(id)?;
        match raster::load(self.fs.as_ref(), &path) {
            Ok(raster) => Some(raster.image),
            Err(e) => {
                debug!("Cannot use image {} for preview: {}", id, e);
                None
            }
        }
    }

    /// Watermark a new upload when automatic watermarking is enabled.
    /// Returns whether a watermark was applied.
    pub fn process_upload(
        &self,
        id: u64,
        settings: &WatermarkSettings,
    ) -> Result<bool, WatermarkError> {
        if !settings.auto_watermark {
            return Ok(false);
        }
        let Some(mime) = self.attachments.mime_type(id) else {
            return Err(WatermarkError::InvalidAttachment(id));
        };
        if !AUTO_WATERMARK_TYPES.contains(&mime.as_str()) {
            debug!("Not auto-watermarking image {} of type {}", id, mime);
            return Ok(false);
        }

        self.apply_watermark(id, &settings.to_options())?;
        Ok(true)
    }

    /// Forget everything kept for an attachment that is being deleted.
    pub fn cleanup(&self, id: u64) {
        self.forget_resolutions(id);
        self.attachments.delete_flag(id, WATERMARKED_FLAG);
        if let Some(mut metadata) = self.attachments.metadata(id) {
            if metadata.backups.take().is_some() {
                self.attachments.update_metadata(id, metadata);
            }
        }
        self.backups.remove_all(id);
        debug!("Cleaned up watermark data for image {}", id);
    }

    /// Drop cached watermark lookups that refer to this attachment's files.
    fn forget_resolutions(&self, id: u64) {
        let Some(metadata) = self.attachments.metadata(id) else {
            return;
        };

        let mut paths = vec![metadata.full_path(&self.uploads_root)];
        paths.extend(
            metadata
                .sizes
                .keys()
                .filter_map(|name| metadata.size_path(&self.uploads_root, name)),
        );

        let mut identifiers = vec![id.to_string()];
        identifiers.extend(self.attachments.attachment_url(id, None));
        for identifier in &identifiers {
            self.resolver.invalidate(identifier);
        }

        let dropped = self.resolver.invalidate_paths(&paths);
        if dropped > 0 {
            debug!("Forgot {} cached watermark path(s) for image {}", dropped, id);
        }
    }
}
