use crate::attachments::{
    Attachment, AttachmentMetadata, AttachmentStore, AttachmentSummary, JsonAttachmentStore,
    SizeMetadata, WATERMARKED_FLAG,
};
use crate::filesystem::{Filesystem, MemoryFilesystem};
use crate::settings::WatermarkSettings;
use crate::watermark::raster::{self, RasterFormat, STAGING_MARKER};
use crate::watermark::{
    BLANK_PREVIEW_SIZE, PreviewSource, ResolverConfig, WatermarkError, WatermarkOptions,
    WatermarkService, WatermarkSource,
};
use chrono::{Duration, Utc};
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

const WATERMARK: &str = "/wm/logo.png";

struct Fixture {
    fs: Arc<MemoryFilesystem>,
    attachments: Arc<JsonAttachmentStore>,
    service: WatermarkService,
}

/// Library whose flag writes fail a set number of times.
struct FlakyFlagStore {
    inner: Arc<JsonAttachmentStore>,
    flag_failures: AtomicUsize,
}

impl AttachmentStore for FlakyFlagStore {
    fn exists(&self, id: u64) -> bool {
        self.inner.exists(id)
    }

    fn is_image(&self, id: u64) -> bool {
        self.inner.is_image(id)
    }

    fn mime_type(&self, id: u64) -> Option<String> {
        self.inner.mime_type(id)
    }

    fn attachment_path(&self, id: u64) -> Option<PathBuf> {
        self.inner.attachment_path(id)
    }

    fn metadata(&self, id: u64) -> Option<AttachmentMetadata> {
        self.inner.metadata(id)
    }

    fn update_metadata(&self, id: u64, metadata: AttachmentMetadata) -> bool {
        self.inner.update_metadata(id, metadata)
    }

    fn get_flag(&self, id: u64, key: &str) -> Option<String> {
        self.inner.get_flag(id, key)
    }

    fn set_flag(&self, id: u64, key: &str, value: &str) -> bool {
        let failing = self
            .flag_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !failing && self.inner.set_flag(id, key, value)
    }

    fn delete_flag(&self, id: u64, key: &str) -> bool {
        self.inner.delete_flag(id, key)
    }

    fn list_images(&self) -> Vec<AttachmentSummary> {
        self.inner.list_images()
    }

    fn attachment_url(&self, id: u64, size: Option<&str>) -> Option<String> {
        self.inner.attachment_url(id, size)
    }
}

fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
    raster::encode(&image, RasterFormat::Png).unwrap()
}

fn fixture() -> Fixture {
    let fs = Arc::new(MemoryFilesystem::new());
    fs.mkdir_p(Path::new("/data")).unwrap();
    fs.mkdir_p(Path::new("/up")).unwrap();

    let mark = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 20, Rgba([255, 0, 0, 255])));
    fs.insert_file(WATERMARK, raster::encode(&mark, RasterFormat::Png).unwrap());

    let attachments = Arc::new(
        JsonAttachmentStore::load(
            fs.clone(),
            PathBuf::from("/data/attachments.json"),
            PathBuf::from("/up"),
            "http://localhost/uploads".to_string(),
        )
        .unwrap(),
    );
    let service = WatermarkService::new(fs.clone(), attachments.clone(), resolver_config());
    Fixture {
        fs,
        attachments,
        service,
    }
}

fn resolver_config() -> ResolverConfig {
    ResolverConfig {
        uploads_root: PathBuf::from("/up"),
        site_root: PathBuf::from("/site"),
        site_url: Some("http://localhost".to_string()),
        uploads_url_path: "/uploads".to_string(),
    }
}

/// The same library behind a store that fails the next `failures` flag writes.
fn flaky_flag_fixture(failures: usize) -> Fixture {
    let mut f = fixture();
    let store = Arc::new(FlakyFlagStore {
        inner: f.attachments.clone(),
        flag_failures: AtomicUsize::new(failures),
    });
    f.service = WatermarkService::new(f.fs.clone(), store, resolver_config());
    f
}

impl Fixture {
    /// A PNG photo with a thumbnail and a medium size whose file is missing.
    fn add_photo(&self, id: u64) {
        let stem = format!("2024/photo-{}", id);
        self.fs
            .insert_file(format!("/up/{}.png", stem), png(200, 100, [0, 0, 255]));
        self.fs
            .insert_file(format!("/up/{}-50x25.png", stem), png(50, 25, [0, 0, 255]));

        let mut sizes = BTreeMap::new();
        sizes.insert(
            "thumbnail".to_string(),
            SizeMetadata {
                file: format!("photo-{}-50x25.png", id),
                width: 50,
                height: 25,
                mime_type: Some("image/png".to_string()),
            },
        );
        sizes.insert(
            "medium".to_string(),
            SizeMetadata {
                file: format!("photo-{}-100x50.png", id),
                width: 100,
                height: 50,
                mime_type: Some("image/png".to_string()),
            },
        );
        self.attachments
            .insert(Attachment {
                id,
                title: format!("Photo {}", id),
                mime_type: "image/png".to_string(),
                uploaded_at: Utc::now() + Duration::seconds(id as i64),
                metadata: Some(AttachmentMetadata {
                    file: format!("{}.png", stem),
                    width: 200,
                    height: 100,
                    sizes,
                    ..Default::default()
                }),
                flags: BTreeMap::new(),
            })
            .unwrap();
    }

    fn full(&self, id: u64) -> PathBuf {
        PathBuf::from(format!("/up/2024/photo-{}.png", id))
    }

    fn thumb(&self, id: u64) -> PathBuf {
        PathBuf::from(format!("/up/2024/photo-{}-50x25.png", id))
    }

    fn read(&self, path: &Path) -> Vec<u8> {
        self.fs.get_contents(path).unwrap()
    }

    /// Contents of every file under the uploads root.
    fn uploads(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        self.fs
            .snapshot()
            .into_iter()
            .filter(|(path, _)| path.starts_with("/up"))
            .map(|(path, (data, _))| (path, data))
            .collect()
    }

    fn staged_files(&self) -> usize {
        self.fs
            .snapshot()
            .keys()
            .filter(|path| path.to_string_lossy().contains(STAGING_MARKER))
            .count()
    }
}

fn options() -> WatermarkOptions {
    WatermarkOptions {
        watermark_image: Some(WatermarkSource::Location(WATERMARK.to_string())),
        position: Some("bottom-right".to_string()),
        opacity: Some(100),
        size: Some(20),
        rotation: Some(0),
    }
}

#[test]
fn test_invalid_options_touch_nothing() {
    let f = fixture();
    f.add_photo(5);
    let before = f.fs.snapshot();

    let mut bad = options();
    bad.opacity = Some(150);
    let err = f.service.apply_watermark(5, &bad).unwrap_err();
    assert_eq!(err.code(), "invalid_opacity");

    let err = f
        .service
        .apply_watermark(5, &WatermarkOptions::default())
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(f.fs.snapshot(), before);
}

#[test]
fn test_apply_watermarks_existing_sizes() {
    let f = fixture();
    f.add_photo(5);
    let original = f.read(&f.full(5));

    let sizes = f.service.apply_watermark(5, &options()).unwrap();

    assert_eq!(sizes, vec!["full", "thumbnail"]);
    assert_ne!(f.read(&f.full(5)), original);
    assert!(f.service.is_watermarked(5));
    assert_eq!(
        f.attachments.get_flag(5, WATERMARKED_FLAG).as_deref(),
        Some("1")
    );

    let record = f.attachments.metadata(5).unwrap().backups.unwrap();
    assert_eq!(record.len(), 2);
    assert_eq!(f.read(&record["full"]), original);
    assert_eq!(f.staged_files(), 0);

    // Output keeps the source dimensions; the watermark sits bottom-right
    let output = raster::load(f.fs.as_ref(), &f.full(5)).unwrap();
    assert_eq!(output.dimensions(), (200, 100));
    let rgb = output.image.to_rgb8();
    let Rgb([r, g, b]) = *rgb.get_pixel(180, 85);
    assert!(r > 250 && g < 5 && b < 5, "expected red, got {:?}", (r, g, b));
    assert_eq!(rgb.get_pixel(5, 5), &Rgb([0, 0, 255]));
}

#[test]
fn test_restore_round_trip_is_byte_identical() {
    let f = fixture();
    f.add_photo(5);
    let before = f.uploads();

    f.service.apply_watermark(5, &options()).unwrap();
    let restored = f.service.restore_original(5).unwrap();

    assert_eq!(restored, vec!["full", "thumbnail"]);
    assert_eq!(f.uploads(), before);
    assert!(!f.service.is_watermarked(5));
    assert!(!f.attachments.metadata(5).unwrap().has_backup());
    assert!(!f.fs.exists(&f.service.backups().backup_dir(5)));

    // Nothing left to restore
    let err = f.service.restore_original(5).unwrap_err();
    assert!(matches!(err, WatermarkError::NoBackup(5)));
}

#[test]
fn test_partial_restore_keeps_state_for_retry() {
    let f = fixture();
    f.add_photo(5);
    let original_thumb = f.read(&f.thumb(5));
    f.service.apply_watermark(5, &options()).unwrap();

    f.fs.fail_copies_to(f.thumb(5));
    match f.service.restore_original(5) {
        Err(WatermarkError::PartialRestore {
            restored_sizes,
            failed_sizes,
        }) => {
            assert_eq!(restored_sizes, vec!["full"]);
            assert_eq!(failed_sizes, vec!["thumbnail"]);
        }
        other => panic!("expected partial restore, got {:?}", other),
    }
    assert!(f.service.is_watermarked(5));
    assert!(f.attachments.metadata(5).unwrap().has_backup());

    f.fs.clear_faults();
    f.service.restore_original(5).unwrap();
    assert_eq!(f.read(&f.thumb(5)), original_thumb);
    assert!(!f.service.is_watermarked(5));
}

#[test]
fn test_second_apply_rejected_and_backup_preserved() {
    let f = fixture();
    f.add_photo(5);
    let original = f.read(&f.full(5));
    f.service.apply_watermark(5, &options()).unwrap();
    let watermarked = f.read(&f.full(5));

    let err = f.service.apply_watermark(5, &options()).unwrap_err();
    assert!(matches!(err, WatermarkError::AlreadyWatermarked(5)));

    let record = f.attachments.metadata(5).unwrap().backups.unwrap();
    assert_eq!(f.read(&record["full"]), original);
    assert_eq!(f.read(&f.full(5)), watermarked);
}

#[test]
fn test_lost_flag_keeps_originals_restorable() {
    let f = flaky_flag_fixture(2);
    f.add_photo(5);
    let original = f.read(&f.full(5));
    let original_thumb = f.read(&f.thumb(5));

    let err = f.service.apply_watermark(5, &options()).unwrap_err();
    assert_eq!(err.code(), "io_error");
    assert_eq!(f.attachments.get_flag(5, WATERMARKED_FLAG), None);
    assert!(f.attachments.metadata(5).unwrap().has_backup());
    assert_ne!(f.read(&f.full(5)), original);

    // The backup record alone marks the image as watermarked
    assert!(f.service.is_watermarked(5));
    assert_eq!(f.service.get_watermarked_images().len(), 1);
    assert!(matches!(
        f.service.apply_watermark(5, &options()),
        Err(WatermarkError::AlreadyWatermarked(5))
    ));

    f.service.restore_original(5).unwrap();
    assert_eq!(f.read(&f.full(5)), original);
    assert_eq!(f.read(&f.thumb(5)), original_thumb);
    assert!(!f.service.is_watermarked(5));
}

#[test]
fn test_flag_write_is_retried() {
    let f = flaky_flag_fixture(1);
    f.add_photo(5);

    f.service.apply_watermark(5, &options()).unwrap();
    assert_eq!(
        f.attachments.get_flag(5, WATERMARKED_FLAG).as_deref(),
        Some("1")
    );
}

#[test]
fn test_full_rotation_matches_no_rotation() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);

    let mut turned = options();
    turned.rotation = Some(360);
    f.service.apply_watermark(1, &options()).unwrap();
    f.service.apply_watermark(2, &turned).unwrap();

    assert_eq!(f.read(&f.full(1)), f.read(&f.full(2)));
}

#[test]
fn test_busy_attachment_is_refused() {
    let f = fixture();
    f.add_photo(5);

    let guard = f.service.acquire(5).unwrap();
    let err = f.service.apply_watermark(5, &options()).unwrap_err();
    assert_eq!(err.code(), "busy");
    assert!(matches!(
        f.service.restore_original(5),
        Err(WatermarkError::Busy(5))
    ));
    drop(guard);

    f.service.apply_watermark(5, &options()).unwrap();
}

#[test]
fn test_staging_failure_leaves_image_untouched() {
    let f = fixture();
    f.add_photo(5);
    f.fs.insert_file(f.thumb(5), b"not an image".to_vec());
    let before = f.uploads();

    assert!(f.service.apply_watermark(5, &options()).is_err());

    assert_eq!(f.uploads(), before);
    assert!(!f.service.is_watermarked(5));
    assert!(!f.attachments.metadata(5).unwrap().has_backup());
    assert!(!f.fs.exists(&f.service.backups().backup_dir(5)));
}

#[test]
fn test_commit_failure_on_first_size_discards_backup() {
    let f = fixture();
    f.add_photo(5);
    let before = f.uploads();
    f.fs.fail_writes_to(f.full(5));

    let err = f.service.apply_watermark(5, &options()).unwrap_err();
    assert_eq!(err.code(), "commit_failed");

    assert_eq!(f.uploads(), before);
    assert_eq!(f.staged_files(), 0);
    assert!(!f.service.is_watermarked(5));
    assert!(!f.attachments.metadata(5).unwrap().has_backup());
}

#[test]
fn test_commit_failure_after_first_size_stays_restorable() {
    let f = fixture();
    f.add_photo(5);
    let before = f.uploads();
    f.fs.fail_writes_to(f.thumb(5));

    match f.service.apply_watermark(5, &options()) {
        Err(WatermarkError::Commit { size, .. }) => assert_eq!(size, "thumbnail"),
        other => panic!("expected commit failure, got {:?}", other),
    }
    assert!(f.service.is_watermarked(5));
    assert_eq!(f.staged_files(), 0);

    f.fs.clear_faults();
    f.service.restore_original(5).unwrap();
    assert_eq!(f.uploads(), before);
}

#[test]
fn test_missing_full_size_fails() {
    let f = fixture();
    f.add_photo(5);
    f.fs.delete(&f.full(5)).unwrap();

    let err = f.service.apply_watermark(5, &options()).unwrap_err();
    assert_eq!(err.code(), "io_error");
    assert!(!f.fs.exists(&f.service.backups().backup_dir(5)));
}

#[test]
fn test_missing_watermark_fails_before_backup() {
    let f = fixture();
    f.add_photo(5);
    let mut missing = options();
    missing.watermark_image = Some(WatermarkSource::Location("/nowhere/logo.png".to_string()));

    let err = f.service.apply_watermark(5, &missing).unwrap_err();
    assert_eq!(err.code(), "watermark_not_found");
    assert!(!f.attachments.metadata(5).unwrap().has_backup());
}

#[test]
fn test_non_image_attachment_rejected() {
    let f = fixture();
    let err = f.service.apply_watermark(42, &options()).unwrap_err();
    assert!(matches!(err, WatermarkError::InvalidAttachment(42)));
}

#[test]
fn test_bulk_skips_already_watermarked() {
    let f = fixture();
    for id in 1..=5 {
        f.add_photo(id);
    }
    f.attachments.set_flag(3, WATERMARKED_FLAG, "1");

    let result = f
        .service
        .bulk_watermark(&[1, 2, 3, 4, 5], &options(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.success, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors, vec!["Image 3 is already watermarked"]);
    assert!(!result.cancelled);
    assert_eq!(
        result.summary(),
        "Bulk watermarking completed. 4 images watermarked successfully, 1 failed."
    );
}

#[test]
fn test_bulk_reports_invalid_ids_and_continues() {
    let f = fixture();
    f.add_photo(1);

    let result = f
        .service
        .bulk_watermark(&[99, 1], &options(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.success, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors, vec!["ID 99 is not a valid image"]);
}

#[test]
fn test_bulk_without_options() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);

    let result = f
        .service
        .bulk_watermark(&[1, 2], &WatermarkOptions::default(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.success, 0);
    assert_eq!(result.failed, 2);
    assert_eq!(result.errors, vec!["No watermark options provided"]);
    assert!(!f.service.is_watermarked(1));
}

#[test]
fn test_bulk_with_invalid_options_is_an_error() {
    let f = fixture();
    f.add_photo(1);
    let mut bad = options();
    bad.size = Some(0);

    let err = f
        .service
        .bulk_watermark(&[1], &bad, &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.code(), "invalid_size");
}

#[test]
fn test_cancelled_bulk_stops_before_next_image() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = f.service.bulk_watermark(&[1, 2], &options(), &cancel).unwrap();

    assert!(result.cancelled);
    assert_eq!(result.success + result.failed, 0);
    assert!(!f.service.is_watermarked(1));
}

#[test]
fn test_watermark_all_only_touches_unwatermarked() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);
    f.service.apply_watermark(1, &options()).unwrap();

    let result = f
        .service
        .watermark_all_images(&options(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.success, 1);
    assert_eq!(result.failed, 0);
    assert!(f.service.is_watermarked(2));
}

#[test]
fn test_image_listings() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);
    f.service.apply_watermark(2, &options()).unwrap();

    let watermarked = f.service.get_watermarked_images();
    assert_eq!(watermarked.len(), 1);
    assert_eq!(watermarked[0].id, 2);
    assert!(watermarked[0].has_backup);
    assert_eq!(
        watermarked[0].full,
        "http://localhost/uploads/2024/photo-2.png"
    );
    assert_eq!(
        watermarked[0].thumbnail,
        "http://localhost/uploads/2024/photo-2-50x25.png"
    );

    let unwatermarked = f.service.get_unwatermarked_images();
    assert_eq!(unwatermarked.len(), 1);
    assert_eq!(unwatermarked[0].id, 1);
    assert_eq!(unwatermarked[0].title, "Photo 1");
}

#[test]
fn test_preview_falls_back_to_blank_canvas() {
    let f = fixture();
    let before = f.fs.snapshot();

    let preview = f.service.generate_preview(&options(), None, None).unwrap();

    assert_eq!(preview.source, PreviewSource::Blank);
    assert_eq!((preview.width, preview.height), BLANK_PREVIEW_SIZE);
    assert!(preview.data_url.starts_with("data:image/png;base64,"));
    assert_eq!(f.fs.snapshot(), before);
}

#[test]
fn test_preview_base_image_order() {
    let f = fixture();
    f.add_photo(1);
    f.add_photo(2);

    let upload = png(120, 80, [0, 255, 0]);
    let preview = f
        .service
        .generate_preview(&options(), Some(&upload), Some(1))
        .unwrap();
    assert_eq!(preview.source, PreviewSource::Upload);
    assert_eq!((preview.width, preview.height), (120, 80));

    let preview = f
        .service
        .generate_preview(&options(), Some(b"garbage"), Some(1))
        .unwrap();
    assert_eq!(preview.source, PreviewSource::Attachment(1));

    // Newest upload wins when no image is named
    let preview = f.service.generate_preview(&options(), None, None).unwrap();
    assert_eq!(preview.source, PreviewSource::Library(2));
    assert_eq!((preview.width, preview.height), (200, 100));
}

#[test]
fn test_preview_rejects_invalid_options() {
    let f = fixture();
    let mut bad = options();
    bad.rotation = Some(400);
    let err = f.service.generate_preview(&bad, None, None).unwrap_err();
    assert_eq!(err.code(), "invalid_rotation");
}

#[test]
fn test_process_upload_honours_settings() {
    let f = fixture();
    f.add_photo(1);

    let mut settings = WatermarkSettings {
        watermark_image: Some(WatermarkSource::Location(WATERMARK.to_string())),
        ..Default::default()
    };
    assert!(!f.service.process_upload(1, &settings).unwrap());
    assert!(!f.service.is_watermarked(1));

    settings.auto_watermark = true;
    assert!(f.service.process_upload(1, &settings).unwrap());
    assert!(f.service.is_watermarked(1));
}

#[test]
fn test_process_upload_skips_other_types() {
    let f = fixture();
    f.fs.insert_file("/up/anim.webp", b"RIFF".to_vec());
    f.attachments
        .insert(Attachment {
            id: 8,
            title: "Anim".to_string(),
            mime_type: "image/webp".to_string(),
            uploaded_at: Utc::now(),
            metadata: Some(AttachmentMetadata {
                file: "anim.webp".to_string(),
                ..Default::default()
            }),
            flags: BTreeMap::new(),
        })
        .unwrap();

    let settings = WatermarkSettings {
        watermark_image: Some(WatermarkSource::Location(WATERMARK.to_string())),
        auto_watermark: true,
        ..Default::default()
    };
    assert!(!f.service.process_upload(8, &settings).unwrap());
}

#[test]
fn test_cleanup_forgets_everything() {
    let f = fixture();
    f.add_photo(5);
    f.service.apply_watermark(5, &options()).unwrap();
    f.service
        .resolver()
        .resolve_location("http://localhost/uploads/2024/photo-5.png")
        .unwrap();
    assert_eq!(f.service.resolver().cached_entries(), 2);

    f.service.cleanup(5);

    assert!(!f.service.is_watermarked(5));
    assert!(!f.attachments.metadata(5).unwrap().has_backup());
    assert!(!f.fs.exists(&f.service.backups().backup_dir(5)));
    // Only lookups that led to this image are forgotten
    assert_eq!(f.service.resolver().cached_entries(), 1);
    assert_eq!(
        f.service
            .resolver()
            .resolve_location(WATERMARK)
            .unwrap(),
        PathBuf::from(WATERMARK)
    );
}
