use super::WatermarkError;
use crate::filesystem::{FS_CHMOD_FILE, Filesystem};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageEncoder, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const JPEG_QUALITY: u8 = 90;
pub const WEBP_QUALITY: f32 = 90.0;

/// Suffix marking staged output that has not been moved into place yet.
pub const STAGING_MARKER: &str = ".wm-staged-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl RasterFormat {
    /// Identify the codec from the file's leading bytes.
    pub fn detect(bytes: &[u8]) -> Result<Self, WatermarkError> {
        match image::guess_format(bytes) {
            Ok(ImageFormat::Jpeg) => Ok(RasterFormat::Jpeg),
            Ok(ImageFormat::Png) => Ok(RasterFormat::Png),
            Ok(ImageFormat::Gif) => Ok(RasterFormat::Gif),
            Ok(ImageFormat::WebP) => Ok(RasterFormat::WebP),
            _ => Err(WatermarkError::UnsupportedFormat),
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(RasterFormat::Jpeg),
            "image/png" => Some(RasterFormat::Png),
            "image/gif" => Some(RasterFormat::Gif),
            "image/webp" => Some(RasterFormat::WebP),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            RasterFormat::Jpeg => "image/jpeg",
            RasterFormat::Png => "image/png",
            RasterFormat::Gif => "image/gif",
            RasterFormat::WebP => "image/webp",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Gif => ImageFormat::Gif,
            RasterFormat::WebP => ImageFormat::WebP,
        }
    }
}

/// A decoded image together with the codec it came from.
#[derive(Debug, Clone)]
pub struct Raster {
    pub image: DynamicImage,
    pub format: RasterFormat,
}

impl Raster {
    pub fn new(image: DynamicImage, format: RasterFormat) -> Self {
        Self { image, format }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

pub fn decode(bytes: &[u8]) -> Result<Raster, WatermarkError> {
    let format = RasterFormat::detect(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format.image_format())?;
    Ok(Raster { image, format })
}

pub fn load(fs: &dyn Filesystem, path: &Path) -> Result<Raster, WatermarkError> {
    let bytes = fs.get_contents(path)?;
    let raster = decode(&bytes)?;
    debug!(
        "Loaded {:?} {}x{} from {:?}",
        raster.format,
        raster.image.width(),
        raster.image.height(),
        path
    );
    Ok(raster)
}

/// Encode with the codec settings used for every written file.
pub fn encode(image: &DynamicImage, format: RasterFormat) -> Result<Vec<u8>, WatermarkError> {
    let mut output = Cursor::new(Vec::new());
    match format {
        RasterFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb_image = image.to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            encoder.write_image(
                &rgb_image,
                rgb_image.width(),
                rgb_image.height(),
                image::ExtendedColorType::Rgb8,
            )?;
        }
        RasterFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut output,
                CompressionType::Best,
                FilterType::Adaptive,
            );
            image.write_with_encoder(encoder)?;
        }
        RasterFormat::Gif => {
            image.write_to(&mut output, ImageFormat::Gif)?;
        }
        RasterFormat::WebP => {
            let (width, height) = (image.width(), image.height());
            let encoded = if image.color().has_alpha() {
                let rgba = image.to_rgba8();
                webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode(WEBP_QUALITY)
            } else {
                let rgb = image.to_rgb8();
                webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode(WEBP_QUALITY)
            };
            return Ok(encoded.to_vec());
        }
    }
    Ok(output.into_inner())
}

/// Sibling path used to stage output for `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}{}{}",
        name,
        STAGING_MARKER,
        uuid::Uuid::new_v4().simple()
    ))
}

pub fn is_staging_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGING_MARKER)
}

/// Encode next to `path` without touching it; returns the staged file.
pub fn write_staged(
    fs: &dyn Filesystem,
    image: &DynamicImage,
    format: RasterFormat,
    path: &Path,
) -> Result<PathBuf, WatermarkError> {
    let bytes = encode(image, format)?;
    let staged = staging_path(path);
    fs.put_contents(&staged, &bytes)?;
    Ok(staged)
}

/// Move a staged file over its destination.
pub fn commit(fs: &dyn Filesystem, staged: &Path, path: &Path) -> std::io::Result<()> {
    fs.move_file(staged, path, true)?;
    if let Err(e) = fs.chmod(path, FS_CHMOD_FILE) {
        warn!("Failed to set permissions on {:?}: {}", path, e);
    }
    Ok(())
}

/// Remove staged files that will not be committed.
pub fn discard(fs: &dyn Filesystem, staged: &[PathBuf]) {
    for path in staged {
        if let Err(e) = fs.delete(path) {
            warn!("Failed to remove staged file {:?}: {}", path, e);
        }
    }
}

/// Write `image` to `path` in `format`, replacing the file atomically.
pub fn save(
    fs: &dyn Filesystem,
    image: &DynamicImage,
    format: RasterFormat,
    path: &Path,
) -> Result<(), WatermarkError> {
    let staged = write_staged(fs, image, format, path)?;
    if let Err(e) = commit(fs, &staged, path) {
        discard(fs, &[staged]);
        return Err(e.into());
    }
    Ok(())
}
