use super::geometry::{calculate_position, scaled_dimensions, watermark_target_size};
use super::{WatermarkConfig, WatermarkError};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use tracing::debug;

/// Blend `watermark` onto `source` as described by `config`.
///
/// The result keeps the source's dimensions and alpha channel. Placement is
/// computed from the scaled watermark before rotation, so a rotated mark is
/// anchored at the same corner as its unrotated bounding box.
pub fn composite(
    source: &DynamicImage,
    watermark: &DynamicImage,
    config: &WatermarkConfig,
) -> Result<DynamicImage, WatermarkError> {
    let (width, height) = (source.width(), source.height());
    if width == 0 || height == 0 {
        return Err(stage("read source image", "image has no pixels"));
    }
    if watermark.width() == 0 || watermark.height() == 0 {
        return Err(stage("read watermark image", "watermark has no pixels"));
    }

    let target = watermark_target_size(width, height, config.size);
    let (mark_width, mark_height) =
        scaled_dimensions(watermark.width(), watermark.height(), target);
    let scaled = imageops::resize(
        &watermark.to_rgba8(),
        mark_width,
        mark_height,
        FilterType::Lanczos3,
    );

    let (x, y) = calculate_position(&config.position, width, height, mark_width, mark_height);

    let mark = if config.rotation % 360 != 0 {
        rotate_expanded(&scaled, config.rotation)
    } else {
        scaled
    };

    debug!(
        "Compositing {}x{} watermark at ({}, {}) onto {}x{}, opacity {}, rotation {}",
        mark.width(),
        mark.height(),
        x,
        y,
        width,
        height,
        config.opacity,
        config.rotation
    );

    let mut canvas = source.to_rgba8();
    blend(&mut canvas, &mark, x, y, config.opacity);

    Ok(if source.color().has_alpha() {
        DynamicImage::ImageRgba8(canvas)
    } else {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
    })
}

/// Rotate clockwise by `degrees` onto a transparent canvas just large enough
/// for the rotated bounds.
pub fn rotate_expanded(image: &RgbaImage, degrees: u16) -> RgbaImage {
    let (width, height) = image.dimensions();
    let theta = (degrees as f64).to_radians();
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());

    // Trig noise must not add a pixel at right angles
    let bound = |v: f64| ((v - 1e-6).ceil().max(1.0)) as u32;
    let out_width = bound(width as f64 * cos + height as f64 * sin);
    let out_height = bound(width as f64 * sin + height as f64 * cos);

    let canvas_width = width.max(out_width);
    let canvas_height = height.max(out_height);
    let mut canvas = RgbaImage::from_pixel(canvas_width, canvas_height, Rgba([0, 0, 0, 0]));
    imageops::replace(
        &mut canvas,
        image,
        ((canvas_width - width) / 2) as i64,
        ((canvas_height - height) / 2) as i64,
    );

    let rotated = rotate_about_center(
        &canvas,
        theta as f32,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
    );

    imageops::crop_imm(
        &rotated,
        (canvas_width - out_width) / 2,
        (canvas_height - out_height) / 2,
        out_width,
        out_height,
    )
    .to_image()
}

/// Alpha-blend `mark` onto `canvas` with its top-left corner at (`x`, `y`).
///
/// Each mark pixel contributes its own alpha scaled by `opacity` percent.
/// Pixels falling outside the canvas are dropped and the canvas alpha is
/// left unchanged.
pub fn blend(canvas: &mut RgbaImage, mark: &RgbaImage, x: i64, y: i64, opacity: u8) {
    if opacity == 0 {
        return;
    }
    let strength = opacity.min(100) as f32 / 100.0;
    let (canvas_width, canvas_height) = (canvas.width() as i64, canvas.height() as i64);

    for (mx, my, pixel) in mark.enumerate_pixels() {
        let dx = x + mx as i64;
        let dy = y + my as i64;
        if dx < 0 || dy < 0 || dx >= canvas_width || dy >= canvas_height {
            continue;
        }

        let alpha = pixel[3] as f32 / 255.0 * strength;
        if alpha <= 0.0 {
            continue;
        }

        let target = canvas.get_pixel_mut(dx as u32, dy as u32);
        for channel in 0..3 {
            let mixed = target[channel] as f32 * (1.0 - alpha) + pixel[channel] as f32 * alpha;
            target[channel] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn stage(stage: &'static str, message: &str) -> WatermarkError {
    WatermarkError::Stage {
        stage,
        message: message.to_string(),
    }
}
