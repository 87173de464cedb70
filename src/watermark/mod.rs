// Watermark module - compositing, backups and the batch orchestrator
mod backup;
mod compositor;
mod core;
mod error;
pub mod geometry;
mod options;
pub mod raster;
mod resolver;
mod types;

pub use backup::{BACKUP_DIR_NAME, BackupManager, sanitize_file_name};
pub use compositor::{blend, composite, rotate_expanded};
pub use core::{BLANK_PREVIEW_SIZE, WatermarkService};
pub use error::WatermarkError;
pub use geometry::calculate_position;
pub use options::{Position, WatermarkConfig, WatermarkOptions, WatermarkSource};
pub use raster::{Raster, RasterFormat};
pub use resolver::{
    DEFAULT_CACHE_TTL, DEFAULT_WATERMARK_FILE, ResolverConfig, WatermarkPathResolver,
};
pub use types::*;

use std::sync::Arc;

pub type SharedWatermarkService = Arc<WatermarkService>;

#[cfg(test)]
mod tests {
    mod service_tests;
}
