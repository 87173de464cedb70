use crate::watermark::{WatermarkOptions, WatermarkSource};
use serde::{Deserialize, Serialize};

/// Key of the settings row.
pub const SETTINGS_KEY: &str = "watermark_settings";
/// Key the settings were kept under by older installs.
pub const LEGACY_SETTINGS_KEY: &str = "WM_image_watermark_options";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatermarkSettings {
    pub watermark_image: Option<WatermarkSource>,
    pub position: String,
    pub opacity: u8,
    pub size: u8,
    pub rotation: u16,
    pub auto_watermark: bool,
    pub backup_originals: bool,
}

impl Default for WatermarkSettings {
    fn default() -> Self {
        Self {
            watermark_image: None,
            position: "bottom-right".to_string(),
            opacity: 50,
            size: 50,
            rotation: 0,
            auto_watermark: false,
            backup_originals: true,
        }
    }
}

impl WatermarkSettings {
    /// Watermark options for automatic watermarking.
    pub fn to_options(&self) -> WatermarkOptions {
        WatermarkOptions {
            watermark_image: self.watermark_image.clone(),
            position: Some(self.position.clone()),
            opacity: Some(self.opacity as i64),
            size: Some(self.size as i64),
            rotation: Some(self.rotation as i64),
        }
    }
}
