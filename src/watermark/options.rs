use super::WatermarkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the watermark raster comes from: a media library attachment or a
/// URL / path / bare filename that still needs resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatermarkSource {
    Attachment(u64),
    Location(String),
}

impl WatermarkSource {
    /// Numeric strings refer to attachments.
    pub fn normalized(self) -> Self {
        match self {
            WatermarkSource::Location(s) => match s.trim().parse::<u64>() {
                Ok(id) => WatermarkSource::Attachment(id),
                Err(_) => WatermarkSource::Location(s.trim().to_string()),
            },
            other => other,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            WatermarkSource::Attachment(id) => *id == 0,
            WatermarkSource::Location(s) => s.trim().is_empty(),
        }
    }
}

impl fmt::Display for WatermarkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkSource::Attachment(id) => write!(f, "{}", id),
            WatermarkSource::Location(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    Center,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl Position {
    /// Positions accepted by the REST API.
    pub const API: [Position; 5] = [
        Position::TopLeft,
        Position::TopRight,
        Position::BottomLeft,
        Position::BottomRight,
        Position::Center,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "top-left" => Some(Position::TopLeft),
            "top-center" => Some(Position::TopCenter),
            "top-right" => Some(Position::TopRight),
            "middle-left" => Some(Position::MiddleLeft),
            "center" | "middle-center" => Some(Position::Center),
            "middle-right" => Some(Position::MiddleRight),
            "bottom-left" => Some(Position::BottomLeft),
            "bottom-center" => Some(Position::BottomCenter),
            "bottom-right" => Some(Position::BottomRight),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::TopLeft => "top-left",
            Position::TopCenter => "top-center",
            Position::TopRight => "top-right",
            Position::MiddleLeft => "middle-left",
            Position::Center => "center",
            Position::MiddleRight => "middle-right",
            Position::BottomLeft => "bottom-left",
            Position::BottomCenter => "bottom-center",
            Position::BottomRight => "bottom-right",
        }
    }

    pub fn is_api_position(name: &str) -> bool {
        Position::API.iter().any(|p| p.as_str() == name)
    }
}

impl FromStr for Position {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Position::parse(s).ok_or_else(|| WatermarkError::InvalidOption {
            field: "position",
            message: "Invalid watermark position.".to_string(),
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watermark options as they arrive from callers; every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkOptions {
    #[serde(default)]
    pub watermark_image: Option<WatermarkSource>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub opacity: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub rotation: Option<i64>,
}

/// Fully validated watermark configuration for one compositing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkConfig {
    pub source: WatermarkSource,
    /// Anchor name; unknown names composite at the top-left margin.
    pub position: String,
    pub opacity: u8,
    pub size: u8,
    /// Clockwise degrees, always below 360.
    pub rotation: u16,
}

impl WatermarkOptions {
    pub fn is_empty(&self) -> bool {
        self.watermark_image.is_none()
            && self.position.is_none()
            && self.opacity.is_none()
            && self.size.is_none()
            && self.rotation.is_none()
    }

    /// Check presence and ranges. Position names are not checked here.
    pub fn validate(&self) -> Result<WatermarkConfig, WatermarkError> {
        let mut missing = Vec::new();
        let source = match &self.watermark_image {
            Some(source) if !source.is_empty() => Some(source.clone().normalized()),
            _ => {
                missing.push("watermarkImage");
                None
            }
        };
        if self.position.is_none() {
            missing.push("position");
        }
        if self.opacity.is_none() {
            missing.push("opacity");
        }
        if self.size.is_none() {
            missing.push("size");
        }
        if self.rotation.is_none() {
            missing.push("rotation");
        }

        let (Some(source), Some(position), Some(opacity), Some(size), Some(rotation)) = (
            source,
            self.position.clone(),
            self.opacity,
            self.size,
            self.rotation,
        ) else {
            return Err(WatermarkError::MissingOptions(missing));
        };

        let opacity = check_range("opacity", opacity, 0, 100, "Opacity")?;
        let size = check_range("size", size, 1, 100, "Size")?;
        let rotation = check_range("rotation", rotation, 0, 360, "Rotation")?;

        Ok(WatermarkConfig {
            source,
            position,
            opacity: opacity as u8,
            size: size as u8,
            rotation: (rotation % 360) as u16,
        })
    }

    /// Validation applied at the HTTP boundary, which also restricts the
    /// anchor to the five advertised positions.
    pub fn validate_for_api(&self) -> Result<WatermarkConfig, WatermarkError> {
        let config = self.validate()?;
        if !Position::is_api_position(&config.position) {
            return Err(WatermarkError::InvalidOption {
                field: "position",
                message: "Invalid watermark position.".to_string(),
            });
        }
        Ok(config)
    }
}

fn check_range(
    field: &'static str,
    value: i64,
    min: i64,
    max: i64,
    label: &str,
) -> Result<i64, WatermarkError> {
    if value < min || value > max {
        return Err(WatermarkError::InvalidOption {
            field,
            message: format!("{} must be a number between {} and {}.", label, min, max),
        });
    }
    Ok(value)
}
