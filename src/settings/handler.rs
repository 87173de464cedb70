use super::{LEGACY_SETTINGS_KEY, SETTINGS_KEY, SettingsError, SettingsStore, WatermarkSettings};
use crate::attachments::SharedAttachmentStore;
use crate::watermark::Position;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Settings payload as sent by clients: any subset of the settings keys.
pub type SettingsInput = Map<String, Value>;

const NUMERIC_RANGES: [(&str, i64, i64); 3] = [
    ("opacity", 0, 100),
    ("size", 1, 100),
    ("rotation", 0, 360),
];

const BOOLEAN_FIELDS: [&str; 2] = ["autoWatermark", "backupOriginals"];

/// Reads, validates and persists the plugin settings.
pub struct SettingsHandler {
    store: Arc<dyn SettingsStore>,
    attachments: SharedAttachmentStore,
}

impl SettingsHandler {
    pub fn new(store: Arc<dyn SettingsStore>, attachments: SharedAttachmentStore) -> Self {
        Self { store, attachments }
    }

    /// Stored settings merged over the defaults.
    pub fn get_settings(&self) -> WatermarkSettings {
        let Some(stored) = self.store.get_setting(SETTINGS_KEY) else {
            return WatermarkSettings::default();
        };
        let Value::Object(stored) = stored else {
            warn!("Ignoring malformed {} value", SETTINGS_KEY);
            return WatermarkSettings::default();
        };

        let mut merged = defaults_map();
        merged.extend(stored);
        match serde_json::from_value(Value::Object(merged)) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Stored settings are unreadable, using defaults: {}", e);
                WatermarkSettings::default()
            }
        }
    }

    /// Check every provided field; absent fields are not validated.
    pub fn validate_settings(&self, input: &SettingsInput) -> Result<(), SettingsError> {
        let mut errors = Vec::new();

        match input.get("watermarkImage") {
            None | Some(Value::Null) => {}
            Some(value) => {
                if let Some(id) = numeric(value) {
                    if id < 0.0 || id.fract() != 0.0 || !self.attachments.exists(id as u64) {
                        errors.push("Invalid watermark image attachment ID".to_string());
                    }
                } else {
                    match value.as_str().map(str::trim) {
                        Some("") => {}
                        Some(s) if is_url_or_path(s) => {}
                        _ => errors.push("Invalid watermark image URL format".to_string()),
                    }
                }
            }
        }

        match input.get("position") {
            None | Some(Value::Null) => {}
            Some(value) => {
                if !value.as_str().is_some_and(Position::is_api_position) {
                    errors.push("Invalid position value".to_string());
                }
            }
        }

        for (field, min, max) in NUMERIC_RANGES {
            let Some(value) = input.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let in_range = numeric(value).is_some_and(|n| n >= min as f64 && n <= max as f64);
            if !in_range {
                errors.push(format!(
                    "Invalid {} value. Must be between {} and {}",
                    field, min, max
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(errors))
        }
    }

    /// Coerce provided fields to their stored types, dropping unknown keys.
    pub fn sanitize_settings(&self, input: &SettingsInput) -> SettingsInput {
        let mut sanitized = Map::new();

        if let Some(value) = input.get("watermarkImage").filter(|v| !v.is_null()) {
            let clean = match numeric(value) {
                Some(n) => Value::from(n.abs().trunc() as u64),
                None => Value::from(
                    value
                        .as_str()
                        .unwrap_or_default()
                        .trim()
                        .chars()
                        .filter(|c| !c.is_control() && !c.is_whitespace())
                        .collect::<String>(),
                ),
            };
            sanitized.insert("watermarkImage".to_string(), clean);
        }

        if let Some(position) = input.get("position").and_then(Value::as_str) {
            sanitized.insert("position".to_string(), Value::from(position.trim()));
        }

        for (field, min, max) in NUMERIC_RANGES {
            if let Some(value) = input.get(field).filter(|v| !v.is_null()) {
                let clamped = int_value(value).clamp(min, max);
                sanitized.insert(field.to_string(), Value::from(clamped));
            }
        }

        for field in BOOLEAN_FIELDS {
            if let Some(value) = input.get(field).filter(|v| !v.is_null()) {
                sanitized.insert(field.to_string(), Value::from(truthy(value)));
            }
        }

        sanitized
    }

    /// Validate, sanitize, merge over the current settings and persist.
    pub fn update_settings(
        &self,
        input: &SettingsInput,
    ) -> Result<WatermarkSettings, SettingsError> {
        self.validate_settings(input)?;
        let sanitized = self.sanitize_settings(input);

        let mut merged = match serde_json::to_value(self.get_settings())? {
            Value::Object(map) => map,
            _ => defaults_map(),
        };
        merged.extend(sanitized);

        let settings: WatermarkSettings = serde_json::from_value(Value::Object(merged))?;
        let stored = serde_json::to_value(&settings)?;
        match self.store.update_setting(SETTINGS_KEY, stored) {
            Ok(true) => {
                info!("Watermark settings updated");
                Ok(settings)
            }
            Ok(false) => Err(SettingsError::UpdateFailed),
            Err(e) => {
                error!("Failed to update settings: {}", e);
                Err(e)
            }
        }
    }

    /// Settings as returned to clients: attachment ids become URLs.
    pub fn prepare_for_response(&self, settings: &WatermarkSettings) -> Value {
        let mut value =
            serde_json::to_value(settings).unwrap_or_else(|_| Value::Object(defaults_map()));
        if let Some(id) = value.get("watermarkImage").and_then(Value::as_u64) {
            if let Some(url) = self.attachments.attachment_url(id, None) {
                value["watermarkImage"] = Value::from(url);
            }
        }
        value
    }

    pub fn reset_to_defaults(&self) -> Result<WatermarkSettings, SettingsError> {
        self.update_settings(&defaults_map())
    }

    /// Move settings stored under the legacy key. Returns whether anything
    /// was migrated.
    pub fn migrate_from_legacy(&self) -> Result<bool, SettingsError> {
        let Some(legacy) = self.store.get_setting(LEGACY_SETTINGS_KEY) else {
            return Ok(false);
        };
        match legacy {
            Value::Object(map) => {
                self.update_settings(&map)?;
            }
            other => warn!("Discarding malformed legacy settings: {}", other),
        }
        self.store.delete_setting(LEGACY_SETTINGS_KEY)?;
        info!("Migrated legacy watermark settings");
        Ok(true)
    }
}

fn defaults_map() -> Map<String, Value> {
    match serde_json::to_value(WatermarkSettings::default()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Numbers and numeric strings.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn int_value(value: &Value) -> i64 {
    match value {
        Value::Bool(b) => *b as i64,
        other => numeric(other).map(|n| n.trunc() as i64).unwrap_or(0),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn is_url_or_path(s: &str) -> bool {
    if s.starts_with('/') {
        return true;
    }
    url::Url::parse(s).is_ok_and(|url| url.has_host())
}
