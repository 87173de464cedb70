use crate::AppState;
use crate::settings::{SettingsError, SettingsInput};
use crate::watermark::{BulkResult, WatermarkError, WatermarkOptions};
use axum::{
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use base64::{Engine, engine::general_purpose};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

/// JSON error body: `{code, message, details?}` plus any extra fields.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "code": code, "message": message.into() }),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Serialize) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), json!(value));
        }
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<WatermarkError> for ApiError {
    fn from(err: WatermarkError) -> Self {
        let status = match &err {
            WatermarkError::MissingOptions(_)
            | WatermarkError::InvalidOption { .. }
            | WatermarkError::WatermarkNotFound(_)
            | WatermarkError::UnsupportedFormat
            | WatermarkError::NoBackup(_)
            | WatermarkError::PartialRestore { .. } => StatusCode::BAD_REQUEST,
            WatermarkError::InvalidAttachment(_) => StatusCode::NOT_FOUND,
            WatermarkError::AlreadyWatermarked(_) | WatermarkError::Busy(_) => {
                StatusCode::CONFLICT
            }
            WatermarkError::ImageError(_)
            | WatermarkError::Stage { .. }
            | WatermarkError::Backup(_)
            | WatermarkError::Commit { .. }
            | WatermarkError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Watermark operation failed: {}", err);
        }

        let message = match &err {
            WatermarkError::InvalidOption { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let api_error = ApiError::new(status, err.code(), message);

        match err {
            WatermarkError::PartialRestore {
                restored_sizes,
                failed_sizes,
            } => api_error
                .with_field("restored_sizes", restored_sizes)
                .with_field("failed_sizes", failed_sizes),
            _ => api_error,
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::Invalid(details) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_settings", "Invalid settings")
                    .with_field("details", details)
            }
            other => {
                error!("Settings operation failed: {}", other);
                ApiError::internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

/// Run image and file work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::internal(format!("Worker task failed: {}", e)))?
}

/// Rejects requests without the configured admin bearer token.
pub async fn require_admin(
    State(app_state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = app_state
        .config
        .app
        .admin_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|given| given.trim() == token);

    if !authorized {
        warn!("Rejected unauthorized request to {}", request.uri().path());
        return ApiError::new(
            StatusCode::FORBIDDEN,
            "insufficient_permissions",
            "You do not have permission to perform this action.",
        )
        .into_response();
    }

    next.run(request).await
}

pub async fn get_settings_handler(State(app_state): State<AppState>) -> Json<Value> {
    let settings = app_state.settings.get_settings();
    Json(app_state.settings.prepare_for_response(&settings))
}

pub async fn update_settings_handler(
    State(app_state): State<AppState>,
    payload: Result<Json<SettingsInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };

    let handler = app_state.settings.clone();
    let result = blocking(move || Ok(handler.update_settings(&input))).await;

    match result {
        Ok(Ok(settings)) => Json(json!({
            "message": "Settings updated successfully",
            "settings": app_state.settings.prepare_for_response(&settings),
        }))
        .into_response(),
        Ok(Err(SettingsError::Invalid(details))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Settings validation failed",
                "details": details,
            })),
        )
            .into_response(),
        Ok(Err(e)) => ApiError::from(e).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    #[serde(default)]
    pub media_id: Option<u64>,
    /// Base64 image bytes, optionally as a data URL.
    #[serde(default)]
    pub image_data: Option<String>,
    pub settings: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub preview_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

fn decode_image_data(data: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_image_data",
                "Image data is not valid base64",
            )
        })
}

fn parse_options(value: Value) -> Result<WatermarkOptions, ApiError> {
    serde_json::from_value(value).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_watermark_options",
            format!("Invalid watermark options: {}", e),
        )
    })
}

pub async fn preview_handler(
    State(app_state): State<AppState>,
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let Json(request) = payload?;
    if !request.settings.is_object() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_settings",
            "Invalid or missing settings parameter",
        ));
    }
    let options = parse_options(request.settings)?;
    options.validate_for_api()?;

    let image_data = request
        .image_data
        .as_deref()
        .filter(|data| !data.is_empty())
        .map(decode_image_data)
        .transpose()?;

    let service = app_state.watermark.clone();
    let media_id = request.media_id;
    let preview = blocking(move || {
        Ok(service.generate_preview(&options, image_data.as_deref(), media_id)?)
    })
    .await?;

    let original_url = preview
        .source
        .attachment_id()
        .and_then(|id| app_state.attachments.attachment_url(id, None));

    Ok(Json(PreviewResponse {
        preview_url: preview.data_url,
        original_url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    #[serde(default)]
    pub image_ids: Vec<Value>,
    #[serde(default)]
    pub watermark_options: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkAllRequest {
    #[serde(default)]
    pub watermark_options: Value,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub success: bool,
    pub message: String,
    pub data: BulkResult,
}

/// Numeric ids and numeric strings; anything else is dropped.
fn parse_image_ids(values: &[Value]) -> Vec<u64> {
    values
        .iter()
        .filter_map(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|&id| id > 0)
        .collect()
}

fn options_from_request(value: Value) -> Result<WatermarkOptions, ApiError> {
    let options = match value {
        Value::Null => WatermarkOptions::default(),
        other => parse_options(other)?,
    };
    options.validate_for_api()?;
    Ok(options)
}

pub async fn bulk_watermark_handler(
    State(app_state): State<AppState>,
    payload: Result<Json<BulkRequest>, JsonRejection>,
) -> Result<Json<BulkResponse>, ApiError> {
    let Json(request) = payload?;

    let ids = parse_image_ids(&request.image_ids);
    if ids.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_image_ids",
            "No valid image IDs provided.",
        ));
    }
    let options = options_from_request(request.watermark_options)?;

    info!("Starting bulk watermark of {} images", ids.len());
    let service = app_state.watermark.clone();
    let cancel = app_state.shutdown.child_token();
    let result = blocking(move || Ok(service.bulk_watermark(&ids, &options, &cancel)?)).await?;

    Ok(Json(BulkResponse {
        success: true,
        message: result.summary(),
        data: result,
    }))
}

pub async fn watermark_all_handler(
    State(app_state): State<AppState>,
    payload: Result<Json<WatermarkAllRequest>, JsonRejection>,
) -> Result<Json<BulkResponse>, ApiError> {
    let Json(request) = payload?;
    let options = options_from_request(request.watermark_options)?;

    let service = app_state.watermark.clone();
    let cancel = app_state.shutdown.child_token();
    let result = blocking(move || Ok(service.watermark_all_images(&options, &cancel)?)).await?;

    Ok(Json(BulkResponse {
        success: true,
        message: format!(
            "Watermarking process completed. {} images watermarked successfully, {} failed.",
            result.success, result.failed
        ),
        data: result,
    }))
}

pub async fn watermarked_images_handler(
    State(app_state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let service = app_state.watermark.clone();
    let images = blocking(move || Ok(service.get_watermarked_images())).await?;
    Ok(Json(images))
}

pub async fn images_handler(
    State(app_state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let service = app_state.watermark.clone();
    let images = blocking(move || Ok(service.get_unwatermarked_images())).await?;
    Ok(Json(images))
}

pub async fn restore_handler(
    State(app_state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    info!("Attempting to restore image with ID: {}", id);
    let service = app_state.watermark.clone();
    let restored = blocking(move || Ok(service.restore_original(id)?)).await?;
    info!("Image {} restored successfully", id);
    Ok(Json(json!({ "success": true, "restored_sizes": restored })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_restore_body_lists_sizes() {
        let err = ApiError::from(WatermarkError::PartialRestore {
            restored_sizes: vec!["full".to_string()],
            failed_sizes: vec!["thumbnail".to_string()],
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body["code"], "restore_partial_failure");
        assert_eq!(err.body["restored_sizes"], json!(["full"]));
        assert_eq!(err.body["failed_sizes"], json!(["thumbnail"]));
    }

    #[test]
    fn test_option_errors_use_field_codes() {
        let err = ApiError::from(WatermarkError::InvalidOption {
            field: "opacity",
            message: "Opacity must be a number between 0 and 100.".to_string(),
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body["code"], "invalid_opacity");
        assert_eq!(
            err.body["message"],
            "Opacity must be a number between 0 and 100."
        );
    }

    #[test]
    fn test_io_errors_are_server_errors() {
        let err = ApiError::from(WatermarkError::IoError(std::io::Error::other("disk")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body["code"], "io_error");
    }

    #[test]
    fn test_image_ids_accept_numeric_strings() {
        let ids = parse_image_ids(&[json!(1), json!("2"), json!("x"), json!(0), json!(-3)]);
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_image_data_accepts_data_urls() {
        let encoded = general_purpose::STANDARD.encode(b"abc");
        assert_eq!(decode_image_data(&encoded).unwrap(), b"abc");
        assert_eq!(
            decode_image_data(&format!("data:image/png;base64,{}", encoded)).unwrap(),
            b"abc"
        );
        assert!(decode_image_data("%%%").is_err());
    }
}
