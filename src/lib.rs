use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod api;
pub mod attachments;
pub mod cleanup;
pub mod filesystem;
pub mod rate_limit;
pub mod settings;
pub mod startup_checks;
pub mod watermark;

/// File name of the media library index inside the data directory.
pub const ATTACHMENTS_FILE: &str = "attachments.json";
/// File name of the settings table inside the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub app: AppConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
    /// Also write logs to daily files in this directory.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    /// Daily log files kept in `log_directory`; older ones are deleted.
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,
    /// Bearer token required on every API route when set.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub uploads_directory: PathBuf,
    pub data_directory: PathBuf,
    /// Directory that site-relative URLs resolve against.
    #[serde(default)]
    pub site_root: Option<PathBuf>,
    /// Public origin, e.g. `https://example.com`.
    #[serde(default)]
    pub site_url: Option<String>,
    #[serde(default = "default_uploads_url_path")]
    pub uploads_url_path: String,
}

fn default_log_max_files() -> usize {
    5
}

fn default_uploads_url_path() -> String {
    "/uploads".to_string()
}

impl StorageConfig {
    pub fn attachments_index(&self) -> PathBuf {
        self.data_directory.join(ATTACHMENTS_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_directory.join(SETTINGS_FILE)
    }

    /// Public base URL of the uploads directory.
    pub fn uploads_base_url(&self) -> String {
        let path = format!("/{}", self.uploads_url_path.trim_matches('/'));
        match &self.site_url {
            Some(site) => format!("{}{}", site.trim_end_matches('/'), path),
            None => path,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub bulk_requests: u32,
    pub bulk_period_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bulk_requests: 10,
            bulk_period_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub temp_file_expiry_hours: u64,
    pub backup_retention_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            temp_file_expiry_hours: 24,
            backup_retention_days: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            app: AppConfig {
                name: "Watermark Manager".to_string(),
                log_level: "info".to_string(),
                log_directory: None,
                log_max_files: default_log_max_files(),
                admin_token: None,
            },
            storage: StorageConfig {
                uploads_directory: PathBuf::from("uploads"),
                data_directory: PathBuf::from("data"),
                site_root: None,
                site_url: None,
                uploads_url_path: default_uploads_url_path(),
            },
            rate_limit: RateLimitConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

use attachments::{JsonAttachmentStore, SharedAttachmentStore};
use axum::{Router, middleware, routing::get, routing::post};
use cleanup::CleanupJob;
use filesystem::{LocalFilesystem, SharedFilesystem};
use rate_limit::{ActorRateLimiter, SharedRateLimiter};
use settings::{JsonSettingsStore, SettingsHandler, SharedSettingsHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use watermark::{ResolverConfig, SharedWatermarkService, WatermarkService};

#[derive(Clone)]
pub struct AppState {
    pub watermark: SharedWatermarkService,
    /// Concrete media library, for imports and removals.
    pub library: Arc<JsonAttachmentStore>,
    pub settings: SharedSettingsHandler,
    pub attachments: SharedAttachmentStore,
    pub rate_limiter: SharedRateLimiter,
    pub cleanup: Arc<CleanupJob>,
    /// Cancelled on shutdown; long-running loops watch a child token.
    pub shutdown: CancellationToken,
    pub config: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Failed to load attachments: {0}")]
    Attachments(#[from] attachments::AttachmentError),
}

/// Wire the stores and services for `config` on top of `fs`.
pub fn build_state(
    config: Config,
    fs: SharedFilesystem,
    shutdown: CancellationToken,
) -> Result<AppState, AppError> {
    let storage = &config.storage;

    let library = Arc::new(JsonAttachmentStore::load(
        fs.clone(),
        storage.attachments_index(),
        storage.uploads_directory.clone(),
        storage.uploads_base_url(),
    )?);
    let attachments: SharedAttachmentStore = library.clone();

    let settings_store = Arc::new(JsonSettingsStore::new(fs.clone(), storage.settings_file()));
    let settings = Arc::new(SettingsHandler::new(settings_store, attachments.clone()));

    let watermark = Arc::new(WatermarkService::new(
        fs.clone(),
        attachments.clone(),
        ResolverConfig {
            uploads_root: storage.uploads_directory.clone(),
            site_root: storage
                .site_root
                .clone()
                .unwrap_or_else(|| storage.uploads_directory.clone()),
            site_url: storage.site_url.clone(),
            uploads_url_path: storage.uploads_url_path.clone(),
        },
    ));

    let rate_limiter = Arc::new(ActorRateLimiter::new(
        config.rate_limit.bulk_requests,
        Duration::from_secs(config.rate_limit.bulk_period_seconds),
    ));

    let cleanup = Arc::new(CleanupJob::new(
        fs,
        attachments.clone(),
        storage.uploads_directory.clone(),
        Duration::from_secs(config.cleanup.temp_file_expiry_hours * 60 * 60),
        Duration::from_secs(config.cleanup.backup_retention_days * 24 * 60 * 60),
    ));

    Ok(AppState {
        watermark,
        library,
        settings,
        attachments,
        rate_limiter,
        cleanup,
        shutdown,
        config,
    })
}

pub async fn create_app(config: Config) -> Result<Router, AppError> {
    let state = build_state(
        config,
        Arc::new(LocalFilesystem::new()),
        CancellationToken::new(),
    )?;
    Ok(create_router(state))
}

pub fn create_router(app_state: AppState) -> Router {
    let bulk_routes = Router::new()
        .route("/bulk-watermark", post(api::bulk_watermark_handler))
        .route_layer(middleware::from_fn_with_state(
            app_state.rate_limiter.clone(),
            rate_limit::rate_limit_middleware,
        ));

    let api_routes = Router::new()
        .route(
            "/settings",
            get(api::get_settings_handler).post(api::update_settings_handler),
        )
        .route("/preview", post(api::preview_handler))
        .route("/watermarked-images", get(api::watermarked_images_handler))
        .route("/images", get(api::images_handler))
        .route("/restore/{id}", post(api::restore_handler))
        .route("/watermark-all", post(api::watermark_all_handler))
        .merge(bulk_routes)
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            api::require_admin,
        ));

    let uploads_path = format!(
        "/{}",
        app_state.config.storage.uploads_url_path.trim_matches('/')
    );
    let uploads = ServeDir::new(&app_state.config.storage.uploads_directory);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest_service(&uploads_path, uploads)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let method = request.method();
                    let uri = request.uri();
                    let matched_path = request
                        .extensions()
                        .get::<axum::extract::MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::info_span!(
                        "http_request",
                        method = %method,
                        uri = %uri,
                        matched_path,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    let method = request.method();
                    let uri = request.uri();
                    let user_agent = request
                        .headers()
                        .get("user-agent")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("-");

                    tracing::info!(
                        target: "access_log",
                        method = %method,
                        path = %uri.path(),
                        query = ?uri.query(),
                        user_agent = %user_agent,
                        "request"
                    );
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        let status = response.status();
                        let size = response
                            .headers()
                            .get("content-length")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("-");

                        tracing::info!(
                            target: "access_log",
                            status = %status,
                            size = %size,
                            latency_ms = %latency.as_millis(),
                            "response"
                        );
                    },
                ),
        )
        .with_state(app_state)
}
