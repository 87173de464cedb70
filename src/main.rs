use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use watermark_manager::{
    AppState, Config, build_state, cleanup::CleanupJob, create_router,
    filesystem::LocalFilesystem, startup_checks,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Global options that apply to all commands
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the web server (default if no command specified)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Automatically quit after specified number of seconds (useful for testing)
        #[arg(long)]
        quit_after: Option<u64>,
    },

    /// Watermark one image with the saved settings
    Apply { id: u64 },

    /// Put back the original files of a watermarked image
    Restore { id: u64 },

    /// Watermark every image that has no watermark yet
    WatermarkAll,

    /// Remove expired temp files, abandoned staged files and orphaned backups
    Cleanup,

    /// Add a file under the uploads directory to the media library
    Import {
        /// Path relative to the uploads directory
        file: String,

        #[arg(short, long)]
        title: Option<String>,
    },

    /// Delete an image from the media library along with its backups
    Remove { id: u64 },
}

const LOG_FILE_PREFIX: &str = "watermark-manager";

/// Daily log files in `dir`, keeping at most `max_files` of them.
fn log_file_appender(
    dir: &Path,
    max_files: usize,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(dir)
}

fn init_logging(
    level: &str,
    log_directory: Option<&Path>,
    log_max_files: usize,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let (file_layer, guard) = match log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = log_file_appender(dir, log_max_files)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

fn load_config(path: &Path) -> Result<(Config, bool), Box<dyn std::error::Error>> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok((toml_edit::de::from_str::<Config>(&content)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config)?;
    let _log_guard = init_logging(
        &cli.log_level,
        config.app.log_directory.as_deref(),
        config.app.log_max_files,
    )?;
    if found {
        info!("Configuration loaded from: {:?}", cli.config);
    } else {
        info!("Config file not found at {:?}, using defaults", cli.config);
    }

    match cli.command {
        Some(Commands::Serve {
            port,
            host,
            quit_after,
        }) => run_server(config, port, host, quit_after).await,
        None => {
            // Default to serve command if no subcommand specified
            run_server(config, None, None, None).await
        }
        Some(command) => run_command(config, command).await,
    }
}

async fn run_command(config: Config, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let state = build_state(config, Arc::new(LocalFilesystem::new()), shutdown.clone())?;

    // Let Ctrl+C stop long loops between images
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current image");
            signal_token.cancel();
        }
    });

    tokio::task::spawn_blocking(move || execute(&state, command))
        .await?
        .map_err(|e| -> Box<dyn std::error::Error> { e })
}

type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

fn execute(state: &AppState, command: Commands) -> CommandResult {
    match command {
        Commands::Apply { id } => {
            let options = state.settings.get_settings().to_options();
            let sizes = state.watermark.apply_watermark(id, &options)?;
            println!("Watermarked image {} ({})", id, sizes.join(", "));
        }
        Commands::Restore { id } => {
            let sizes = state.watermark.restore_original(id)?;
            println!("Restored image {} ({})", id, sizes.join(", "));
        }
        Commands::WatermarkAll => {
            let options = state.settings.get_settings().to_options();
            let result = state
                .watermark
                .watermark_all_images(&options, &state.shutdown)?;
            println!("{}", result.summary());
            for error in &result.errors {
                eprintln!("  {}", error);
            }
        }
        Commands::Cleanup => {
            let report = state.cleanup.run();
            println!(
                "Removed {} temp file(s), {} staged file(s), {} orphaned backup dir(s)",
                report.temp_files, report.staged_files, report.backup_dirs
            );
        }
        Commands::Import { file, title } => {
            let title = title.unwrap_or_else(|| {
                Path::new(&file)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.clone())
            });
            let id = state.library.register_file(&file, &title)?;
            println!("Imported {} as image {}", file, id);

            let settings = state.settings.get_settings();
            if state.watermark.process_upload(id, &settings)? {
                println!("Watermarked image {} automatically", id);
            }
        }
        Commands::Remove { id } => {
            state.watermark.cleanup(id);
            state.library.remove(id)?;
            println!("Removed image {}", id);
        }
        Commands::Serve { .. } => return Err("serve is not a one-off command".into()),
    }
    Ok(())
}

async fn run_server(
    config: Config,
    port: Option<u16>,
    host: Option<String>,
    quit_after: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let host = host.unwrap_or(config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    info!("Starting {} server", config.app.name);
    info!("Uploads directory: {:?}", config.storage.uploads_directory);
    info!("Data directory: {:?}", config.storage.data_directory);

    // Perform startup checks
    match startup_checks::perform_startup_checks(&config).await {
        Ok(()) => info!("All startup checks passed"),
        Err(errors) => {
            for error in &errors {
                tracing::error!("Startup check failed: {}", error);
            }
            if errors.iter().any(|e| e.is_critical()) {
                tracing::error!("Critical startup check failed, exiting");
                return Err("Critical startup check failed".into());
            }
            tracing::warn!("Non-critical startup checks failed, continuing");
        }
    }

    let shutdown = CancellationToken::new();
    let state = build_state(
        config.clone(),
        Arc::new(LocalFilesystem::new()),
        shutdown.clone(),
    )?;

    // Settings saved by older installs
    let settings = state.settings.clone();
    match tokio::task::spawn_blocking(move || settings.migrate_from_legacy()).await? {
        Ok(true) => info!("Legacy settings migrated"),
        Ok(false) => {}
        Err(e) => tracing::warn!("Failed to migrate legacy settings: {}", e),
    }

    if config.cleanup.enabled && config.cleanup.interval_hours > 0 {
        info!(
            "Starting background cleanup every {} hours",
            config.cleanup.interval_hours
        );
        CleanupJob::start_background(
            state.cleanup.clone(),
            Duration::from_secs(config.cleanup.interval_hours * 60 * 60),
            shutdown.clone(),
        );
    }

    let app = create_router(state);

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Add ConnectInfo layer to track client IPs
    let app = app.into_make_service_with_connect_info::<SocketAddr>();

    let server = axum::serve(listener, app);
    let graceful = server.with_graceful_shutdown(shutdown_signal(quit_after, shutdown.clone()));

    if let Err(e) = graceful.await {
        tracing::error!("Server error: {}", e);
    }

    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal(quit_after: Option<u64>, shutdown: CancellationToken) {
    use tokio::signal;
    use tokio::time::sleep;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let quit_timer = async {
        if let Some(seconds) = quit_after {
            info!(
                "Server will automatically shut down after {} seconds",
                seconds
            );
            sleep(Duration::from_secs(seconds)).await;
            info!("Quit timer expired, shutting down");
        } else {
            std::future::pending::<()>().await
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        },
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        },
        _ = quit_timer => {},
    }

    // Stop bulk loops and the cleanup job
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn log_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(LOG_FILE_PREFIX))
            .collect()
    }

    #[test]
    fn test_log_files_are_pruned() {
        let dir = TempDir::new().unwrap();
        for day in 1..=7 {
            let name = format!("{}.2024-01-0{}.log", LOG_FILE_PREFIX, day);
            std::fs::write(dir.path().join(name), b"old\n").unwrap();
        }

        let mut appender = log_file_appender(dir.path(), 5).unwrap();
        appender.write_all(b"started\n").unwrap();
        appender.flush().unwrap();

        // Four old files survive next to today's
        let files = log_files(dir.path());
        assert_eq!(files.len(), 5, "kept {:?}", files);
    }

    #[test]
    fn test_default_config_keeps_five_log_files() {
        assert_eq!(Config::default().app.log_max_files, 5);
    }
}
