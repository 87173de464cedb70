use crate::Config;
use crate::cleanup::TEMP_DIR_NAME;
use crate::watermark::{BACKUP_DIR_NAME, DEFAULT_WATERMARK_FILE};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("Uploads directory does not exist: {0}")]
    UploadsDirectoryMissing(PathBuf),

    #[error("Uploads directory is not accessible: {0}")]
    UploadsDirectoryUnreadable(std::io::Error),

    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StartupCheckError {
    /// Errors the server cannot run with.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            StartupCheckError::UploadsDirectoryMissing(_)
                | StartupCheckError::UploadsDirectoryUnreadable(_)
                | StartupCheckError::DirectoryCreationFailed { .. }
        )
    }
}

async fn ensure_directory(path: &Path, label: &str, errors: &mut Vec<StartupCheckError>) {
    if path.exists() {
        info!("{} directory exists: {:?}", label, path);
        return;
    }

    info!("{} directory does not exist, creating: {:?}", label, path);
    match tokio::fs::create_dir_all(path).await {
        Ok(()) => info!("{} directory created successfully", label),
        Err(e) => {
            error!("Failed to create {} directory: {}", label, e);
            errors.push(StartupCheckError::DirectoryCreationFailed {
                path: path.to_path_buf(),
                source: e,
            });
        }
    }
}

pub async fn perform_startup_checks(config: &Config) -> Result<(), Vec<StartupCheckError>> {
    let mut errors = Vec::new();

    info!("Performing startup checks...");

    let uploads = &config.storage.uploads_directory;
    if !uploads.exists() {
        error!("Uploads directory does not exist: {:?}", uploads);
        errors.push(StartupCheckError::UploadsDirectoryMissing(uploads.clone()));
    } else {
        match tokio::fs::read_dir(uploads).await {
            Ok(_) => info!("Uploads directory is accessible: {:?}", uploads),
            Err(e) => {
                error!("Uploads directory is not accessible: {}", e);
                errors.push(StartupCheckError::UploadsDirectoryUnreadable(e));
            }
        }

        ensure_directory(&uploads.join(BACKUP_DIR_NAME), "Backup", &mut errors).await;
        ensure_directory(&uploads.join(TEMP_DIR_NAME), "Temp", &mut errors).await;

        if !uploads.join(DEFAULT_WATERMARK_FILE).exists() {
            warn!(
                "No {} in the uploads directory; watermarks that cannot be resolved will fail",
                DEFAULT_WATERMARK_FILE
            );
        }
    }

    ensure_directory(&config.storage.data_directory, "Data", &mut errors).await;

    if errors.is_empty() {
        info!("All startup checks passed");
        Ok(())
    } else {
        error!("Startup checks failed with {} errors", errors.len());
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        let mut config = Config::default();
        config.storage.uploads_directory = root.join("uploads");
        config.storage.data_directory = root.join("data");
        config
    }

    #[tokio::test]
    async fn test_missing_uploads_is_critical() {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path());

        let errors = perform_startup_checks(&config).await.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_critical());
        // The data directory is still created
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn test_creates_working_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("uploads")).unwrap();
        let config = config_for(dir.path());

        perform_startup_checks(&config).await.unwrap();

        assert!(dir.path().join("uploads/WM_backups").is_dir());
        assert!(dir.path().join("uploads/WM-temp").is_dir());
        assert!(dir.path().join("data").is_dir());
    }
}
