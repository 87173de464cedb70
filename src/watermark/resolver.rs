use super::{WatermarkError, WatermarkSource};
use crate::attachments::SharedAttachmentStore;
use crate::filesystem::SharedFilesystem;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Used when nothing else matches.
pub const DEFAULT_WATERMARK_FILE: &str = "default-watermark.png";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CACHE_KEY_PREFIX: &str = "WM_watermark_path_";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub uploads_root: PathBuf,
    /// Directory that site-relative URLs map onto.
    pub site_root: PathBuf,
    /// Public origin of the site, e.g. `https://example.com`.
    pub site_url: Option<String>,
    /// URL path under which the uploads root is published.
    pub uploads_url_path: String,
}

#[derive(Debug, Clone)]
struct CachedPath {
    path: PathBuf,
    expires_at: Instant,
}

/// Turns a watermark identifier into a local file.
///
/// Lookup order for paths and URLs: the identifier as a path, the
/// identifier mapped from URL to path, its basename inside the uploads
/// root, then the default watermark in the uploads root.
pub struct WatermarkPathResolver {
    fs: SharedFilesystem,
    attachments: SharedAttachmentStore,
    config: ResolverConfig,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedPath>>,
}

impl WatermarkPathResolver {
    pub fn new(
        fs: SharedFilesystem,
        attachments: SharedAttachmentStore,
        config: ResolverConfig,
    ) -> Self {
        Self::with_ttl(fs, attachments, config, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(
        fs: SharedFilesystem,
        attachments: SharedAttachmentStore,
        config: ResolverConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            fs,
            attachments,
            config,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache_key(identifier: &str) -> String {
        let digest = Sha256::digest(identifier.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}{}", CACHE_KEY_PREFIX, hex)
    }

    pub fn resolve(&self, source: &WatermarkSource) -> Result<PathBuf, WatermarkError> {
        match source {
            WatermarkSource::Attachment(id) => self
                .attachments
                .attachment_path(*id)
                .filter(|path| self.fs.is_file(path))
                .ok_or_else(|| WatermarkError::WatermarkNotFound(id.to_string())),
            WatermarkSource::Location(identifier) => self.resolve_location(identifier),
        }
    }

    pub fn resolve_location(&self, identifier: &str) -> Result<PathBuf, WatermarkError> {
        let key = Self::cache_key(identifier);

        if let Some(path) = self.cached(&key) {
            trace!("Watermark path cache hit for {}", identifier);
            return Ok(path);
        }

        let path = self
            .lookup(identifier)
            .ok_or_else(|| WatermarkError::WatermarkNotFound(identifier.to_string()))?;

        debug!("Resolved watermark {} to {:?}", identifier, path);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CachedPath {
                    path: path.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        Ok(path)
    }

    /// Forget the cached resolution of one identifier.
    pub fn invalidate(&self, identifier: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::cache_key(identifier));
    }

    /// Forget every cached resolution that points at one of `paths`.
    /// Returns how many entries were dropped.
    pub fn invalidate_paths(&self, paths: &[PathBuf]) -> usize {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|_, entry| !paths.contains(&entry.path));
        before - cache.len()
    }

    pub fn clear(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        debug!("Clearing {} cached watermark paths", cache.len());
        cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn cached(&self, key: &str) -> Option<PathBuf> {
        let entry = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;

        if entry.expires_at > Instant::now() && self.fs.is_file(&entry.path) {
            return Some(entry.path);
        }

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        None
    }

    fn lookup(&self, identifier: &str) -> Option<PathBuf> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }

        let as_given = PathBuf::from(identifier);
        if as_given.is_absolute() && self.fs.is_file(&as_given) {
            return Some(as_given);
        }

        if let Some(path) = self.url_to_path(identifier).filter(|p| self.fs.is_file(p)) {
            return Some(path);
        }

        let basename = identifier
            .rsplit(['/', '\\'])
            .next()
            .map(|name| name.split(['?', '#']).next().unwrap_or(name))
            .filter(|name| !name.is_empty() && *name != "." && *name != "..");
        if let Some(name) = basename {
            let decoded = urlencoding::decode(name)
                .map(|n| n.into_owned())
                .unwrap_or_else(|_| name.to_string());
            if !decoded.contains(['/', '\\']) && decoded != ".." {
                let candidate = self.config.uploads_root.join(decoded);
                if self.fs.is_file(&candidate) {
                    return Some(candidate);
                }
            }
        }

        let fallback = self.config.uploads_root.join(DEFAULT_WATERMARK_FILE);
        if self.fs.is_file(&fallback) {
            debug!("Using default watermark for {}", identifier);
            return Some(fallback);
        }

        None
    }

    /// Map a site URL (absolute or site-relative) to a local path.
    pub fn url_to_path(&self, identifier: &str) -> Option<PathBuf> {
        let url_path = match url::Url::parse(identifier) {
            Ok(url) => {
                if let Some(site_url) = &self.config.site_url {
                    let site = site_url.trim_end_matches('/');
                    if !identifier.starts_with(site) {
                        return None;
                    }
                }
                if !matches!(url.scheme(), "http" | "https") {
                    return None;
                }
                url.path().to_string()
            }
            Err(_) if identifier.starts_with('/') => identifier
                .split(['?', '#'])
                .next()
                .unwrap_or(identifier)
                .to_string(),
            Err(_) => return None,
        };

        let decoded = urlencoding::decode(&url_path).ok()?.into_owned();
        let relative = Path::new(&decoded);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }

        let uploads_prefix = format!("/{}", self.config.uploads_url_path.trim_matches('/'));
        let path = match decoded.strip_prefix(&uploads_prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => self
                .config
                .uploads_root
                .join(rest.trim_start_matches('/')),
            _ => self.config.site_root.join(decoded.trim_start_matches('/')),
        };
        Some(path)
    }
}
