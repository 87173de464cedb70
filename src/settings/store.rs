use super::SettingsError;
use crate::filesystem::SharedFilesystem;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Key/value persistence for plugin settings.
pub trait SettingsStore: Send + Sync {
    fn get_setting(&self, name: &str) -> Option<Value>;

    fn update_setting(&self, name: &str, value: Value) -> Result<bool, SettingsError>;

    fn delete_setting(&self, name: &str) -> Result<bool, SettingsError>;
}

/// Settings table kept as a single JSON object on disk, with a
/// read-through cache that every write invalidates.
pub struct JsonSettingsStore {
    fs: SharedFilesystem,
    path: PathBuf,
    cache: RwLock<Option<BTreeMap<String, Value>>>,
}

impl JsonSettingsStore {
    pub fn new(fs: SharedFilesystem, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            cache: RwLock::new(None),
        }
    }

    fn read_table(&self) -> Result<BTreeMap<String, Value>, SettingsError> {
        if !self.fs.is_file(&self.path) {
            return Ok(BTreeMap::new());
        }
        let json = self.fs.get_contents(&self.path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn cached_table(&self) -> BTreeMap<String, Value> {
        if let Some(table) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return table.clone();
        }

        let table = match self.read_table() {
            Ok(table) => table,
            Err(e) => {
                warn!("Failed to read settings from {:?}: {}", self.path, e);
                return BTreeMap::new();
            }
        };
        debug!("Settings cache filled with {} entries", table.len());
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(table.clone());
        table
    }

    fn write_table(&self, table: &BTreeMap<String, Value>) -> Result<(), SettingsError> {
        let result = serde_json::to_vec_pretty(table)
            .map_err(SettingsError::from)
            .and_then(|json| Ok(self.fs.put_contents(&self.path, &json)?));
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_setting(&self, name: &str) -> Option<Value> {
        self.cached_table().get(name).cloned()
    }

    fn update_setting(&self, name: &str, value: Value) -> Result<bool, SettingsError> {
        let mut table = self.read_table()?;
        table.insert(name.to_string(), value);
        self.write_table(&table)?;
        Ok(true)
    }

    fn delete_setting(&self, name: &str) -> Result<bool, SettingsError> {
        let mut table = self.read_table()?;
        if table.remove(name).is_none() {
            return Ok(false);
        }
        self.write_table(&table)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{Filesystem, MemoryFilesystem};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;

    fn store() -> (Arc<MemoryFilesystem>, JsonSettingsStore) {
        let fs = Arc::new(MemoryFilesystem::new());
        fs.mkdir_p(Path::new("/data")).unwrap();
        let store = JsonSettingsStore::new(fs.clone(), PathBuf::from("/data/settings.json"));
        (fs, store)
    }

    #[test]
    fn test_missing_setting_is_none() {
        let (_fs, store) = store();
        assert!(store.get_setting("watermark_settings").is_none());
    }

    #[test]
    fn test_update_then_read() {
        let (_fs, store) = store();
        store
            .update_setting("watermark_settings", json!({"opacity": 30}))
            .unwrap();
        assert_eq!(
            store.get_setting("watermark_settings").unwrap()["opacity"],
            30
        );
    }

    #[test]
    fn test_cache_serves_reads_until_write() {
        let (fs, store) = store();
        store.update_setting("a", json!(1)).unwrap();
        assert_eq!(store.get_setting("a"), Some(json!(1)));

        // Out-of-band edit is not visible while the cache is warm
        fs.put_contents(Path::new("/data/settings.json"), br#"{"a": 2}"#)
            .unwrap();
        assert_eq!(store.get_setting("a"), Some(json!(1)));

        // A write invalidates the cache
        store.update_setting("b", json!(true)).unwrap();
        assert_eq!(store.get_setting("a"), Some(json!(2)));
        assert_eq!(store.get_setting("b"), Some(json!(true)));
    }

    #[test]
    fn test_delete_setting() {
        let (_fs, store) = store();
        store.update_setting("legacy", json!({})).unwrap();
        assert!(store.delete_setting("legacy").unwrap());
        assert!(!store.delete_setting("legacy").unwrap());
        assert!(store.get_setting("legacy").is_none());
    }

    #[test]
    fn test_failed_write_reports_error() {
        let (fs, store) = store();
        fs.fail_writes_to("/data/settings.json");
        assert!(store.update_setting("a", json!(1)).is_err());
    }
}
