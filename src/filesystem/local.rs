use super::{DirEntry, EntryKind, Filesystem};
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Disk-backed filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        Self
    }
}

impl Filesystem for LocalFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()> {
        if !overwrite && to.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Destination exists: {}", to.display()),
            ));
        }
        std::fs::copy(from, to)?;
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()> {
        if !overwrite && to.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Destination exists: {}", to.display()),
            ));
        }
        std::fs::rename(from, to)
    }

    fn mkdir_p(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn put_contents(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn get_contents(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    #[cfg(unix)]
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn chmod(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn dirlist(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                kind,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_respects_overwrite_flag() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new();
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs.put_contents(&a, b"first").unwrap();
        fs.put_contents(&b, b"second").unwrap();

        assert!(fs.copy(&a, &b, false).is_err());
        fs.copy(&a, &b, true).unwrap();
        assert_eq!(fs.get_contents(&b).unwrap(), b"first");
    }

    #[test]
    fn test_dirlist_and_rmdir() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new();
        let dir = temp_dir.path().join("nested/dir");
        fs.mkdir_p(&dir).unwrap();
        fs.put_contents(&dir.join("one.png"), b"1").unwrap();

        let entries = fs.dirlist(&dir).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "one.png");
        assert!(entries[0].is_file());

        // Non-empty directories are not removed
        assert!(fs.rmdir(&dir).is_err());
        fs.delete(&dir.join("one.png")).unwrap();
        fs.rmdir(&dir).unwrap();
        assert!(!fs.exists(&dir));
    }
}
