use super::{DirEntry, EntryKind, Filesystem, not_found};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: SystemTime,
    mode: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, MemoryFile>,
    dirs: BTreeSet<PathBuf>,
    fail_copies_to: HashSet<PathBuf>,
    fail_writes_to: HashSet<PathBuf>,
}

impl MemoryState {
    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(parent) if parent.as_os_str().is_empty() => true,
            Some(parent) => self.dirs.contains(parent),
        }
    }

    fn insert_dirs(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }
}

/// In-memory filesystem with fault injection, for exercising the
/// watermark core without touching disk.
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    state: Mutex<MemoryState>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a file, creating parent directories as needed.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        let mut state = self.state();
        if let Some(parent) = path.parent() {
            state.insert_dirs(parent);
        }
        state.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: data.into(),
                modified: SystemTime::now(),
                mode: super::FS_CHMOD_FILE,
            },
        );
    }

    pub fn set_modified(&self, path: impl AsRef<Path>, modified: SystemTime) {
        if let Some(file) = self.state().files.get_mut(path.as_ref()) {
            file.modified = modified;
        }
    }

    /// Make every copy whose destination is `path` fail.
    pub fn fail_copies_to(&self, path: impl AsRef<Path>) {
        self.state()
            .fail_copies_to
            .insert(path.as_ref().to_path_buf());
    }

    /// Make every write (put or move) whose destination is `path` fail.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        self.state()
            .fail_writes_to
            .insert(path.as_ref().to_path_buf());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.fail_copies_to.clear();
        state.fail_writes_to.clear();
    }

    /// Paths and contents of every stored file.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, (Vec<u8>, SystemTime)> {
        self.state()
            .files
            .iter()
            .map(|(path, file)| (path.clone(), (file.data.clone(), file.modified)))
            .collect()
    }

    pub fn file_mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.state().files.get(path.as_ref()).map(|f| f.mode)
    }
}

impl Filesystem for MemoryFilesystem {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.state().files.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.state().dirs.contains(path)
    }

    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_copies_to.contains(to) || state.fail_writes_to.contains(to) {
            return Err(io::Error::other(format!(
                "Injected copy failure: {}",
                to.display()
            )));
        }
        let source = state.files.get(from).cloned().ok_or_else(|| not_found(from))?;
        if !state.parent_exists(to) {
            return Err(not_found(to));
        }
        if !overwrite && state.files.contains_key(to) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "Destination exists"));
        }
        state.files.insert(
            to.to_path_buf(),
            MemoryFile {
                data: source.data,
                modified: SystemTime::now(),
                mode: source.mode,
            },
        );
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_writes_to.contains(to) {
            return Err(io::Error::other(format!(
                "Injected write failure: {}",
                to.display()
            )));
        }
        if !state.files.contains_key(from) {
            return Err(not_found(from));
        }
        if !state.parent_exists(to) {
            return Err(not_found(to));
        }
        if !overwrite && state.files.contains_key(to) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "Destination exists"));
        }
        if let Some(file) = state.files.remove(from) {
            state.files.insert(to.to_path_buf(), file);
        }
        Ok(())
    }

    fn mkdir_p(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state();
        if state.files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("File exists: {}", path.display()),
            ));
        }
        state.insert_dirs(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state();
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }
        let has_children = state.files.keys().any(|p| p.parent() == Some(path))
            || state.dirs.iter().any(|p| p.parent() == Some(path));
        if has_children {
            return Err(io::Error::other(format!(
                "Directory not empty: {}",
                path.display()
            )));
        }
        state.dirs.remove(path);
        Ok(())
    }

    fn put_contents(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_writes_to.contains(path) {
            return Err(io::Error::other(format!(
                "Injected write failure: {}",
                path.display()
            )));
        }
        if !state.parent_exists(path) {
            return Err(not_found(path));
        }
        state.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: contents.to_vec(),
                modified: SystemTime::now(),
                mode: super::FS_CHMOD_FILE,
            },
        );
        Ok(())
    }

    fn get_contents(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.state()
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| not_found(path))
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut state = self.state();
        if state.dirs.contains(path) {
            return Ok(());
        }
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.mode = mode;
        Ok(())
    }

    fn dirlist(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let state = self.state();
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }

        let files = state
            .files
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, f)| DirEntry {
                name: file_name(p),
                path: p.clone(),
                kind: EntryKind::File,
                size: f.data.len() as u64,
                modified: f.modified,
            });
        let dirs = state
            .dirs
            .iter()
            .filter(|p| p.parent() == Some(path))
            .map(|p| DirEntry {
                name: file_name(p),
                path: p.clone(),
                kind: EntryKind::Directory,
                size: 0,
                modified: SystemTime::UNIX_EPOCH,
            });

        let mut entries: Vec<DirEntry> = files.chain(dirs).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
