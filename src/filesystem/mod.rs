// Filesystem module - narrow file operations the watermark core depends on
mod local;
mod memory;

pub use local::LocalFilesystem;
pub use memory::MemoryFilesystem;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Permission bits applied to created directories.
pub const FS_CHMOD_DIR: u32 = 0o755;
/// Permission bits applied to written or copied files.
pub const FS_CHMOD_FILE: u32 = 0o644;

pub type SharedFilesystem = Arc<dyn Filesystem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// All file access of the watermark core goes through this trait so the
/// backup, restore and compositing paths can run against an in-memory fake.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Copy a file. With `overwrite == false` an existing destination is an error.
    fn copy(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()>;

    /// Rename a file, replacing the destination when `overwrite` is set.
    fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> io::Result<()>;

    /// Create a directory and all missing parents.
    fn mkdir_p(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> io::Result<()>;

    fn put_contents(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn get_contents(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// List the direct children of a directory, without `.` and `..`.
    fn dirlist(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn delete(&self, path: &Path) -> io::Result<()>;
}

pub(crate) fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("No such file or directory: {}", path.display()),
    )
}
