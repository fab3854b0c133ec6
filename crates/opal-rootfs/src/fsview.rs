//! Filesystem access seam for the redirector.
//!
//! Prefix aliasing and symlink chasing need a few stat-shaped queries; the
//! trait keeps them testable without touching the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Identity facts used by the aliased-only prefix check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub size: u64,
    pub inode: u64,
    pub mode: u32,
}

pub trait FsView {
    /// `lstat`-style identity; `None` when the path does not exist.
    fn identity(&self, path: &Path) -> Option<FileIdentity>;
    /// Whether the path itself is a symlink.
    fn is_symlink(&self, path: &Path) -> bool;
    /// Symlink target, if the path is a symlink.
    fn read_link(&self, path: &Path) -> Option<PathBuf>;
    /// Whether a regular file or directory exists at the path.
    fn exists(&self, path: &Path) -> bool;
}

/// Host-backed implementation.
#[derive(Debug, Default)]
pub struct RealFs;

impl FsView for RealFs {
    fn identity(&self, path: &Path) -> Option<FileIdentity> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Some(FileIdentity {
                size: meta.len(),
                inode: meta.ino(),
                mode: meta.mode(),
            })
        }
        #[cfg(not(unix))]
        {
            Some(FileIdentity {
                size: meta.len(),
                inode: 0,
                mode: 0,
            })
        }
    }

    fn is_symlink(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        std::fs::read_link(path).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory filesystem for the test suite.
#[derive(Debug, Default)]
pub struct FakeFs {
    files: HashMap<PathBuf, FileIdentity>,
    links: HashMap<PathBuf, PathBuf>,
}

impl FakeFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>, identity: FileIdentity) {
        self.files.insert(path.into(), identity);
    }

    pub fn add_plain(&mut self, path: impl Into<PathBuf>) {
        self.files.insert(
            path.into(),
            FileIdentity {
                size: 0,
                inode: 0,
                mode: 0o644,
            },
        );
    }

    pub fn add_link(&mut self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        let path = path.into();
        self.links.insert(path.clone(), target.into());
        self.files.insert(
            path,
            FileIdentity {
                size: 0,
                inode: 0,
                mode: 0o777,
            },
        );
    }
}

impl FsView for FakeFs {
    fn identity(&self, path: &Path) -> Option<FileIdentity> {
        self.files.get(path).copied()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.links.contains_key(path)
    }

    fn read_link(&self, path: &Path) -> Option<PathBuf> {
        self.links.get(path).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}
