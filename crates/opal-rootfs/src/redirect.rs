//! The path rewriter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fsview::FsView;

/// Guest filesystem redirector. One per process; construction captures the
/// RootFS location, the guest executable path and the thunk overlay table.
#[derive(Debug, Clone)]
pub struct FileRedirector {
    rootfs: PathBuf,
    /// Guest path of the running executable, reported for self-exe reads.
    guest_exe: PathBuf,
    pid: u32,
    /// Guest library path -> host thunk stub path. Wins over the RootFS.
    thunk_overlays: BTreeMap<PathBuf, PathBuf>,
}

impl FileRedirector {
    #[must_use]
    pub fn new(rootfs: impl Into<PathBuf>, guest_exe: impl Into<PathBuf>, pid: u32) -> Self {
        let mut rootfs: PathBuf = rootfs.into();
        // Normalize away a trailing separator so prefix math is exact.
        if let Some(stripped) = rootfs
            .to_str()
            .and_then(|s| s.strip_suffix('/'))
            .filter(|s| !s.is_empty())
        {
            rootfs = PathBuf::from(stripped);
        }
        FileRedirector {
            rootfs,
            guest_exe: guest_exe.into(),
            pid,
            thunk_overlays: BTreeMap::new(),
        }
    }

    /// Register a thunk overlay: opening `guest_path` yields the host-side
    /// stub library instead.
    pub fn add_thunk_overlay(
        &mut self,
        guest_path: impl Into<PathBuf>,
        host_stub: impl Into<PathBuf>,
    ) {
        self.thunk_overlays.insert(guest_path.into(), host_stub.into());
    }

    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Length of the RootFS prefix if `path` points into the RootFS, else 0.
    /// With `aliased_only`, additionally require that the RootFS file and
    /// the corresponding host file are the same object (size/inode/mode),
    /// so overlay-private files are not mistaken for aliases.
    #[must_use]
    pub fn rootfs_prefix_len(&self, fs: &dyn FsView, path: &str, aliased_only: bool) -> usize {
        if path.len() < 2 || !path.starts_with('/') {
            return 0;
        }
        let Some(rootfs) = self.rootfs.to_str() else {
            return 0;
        };
        if rootfs.is_empty() {
            return 0;
        }
        let len = rootfs.len();
        if len > path.len()
            || !path.starts_with(rootfs)
            || (path.len() > len && path.as_bytes()[len] != b'/')
        {
            return 0;
        }

        if aliased_only {
            let Some(rootfs_id) = fs.identity(Path::new(path)) else {
                debug!(path, "aliased-prefix check: RootFS path missing");
                return 0;
            };
            let host_side = &path[len..];
            let host_path = if host_side.is_empty() { "/" } else { host_side };
            let Some(host_id) = fs.identity(Path::new(host_path)) else {
                return 0;
            };
            // st_dev is not compared: an overlayfs RootFS changes it.
            if rootfs_id != host_id {
                return 0;
            }
        }
        len
    }

    /// Strip the RootFS prefix from an absolute path (collapsing to `/` if
    /// the path *is* the RootFS), so host locations never leak outward.
    #[must_use]
    pub fn strip_rootfs_prefix(&self, fs: &dyn FsView, path: &str) -> String {
        let prefix = self.rootfs_prefix_len(fs, path, false);
        if prefix == 0 {
            return path.to_owned();
        }
        if prefix == path.len() {
            return "/".to_owned();
        }
        path[prefix..].to_owned()
    }

    /// The host path aliased by a RootFS-absolute path, if any.
    #[must_use]
    pub fn host_path(&self, fs: &dyn FsView, path: &str, aliased_only: bool) -> Option<String> {
        let prefix = self.rootfs_prefix_len(fs, path, aliased_only);
        if prefix == 0 {
            return None;
        }
        let rest = &path[prefix..];
        Some(if rest.is_empty() { "/".to_owned() } else { rest.to_owned() })
    }

    /// Resolve a guest absolute path through the overlays: thunk overlay
    /// first, then the RootFS (chasing absolute symlinks within it).
    /// Returns `None` when the path should fall through to the host.
    #[must_use]
    pub fn emulated_path(
        &self,
        fs: &dyn FsView,
        path: &str,
        follow_symlinks: bool,
    ) -> Option<PathBuf> {
        if !path.starts_with('/') || path == "/" {
            return None;
        }
        if let Some(stub) = self.thunk_overlays.get(Path::new(path)) {
            return Some(stub.clone());
        }
        if self.rootfs.as_os_str().is_empty() {
            return None;
        }

        let mut resolved = join_rootfs(&self.rootfs, path);
        if follow_symlinks {
            while fs.is_symlink(&resolved) {
                let Some(target) = fs.read_link(&resolved) else {
                    break;
                };
                // A target that itself points into the RootFS is stripped
                // first (proc-style symlinks).
                let target = target
                    .to_str()
                    .map(|s| self.strip_rootfs_prefix(fs, s))
                    .unwrap_or_default();
                if target.len() > 1 && target.starts_with('/') {
                    resolved = join_rootfs(&self.rootfs, &target);
                } else {
                    break;
                }
            }
        }
        Some(resolved)
    }

    /// Intercept the self-exe proc paths, reporting the guest executable.
    #[must_use]
    pub fn get_self(&self, path: &str) -> Option<&Path> {
        let pid_exe = format!("/proc/{}/exe", self.pid);
        if path == "/proc/self/exe" || path == "/proc/thread-self/exe" || path == pid_exe {
            Some(&self.guest_exe)
        } else {
            None
        }
    }

    /// Full guest-visible resolution of one absolute path. Idempotent:
    /// redirecting a redirected path yields it unchanged.
    #[must_use]
    pub fn redirect(&self, fs: &dyn FsView, path: &str) -> PathBuf {
        // Collapse RootFS-absolute inputs back to guest paths first.
        let guest_path = self.strip_rootfs_prefix(fs, path);

        if let Some(exe) = self.get_self(&guest_path) {
            return exe.to_path_buf();
        }
        if let Some(overlay) = self.emulated_path(fs, &guest_path, true) {
            if fs.exists(&overlay) {
                return overlay;
            }
        }
        PathBuf::from(guest_path)
    }

    /// Creation-style opens bypass the emulation layer entirely (the guest
    /// must never write through a sealed emulated file).
    #[must_use]
    pub fn open_bypasses_emulation(flags: OpenIntent) -> bool {
        flags.create || flags.write_only || flags.append
    }
}

/// Subset of open(2) intent the redirector cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenIntent {
    pub create: bool,
    pub write_only: bool,
    pub append: bool,
}

fn join_rootfs(rootfs: &Path, absolute_guest_path: &str) -> PathBuf {
    let mut joined = rootfs.as_os_str().to_owned();
    joined.push(absolute_guest_path);
    PathBuf::from(joined)
}
