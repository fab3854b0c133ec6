//! Guest filesystem view: RootFS overlay, thunk overlays, self-exe
//! interception and synthesized proc files.
//!
//! Resolution order for any guest path: thunk overlay, then the RootFS
//! overlay, then the host filesystem. Paths that already point into the
//! RootFS are stripped first so host paths never leak back to the guest
//! through `readlink` or `/proc/self/exe`.

pub mod emulated;
pub mod fsview;
pub mod redirect;

#[cfg(target_os = "linux")]
pub mod memfd;

pub use emulated::EmulatedFiles;
pub use fsview::{FakeFs, FileIdentity, FsView};
pub use redirect::FileRedirector;
