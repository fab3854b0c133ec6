//! Guest virtual-memory-area tracking and self-modifying-code coherence.
//!
//! The tracker mirrors the guest's view of its address space, attributes
//! file-backed mappings to their ELF images, and enforces W^X over ranges
//! the JIT has translated from: executable pages are downgraded to
//! read-only before translation, and the first guest write faults back in
//! here, invalidating the stale code and reopening the page for writing.

pub mod elf;
pub mod host;
pub mod interval;
pub mod prot;
pub mod resource;
pub mod tracker;

pub use host::{HostMem, RecordingHost};
pub use interval::IntervalSet;
pub use prot::{MapFlags, Prot};
pub use resource::{
    CodeCache, ExecutableFileInfo, ExecutableSection, MappedResource, Mrid, SpecialDev,
};
pub use tracker::{
    Backing, CodeInvalidator, CurrentBlockQuery, SegfaultOutcome, VmaEntry, VmaTracker,
};

/// Guest page size. The tracker is page-granular throughout.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round down to a page boundary.
#[must_use]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round up to a page boundary.
#[must_use]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
