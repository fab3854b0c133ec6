//! Mapped-resource identity and metadata.
//!
//! A resource is the backing object behind one or more VMAs: a regular
//! file, a shared-anonymous allocation, or a SysV shm segment. File-backed
//! ELF images additionally carry their program headers so later non-header
//! mappings can be attributed to the right base address.

use std::path::PathBuf;
use std::sync::Arc;

use crate::elf::Phdr;

/// Device namespace for resource ids. Real files use their `st_dev`;
/// shared-anonymous and shm mappings get synthesized devices so unrelated
/// mappings can never be conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpecialDev {
    /// Real device number from the filesystem.
    Dev(u64),
    /// Shared-anonymous; the id is a process-unique counter.
    AnonShared,
    /// SysV shared memory; the id is the shmid.
    Shm,
}

/// Resource key: `(device, inode-or-counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mrid {
    pub dev: SpecialDev,
    pub id: u64,
}

/// Identity of an executable file for AOT-cache addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableFileInfo {
    pub filename: PathBuf,
    /// Content id from the code-cache interface
    /// (`compute_code_map_id(filename, fd)`).
    pub file_id: String,
}

/// One executable section of a mapped file, as handed to the AOT cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSection {
    pub file: ExecutableFileInfo,
    /// Base virtual address of the owning image instance.
    pub image_base: u64,
    /// Guest range of this section.
    pub start: u64,
    pub end: u64,
}

/// Consumed interface of the persistent code cache. The tracker hands over
/// executable sections as they appear; the cache decides whether previously
/// translated code exists for them.
pub trait CodeCache {
    /// Content-address a file for cache lookup.
    fn compute_code_map_id(&self, filename: &std::path::Path) -> String;
    /// Offer a mapped executable section; returns whether cached code was
    /// loaded for it.
    fn load_data(&self, section: &ExecutableSection) -> bool;
}

/// One backing resource, shared by every VMA that maps it.
#[derive(Debug)]
pub struct MappedResource {
    pub mrid: Mrid,
    /// Present for executable regular files.
    pub file: Option<ExecutableFileInfo>,
    /// ELF program headers captured from the header mapping; empty for
    /// non-ELF files.
    pub phdrs: Vec<Phdr>,
    /// Fixed length for shm segments (shmdt has no length argument).
    pub shm_length: Option<u64>,
}

impl MappedResource {
    #[must_use]
    pub fn anonymous_shared(counter: u64) -> Arc<Self> {
        Arc::new(MappedResource {
            mrid: Mrid {
                dev: SpecialDev::AnonShared,
                id: counter,
            },
            file: None,
            phdrs: Vec::new(),
            shm_length: None,
        })
    }

    #[must_use]
    pub fn shm(shmid: u64, length: u64) -> Arc<Self> {
        Arc::new(MappedResource {
            mrid: Mrid {
                dev: SpecialDev::Shm,
                id: shmid,
            },
            file: None,
            phdrs: Vec::new(),
            shm_length: Some(length),
        })
    }
}
