//! Protection and mapping flag bit sets.

use bitflags::bitflags;

bitflags! {
    /// Page protection bits, guest view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    /// From `mmap`/`mprotect` style bits (PROT_READ = 1, PROT_WRITE = 2,
    /// PROT_EXEC = 4).
    #[must_use]
    pub fn from_bits_mmap(prot: i32) -> Prot {
        let mut out = Prot::empty();
        if prot & 0x1 != 0 {
            out |= Prot::READ;
        }
        if prot & 0x2 != 0 {
            out |= Prot::WRITE;
        }
        if prot & 0x4 != 0 {
            out |= Prot::EXEC;
        }
        out
    }

    #[must_use]
    pub fn readable(self) -> bool {
        self.contains(Prot::READ)
    }

    #[must_use]
    pub fn writable(self) -> bool {
        self.contains(Prot::WRITE)
    }

    #[must_use]
    pub fn executable(self) -> bool {
        self.contains(Prot::EXEC)
    }

    /// A range mapped writable *and* executable is the SMC hot spot.
    #[must_use]
    pub fn is_rwx(self) -> bool {
        self.contains(Prot::WRITE | Prot::EXEC)
    }
}

bitflags! {
    /// Mapping attributes carried on each VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        const SHARED = 1 << 0;
        const ANONYMOUS = 1 << 1;
    }
}

impl MapFlags {
    #[must_use]
    pub fn shared(self) -> bool {
        self.contains(MapFlags::SHARED)
    }

    #[must_use]
    pub fn anonymous(self) -> bool {
        self.contains(MapFlags::ANONYMOUS)
    }
}
