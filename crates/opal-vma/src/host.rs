//! Host memory-protection seam.
//!
//! The tracker only ever needs to change protections; it does so through
//! this trait so the W^X state machine is testable with a recording fake.

use std::io;
use std::sync::Mutex;

use crate::Prot;

/// Host-side page protection control.
pub trait HostMem {
    fn protect(&self, addr: u64, len: u64, prot: Prot) -> io::Result<()>;
}

/// Records every protection change; the test double.
#[derive(Debug, Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<(u64, u64, Prot)>>,
}

impl RecordingHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(u64, u64, Prot)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl HostMem for RecordingHost {
    fn protect(&self, addr: u64, len: u64, prot: Prot) -> io::Result<()> {
        self.calls.lock().unwrap().push((addr, len, prot));
        Ok(())
    }
}

/// Real `mprotect`-backed implementation.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct LibcHost;

#[cfg(target_os = "linux")]
impl HostMem for LibcHost {
    fn protect(&self, addr: u64, len: u64, prot: Prot) -> io::Result<()> {
        let mut bits = 0;
        if prot.readable() {
            bits |= libc::PROT_READ;
        }
        if prot.writable() {
            bits |= libc::PROT_WRITE;
        }
        if prot.executable() {
            bits |= libc::PROT_EXEC;
        }
        // Safety: the caller owns the mapping being reprotected; the kernel
        // validates the range.
        let rv = unsafe { libc::mprotect(addr as *mut libc::c_void, len as usize, bits) };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
