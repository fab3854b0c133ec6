//! Sealed in-memory files backing the emulated proc entries.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

/// Create a sealed memfd holding `content`. The guest can read and mmap it
/// but can never grow, shrink or rewrite it.
pub fn sealed_memfd(name: &str, content: &[u8]) -> io::Result<OwnedFd> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    // Safety: memfd_create takes a name and flags; we own the returned fd.
    let fd = unsafe {
        libc::memfd_create(
            c_name.as_ptr(),
            libc::MFD_ALLOW_SEALING | libc::MFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: fd is a freshly created, owned descriptor.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut written = 0;
    while written < content.len() {
        // Safety: writing from a valid buffer to our fd.
        let rv = unsafe {
            libc::write(
                fd,
                content[written..].as_ptr().cast(),
                content.len() - written,
            )
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        written += rv as usize;
    }

    // Safety: plain fcntl on our fd.
    let rv = unsafe {
        libc::fcntl(
            fd,
            libc::F_ADD_SEALS,
            libc::F_SEAL_GROW | libc::F_SEAL_SHRINK | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL,
        )
    };
    if rv != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn memfd_round_trips_content_and_rejects_writes() {
        let fd = sealed_memfd("opal-test", b"hello world").expect("memfd");

        let mut file = std::fs::File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello world");

        // Sealed: writes must fail.
        let rv = unsafe { libc::write(file.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert!(rv < 0);
    }
}
