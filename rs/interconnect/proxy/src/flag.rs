//! The failure flag shared with the host system.
//!
//! When the peer listener cannot bind or listen, the rest of the database
//! needs to learn about it without talking to the proxy process. The flag is
//! one 32-bit word in a file-backed shared mapping: the proxy stores into
//! it, any other process mapping the same file reads it. Tests and embedded
//! instances use the process-local variant.

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

const FLAG_LEN: usize = std::mem::size_of::<u32>();

pub struct FailureFlag {
    inner: Inner,
}

enum Inner {
    Local(AtomicU32),
    Shared {
        ptr: *mut c_void,
        // Keeps the backing fd alive for the lifetime of the mapping.
        _file: File,
    },
}

// The shared variant only ever touches the mapping through an AtomicU32.
unsafe impl Send for FailureFlag {}
unsafe impl Sync for FailureFlag {}

impl FailureFlag {
    /// A process-local flag, for tests and embedded instances.
    pub fn local() -> Self {
        Self {
            inner: Inner::Local(AtomicU32::new(0)),
        }
    }

    /// Maps the flag from `path`, creating the file if needed. Other
    /// processes mapping the same path observe stores immediately.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(FLAG_LEN as u64)?;
        // SAFETY: the fd is valid and stays open for the lifetime of the
        // mapping; the mapping is exactly one u32, page aligned by mmap.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                FLAG_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self {
            inner: Inner::Shared { ptr, _file: file },
        })
    }

    fn word(&self) -> &AtomicU32 {
        match &self.inner {
            Inner::Local(word) => word,
            // SAFETY: the mapping outlives `self` and is only accessed as an
            // AtomicU32.
            Inner::Shared { ptr, .. } => unsafe { &*((*ptr) as *const AtomicU32) },
        }
    }

    pub fn set(&self, failed: bool) {
        self.word().store(failed as u32, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.word().load(Ordering::SeqCst) != 0
    }
}

impl Drop for FailureFlag {
    fn drop(&mut self) {
        if let Inner::Shared { ptr, .. } = &self.inner {
            // SAFETY: `ptr` came from mmap with FLAG_LEN and is unmapped
            // exactly once.
            let _ = unsafe { munmap(*ptr, FLAG_LEN) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_flag_toggles() {
        let flag = FailureFlag::local();
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
        flag.set(false);
        assert!(!flag.get());
    }

    #[test]
    fn shared_flag_is_visible_through_a_second_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listener.flag");
        let writer = FailureFlag::open(&path).unwrap();
        let reader = FailureFlag::open(&path).unwrap();
        assert!(!reader.get());
        writer.set(true);
        assert!(reader.get());
        writer.set(false);
        assert!(!reader.get());
    }
}
