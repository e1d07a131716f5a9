use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::{fmt, slice};

use gate_types::{ImageError, Result};

use super::File;
use crate::layout::align_page;

/// Host page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            n as usize
        } else {
            4096
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Shared, readable and writable.
    ReadWrite,
    /// Private copy-on-write view which is only read.
    ReadPrivate,
}

/// Memory mapping of a file region.  Unmapped when dropped.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes (rounded up to page size) at a page-aligned offset.
    /// Returns `None` for an empty region.
    pub fn map(file: &File, offset: u64, len: usize, prot: Protection) -> Result<Option<Self>> {
        if offset % page_size() as u64 != 0 {
            return Err(ImageError::internal(format!(
                "mapping offset {offset:#x} is not page-aligned"
            )));
        }
        if len == 0 {
            return Ok(None);
        }

        let len = align_page(len);
        let (prot, flags) = match prot {
            Protection::ReadWrite => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED),
            Protection::ReadPrivate => (libc::PROT_READ, libc::MAP_PRIVATE),
        };

        // SAFETY: a fresh mapping chosen by the kernel does not alias any Rust
        // object.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                flags,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ImageError::last_os_error("mmap"));
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| ImageError::internal("mmap returned null"))?;
        Ok(Some(Self { ptr, len }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for len bytes while self lives.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view.  Writing to a read-only mapping faults, so callers only
    /// use this on `ReadWrite` mappings.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by Mapping::map and is not referenced
        // after this.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::warn!(len = self.len, "munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn shared_mapping_writes_through() {
        let f = File::from_fd(tempfile::tempfile().unwrap().into());
        f.truncate(page_size() as u64 * 2).unwrap();

        let mut m = Mapping::map(&f, page_size() as u64, 10, Protection::ReadWrite)
            .unwrap()
            .unwrap();
        assert_eq!(m.len(), page_size());
        m.as_mut_slice()[..3].copy_from_slice(b"abc");
        drop(m);

        let mut buf = [0u8; 3];
        f.read_exact_at(&mut buf, page_size() as u64).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn empty_and_misaligned() {
        let f = File::from_fd(tempfile::tempfile().unwrap().into());
        assert!(Mapping::map(&f, 0, 0, Protection::ReadPrivate).unwrap().is_none());
        assert!(Mapping::map(&f, 1, 10, Protection::ReadPrivate).is_err());
    }
}
