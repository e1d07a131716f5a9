//! Owned file descriptors with positional I/O, memory mappings and in-kernel
//! copying.

mod copy;
mod mmap;

use std::ffi::CString;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use gate_types::{ImageError, Result};

pub use copy::copy_file_range;
pub use mmap::{page_size, Mapping, Protection};

/// An open file.  The descriptor is closed when the value is dropped.
pub struct File {
    inner: std::fs::File,
}

impl File {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            inner: std::fs::File::from(fd),
        }
    }

    /// Take ownership of a descriptor returned by a system call, or the
    /// current `errno` if the call failed.
    pub(crate) fn from_syscall(fd: RawFd, context: &'static str) -> Result<Self> {
        if fd < 0 {
            return Err(ImageError::last_os_error(context));
        }
        // SAFETY: the descriptor was just returned by the kernel and is not
        // owned by anything else.
        Ok(Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Open a path relative to a directory, or to the current directory if
    /// `dir` is `None`.
    pub fn open_at(dir: Option<&File>, path: &str, flags: libc::c_int, mode: libc::mode_t) -> Result<Self> {
        let path = c_path(path)?;
        let dirfd = dir.map_or(libc::AT_FDCWD, |d| d.as_raw_fd());

        let fd = loop {
            // SAFETY: path is a valid C string.
            let fd = unsafe {
                libc::openat(dirfd, path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint)
            };
            if fd < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break fd;
        };

        Self::from_syscall(fd, "openat")
    }

    /// Read as much as possible at an offset.  Returns zero at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        loop {
            match self.inner.read_at(buf, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                r => return r.map_err(|e| ImageError::io("pread", e)),
            }
        }
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.inner
            .read_exact_at(buf, offset)
            .map_err(|e| ImageError::io("pread", e))
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.inner
            .write_all_at(buf, offset)
            .map_err(|e| ImageError::io("pwrite", e))
    }

    /// Write two adjacent buffers at an offset with a single gather-write
    /// when possible.
    pub fn write_vec_at(&self, bufs: [&[u8]; 2], offset: u64) -> Result<()> {
        let [mut first, mut second] = bufs;
        let mut offset = offset;

        while !first.is_empty() || !second.is_empty() {
            let iov = [
                libc::iovec {
                    iov_base: first.as_ptr() as *mut libc::c_void,
                    iov_len: first.len(),
                },
                libc::iovec {
                    iov_base: second.as_ptr() as *mut libc::c_void,
                    iov_len: second.len(),
                },
            ];

            // SAFETY: the iovecs point to live buffers of the stated sizes.
            let n = unsafe { libc::pwritev(self.as_raw_fd(), iov.as_ptr(), 2, offset as libc::off_t) };
            if n < 0 {
                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    Some(libc::ENOSYS) => {
                        self.write_all_at(first, offset)?;
                        return self.write_all_at(second, offset + first.len() as u64);
                    }
                    _ => return Err(ImageError::io("pwritev", e)),
                }
            }
            if n == 0 {
                return Err(ImageError::io("pwritev", io::ErrorKind::WriteZero.into()));
            }

            let mut n = n as usize;
            offset += n as u64;

            let k = n.min(first.len());
            first = &first[k..];
            n -= k;
            second = &second[n..];
        }

        Ok(())
    }

    /// Set the file size.  Files are sized up front so that all regions can
    /// be mapped.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.inner
            .set_len(size)
            .map_err(|e| ImageError::io("ftruncate", e))
    }

    pub fn sync_data(&self) -> Result<()> {
        self.inner
            .sync_data()
            .map_err(|e| ImageError::io("fdatasync", e))
    }

    /// Duplicate the descriptor.  The duplicate shares the file offset.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = self
            .inner
            .try_clone()
            .map_err(|e| ImageError::io("dup", e))?;
        Ok(Self { inner })
    }

    /// Reposition the file offset with `lseek`.  `None` means that there is
    /// no data or hole at or after the offset (`ENXIO`).
    pub(crate) fn seek(&self, offset: u64, whence: libc::c_int) -> Result<Option<u64>> {
        // SAFETY: plain system call on an owned descriptor.
        let pos = unsafe { libc::lseek(self.as_raw_fd(), offset as libc::off_t, whence) };
        if pos < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(ImageError::io("lseek", e));
        }
        Ok(Some(pos as u64))
    }
}

impl AsRawFd for File {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for File {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File").field("fd", &self.as_raw_fd()).finish()
    }
}

/// Reference-counted file.  The descriptor is closed when the last reference
/// is dropped.
#[derive(Debug, Clone)]
pub struct FileRef(Arc<File>);

impl FileRef {
    pub fn new(file: File) -> Self {
        Self(Arc::new(file))
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for FileRef {
    type Target = File;

    fn deref(&self) -> &File {
        &self.0
    }
}

pub(crate) fn c_path(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| ImageError::internal(format!("path contains nul byte: {path:?}")))
}

/// Check the return value of a system call which returns zero on success.
pub(crate) fn check(ret: libc::c_int, context: &'static str) -> Result<()> {
    if ret < 0 {
        return Err(ImageError::last_os_error(context));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> File {
        File::from_fd(tempfile::tempfile().unwrap().into())
    }

    #[test]
    fn positional_io() {
        let f = temp_file();
        f.write_all_at(b"hello", 100).unwrap();

        let mut buf = [0u8; 5];
        f.read_exact_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");

        let mut tail = [0u8; 8];
        assert_eq!(f.read_at(&mut tail, 103).unwrap(), 2);
        assert_eq!(f.read_at(&mut tail, 105).unwrap(), 0);
    }

    #[test]
    fn gather_write() {
        let f = temp_file();
        f.write_vec_at([b"abc", b"defg"], 8).unwrap();
        f.write_vec_at([b"", b"xy"], 0).unwrap();

        let mut buf = [0u8; 15];
        f.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"xy\0\0\0\0\0\0abcdefg");
    }

    #[test]
    fn truncate_makes_sparse_file() {
        let f = temp_file();
        f.truncate(1 << 20).unwrap();

        let mut buf = [0xffu8; 16];
        f.read_exact_at(&mut buf, (1 << 20) - 16).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn file_ref_counts() {
        let r = FileRef::new(temp_file());
        let r2 = r.clone();
        assert_eq!(r.ref_count(), 2);
        drop(r2);
        assert_eq!(r.ref_count(), 1);
        r.write_all_at(b"x", 0).unwrap();
    }
}
