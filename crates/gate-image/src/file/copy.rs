use std::io;
use std::os::fd::AsRawFd;

use gate_types::{ImageError, Result};
use tracing::warn;

use super::File;

const FALLBACK_CHUNK_SIZE: usize = 1 << 20;

/// Copy a file range without passing the data through userspace.  Falls back
/// to reading and writing when the kernel can't copy between the files.
pub fn copy_file_range(src: &File, src_offset: u64, dst: &File, dst_offset: u64, len: usize) -> Result<()> {
    let mut src_off = src_offset as libc::loff_t;
    let mut dst_off = dst_offset as libc::loff_t;
    let mut remaining = len;

    while remaining > 0 {
        // SAFETY: offsets point to live locals and the descriptors are owned.
        let n = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                &mut src_off,
                dst.as_raw_fd(),
                &mut dst_off,
                remaining,
                0,
            )
        };

        if n < 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                Some(libc::EXDEV) | Some(libc::ENOSYS) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                    warn!(errno = e.raw_os_error(), remaining, "copy_file_range unsupported; copying through buffer");
                    return copy_buffered(src, src_off as u64, dst, dst_off as u64, remaining);
                }
                _ => return Err(ImageError::io("copy_file_range", e)),
            }
        }
        if n == 0 {
            return Err(ImageError::io("copy_file_range", io::ErrorKind::UnexpectedEof.into()));
        }

        remaining -= n as usize;
    }

    Ok(())
}

fn copy_buffered(src: &File, mut src_off: u64, dst: &File, mut dst_off: u64, mut len: usize) -> Result<()> {
    let mut buf = vec![0u8; len.min(FALLBACK_CHUNK_SIZE)];

    while len > 0 {
        let chunk = &mut buf[..len.min(FALLBACK_CHUNK_SIZE)];
        src.read_exact_at(chunk, src_off)?;
        dst.write_all_at(chunk, dst_off)?;

        src_off += chunk.len() as u64;
        dst_off += chunk.len() as u64;
        len -= chunk.len();
    }

    Ok(())
}
