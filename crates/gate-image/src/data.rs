//! Data section synthesis from linear memory.
//!
//! Memory is split into segments so that long runs of zero bytes are left
//! out.  File holes are found with `SEEK_DATA` and `SEEK_HOLE`; within data
//! extents, zero runs are found by scanning 8-byte words.

use gate_types::Result;
use gate_wasm::DataSegments;
use tracing::{debug, warn};

use crate::file::File;

const WORD: usize = 8;
const MASK: usize = WORD - 1;

/// Complete data section for `memory`, which must have the same contents as
/// the file at `base`.
pub fn data_section(file: &File, base: u64, memory: &[u8]) -> Result<Vec<u8>> {
    let mut segments = DataSegments::new();

    match scan_holes(&mut segments, file, base, memory) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            warn!("file system does not report holes; scanning whole memory");
            segments = DataSegments::new();
            scan_data(&mut segments, memory, 0, memory.len());
        }
        Err(e) => return Err(e),
    }

    debug!(segments = segments.len(), memory = memory.len(), "data section");
    Ok(segments.finish())
}

fn scan_holes(segments: &mut DataSegments, file: &File, base: u64, memory: &[u8]) -> Result<()> {
    let fd = file.try_clone()?;
    let space = memory.len() as u64;

    let mut data = match fd.seek(base, libc::SEEK_DATA)? {
        Some(pos) => pos,
        None => return Ok(()),
    };

    while data - base < space {
        let hole = match fd.seek(data, libc::SEEK_HOLE)? {
            Some(pos) => pos,
            None => break,
        };

        scan_data(
            segments,
            memory,
            (data - base) as usize,
            (hole - base).min(space) as usize,
        );

        data = match fd.seek(hole, libc::SEEK_DATA)? {
            Some(pos) => pos,
            None => break,
        };
    }

    Ok(())
}

/// Emit segments for `memory[offset..end]`.
fn scan_data(segments: &mut DataSegments, memory: &[u8], mut offset: usize, end: usize) {
    if offset & MASK != 0 {
        let prefix_end = ((offset + MASK) & !MASK).min(end);
        write_segment(segments, memory, offset, prefix_end);
        offset = prefix_end;
    }

    let align_end = end & !MASK;
    if offset < align_end {
        scan_words(segments, memory, offset, align_end);
    }
    write_segment(segments, memory, align_end.max(offset), end);
}

/// Emit a segment for every run of nonzero words in an aligned range.
fn scan_words(segments: &mut DataSegments, memory: &[u8], offset: usize, end: usize) {
    let nonzero = |i: usize| memory[i..i + WORD].iter().any(|&b| b != 0);

    let mut pos = offset;
    while pos < end {
        if !nonzero(pos) {
            pos += WORD;
            continue;
        }

        let start = pos;
        while pos < end && nonzero(pos) {
            pos += WORD;
        }
        write_segment(segments, memory, start, pos);
    }
}

/// Emit a segment with leading and trailing zeros trimmed.
fn write_segment(segments: &mut DataSegments, memory: &[u8], mut offset: usize, mut end: usize) {
    while offset < end && memory[offset] == 0 {
        offset += 1;
    }
    while offset < end && memory[end - 1] == 0 {
        end -= 1;
    }
    if offset < end {
        segments.push(offset as u32, &memory[offset..end]);
    }
}
