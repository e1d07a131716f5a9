//! Wire formats of the `gate.*` custom sections.
//!
//! A snapshot module carries its execution state in four custom sections:
//!
//! - `gate.snapshot` must appear once before `gate.export` or `gate.buffer`.
//! - `gate.export` may appear in place of the standard export section, hiding
//!   the export names from the runtime while the module is suspended.
//! - `gate.buffer` may appear once between the code and stack sections.
//! - `gate.stack` may appear once between the buffer and data sections.
//!
//! Writers produce complete sections (id, payload size, name, content) so that
//! their byte ranges can be laid out before anything is written.

use gate_types::snapshot::{Buffers, Service, Snapshot, MAX_BREAKPOINTS, MAX_SERVICE_NAME_LEN};
use gate_types::{ByteRange, ImageError, Result, SectionId};
use wasm_encoder::Encode;
use wasmparser::{BinaryReader, ExportSectionReader, ExternalKind};

use crate::malformed;

pub const SECTION_SNAPSHOT: &str = "gate.snapshot";
pub const SECTION_EXPORT: &str = "gate.export";
pub const SECTION_BUFFER: &str = "gate.buffer";
pub const SECTION_STACK: &str = "gate.stack";

const SNAPSHOT_VERSION: u8 = 0;

// ══════════════════════════════════════════════════════════════════════════════
// Framing
// ══════════════════════════════════════════════════════════════════════════════

/// Custom section frame: id, payload size and name.  `content_len` bytes of
/// content are expected to follow the returned frame.
pub fn custom_section_frame(name: &str, content_len: u64) -> Result<Vec<u8>> {
    let mut name_field = Vec::with_capacity(1 + name.len());
    name.encode(&mut name_field);

    let payload_len = name_field.len() as u64 + content_len;
    let payload_len = u32::try_from(payload_len)
        .map_err(|_| ImageError::resource_limit(format!("{name} section is too large")))?;

    let mut frame = Vec::with_capacity(1 + 5 + name_field.len());
    frame.push(SectionId::Custom as u8);
    payload_len.encode(&mut frame);
    frame.extend_from_slice(&name_field);
    Ok(frame)
}

/// Split a complete custom section into its name and content.  The third
/// value is the length of the frame preceding the content.
pub fn split_custom_section(section: &[u8]) -> Result<(&str, &[u8], usize)> {
    let mut r = BinaryReader::new(section, 0);

    if r.read_u8().map_err(malformed)? != SectionId::Custom as u8 {
        return Err(ImageError::bad_module("not a custom section"));
    }

    let size = r.read_var_u32().map_err(malformed)? as usize;
    if r.current_position() + size != section.len() {
        return Err(ImageError::bad_module("custom section size mismatch"));
    }

    let name = r.read_string().map_err(malformed)?;
    let frame_len = r.current_position();
    Ok((name, &section[frame_len..], frame_len))
}

// ══════════════════════════════════════════════════════════════════════════════
// gate.snapshot
// ══════════════════════════════════════════════════════════════════════════════

/// Complete `gate.snapshot` section.
pub fn snapshot_section(snap: &Snapshot) -> Result<Vec<u8>> {
    let mut content = Vec::with_capacity(32 + snap.breakpoints.len() * 4);
    content.push(SNAPSHOT_VERSION);
    content.push(snap.flags() as u8);
    snap.trap.encode(&mut content);
    (snap.result as u32).encode(&mut content);
    snap.monotonic_time.encode(&mut content);
    (snap.breakpoints.len() as u32).encode(&mut content);
    for offset in &snap.breakpoints {
        offset.encode(&mut content);
    }

    let mut section = custom_section_frame(SECTION_SNAPSHOT, content.len() as u64)?;
    section.extend_from_slice(&content);
    Ok(section)
}

/// Decode the content of a `gate.snapshot` section.  Trailing bytes are
/// ignored so that later versions may extend the format.
pub fn read_snapshot_section(content: &[u8], offset: usize) -> Result<Snapshot> {
    let mut r = BinaryReader::new(content, offset);

    // Every version starts with the same fields.
    let _version = r.read_var_u64().map_err(malformed)?;

    let flags = r.read_var_u64().map_err(malformed)?;
    let trap = r.read_var_u32().map_err(malformed)?;
    let result = r.read_var_u32().map_err(malformed)? as i32;
    let monotonic_time = r.read_var_u64().map_err(malformed)?;

    let count = r.read_var_u32().map_err(malformed)? as usize;
    if count > MAX_BREAKPOINTS {
        return Err(ImageError::bad_module("snapshot has too many breakpoints"));
    }

    let mut breakpoints = Vec::with_capacity(count);
    for _ in 0..count {
        breakpoints.push(r.read_var_u64().map_err(malformed)?);
    }

    Ok(Snapshot {
        is_final: flags & 1 != 0,
        trap,
        result,
        monotonic_time,
        breakpoints,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// gate.export
// ══════════════════════════════════════════════════════════════════════════════

/// Frame of a `gate.export` section which wraps a standard export section of
/// the given size.  The wrapped section follows the frame verbatim.
pub fn export_section_wrap_frame(export_section_size: u32) -> Result<Vec<u8>> {
    custom_section_frame(SECTION_EXPORT, export_section_size as u64)
}

/// Standard export section found inside a `gate.export` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedExports {
    /// Exported functions: name and function index.
    pub funcs: Vec<(String, u32)>,
    /// Location of the wrapped standard section within the module.
    pub range: ByteRange,
}

/// Unwrap the standard export section carried by a `gate.export` section.
/// `content_offset` is the module offset of the content.
pub fn unwrap_export_section(content: &[u8], content_offset: usize) -> Result<WrappedExports> {
    if content.len() < 2 {
        return Err(ImageError::bad_module("gate.export section is too short"));
    }
    if content[0] != SectionId::Export as u8 {
        return Err(ImageError::bad_module(
            "gate.export section does not contain a standard export section",
        ));
    }

    let mut r = BinaryReader::new(content, content_offset);
    r.read_u8().map_err(malformed)?;
    let size = r.read_var_u32().map_err(malformed)? as usize;
    let payload_offset = r.original_position();
    let payload = r.read_bytes(size).map_err(malformed)?;
    if !r.eof() {
        return Err(ImageError::bad_module(
            "gate.export section has trailing data",
        ));
    }

    let reader = ExportSectionReader::new(BinaryReader::new(payload, payload_offset))
        .map_err(malformed)?;

    let mut funcs = Vec::new();
    for export in reader {
        let export = export.map_err(malformed)?;
        if export.kind == ExternalKind::Func {
            funcs.push((export.name.to_string(), export.index));
        }
    }

    Ok(WrappedExports {
        funcs,
        range: ByteRange::new(content_offset as u64, content.len() as u32),
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// gate.buffer
// ══════════════════════════════════════════════════════════════════════════════

/// Header of a `gate.buffer` section (frame included) and the total section
/// size including the raw data.  Nothing is produced when all buffers are
/// empty.
pub fn buffer_section_header(buffers: &Buffers) -> Result<Option<(Vec<u8>, u32)>> {
    if buffers.is_empty() {
        return Ok(None);
    }

    let mut content = Vec::new();
    (buffers.input.len() as u32).encode(&mut content);
    (buffers.output.len() as u32).encode(&mut content);
    (buffers.services.len() as u32).encode(&mut content);

    for s in &buffers.services {
        if s.name.is_empty() || s.name.len() > MAX_SERVICE_NAME_LEN {
            return Err(ImageError::internal(format!(
                "service name length out of bounds: {:?}",
                s.name
            )));
        }
        content.push(s.name.len() as u8);
        content.extend_from_slice(s.name.as_bytes());
        (s.buffer.len() as u32).encode(&mut content);
    }

    let data_len = buffers.data_len() as u64;
    let mut header = custom_section_frame(SECTION_BUFFER, content.len() as u64 + data_len)?;
    header.extend_from_slice(&content);

    let section_len = u32::try_from(header.len() as u64 + data_len)
        .map_err(|_| ImageError::resource_limit("gate.buffer section is too large"))?;

    Ok(Some((header, section_len)))
}

/// Decode a `gate.buffer` section content.  Returns the buffers and the size
/// of the header part of the content.
pub fn read_buffer_section(content: &[u8], offset: usize) -> Result<(Buffers, usize)> {
    let mut r = BinaryReader::new(content, offset);

    let input_size = r.read_var_u32().map_err(malformed)? as u64;
    let output_size = r.read_var_u32().map_err(malformed)? as u64;
    let service_count = r.read_var_u32().map_err(malformed)?;

    let mut data_size = input_size + output_size;
    let mut services = Vec::new();
    let mut sizes = Vec::new();

    for _ in 0..service_count {
        let name_len = r.read_u8().map_err(malformed)? as usize;
        if name_len == 0 || name_len > MAX_SERVICE_NAME_LEN {
            return Err(ImageError::bad_module("service name length out of bounds"));
        }

        let name = r.read_bytes(name_len).map_err(malformed)?;
        let name = std::str::from_utf8(name)
            .map_err(|_| ImageError::bad_module("service name is not valid UTF-8"))?;

        let size = r.read_var_u32().map_err(malformed)? as u64;
        data_size += size;

        services.push(Service::new(name, Vec::new()));
        sizes.push(size as usize);
    }

    let header_len = r.current_position();
    if header_len as u64 + data_size > content.len() as u64 {
        return Err(ImageError::bad_module("invalid buffer section in wasm module"));
    }

    let mut data = &content[header_len..];
    let mut take = |n: usize| {
        let (head, tail) = data.split_at(n);
        data = tail;
        head.to_vec()
    };

    let input = take(input_size as usize);
    let output = take(output_size as usize);
    for (service, size) in services.iter_mut().zip(sizes) {
        service.buffer = take(size);
    }

    Ok((
        Buffers {
            services,
            input,
            output,
        },
        header_len,
    ))
}

// ══════════════════════════════════════════════════════════════════════════════
// gate.stack
// ══════════════════════════════════════════════════════════════════════════════

/// Frame of a `gate.stack` section carrying `stack_len` bytes of portable
/// stack.
pub fn stack_section_header(stack_len: usize) -> Result<Vec<u8>> {
    custom_section_frame(SECTION_STACK, stack_len as u64)
}
