//! Program and instance metadata stored inside image files.
//!
//! A manifest is framed by a header of two little-endian words: a tag which
//! tells program and instance files apart, and the total size including the
//! header.  The body is JSON.  Byte strings are base64 so that large
//! global tables fit.

use std::collections::BTreeMap;

use gate_types::abi::MODULE_HEADER_SIZE;
use gate_types::{ByteRange, ImageError, Result, SectionId, Snapshot, NUM_SECTIONS};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::file::File;

pub const PROGRAM_MANIFEST_TAG: u32 = 0x4a52_74bd;
pub const INSTANCE_MANIFEST_TAG: u32 = 0xb405_dd05;

/// Maximum size of a manifest, header included.
pub const MAX_MANIFEST_SIZE: usize = 4096;

const HEADER_SIZE: usize = 8;

/// Function index and its text offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub index: u32,
    pub addr: u32,
}

// ══════════════════════════════════════════════════════════════════════════════
// Program manifest
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramManifest {
    pub library_checksum: u64,
    pub text_revision: i32,
    /// Text base of the stack, or zero if there is no native stack.
    pub text_addr: u64,
    pub text_size: u32,
    pub stack_usage: u32,
    pub globals_size: u32,
    pub memory_size: u32,
    /// Negative if memory may grow without a declared bound.
    pub memory_size_limit: i64,
    pub memory_data_size: u32,
    pub module_size: u64,
    /// Standard sections indexed by id.  The custom slot is unused.
    pub sections: [ByteRange; NUM_SECTIONS],
    pub snapshot_section: ByteRange,
    pub export_section_wrap: ByteRange,
    pub buffer_section: ByteRange,
    pub buffer_section_header_size: u32,
    pub stack_section: ByteRange,
    #[serde(with = "base64_bytes")]
    pub global_types: Vec<u8>,
    pub call_sites_size: u32,
    pub func_addrs_size: u32,
    pub start_func: Option<Function>,
    /// Exported entry functions by name.
    pub entry_indexes: BTreeMap<String, u32>,
    /// Text offsets of the entry functions by index.
    pub entry_addrs: BTreeMap<u32, u32>,
    /// The program imports random data.
    pub random: bool,
    pub snapshot: Option<Snapshot>,
}

impl ProgramManifest {
    pub fn section(&self, id: SectionId) -> ByteRange {
        self.sections[id.index()]
    }

    /// Entry function by index, with its text offset.
    pub fn entry_func(&self, index: u32) -> Option<Function> {
        let &addr = self.entry_addrs.get(&index)?;
        Some(Function { index, addr })
    }

    /// End of the last standard or gate section.  Everything after it is
    /// trailing custom sections.
    pub fn sections_end(&self) -> u64 {
        self.sections
            .iter()
            .skip(1)
            .chain([
                &self.snapshot_section,
                &self.export_section_wrap,
                &self.buffer_section,
                &self.stack_section,
            ])
            .filter(|r| !r.is_empty())
            .map(ByteRange::end)
            .fold(MODULE_HEADER_SIZE as u64, u64::max)
    }

    /// Offset of the object map within the module region.
    pub fn object_map_offset(&self) -> u64 {
        crate::layout::align8(self.module_size)
    }

    pub fn breakpoints(&self) -> &[u64] {
        self.snapshot.as_ref().map_or(&[], |s| &s.breakpoints)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Instance manifest
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceManifest {
    pub text_addr: u64,
    pub stack_size: u32,
    pub stack_usage: u32,
    pub globals_size: u32,
    pub memory_size: u32,
    pub max_memory_size: u32,
    pub start_func: Option<Function>,
    pub entry_func: Option<Function>,
    pub snapshot: Option<Snapshot>,
}

impl InstanceManifest {
    /// Snapshot record, inflated if missing.
    pub fn snapshot_mut(&mut self) -> &mut Snapshot {
        self.snapshot.get_or_insert_with(Snapshot::default)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Framing
// ══════════════════════════════════════════════════════════════════════════════

/// Serialize a manifest with its header.
pub fn encode<T: Serialize>(tag: u32, man: &T) -> Result<Vec<u8>> {
    let mut b = vec![0u8; HEADER_SIZE];
    serde_json::to_writer(&mut b, man)
        .map_err(|e| ImageError::internal(format!("manifest encoding: {e}")))?;

    let size = b.len();
    if size > MAX_MANIFEST_SIZE {
        return Err(ImageError::resource_limit(format!(
            "manifest size {size} exceeds {MAX_MANIFEST_SIZE}"
        )));
    }

    b[..4].copy_from_slice(&tag.to_le_bytes());
    b[4..8].copy_from_slice(&(size as u32).to_le_bytes());
    Ok(b)
}

/// Deserialize a manifest with its header.  Bytes after the declared size
/// are ignored.  A damaged manifest is reported as a bad module.
pub fn decode<T: DeserializeOwned>(tag: u32, b: &[u8]) -> Result<T> {
    if b.len() < HEADER_SIZE {
        return Err(ImageError::bad_module("manifest is truncated"));
    }

    let found = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    if found != tag {
        return Err(ImageError::bad_module(format!("manifest tag {found:#x} is not {tag:#x}")));
    }

    let size = u32::from_le_bytes([b[4], b[5], b[6], b[7]]) as usize;
    if !(HEADER_SIZE..=MAX_MANIFEST_SIZE).contains(&size) || size > b.len() {
        return Err(ImageError::bad_module(format!("manifest size {size} is out of bounds")));
    }

    serde_json::from_slice(&b[HEADER_SIZE..size])
        .map_err(|e| ImageError::bad_module(format!("manifest decoding: {e}")))
}

pub fn write<T: Serialize>(file: &File, offset: u64, tag: u32, man: &T) -> Result<()> {
    file.write_all_at(&encode(tag, man)?, offset)
}

pub fn read<T: DeserializeOwned>(file: &File, offset: u64, tag: u32) -> Result<T> {
    let mut b = vec![0u8; MAX_MANIFEST_SIZE];
    file.read_exact_at(&mut b, offset)?;
    decode(tag, &b)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
