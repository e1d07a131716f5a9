//! Standard sections synthesized from live state: memory, global and data.

use gate_types::abi::WASM_PAGE_BITS;
use gate_types::{GlobalType, ImageError, Result, ValueType};
use wasm_encoder::{
    ConstExpr, DataSection, Encode, GlobalSection, MemorySection, MemoryType, Section,
};

const OP_F32_CONST: u8 = 0x43;
const OP_F64_CONST: u8 = 0x44;

/// Memory section declaring a single memory with `memory_size` bytes of
/// initial memory.  A negative limit means that there is no maximum.
pub fn memory_section(memory_size: u32, memory_size_limit: i64) -> Vec<u8> {
    let mut section = MemorySection::new();
    section.memory(MemoryType {
        minimum: (memory_size >> WASM_PAGE_BITS) as u64,
        maximum: (memory_size_limit >= 0).then(|| (memory_size_limit >> WASM_PAGE_BITS) as u64),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });

    let mut buf = Vec::new();
    section.append_to(&mut buf);
    buf
}

/// Read the value of global `index` from a globals area which is aligned
/// against its end.
pub fn global_value(globals: &[u8], index: usize) -> Option<u64> {
    let start = globals.len().checked_sub((index + 1) * 8)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&globals[start..start + 8]);
    Some(u64::from_le_bytes(word))
}

/// Store the value of global `index` into a globals area which is aligned
/// against its end.
pub fn put_global_value(globals: &mut [u8], index: usize, value: u64) -> Result<()> {
    let start = globals
        .len()
        .checked_sub((index + 1) * 8)
        .ok_or_else(|| ImageError::internal(format!("global {index} is out of bounds")))?;
    globals[start..start + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Global section with the current values of the globals.  Global `i` is
/// stored as a little-endian word at `globals.len() - (i + 1) * 8`.  No
/// section is produced if there are no globals.
pub fn global_section(global_types: &[u8], globals: &[u8]) -> Result<Vec<u8>> {
    if global_types.is_empty() {
        return Ok(Vec::new());
    }

    let mut section = GlobalSection::new();

    for (i, &b) in global_types.iter().enumerate() {
        let t = GlobalType(b);
        let value = global_value(globals, i)
            .ok_or_else(|| ImageError::internal("globals area is too small"))?;

        let init = match t.value_type() {
            Some(ValueType::I32) => ConstExpr::i32_const(value as u32 as i32),
            Some(ValueType::I64) => ConstExpr::i64_const(value as i64),
            Some(ValueType::F32) => {
                let mut raw = vec![OP_F32_CONST];
                raw.extend_from_slice(&(value as u32).to_le_bytes());
                ConstExpr::raw(raw)
            }
            Some(ValueType::F64) => {
                let mut raw = vec![OP_F64_CONST];
                raw.extend_from_slice(&value.to_le_bytes());
                ConstExpr::raw(raw)
            }
            None => {
                return Err(ImageError::internal(format!("invalid global type byte: {b:#x}")));
            }
        };

        section.global(encoder_global_type(t)?, &init);
    }

    let mut buf = Vec::new();
    section.append_to(&mut buf);
    Ok(buf)
}

fn encoder_global_type(t: GlobalType) -> Result<wasm_encoder::GlobalType> {
    let val_type = match t.value_type() {
        Some(ValueType::I32) => wasm_encoder::ValType::I32,
        Some(ValueType::I64) => wasm_encoder::ValType::I64,
        Some(ValueType::F32) => wasm_encoder::ValType::F32,
        Some(ValueType::F64) => wasm_encoder::ValType::F64,
        None => return Err(ImageError::internal("invalid global type")),
    };

    Ok(wasm_encoder::GlobalType {
        val_type,
        mutable: t.mutable(),
        shared: false,
    })
}

// ── Data section ────────────────────────────────────────────────────────────

/// Accumulates active data segments of memory 0.
#[derive(Default)]
pub struct DataSegments {
    section: DataSection,
}

impl DataSegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a segment at a memory offset.
    pub fn push(&mut self, offset: u32, data: &[u8]) {
        self.section
            .active(0, &ConstExpr::i32_const(offset as i32), data.iter().copied());
    }

    pub fn len(&self) -> u32 {
        self.section.len()
    }

    pub fn is_empty(&self) -> bool {
        self.section.is_empty()
    }

    /// Complete data section: id, payload size, segment count and segments.
    pub fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.section.append_to(&mut buf);
        buf
    }

    /// Size of the section payload, for size checks before finishing.
    pub fn payload_len(&self) -> usize {
        let mut buf = Vec::new();
        self.section.encode(&mut buf);
        buf.len()
    }
}
