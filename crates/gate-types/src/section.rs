//! Module section identifiers and byte ranges.

use serde::{Deserialize, Serialize};

/// Standard section id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

/// Number of slots in a section table (custom plus standard sections).
pub const NUM_SECTIONS: usize = SectionId::Data as usize + 1;

impl SectionId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => SectionId::Custom,
            1 => SectionId::Type,
            2 => SectionId::Import,
            3 => SectionId::Function,
            4 => SectionId::Table,
            5 => SectionId::Memory,
            6 => SectionId::Global,
            7 => SectionId::Export,
            8 => SectionId::Start,
            9 => SectionId::Element,
            10 => SectionId::Code,
            11 => SectionId::Data,
            _ => return None,
        })
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Standard sections in module order.
    pub fn standard() -> impl Iterator<Item = SectionId> {
        (1..NUM_SECTIONS as u8).filter_map(SectionId::from_u8)
    }
}

/// Location of a section (including its id and size prefix) within a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub size: u32,
}

impl ByteRange {
    pub fn new(start: u64, size: u32) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Byte ranges of the sections of a module, collected while it is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionMap {
    /// Indexed by section id.  The custom slot holds the most recently
    /// encountered custom section.
    pub sections: [ByteRange; NUM_SECTIONS],
    pub snapshot: ByteRange,
    pub export_wrap: ByteRange,
    pub buffer: ByteRange,
    pub stack: ByteRange,
}

impl SectionMap {
    pub fn get(&self, id: SectionId) -> ByteRange {
        self.sections[id.index()]
    }

    /// Record a section.  Custom sections overwrite the custom slot.
    pub fn put(&mut self, id: SectionId, range: ByteRange) {
        self.sections[id.index()] = range;
    }
}
