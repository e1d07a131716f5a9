//! Process-wide constants shared with the sandboxed runtime process.
//!
//! The runtime maps program text at a randomized base address, and writes a
//! fixed-size stack variables record at the bottom of the stack region when
//! it exits or suspends.  Everything here must stay in sync with the runtime
//! loader.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

use crate::{ImageError, Result};

// ── WebAssembly ──────────────────────────────────────────────────────────────

pub const WASM_PAGE_BITS: u32 = 16;
pub const WASM_PAGE_SIZE: u32 = 1 << WASM_PAGE_BITS;

/// Size of the standard module header (magic and version).
pub const MODULE_HEADER_SIZE: u32 = 8;

// ── Text address space ───────────────────────────────────────────────────────

/// Lowest text base address (inclusive).
pub const MIN_TEXT_ADDR: u64 = 0x0000_0004_0000_0000;
/// Highest text base address (exclusive).
pub const MAX_TEXT_ADDR: u64 = 0x0000_2aa7_0000_0000;

/// Text offset of the resume routine inside the runtime's enter code.
pub const TEXT_ADDR_RESUME: u32 = 0x10;
/// Text offset of the exit routine.
pub const TEXT_ADDR_EXIT: u32 = 0x20;

// ── Stack ────────────────────────────────────────────────────────────────────

/// Size of the stack variables record at the bottom of the stack region.
pub const STACK_VARS_SIZE: usize = 64;

/// Bytes reserved at the bottom of the stack region for stack variables,
/// signal handling and red zone.  Stack usage can never reach into it.
pub const STACK_USAGE_OFFSET: usize = 4096;

/// Value of both magic words in a valid stack variables record.
pub const STACK_MAGIC: u64 = 0x7b53_c485_c173_22fe;

// ── Runtime library ──────────────────────────────────────────────────────────

/// Revision of the text ABI produced by the compiler.
pub const TEXT_REVISION: i32 = 0;

const LIBRARY_IDENTITY: &str = "gate runtime library: rt v0, wasi snapshot preview1, text r0";

/// Checksum of the runtime library which programs are linked against.
/// Stored programs with a different checksum are incompatible.
pub fn library_checksum() -> u64 {
    static CHECKSUM: OnceLock<u64> = OnceLock::new();

    *CHECKSUM.get_or_init(|| {
        let digest = Sha256::digest(LIBRARY_IDENTITY.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(word)
    })
}

/// Choose a text base address uniformly among page-aligned addresses in
/// `[MIN_TEXT_ADDR, MAX_TEXT_ADDR)`.
pub fn random_text_addr(page_size: u64) -> Result<u64> {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b)
        .map_err(|e| ImageError::io("getrandom", std::io::Error::other(e.to_string())))?;

    Ok(text_addr_from(u64::from_le_bytes(b), page_size))
}

/// Map a random number to a page-aligned text address.
pub fn text_addr_from(random: u64, page_size: u64) -> u64 {
    let pages = (MAX_TEXT_ADDR - MIN_TEXT_ADDR) / page_size;
    MIN_TEXT_ADDR + (random % pages) * page_size
}
