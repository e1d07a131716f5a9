//! WebAssembly wire formats used by the image core.
//!
//! - [`custom`]: the `gate.snapshot`, `gate.export`, `gate.buffer` and
//!   `gate.stack` custom sections.
//! - [`section`]: memory, global and data sections synthesized from live
//!   instance state.
//! - [`module`]: module declarations and section byte ranges.

pub mod custom;
pub mod module;
pub mod section;

pub use custom::{SECTION_BUFFER, SECTION_EXPORT, SECTION_SNAPSHOT, SECTION_STACK};
pub use module::{CodeSection, CustomSection, DataSegment, Global, Import, ImportKind, InitExpr, Module};
pub use section::DataSegments;

use gate_types::ImageError;

/// Decoding failures are module errors.
pub(crate) fn malformed(e: wasmparser::BinaryReaderError) -> ImageError {
    ImageError::bad_module(e.to_string())
}
