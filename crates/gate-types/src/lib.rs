//! Shared types for the image core.
//!
//! This crate defines the error taxonomy, the constants shared with the
//! sandboxed runtime, WebAssembly type descriptions, section byte ranges and
//! the snapshot records used by every other stage.

mod error;
pub mod abi;
pub mod section;
pub mod snapshot;
pub mod wa;

pub use error::{ErrorKind, ImageError};
pub use section::{ByteRange, SectionId, SectionMap, NUM_SECTIONS};
pub use snapshot::{Buffers, Service, Snapshot};
pub use wa::{FuncType, GlobalType, ScalarCategory, ValueType};

/// Result type used throughout the image core.
pub type Result<T> = std::result::Result<T, ImageError>;
