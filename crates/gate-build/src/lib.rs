//! Program building.
//!
//! ```text
//! module bytes → declarations → early custom sections → imports and entry
//!              → code (external compiler) → stack and buffers → globals and
//!              memory → program image (→ instance image)
//! ```
//!
//! [`build`] runs the whole pipeline.  [`Builder`] exposes the individual
//! steps for callers which interleave them with their own work.

mod builder;
mod compile;
mod config;
mod entry;
mod pipeline;

pub use builder::{Builder, Phase};
pub use compile::{Breakpoint, CodeConfig, Compiler, ImportResolver, LibraryResolver};
pub use config::BuildConfig;
pub use entry::{resolve_entry_func, START_FUNCTION};
pub use pipeline::{build, BuildOutput};
