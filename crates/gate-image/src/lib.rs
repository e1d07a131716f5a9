//! Program and instance images.
//!
//! A program is an immutable, file-backed artifact holding the compiled
//! machine code, the initial globals and memory, the original module bytes
//! and an object map.  An instance is a mutable, file-backed copy of a
//! program's stack, globals and memory.  [`snapshot`] turns an instance back
//! into a program whose module encodes the instance state.
//!
//! Files are kept in a [`Storage`]: anonymous memory, a file system
//! directory, or both.

pub mod file;
pub mod layout;
pub mod manifest;
pub mod objectmap;
pub mod prepare;
pub mod stack;
pub mod storage;

mod build;
mod config;
mod data;
mod instance;
mod program;
mod snapshot;

pub use build::{Build, DataBuffer, ModuleWriter, ProgramDetails, TextBuffer};
pub use config::{StorageConfig, StorageKind};
pub use data::data_section;
pub use instance::{Instance, StackVars, STACK_UNUSED_SUSPENDED};
pub use manifest::{InstanceManifest, ProgramManifest};
pub use objectmap::{CallSite, ObjectMap};
pub use prepare::{FilePool, PreparedInstances, PreparedPrograms};
pub use program::{ModuleReader, Program};
pub use snapshot::snapshot;
pub use storage::{Filesystem, InstanceStorage, Memory, PersistentMemory, ProgramStorage, Storage};
