//! Backing stores of program and instance files.
//!
//! A [`Storage`] pairs a program backend with an instance backend.  Programs
//! keep a handle to the storage they were built or loaded with, so that
//! instances derived from them are created in the same place.

mod filesystem;
mod memory;
mod persist;

use std::fmt;
use std::sync::Arc;

use gate_types::Result;

pub use filesystem::Filesystem;
pub use memory::Memory;
pub use persist::PersistentMemory;

use crate::file::File;
use crate::instance::Instance;
use crate::program::Program;

pub trait ProgramStorage: fmt::Debug + Send + Sync {
    /// Names of stored programs.
    fn programs(&self) -> Result<Vec<String>>;

    /// Load a stored program.  `None` if it doesn't exist or was built for a
    /// different runtime library.
    fn load_program(&self, combined: &Storage, name: &str) -> Result<Option<Program>>;

    /// Empty program file, sized to hold every region.
    fn new_program_file(&self) -> Result<File>;

    /// Make a finished program file read-only.  No writable mappings of the
    /// file may exist.
    fn protect_program_file(&self, file: &File) -> Result<()>;

    /// Give a program a persistent name.  Storing the same program again is
    /// not an error.
    fn store_program(&self, prog: &Program, name: &str) -> Result<()>;
}

pub trait InstanceStorage: fmt::Debug + Send + Sync {
    /// Names of stored instances.
    fn instances(&self) -> Result<Vec<String>>;

    /// Load a stored instance.  `None` if it doesn't exist.
    fn load_instance(&self, name: &str) -> Result<Option<Instance>>;

    /// Empty instance file, sized to hold every region.
    fn new_instance_file(&self) -> Result<File>;

    /// Instance files can be written with write and copy system calls.  If
    /// not, they must be written through memory mappings.
    fn instance_file_write_supported(&self) -> bool;

    fn store_instance_supported(&self) -> bool;

    fn store_instance(&self, inst: &mut Instance, name: &str) -> Result<()>;
}

/// Program and instance backends.
#[derive(Clone)]
pub struct Storage {
    pub(crate) programs: Arc<dyn ProgramStorage>,
    pub(crate) instances: Arc<dyn InstanceStorage>,
}

impl Storage {
    pub fn new(programs: Arc<dyn ProgramStorage>, instances: Arc<dyn InstanceStorage>) -> Self {
        Self { programs, instances }
    }

    /// Anonymous memory for both programs and instances.
    pub fn memory() -> Self {
        Self::new(Arc::new(Memory), Arc::new(Memory))
    }

    /// The same file system for both programs and instances.
    pub fn filesystem(fs: Arc<Filesystem>) -> Self {
        Self::new(fs.clone(), fs)
    }

    pub fn program_storage(&self) -> &Arc<dyn ProgramStorage> {
        &self.programs
    }

    pub fn instance_storage(&self) -> &Arc<dyn InstanceStorage> {
        &self.instances
    }

    pub fn programs(&self) -> Result<Vec<String>> {
        self.programs.programs()
    }

    pub fn instances(&self) -> Result<Vec<String>> {
        self.instances.instances()
    }

    pub fn load_program(&self, name: &str) -> Result<Option<Program>> {
        self.programs.load_program(self, name)
    }

    pub fn load_instance(&self, name: &str) -> Result<Option<Instance>> {
        self.instances.load_instance(name)
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("programs", &self.programs)
            .field("instances", &self.instances)
            .finish()
    }
}
