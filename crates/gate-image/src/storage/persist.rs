use std::sync::Arc;

use gate_types::Result;
use tracing::debug;

use super::filesystem::{link_temp_file, Filesystem};
use super::memory::Memory;
use super::InstanceStorage;
use crate::file::{copy_file_range, File, FileRef};
use crate::instance::Instance;
use crate::layout::{align_page, INST_MANIFEST_OFFSET};
use crate::manifest::{self, InstanceManifest, INSTANCE_MANIFEST_TAG};

/// Instances live in memory, but they are copied to and from a
/// [`Filesystem`] when stored and loaded.
#[derive(Debug, Clone)]
pub struct PersistentMemory {
    fs: Arc<Filesystem>,
}

impl PersistentMemory {
    pub fn new(fs: Arc<Filesystem>) -> Self {
        Self { fs }
    }
}

impl InstanceStorage for PersistentMemory {
    fn instances(&self) -> Result<Vec<String>> {
        self.fs.instances()
    }

    fn load_instance(&self, name: &str) -> Result<Option<Instance>> {
        let Some(mut inst) = self.fs.load_instance(name)? else {
            return Ok(None);
        };

        let f = Memory.new_instance_file()?;
        copy_instance(&f, &inst.file, &inst.man)?;
        inst.file = FileRef::new(f);

        debug!(name, "instance copied to memory");
        Ok(Some(inst))
    }

    fn new_instance_file(&self) -> Result<File> {
        Memory.new_instance_file()
    }

    fn instance_file_write_supported(&self) -> bool {
        Memory.instance_file_write_supported()
    }

    fn store_instance_supported(&self) -> bool {
        true
    }

    fn store_instance(&self, inst: &mut Instance, name: &str) -> Result<()> {
        let f = self.fs.new_instance_file()?;
        copy_instance(&f, &inst.file, &inst.man)?;

        manifest::write(&f, INST_MANIFEST_OFFSET, INSTANCE_MANIFEST_TAG, &inst.man)?;
        inst.dirty = false;

        f.sync_data()?;
        let dir = self.fs.instance_dir();
        link_temp_file(&f, dir, name)?;
        dir.sync_data()?;

        inst.dir = Some(dir.clone());
        inst.name = Some(name.to_string());
        Ok(())
    }
}

/// Copy the used part of the stack, the globals and the memory.
fn copy_instance(dst: &File, src: &File, man: &InstanceManifest) -> Result<()> {
    let offset = (man.stack_size - man.stack_usage) as u64;
    copy_file_range(src, offset, dst, offset, man.stack_usage as usize)?;

    let globals = man.globals_size as usize;
    let offset = man.stack_size as u64 + (align_page(globals) - globals) as u64;
    copy_file_range(src, offset, dst, offset, globals + man.memory_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::INST_STACK_OFFSET;

    fn manifest() -> InstanceManifest {
        InstanceManifest {
            stack_size: 65536,
            stack_usage: 32,
            globals_size: 16,
            memory_size: 65536,
            max_memory_size: 131072,
            ..Default::default()
        }
    }

    #[test]
    fn store_and_load_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let fs = Arc::new(Filesystem::new(root.path()).unwrap());
        let pmem = PersistentMemory::new(fs.clone());

        let man = manifest();
        let f = pmem.new_instance_file().unwrap();
        let globals_end = INST_STACK_OFFSET + man.stack_size as u64 + align_page(16) as u64;
        f.write_all_at(&[0xaa; 32], man.stack_size as u64 - 32).unwrap();
        f.write_all_at(&[0xbb; 16], globals_end - 16).unwrap();
        f.write_all_at(b"memory", globals_end).unwrap();

        let mut inst = Instance::from_parts(man.clone(), FileRef::new(f));
        pmem.store_instance(&mut inst, "one").unwrap();
        assert_eq!(inst.name(), Some("one"));
        assert!(!inst.dirty);
        assert_eq!(pmem.instances().unwrap(), vec!["one".to_string()]);

        let loaded = pmem.load_instance("one").unwrap().unwrap();
        assert_eq!(loaded.manifest(), &man);
        assert_eq!(loaded.name(), Some("one"));

        let mut stack = [0u8; 32];
        loaded.file.read_exact_at(&mut stack, man.stack_size as u64 - 32).unwrap();
        assert_eq!(stack, [0xaa; 32]);

        let mut mem = [0u8; 6];
        loaded.file.read_exact_at(&mut mem, globals_end).unwrap();
        assert_eq!(&mem, b"memory");

        // The loaded copy is not backed by the stored file.
        loaded.file.write_all_at(b"changed", globals_end).unwrap();
        let again = fs.load_instance("one").unwrap().unwrap();
        again.file.read_exact_at(&mut mem, globals_end).unwrap();
        assert_eq!(&mem, b"memory");
    }
}
