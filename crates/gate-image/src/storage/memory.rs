use std::os::fd::AsRawFd;

use gate_types::Result;
use tracing::debug;

use super::{InstanceStorage, ProgramStorage, Storage};
use crate::file::{check, File};
use crate::instance::Instance;
use crate::layout::{INST_MAX_OFFSET, PROG_MAX_OFFSET};
use crate::program::Program;

const PROGRAM_FILE_NAME: &str = "gate-program";
const INSTANCE_FILE_NAME: &str = "gate-instance";

/// Anonymous memory files.  Programs and instances can't be persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Memory;

/// Memory file sized to `size` bytes.  Seals can be added later.
pub(crate) fn new_memory_file(name: &str, size: u64) -> Result<File> {
    let c_name = crate::file::c_path(name)?;

    // SAFETY: c_name is a valid C string.
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    let f = File::from_syscall(fd, "memfd_create")?;
    f.truncate(size)?;
    Ok(f)
}

pub(crate) fn seal(f: &File, seals: libc::c_int) -> Result<()> {
    // SAFETY: plain fcntl on an owned descriptor.
    check(unsafe { libc::fcntl(f.as_raw_fd(), libc::F_ADD_SEALS, seals) }, "fcntl F_ADD_SEALS")
}

impl ProgramStorage for Memory {
    fn programs(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn load_program(&self, _: &Storage, _: &str) -> Result<Option<Program>> {
        Ok(None)
    }

    fn new_program_file(&self) -> Result<File> {
        new_memory_file(PROGRAM_FILE_NAME, PROG_MAX_OFFSET)
    }

    fn protect_program_file(&self, file: &File) -> Result<()> {
        debug!("sealing program file");
        seal(file, libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE)
    }

    fn store_program(&self, _: &Program, _: &str) -> Result<()> {
        Ok(())
    }
}

impl InstanceStorage for Memory {
    fn instances(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn load_instance(&self, _: &str) -> Result<Option<Instance>> {
        Ok(None)
    }

    fn new_instance_file(&self) -> Result<File> {
        let f = new_memory_file(INSTANCE_FILE_NAME, INST_MAX_OFFSET)?;
        seal(&f, libc::F_SEAL_SHRINK | libc::F_SEAL_GROW)?;
        Ok(f)
    }

    fn instance_file_write_supported(&self) -> bool {
        true
    }

    fn store_instance_supported(&self) -> bool {
        false
    }

    fn store_instance(&self, _: &mut Instance, _: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_file_is_sealed() {
        let f = Memory.new_program_file().unwrap();
        f.write_all_at(b"text", 0).unwrap();
        Memory.protect_program_file(&f).unwrap();

        assert!(f.write_all_at(b"more", 0).is_err());
        assert!(f.truncate(0).is_err());

        let mut buf = [0u8; 4];
        f.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"text");
    }

    #[test]
    fn instance_file_size_is_fixed() {
        let f = Memory.new_instance_file().unwrap();
        f.write_all_at(b"stack", INST_MAX_OFFSET - 5).unwrap();
        assert!(f.truncate(INST_MAX_OFFSET + 4096).is_err());
        assert!(Memory.instance_file_write_supported());
        assert!(!Memory.store_instance_supported());
    }

    #[test]
    fn nothing_is_persisted() {
        assert!(ProgramStorage::programs(&Memory).unwrap().is_empty());
        assert!(Memory.load_instance("x").unwrap().is_none());
        assert!(Memory.load_program(&Storage::memory(), "x").unwrap().is_none());
    }
}
