use std::fs::DirBuilder;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use gate_types::abi::library_checksum;
use gate_types::{ImageError, Result};
use tracing::{debug, warn};

use super::{InstanceStorage, ProgramStorage, Storage};
use crate::file::{c_path, check, File, FileRef};
use crate::instance::Instance;
use crate::layout::{INST_MANIFEST_OFFSET, INST_MAX_OFFSET, PROG_MANIFEST_OFFSET, PROG_MAX_OFFSET, PROG_MODULE_OFFSET};
use crate::manifest::{self, InstanceManifest, ProgramManifest, INSTANCE_MANIFEST_TAG, PROGRAM_MANIFEST_TAG};
use crate::objectmap::ObjectMap;
use crate::program::Program;

const PROGRAM_DIR: &str = "program";
const INSTANCE_DIR: &str = "instance";

/// Files in `program` and `instance` subdirectories of a root directory.
/// Programs and instances can be persisted.
#[derive(Debug)]
pub struct Filesystem {
    prog_dir: FileRef,
    inst_dir: FileRef,
}

impl Filesystem {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_ownership(root, None, None)
    }

    /// Like [`Filesystem::new`], but also changes the owner of the
    /// subdirectories.
    pub fn with_ownership(root: impl AsRef<Path>, uid: Option<u32>, gid: Option<u32>) -> Result<Self> {
        let root = root.as_ref();

        let open = |name: &str| -> Result<FileRef> {
            let path = root.join(name);

            // The root must exist already.
            match DirBuilder::new().mode(0o700).create(&path) {
                Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                    return Err(ImageError::io("mkdir", e));
                }
                _ => {}
            }

            let path = path
                .to_str()
                .ok_or_else(|| ImageError::internal(format!("path is not valid UTF-8: {path:?}")))?;
            let dir = File::open_at(None, path, libc::O_DIRECTORY | libc::O_RDONLY, 0)?;

            if uid.is_some() || gid.is_some() {
                let dot = c_path(".")?;
                // SAFETY: dot is a valid C string and dir is an open directory.
                let ret = unsafe {
                    libc::fchownat(
                        dir.as_raw_fd(),
                        dot.as_ptr(),
                        uid.unwrap_or(u32::MAX),
                        gid.unwrap_or(u32::MAX),
                        0,
                    )
                };
                check(ret, "fchownat")?;
            }

            Ok(FileRef::new(dir))
        };

        let prog_dir = open(PROGRAM_DIR)?;
        let inst_dir = open(INSTANCE_DIR)?;

        debug!(root = %root.display(), "filesystem storage opened");
        Ok(Self { prog_dir, inst_dir })
    }

    pub(crate) fn instance_dir(&self) -> &FileRef {
        &self.inst_dir
    }
}

/// Unlinked file in a directory, sized up front.
fn new_temp_file(dir: &File, mode: libc::mode_t, size: u64) -> Result<File> {
    let f = File::open_at(Some(dir), ".", libc::O_TMPFILE | libc::O_RDWR, mode)?;
    f.truncate(size)?;
    Ok(f)
}

/// Give an unlinked file a name in a directory.
pub(crate) fn link_temp_file(file: &File, dir: &File, name: &str) -> Result<()> {
    let src = c_path(&format!("/proc/self/fd/{}", file.as_raw_fd()))?;
    let dst = c_path(name)?;

    // SAFETY: both paths are valid C strings and dir is an open directory.
    let ret = unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            src.as_ptr(),
            dir.as_raw_fd(),
            dst.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    };
    check(ret, "linkat")
}

/// Open a named file, or `None` if it doesn't exist.
fn open_existing(dir: &File, name: &str, flags: libc::c_int) -> Result<Option<File>> {
    match File::open_at(Some(dir), name, flags, 0) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Regular files in a directory.  The directory is listed through its
/// descriptor, not its original path.
fn list_names(dir: &File) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(format!("/proc/self/fd/{}", dir.as_raw_fd()))
        .map_err(|e| ImageError::io("opendir", e))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ImageError::io("readdir", e))?;
        let file_type = entry.file_type().map_err(|e| ImageError::io("stat", e))?;
        if !file_type.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!(?name, "skipping file with non-UTF-8 name"),
        }
    }

    names.sort();
    Ok(names)
}

impl ProgramStorage for Filesystem {
    fn programs(&self) -> Result<Vec<String>> {
        list_names(&self.prog_dir)
    }

    fn load_program(&self, combined: &Storage, name: &str) -> Result<Option<Program>> {
        let Some(f) = open_existing(&self.prog_dir, name, libc::O_RDONLY)? else {
            return Ok(None);
        };

        let man: ProgramManifest = manifest::read(&f, PROG_MANIFEST_OFFSET, PROGRAM_MANIFEST_TAG)?;
        if man.library_checksum != library_checksum() {
            debug!(name, "stored program has incompatible library checksum");
            return Ok(None);
        }

        let mut call_sites = vec![0u8; man.call_sites_size as usize];
        let mut func_addrs = vec![0u8; man.func_addrs_size as usize];
        let offset = PROG_MODULE_OFFSET + man.object_map_offset();
        f.read_exact_at(&mut call_sites, offset)?;
        f.read_exact_at(&mut func_addrs, offset + call_sites.len() as u64)?;
        let map = ObjectMap::from_bytes(&call_sites, &func_addrs)?;

        debug!(name, module_size = man.module_size, "program loaded");
        Ok(Some(Program::new(combined.clone(), man, FileRef::new(f), map)))
    }

    fn new_program_file(&self) -> Result<File> {
        new_temp_file(&self.prog_dir, 0o400, PROG_MAX_OFFSET)
    }

    fn protect_program_file(&self, _: &File) -> Result<()> {
        Ok(())
    }

    fn store_program(&self, prog: &Program, name: &str) -> Result<()> {
        manifest::write(&prog.file, PROG_MANIFEST_OFFSET, PROGRAM_MANIFEST_TAG, &prog.man)?;
        prog.file.sync_data()?;

        match link_temp_file(&prog.file, &self.prog_dir, name) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                debug!(name, "program already stored");
            }
            r => r?,
        }

        self.prog_dir.sync_data()
    }
}

impl InstanceStorage for Filesystem {
    fn instances(&self) -> Result<Vec<String>> {
        list_names(&self.inst_dir)
    }

    fn load_instance(&self, name: &str) -> Result<Option<Instance>> {
        let Some(f) = open_existing(&self.inst_dir, name, libc::O_RDWR)? else {
            return Ok(None);
        };

        let man: InstanceManifest = manifest::read(&f, INST_MANIFEST_OFFSET, INSTANCE_MANIFEST_TAG)?;

        let mut inst = Instance::from_parts(man, FileRef::new(f));
        inst.dirty = false;
        inst.dir = Some(self.inst_dir.clone());
        inst.name = Some(name.to_string());

        debug!(name, "instance loaded");
        Ok(Some(inst))
    }

    fn new_instance_file(&self) -> Result<File> {
        new_temp_file(&self.inst_dir, 0o600, INST_MAX_OFFSET)
    }

    fn instance_file_write_supported(&self) -> bool {
        true
    }

    fn store_instance_supported(&self) -> bool {
        true
    }

    fn store_instance(&self, inst: &mut Instance, name: &str) -> Result<()> {
        if inst.dirty {
            manifest::write(&inst.file, INST_MANIFEST_OFFSET, INSTANCE_MANIFEST_TAG, &inst.man)?;
            inst.dirty = false;
        }

        inst.file.sync_data()?;
        link_temp_file(&inst.file, &self.inst_dir, name)?;
        self.inst_dir.sync_data()?;

        inst.dir = Some(self.inst_dir.clone());
        inst.name = Some(name.to_string());
        Ok(())
    }
}
