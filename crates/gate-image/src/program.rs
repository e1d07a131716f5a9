use std::io;
use std::sync::Mutex;

use gate_types::{Buffers, ImageError, Result};
use gate_wasm::custom::{read_buffer_section, split_custom_section};
use tracing::debug;

use crate::file::{page_size, File, FileRef};
use crate::layout::{align_page, PROG_MODULE_OFFSET};
use crate::manifest::ProgramManifest;
use crate::objectmap::ObjectMap;
use crate::storage::Storage;

const START_FUNCTION: &str = "_start";

/// Compiled program with its module.  Immutable once built.
#[derive(Debug)]
pub struct Program {
    pub map: ObjectMap,
    pub(crate) storage: Storage,
    pub(crate) man: ProgramManifest,
    pub(crate) file: FileRef,
    store_lock: Mutex<()>,
}

impl Program {
    pub(crate) fn new(storage: Storage, man: ProgramManifest, file: FileRef, map: ObjectMap) -> Self {
        Self {
            map,
            storage,
            man,
            file,
            store_lock: Mutex::new(()),
        }
    }

    pub fn page_size(&self) -> usize {
        page_size()
    }

    /// Text size rounded up to page size.
    pub fn text_size(&self) -> usize {
        align_page(self.man.text_size as usize)
    }

    pub fn module_size(&self) -> u64 {
        self.man.module_size
    }

    /// The program imports random data.
    pub fn random(&self) -> bool {
        self.man.random
    }

    pub fn manifest(&self) -> &ProgramManifest {
        &self.man
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Breakpoints in ascending order, without duplicates.
    pub fn breakpoints(&self) -> &[u64] {
        self.man.breakpoints()
    }

    /// Entry function index, or the implicit `_start` function index.  The
    /// `started` argument is disregarded if the program is a snapshot.
    pub fn resolve_entry_func(&self, export_name: &str, started: bool) -> Result<Option<u32>> {
        let start = if self.man.snapshot_section.is_empty() && !started {
            self.man.entry_indexes.get(START_FUNCTION).copied()
        } else {
            None
        };

        if export_name.is_empty() {
            return Ok(start);
        }
        if start.is_some() {
            return Err(ImageError::StartFunctionConflict);
        }
        if export_name == START_FUNCTION {
            return Ok(None);
        }

        self.man
            .entry_indexes
            .get(export_name)
            .copied()
            .map(Some)
            .ok_or(ImageError::FunctionNotFound)
    }

    /// File containing the text at offset zero.
    pub fn text(&self) -> &File {
        &self.file
    }

    pub fn module_reader(&self) -> ModuleReader {
        ModuleReader {
            file: self.file.clone(),
            pos: PROG_MODULE_OFFSET,
            end: PROG_MODULE_OFFSET + self.man.module_size,
        }
    }

    /// I/O buffers stored in the module's buffer section.
    pub fn load_buffers(&self) -> Result<Buffers> {
        let range = self.man.buffer_section;
        if range.is_empty() {
            return Ok(Buffers::default());
        }

        let mut section = vec![0u8; range.size as usize];
        self.file
            .read_exact_at(&mut section, PROG_MODULE_OFFSET + range.start)?;

        let (_, content, frame_len) = split_custom_section(&section)?;
        let (buffers, header_len) = read_buffer_section(content, range.start as usize + frame_len)?;

        if frame_len + header_len != self.man.buffer_section_header_size as usize {
            return Err(ImageError::internal(format!(
                "buffer section header size is {} instead of {}",
                frame_len + header_len,
                self.man.buffer_section_header_size
            )));
        }

        Ok(buffers)
    }

    /// Give the program a persistent name.  The name must not contain path
    /// separators.
    pub fn store(&self, name: &str) -> Result<()> {
        let _guard = self
            .store_lock
            .lock()
            .map_err(|_| ImageError::internal("program store lock is poisoned"))?;

        debug!(name, "storing program");
        self.storage.programs.store_program(self, name)
    }
}

/// Reader of the module bytes of a program.
#[derive(Debug)]
pub struct ModuleReader {
    file: FileRef,
    pos: u64,
    end: u64,
}

impl ModuleReader {
    /// Bytes left to read.
    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }
}

impl io::Read for ModuleReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.remaining() as usize);
        if n == 0 {
            return Ok(0);
        }

        let n = self
            .file
            .read_at(&mut buf[..n], self.pos)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}
