//! Assembly of a program image and, optionally, an instance image.
//!
//! The compiler writes text and the object map, the module bytes are written
//! as they are read, and the loaders fill in the stack, globals and memory.
//! [`Build::finish_text`], [`Build::finish_program`] and (optionally)
//! [`Build::finish_instance`] must be called in that order.

use std::io;

use gate_types::abi::{STACK_USAGE_OFFSET, TEXT_REVISION};
use gate_types::snapshot::sort_dedup;
use gate_types::{FuncType, ImageError, Result, SectionMap, Snapshot};
use gate_wasm::Module;
use tracing::debug;

use crate::file::{copy_file_range, page_size, File, FileRef, Mapping, Protection};
use crate::instance::{max_instance_memory, Instance};
use crate::layout::{align8, align_page, MAX_TEXT_SIZE, PROG_GLOBALS_PAGE_OFFSET, PROG_MODULE_OFFSET, PROG_TEXT_OFFSET};
use crate::manifest::{Function, InstanceManifest, ProgramManifest};
use crate::objectmap::ObjectMap;
use crate::program::Program;
use crate::stack::import_stack;
use crate::storage::Storage;

/// Everything about a finished module which the program manifest needs.
#[derive(Debug, Clone, Copy)]
pub struct ProgramDetails<'a> {
    pub sections: &'a SectionMap,
    pub module: &'a Module,
    pub start_func: Option<u32>,
    /// Record the exported functions which can be used as entry functions.
    pub entry_funcs: bool,
    pub snapshot: Option<&'a Snapshot>,
    pub buffer_section_header_size: u32,
    /// The program imports random data.
    pub random: bool,
}

#[derive(Debug)]
struct Region {
    mem: Option<Mapping>,
    len: usize,
    cap: usize,
}

impl Region {
    fn empty() -> Self {
        Self {
            mem: None,
            len: 0,
            cap: 0,
        }
    }

    fn map(file: &File, offset: u64, cap: usize) -> Result<Self> {
        Ok(Self {
            mem: Mapping::map(file, offset, cap, Protection::ReadWrite)?,
            len: 0,
            cap,
        })
    }

    /// Writable contents and length.
    fn parts(&mut self) -> (&mut [u8], &mut usize) {
        let mem = match &mut self.mem {
            Some(m) => &mut m.as_mut_slice()[..self.cap],
            None => &mut [],
        };
        (mem, &mut self.len)
    }
}

/// Program (and instance) under construction.  Files and mappings are
/// released when the build is closed or dropped.
#[derive(Debug)]
pub struct Build {
    storage: Storage,
    want_instance: bool,

    prog_file: Option<File>,
    inst_file: Option<File>,
    inst_stack_size: usize,

    text: Region,
    text_size: usize,
    text_finished: bool,
    module: Region,
    map: ObjectMap,

    /// Stack, globals and memory: the stack ends at the first page boundary.
    state: Option<Mapping>,
    stack_map_size: usize,
    stack_len: usize,
    stack_usage: usize,
    data_len: usize,
    data_cap: usize,

    text_addr: u64,
    globals_size: usize,
    memory_size: usize,
}

impl Build {
    /// Start building a program with a module of `module_size` bytes and at
    /// most `max_text_size` bytes of machine code.
    pub fn new(storage: Storage, module_size: usize, max_text_size: usize, want_instance: bool) -> Result<Self> {
        if max_text_size > MAX_TEXT_SIZE {
            return Err(ImageError::resource_limit("text size limit exceeded"));
        }

        let prog_file = storage.programs.new_program_file()?;
        let text = Region::map(&prog_file, PROG_TEXT_OFFSET, max_text_size)?;
        let module = Region::map(&prog_file, PROG_MODULE_OFFSET, module_size)?;

        debug!(module_size, max_text_size, want_instance, "build started");

        Ok(Self {
            storage,
            want_instance,
            prog_file: Some(prog_file),
            inst_file: None,
            inst_stack_size: 0,
            text,
            text_size: 0,
            text_finished: false,
            module,
            map: ObjectMap::default(),
            state: None,
            stack_map_size: 0,
            stack_len: 0,
            stack_usage: 0,
            data_len: 0,
            data_cap: 0,
            text_addr: 0,
            globals_size: 0,
            memory_size: 0,
        })
    }

    pub fn object_map(&self) -> &ObjectMap {
        &self.map
    }

    /// Text buffer and object map for the compiler.  Valid until
    /// [`Build::finish_text`].
    pub fn code_buffers(&mut self) -> Result<(TextBuffer<'_>, &mut ObjectMap)> {
        if self.text_finished {
            return Err(ImageError::InvalidState);
        }

        let cap = self.text.cap;
        let (mem, len) = self.text.parts();
        let text = TextBuffer { mem, len, cap };
        Ok((text, &mut self.map))
    }

    /// Writer of the module bytes.  Exactly the declared module size must be
    /// written before [`Build::finish_program`].
    pub fn module_writer(&mut self) -> ModuleWriter<'_> {
        let cap = self.module.cap;
        let (mem, len) = self.module.parts();
        ModuleWriter { mem, len, cap }
    }

    /// Finish the text and lay out the stack, globals and memory.
    pub fn finish_text(&mut self, stack_size: usize, stack_usage: usize, globals_size: usize, memory_size: usize) -> Result<()> {
        if self.text_finished {
            return Err(ImageError::InvalidState);
        }
        if stack_size < STACK_USAGE_OFFSET + stack_usage {
            return Err(ImageError::resource_limit("call stack size limit exceeded"));
        }

        let prog_file = self.prog_file.as_ref().ok_or(ImageError::InvalidState)?;

        self.text_size = self.text.len;
        self.text = Region::empty();
        self.text_finished = true;

        let stack_map_size = align_page(stack_usage);
        let data_map_size = align_page(globals_size) + align_page(memory_size);
        let map_size = stack_map_size + data_map_size;

        if self.want_instance {
            self.inst_stack_size = align_page(stack_size);
            let f = self.storage.instances.new_instance_file()?;
            self.state = Mapping::map(
                &f,
                (self.inst_stack_size - stack_map_size) as u64,
                map_size,
                Protection::ReadWrite,
            )?;
            self.inst_file = Some(f);
        } else {
            self.state = Mapping::map(
                prog_file,
                PROG_GLOBALS_PAGE_OFFSET - stack_map_size as u64,
                map_size,
                Protection::ReadWrite,
            )?;
        }

        self.stack_map_size = stack_map_size;
        self.stack_len = stack_usage;
        self.data_cap = data_map_size;
        self.globals_size = globals_size;
        self.memory_size = memory_size;

        // The object map is packed right after the module.
        let offset = align8(self.module.cap as u64);
        let end = offset as usize + self.map.call_sites_size() + self.map.func_addrs_size();
        match self.module.mem.as_mut().filter(|m| align_page(end) <= m.len()) {
            Some(module) => self.map.copy_to(&mut module.as_mut_slice()[offset as usize..])?,
            None => self.map.write_at(prog_file, PROG_MODULE_OFFSET + offset)?,
        }

        debug!(
            text_size = self.text_size,
            stack_usage,
            globals_size,
            memory_size,
            "text finished"
        );
        Ok(())
    }

    /// Read a portable stack and store it in native form at a new random
    /// text address.  Only valid if [`Build::finish_text`] was called with
    /// nonzero stack usage.
    pub fn read_stack(&mut self, mut r: impl io::Read, types: &[FuncType], func_type_indexes: &[u32]) -> Result<()> {
        if self.stack_len == 0 || self.stack_usage != 0 {
            return Err(ImageError::InvalidState);
        }

        let mem = self.state.as_mut().ok_or(ImageError::InvalidState)?;
        let stack = &mut mem.as_mut_slice()[self.stack_map_size - self.stack_len..self.stack_map_size];
        r.read_exact(stack).map_err(|e| ImageError::io("read stack", e))?;

        let text_addr = gate_types::abi::random_text_addr(page_size() as u64)?;
        import_stack(stack, text_addr, &self.map, types, func_type_indexes)?;

        self.text_addr = text_addr;
        self.stack_usage = self.stack_len;
        Ok(())
    }

    /// Globals and memory buffer.  Valid after [`Build::finish_text`].  The
    /// globals are aligned against the end of their pages, and memory starts
    /// at the next page boundary.
    pub fn globals_memory(&mut self) -> Result<DataBuffer<'_>> {
        if !self.text_finished {
            return Err(ImageError::InvalidState);
        }

        let mem = match &mut self.state {
            Some(m) => &mut m.as_mut_slice()[self.stack_map_size..self.stack_map_size + self.data_cap],
            None => &mut [],
        };
        Ok(DataBuffer {
            mem,
            len: &mut self.data_len,
        })
    }

    /// Alignment of memory within the globals and memory buffer.
    pub fn memory_alignment(&self) -> usize {
        page_size()
    }

    /// Finish the program after module, stack, globals and memory have been
    /// populated.
    pub fn finish_program(&mut self, details: ProgramDetails<'_>) -> Result<Program> {
        if !self.text_finished {
            return Err(ImageError::InvalidState);
        }
        if self.stack_usage != self.stack_len {
            return Err(ImageError::internal("stack was not populated"));
        }
        if self.module.len != self.module.cap {
            return Err(ImageError::internal(format!(
                "module has {} bytes instead of {}",
                self.module.len, self.module.cap
            )));
        }

        let prog_file = self.prog_file.take().ok_or(ImageError::InvalidState)?;

        // No writable mappings may remain when the file is protected.
        self.state = None;
        self.module.mem = None;

        if let Some(inst_file) = &self.inst_file {
            copy_file_range(
                inst_file,
                (self.inst_stack_size - self.stack_map_size) as u64,
                &prog_file,
                PROG_GLOBALS_PAGE_OFFSET - self.stack_map_size as u64,
                self.stack_map_size + align_page(self.data_len),
            )?;
        }

        self.storage.programs.protect_program_file(&prog_file)?;

        let man = self.program_manifest(&details)?;
        let map = std::mem::take(&mut self.map);

        debug!(
            text_size = man.text_size,
            module_size = man.module_size,
            stack_usage = man.stack_usage,
            entry_funcs = man.entry_indexes.len(),
            "program finished"
        );

        Ok(Program::new(self.storage.clone(), man, FileRef::new(prog_file), map))
    }

    fn program_manifest(&self, details: &ProgramDetails<'_>) -> Result<ProgramManifest> {
        let func_addr = |index: u32| {
            self.map
                .func_addrs
                .get(index as usize)
                .copied()
                .ok_or_else(|| ImageError::internal(format!("no address for function {index}")))
        };

        let mut man = ProgramManifest {
            library_checksum: gate_types::abi::library_checksum(),
            text_revision: TEXT_REVISION,
            text_addr: self.text_addr,
            text_size: self.text_size as u32,
            stack_usage: self.stack_usage as u32,
            globals_size: self.globals_size as u32,
            memory_size: self.memory_size as u32,
            memory_size_limit: details.module.memory_size_limit(),
            memory_data_size: self.data_len.saturating_sub(align_page(self.globals_size)) as u32,
            module_size: self.module.cap as u64,
            sections: details.sections.sections,
            snapshot_section: details.sections.snapshot,
            export_section_wrap: details.sections.export_wrap,
            buffer_section: details.sections.buffer,
            buffer_section_header_size: details.buffer_section_header_size,
            stack_section: details.sections.stack,
            global_types: details.module.global_types(),
            call_sites_size: self.map.call_sites_size() as u32,
            func_addrs_size: self.map.func_addrs_size() as u32,
            random: details.random,
            ..ProgramManifest::default()
        };

        if let Some(index) = details.start_func {
            man.start_func = Some(Function {
                index,
                addr: func_addr(index)?,
            });
        }

        if details.entry_funcs {
            for (name, &index) in details.module.export_funcs() {
                if details.module.func_type(index).is_some_and(FuncType::is_entry) {
                    man.entry_indexes.insert(name.clone(), index);
                    man.entry_addrs.insert(index, func_addr(index)?);
                }
            }
        }

        if let Some(snap) = details.snapshot {
            man.snapshot = Some(Snapshot {
                monotonic_time: snap.monotonic_time,
                breakpoints: sort_dedup(snap.breakpoints.clone()),
                ..Snapshot::default()
            });
        }

        Ok(man)
    }

    /// Finish the instance after [`Build::finish_program`].  Only valid if
    /// the build was started with an instance.
    pub fn finish_instance(&mut self, prog: &Program, max_memory_size: usize, entry_index: Option<u32>) -> Result<Instance> {
        let max_memory_size = max_instance_memory(prog, max_memory_size)?;

        if entry_index.is_some() && self.stack_usage != 0 {
            return Err(ImageError::Suspended);
        }

        let entry_func = entry_index
            .map(|i| prog.man.entry_func(i).ok_or(ImageError::FunctionNotFound))
            .transpose()?;

        let file = self.inst_file.take().ok_or(ImageError::InvalidState)?;

        debug!(stack_size = self.inst_stack_size, stack_usage = self.stack_usage, "instance finished");

        Ok(Instance::from_parts(
            InstanceManifest {
                text_addr: self.text_addr,
                stack_size: self.inst_stack_size as u32,
                stack_usage: self.stack_usage as u32,
                globals_size: self.globals_size as u32,
                memory_size: self.memory_size as u32,
                max_memory_size: max_memory_size as u32,
                start_func: prog.man.start_func,
                entry_func,
                snapshot: prog.man.snapshot.clone(),
            },
            FileRef::new(file),
        ))
    }

    /// Release files and mappings.  Calling this again does nothing.
    pub fn close(&mut self) {
        self.text = Region::empty();
        self.module = Region::empty();
        self.state = None;
        self.prog_file = None;
        self.inst_file = None;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Buffers
// ══════════════════════════════════════════════════════════════════════════════

fn buffer_full(what: &str) -> ImageError {
    ImageError::resource_limit(format!("{what} size limit exceeded"))
}

/// Bounded text mapping.
#[derive(Debug)]
pub struct TextBuffer<'a> {
    mem: &'a mut [u8],
    len: &'a mut usize,
    cap: usize,
}

impl TextBuffer<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.mem[..*self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mem[..*self.len]
    }

    pub fn len(&self) -> usize {
        *self.len
    }

    pub fn is_empty(&self) -> bool {
        *self.len == 0
    }

    /// Grow by `n` bytes and return the new part.
    pub fn extend(&mut self, n: usize) -> Result<&mut [u8]> {
        let start = *self.len;
        let end = start.checked_add(n).filter(|&end| end <= self.cap).ok_or_else(|| buffer_full("text"))?;
        *self.len = end;
        Ok(&mut self.mem[start..end])
    }

    pub fn put_byte(&mut self, b: u8) -> Result<()> {
        self.extend(1)?[0] = b;
        Ok(())
    }

    /// Little-endian.
    pub fn put_u32(&mut self, x: u32) -> Result<()> {
        self.extend(4)?.copy_from_slice(&x.to_le_bytes());
        Ok(())
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> Result<()> {
        self.extend(b.len())?.copy_from_slice(b);
        Ok(())
    }
}

/// Module bytes mapping.  Writing more than the declared module size fails.
#[derive(Debug)]
pub struct ModuleWriter<'a> {
    mem: &'a mut [u8],
    len: &'a mut usize,
    cap: usize,
}

impl io::Write for ModuleWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.cap - *self.len);
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "module size exceeded"));
        }
        self.mem[*self.len..*self.len + n].copy_from_slice(&buf[..n]);
        *self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Globals and memory contents.
#[derive(Debug)]
pub struct DataBuffer<'a> {
    mem: &'a mut [u8],
    len: &'a mut usize,
}

impl DataBuffer<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.mem[..*self.len]
    }

    pub fn len(&self) -> usize {
        *self.len
    }

    pub fn is_empty(&self) -> bool {
        *self.len == 0
    }

    /// Set the length of the contents.  New bytes are zero.
    pub fn resize_bytes(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.mem.len() {
            return Err(buffer_full("memory"));
        }
        if n < *self.len {
            self.mem[n..*self.len].fill(0);
        }
        *self.len = n;
        Ok(&mut self.mem[..n])
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn text_buffer_is_bounded() {
        let mut b = Build::new(Storage::memory(), 0, 16, false).unwrap();
        let (mut text, _) = b.code_buffers().unwrap();

        text.put_u32(0x0403_0201).unwrap();
        text.put_byte(5).unwrap();
        text.extend(11).unwrap().fill(0xcc);
        assert_eq!(text.len(), 16);
        assert_eq!(&text.bytes()[..5], &[1, 2, 3, 4, 5]);

        let err = text.put_byte(0).unwrap_err();
        assert_eq!(err.kind(), gate_types::ErrorKind::ResourceLimit);
    }

    #[test]
    fn text_size_limit() {
        let err = Build::new(Storage::memory(), 0, MAX_TEXT_SIZE + 1, false).unwrap_err();
        assert_eq!(err.kind(), gate_types::ErrorKind::ResourceLimit);
    }

    #[test]
    fn module_writer_is_bounded() {
        let mut b = Build::new(Storage::memory(), 4, 0, false).unwrap();
        let mut w = b.module_writer();
        w.write_all(b"\0asm").unwrap();
        assert!(w.write_all(b"x").is_err());
    }

    #[test]
    fn stack_must_fit() {
        let mut b = Build::new(Storage::memory(), 0, 0, false).unwrap();
        let err = b.finish_text(8192, 4097, 0, 0).unwrap_err();
        assert_eq!(err.kind(), gate_types::ErrorKind::ResourceLimit);
        b.finish_text(8192, 4096, 0, 0).unwrap();
        assert!(b.finish_text(8192, 0, 0, 0).is_err());
    }

    #[test]
    fn data_buffer_resizes_within_bounds() {
        let mut b = Build::new(Storage::memory(), 0, 0, false).unwrap();
        b.finish_text(65536, 0, 8, 65536).unwrap();

        let cap = align_page(8) + 65536;
        let mut data = b.globals_memory().unwrap();
        data.resize_bytes(cap).unwrap()[cap - 1] = 7;
        assert_eq!(data.len(), cap);
        assert!(data.resize_bytes(cap + 1).is_err());

        data.resize_bytes(16).unwrap();
        assert_eq!(data.resize_bytes(cap).unwrap()[cap - 1], 0);
    }

    #[test]
    fn close_is_idempotent() {
        let mut b = Build::new(Storage::memory(), 8, 4096, true).unwrap();
        b.close();
        b.close();
        assert!(b.finish_text(65536, 0, 0, 0).is_err());
    }
}
