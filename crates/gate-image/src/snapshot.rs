//! Conversion of an instance into a new program.
//!
//! The new program's module re-encodes the instance state: memory size,
//! global values, snapshot record, I/O buffers, call stack and memory
//! contents replace the corresponding parts of the original module.
//! Sections are laid out in this order:
//!
//! ```text
//! header
//! type, import, function, table   (copied)
//! memory, global                  (synthesized)
//! gate.snapshot                   (synthesized)
//! gate.export frame               (if the exports must be hidden)
//! export, element, code           (copied)
//! gate.buffer                     (if there are buffers)
//! gate.stack                      (if there is a stack)
//! data                            (synthesized)
//! trailing custom sections        (copied)
//! ```

use gate_types::abi::MODULE_HEADER_SIZE;
use gate_types::{Buffers, ByteRange, ImageError, Result, SectionId, NUM_SECTIONS};
use gate_wasm::custom::{buffer_section_header, export_section_wrap_frame, snapshot_section, stack_section_header};
use gate_wasm::section::{global_section, memory_section};
use tracing::debug;

use crate::data::data_section;
use crate::file::{copy_file_range, page_size, File, FileRef, Mapping, Protection};
use crate::instance::Instance;
use crate::layout::{align_page, PROG_GLOBALS_PAGE_OFFSET, PROG_MODULE_OFFSET, PROG_TEXT_OFFSET};
use crate::manifest::ProgramManifest;
use crate::program::Program;
use crate::stack::{export_stack, init_stack, native_init_stack};

/// Stack carried over to the new program.
enum Stack {
    /// Execution has finished, or the state is not resumable.
    None,
    /// Native stack of the instance, at the instance's text address.
    Native(Vec<u8>),
    /// Execution has not started: resume at the beginning of the enter
    /// routine, which calls the start and entry functions.
    Init,
}

/// Create a new program from an instance.  The instance must not be
/// undergoing mutation.  If `suspended` is false and the instance is not
/// final, the new program carries no stack.
pub fn snapshot(old: &Program, inst: &Instance, buffers: &Buffers, suspended: bool) -> Result<Program> {
    if !inst.coherent {
        return Err(ImageError::InvalidState);
    }

    let stack = if suspended || inst.is_final() {
        if inst.man.stack_usage != 0 {
            Stack::Native(inst.read_stack()?)
        } else if suspended {
            Stack::Init
        } else {
            Stack::None
        }
    } else {
        Stack::None
    };

    // The mapping starts at the page boundary below the used stack.
    let stack_page_size = match &stack {
        Stack::Native(b) => align_page(b.len()),
        _ => 0,
    };
    let globals_page_size = align_page(inst.man.globals_size as usize);
    let map_offset = inst.globals_page_offset() - stack_page_size as u64;
    let map_size = stack_page_size + globals_page_size + inst.man.memory_size as usize;

    let state = Mapping::map(&inst.file, map_offset, map_size, Protection::ReadPrivate)?;
    let state = state.as_ref().map_or(&[][..], |m| &m.as_slice()[..map_size]);
    let globals = &state[stack_page_size..stack_page_size + globals_page_size];
    let memory = &state[stack_page_size + globals_page_size..];

    let (text_addr, native_stack, portable_stack) = match &stack {
        Stack::None => (0, Vec::new(), Vec::new()),
        Stack::Native(b) => (inst.man.text_addr, b.clone(), export_stack(b, inst.man.text_addr, &old.map)?),
        Stack::Init => {
            let text_addr = gate_types::abi::random_text_addr(page_size() as u64)?;
            let start = inst.man.start_func.as_ref();
            let entry = inst.man.entry_func.as_ref();
            (
                text_addr,
                native_init_stack(text_addr, &old.map, start, entry)?,
                init_stack(start, entry),
            )
        }
    };
    let has_stack = !portable_stack.is_empty();

    let snap = inst.man.snapshot.clone().unwrap_or_default();

    let sections = Sections {
        memory: memory_section(inst.man.memory_size, old.man.memory_size_limit),
        global: global_section(&old.man.global_types, globals)?,
        snapshot: snapshot_section(&snap)?,
        export_wrap: match old.man.section(SectionId::Export).size {
            n if n > 0 && has_stack => export_section_wrap_frame(n)?,
            _ => Vec::new(),
        },
        buffer: buffer_section_header(buffers)?,
        stack_header: if has_stack {
            stack_section_header(portable_stack.len())?
        } else {
            Vec::new()
        },
        stack: portable_stack,
        data: data_section(&inst.file, inst.memory_offset(), memory)?,
    };

    let file = old.storage.programs.new_program_file()?;

    copy_file_range(&old.file, PROG_TEXT_OFFSET, &file, PROG_TEXT_OFFSET, align_page(old.man.text_size as usize))?;

    let state_len = globals_page_size + align_page(inst.man.memory_size as usize);
    match &stack {
        Stack::Native(_) => copy_file_range(
            &inst.file,
            map_offset,
            &file,
            PROG_GLOBALS_PAGE_OFFSET - stack_page_size as u64,
            stack_page_size + state_len,
        )?,
        _ => copy_file_range(&inst.file, inst.globals_page_offset(), &file, PROG_GLOBALS_PAGE_OFFSET, state_len)?,
    }
    if let Stack::Init = stack {
        file.write_all_at(&native_stack, PROG_GLOBALS_PAGE_OFFSET - native_stack.len() as u64)?;
    }

    let mut man = ProgramManifest {
        library_checksum: old.man.library_checksum,
        text_revision: old.man.text_revision,
        text_addr,
        text_size: old.man.text_size,
        stack_usage: native_stack.len() as u32,
        globals_size: old.man.globals_size,
        memory_size: inst.man.memory_size,
        memory_size_limit: old.man.memory_size_limit,
        memory_data_size: inst.man.memory_size,
        global_types: old.man.global_types.clone(),
        call_sites_size: old.man.call_sites_size,
        func_addrs_size: old.man.func_addrs_size,
        start_func: old.man.start_func,
        entry_indexes: old.man.entry_indexes.clone(),
        entry_addrs: old.man.entry_addrs.clone(),
        random: old.man.random,
        snapshot: Some(snap),
        ..ProgramManifest::default()
    };

    write_module(&old.file, &old.man, &file, &sections, buffers, &mut man)?;

    // The object map follows the module.
    old.map.write_at(&file, PROG_MODULE_OFFSET + man.object_map_offset())?;

    old.storage.programs.protect_program_file(&file)?;

    debug!(
        module_size = man.module_size,
        stack_usage = man.stack_usage,
        memory_size = man.memory_size,
        data_size = man.sections[SectionId::Data.index()].size,
        "snapshot created"
    );

    Ok(Program::new(old.storage.clone(), man, FileRef::new(file), old.map.clone()))
}

/// Synthesized sections of the new module.
struct Sections {
    memory: Vec<u8>,
    global: Vec<u8>,
    snapshot: Vec<u8>,
    export_wrap: Vec<u8>,
    /// Header and total section size.
    buffer: Option<(Vec<u8>, u32)>,
    stack_header: Vec<u8>,
    stack: Vec<u8>,
    data: Vec<u8>,
}

/// Module region writer which keeps track of the position.
struct ModuleOutput<'a> {
    src: &'a File,
    dst: &'a File,
    pos: u64,
}

impl ModuleOutput<'_> {
    /// Copy a range of the old module.
    fn copy(&mut self, r: ByteRange) -> Result<ByteRange> {
        if r.is_empty() {
            return Ok(ByteRange::default());
        }
        copy_file_range(
            self.src,
            PROG_MODULE_OFFSET + r.start,
            self.dst,
            PROG_MODULE_OFFSET + self.pos,
            r.size as usize,
        )?;
        Ok(self.advance(r.size as u64))
    }

    fn write(&mut self, b: &[u8]) -> Result<ByteRange> {
        if b.is_empty() {
            return Ok(ByteRange::default());
        }
        self.dst.write_all_at(b, PROG_MODULE_OFFSET + self.pos)?;
        Ok(self.advance(b.len() as u64))
    }

    fn advance(&mut self, n: u64) -> ByteRange {
        let r = ByteRange::new(self.pos, n as u32);
        self.pos += n;
        r
    }
}

fn write_module(
    src: &File,
    old: &ProgramManifest,
    dst: &File,
    new: &Sections,
    buffers: &Buffers,
    man: &mut ProgramManifest,
) -> Result<()> {
    let mut out = ModuleOutput { src, dst, pos: 0 };
    let mut ranges = [ByteRange::default(); NUM_SECTIONS];

    out.copy(ByteRange::new(0, MODULE_HEADER_SIZE))?;

    for id in [SectionId::Type, SectionId::Import, SectionId::Function, SectionId::Table] {
        ranges[id.index()] = out.copy(old.section(id))?;
    }

    ranges[SectionId::Memory.index()] = out.write(&new.memory)?;
    ranges[SectionId::Global.index()] = out.write(&new.global)?;
    man.snapshot_section = out.write(&new.snapshot)?;

    let wrap = out.write(&new.export_wrap)?;

    ranges[SectionId::Export.index()] = out.copy(old.section(SectionId::Export))?;
    if !wrap.is_empty() {
        man.export_section_wrap = ByteRange::new(wrap.start, wrap.size + ranges[SectionId::Export.index()].size);
    }

    // The start function has been called, or it is called by the stack.
    for id in [SectionId::Element, SectionId::Code] {
        ranges[id.index()] = out.copy(old.section(id))?;
    }

    if let Some((header, section_len)) = &new.buffer {
        let start = out.write(header)?.start;
        out.write(&buffers.input)?;
        out.write(&buffers.output)?;
        for s in &buffers.services {
            out.write(&s.buffer)?;
        }
        if out.pos - start != *section_len as u64 {
            return Err(ImageError::internal("buffer section size mismatch"));
        }
        man.buffer_section = ByteRange::new(start, *section_len);
        man.buffer_section_header_size = header.len() as u32;
    }

    if !new.stack_header.is_empty() {
        let start = out.write(&new.stack_header)?.start;
        out.write(&new.stack)?;
        man.stack_section = ByteRange::new(start, (out.pos - start) as u32);
    }

    ranges[SectionId::Data.index()] = out.write(&new.data)?;

    let trailing = old.sections_end();
    out.copy(ByteRange::new(trailing, old.module_size.saturating_sub(trailing) as u32))?;

    man.sections = ranges;
    man.module_size = out.pos;
    Ok(())
}
