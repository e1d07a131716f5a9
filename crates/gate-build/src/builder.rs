//! Phased program builder.
//!
//! Custom sections of the snapshot family are accepted only at certain
//! positions of the module:
//!
//! | Phase   | Sections                              | Accepted                          |
//! |---------|---------------------------------------|-----------------------------------|
//! | `Early` | before the code section               | `gate.snapshot`, `gate.export`    |
//! | `Data`  | between the code and data sections    | `gate.buffer`, `gate.stack`       |
//! | `Late`  | after the data section                | none                              |
//!
//! Each section may appear once.  A `gate.buffer` must precede `gate.stack`.

use std::collections::BTreeMap;

use gate_image::{Build, Instance, Program, ProgramDetails, Storage};
use gate_types::abi::{STACK_USAGE_OFFSET, WASM_PAGE_SIZE};
use gate_types::{Buffers, ImageError, Result, SectionId, Snapshot};
use gate_wasm::custom::{read_buffer_section, read_snapshot_section, unwrap_export_section};
use gate_wasm::section::put_global_value;
use gate_wasm::{
    CustomSection, ImportKind, InitExpr, Module, SECTION_BUFFER, SECTION_EXPORT, SECTION_SNAPSHOT, SECTION_STACK,
};
use tracing::debug;

use crate::compile::{code_payload, Breakpoint, CodeConfig, Compiler, ImportResolver};
use crate::entry::resolve_entry_func;

/// Position of a custom section relative to the code and data sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Early,
    Data,
    Late,
}

impl Phase {
    fn of(c: &CustomSection) -> Self {
        match c.follows {
            Some(SectionId::Code) => Phase::Data,
            Some(SectionId::Data) => Phase::Late,
            _ => Phase::Early,
        }
    }
}

/// What happens when a snapshot-family section is encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loader {
    Load,
    Duplicate,
    TooEarly,
    TooLate,
}

impl Loader {
    fn check(self, name: &str) -> Result<()> {
        match self {
            Loader::Load => Ok(()),
            Loader::Duplicate => Err(ImageError::bad_module(format!("multiple {name} sections in wasm module"))),
            Loader::TooEarly => Err(ImageError::bad_module(format!("{name} section appears too early in wasm module"))),
            Loader::TooLate => Err(ImageError::bad_module(format!("{name} section appears too late in wasm module"))),
        }
    }
}

#[derive(Debug)]
struct Loaders {
    snapshot: Loader,
    export: Loader,
    buffer: Loader,
    stack: Loader,
}

/// Program build driven through its phases by the caller.
#[derive(Debug)]
pub struct Builder<'m> {
    bytes: &'m [u8],
    module: Module,
    image: Build,

    phase: Phase,
    loaders: Loaders,

    stack_size: usize,
    max_memory_size: usize,
    entry_index: Option<u32>,
    import_funcs: Vec<u32>,
    /// Values of imported globals, by global index.
    import_globals: Vec<u64>,
    random: bool,

    snapshot: Option<Snapshot>,
    breakpoints: BTreeMap<u32, Breakpoint>,
    buffers: Buffers,
    buffer_section_header_size: u32,
}

impl<'m> Builder<'m> {
    /// Load module declarations and copy the module into a new program
    /// image.  Early snapshot loaders are in effect.
    pub fn new(storage: Storage, bytes: &'m [u8], max_text_size: usize, want_instance: bool) -> Result<Self> {
        let module = Module::load(bytes)?;

        let mut image = Build::new(storage, bytes.len(), max_text_size, want_instance)?;
        std::io::Write::write_all(&mut image.module_writer(), bytes)
            .map_err(|e| ImageError::io("write module", e))?;

        Ok(Self {
            bytes,
            module,
            image,
            phase: Phase::Early,
            loaders: Loaders {
                snapshot: Loader::Load,
                export: Loader::Load,
                buffer: Loader::TooEarly,
                stack: Loader::TooEarly,
            },
            stack_size: 0,
            max_memory_size: 0,
            entry_index: None,
            import_funcs: Vec::new(),
            import_globals: Vec::new(),
            random: false,
            snapshot: None,
            breakpoints: BTreeMap::new(),
            buffers: Buffers::default(),
            buffer_section_header_size: 0,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    pub fn take_buffers(&mut self) -> Buffers {
        std::mem::take(&mut self.buffers)
    }

    pub fn entry_index(&self) -> Option<u32> {
        self.entry_index
    }

    pub fn image(&self) -> &Build {
        &self.image
    }

    pub fn set_stack_size(&mut self, stack_size: usize) {
        self.stack_size = stack_size;
    }

    // ── Custom sections ──────────────────────────────────────────────────

    /// Load the custom sections which belong to the current phase.
    pub fn load_custom_sections(&mut self) -> Result<()> {
        let customs: Vec<CustomSection> = self
            .module
            .custom_sections()
            .iter()
            .filter(|c| Phase::of(c) == self.phase)
            .cloned()
            .collect();

        for c in &customs {
            self.load_custom_section(c)?;
        }
        Ok(())
    }

    fn load_custom_section(&mut self, c: &CustomSection) -> Result<()> {
        match c.name.as_str() {
            SECTION_SNAPSHOT => {
                self.loaders.snapshot.check(SECTION_SNAPSHOT)?;
                self.load_snapshot(c)
            }
            SECTION_EXPORT => {
                self.loaders.export.check(SECTION_EXPORT)?;
                self.load_export(c)
            }
            SECTION_BUFFER => {
                self.loaders.buffer.check(SECTION_BUFFER)?;
                self.load_buffer(c)
            }
            SECTION_STACK => {
                self.loaders.stack.check(SECTION_STACK)?;
                self.load_stack(c)
            }
            _ => Ok(()),
        }
    }

    fn load_snapshot(&mut self, c: &CustomSection) -> Result<()> {
        self.loaders.snapshot = Loader::Duplicate;

        let snap = read_snapshot_section(&self.bytes[c.content.clone()], c.content.start)?;
        debug!(
            monotonic_time = snap.monotonic_time,
            breakpoints = snap.breakpoints.len(),
            "snapshot section loaded"
        );

        self.module.sections_mut().snapshot = c.range;
        self.snapshot = Some(snap);
        Ok(())
    }

    fn load_export(&mut self, c: &CustomSection) -> Result<()> {
        if self.snapshot.is_none() {
            return Err(ImageError::bad_module("gate.export section without gate.snapshot section"));
        }

        let wrapped = unwrap_export_section(&self.bytes[c.content.clone()], c.content.start)?;
        self.module.unwrap_exports(wrapped, c.range)
    }

    fn load_buffer(&mut self, c: &CustomSection) -> Result<()> {
        self.loaders.snapshot = Loader::TooLate;
        self.loaders.buffer = Loader::Duplicate;

        if self.snapshot.is_none() {
            return Err(ImageError::bad_module("gate.buffer section without gate.snapshot section"));
        }

        let (buffers, header_len) = read_buffer_section(&self.bytes[c.content.clone()], c.content.start)?;
        let frame_len = c.content.start - c.range.start as usize;

        self.buffer_section_header_size = (frame_len + header_len) as u32;
        self.buffers = buffers;
        self.module.sections_mut().buffer = c.range;
        Ok(())
    }

    fn load_stack(&mut self, c: &CustomSection) -> Result<()> {
        self.loaders.snapshot = Loader::TooLate;
        self.loaders.buffer = Loader::TooLate;
        self.loaders.stack = Loader::Duplicate;

        if self.snapshot.is_none() {
            return Err(ImageError::bad_module("gate.stack section without gate.snapshot section"));
        }
        if self.entry_index.is_some() {
            return Err(ImageError::Suspended);
        }

        let bytes = self.bytes;
        let stack = &bytes[c.content.clone()];
        if stack.is_empty() {
            return Err(ImageError::bad_module("gate.stack section is empty"));
        }
        if stack.len() > self.stack_size.saturating_sub(STACK_USAGE_OFFSET) {
            return Err(ImageError::bad_module("gate.stack section is too large"));
        }

        self.finish_text(stack.len())?;
        self.image
            .read_stack(stack, self.module.types(), self.module.func_type_indexes())?;

        self.module.sections_mut().stack = c.range;
        Ok(())
    }

    /// Enter the data phase, after the code section has been compiled.
    pub fn install_snapshot_data_loaders(&mut self) {
        self.phase = Phase::Data;
        self.loaders.export = Loader::TooLate;
        self.loaders.buffer = Loader::Load;
        self.loaders.stack = Loader::Load;
        debug!("snapshot data loaders installed");
    }

    /// Enter the late phase, before the data section is loaded.
    pub fn install_late_snapshot_loaders(&mut self) {
        self.phase = Phase::Late;
        self.loaders = Loaders {
            snapshot: Loader::TooLate,
            export: Loader::TooLate,
            buffer: Loader::TooLate,
            stack: Loader::TooLate,
        };
        debug!("late snapshot loaders installed");
    }

    // ── Declarations ─────────────────────────────────────────────────────

    /// Limit the memory size of the instance.  The limit is clamped to the
    /// module's maximum and rounded up to a whole page.
    pub fn set_max_memory_size(&mut self, max_memory_size: usize) -> Result<()> {
        let mut n = max_memory_size as u64;
        let limit = self.module.memory_size_limit();
        if limit >= 0 && n > limit as u64 {
            n = limit as u64;
        }

        let mask = WASM_PAGE_SIZE as u64 - 1;
        let n = (n + mask) & !mask;
        self.max_memory_size = usize::try_from(n).map_err(|_| ImageError::resource_limit("memory size limit"))?;

        if self.module.initial_memory_size() as u64 > n {
            return Err(ImageError::resource_limit(
                "initial program memory size exceeds instance memory size limit",
            ));
        }
        Ok(())
    }

    /// Bind imports, and resolve the entry function unless the exports are
    /// hidden by a snapshot.
    pub fn bind_functions(&mut self, resolver: &mut dyn ImportResolver, entry_name: &str) -> Result<()> {
        self.import_funcs.clear();
        self.import_globals.clear();

        for import in self.module.imports() {
            match import.kind {
                ImportKind::Func(t) => {
                    let sig = self
                        .module
                        .types()
                        .get(t as usize)
                        .ok_or_else(|| ImageError::bad_module(format!("function type index out of bounds: {t}")))?;
                    let index = resolver.resolve_func(&import.module, &import.field, sig)?;
                    self.import_funcs.push(index);
                }

                ImportKind::Global(ty) => {
                    let t = ty
                        .value_type()
                        .ok_or_else(|| ImageError::bad_module("invalid global import type"))?;
                    let value = resolver.resolve_global(&import.module, &import.field, t)?;
                    self.import_globals.push(value);
                }
            }
        }

        self.random = resolver.uses_random();

        if !self.module.sections().export_wrap.is_empty() {
            if !entry_name.is_empty() {
                return Err(ImageError::Suspended);
            }
        } else {
            self.entry_index = resolve_entry_func(&self.module, entry_name, self.snapshot.is_some())?;
        }

        debug!(
            imports = self.import_funcs.len() + self.import_globals.len(),
            entry_index = ?self.entry_index,
            random = self.random,
            "functions bound"
        );
        Ok(())
    }

    // ── Code ─────────────────────────────────────────────────────────────

    /// Module and code generation configuration.  Breakpoints are taken
    /// from the snapshot.
    pub fn code_config(&mut self) -> Result<(&Module, CodeConfig<'_>)> {
        if let Some(snap) = &self.snapshot {
            self.breakpoints = snap
                .breakpoints
                .iter()
                .filter_map(|&offset| u32::try_from(offset).ok())
                .map(|offset| (offset, Breakpoint::default()))
                .collect();
        }

        let bytes = self.bytes;
        let payload = code_payload(&self.module);
        let (text, object_map) = self.image.code_buffers()?;

        Ok((
            &self.module,
            CodeConfig {
                code: &bytes[payload.clone()],
                code_offset: payload.start,
                text,
                object_map,
                import_funcs: &self.import_funcs,
                breakpoints: &mut self.breakpoints,
            },
        ))
    }

    pub fn compile_code(&mut self, compiler: &mut dyn Compiler) -> Result<()> {
        let (module, code) = self.code_config()?;
        compiler.compile_code(module, code)
    }

    /// Check that the compiler set every breakpoint requested by the
    /// snapshot.
    pub fn verify_breakpoints(&self) -> Result<()> {
        let Some(snap) = &self.snapshot else {
            return Ok(());
        };

        let unset = |offset: u64| ImageError::bad_module(format!("breakpoint could not be set at offset {offset:#x}"));

        if let Some(&offset) = snap.breakpoints.iter().find(|&&o| o > u32::MAX as u64) {
            return Err(unset(offset));
        }
        if let Some((&offset, _)) = self.breakpoints.iter().find(|(_, bp)| !bp.set) {
            return Err(unset(offset as u64));
        }
        Ok(())
    }

    fn finish_text(&mut self, stack_usage: usize) -> Result<()> {
        self.image.finish_text(
            self.stack_size,
            stack_usage,
            self.module.globals_size(),
            self.module.initial_memory_size() as usize,
        )
    }

    /// Finish the text after the code and snapshot data sections have been
    /// loaded.  Does nothing if a stack section already did it.
    pub fn finish_image_text(&mut self) -> Result<()> {
        if !self.module.sections().stack.is_empty() {
            return Ok(());
        }
        self.finish_text(0)
    }

    // ── Data ─────────────────────────────────────────────────────────────

    /// Initialize globals and memory.  Valid after the text is finished.
    pub fn init_data(&mut self) -> Result<()> {
        let bytes = self.bytes;
        let globals_size = self.module.globals_size();
        let align = self.image.memory_alignment();
        let memory_offset = globals_size.div_ceil(align) * align;
        let memory_size = self.module.initial_memory_size() as usize;

        let mut data = self.image.globals_memory()?;

        let globals = data.resize_bytes(memory_offset)?;
        for (i, g) in self.module.globals().iter().enumerate() {
            let value = global_init(g.init, i, &self.import_globals)?;
            put_global_value(globals, i, value)?;
        }

        for seg in self.module.data_segments() {
            let start = seg.offset as usize;
            let end = start
                .checked_add(seg.data.len())
                .filter(|&end| end <= memory_size)
                .ok_or_else(|| ImageError::bad_module("data segment is out of bounds"))?;
            if start == end {
                continue;
            }

            let len = data.len().max(memory_offset + end);
            let buf = data.resize_bytes(len)?;
            buf[memory_offset + start..memory_offset + end].copy_from_slice(&bytes[seg.data.clone()]);
        }

        debug!(
            globals = self.module.globals().len(),
            segments = self.module.data_segments().len(),
            data_size = data.len(),
            "data initialized"
        );
        Ok(())
    }

    // ── Images ───────────────────────────────────────────────────────────

    /// Finish the program after the module has been loaded completely.
    pub fn finish_program_image(&mut self) -> Result<Program> {
        self.image.finish_program(ProgramDetails {
            sections: self.module.sections(),
            module: &self.module,
            start_func: self.module.start_func(),
            entry_funcs: true,
            snapshot: self.snapshot.as_ref(),
            buffer_section_header_size: self.buffer_section_header_size,
            random: self.random,
        })
    }

    /// Finish the instance after the program.
    pub fn finish_instance_image(&mut self, prog: &Program) -> Result<Instance> {
        self.image
            .finish_instance(prog, self.max_memory_size, self.entry_index)
    }

    /// Release files and mappings.  Calling this again does nothing.
    pub fn close(&mut self) {
        self.image.close();
    }
}

/// Initial value of a global.
fn global_init(init: Option<InitExpr>, index: usize, imported: &[u64]) -> Result<u64> {
    let imported_value = |i: usize| {
        imported
            .get(i)
            .copied()
            .ok_or_else(|| ImageError::internal(format!("imported global {i} is not bound")))
    };

    Ok(match init {
        None => imported_value(index)?,
        Some(InitExpr::I32(x)) => x as u32 as u64,
        Some(InitExpr::I64(x)) => x as u64,
        Some(InitExpr::F32(bits)) => bits as u64,
        Some(InitExpr::F64(bits)) => bits,
        Some(InitExpr::GlobalGet(i)) => imported_value(i as usize)?,
    })
}
