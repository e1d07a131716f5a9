use std::ffi::CString;
use std::os::fd::AsRawFd;

use gate_types::abi::{
    random_text_addr, STACK_MAGIC, STACK_USAGE_OFFSET, STACK_VARS_SIZE, TEXT_ADDR_EXIT,
    WASM_PAGE_BITS, WASM_PAGE_SIZE,
};
use gate_types::snapshot::sort_dedup;
use gate_types::{FuncType, ImageError, Result, ScalarCategory, Snapshot};
use gate_wasm::section::global_value;
use tracing::debug;

use crate::file::{copy_file_range, page_size, File, FileRef, Mapping, Protection};
use crate::layout::{align_page, INST_STACK_OFFSET, PROG_GLOBALS_PAGE_OFFSET};
use crate::manifest::{Function, InstanceManifest};
use crate::objectmap::ObjectMap;
use crate::program::Program;
use crate::stack::{export_stack, stacktrace, Frame};

const MAX_RANDOM_AVAIL: i32 = 16;

// ══════════════════════════════════════════════════════════════════════════════
// Stack variables
// ══════════════════════════════════════════════════════════════════════════════

/// Record written by the runtime at the bottom of the stack region when it
/// stops executing an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackVars {
    /// Other fields are meaningless if this is zero.
    pub stack_unused: u32,
    /// WebAssembly pages.
    pub current_memory_pages: u32,
    pub monotonic_time: u64,
    pub random_avail: i32,
    pub text_addr: u64,
    /// Indexed by [`ScalarCategory`].
    pub result: [u64; 2],
    pub magic: [u64; 2],
}

/// Stack usage value written by the runtime when execution was suspended by
/// force.
pub const STACK_UNUSED_SUSPENDED: u32 = u32::MAX;

impl StackVars {
    pub fn from_bytes(b: &[u8; STACK_VARS_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let u64_at = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[i..i + 8]);
            u64::from_le_bytes(w)
        };

        Self {
            stack_unused: u32_at(0),
            current_memory_pages: u32_at(4),
            monotonic_time: u64_at(8),
            random_avail: u32_at(16) as i32,
            text_addr: u64_at(24),
            result: [u64_at(32), u64_at(40)],
            magic: [u64_at(48), u64_at(56)],
        }
    }

    pub fn to_bytes(&self) -> [u8; STACK_VARS_SIZE] {
        let mut b = [0u8; STACK_VARS_SIZE];
        b[0..4].copy_from_slice(&self.stack_unused.to_le_bytes());
        b[4..8].copy_from_slice(&self.current_memory_pages.to_le_bytes());
        b[8..16].copy_from_slice(&self.monotonic_time.to_le_bytes());
        b[16..20].copy_from_slice(&self.random_avail.to_le_bytes());
        b[24..32].copy_from_slice(&self.text_addr.to_le_bytes());
        b[32..40].copy_from_slice(&self.result[0].to_le_bytes());
        b[40..48].copy_from_slice(&self.result[1].to_le_bytes());
        b[48..56].copy_from_slice(&self.magic[0].to_le_bytes());
        b[56..64].copy_from_slice(&self.magic[1].to_le_bytes());
        b
    }

    fn magic_ok(&self) -> bool {
        self.magic.iter().all(|&n| n == STACK_MAGIC)
    }

    fn check(&self, stack_size: u32) -> Result<()> {
        let bad = |msg: &str| Err(ImageError::BadTermination(msg.to_string()));

        match self.stack_unused {
            // Suspended before execution started.
            0 => return Ok(()),
            STACK_UNUSED_SUSPENDED => {}
            n if n < STACK_USAGE_OFFSET as u32 || n > stack_size || n & 7 != 0 => {
                return bad("stack usage is out of bounds or misaligned");
            }
            _ => {
                if self.current_memory_pages > i32::MAX as u32 / WASM_PAGE_SIZE {
                    return bad("memory size is out of bounds");
                }
                if self.random_avail > MAX_RANDOM_AVAIL {
                    return bad("random data availability is out of bounds");
                }
            }
        }

        if !self.magic_ok() {
            return bad("stack magic mismatch");
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Instance
// ══════════════════════════════════════════════════════════════════════════════

/// Program state.  It may be undergoing mutation.
#[derive(Debug)]
pub struct Instance {
    pub(crate) man: InstanceManifest,
    /// Manifest needs to be written to file.
    pub(crate) dirty: bool,
    /// File is not being mutated and looks okay.
    pub(crate) coherent: bool,
    pub(crate) file: FileRef,
    /// Set if the instance is stored in a directory.
    pub(crate) dir: Option<FileRef>,
    /// Set if the instance is in stored state.
    pub(crate) name: Option<String>,
}

impl Instance {
    pub(crate) fn from_parts(man: InstanceManifest, file: FileRef) -> Self {
        Self {
            man,
            dirty: true,
            coherent: true,
            file,
            dir: None,
            name: None,
        }
    }

    /// Derive a fresh instance from a program.  The program's stack,
    /// globals and memory contents are copied into a new instance file.
    pub fn new(prog: &Program, max_memory_size: usize, max_stack_size: usize, entry_index: Option<u32>) -> Result<Self> {
        let max_memory_size = max_instance_memory(prog, max_memory_size)?;

        let stack_size = align_page(max_stack_size);
        let mut stack_usage = 0;
        let mut text_addr = 0;

        if prog.man.stack_usage != 0 {
            if entry_index.is_some() {
                return Err(ImageError::Suspended);
            }
            stack_usage = prog.man.stack_usage as usize;
            text_addr = prog.man.text_addr;
        }

        if stack_usage + STACK_USAGE_OFFSET > stack_size {
            return Err(ImageError::resource_limit("call stack size limit exceeded"));
        }

        let entry_func = entry_index.map(|i| program_entry_func(prog, i)).transpose()?;

        let storage = &prog.storage.instances;
        let file = storage.new_instance_file()?;

        let stack_map_size = align_page(stack_usage);
        let src_offset = PROG_GLOBALS_PAGE_OFFSET - stack_map_size as u64;
        let dst_offset = (stack_size - stack_map_size) as u64;
        let copy_len = stack_map_size
            + align_page(prog.man.globals_size as usize)
            + align_page(prog.man.memory_data_size as usize);

        if copy_len > 0 {
            if storage.instance_file_write_supported() {
                copy_file_range(&prog.file, src_offset, &file, dst_offset, copy_len)?;
            } else if let Some(mut dest) = Mapping::map(&file, dst_offset, copy_len, Protection::ReadWrite)? {
                prog.file
                    .read_exact_at(&mut dest.as_mut_slice()[..copy_len], src_offset)?;
            }
        }

        debug!(stack_size, stack_usage, copy_len, "instance created");

        Ok(Self::from_parts(
            InstanceManifest {
                text_addr,
                stack_size: stack_size as u32,
                stack_usage: stack_usage as u32,
                globals_size: prog.man.globals_size,
                memory_size: prog.man.memory_size,
                max_memory_size: max_memory_size as u32,
                start_func: prog.man.start_func,
                entry_func,
                snapshot: prog.man.snapshot.clone(),
            },
            FileRef::new(file),
        ))
    }

    pub fn set_entry_func(&mut self, prog: &Program, index: Option<u32>) -> Result<()> {
        if !self.coherent {
            return Err(ImageError::InvalidState);
        }
        if index.is_some() && self.man.stack_usage != 0 {
            return Err(ImageError::Suspended);
        }

        self.man.entry_func = index.map(|i| program_entry_func(prog, i)).transpose()?;
        self.dirty = true;
        Ok(())
    }

    /// Give the instance a persistent name.  The name must not contain path
    /// separators.
    pub fn store(&mut self, name: &str, prog: &Program) -> Result<()> {
        if !self.coherent || self.name.is_some() {
            return Err(ImageError::InvalidState);
        }

        let storage = &prog.storage.instances;
        if storage.store_instance_supported() {
            storage.store_instance(self, name)?;
        } else {
            self.name = Some(name.to_string());
        }

        debug!(name, "instance stored");
        Ok(())
    }

    /// Remove the persistent name, if any.
    pub fn unstore(&mut self) -> Result<()> {
        let Some(name) = self.name.take() else {
            return Ok(());
        };
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let c_name = CString::new(name.as_str())
            .map_err(|_| ImageError::internal(format!("instance name contains nul byte: {name:?}")))?;

        // SAFETY: c_name is a valid C string and dir is an open directory.
        let ret = unsafe { libc::unlinkat(dir.as_raw_fd(), c_name.as_ptr(), 0) };
        if ret != 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::ENOENT) {
                return Err(ImageError::io("unlinkat", e));
            }
        }

        debug!(name, "instance unstored");
        dir.sync_data()
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn manifest(&self) -> &InstanceManifest {
        &self.man
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn text_addr(&self) -> u64 {
        self.man.text_addr
    }

    pub fn stack_size(&self) -> usize {
        self.man.stack_size as usize
    }

    pub fn stack_usage(&self) -> usize {
        self.man.stack_usage as usize
    }

    /// Globals size rounded up to page size.
    pub fn globals_size(&self) -> usize {
        align_page(self.man.globals_size as usize)
    }

    pub fn memory_size(&self) -> usize {
        self.man.memory_size as usize
    }

    pub fn max_memory_size(&self) -> usize {
        self.man.max_memory_size as usize
    }

    /// Text offset of the pending start function, or zero.
    pub fn start_addr(&self) -> u32 {
        self.man.start_func.map_or(0, |f| f.addr)
    }

    /// Text offset of the pending entry function, or zero.
    pub fn entry_addr(&self) -> u32 {
        self.man.entry_func.map_or(0, |f| f.addr)
    }

    pub fn is_final(&self) -> bool {
        self.snapshot().is_some_and(|s| s.is_final)
    }

    pub fn trap(&self) -> u32 {
        self.snapshot().map_or(0, |s| s.trap)
    }

    pub fn result(&self) -> i32 {
        self.snapshot().map_or(0, |s| s.result)
    }

    pub fn monotonic_time(&self) -> u64 {
        self.snapshot().map_or(0, |s| s.monotonic_time)
    }

    /// Breakpoints in ascending order, without duplicates.
    pub fn breakpoints(&self) -> &[u64] {
        self.snapshot().map_or(&[], |s| &s.breakpoints)
    }

    fn snapshot(&self) -> Option<&Snapshot> {
        self.man.snapshot.as_ref()
    }

    pub(crate) fn globals_page_offset(&self) -> u64 {
        INST_STACK_OFFSET + self.man.stack_size as u64
    }

    pub(crate) fn memory_offset(&self) -> u64 {
        self.globals_page_offset() + align_page(self.man.globals_size as usize) as u64
    }

    // ── Snapshot state ───────────────────────────────────────────────────

    fn update_snapshot(&mut self, changed: impl FnOnce(&mut Snapshot) -> bool) -> Result<()> {
        if !self.coherent {
            return Err(ImageError::InvalidState);
        }

        let mut snap = self.man.snapshot.clone().unwrap_or_default();
        if changed(&mut snap) {
            self.man.snapshot = Some(snap);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_final(&mut self) -> Result<()> {
        self.update_snapshot(|s| !std::mem::replace(&mut s.is_final, true))
    }

    pub fn set_trap(&mut self, id: u32) -> Result<()> {
        self.update_snapshot(|s| std::mem::replace(&mut s.trap, id) != id)
    }

    pub fn set_result(&mut self, n: i32) -> Result<()> {
        self.update_snapshot(|s| std::mem::replace(&mut s.result, n) != n)
    }

    /// Replace the breakpoints.  They are stored sorted and deduplicated.
    pub fn set_breakpoints(&mut self, offsets: Vec<u64>) -> Result<()> {
        let offsets = sort_dedup(offsets);
        self.update_snapshot(|s| {
            if s.breakpoints == offsets {
                return false;
            }
            s.breakpoints = offsets;
            true
        })
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Must be invoked when mutation starts.  The instance is unstored.  The
    /// returned file contains the stack, globals and memory.
    pub fn begin_mutation(&mut self, _text_addr: u64) -> Result<&File> {
        if !self.coherent {
            return Err(ImageError::InvalidState);
        }

        self.unstore()?;
        self.coherent = false;
        Ok(&self.file)
    }

    /// Check the stack variables left by the runtime after mutation ended,
    /// and update the manifest accordingly.
    pub fn check_mutation(&mut self) -> Result<()> {
        self.check_mutation_vars().map(|_| ())
    }

    /// Like [`Instance::check_mutation`], but also returns the result of the
    /// top-level function.  The result is undefined if the program
    /// terminated in some other way.
    pub fn check_halted_mutation(&mut self, result: ScalarCategory) -> Result<u64> {
        let vars = self.check_mutation_vars()?;
        Ok(vars.result[result as usize])
    }

    fn check_mutation_vars(&mut self) -> Result<StackVars> {
        if self.coherent {
            return Ok(StackVars::default());
        }

        let mut b = [0u8; STACK_VARS_SIZE];
        self.file.read_exact_at(&mut b, INST_STACK_OFFSET)?;

        let vars = StackVars::from_bytes(&b);
        vars.check(self.man.stack_size)?;

        match vars.stack_unused {
            0 | STACK_UNUSED_SUSPENDED => {}
            unused => {
                if unused == self.man.stack_size {
                    self.man.text_addr = 0;
                    self.man.stack_usage = 0;
                } else {
                    self.man.text_addr = vars.text_addr;
                    self.man.stack_usage = self.man.stack_size - unused;
                }
                self.man.memory_size = vars.current_memory_pages << WASM_PAGE_BITS;
                self.man.start_func = None;
                self.man.entry_func = None;
                self.man.snapshot_mut().monotonic_time = vars.monotonic_time;
                self.dirty = true;
            }
        }

        debug!(
            stack_unused = vars.stack_unused,
            stack_usage = self.man.stack_usage,
            memory_size = self.man.memory_size,
            "mutation checked"
        );

        self.coherent = true;
        Ok(vars)
    }

    // ── State access ─────────────────────────────────────────────────────

    /// Global values, in global index order.
    pub fn globals(&self, prog: &Program) -> Result<Vec<u64>> {
        let size = self.man.globals_size as usize;
        let end = self.globals_page_offset() + align_page(size) as u64;

        let mut b = vec![0u8; size];
        self.file.read_exact_at(&mut b, end - size as u64)?;

        (0..prog.man.global_types.len())
            .map(|i| {
                global_value(&b, i).ok_or_else(|| ImageError::internal("globals area is too small"))
            })
            .collect()
    }

    /// Replace the call stack with a suspended call of the function at a
    /// text offset.  Pending start and entry functions and existing
    /// suspended state are discarded.  Arguments are not checked against the
    /// function signature.
    pub fn replace_call_stack(&mut self, func_addr: u32, func_args: &[u64]) -> Result<()> {
        if !self.coherent {
            return Err(ImageError::InvalidState);
        }

        let text_addr = match self.man.text_addr {
            0 => random_text_addr(page_size() as u64)?,
            addr => addr,
        };

        // Resume after the first prologue instruction, which stores the
        // link register.
        let resume_addr = if cfg!(target_arch = "aarch64") {
            func_addr + 4
        } else {
            func_addr
        };

        let mut stack = Vec::with_capacity((2 + func_args.len()) * 8);
        stack.extend_from_slice(&(text_addr + resume_addr as u64).to_le_bytes());
        stack.extend_from_slice(&(text_addr + TEXT_ADDR_EXIT as u64).to_le_bytes());
        for arg in func_args.iter().rev() {
            stack.extend_from_slice(&arg.to_le_bytes());
        }

        if stack.len() + STACK_USAGE_OFFSET > self.man.stack_size as usize {
            return Err(ImageError::resource_limit("call stack size limit exceeded"));
        }

        self.file
            .write_all_at(&stack, self.man.stack_size as u64 - stack.len() as u64)?;

        self.man.text_addr = text_addr;
        self.man.stack_usage = stack.len() as u32;
        self.man.start_func = None;
        self.man.entry_func = None;
        self.dirty = true;
        Ok(())
    }

    /// Native stack bytes in use.
    pub(crate) fn read_stack(&self) -> Result<Vec<u8>> {
        let usage = self.man.stack_usage as usize;
        let mut b = vec![0u8; usage];
        if usage > 0 {
            self.file
                .read_exact_at(&mut b, self.man.stack_size as u64 - usage as u64)?;
        }
        Ok(b)
    }

    /// Portable representation of the call stack, or nothing if there is no
    /// stack.
    pub fn export_stack(&self, map: &ObjectMap) -> Result<Vec<u8>> {
        let b = self.read_stack()?;
        if b.is_empty() {
            return Ok(b);
        }
        export_stack(&b, self.man.text_addr, map)
    }

    pub fn stacktrace(&self, map: &ObjectMap, func_types: &[FuncType]) -> Result<Vec<Frame>> {
        let b = self.read_stack()?;
        if b.is_empty() {
            return Ok(Vec::new());
        }
        stacktrace(&b, self.man.text_addr, map, func_types)
    }
}

/// Clamp the requested maximum memory size to the program's limit.
pub(crate) fn max_instance_memory(prog: &Program, n: usize) -> Result<usize> {
    let mut n = n;
    if prog.man.memory_size_limit >= 0 && n as u64 > prog.man.memory_size_limit as u64 {
        n = prog.man.memory_size_limit as usize;
    }
    if n < prog.man.memory_size as usize {
        return Err(ImageError::resource_limit("out of memory"));
    }
    Ok(n)
}

fn program_entry_func(prog: &Program, index: u32) -> Result<Function> {
    prog.man.entry_func(index).ok_or(ImageError::FunctionNotFound)
}
