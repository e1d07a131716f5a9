use std::borrow::Cow;
use std::io::Read;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::sync::Arc;

use gate_build::{build, BuildConfig, BuildOutput, CodeConfig, Compiler, LibraryResolver};
use gate_image::file::page_size;
use gate_image::layout::{INST_STACK_OFFSET, PROG_GLOBALS_PAGE_OFFSET, PROG_MANIFEST_OFFSET};
use gate_image::manifest::{self, MAX_MANIFEST_SIZE, PROGRAM_MANIFEST_TAG};
use gate_image::{
    snapshot, CallSite, Filesystem, Instance, Program, ProgramManifest, StackVars, Storage, STACK_UNUSED_SUSPENDED,
};
use gate_types::abi::STACK_MAGIC;
use gate_types::{Buffers, ErrorKind, FuncType, ImageError, Result, Service, Snapshot, ValueType};
use gate_wasm::custom::{snapshot_section, split_custom_section};
use gate_wasm::Module;
use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind, ExportSection, Function,
    FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction, MemorySection, MemoryType, TypeSection,
    ValType,
};
use wasmparser::{DataKind, Operator, Parser, Payload};

// ══════════════════════════════════════════════════════════════════════════════
// Stub compiler
// ══════════════════════════════════════════════════════════════════════════════

/// Size of the enter routine, which has the three initial call sites.
const ENTER_SIZE: usize = 0x40;

/// Size of every function, imported or not.  A defined function has one call
/// site, 0x10 bytes in.
const FUNC_SIZE: usize = 0x40;

#[derive(Default)]
struct StubCompiler {
    set_breakpoints: bool,
}

impl Compiler for StubCompiler {
    fn compile_code(&mut self, module: &Module, mut code: CodeConfig<'_>) -> Result<()> {
        code.text.put_bytes(&[0xf4; ENTER_SIZE])?;

        code.object_map.call_sites = vec![
            CallSite { ret_addr: 0x10, stack_offset: 16 },
            CallSite { ret_addr: 0x18, stack_offset: 8 },
            CallSite { ret_addr: 0x20, stack_offset: 0 },
        ];
        code.object_map.func_addrs.clear();

        for i in 0..module.func_type_indexes().len() {
            let addr = code.text.len() as u32;
            code.text.put_bytes(&[0x90; FUNC_SIZE])?;
            code.object_map.func_addrs.push(addr);

            if i >= module.import_func_count() {
                code.object_map.call_sites.push(CallSite {
                    ret_addr: addr + 0x10,
                    stack_offset: 16,
                });
            }
        }

        for bp in code.breakpoints.values_mut() {
            bp.set = self.set_breakpoints;
        }
        Ok(())
    }
}

fn build_with(storage: Storage, module: &[u8], config: &BuildConfig) -> Result<BuildOutput> {
    let mut compiler = StubCompiler { set_breakpoints: true };
    build(storage, module, config, &mut compiler, &mut LibraryResolver::new())
}

fn instance_config(entry: &str) -> BuildConfig {
    BuildConfig {
        entry: entry.to_string(),
        want_instance: true,
        ..BuildConfig::default()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Modules
// ══════════════════════════════════════════════════════════════════════════════

fn custom(name: &'static str, data: Vec<u8>) -> CustomSection<'static> {
    CustomSection {
        name: Cow::Borrowed(name),
        data: Cow::Owned(data),
    }
}

fn snapshot_custom(snap: &Snapshot) -> CustomSection<'static> {
    let section = snapshot_section(snap).unwrap();
    let (_, content, _) = split_custom_section(&section).unwrap();
    custom("gate.snapshot", content.to_vec())
}

/// `_start: () -> ()` and nothing else.  Custom sections are placed before
/// and after the code section.
fn start_module(early: &[CustomSection], after_code: &[CustomSection]) -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![]);

    let mut funcs = FunctionSection::new();
    funcs.function(0);

    let mut exports = ExportSection::new();
    exports.export("_start", ExportKind::Func, 0);

    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::End);
    code.function(&f);

    let mut m = wasm_encoder::Module::new();
    m.section(&types);
    for c in early {
        m.section(c);
    }
    m.section(&funcs).section(&exports).section(&code);
    for c in after_code {
        m.section(c);
    }
    m.finish()
}

/// `main: () -> i32` with one page of memory (at most four), two globals and
/// the given data segments.
fn main_module(data: &[(u32, &[u8])], trailing: &[CustomSection]) -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]);

    let mut funcs = FunctionSection::new();
    funcs.function(0);

    let mut memory = MemorySection::new();
    memory.memory(MemoryType {
        minimum: 1,
        maximum: Some(4),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });

    let mut globals = GlobalSection::new();
    globals.global(
        GlobalType {
            val_type: ValType::I64,
            mutable: true,
            shared: false,
        },
        &ConstExpr::i64_const(-7),
    );
    globals.global(
        GlobalType {
            val_type: ValType::I32,
            mutable: false,
            shared: false,
        },
        &ConstExpr::i32_const(5),
    );

    let mut exports = ExportSection::new();
    exports.export("main", ExportKind::Func, 0);

    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(42));
    f.instruction(&Instruction::End);
    code.function(&f);

    let mut segments = DataSection::new();
    for &(offset, bytes) in data {
        segments.active(0, &ConstExpr::i32_const(offset as i32), bytes.iter().copied());
    }

    let mut m = wasm_encoder::Module::new();
    m.section(&types)
        .section(&funcs)
        .section(&memory)
        .section(&globals)
        .section(&exports)
        .section(&code)
        .section(&segments);
    for c in trailing {
        m.section(c);
    }
    m.finish()
}

fn module_bytes(prog: &Program) -> Vec<u8> {
    let mut b = Vec::new();
    prog.module_reader().read_to_end(&mut b).unwrap();
    assert_eq!(b.len() as u64, prog.module_size());
    b
}

fn data_segments(module: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();
    for payload in Parser::new(0).parse_all(module) {
        if let Payload::DataSection(r) = payload.unwrap() {
            for d in r {
                let d = d.unwrap();
                let DataKind::Active { offset_expr, .. } = d.kind else {
                    panic!("passive segment");
                };
                let Operator::I32Const { value } = offset_expr.get_operators_reader().read().unwrap() else {
                    panic!("offset expression");
                };
                out.push((value as u32, d.data.to_vec()));
            }
        }
    }
    out
}

fn last_word(stack: &[u8]) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&stack[stack.len() - 8..]);
    u64::from_le_bytes(w)
}

// ══════════════════════════════════════════════════════════════════════════════
// Runtime stand-ins
// ══════════════════════════════════════════════════════════════════════════════

fn mutate(inst: &mut Instance, vars: StackVars) {
    let text_addr = inst.text_addr();
    let file = inst.begin_mutation(text_addr).unwrap();
    file.write_all_at(&vars.to_bytes(), INST_STACK_OFFSET).unwrap();
    inst.check_mutation().unwrap();
}

/// Suspended before the entry function was called.
fn suspend(inst: &mut Instance) {
    mutate(
        inst,
        StackVars {
            stack_unused: STACK_UNUSED_SUSPENDED,
            current_memory_pages: 1,
            magic: [STACK_MAGIC; 2],
            ..StackVars::default()
        },
    );
}

/// Returned from the entry function.
fn exit(inst: &mut Instance, memory_pages: u32) {
    mutate(
        inst,
        StackVars {
            stack_unused: inst.stack_size() as u32,
            current_memory_pages: memory_pages,
            monotonic_time: 1000,
            magic: [STACK_MAGIC; 2],
            ..StackVars::default()
        },
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Entry functions
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn minimal_program_resolves_start() {
    let module = start_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &BuildConfig::default()).unwrap();
    let prog = out.program;

    assert!(out.instance.is_none());
    assert_eq!(prog.resolve_entry_func("", false).unwrap(), Some(0));
    assert_eq!(prog.resolve_entry_func("", true).unwrap(), None);
    assert!(matches!(
        prog.resolve_entry_func("main", false),
        Err(ImageError::StartFunctionConflict)
    ));
    assert!(prog.manifest().snapshot.is_none());
    assert_eq!(prog.manifest().text_size as usize, ENTER_SIZE + FUNC_SIZE);
    assert_eq!(prog.text_size(), page_size());
    assert_eq!(module_bytes(&prog), module);
}

#[test]
fn named_entry_conflicts_with_start() {
    let module = start_module(&[], &[]);
    let err = build_with(Storage::memory(), &module, &instance_config("main")).unwrap_err();
    assert!(matches!(err, ImageError::StartFunctionConflict));
}

#[test]
fn missing_entry_function() {
    let module = main_module(&[], &[]);
    let err = build_with(Storage::memory(), &module, &instance_config("nope")).unwrap_err();
    assert!(matches!(err, ImageError::FunctionNotFound));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ══════════════════════════════════════════════════════════════════════════════
// Snapshots
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn snapshot_of_finished_instance_hides_start() {
    let module = start_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();

    assert_eq!(inst.manifest().entry_func.map(|f| f.index), Some(0));
    exit(&mut inst, 0);
    inst.set_final().unwrap();
    assert_eq!(inst.monotonic_time(), 1000);

    let snap = snapshot(&prog, &inst, &Buffers::default(), false).unwrap();
    assert!(snap.manifest().snapshot_section.size > 0);
    assert!(snap.manifest().stack_section.is_empty());
    assert!(snap.manifest().export_section_wrap.is_empty());
    assert_eq!(snap.resolve_entry_func("", false).unwrap(), None);
    assert_eq!(snap.manifest().snapshot.as_ref().map(|s| s.monotonic_time), Some(1000));

    let rebuilt = build_with(Storage::memory(), &module_bytes(&snap), &BuildConfig::default()).unwrap();
    assert_eq!(rebuilt.program.resolve_entry_func("", false).unwrap(), None);
    assert_eq!(rebuilt.program.manifest().stack_usage, 0);
    assert_eq!(
        rebuilt.program.manifest().snapshot.as_ref().map(|s| s.monotonic_time),
        Some(1000)
    );
}

#[test]
fn suspended_before_entry_resumes_after_rebuild() {
    let module = main_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();

    let main = prog.resolve_entry_func("main", false).unwrap().unwrap();
    assert_eq!(inst.manifest().entry_func.map(|f| f.index), Some(main));

    suspend(&mut inst);
    assert!(inst.is_coherent());
    assert_eq!(inst.stack_usage(), 0);

    let snap = snapshot(&prog, &inst, &Buffers::default(), true).unwrap();
    assert_eq!(snap.manifest().stack_usage, 24);
    assert!(!snap.manifest().stack_section.is_empty());
    assert!(!snap.manifest().export_section_wrap.is_empty());
    assert_ne!(snap.manifest().text_addr, 0);
    assert_eq!(snap.resolve_entry_func("", false).unwrap(), None);

    let resumed = Instance::new(&snap, 64 << 20, 65536, None).unwrap();
    assert_eq!(resumed.stack_usage(), 24);
    assert_eq!(last_word(&resumed.export_stack(&snap.map).unwrap()), main as u64);
    assert!(matches!(
        Instance::new(&snap, 64 << 20, 65536, Some(main)),
        Err(ImageError::Suspended)
    ));

    let bytes = module_bytes(&snap);

    let err = build_with(Storage::memory(), &bytes, &instance_config("main")).unwrap_err();
    assert!(matches!(err, ImageError::Suspended));

    let rebuilt = build_with(Storage::memory(), &bytes, &instance_config("")).unwrap();
    let inst = rebuilt.instance.unwrap();
    assert_eq!(rebuilt.program.manifest().stack_usage, 24);
    assert_eq!(inst.stack_usage(), 24);
    assert_ne!(inst.text_addr(), 0);
    assert_eq!(last_word(&inst.export_stack(&rebuilt.program.map).unwrap()), main as u64);
}

#[test]
fn breakpoints_survive_snapshot() {
    let module = main_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();

    exit(&mut inst, 1);
    inst.set_breakpoints(vec![0x30, 0x10, 0x20, 0x10]).unwrap();
    assert_eq!(inst.breakpoints(), &[0x10, 0x20, 0x30]);

    let snap = snapshot(&prog, &inst, &Buffers::default(), false).unwrap();
    assert_eq!(snap.breakpoints(), &[0x10, 0x20, 0x30]);

    let rebuilt = build_with(Storage::memory(), &module_bytes(&snap), &BuildConfig::default()).unwrap();
    assert_eq!(rebuilt.program.breakpoints(), &[0x10, 0x20, 0x30]);
}

#[test]
fn unset_breakpoint_fails() {
    let snap = Snapshot {
        breakpoints: vec![0x10],
        ..Snapshot::default()
    };
    let module = start_module(&[snapshot_custom(&snap)], &[]);

    let mut compiler = StubCompiler::default();
    let err = build(
        Storage::memory(),
        &module,
        &BuildConfig::default(),
        &mut compiler,
        &mut LibraryResolver::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert!(err.to_string().contains("breakpoint"));

    let out = build_with(Storage::memory(), &module, &BuildConfig::default()).unwrap();
    assert_eq!(out.program.breakpoints(), &[0x10]);
}

#[test]
fn breakpoint_offset_limit() {
    let fits = Snapshot {
        breakpoints: vec![u32::MAX as u64],
        ..Snapshot::default()
    };
    let module = start_module(&[snapshot_custom(&fits)], &[]);
    assert!(build_with(Storage::memory(), &module, &BuildConfig::default()).is_ok());

    let beyond = Snapshot {
        breakpoints: vec![u32::MAX as u64 + 1],
        ..Snapshot::default()
    };
    let module = start_module(&[snapshot_custom(&beyond)], &[]);
    let err = build_with(Storage::memory(), &module, &BuildConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadModule);
}

#[test]
fn mutated_globals_survive_snapshot() {
    let module = main_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();

    // Global 0 is the last word of the globals page.
    let global0 = INST_STACK_OFFSET + inst.stack_size() as u64 + page_size() as u64 - 8;
    let vars = StackVars {
        stack_unused: inst.stack_size() as u32,
        current_memory_pages: 1,
        magic: [STACK_MAGIC; 2],
        ..StackVars::default()
    };
    let text_addr = inst.text_addr();
    let file = inst.begin_mutation(text_addr).unwrap();
    file.write_all_at(&0x1122_3344_5566_7788u64.to_le_bytes(), global0).unwrap();
    file.write_all_at(&vars.to_bytes(), INST_STACK_OFFSET).unwrap();
    inst.check_mutation().unwrap();

    let values = vec![0x1122_3344_5566_7788, 5];
    assert_eq!(inst.globals(&prog).unwrap(), values);

    let snap = snapshot(&prog, &inst, &Buffers::default(), false).unwrap();
    let copy = Instance::new(&snap, 64 << 20, 65536, None).unwrap();
    assert_eq!(copy.globals(&snap).unwrap(), values);

    let rebuilt = build_with(Storage::memory(), &module_bytes(&snap), &instance_config("")).unwrap();
    let inst = rebuilt.instance.unwrap();
    assert_eq!(inst.globals(&rebuilt.program).unwrap(), values);
}

#[test]
fn data_scan_elides_zero_runs() {
    let module = main_module(&[(0, &[1, 2, 3]), (32768, &[9])], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();
    exit(&mut inst, 1);

    let snap = snapshot(&prog, &inst, &Buffers::default(), false).unwrap();
    let bytes = module_bytes(&snap);
    assert_eq!(data_segments(&bytes), vec![(0, vec![1, 2, 3]), (32768, vec![9])]);
    assert_eq!(snap.manifest().memory_size, 65536);

    // Scanning the same state again yields the same section.
    let again = snapshot(&prog, &inst, &Buffers::default(), false).unwrap();
    assert_eq!(data_segments(&module_bytes(&again)), data_segments(&bytes));
}

#[test]
fn buffers_survive_snapshot() {
    let module = main_module(&[], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();
    exit(&mut inst, 1);

    let buffers = Buffers {
        services: vec![Service::new("svc", b"state".to_vec())],
        input: b"in".to_vec(),
        output: b"output".to_vec(),
    };

    let snap = snapshot(&prog, &inst, &buffers, false).unwrap();
    assert!(!snap.manifest().buffer_section.is_empty());
    assert_eq!(snap.load_buffers().unwrap(), buffers);

    let rebuilt = build_with(Storage::memory(), &module_bytes(&snap), &BuildConfig::default()).unwrap();
    assert_eq!(rebuilt.buffers, buffers);
    assert_eq!(rebuilt.program.load_buffers().unwrap(), buffers);
    assert_eq!(
        rebuilt.program.manifest().buffer_section_header_size,
        snap.manifest().buffer_section_header_size
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Section order
// ══════════════════════════════════════════════════════════════════════════════

fn build_error(module: &[u8]) -> ImageError {
    build_with(Storage::memory(), module, &BuildConfig::default()).unwrap_err()
}

#[test]
fn buffer_section_too_early() {
    let snap = snapshot_custom(&Snapshot::default());
    let module = start_module(&[snap, custom("gate.buffer", vec![0, 0, 0])], &[]);
    let err = build_error(&module);
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert!(err.to_string().contains("too early"));
}

#[test]
fn duplicate_snapshot_section() {
    let snap = || snapshot_custom(&Snapshot::default());
    let module = start_module(&[snap(), snap()], &[]);
    assert!(build_error(&module).to_string().contains("multiple gate.snapshot"));
}

#[test]
fn export_section_too_late() {
    let snap = snapshot_custom(&Snapshot::default());
    let module = start_module(&[snap], &[custom("gate.export", vec![0])]);
    assert!(build_error(&module).to_string().contains("too late"));
}

#[test]
fn stack_section_requires_snapshot() {
    let module = start_module(&[], &[custom("gate.stack", vec![0; 8])]);
    let err = build_error(&module);
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert!(err.to_string().contains("without gate.snapshot"));
}

#[test]
fn empty_stack_section() {
    let snap = snapshot_custom(&Snapshot::default());
    let module = start_module(&[snap], &[custom("gate.stack", Vec::new())]);
    assert_eq!(build_error(&module).kind(), ErrorKind::BadModule);
}

#[test]
fn stack_section_after_data() {
    let module = main_module(&[], &[custom("gate.stack", vec![0; 8])]);
    assert!(build_error(&module).to_string().contains("too late"));
}

#[test]
fn unrelated_custom_sections_are_ignored() {
    let module = start_module(&[custom("name", vec![0])], &[custom("producers", vec![0])]);
    assert!(build_with(Storage::memory(), &module, &BuildConfig::default()).is_ok());
}

// ══════════════════════════════════════════════════════════════════════════════
// Limits
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn text_size_limit() {
    let module = start_module(&[], &[]);

    let exact = BuildConfig {
        max_text_size: ENTER_SIZE + FUNC_SIZE,
        ..BuildConfig::default()
    };
    let out = build_with(Storage::memory(), &module, &exact).unwrap();
    assert_eq!(out.program.manifest().text_size as usize, ENTER_SIZE + FUNC_SIZE);

    let short = BuildConfig {
        max_text_size: ENTER_SIZE + FUNC_SIZE - 1,
        ..BuildConfig::default()
    };
    let err = build_with(Storage::memory(), &module, &short).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);

    let huge = BuildConfig {
        max_text_size: 0x8000_0001,
        ..BuildConfig::default()
    };
    let err = build_with(Storage::memory(), &module, &huge).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

#[test]
fn memory_size_limit() {
    let module = main_module(&[], &[]);

    let config = BuildConfig {
        max_memory_size: 100,
        ..instance_config("main")
    };
    let out = build_with(Storage::memory(), &module, &config).unwrap();
    assert_eq!(out.instance.unwrap().max_memory_size(), 65536);

    let config = BuildConfig {
        max_memory_size: 1 << 30,
        ..instance_config("main")
    };
    let out = build_with(Storage::memory(), &module, &config).unwrap();
    assert_eq!(out.instance.unwrap().max_memory_size(), 4 * 65536);

    let config = BuildConfig {
        max_memory_size: 0,
        ..instance_config("main")
    };
    let err = build_with(Storage::memory(), &module, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

#[test]
fn stack_size_limit() {
    let module = start_module(&[], &[]);
    let config = BuildConfig {
        stack_size: 1024,
        ..instance_config("")
    };
    let err = build_with(Storage::memory(), &module, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

// ══════════════════════════════════════════════════════════════════════════════
// Data
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn globals_and_memory_initialized() {
    let module = main_module(&[(16, b"hello"), (65530, &[1, 2, 3, 4, 5, 6])], &[]);
    let out = build_with(Storage::memory(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let inst = out.instance.unwrap();

    assert_eq!(inst.globals(&prog).unwrap(), vec![(-7i64) as u64, 5]);
    assert_eq!(inst.memory_size(), 65536);
    assert_eq!(inst.manifest().globals_size, 16);
    assert_eq!(inst.globals_size(), page_size());

    // Memory follows the globals page in the program file.
    let mut memory = vec![0u8; 65536];
    prog.text()
        .read_exact_at(&mut memory, PROG_GLOBALS_PAGE_OFFSET + page_size() as u64)
        .unwrap();
    assert_eq!(&memory[16..21], b"hello");
    assert_eq!(&memory[65530..], &[1, 2, 3, 4, 5, 6]);
    assert!(memory[..16].iter().all(|&b| b == 0));
}

#[test]
fn data_segment_out_of_bounds() {
    let module = main_module(&[(65534, &[1, 2, 3])], &[]);
    let err = build_with(Storage::memory(), &module, &BuildConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadModule);
}

// ══════════════════════════════════════════════════════════════════════════════
// Imports
// ══════════════════════════════════════════════════════════════════════════════

fn import_module() -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I64]);
    types.ty().function(vec![], vec![]);

    let mut imports = ImportSection::new();
    imports.import("env", "random", EntityType::Function(0));

    let mut funcs = FunctionSection::new();
    funcs.function(1);

    let mut exports = ExportSection::new();
    exports.export("_start", ExportKind::Func, 1);

    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::Call(0));
    f.instruction(&Instruction::Drop);
    f.instruction(&Instruction::End);
    code.function(&f);

    let mut m = wasm_encoder::Module::new();
    m.section(&types)
        .section(&imports)
        .section(&funcs)
        .section(&exports)
        .section(&code);
    m.finish()
}

#[test]
fn imports_are_bound_by_resolver() {
    let module = import_module();

    let mut resolver = LibraryResolver::new()
        .func("env", "random", 5, FuncType::new(vec![], vec![ValueType::I64]))
        .random_func(5);
    let out = build(
        Storage::memory(),
        &module,
        &BuildConfig::default(),
        &mut StubCompiler::default(),
        &mut resolver,
    )
    .unwrap();

    assert!(out.program.random());
    assert_eq!(out.program.resolve_entry_func("", false).unwrap(), Some(1));
    assert_eq!(out.program.map.func_addrs.len(), 2);
    assert_eq!(out.program.manifest().text_size as usize, ENTER_SIZE + 2 * FUNC_SIZE);
}

#[test]
fn unknown_import_fails() {
    let err = build_error(&import_module());
    assert_eq!(err.kind(), ErrorKind::BadModule);
    assert!(err.to_string().contains("import function not supported"));
}

// ══════════════════════════════════════════════════════════════════════════════
// Persistence
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn filesystem_store_load_unstore() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(Filesystem::new(dir.path()).unwrap());
    let storage = Storage::filesystem(fs);

    let module = main_module(&[(0, b"persist")], &[]);
    let out = build_with(storage.clone(), &module, &instance_config("main")).unwrap();
    let prog = out.program;
    let mut inst = out.instance.unwrap();

    prog.store("prog").unwrap();
    prog.store("prog").unwrap();
    assert_eq!(storage.programs().unwrap(), vec!["prog".to_string()]);

    let loaded = storage.load_program("prog").unwrap().unwrap();
    assert_eq!(loaded.manifest(), prog.manifest());
    assert_eq!(loaded.map, prog.map);
    assert_eq!(module_bytes(&loaded), module);
    assert!(storage.load_program("other").unwrap().is_none());

    inst.store("inst", &prog).unwrap();
    assert_eq!(inst.name(), Some("inst"));
    assert!(dir.path().join("instance").join("inst").exists());

    let loaded = storage.load_instance("inst").unwrap().unwrap();
    assert_eq!(loaded.manifest(), inst.manifest());

    inst.unstore().unwrap();
    assert!(inst.name().is_none());
    assert!(!dir.path().join("instance").join("inst").exists());
    assert!(storage.instances().unwrap().is_empty());
}

#[test]
fn stored_program_with_other_library_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::filesystem(Arc::new(Filesystem::new(dir.path()).unwrap()));

    let module = start_module(&[], &[]);
    let out = build_with(storage.clone(), &module, &BuildConfig::default()).unwrap();
    out.program.store("prog").unwrap();
    assert!(storage.load_program("prog").unwrap().is_some());

    let path = dir.path().join("program").join("prog");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
    let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();

    let mut b = vec![0u8; MAX_MANIFEST_SIZE];
    file.read_exact_at(&mut b, PROG_MANIFEST_OFFSET).unwrap();
    let mut man: ProgramManifest = manifest::decode(PROGRAM_MANIFEST_TAG, &b).unwrap();
    man.library_checksum ^= 1;
    file.write_all_at(&manifest::encode(PROGRAM_MANIFEST_TAG, &man).unwrap(), PROG_MANIFEST_OFFSET)
        .unwrap();

    assert!(storage.load_program("prog").unwrap().is_none());
}
