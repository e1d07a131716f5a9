//! Module metadata, read directly from module bytes.
//!
//! Only the declarations needed for building images are decoded: types,
//! imports, function signatures, memory limits, globals, exports, the start
//! function and data segments.  Function bodies are left to the compiler.
//! While loading, the byte range of every section is recorded in a
//! [`SectionMap`].

use std::collections::BTreeMap;
use std::ops::Range;

use gate_types::abi::{MODULE_HEADER_SIZE, WASM_PAGE_BITS};
use gate_types::{
    ByteRange, FuncType, GlobalType, ImageError, Result, SectionId, SectionMap, ValueType,
};
use tracing::debug;
use wasmparser::{DataKind, ExternalKind, Operator, Parser, Payload, TypeRef, ValType};

use crate::custom::WrappedExports;
use crate::malformed;

/// Largest supported memory size in pages (2 GiB).
pub const MAX_MEMORY_PAGES: u64 = (i32::MAX as u64 + 1) >> WASM_PAGE_BITS;

// ══════════════════════════════════════════════════════════════════════════════
// Declarations
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    /// Function with a type index.
    Func(u32),
    Global(GlobalType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

/// Constant initializer of a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitExpr {
    I32(i32),
    I64(i64),
    /// Bit pattern.
    F32(u32),
    /// Bit pattern.
    F64(u64),
    /// Value of an imported global.
    GlobalGet(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub ty: GlobalType,
    /// `None` for imported globals.
    pub init: Option<InitExpr>,
}

/// Active data segment of memory 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    /// Location of the segment bytes within the module.
    pub data: Range<usize>,
}

/// Custom section and its position relative to the standard sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    /// Whole section including id and size.
    pub range: ByteRange,
    /// Location of the content following the name.
    pub content: Range<usize>,
    /// The standard section preceding this one, if any.
    pub follows: Option<SectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSection {
    pub count: u32,
    /// Location of the section payload within the module.
    pub payload: Range<usize>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Module
// ══════════════════════════════════════════════════════════════════════════════

/// Declarations of a WebAssembly module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    size: usize,
    types: Vec<FuncType>,
    imports: Vec<Import>,
    import_func_count: usize,
    func_type_indexes: Vec<u32>,
    memory: Option<(u32, Option<u32>)>,
    globals: Vec<Global>,
    export_funcs: BTreeMap<String, u32>,
    start: Option<u32>,
    code: Option<CodeSection>,
    data: Vec<DataSegment>,
    sections: SectionMap,
    customs: Vec<CustomSection>,
}

impl Module {
    /// Parse module declarations and section layout.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let mut m = Module {
            size: bytes.len(),
            ..Default::default()
        };

        let mut prev_end = MODULE_HEADER_SIZE as usize;
        let mut last_id: Option<SectionId> = None;
        let mut defined_funcs = 0usize;

        for payload in Parser::new(0).parse_all(bytes) {
            let payload = payload.map_err(malformed)?;

            let (id, end) = match &payload {
                Payload::Version { range, .. } => {
                    prev_end = range.end;
                    continue;
                }
                Payload::End(_) => break,
                Payload::CodeSectionEntry(_) => continue,

                Payload::TypeSection(r) => (SectionId::Type, r.range().end),
                Payload::ImportSection(r) => (SectionId::Import, r.range().end),
                Payload::FunctionSection(r) => (SectionId::Function, r.range().end),
                Payload::TableSection(r) => (SectionId::Table, r.range().end),
                Payload::MemorySection(r) => (SectionId::Memory, r.range().end),
                Payload::GlobalSection(r) => (SectionId::Global, r.range().end),
                Payload::ExportSection(r) => (SectionId::Export, r.range().end),
                Payload::StartSection { range, .. } => (SectionId::Start, range.end),
                Payload::ElementSection(r) => (SectionId::Element, r.range().end),
                Payload::CodeSectionStart { range, .. } => (SectionId::Code, range.end),
                Payload::DataSection(r) => (SectionId::Data, r.range().end),
                Payload::CustomSection(r) => (SectionId::Custom, r.range().end),

                Payload::DataCountSection { range, .. } => {
                    // Consistent with the data section; not recorded.
                    prev_end = range.end;
                    continue;
                }

                _ => return Err(ImageError::bad_module("unsupported section in wasm module")),
            };

            let range = ByteRange::new(prev_end as u64, (end - prev_end) as u32);
            prev_end = end;

            if id != SectionId::Custom {
                if last_id.is_some_and(|last| last >= id) {
                    return Err(ImageError::bad_module(format!(
                        "section {} out of order",
                        id as u8
                    )));
                }
                last_id = Some(id);
            }

            m.sections.put(id, range);

            match payload {
                Payload::TypeSection(r) => {
                    for t in r.into_iter_err_on_gc_types() {
                        m.types.push(func_type(&t.map_err(malformed)?)?);
                    }
                }

                Payload::ImportSection(r) => {
                    for import in r {
                        m.load_import(import.map_err(malformed)?)?;
                    }
                }

                Payload::FunctionSection(r) => {
                    for index in r {
                        let index = index.map_err(malformed)?;
                        m.check_type_index(index)?;
                        m.func_type_indexes.push(index);
                        defined_funcs += 1;
                    }
                }

                Payload::MemorySection(r) => {
                    for mem in r {
                        let mem = mem.map_err(malformed)?;
                        if m.memory.is_some() {
                            return Err(ImageError::bad_module("multiple memories"));
                        }
                        m.memory = Some(memory_limits(&mem)?);
                    }
                }

                Payload::GlobalSection(r) => {
                    for g in r {
                        let g = g.map_err(malformed)?;
                        let ty = global_type(&g.ty)?;
                        let init = m.init_expr(&g.init_expr)?;
                        m.globals.push(Global {
                            ty,
                            init: Some(init),
                        });
                    }
                }

                Payload::ExportSection(r) => {
                    for export in r {
                        let export = export.map_err(malformed)?;
                        if export.kind == ExternalKind::Func {
                            m.add_export_func(export.name, export.index)?;
                        }
                    }
                }

                Payload::StartSection { func, .. } => {
                    m.start = Some(func);
                }

                Payload::CodeSectionStart { count, range, .. } => {
                    if count as usize != defined_funcs {
                        return Err(ImageError::bad_module(
                            "function and code section have inconsistent lengths",
                        ));
                    }
                    m.code = Some(CodeSection {
                        count,
                        payload: range,
                    });
                }

                Payload::DataSection(r) => {
                    for d in r {
                        let d = d.map_err(malformed)?;
                        m.load_data_segment(d)?;
                    }
                }

                Payload::CustomSection(r) => {
                    m.customs.push(CustomSection {
                        name: r.name().to_string(),
                        range,
                        content: r.data_offset()..r.data_offset() + r.data().len(),
                        follows: last_id,
                    });
                }

                _ => {}
            }
        }

        if defined_funcs > 0 && m.code.is_none() {
            return Err(ImageError::bad_module("code section is missing"));
        }

        for &index in m.start.iter() {
            match m.func_type(index) {
                Some(t) if t.is_empty() => {}
                _ => return Err(ImageError::bad_module("invalid start function")),
            }
        }

        debug!(
            size = m.size,
            types = m.types.len(),
            functions = m.func_type_indexes.len(),
            globals = m.globals.len(),
            customs = m.customs.len(),
            "module loaded"
        );

        Ok(m)
    }

    fn load_import(&mut self, import: wasmparser::Import<'_>) -> Result<()> {
        let kind = match import.ty {
            TypeRef::Func(index) => {
                self.check_type_index(index)?;
                self.func_type_indexes.push(index);
                self.import_func_count += 1;
                ImportKind::Func(index)
            }

            TypeRef::Global(t) => {
                let ty = global_type(&t)?;
                if ty.mutable() {
                    return Err(ImageError::bad_module("mutable global import"));
                }
                self.globals.push(Global { ty, init: None });
                ImportKind::Global(ty)
            }

            _ => {
                return Err(ImageError::bad_module(format!(
                    "unsupported import kind: {}.{}",
                    import.module, import.name
                )));
            }
        };

        self.imports.push(Import {
            module: import.module.to_string(),
            field: import.name.to_string(),
            kind,
        });
        Ok(())
    }

    fn load_data_segment(&mut self, d: wasmparser::Data<'_>) -> Result<()> {
        let DataKind::Active {
            memory_index,
            offset_expr,
        } = d.kind
        else {
            return Err(ImageError::bad_module("passive data segments are not supported"));
        };

        if memory_index != 0 {
            return Err(ImageError::bad_module("data segment refers to unknown memory"));
        }

        let offset = match self.init_expr(&offset_expr)? {
            InitExpr::I32(x) => x as u32,
            _ => {
                return Err(ImageError::bad_module(
                    "unsupported data segment offset expression",
                ));
            }
        };

        let start = d.range.end - d.data.len();
        self.data.push(DataSegment {
            offset,
            data: start..d.range.end,
        });
        Ok(())
    }

    fn init_expr(&self, expr: &wasmparser::ConstExpr<'_>) -> Result<InitExpr> {
        let mut ops = expr.get_operators_reader();

        let init = match ops.read().map_err(malformed)? {
            Operator::I32Const { value } => InitExpr::I32(value),
            Operator::I64Const { value } => InitExpr::I64(value),
            Operator::F32Const { value } => InitExpr::F32(value.bits()),
            Operator::F64Const { value } => InitExpr::F64(value.bits()),
            Operator::GlobalGet { global_index } => {
                match self.globals.get(global_index as usize) {
                    Some(g) if g.init.is_none() => InitExpr::GlobalGet(global_index),
                    _ => {
                        return Err(ImageError::bad_module(
                            "initializer refers to a non-imported global",
                        ));
                    }
                }
            }
            _ => return Err(ImageError::bad_module("unsupported initializer expression")),
        };

        if !matches!(ops.read().map_err(malformed)?, Operator::End) {
            return Err(ImageError::bad_module("unsupported initializer expression"));
        }

        Ok(init)
    }

    fn check_type_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.types.len() {
            return Err(ImageError::bad_module(format!(
                "function type index out of bounds: {index}"
            )));
        }
        Ok(())
    }

    fn add_export_func(&mut self, name: &str, index: u32) -> Result<()> {
        if index as usize >= self.func_type_indexes.len() {
            return Err(ImageError::bad_module(format!(
                "exported function index out of bounds: {index}"
            )));
        }
        if self.export_funcs.insert(name.to_string(), index).is_some() {
            return Err(ImageError::bad_module(format!("duplicate export: {name}")));
        }
        Ok(())
    }

    /// Replace the exports with the ones hidden in a `gate.export` section.
    pub fn unwrap_exports(&mut self, wrapped: WrappedExports, wrap: ByteRange) -> Result<()> {
        if !self.sections.get(SectionId::Export).is_empty() {
            return Err(ImageError::bad_module(
                "gate.export section and standard export section in same module",
            ));
        }

        for (name, index) in wrapped.funcs {
            self.add_export_func(&name, index)?;
        }

        self.sections.put(SectionId::Export, wrapped.range);
        self.sections.export_wrap = wrap;
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn import_func_count(&self) -> usize {
        self.import_func_count
    }

    /// Type indexes of all functions, imported functions first.
    pub fn func_type_indexes(&self) -> &[u32] {
        &self.func_type_indexes
    }

    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let t = *self.func_type_indexes.get(index as usize)?;
        self.types.get(t as usize)
    }

    pub fn export_funcs(&self) -> &BTreeMap<String, u32> {
        &self.export_funcs
    }

    /// Exported function index and its signature.
    pub fn export_func(&self, name: &str) -> Option<(u32, &FuncType)> {
        let &index = self.export_funcs.get(name)?;
        Some((index, self.func_type(index)?))
    }

    pub fn start_func(&self) -> Option<u32> {
        self.start
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn global_types(&self) -> Vec<u8> {
        self.globals.iter().map(|g| g.ty.0).collect()
    }

    /// Size of the globals area: one word per global.
    pub fn globals_size(&self) -> usize {
        self.globals.len() * 8
    }

    pub fn initial_memory_size(&self) -> u32 {
        match self.memory {
            Some((initial, _)) => initial << WASM_PAGE_BITS,
            None => 0,
        }
    }

    /// Maximum memory size in bytes, or -1 if the memory may grow without a
    /// declared bound.
    pub fn memory_size_limit(&self) -> i64 {
        match self.memory {
            Some((_, Some(max))) => (max as i64) << WASM_PAGE_BITS,
            Some((_, None)) => -1,
            None => 0,
        }
    }

    pub fn code_section(&self) -> Option<&CodeSection> {
        self.code.as_ref()
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data
    }

    pub fn sections(&self) -> &SectionMap {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut SectionMap {
        &mut self.sections
    }

    pub fn custom_sections(&self) -> &[CustomSection] {
        &self.customs
    }
}

// ── Conversions ─────────────────────────────────────────────────────────────

fn value_type(t: ValType) -> Result<ValueType> {
    match t {
        ValType::I32 => Ok(ValueType::I32),
        ValType::I64 => Ok(ValueType::I64),
        ValType::F32 => Ok(ValueType::F32),
        ValType::F64 => Ok(ValueType::F64),
        _ => Err(ImageError::bad_module(format!("unsupported value type: {t:?}"))),
    }
}

fn func_type(t: &wasmparser::FuncType) -> Result<FuncType> {
    let params = t.params().iter().map(|&v| value_type(v)).collect::<Result<_>>()?;
    let results: Vec<ValueType> = t.results().iter().map(|&v| value_type(v)).collect::<Result<_>>()?;
    if results.len() > 1 {
        return Err(ImageError::bad_module("multiple return values"));
    }
    Ok(FuncType::new(params, results))
}

fn global_type(t: &wasmparser::GlobalType) -> Result<GlobalType> {
    if t.shared {
        return Err(ImageError::bad_module("shared globals are not supported"));
    }
    Ok(GlobalType::new(value_type(t.content_type)?, t.mutable))
}

fn memory_limits(mem: &wasmparser::MemoryType) -> Result<(u32, Option<u32>)> {
    if mem.memory64 || mem.shared || mem.page_size_log2.is_some() {
        return Err(ImageError::bad_module("unsupported memory type"));
    }
    if mem.initial > MAX_MEMORY_PAGES {
        return Err(ImageError::resource_limit("initial memory size is too large"));
    }

    let maximum = match mem.maximum {
        Some(max) if max < mem.initial => {
            return Err(ImageError::bad_module(
                "maximum memory size is smaller than initial size",
            ));
        }
        Some(max) => Some(max.min(MAX_MEMORY_PAGES) as u32),
        None => None,
    };

    Ok((mem.initial as u32, maximum))
}
