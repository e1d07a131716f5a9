//! Interface to the native code generator and the runtime library.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use gate_image::{ObjectMap, TextBuffer};
use gate_types::{FuncType, ImageError, Result, ValueType};
use gate_wasm::Module;

/// Breakpoint requested at a code section offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Breakpoint {
    /// The compiler emitted a trap at the offset.
    pub set: bool,
}

/// Everything the compiler needs for generating text.
#[derive(Debug)]
pub struct CodeConfig<'a> {
    /// Code section payload (function count and bodies).
    pub code: &'a [u8],
    /// Module offset of the payload.
    pub code_offset: usize,
    pub text: TextBuffer<'a>,
    /// Call sites sorted by return address, and the text offset of every
    /// function.  The enter routine's call sites come first.
    pub object_map: &'a mut ObjectMap,
    /// Runtime library function index of every imported function.
    pub import_funcs: &'a [u32],
    /// Keyed by code section offset.
    pub breakpoints: &'a mut BTreeMap<u32, Breakpoint>,
}

/// Native code generator.
pub trait Compiler {
    /// Generate text for the code section and populate the object map.
    /// Text beyond the buffer's capacity fails with a resource limit error.
    fn compile_code(&mut self, module: &Module, code: CodeConfig<'_>) -> Result<()>;
}

/// Binds module imports to the runtime library.
pub trait ImportResolver {
    /// Library function index.
    fn resolve_func(&mut self, module: &str, field: &str, sig: &FuncType) -> Result<u32>;

    /// Constant value of an imported global.
    fn resolve_global(&mut self, module: &str, field: &str, t: ValueType) -> Result<u64>;

    /// The random data function was resolved.
    fn uses_random(&self) -> bool;
}

#[derive(Debug, Clone)]
struct LibraryFunc {
    index: u32,
    sig: FuncType,
}

/// Resolver backed by a table of library functions.  Global imports are not
/// supported.
#[derive(Debug, Clone, Default)]
pub struct LibraryResolver {
    funcs: HashMap<(String, String), LibraryFunc>,
    random_index: Option<u32>,
    random: bool,
}

impl LibraryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func(mut self, module: &str, field: &str, index: u32, sig: FuncType) -> Self {
        self.funcs
            .insert((module.to_string(), field.to_string()), LibraryFunc { index, sig });
        self
    }

    /// Mark a library function as the random data source.
    pub fn random_func(mut self, index: u32) -> Self {
        self.random_index = Some(index);
        self
    }
}

impl ImportResolver for LibraryResolver {
    fn resolve_func(&mut self, module: &str, field: &str, sig: &FuncType) -> Result<u32> {
        let f = self
            .funcs
            .get(&(module.to_string(), field.to_string()))
            .ok_or_else(|| ImageError::bad_module(format!("import function not supported: {module:?} {field:?}")))?;

        if &f.sig != sig {
            return Err(ImageError::bad_module(format!(
                "function {module}.{field} {} imported with wrong signature {sig}",
                f.sig
            )));
        }

        if self.random_index == Some(f.index) {
            self.random = true;
        }
        Ok(f.index)
    }

    fn resolve_global(&mut self, module: &str, field: &str, _t: ValueType) -> Result<u64> {
        Err(ImageError::bad_module(format!("import global not supported: {module:?} {field:?}")))
    }

    fn uses_random(&self) -> bool {
        self.random
    }
}

/// Module offset range of the code section payload.
pub(crate) fn code_payload(module: &Module) -> Range<usize> {
    module.code_section().map_or(0..0, |c| c.payload.clone())
}
