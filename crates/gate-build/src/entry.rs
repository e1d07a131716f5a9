use gate_types::{FuncType, ImageError, Result};
use gate_wasm::Module;

pub const START_FUNCTION: &str = "_start";

/// Entry function index, or the implicit `_start` function index.  The
/// module doesn't know if it is a snapshot: `started` must be true for
/// snapshots.  Must agree with `Program::resolve_entry_func`.
pub fn resolve_entry_func(module: &Module, export_name: &str, started: bool) -> Result<Option<u32>> {
    let start = if started {
        None
    } else {
        module.export_func(START_FUNCTION)
    };

    if export_name.is_empty() {
        return Ok(start.filter(|(_, sig)| sig.is_entry()).map(|(index, _)| index));
    }

    if start.is_some() {
        return Err(ImageError::StartFunctionConflict);
    }
    if export_name == START_FUNCTION {
        return Ok(None);
    }

    match module.export_func(export_name) {
        Some((index, sig)) if FuncType::is_entry(sig) => Ok(Some(index)),
        _ => Err(ImageError::FunctionNotFound),
    }
}
