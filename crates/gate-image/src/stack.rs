//! Conversion between native and portable call stacks.
//!
//! A native stack (as left behind by the runtime) contains absolute return
//! addresses, which depend on the randomized text base.  In a portable stack
//! each return address is replaced by `stack_offset << 32 | call_index`,
//! where the call index refers to the object map.  The raw frame contents in
//! between are copied verbatim.
//!
//! Stacks are walked from the innermost frame (lowest address) towards the
//! initial call made by the enter routine.  The initial call site's stack
//! offset tells how many function addresses remain at the outermost end:
//!
//! - 16: start and entry function (a synthesized initial stack),
//! - 8: entry function (the start function is being called),
//! - 0: none (the entry function is being called).

use gate_types::{FuncType, ImageError, Result};

use crate::manifest::Function;
use crate::objectmap::ObjectMap;

/// Size of a synthesized initial stack.
pub const INIT_STACK_SIZE: usize = 24;

/// Portable function index meaning "no function".
const NO_FUNCTION: u64 = u64::MAX;

/// Call index of the virtual call site at the beginning of the enter routine.
const INIT_CALL_INDEX: u64 = 0;
const INIT_STACK_OFFSET: u64 = 16;

fn word(b: &[u8], pos: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[pos..pos + 8]);
    u64::from_le_bytes(w)
}

fn put_word(b: &mut [u8], pos: usize, x: u64) {
    b[pos..pos + 8].copy_from_slice(&x.to_le_bytes());
}

fn bad_stack(msg: impl Into<String>) -> ImageError {
    ImageError::BadTermination(msg.into())
}

fn check_size(n: usize) -> std::result::Result<(), String> {
    if n == 0 || n % 8 != 0 {
        return Err(format!("invalid stack size {n}"));
    }
    Ok(())
}

/// Portable stack which resumes at the beginning of the enter routine and
/// calls the start and entry functions.
pub fn init_stack(start: Option<&Function>, entry: Option<&Function>) -> Vec<u8> {
    let mut b = vec![0u8; INIT_STACK_SIZE];
    put_word(&mut b, 0, INIT_STACK_OFFSET << 32 | INIT_CALL_INDEX);
    put_word(&mut b, 8, start.map_or(NO_FUNCTION, |f| f.index as u64));
    put_word(&mut b, 16, entry.map_or(NO_FUNCTION, |f| f.index as u64));
    b
}

/// Native form of [`init_stack`] at a text address.
pub fn native_init_stack(
    text_addr: u64,
    map: &ObjectMap,
    start: Option<&Function>,
    entry: Option<&Function>,
) -> Result<Vec<u8>> {
    let call = map
        .call_sites
        .first()
        .filter(|c| c.stack_offset as u64 == INIT_STACK_OFFSET)
        .ok_or_else(|| ImageError::internal("object map has no initial call site"))?;

    let mut b = vec![0u8; INIT_STACK_SIZE];
    put_word(&mut b, 0, text_addr + call.ret_addr as u64);
    put_word(&mut b, 8, start.map_or(0, |f| f.addr as u64));
    put_word(&mut b, 16, entry.map_or(0, |f| f.addr as u64));
    Ok(b)
}

// ══════════════════════════════════════════════════════════════════════════════
// Export
// ══════════════════════════════════════════════════════════════════════════════

/// Convert a native stack to portable representation.  Failures mean that
/// the runtime left the stack in a bad state.
pub fn export_stack(native: &[u8], text_addr: u64, map: &ObjectMap) -> Result<Vec<u8>> {
    check_size(native.len()).map_err(bad_stack)?;

    let n = native.len();
    let mut portable = vec![0u8; n];
    let mut pos = 0;

    let init_offset = loop {
        if pos >= n {
            return Err(bad_stack("ran out of stack before initial call"));
        }

        let abs_ret_addr = word(native, pos);
        let ret_addr = abs_ret_addr.wrapping_sub(text_addr);
        if ret_addr > u32::MAX as u64 {
            return Err(bad_stack(format!(
                "return address {abs_ret_addr:#x} is not in text section"
            )));
        }

        let call = map.find_call(ret_addr as u32).ok_or_else(|| {
            bad_stack(format!("call instruction not found for return address {ret_addr:#x}"))
        })?;

        put_word(
            &mut portable,
            pos,
            (call.stack_offset as u32 as u64) << 32 | call.call_index as u64,
        );
        pos += 8;

        if call.init {
            break call.stack_offset;
        }

        if call.stack_offset <= 0 || call.stack_offset % 8 != 0 {
            return Err(bad_stack(format!("invalid stack offset {}", call.stack_offset)));
        }

        let frame = call.stack_offset as usize - 8;
        if pos + frame > n {
            return Err(bad_stack("stack frame exceeds stack"));
        }
        portable[pos..pos + frame].copy_from_slice(&native[pos..pos + frame]);
        pos += frame;
    };

    let func_words = match init_offset {
        16 => 2,
        8 => 1,
        0 => 0,
        x => {
            return Err(bad_stack(format!(
                "initial function call site has inconsistent stack offset {x}"
            )));
        }
    };

    for _ in 0..func_words {
        if pos + 8 > n {
            return Err(bad_stack("ran out of stack at initial function address"));
        }
        let index = export_func_addr(word(native, pos), map)?;
        put_word(&mut portable, pos, index);
        pos += 8;
    }

    if pos != n {
        return Err(bad_stack(format!("{} bytes of excess data at start of stack", n - pos)));
    }

    Ok(portable)
}

fn export_func_addr(addr: u64, map: &ObjectMap) -> Result<u64> {
    if addr == 0 {
        return Ok(NO_FUNCTION);
    }

    u32::try_from(addr)
        .ok()
        .and_then(|a| map.find_func(a))
        .map(|i| i as u64)
        .ok_or_else(|| bad_stack(format!("unknown function address {addr:#x}")))
}

// ══════════════════════════════════════════════════════════════════════════════
// Import
// ══════════════════════════════════════════════════════════════════════════════

/// Convert a portable stack to native representation in place.  Failures
/// mean that the module carries a bad stack.
pub fn import_stack(
    buf: &mut [u8],
    text_addr: u64,
    map: &ObjectMap,
    types: &[FuncType],
    func_type_indexes: &[u32],
) -> Result<()> {
    check_size(buf.len()).map_err(ImageError::BadModule)?;

    let n = buf.len();
    let mut pos = 0;
    let mut min_vars = 0usize;

    let init_offset = loop {
        if pos >= n {
            return Err(ImageError::bad_module("ran out of stack before initial call"));
        }

        let pair = word(buf, pos);
        let call_index = pair as u32 as usize;
        let call = *map.call_sites.get(call_index).ok_or_else(|| {
            ImageError::bad_module(format!("function call site index {call_index} is unknown"))
        })?;

        let encoded_offset = (pair >> 32) as u32 as i32;
        if encoded_offset != call.stack_offset {
            return Err(ImageError::bad_module(format!(
                "encoded stack offset {encoded_offset} of call site {call_index} does not match offset {} in map",
                call.stack_offset
            )));
        }

        put_word(buf, pos, text_addr + call.ret_addr as u64);
        pos += 8;

        if map.func_addrs.first().map_or(true, |&addr| call.ret_addr < addr) {
            break call.stack_offset;
        }

        if call.stack_offset <= 0 || call.stack_offset % 8 != 0 {
            return Err(ImageError::bad_module(format!(
                "invalid stack offset {}",
                call.stack_offset
            )));
        }
        let frame = call.stack_offset as usize - 8;
        if frame < min_vars * 8 {
            return Err(ImageError::bad_module("inconsistent call stack"));
        }
        if pos + frame > n {
            return Err(ImageError::bad_module("stack frame exceeds stack"));
        }
        pos += frame;

        let found = map
            .find_call(call.ret_addr)
            .filter(|c| !c.init && c.call_index == call_index && c.stack_offset == call.stack_offset)
            .ok_or_else(|| {
                ImageError::bad_module(format!(
                    "call instruction not found for return address {:#x}",
                    call.ret_addr
                ))
            })?;

        min_vars = func_signature(found.func_index as u64, types, func_type_indexes)?
            .params
            .len();
    };

    if min_vars > 0 {
        return Err(ImageError::bad_module("inconsistent call stack"));
    }

    let (start_word, entry_word) = match init_offset {
        16 => (true, true),
        8 => (false, true),
        0 => (false, false),
        x => {
            return Err(ImageError::bad_module(format!(
                "initial function call site has inconsistent stack offset {x}"
            )));
        }
    };

    if start_word {
        pos = import_func_index(buf, pos, map, types, func_type_indexes, "start", FuncType::is_empty)?;
    }
    if entry_word {
        pos = import_func_index(buf, pos, map, types, func_type_indexes, "entry", FuncType::is_entry)?;
    }

    if pos != n {
        return Err(ImageError::bad_module(format!(
            "{} bytes of excess data at start of stack",
            n - pos
        )));
    }

    Ok(())
}

fn import_func_index(
    buf: &mut [u8],
    pos: usize,
    map: &ObjectMap,
    types: &[FuncType],
    func_type_indexes: &[u32],
    role: &str,
    valid: fn(&FuncType) -> bool,
) -> Result<usize> {
    if pos + 8 > buf.len() {
        return Err(ImageError::bad_module(format!(
            "ran out of stack at {role} function index"
        )));
    }

    let index = word(buf, pos);
    let mut addr = 0u64;

    if index != NO_FUNCTION {
        addr = *map.func_addrs.get(index as usize).ok_or_else(|| {
            ImageError::bad_module(format!("{role} function index {index} is unknown"))
        })? as u64;

        let sig = func_signature(index, types, func_type_indexes)?;
        if !valid(sig) {
            return Err(ImageError::bad_module(format!(
                "{role} function {index} has invalid signature: {sig}"
            )));
        }
    }

    put_word(buf, pos, addr);
    Ok(pos + 8)
}

fn func_signature<'a>(index: u64, types: &'a [FuncType], func_type_indexes: &[u32]) -> Result<&'a FuncType> {
    func_type_indexes
        .get(index as usize)
        .and_then(|&t| types.get(t as usize))
        .ok_or_else(|| ImageError::bad_module(format!("function index {index} has no type")))
}

// ══════════════════════════════════════════════════════════════════════════════
// Stack trace
// ══════════════════════════════════════════════════════════════════════════════

/// Function activation in a native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub func_index: usize,
    pub call_index: usize,
    /// Text offset which the function returns to.
    pub ret_addr: u32,
    pub signature: FuncType,
    /// Raw stack slots of the caller's frame, innermost first.
    pub slots: Vec<u64>,
}

/// Walk a native stack without modifying it.  Frames are listed innermost
/// first; the enter routine is not included.
pub fn stacktrace(native: &[u8], text_addr: u64, map: &ObjectMap, func_types: &[FuncType]) -> Result<Vec<Frame>> {
    check_size(native.len()).map_err(bad_stack)?;

    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < native.len() {
        let ret_addr = word(native, pos).wrapping_sub(text_addr);
        pos += 8;

        let call = u32::try_from(ret_addr)
            .ok()
            .and_then(|r| map.find_call(r))
            .ok_or_else(|| bad_stack(format!("call instruction not found for return address {ret_addr:#x}")))?;
        if call.init {
            return Ok(frames);
        }

        if call.stack_offset <= 0 || call.stack_offset % 8 != 0 {
            return Err(bad_stack(format!("invalid stack offset {}", call.stack_offset)));
        }
        let frame_len = call.stack_offset as usize - 8;
        if pos + frame_len > native.len() {
            return Err(bad_stack("stack frame exceeds stack"));
        }

        let signature = func_types
            .get(call.func_index)
            .cloned()
            .ok_or_else(|| ImageError::internal(format!("function {} has no type", call.func_index)))?;

        frames.push(Frame {
            func_index: call.func_index,
            call_index: call.call_index,
            ret_addr: ret_addr as u32,
            signature,
            slots: (pos..pos + frame_len).step_by(8).map(|p| word(native, p)).collect(),
        });
        pos += frame_len;
    }

    Err(bad_stack("ran out of stack before initial call"))
}

#[cfg(test)]
mod tests {
    use gate_types::ValueType;

    use super::*;
    use crate::objectmap::CallSite;

    const TEXT_ADDR: u64 = 0x5_0000_0000;

    // Enter routine call sites, then two functions with one call each.
    fn map() -> ObjectMap {
        ObjectMap {
            call_sites: vec![
                CallSite { ret_addr: 0x10, stack_offset: 16 },
                CallSite { ret_addr: 0x18, stack_offset: 8 },
                CallSite { ret_addr: 0x20, stack_offset: 0 },
                CallSite { ret_addr: 0x48, stack_offset: 24 },
                CallSite { ret_addr: 0x88, stack_offset: 8 },
            ],
            func_addrs: vec![0x40, 0x80],
        }
    }

    fn types() -> (Vec<FuncType>, Vec<u32>) {
        (
            vec![
                FuncType::default(),
                FuncType::new(vec![ValueType::I32], vec![]),
            ],
            vec![0, 1],
        )
    }

    fn words(ws: &[u64]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn init_stack_layout() {
        let start = Function { index: 0, addr: 0x40 };
        let b = init_stack(Some(&start), None);
        assert_eq!(b, words(&[16 << 32, 0, u64::MAX]));

        let native = native_init_stack(TEXT_ADDR, &map(), Some(&start), None).unwrap();
        assert_eq!(native, words(&[TEXT_ADDR + 0x10, 0x40, 0]));
    }

    #[test]
    fn import_init_stack() {
        let (types, indexes) = types();
        let start = Function { index: 0, addr: 0x40 };
        let mut b = init_stack(Some(&start), None);

        import_stack(&mut b, TEXT_ADDR, &map(), &types, &indexes).unwrap();
        assert_eq!(b, native_init_stack(TEXT_ADDR, &map(), Some(&start), None).unwrap());
    }

    #[test]
    fn export_then_import_restores_native_stack() {
        let (types, indexes) = types();

        // Function 1 (one param) suspended in a call from function 0,
        // which was called as the entry function.
        let native = words(&[
            TEXT_ADDR + 0x88, // return into function 1
            TEXT_ADDR + 0x48, // return into function 0
            0x1111,
            0x2222,
            TEXT_ADDR + 0x20, // return into enter routine
        ]);

        let portable = export_stack(&native, TEXT_ADDR, &map()).unwrap();
        assert_eq!(word(&portable, 0), 8 << 32 | 4);
        assert_eq!(word(&portable, 8), 24 << 32 | 3);
        assert_eq!(word(&portable, 16), 0x1111);
        assert_eq!(word(&portable, 32), 2);

        let mut back = portable.clone();
        import_stack(&mut back, TEXT_ADDR, &map(), &types, &indexes).unwrap();
        assert_eq!(back, native);
    }

    #[test]
    fn export_entry_address() {
        let native = words(&[TEXT_ADDR + 0x18, 0x80]);
        let portable = export_stack(&native, TEXT_ADDR, &map()).unwrap();
        assert_eq!(portable, words(&[8 << 32 | 1, 1]));

        let native = words(&[TEXT_ADDR + 0x18, 0]);
        let portable = export_stack(&native, TEXT_ADDR, &map()).unwrap();
        assert_eq!(portable, words(&[8 << 32 | 1, u64::MAX]));
    }

    #[test]
    fn export_rejects_bad_stacks() {
        let m = map();
        let bad = |ws: &[u64]| export_stack(&words(ws), TEXT_ADDR, &m).unwrap_err().kind();

        assert_eq!(export_stack(&[], TEXT_ADDR, &m).unwrap_err().kind(), gate_types::ErrorKind::BadTermination);
        assert_eq!(bad(&[0x44]), gate_types::ErrorKind::BadTermination);
        assert_eq!(bad(&[TEXT_ADDR + 0x30]), gate_types::ErrorKind::BadTermination);
        assert_eq!(bad(&[TEXT_ADDR + 0x20, 7]), gate_types::ErrorKind::BadTermination);
        assert_eq!(bad(&[TEXT_ADDR + 0x88]), gate_types::ErrorKind::BadTermination);
        assert_eq!(bad(&[TEXT_ADDR + 0x18, 0x99]), gate_types::ErrorKind::BadTermination);
    }

    #[test]
    fn import_rejects_bad_stacks() {
        let (types, indexes) = types();
        let m = map();
        let bad = |ws: &[u64]| {
            let mut b = words(ws);
            import_stack(&mut b, TEXT_ADDR, &m, &types, &indexes)
                .unwrap_err()
                .kind()
        };

        // Unknown call index.
        assert_eq!(bad(&[9]), gate_types::ErrorKind::BadModule);
        // Stack offset mismatch.
        assert_eq!(bad(&[8 << 32 | 2]), gate_types::ErrorKind::BadModule);
        // Start function with parameters.
        assert_eq!(bad(&[16 << 32, 1, u64::MAX]), gate_types::ErrorKind::BadModule);
        // Outermost function has parameters.
        assert_eq!(bad(&[8 << 32 | 4, 2]), gate_types::ErrorKind::BadModule);
        // Trailing garbage.
        assert_eq!(bad(&[2, 5]), gate_types::ErrorKind::BadModule);
    }

    #[test]
    fn trace_frames() {
        let (types, _) = types();
        let native = words(&[TEXT_ADDR + 0x88, TEXT_ADDR + 0x48, 0x1111, 0x2222, TEXT_ADDR + 0x20]);

        let frames = stacktrace(&native, TEXT_ADDR, &map(), &types).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].func_index, 1);
        assert!(frames[0].slots.is_empty());
        assert_eq!(frames[1].func_index, 0);
        assert_eq!(frames[1].slots, vec![0x1111, 0x2222]);
    }
}
