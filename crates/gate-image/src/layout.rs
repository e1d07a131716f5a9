//! Fixed offset plans of program and instance files.
//!
//! Program file:
//!
//! ```text
//! 0x000000000  text
//! 0x080000000  stack (aligned against globals)
//! 0x100000000  globals and memory in consecutive pages
//! 0x200000000  module and object map, packed with minimal alignment
//! 0x400000000  manifest
//! 0x480000000  end
//! ```
//!
//! Instance file:
//!
//! ```text
//! 0x000000000  stack; stack variables at the bottom, usage at the top
//! stack size   globals and memory in consecutive pages
//! 0x180000000  manifest
//! 0x200000000  end
//! ```

use crate::file::page_size;

pub const PROG_TEXT_OFFSET: u64 = 0x0_0000_0000;
pub const PROG_GLOBALS_PAGE_OFFSET: u64 = 0x1_0000_0000;
pub const PROG_MODULE_OFFSET: u64 = 0x2_0000_0000;
pub const PROG_MANIFEST_OFFSET: u64 = 0x4_0000_0000;
pub const PROG_MAX_OFFSET: u64 = 0x4_8000_0000;

/// Text must not reach into the stack area below the globals.
pub const MAX_TEXT_SIZE: usize = 0x8000_0000;

pub const INST_STACK_OFFSET: u64 = 0;
pub const INST_MANIFEST_OFFSET: u64 = 0x1_8000_0000;
pub const INST_MAX_OFFSET: u64 = 0x2_0000_0000;

pub const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

pub fn align_page(n: usize) -> usize {
    let mask = page_size() - 1;
    (n + mask) & !mask
}

pub fn align_page_u64(n: u64) -> u64 {
    let mask = page_size() as u64 - 1;
    (n + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(16), 16);

        let page = page_size();
        assert_eq!(align_page(0), 0);
        assert_eq!(align_page(1), page);
        assert_eq!(align_page(page), page);
        assert_eq!(align_page_u64(page as u64 + 1), 2 * page as u64);
    }

    #[test]
    fn regions_are_ordered() {
        assert!(PROG_TEXT_OFFSET + MAX_TEXT_SIZE as u64 <= PROG_GLOBALS_PAGE_OFFSET);
        assert!(PROG_GLOBALS_PAGE_OFFSET < PROG_MODULE_OFFSET);
        assert!(PROG_MODULE_OFFSET < PROG_MANIFEST_OFFSET);
        assert!(PROG_MANIFEST_OFFSET < PROG_MAX_OFFSET);
        assert!(INST_MANIFEST_OFFSET < INST_MAX_OFFSET);
    }
}
