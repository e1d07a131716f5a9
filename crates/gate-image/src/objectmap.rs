//! Call sites and function addresses produced by the compiler.
//!
//! Both tables are stored in program files as raw little-endian arrays:
//! 8 bytes per call site, 4 bytes per function address.

use gate_types::{ImageError, Result};

use crate::file::File;

pub const CALL_SITE_SIZE: usize = 8;
pub const FUNC_ADDR_SIZE: usize = 4;

/// Location of a call instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSite {
    /// Text offset of the instruction following the call.
    pub ret_addr: u32,
    /// Stack frame size of the caller at the call, including the return
    /// address.
    pub stack_offset: i32,
}

/// Result of a call site lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundCall {
    /// The call is made by the enter routine, before any function.
    pub init: bool,
    pub func_index: usize,
    pub call_index: usize,
    pub stack_offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMap {
    /// Sorted by return address.
    pub call_sites: Vec<CallSite>,
    /// Text offset of every function, imports included.
    pub func_addrs: Vec<u32>,
}

impl ObjectMap {
    pub fn call_sites_size(&self) -> usize {
        self.call_sites.len() * CALL_SITE_SIZE
    }

    pub fn func_addrs_size(&self) -> usize {
        self.func_addrs.len() * FUNC_ADDR_SIZE
    }

    pub fn call_sites_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.call_sites_size());
        for c in &self.call_sites {
            b.extend_from_slice(&c.ret_addr.to_le_bytes());
            b.extend_from_slice(&c.stack_offset.to_le_bytes());
        }
        b
    }

    pub fn func_addrs_bytes(&self) -> Vec<u8> {
        self.func_addrs.iter().flat_map(|a| a.to_le_bytes()).collect()
    }

    /// Decode tables written by [`ObjectMap::copy_to`] or
    /// [`ObjectMap::write_at`].
    pub fn from_bytes(call_sites: &[u8], func_addrs: &[u8]) -> Result<Self> {
        if call_sites.len() % CALL_SITE_SIZE != 0 || func_addrs.len() % FUNC_ADDR_SIZE != 0 {
            return Err(ImageError::internal("object map size is misaligned"));
        }

        let call_sites = call_sites
            .chunks_exact(CALL_SITE_SIZE)
            .map(|c| CallSite {
                ret_addr: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                stack_offset: i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            })
            .collect();

        let func_addrs = func_addrs
            .chunks_exact(FUNC_ADDR_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            call_sites,
            func_addrs,
        })
    }

    /// Copy both tables into a buffer, call sites first.
    pub fn copy_to(&self, buf: &mut [u8]) -> Result<()> {
        let cs = self.call_sites_bytes();
        let fa = self.func_addrs_bytes();
        if buf.len() < cs.len() + fa.len() {
            return Err(ImageError::internal("object map buffer is too small"));
        }
        buf[..cs.len()].copy_from_slice(&cs);
        buf[cs.len()..cs.len() + fa.len()].copy_from_slice(&fa);
        Ok(())
    }

    /// Write both tables at a file offset, call sites first.
    pub fn write_at(&self, file: &File, offset: u64) -> Result<()> {
        file.write_vec_at([&self.call_sites_bytes(), &self.func_addrs_bytes()], offset)
    }

    /// Find the call site with a return address.
    pub fn find_call(&self, ret_addr: u32) -> Option<FoundCall> {
        let call_index = self
            .call_sites
            .binary_search_by_key(&ret_addr, |c| c.ret_addr)
            .ok()?;
        let stack_offset = self.call_sites[call_index].stack_offset;

        if self.func_addrs.first().map_or(true, |&addr| ret_addr < addr) {
            return Some(FoundCall {
                init: true,
                func_index: 0,
                call_index,
                stack_offset,
            });
        }

        let func_index = self.func_addrs.partition_point(|&addr| addr <= ret_addr) - 1;

        Some(FoundCall {
            init: false,
            func_index,
            call_index,
            stack_offset,
        })
    }

    /// Index of the function at a text address.
    pub fn find_func(&self, addr: u32) -> Option<usize> {
        self.func_addrs.iter().position(|&a| a == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectMap {
        ObjectMap {
            call_sites: vec![
                CallSite { ret_addr: 0x08, stack_offset: 16 },
                CallSite { ret_addr: 0x0c, stack_offset: 8 },
                CallSite { ret_addr: 0x10, stack_offset: 0 },
                CallSite { ret_addr: 0x48, stack_offset: 24 },
                CallSite { ret_addr: 0x90, stack_offset: 8 },
            ],
            func_addrs: vec![0x40, 0x80],
        }
    }

    #[test]
    fn find_call_in_functions() {
        let m = sample();

        let c = m.find_call(0x48).unwrap();
        assert!(!c.init);
        assert_eq!(c.func_index, 0);
        assert_eq!(c.call_index, 3);
        assert_eq!(c.stack_offset, 24);

        let c = m.find_call(0x90).unwrap();
        assert_eq!(c.func_index, 1);
        assert_eq!(c.call_index, 4);
    }

    #[test]
    fn find_call_in_enter_routine() {
        let m = sample();
        let c = m.find_call(0x0c).unwrap();
        assert!(c.init);
        assert_eq!(c.call_index, 1);
        assert_eq!(c.stack_offset, 8);

        assert!(m.find_call(0x44).is_none());
    }

    #[test]
    fn find_func_by_addr() {
        let m = sample();
        assert_eq!(m.find_func(0x80), Some(1));
        assert_eq!(m.find_func(0x81), None);
    }

    #[test]
    fn raw_tables() {
        let m = sample();
        assert_eq!(m.call_sites_size(), 40);
        assert_eq!(m.func_addrs_size(), 8);

        let mut buf = vec![0u8; 48];
        m.copy_to(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x08, 0, 0, 0, 16, 0, 0, 0]);

        let back = ObjectMap::from_bytes(&buf[..40], &buf[40..]).unwrap();
        assert_eq!(back, m);

        assert!(m.copy_to(&mut [0u8; 47]).is_err());
        assert!(ObjectMap::from_bytes(&buf[..39], &[]).is_err());
    }
}
