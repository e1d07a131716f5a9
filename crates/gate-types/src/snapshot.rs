//! Execution state which survives a snapshot: termination info, breakpoints
//! and I/O buffers.

use serde::{Deserialize, Serialize};

/// Maximum number of breakpoints in a snapshot.
pub const MAX_BREAKPOINTS: usize = 100;

/// Maximum length of a service name in a buffer section.
pub const MAX_SERVICE_NAME_LEN: usize = 127;

/// Snapshot sub-record of program and instance manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Execution has terminated for good.
    #[serde(rename = "final", default)]
    pub is_final: bool,
    /// Trap id, or zero.
    #[serde(default)]
    pub trap: u32,
    /// Exit result.
    #[serde(default)]
    pub result: i32,
    /// Monotonic clock value at the time of the snapshot.
    #[serde(default)]
    pub monotonic_time: u64,
    /// Code section offsets in ascending order, without duplicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakpoints: Vec<u64>,
}

impl Snapshot {
    /// Flag word of the snapshot section.
    pub fn flags(&self) -> u64 {
        self.is_final as u64
    }
}

/// Sort and deduplicate a breakpoint list.
pub fn sort_dedup(mut offsets: Vec<u64>) -> Vec<u64> {
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// Buffered data of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub buffer: Vec<u8>,
}

impl Service {
    pub fn new(name: impl Into<String>, buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            buffer: buffer.into(),
        }
    }
}

/// Live I/O state at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffers {
    pub services: Vec<Service>,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

impl Buffers {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.input.is_empty() && self.output.is_empty()
    }

    /// Total size of the raw data.
    pub fn data_len(&self) -> usize {
        self.input.len()
            + self.output.len()
            + self.services.iter().map(|s| s.buffer.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_dedup_breakpoints() {
        assert_eq!(sort_dedup(vec![0x30, 0x10, 0x20, 0x10]), vec![0x10, 0x20, 0x30]);
        assert!(sort_dedup(Vec::new()).is_empty());
    }

    #[test]
    fn buffers_data_len() {
        let bs = Buffers {
            services: vec![Service::new("a", vec![1, 2]), Service::new("b", vec![])],
            input: vec![3],
            output: vec![4, 5, 6],
        };
        assert!(!bs.is_empty());
        assert_eq!(bs.data_len(), 6);
        assert!(Buffers::default().is_empty());
    }
}
