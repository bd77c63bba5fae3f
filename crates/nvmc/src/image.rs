//! Sparse byte image produced by a sector writer. Only the bytes that were
//! actually written are present; everything else is implicitly the flash
//! erase value when later rendered to Intel-HEX or a flat buffer.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SparseImage {
    bytes: BTreeMap<u32, u8>,
}

impl SparseImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, base_addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.bytes.insert(base_addr + i as u32, b);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.bytes.iter().map(|(&addr, &b)| (addr, b))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}
