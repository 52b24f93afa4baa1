//! Absolute-address memory access.
//!
//! [`Memory`] is the read/write primitive the chain engine consumes.
//! Implementors provide byte-range access; the width-qualified helpers
//! are little-endian and built on top of it.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{Addr, Int64};

/// Read/write access to an address space by absolute address.
pub trait Memory {
    /// Fill `buf` with the bytes at `addr..addr + buf.len()`.
    fn read_bytes(&self, addr: Addr, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `addr..addr + data.len()`.
    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    fn read_u8(&self, addr: Addr) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, addr: Addr) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_bytes(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: Addr) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, addr: Addr) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u8(&mut self, addr: Addr, value: u8) -> Result<()> {
        self.write_bytes(addr, &[value])
    }

    fn write_u16(&mut self, addr: Addr, value: u16) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: Addr, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: Addr, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn read_addr(&self, addr: Addr) -> Result<Addr> {
        self.read_u64(addr).map(Addr)
    }

    fn read_int64(&self, addr: Addr) -> Result<Int64> {
        self.read_u64(addr).map(Int64)
    }

    fn write_int64(&mut self, addr: Addr, value: Int64) -> Result<()> {
        self.write_u64(addr, value.value())
    }
}

pub const PAGE_SIZE: u64 = 0x1000;

/// Paged, lazily-mapped address space held in process memory.
///
/// Pages must be mapped with [`SparseMemory::map`] before use; access to
/// an unmapped page fails with [`Error::Unmapped`].
#[derive(Debug, Default)]
pub struct SparseMemory {
    pages: HashMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map (zero-filled) every page overlapping `addr..addr + len`.
    /// Already-mapped pages keep their contents.
    pub fn map(&mut self, addr: Addr, len: u64) {
        if len == 0 {
            return;
        }
        let first = addr.0 / PAGE_SIZE;
        let last = addr.0.saturating_add(len - 1) / PAGE_SIZE;
        for page in first..=last {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        }
    }

    pub fn is_mapped(&self, addr: Addr) -> bool {
        self.pages.contains_key(&(addr.0 / PAGE_SIZE))
    }

    /// Number of mapped pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Memory for SparseMemory {
    fn read_bytes(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let page = self.pages.get(&(cur.0 / PAGE_SIZE)).ok_or(Error::Unmapped(cur))?;
            let off = (cur.0 % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        // Check the whole range first so a failed write leaves no partial bytes.
        let mut probe = 0usize;
        while probe < data.len() {
            let cur = addr + probe as u64;
            if !self.is_mapped(cur) {
                return Err(Error::Unmapped(cur));
            }
            probe += PAGE_SIZE as usize - (cur.0 % PAGE_SIZE) as usize;
        }

        let mut done = 0usize;
        while done < data.len() {
            let cur = addr + done as u64;
            let off = (cur.0 % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - off).min(data.len() - done);
            if let Some(page) = self.pages.get_mut(&(cur.0 / PAGE_SIZE)) {
                page[off..off + n].copy_from_slice(&data[done..done + n]);
            }
            done += n;
        }
        Ok(())
    }
}
