//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Split virtqueue living in client memory.
//!
//! All ring and descriptor addresses are client addresses, resolved
//! through the regions the client registered. Nothing read from the ring
//! is trusted: every index and length is range-checked before use.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result};
use crate::hw::{checked_range, ClientMemory, DsId};

pub const DESC_SIZE: u64 = 16;
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Client memory registered for DMA, mapped at `base` in client address space.
pub struct Region {
    pub ds: DsId,
    pub base: u64,
    pub mem: Rc<dyn ClientMemory>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base.saturating_add(self.mem.len())
    }
}

/// The set of regions one client may reference, bounded by its dataspace
/// allowance.
pub struct ClientRegions {
    regions: Vec<Region>,
    limit: usize,
}

impl ClientRegions {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            regions: Vec::new(),
            limit,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn add(&mut self, ds: DsId, base: u64, mem: Rc<dyn ClientMemory>) -> Result<()> {
        if self.regions.len() >= self.limit {
            return Err(Error::NoMemory);
        }
        let region = Region { ds, base, mem };
        if region.mem.len() == 0 || base.checked_add(region.mem.len()).is_none() {
            return Err(Error::Invalid);
        }
        if self
            .regions
            .iter()
            .any(|r| r.ds == ds || (base < r.end() && r.base < region.end()))
        {
            return Err(Error::Exists);
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Region containing `[addr, addr + len)` and the offset into it.
    pub fn resolve(&self, addr: u64, len: u64) -> Result<(&Region, u64)> {
        let region = self
            .regions
            .iter()
            .find(|r| addr >= r.base && addr < r.end())
            .ok_or(Error::Invalid)?;
        let offset = addr - region.base;
        checked_range(offset, len, region.mem.len())?;
        Ok((region, offset))
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (region, offset) = self.resolve(addr, buf.len() as u64)?;
        region.mem.read(offset, buf)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (region, offset) = self.resolve(addr, data.len() as u64)?;
        region.mem.write(offset, data)
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read(addr, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    fn parse(raw: &[u8; 16]) -> Self {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&raw[0..8]);
        Self {
            addr: u64::from_le_bytes(addr),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_le_bytes([raw[12], raw[13]]),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    #[must_use]
    pub fn device_writable(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    #[must_use]
    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// Client addresses of the three queue areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub num: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

pub struct Virtqueue {
    layout: QueueLayout,
    last_avail: u16,
    used_idx: u16,
}

impl Virtqueue {
    /// `num` must be a power of two no larger than `max`.
    pub fn new(layout: QueueLayout, max: u16) -> Result<Self> {
        if layout.num == 0 || !layout.num.is_power_of_two() || layout.num > max {
            return Err(Error::Invalid);
        }
        Ok(Self {
            layout,
            last_avail: 0,
            used_idx: 0,
        })
    }

    #[must_use]
    pub fn layout(&self) -> QueueLayout {
        self.layout
    }

    /// Take the next available chain head, if the client published one.
    pub fn pop_avail(&mut self, mem: &ClientRegions) -> Result<Option<u16>> {
        let idx = mem.read_u16(self.layout.avail + 2)?;
        if idx == self.last_avail {
            return Ok(None);
        }
        // Ring entries must not be read before the index that publishes them.
        fence(Ordering::Acquire);
        let slot = u64::from(self.last_avail % self.layout.num);
        let head = mem.read_u16(self.layout.avail + 4 + 2 * slot)?;
        if head >= self.layout.num {
            return Err(Error::Invalid);
        }
        self.last_avail = self.last_avail.wrapping_add(1);
        Ok(Some(head))
    }

    fn read_desc(mem: &ClientRegions, table: u64, index: u16) -> Result<Descriptor> {
        let mut raw = [0u8; 16];
        mem.read(table + u64::from(index) * DESC_SIZE, &mut raw)?;
        Ok(Descriptor::parse(&raw))
    }

    /// Collect the descriptor chain starting at `head`. An indirect
    /// descriptor is expanded in place; indirect tables may not nest.
    pub fn chain(&self, mem: &ClientRegions, head: u16) -> Result<Vec<Descriptor>> {
        let num = self.layout.num;
        let mut out = Vec::new();
        let mut index = head;
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > u32::from(num) || index >= num {
                return Err(Error::Invalid);
            }
            let desc = Self::read_desc(mem, self.layout.desc, index)?;
            if desc.is_indirect() {
                if desc.has_next() {
                    return Err(Error::Invalid);
                }
                self.indirect(mem, &desc, &mut out)?;
                return Ok(out);
            }
            out.push(desc);
            if !desc.has_next() {
                return Ok(out);
            }
            index = desc.next;
        }
    }

    fn indirect(&self, mem: &ClientRegions, table: &Descriptor, out: &mut Vec<Descriptor>) -> Result<()> {
        let len = u64::from(table.len);
        if len == 0 || len % DESC_SIZE != 0 {
            return Err(Error::Invalid);
        }
        let count = len / DESC_SIZE;
        if count > u64::from(u16::MAX) {
            return Err(Error::Invalid);
        }
        let mut index = 0u16;
        for _ in 0..count {
            let desc = Self::read_desc(mem, table.addr, index)?;
            if desc.is_indirect() {
                return Err(Error::Invalid);
            }
            out.push(desc);
            if !desc.has_next() {
                return Ok(());
            }
            if u64::from(desc.next) >= count {
                return Err(Error::Invalid);
            }
            index = desc.next;
        }
        // Walked the whole table without reaching the end of the chain.
        Err(Error::Invalid)
    }

    /// Hand chain `head` back to the client with `len` bytes written.
    pub fn push_used(&mut self, mem: &ClientRegions, head: u16, len: u32) -> Result<()> {
        let slot = u64::from(self.used_idx % self.layout.num);
        let mut elem = [0u8; 8];
        elem[0..4].copy_from_slice(&u32::from(head).to_le_bytes());
        elem[4..8].copy_from_slice(&len.to_le_bytes());
        mem.write(self.layout.used + 4 + 8 * slot, &elem)?;
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write(self.layout.used + 2, &self.used_idx.to_le_bytes())
    }

    #[must_use]
    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }
}
