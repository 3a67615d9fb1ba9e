//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Platform seams: register access, DMA memory, client memory and the
//! bus/interrupt collaborators.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::ptr::NonNull;

use crate::error::{Error, Result};

// --------------------------------------------------------------------------
// Register access
// --------------------------------------------------------------------------

/// 32-bit register block addressed by byte offset.
pub trait Registers {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    /// Size of the register window in bytes.
    fn size(&self) -> usize;
}

/// Memory-mapped register window.
#[derive(Clone, Copy, Debug)]
pub struct Mmio {
    base: NonNull<u8>,
    len: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must point to `len` bytes of device registers that stay
    /// mapped for as long as this value or any copy of it is alive.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }
}

impl Registers for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        if offset + 4 > self.len {
            return u32::MAX;
        }
        // SAFETY: offset checked against the window; alignment is the
        // caller's register map, all AHCI registers are dword aligned.
        unsafe { core::ptr::read_volatile(self.base.as_ptr().add(offset).cast::<u32>()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset + 4 > self.len {
            return;
        }
        // SAFETY: see read32.
        unsafe { core::ptr::write_volatile(self.base.as_ptr().add(offset).cast::<u32>(), value) }
    }

    fn size(&self) -> usize {
        self.len
    }
}

/// Sub-window of a register block starting at `base`.
#[derive(Clone, Debug)]
pub struct Window<R> {
    regs: R,
    base: usize,
}

impl<R: Registers> Window<R> {
    pub const fn new(regs: R, base: usize) -> Self {
        Self { regs, base }
    }

    #[inline]
    pub fn read(&self, reg: usize) -> u32 {
        self.regs.read32(self.base + reg)
    }

    #[inline]
    pub fn write(&self, reg: usize, value: u32) {
        self.regs.write32(self.base + reg, value);
    }

    pub fn set_bits(&self, reg: usize, bits: u32) {
        self.write(reg, self.read(reg) | bits);
    }

    pub fn clear_bits(&self, reg: usize, bits: u32) {
        self.write(reg, self.read(reg) & !bits);
    }
}

// --------------------------------------------------------------------------
// DMA
// --------------------------------------------------------------------------

pub type DmaAddr = u64;

/// Client dataspace handle as known to the DMA space.
pub type DsId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Pinned memory visible to both the CPU and the controller. Dropping it
/// releases the pinning and the device mapping.
pub trait DmaMemory {
    fn device_addr(&self) -> DmaAddr;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

pub trait DmaSpace {
    /// Allocate `size` bytes of zeroed pinned memory mapped for the device.
    fn alloc(&self, size: usize, dir: Direction) -> Result<Box<dyn DmaMemory>>;
    /// Map `len` bytes of client dataspace `ds` starting at `offset`.
    fn map(&self, ds: DsId, offset: u64, len: usize, dir: Direction) -> Result<DmaAddr>;
    fn unmap(&self, addr: DmaAddr, len: usize, dir: Direction);
}

/// A client range mapped into the DMA space, unmapped on drop.
pub struct DmaMapping {
    space: Rc<dyn DmaSpace>,
    addr: DmaAddr,
    len: usize,
    dir: Direction,
}

impl DmaMapping {
    pub fn new(
        space: &Rc<dyn DmaSpace>,
        ds: DsId,
        offset: u64,
        len: usize,
        dir: Direction,
    ) -> Result<Self> {
        let addr = space.map(ds, offset, len, dir)?;
        Ok(Self {
            space: Rc::clone(space),
            addr,
            len,
            dir,
        })
    }

    #[must_use]
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        self.space.unmap(self.addr, self.len, self.dir);
    }
}

// --------------------------------------------------------------------------
// Client side
// --------------------------------------------------------------------------

/// Memory shared by a client (virtqueue and data buffers).
pub trait ClientMemory {
    fn len(&self) -> u64;
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
}

/// Notification back to a client.
pub trait Doorbell {
    fn ring(&self);
}

// --------------------------------------------------------------------------
// Bus and interrupt collaborators
// --------------------------------------------------------------------------

pub trait PciFunction {
    fn config_read(&self, reg: u32, width: u32) -> Result<u32>;
    fn config_write(&self, reg: u32, value: u32, width: u32) -> Result<()>;
}

const PCI_COMMAND: u32 = 0x04;
const PCI_COMMAND_BUS_MASTER: u32 = 1 << 2;
const PCI_CLASS_REVISION: u32 = 0x08;

/// Mass storage / SATA controller, any programming interface.
pub const AHCI_CLASS_PREFIX: u32 = 0x0106;

/// Class-code check of the discovery collaborator.
pub fn is_ahci_controller(pci: &dyn PciFunction) -> Result<bool> {
    let class = pci.config_read(PCI_CLASS_REVISION, 32)? >> 8;
    Ok(class >> 8 == AHCI_CLASS_PREFIX)
}

pub fn enable_bus_master(pci: &dyn PciFunction) -> Result<()> {
    let cmd = pci.config_read(PCI_COMMAND, 16)?;
    if cmd & PCI_COMMAND_BUS_MASTER == 0 {
        pci.config_write(PCI_COMMAND, cmd | PCI_COMMAND_BUS_MASTER, 16)?;
    }
    Ok(())
}

pub trait IrqLine {
    fn unmask(&self);
    fn level_triggered(&self) -> bool;
}

/// Bounds-checked offset inside a region of `len` bytes.
pub fn checked_range(offset: u64, size: u64, len: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::Invalid),
    }
}
