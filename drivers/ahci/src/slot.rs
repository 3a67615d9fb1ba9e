//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Command slots and the DMA-visible command structures behind them.
//!
//! Command memory layout of one port:
//!
//! ```text
//! 0x000  command list, 32 headers of 32 bytes
//! 0x400  received FIS area (256 bytes)
//! 0x500  command tables, one per slot, 0x200 bytes each
//! ```

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::hw::DmaAddr;

pub const MAX_SLOTS: usize = 32;
/// Scatter/gather entries per command table.
pub const MAX_PRD_ENTRIES: usize = 24;
/// Largest byte count a single PRD entry can describe.
pub const MAX_PRD_BYTES: u32 = 4 << 20;

const CMD_HEADER_SIZE: usize = 32;
pub const CMD_LIST_SIZE: usize = MAX_SLOTS * CMD_HEADER_SIZE;
pub const FIS_RX_OFFSET: usize = CMD_LIST_SIZE;
pub const FIS_RX_SIZE: usize = 256;
const CMD_TABLE_BASE: usize = FIS_RX_OFFSET + FIS_RX_SIZE;
const CMD_TABLE_PRDT: usize = 0x80;
const PRD_ENTRY_SIZE: usize = 16;
pub const CMD_TABLE_SIZE: usize = CMD_TABLE_PRDT + MAX_PRD_ENTRIES * PRD_ENTRY_SIZE;

const FIS_TYPE_REG_H2D: u8 = 0x27;
const FIS_H2D_COMMAND: u8 = 0x80;
const FIS_H2D_LEN_DWORDS: u32 = 5;

/// Bytes of command memory needed for `slots` command slots.
#[must_use]
pub const fn command_memory_size(slots: usize) -> usize {
    CMD_TABLE_BASE + slots * CMD_TABLE_SIZE
}

bitflags! {
    /// Per-command attributes carried into the command header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Host to device transfer.
        const WRITE = 1 << 0;
        /// The controller may prefetch PRDs.
        const PREFETCH = 1 << 1;
        const ATAPI = 1 << 2;
    }
}

/// ATA register values for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Taskfile {
    pub command: u8,
    pub features: u16,
    pub lba: u64,
    pub device: u8,
    pub count: u16,
    pub icc: u8,
    pub control: u8,
    /// Port multiplier port.
    pub pmp: u8,
    pub flags: CommandFlags,
}

/// One scatter/gather element in device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    pub addr: DmaAddr,
    pub size: u32,
}

impl DataBlock {
    #[must_use]
    pub const fn new(addr: DmaAddr, size: u32) -> Self {
        Self { addr, size }
    }
}

/// Host-to-device register FIS.
#[must_use]
pub fn encode_h2d_fis(tf: &Taskfile) -> [u8; 20] {
    let lba = tf.lba.to_le_bytes();
    let features = tf.features.to_le_bytes();
    let count = tf.count.to_le_bytes();
    let mut fis = [0u8; 20];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = FIS_H2D_COMMAND | (tf.pmp & 0xf);
    fis[2] = tf.command;
    fis[3] = features[0];
    fis[4..7].copy_from_slice(&lba[0..3]);
    fis[7] = tf.device;
    fis[8..11].copy_from_slice(&lba[3..6]);
    fis[11] = features[1];
    fis[12] = count[0];
    fis[13] = count[1];
    fis[14] = tf.icc;
    fis[15] = tf.control;
    fis
}

fn put_u32(mem: &mut [u8], off: usize, value: u32) {
    mem[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(mem: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&mem[off..off + 4]);
    u32::from_le_bytes(raw)
}

/// Occupancy and completion token of one hardware command slot.
///
/// A busy slot without a token was found active when the port memory was
/// set up; it completes silently.
#[derive(Debug)]
pub struct CommandSlot<T> {
    index: usize,
    busy: bool,
    token: Option<T>,
}

impl<T> CommandSlot<T> {
    #[must_use]
    pub const fn new(index: usize, busy: bool) -> Self {
        Self {
            index,
            busy,
            token: None,
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.busy
    }

    /// Claim the slot if it is free.
    pub fn reserve(&mut self) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        true
    }

    pub fn attach(&mut self, token: T) {
        self.token = Some(token);
    }

    /// Free the slot and hand back whoever was waiting on it.
    pub fn release(&mut self) -> Option<T> {
        self.busy = false;
        self.token.take()
    }

    #[must_use]
    pub const fn header_offset(&self) -> usize {
        self.index * CMD_HEADER_SIZE
    }

    #[must_use]
    pub const fn table_offset(&self) -> usize {
        CMD_TABLE_BASE + self.index * CMD_TABLE_SIZE
    }

    /// Fill command header and command table for `tf` with `blocks` as
    /// scatter/gather list. `base` is the device address of `mem`.
    pub fn setup(
        &self,
        mem: &mut [u8],
        base: DmaAddr,
        tf: &Taskfile,
        blocks: &[DataBlock],
    ) -> Result<()> {
        if blocks.len() > MAX_PRD_ENTRIES {
            return Err(Error::Invalid);
        }
        if blocks
            .iter()
            .any(|b| b.size == 0 || b.size > MAX_PRD_BYTES || b.addr & 1 != 0)
        {
            return Err(Error::Invalid);
        }

        let table = self.table_offset();
        mem[table..table + CMD_TABLE_SIZE].fill(0);
        mem[table..table + 20].copy_from_slice(&encode_h2d_fis(tf));
        for (i, block) in blocks.iter().enumerate() {
            let prd = table + CMD_TABLE_PRDT + i * PRD_ENTRY_SIZE;
            put_u32(mem, prd, block.addr as u32);
            put_u32(mem, prd + 4, (block.addr >> 32) as u32);
            put_u32(mem, prd + 12, block.size - 1);
        }

        let ctba = base + table as u64;
        let mut dw0 = FIS_H2D_LEN_DWORDS;
        if tf.flags.contains(CommandFlags::ATAPI) {
            dw0 |= 1 << 5;
        }
        if tf.flags.contains(CommandFlags::WRITE) {
            dw0 |= 1 << 6;
        }
        if tf.flags.contains(CommandFlags::PREFETCH) {
            dw0 |= 1 << 7;
        }
        // Clear busy upon R_OK.
        dw0 |= 1 << 10;
        dw0 |= (blocks.len() as u32) << 16;

        let header = self.header_offset();
        put_u32(mem, header, dw0);
        put_u32(mem, header + 4, 0);
        put_u32(mem, header + 8, ctba as u32);
        put_u32(mem, header + 12, (ctba >> 32) as u32);
        Ok(())
    }

    /// PRD byte count the controller reported for the last command.
    #[must_use]
    pub fn bytes_transferred(&self, mem: &[u8]) -> usize {
        get_u32(mem, self.header_offset() + 4) as usize
    }
}
