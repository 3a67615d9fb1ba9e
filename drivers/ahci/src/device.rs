//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Logical devices: whole ATA disks and partition windows on top of them.
//!
//! Devices live in a [`Devices`] arena and refer to each other by index.
//! A partition only adds an offset and a bounds check; the command itself
//! is always built from the parent disk's identity.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::gpt::PartitionInfo;
use crate::hba::Hba;
use crate::hw::Registers;
use crate::slot::{CommandFlags, DataBlock, Taskfile};

/// ATA command opcodes.
pub mod ata {
    pub const ID_DEVICE: u8 = 0xec;
    pub const READ_DMA: u8 = 0xc8;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const READ_SECTOR: u8 = 0x20;
    pub const READ_SECTOR_EXT: u8 = 0x24;
    pub const WRITE_DMA: u8 = 0xca;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const WRITE_SECTOR: u8 = 0x30;
    pub const WRITE_SECTOR_EXT: u8 = 0x34;
}

/// Device register value selecting LBA addressing.
pub const DEVICE_LBA: u8 = 0x40;
pub const IDENTIFY_SIZE: usize = 512;
pub const MIN_SECTOR_SIZE: usize = 512;

const LBA28_MAX_COUNT: u64 = 256;
const LBA48_MAX_COUNT: u64 = 65536;
const LBA28_LIMIT: u64 = 1 << 28;
const LBA48_LIMIT: u64 = 1 << 48;
const DMA32_LIMIT: u64 = 1 << 32;

// IDENTIFY DEVICE word offsets.
const IID_SERIAL: usize = 10;
const IID_FIRMWARE: usize = 23;
const IID_MODEL: usize = 27;
const IID_CAPABILITIES: usize = 49;
const IID_LBA_SECTORS: usize = 60;
const IID_MAJOR_REV: usize = 80;
const IID_MINOR_REV: usize = 81;
const IID_ENABLED_FEATURES: usize = 85;
const IID_LBA48_SECTORS: usize = 100;
const IID_SECTOR_SIZE_INFO: usize = 106;
const IID_LOGICAL_SECTOR_SIZE: usize = 117;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFeatures: u8 {
        const LBA = 1 << 0;
        const DMA = 1 << 1;
        const LBA48 = 1 << 2;
        /// Controller can DMA above 4 GiB.
        const S64A = 1 << 3;
        const READ_ONLY = 1 << 4;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Identity clients use to ask for the device.
    pub hid: String,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub ata_major: u16,
    pub ata_minor: u16,
    pub sector_size: usize,
    pub num_sectors: u64,
    pub features: DeviceFeatures,
}

fn word(data: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

/// ATA strings store two characters per word, high byte first.
fn id_string(data: &[u8], first_word: usize, len: usize) -> String {
    let mut out = String::with_capacity(len);
    for w in first_word..first_word + len / 2 {
        let [lo, hi] = word(data, w).to_le_bytes();
        for byte in [hi, lo] {
            out.push(if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                ' '
            });
        }
    }
    String::from(out.trim())
}

impl DeviceInfo {
    /// Decode an IDENTIFY DEVICE data block.
    pub fn from_identify(data: &[u8], s64a: bool) -> Result<Self> {
        if data.len() < IDENTIFY_SIZE {
            return Err(Error::Invalid);
        }

        let mut features = DeviceFeatures::empty();
        let caps = word(data, IID_CAPABILITIES);
        features.set(DeviceFeatures::LBA, caps & (1 << 9) != 0);
        features.set(DeviceFeatures::DMA, caps & (1 << 8) != 0);
        features.set(
            DeviceFeatures::LBA48,
            word(data, IID_ENABLED_FEATURES + 1) & (1 << 10) != 0,
        );
        features.set(DeviceFeatures::S64A, s64a);

        let num_sectors = if features.contains(DeviceFeatures::LBA48) {
            (0..4).fold(0u64, |acc, i| {
                acc | u64::from(word(data, IID_LBA48_SECTORS + i)) << (16 * i)
            })
        } else {
            u64::from(word(data, IID_LBA_SECTORS)) | u64::from(word(data, IID_LBA_SECTORS + 1)) << 16
        };

        // Word 106: bit 14 set and bit 15 clear mark the word valid, bit 12
        // says words 117-118 hold the logical sector size in 16-bit words.
        let size_info = word(data, IID_SECTOR_SIZE_INFO);
        let mut sector_size = MIN_SECTOR_SIZE;
        if size_info & 0xc000 == 0x4000 && size_info & (1 << 12) != 0 {
            let words = u32::from(word(data, IID_LOGICAL_SECTOR_SIZE))
                | u32::from(word(data, IID_LOGICAL_SECTOR_SIZE + 1)) << 16;
            sector_size = (words as usize * 2).max(MIN_SECTOR_SIZE);
        }

        let ata_major = match word(data, IID_MAJOR_REV) {
            0xffff => 0,
            rev => rev,
        };

        let serial = id_string(data, IID_SERIAL, 20);
        Ok(Self {
            hid: serial.clone(),
            serial,
            model: id_string(data, IID_MODEL, 40),
            firmware: id_string(data, IID_FIRMWARE, 8),
            ata_major,
            ata_minor: word(data, IID_MINOR_REV),
            sector_size,
            num_sectors,
            features,
        })
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.num_sectors.saturating_mul(self.sector_size as u64)
    }

    #[must_use]
    pub fn read_only(&self) -> bool {
        self.features.contains(DeviceFeatures::READ_ONLY)
    }
}

#[must_use]
pub fn identify_taskfile() -> Taskfile {
    Taskfile {
        command: ata::ID_DEVICE,
        ..Taskfile::default()
    }
}

/// Build the ATA command moving `blocks` to or from `sector` of the disk
/// described by `info`.
pub fn ata_taskfile(
    info: &DeviceInfo,
    sector: u64,
    blocks: &[DataBlock],
    flags: CommandFlags,
) -> Result<Taskfile> {
    let sector_size = info.sector_size as u64;
    let total: u64 = blocks.iter().map(|b| u64::from(b.size)).sum();
    if sector_size == 0 || total % sector_size != 0 {
        return Err(Error::Invalid);
    }
    if !info.features.contains(DeviceFeatures::S64A)
        && blocks
            .iter()
            .any(|b| b.addr.saturating_add(u64::from(b.size)) > DMA32_LIMIT)
    {
        return Err(Error::Invalid);
    }

    let lba48 = info.features.contains(DeviceFeatures::LBA48);
    let (max_count, limit) = if lba48 {
        (LBA48_MAX_COUNT, LBA48_LIMIT)
    } else {
        (LBA28_MAX_COUNT, LBA28_LIMIT)
    };
    let count = total / sector_size;
    if count == 0 || count > max_count {
        return Err(Error::Invalid);
    }
    let end = sector.checked_add(count).ok_or(Error::Invalid)?;
    if end > limit || (info.num_sectors > 0 && end > info.num_sectors) {
        return Err(Error::Invalid);
    }

    let write = flags.contains(CommandFlags::WRITE);
    let dma = info.features.contains(DeviceFeatures::DMA);
    let command = match (write, lba48, dma) {
        (false, true, true) => ata::READ_DMA_EXT,
        (false, true, false) => ata::READ_SECTOR_EXT,
        (false, false, true) => ata::READ_DMA,
        (false, false, false) => ata::READ_SECTOR,
        (true, true, true) => ata::WRITE_DMA_EXT,
        (true, true, false) => ata::WRITE_SECTOR_EXT,
        (true, false, true) => ata::WRITE_DMA,
        (true, false, false) => ata::WRITE_SECTOR,
    };

    let mut device = DEVICE_LBA;
    if !lba48 {
        // LBA 27:24 travel in the device register for 28-bit commands.
        device |= ((sector >> 24) & 0xf) as u8;
    }

    Ok(Taskfile {
        command,
        lba: sector,
        device,
        // The maximum count is encoded as zero.
        count: if count == max_count { 0 } else { count as u16 },
        flags,
        ..Taskfile::default()
    })
}

// --------------------------------------------------------------------------
// Device arena
// --------------------------------------------------------------------------

pub type DeviceId = usize;

/// Physical position of a whole disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLocation {
    pub hba: usize,
    pub port: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    pub parent: DeviceId,
    pub start: u64,
    pub size: u64,
    pub in_flight: u32,
    /// Zero means unlimited.
    pub max_in_flight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk(DiskLocation),
    Partition(PartitionWindow),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub info: DeviceInfo,
    pub kind: DeviceKind,
}

impl Device {
    #[must_use]
    pub fn disk(location: DiskLocation, info: DeviceInfo) -> Self {
        Self {
            info,
            kind: DeviceKind::Disk(location),
        }
    }

    /// Partition of `parent` covering sectors `part.first..=part.last`.
    pub fn partition(parent: DeviceId, parent_info: &DeviceInfo, part: &PartitionInfo) -> Result<Self> {
        if part.first == 0 || part.last < part.first {
            return Err(Error::Invalid);
        }
        if parent_info.num_sectors > 0 && part.last >= parent_info.num_sectors {
            return Err(Error::Invalid);
        }
        let size = part.last - part.first + 1;
        let info = DeviceInfo {
            hid: part.guid.clone(),
            serial: parent_info.serial.clone(),
            model: parent_info.model.clone(),
            firmware: parent_info.firmware.clone(),
            num_sectors: size,
            ..parent_info.clone()
        };
        Ok(Self {
            info,
            kind: DeviceKind::Partition(PartitionWindow {
                parent,
                start: part.first,
                size,
                in_flight: 0,
                max_in_flight: 0,
            }),
        })
    }

    #[must_use]
    pub fn hid(&self) -> &str {
        &self.info.hid
    }

    #[must_use]
    pub fn parent(&self) -> Option<DeviceId> {
        match self.kind {
            DeviceKind::Disk(_) => None,
            DeviceKind::Partition(ref w) => Some(w.parent),
        }
    }

    /// Map a device-relative request onto the parent's sector space.
    pub fn translate(&self, sector: u64, total_bytes: u64) -> Result<u64> {
        let DeviceKind::Partition(ref window) = self.kind else {
            return Ok(sector);
        };
        if sector >= window.size {
            return Err(Error::Invalid);
        }
        let sector_size = self.info.sector_size.max(1) as u64;
        let sectors = total_bytes.div_ceil(sector_size);
        if sectors > window.size - sector {
            return Err(Error::Invalid);
        }
        Ok(window.start + sector)
    }

    pub fn set_max_in_flight(&mut self, limit: u32) {
        if let DeviceKind::Partition(ref mut window) = self.kind {
            window.max_in_flight = limit;
        }
    }

    fn admit(&mut self) -> Result<()> {
        if let DeviceKind::Partition(ref mut window) = self.kind {
            if window.max_in_flight != 0 && window.in_flight >= window.max_in_flight {
                return Err(Error::Busy);
            }
            window.in_flight += 1;
        }
        Ok(())
    }

    fn retire(&mut self) {
        if let DeviceKind::Partition(ref mut window) = self.kind {
            window.in_flight = window.in_flight.saturating_sub(1);
        }
    }
}

#[derive(Default)]
pub struct Devices {
    slots: Vec<Option<Device>>,
}

impl Devices {
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn insert(&mut self, device: Device) -> DeviceId {
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            self.slots[id] = Some(device);
            return id;
        }
        self.slots.push(Some(device));
        self.slots.len() - 1
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, d)| d.as_ref().map(|d| (id, d)))
    }

    #[must_use]
    pub fn children(&self, parent: DeviceId) -> Vec<DeviceId> {
        self.iter()
            .filter(|(_, d)| d.parent() == Some(parent))
            .map(|(id, _)| id)
            .collect()
    }

    /// Disk a device ultimately lives on.
    #[must_use]
    pub fn location(&self, id: DeviceId) -> Option<DiskLocation> {
        let device = self.get(id)?;
        match device.kind {
            DeviceKind::Disk(location) => Some(location),
            DeviceKind::Partition(ref w) => self.location(w.parent),
        }
    }

    /// Resolve `sector` of device `id` down to its disk. Returns the disk
    /// location, the disk's identity and the absolute sector.
    pub fn resolve(
        &self,
        id: DeviceId,
        sector: u64,
        total_bytes: u64,
    ) -> Result<(DiskLocation, &DeviceInfo, u64)> {
        let device = self.get(id).ok_or(Error::NoDevice)?;
        let sector = device.translate(sector, total_bytes)?;
        match device.kind {
            DeviceKind::Disk(location) => Ok((location, &device.info, sector)),
            DeviceKind::Partition(ref w) => self.resolve(w.parent, sector, total_bytes),
        }
    }

    /// Release the in-flight count taken by [`inout_data`].
    pub fn retire(&mut self, id: DeviceId) {
        if let Some(device) = self.get_mut(id) {
            device.retire();
        }
    }
}

/// Issue a read or write of `blocks` at `sector` of device `id`.
///
/// Returns the command slot used. `Busy` asks the caller to retry once a
/// slot frees up.
pub fn inout_data<R: Registers + Clone, T>(
    devices: &mut Devices,
    hbas: &mut [Hba<R, T>],
    id: DeviceId,
    sector: u64,
    blocks: &[DataBlock],
    flags: CommandFlags,
    token: T,
) -> Result<usize> {
    let total: u64 = blocks.iter().map(|b| u64::from(b.size)).sum();
    let (location, info, absolute) = devices.resolve(id, sector, total)?;
    let tf = ata_taskfile(info, absolute, blocks, flags)?;
    let port = hbas
        .get_mut(location.hba)
        .and_then(|h| h.port_mut(location.port))
        .ok_or(Error::NoDevice)?;

    let device = devices.get_mut(id).ok_or(Error::NoDevice)?;
    device.admit()?;
    port.send_command(&tf, blocks, token).inspect_err(|_| device.retire())
}
