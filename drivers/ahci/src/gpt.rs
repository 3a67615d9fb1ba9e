//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! GUID partition table reader.
//!
//! The scan is two reads: the protective MBR plus the primary header
//! (two sectors at LBA 0), then the partition entry array. The caller
//! performs the I/O; [`PartitionReader`] only interprets the buffers.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::error::{Error, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const MIN_ENTRY_SIZE: u32 = 128;
const MIN_HEADER_SIZE: usize = 92;

// Header field offsets.
const HDR_SIZE: usize = 12;
const HDR_CRC: usize = 16;
const HDR_ARRAY_LBA: usize = 72;
const HDR_ENTRIES: usize = 80;
const HDR_ENTRY_SIZE: usize = 84;
const HDR_ARRAY_CRC: usize = 88;

// Entry field offsets.
const ENT_TYPE_GUID: usize = 0;
const ENT_GUID: usize = 16;
const ENT_FIRST: usize = 32;
const ENT_LAST: usize = 40;
const ENT_FLAGS: usize = 48;
const ENT_NAME: usize = 56;
const ENT_NAME_CHARS: usize = 36;

fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// IEEE CRC32 as used by GPT.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Canonical text form of an on-disk GUID. The first three fields are
/// stored little-endian.
#[must_use]
pub fn format_guid(raw: &[u8]) -> String {
    let mut out = String::with_capacity(36);
    let d1 = le_u32(raw, 0);
    let d2 = u16::from_le_bytes([raw[4], raw[5]]);
    let d3 = u16::from_le_bytes([raw[6], raw[7]]);
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
        d1, d2, d3, raw[8], raw[9]
    );
    for byte in &raw[10..16] {
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub header_size: u32,
    pub header_crc: u32,
    pub array_lba: u64,
    pub entries: u32,
    pub entry_size: u32,
    pub array_crc: u32,
}

impl GptHeader {
    /// Parse the header sector. `NotFound` means the disk carries no GPT.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < MIN_HEADER_SIZE {
            return Err(Error::Invalid);
        }
        if &sector[..8] != GPT_SIGNATURE {
            return Err(Error::NotFound);
        }
        let header = Self {
            header_size: le_u32(sector, HDR_SIZE),
            header_crc: le_u32(sector, HDR_CRC),
            array_lba: le_u64(sector, HDR_ARRAY_LBA),
            entries: le_u32(sector, HDR_ENTRIES),
            entry_size: le_u32(sector, HDR_ENTRY_SIZE),
            array_crc: le_u32(sector, HDR_ARRAY_CRC),
        };
        if header.entry_size < MIN_ENTRY_SIZE {
            return Err(Error::Invalid);
        }
        Ok(header)
    }

    /// CRC over the first `header_size` bytes with the CRC field zeroed.
    #[must_use]
    pub fn header_crc_ok(&self, sector: &[u8]) -> bool {
        let size = self.header_size as usize;
        if !(MIN_HEADER_SIZE..=sector.len()).contains(&size) {
            return false;
        }
        let mut copy = Vec::from(&sector[..size]);
        copy[HDR_CRC..HDR_CRC + 4].fill(0);
        crc32(&copy) == self.header_crc
    }

    #[must_use]
    pub fn array_bytes(&self) -> u64 {
        u64::from(self.entries) * u64::from(self.entry_size)
    }

    #[must_use]
    pub fn array_sectors(&self, sector_size: usize) -> u64 {
        self.array_bytes().div_ceil(sector_size.max(1) as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Unique partition GUID, also the partition's hid.
    pub guid: String,
    pub type_guid: String,
    pub name: String,
    pub first: u64,
    /// Inclusive.
    pub last: u64,
    pub flags: u64,
}

fn entry_name(entry: &[u8]) -> String {
    let units = entry[ENT_NAME..ENT_NAME + ENT_NAME_CHARS * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0);
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Decode the used entries of a partition array.
#[must_use]
pub fn parse_entries(array: &[u8], header: &GptHeader) -> Vec<PartitionInfo> {
    let entry_size = header.entry_size as usize;
    let mut out = Vec::new();
    for i in 0..header.entries as usize {
        let start = i * entry_size;
        let Some(entry) = array.get(start..start + MIN_ENTRY_SIZE as usize) else {
            break;
        };
        let first = le_u64(entry, ENT_FIRST);
        let last = le_u64(entry, ENT_LAST);
        if first == 0 || last < first {
            continue;
        }
        out.push(PartitionInfo {
            guid: format_guid(&entry[ENT_GUID..ENT_GUID + 16]),
            type_guid: format_guid(&entry[ENT_TYPE_GUID..ENT_TYPE_GUID + 16]),
            name: entry_name(entry),
            first,
            last,
            flags: le_u64(entry, ENT_FLAGS),
        });
    }
    out
}

/// Entry array read the scan needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRead {
    pub lba: u64,
    pub sectors: u64,
}

/// Two-phase partition table scan of one disk.
#[derive(Debug, Clone)]
pub struct PartitionReader {
    sector_size: usize,
    verify_crc: bool,
    header: Option<GptHeader>,
}

impl PartitionReader {
    #[must_use]
    pub fn new(sector_size: usize, verify_crc: bool) -> Self {
        Self {
            sector_size,
            verify_crc,
            header: None,
        }
    }

    /// Bytes of the first read, at LBA 0.
    #[must_use]
    pub fn header_read_len(&self) -> usize {
        2 * self.sector_size
    }

    /// Interpret the first read. `Ok(None)` means there is no GPT.
    pub fn read_header(&mut self, data: &[u8]) -> Result<Option<ArrayRead>> {
        let sector = data
            .get(self.sector_size..2 * self.sector_size)
            .ok_or(Error::Invalid)?;
        let header = match GptHeader::parse(sector) {
            Ok(h) => h,
            Err(Error::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        if self.verify_crc && !header.header_crc_ok(sector) {
            return Err(Error::Invalid);
        }
        self.header = Some(header);
        if header.entries == 0 {
            return Ok(None);
        }
        Ok(Some(ArrayRead {
            lba: header.array_lba,
            sectors: header.array_sectors(self.sector_size),
        }))
    }

    /// Interpret the entry array read.
    pub fn read_array(&self, data: &[u8]) -> Result<Vec<PartitionInfo>> {
        let header = self.header.as_ref().ok_or(Error::Invalid)?;
        let bytes = usize::try_from(header.array_bytes()).map_err(|_| Error::Invalid)?;
        let array = data.get(..bytes).ok_or(Error::Invalid)?;
        if self.verify_crc && crc32(array) != header.array_crc {
            return Err(Error::Invalid);
        }
        Ok(parse_entries(array, header))
    }
}
