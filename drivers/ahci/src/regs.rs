//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! AHCI register map (AHCI 1.3.1, section 3).

use bitflags::bitflags;

// Generic host control, offsets into ABAR.
pub mod hba {
    pub const CAP: usize = 0x00;
    pub const GHC: usize = 0x04;
    pub const IS: usize = 0x08;
    pub const PI: usize = 0x0c;
    pub const VS: usize = 0x10;
    pub const CAP2: usize = 0x24;
}

/// Offset of port 0 and stride of the port register sets.
pub const PORT_BASE: usize = 0x100;
pub const PORT_STRIDE: usize = 0x80;
pub const MAX_PORTS: usize = 32;

#[inline]
#[must_use]
pub const fn port_offset(port: usize) -> usize {
    PORT_BASE + PORT_STRIDE * port
}

// Port registers, offsets into the port window.
pub mod port {
    pub const CLB: usize = 0x00;
    pub const CLBU: usize = 0x04;
    pub const FB: usize = 0x08;
    pub const FBU: usize = 0x0c;
    pub const IS: usize = 0x10;
    pub const IE: usize = 0x14;
    pub const CMD: usize = 0x18;
    pub const TFD: usize = 0x20;
    pub const SIG: usize = 0x24;
    pub const SSTS: usize = 0x28;
    pub const SCTL: usize = 0x2c;
    pub const SERR: usize = 0x30;
    pub const SACT: usize = 0x34;
    pub const CI: usize = 0x38;
    pub const SNTF: usize = 0x3c;
    pub const FBS: usize = 0x40;
    pub const DEVSLP: usize = 0x44;
}

bitflags! {
    /// GHC: global host control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ghc: u32 {
        const HR = 1 << 0;
        const IE = 1 << 1;
        const AE = 1 << 31;
    }
}

bitflags! {
    /// PxCMD: command and status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCmd: u32 {
        const ST = 1 << 0;
        const CLO = 1 << 3;
        const FRE = 1 << 4;
        const FR = 1 << 14;
        const CR = 1 << 15;
    }
}

impl PortCmd {
    /// Slot the controller is currently processing (PxCMD.CCS).
    #[must_use]
    pub const fn current_slot(raw: u32) -> usize {
        ((raw >> 8) & 0x1f) as usize
    }
}

bitflags! {
    /// PxTFD: task file data, status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tfd: u32 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const BSY = 1 << 7;
    }
}

bitflags! {
    /// PxIS / PxIE: interrupt status and enable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortIs: u32 {
        const DHRS = 1 << 0;
        const PSS = 1 << 1;
        const DSS = 1 << 2;
        const SDBS = 1 << 3;
        const UFS = 1 << 4;
        const DPS = 1 << 5;
        const PCS = 1 << 6;
        const DMPS = 1 << 7;
        const PRCS = 1 << 22;
        const IPMS = 1 << 23;
        const OFS = 1 << 24;
        const INFS = 1 << 26;
        const IFS = 1 << 27;
        const HBDS = 1 << 28;
        const HBFS = 1 << 29;
        const TFES = 1 << 30;
        const CPDS = 1 << 31;

        /// Device topology changed.
        const STATUS = Self::CPDS.bits() | Self::PRCS.bits() | Self::DMPS.bits() | Self::PCS.bits();
        const FATAL = Self::TFES.bits() | Self::HBFS.bits() | Self::HBDS.bits() | Self::IFS.bits();
        const ERROR = Self::INFS.bits() | Self::OFS.bits();
        const DATA = Self::DPS.bits() | Self::UFS.bits() | Self::SDBS.bits()
            | Self::DSS.bits() | Self::PSS.bits() | Self::DHRS.bits();
        const NONFATAL = Self::STATUS.bits() | Self::ERROR.bits() | Self::DATA.bits();
    }
}

/// PxSSTS.DET value for "device present, PHY communication established".
pub const SSTS_DET_PRESENT: u32 = 3;
pub const SSTS_DET_MASK: u32 = 0xf;

/// PxSCTL.DET: COMRESET.
pub const SCTL_DET_RESET: u32 = 1;

/// HBA capabilities (CAP register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbaCaps(pub u32);

impl HbaCaps {
    /// Supports 64-bit addressing.
    #[must_use]
    pub const fn s64a(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Supports native command queuing.
    #[must_use]
    pub const fn sncq(self) -> bool {
        self.0 & (1 << 30) != 0
    }

    /// Supports command list override.
    #[must_use]
    pub const fn sclo(self) -> bool {
        self.0 & (1 << 24) != 0
    }

    /// Number of command slots per port.
    #[must_use]
    pub const fn command_slots(self) -> usize {
        (((self.0 >> 8) & 0x1f) + 1) as usize
    }

    /// Number of ports the controller implements at most.
    #[must_use]
    pub const fn ports(self) -> usize {
        ((self.0 & 0x1f) + 1) as usize
    }
}

/// Device class derived from the port signature register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    None,
    Ata,
    Atapi,
    PortMultiplier,
    Semb,
    Unknown,
}

impl DeviceType {
    #[must_use]
    pub const fn from_signature(sig: u32) -> Self {
        let lbah = (sig >> 24) as u8;
        let lbam = (sig >> 16) as u8;
        match (lbah, lbam) {
            (0x00, 0x00) => DeviceType::Ata,
            (0x14, 0xeb) => DeviceType::Atapi,
            (0x69, 0x96) => DeviceType::PortMultiplier,
            (0x3c, 0xc3) => DeviceType::Semb,
            _ => DeviceType::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceType::None => "none",
            DeviceType::Ata => "ATA",
            DeviceType::Atapi => "ATAPI",
            DeviceType::PortMultiplier => "port multiplier",
            DeviceType::Semb => "SEMB",
            DeviceType::Unknown => "unknown",
        }
    }
}
