//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! AHCI/SATA driver core.
//!
//! The driver discovers AHCI controllers, brings their ports up, identifies
//! attached ATA disks and reads their GPT partition tables. Disks and
//! partitions are then served to clients as virtio block devices.
//!
//! Nothing here blocks or spawns threads. Register handshakes and retries
//! are continuations on an [`errand::Errands`] queue which the embedding
//! server drives from its timer, while interrupts enter through
//! [`driver::Driver::handle_irq`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod driver;
pub mod errand;
pub mod error;
pub mod gpt;
pub mod hba;
pub mod hw;
pub mod port;
pub mod regs;
pub mod slot;
pub mod virtio;
pub mod virtqueue;

#[cfg(test)]
mod testing;

pub use config::{Config, StaticClient};
pub use device::{Device, DeviceId, DeviceInfo, DeviceKind, Devices};
pub use driver::{Driver, Interface, IoToken};
pub use errand::{Errands, PollBudget};
pub use error::{Error, Result};
pub use hba::{Hba, HbaConfig};
pub use hw::{
    ClientMemory, Direction, DmaAddr, DmaMemory, DmaSpace, Doorbell, DsId, IrqLine, Mmio,
    PciFunction, Registers,
};
pub use port::{Port, PortState};
pub use virtio::{BlockTarget, VirtioBlock};
