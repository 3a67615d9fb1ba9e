//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Host bus adapter: controller features, port set, interrupt demux.

use alloc::vec::Vec;

use kernel_log::{klog_debug, klog_error, klog_info, Logger};

use crate::error::{Error, Result};
use crate::hw::{Registers, Window};
use crate::port::{Port, PortConfig, PortStep};
use crate::regs::{hba as reg, port_offset, Ghc, HbaCaps, MAX_PORTS, PORT_BASE, PORT_STRIDE};

const SUBSYS: &str = "ahci-hba";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbaConfig {
    /// Refuse controllers that cannot address all of a 64-bit host's memory.
    pub check_address_width: bool,
    pub port: PortConfig,
}

impl HbaConfig {
    #[must_use]
    pub const fn default() -> Self {
        Self {
            check_address_width: true,
            port: PortConfig::default(),
        }
    }
}

/// Interrupt outcome of one port.
pub struct PortIrq<T> {
    pub port: usize,
    pub step: PortStep<T>,
    pub status: Result<()>,
}

pub struct Hba<R, T> {
    regs: R,
    caps: HbaCaps,
    version: u32,
    ports: Vec<Option<Port<R, T>>>,
    log: Logger,
}

impl<R: Registers + Clone, T> Hba<R, T> {
    /// Switch the controller to AHCI mode and attach every implemented
    /// port that fits into the register window.
    pub fn new(regs: R, cfg: &HbaConfig, log: Logger) -> Result<Self> {
        let ghc = regs.read32(reg::GHC);
        regs.write32(reg::GHC, ghc | Ghc::AE.bits());

        let caps = HbaCaps(regs.read32(reg::CAP));
        let version = regs.read32(reg::VS);
        if cfg.check_address_width && cfg!(target_pointer_width = "64") && !caps.s64a() {
            klog_error!(
                log,
                SUBSYS,
                "controller lacks 64-bit DMA on a 64-bit host, refusing it"
            );
            return Err(Error::NoSys);
        }

        let window_ports = regs.size().saturating_sub(PORT_BASE) / PORT_STRIDE;
        let max_ports = window_ports.min(MAX_PORTS);
        let implemented = regs.read32(reg::PI);

        let mut ports = Vec::with_capacity(max_ports);
        for index in 0..max_ports {
            if implemented & (1 << index) == 0 {
                ports.push(None);
                continue;
            }
            let mut port = Port::new(
                index,
                Window::new(regs.clone(), port_offset(index)),
                caps.s64a(),
                cfg.port,
                log.clone(),
            );
            if let Err(err) = port.attach() {
                klog_debug!(log, SUBSYS, "port {}: not attached ({})", index, err);
            }
            ports.push(Some(port));
        }

        klog_info!(
            log,
            SUBSYS,
            "AHCI {}.{}: {} ports, {} slots, 64-bit {}, NCQ {}",
            version >> 16,
            (version >> 8) & 0xff,
            caps.ports(),
            caps.command_slots(),
            caps.s64a(),
            caps.sncq()
        );

        Ok(Self {
            regs,
            caps,
            version,
            ports,
            log,
        })
    }

    #[must_use]
    pub fn caps(&self) -> HbaCaps {
        self.caps
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn command_slots(&self) -> usize {
        self.caps.command_slots()
    }

    #[must_use]
    pub fn port(&self, index: usize) -> Option<&Port<R, T>> {
        self.ports.get(index).and_then(Option::as_ref)
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut Port<R, T>> {
        self.ports.get_mut(index).and_then(Option::as_mut)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port<R, T>> {
        self.ports.iter().flatten()
    }

    /// Ports with an attached device, in port order.
    #[must_use]
    pub fn attached_ports(&self) -> Vec<usize> {
        self.ports()
            .filter(|p| p.device_type() != crate::regs::DeviceType::None)
            .map(Port::index)
            .collect()
    }

    /// Acknowledge stale status and unmask the controller interrupt.
    pub fn enable_interrupts(&self) {
        let ghc = self.regs.read32(reg::GHC) & !Ghc::IE.bits();
        self.regs.write32(reg::GHC, ghc);
        self.regs.write32(reg::IS, u32::MAX);
        self.regs.write32(reg::GHC, ghc | Ghc::IE.bits());
    }

    /// Demultiplex the controller interrupt to the flagged ports, then
    /// acknowledge the handled bits.
    pub fn handle_irq(&mut self) -> Vec<PortIrq<T>> {
        let pending = self.regs.read32(reg::IS);
        let mut out = Vec::new();
        for (index, slot) in self.ports.iter_mut().enumerate() {
            if pending & (1 << index) == 0 {
                continue;
            }
            let Some(port) = slot.as_mut() else {
                continue;
            };
            let (step, status) = port.process_interrupts();
            out.push(PortIrq {
                port: index,
                step,
                status,
            });
        }
        if pending != 0 {
            self.regs.write32(reg::IS, pending);
        }
        out
    }

    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.log
    }
}
