//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Mock controller and DMA space for unit tests.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::error::{Error, Result};
use crate::hw::{Direction, DmaAddr, DmaMemory, DmaSpace, DsId, Registers};
use crate::regs::{hba, port as reg, PortCmd, PortIs, Tfd, PORT_BASE, PORT_STRIDE};

const SSTS_PRESENT: u32 = 0x113;

#[derive(Default)]
struct MockPort {
    regs: [u32; PORT_STRIDE / 4],
    engine_stuck: bool,
    fis_stuck: bool,
    clo_requested: bool,
    resets: u32,
}

struct MockState {
    hba: [u32; PORT_BASE / 4],
    ports: Vec<MockPort>,
}

/// Register-level model of an AHCI controller. Commands never execute on
/// their own; tests complete or fail slots explicitly.
#[derive(Clone)]
pub struct FakeHba {
    inner: Rc<RefCell<MockState>>,
}

impl FakeHba {
    pub fn with_ports(count: usize) -> Self {
        let mut state = MockState {
            hba: [0; PORT_BASE / 4],
            ports: (0..count).map(|_| MockPort::default()).collect(),
        };
        state.hba[hba::CAP / 4] = (1 << 31) | (1 << 24) | (31 << 8) | (count as u32 - 1);
        state.hba[hba::PI / 4] = (1u32 << count) - 1;
        state.hba[hba::VS / 4] = 0x0001_0300;
        for port in &mut state.ports {
            port.regs[reg::SSTS / 4] = SSTS_PRESENT;
            port.regs[reg::SIG / 4] = 0x0000_0101;
        }
        Self {
            inner: Rc::new(RefCell::new(state)),
        }
    }

    pub fn set_hba_reg(&self, offset: usize, value: u32) {
        self.inner.borrow_mut().hba[offset / 4] = value;
    }

    pub fn hba_reg(&self, offset: usize) -> u32 {
        self.inner.borrow().hba[offset / 4]
    }

    pub fn set_port_reg(&self, port: usize, offset: usize, value: u32) {
        self.inner.borrow_mut().ports[port].regs[offset / 4] = value;
    }

    pub fn port_reg(&self, port: usize, offset: usize) -> u32 {
        self.read32(PORT_BASE + PORT_STRIDE * port + offset)
    }

    pub fn stick_engine(&self, port: usize, stuck: bool) {
        self.inner.borrow_mut().ports[port].engine_stuck = stuck;
    }

    pub fn stick_fis_receive(&self, port: usize, stuck: bool) {
        self.inner.borrow_mut().ports[port].fis_stuck = stuck;
    }

    pub fn clo_requested(&self, port: usize) -> bool {
        self.inner.borrow().ports[port].clo_requested
    }

    pub fn reset_count(&self, port: usize) -> u32 {
        self.inner.borrow().ports[port].resets
    }

    fn raise(&self, port: usize, bits: u32) {
        let mut state = self.inner.borrow_mut();
        state.ports[port].regs[reg::IS / 4] |= bits;
        state.hba[hba::IS / 4] |= 1 << port;
    }

    /// Finish `slot` successfully and flag the interrupt.
    pub fn complete_slot(&self, port: usize, slot: usize) {
        self.inner.borrow_mut().ports[port].regs[reg::CI / 4] &= !(1 << slot);
        self.raise(port, PortIs::DHRS.bits());
    }

    /// Task file error while `slot` is the current command.
    pub fn fail_current(&self, port: usize, slot: usize) {
        {
            let mut state = self.inner.borrow_mut();
            let regs = &mut state.ports[port].regs;
            regs[reg::CMD / 4] = (regs[reg::CMD / 4] & !(0x1f << 8)) | ((slot as u32) << 8);
            regs[reg::TFD / 4] |= Tfd::ERR.bits();
        }
        self.raise(port, PortIs::TFES.bits());
    }

    pub fn raise_port_irq(&self, port: usize, bits: u32) {
        self.raise(port, bits);
    }
}

impl Registers for FakeHba {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.inner.borrow();
        if offset < PORT_BASE {
            return state.hba[offset / 4];
        }
        let index = (offset - PORT_BASE) / PORT_STRIDE;
        let Some(port) = state.ports.get(index) else {
            return 0;
        };
        let r = (offset - PORT_BASE) % PORT_STRIDE;
        let raw = port.regs[r / 4];
        if r != reg::CMD {
            return raw;
        }
        let mut value = raw & !(PortCmd::CR | PortCmd::FR).bits();
        if raw & PortCmd::ST.bits() != 0 && !port.engine_stuck {
            value |= PortCmd::CR.bits();
        }
        if raw & PortCmd::FRE.bits() != 0 || port.fis_stuck {
            value |= PortCmd::FR.bits();
        }
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.inner.borrow_mut();
        if offset < PORT_BASE {
            match offset {
                hba::IS => state.hba[hba::IS / 4] &= !value,
                hba::GHC => state.hba[hba::GHC / 4] = value & !1,
                _ => state.hba[offset / 4] = value,
            }
            return;
        }
        let index = (offset - PORT_BASE) / PORT_STRIDE;
        let Some(port) = state.ports.get_mut(index) else {
            return;
        };
        let r = (offset - PORT_BASE) % PORT_STRIDE;
        match r {
            reg::IS | reg::SERR => port.regs[r / 4] &= !value,
            reg::CI => port.regs[r / 4] |= value,
            reg::CMD => {
                let old = port.regs[r / 4];
                if value & PortCmd::CLO.bits() != 0 {
                    port.clo_requested = true;
                    port.regs[reg::TFD / 4] &= !(Tfd::BSY | Tfd::DRQ).bits();
                }
                port.regs[r / 4] = value & !(PortCmd::CLO | PortCmd::CR | PortCmd::FR).bits();
                if old & PortCmd::ST.bits() != 0 && value & PortCmd::ST.bits() == 0 {
                    port.regs[reg::CI / 4] = 0;
                    port.regs[reg::SACT / 4] = 0;
                }
            }
            reg::SCTL => {
                port.regs[r / 4] = value;
                if value & 0xf == 1 {
                    port.resets += 1;
                    port.regs[reg::SSTS / 4] = 0;
                } else if value & 0xf == 0 && port.regs[reg::SSTS / 4] == 0 {
                    port.regs[reg::SSTS / 4] = SSTS_PRESENT;
                }
            }
            _ => port.regs[r / 4] = value,
        }
    }

    fn size(&self) -> usize {
        PORT_BASE + PORT_STRIDE * self.inner.borrow().ports.len()
    }
}

struct FakeMemory {
    addr: DmaAddr,
    buf: Vec<u8>,
}

impl DmaMemory for FakeMemory {
    fn device_addr(&self) -> DmaAddr {
        self.addr
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// DMA space handing out fake device addresses and counting mappings.
pub struct FakeDma {
    next: Cell<u64>,
    maps: Cell<usize>,
    unmaps: Cell<usize>,
    pub fail_map: Cell<bool>,
    pub fail_alloc: Cell<bool>,
}

impl FakeDma {
    pub fn new() -> Self {
        Self {
            next: Cell::new(0x10_0000),
            maps: Cell::new(0),
            unmaps: Cell::new(0),
            fail_map: Cell::new(false),
            fail_alloc: Cell::new(false),
        }
    }

    pub fn live_mappings(&self) -> usize {
        self.maps.get() - self.unmaps.get()
    }

    pub fn total_mappings(&self) -> usize {
        self.maps.get()
    }
}

impl DmaSpace for FakeDma {
    fn alloc(&self, size: usize, _dir: Direction) -> Result<Box<dyn DmaMemory>> {
        if self.fail_alloc.get() {
            return Err(Error::NoMemory);
        }
        let addr = self.next.get();
        self.next.set(addr + ((size as u64 + 0xfff) & !0xfff));
        Ok(Box::new(FakeMemory {
            addr,
            buf: vec![0; size],
        }))
    }

    fn map(&self, ds: DsId, offset: u64, _len: usize, _dir: Direction) -> Result<DmaAddr> {
        if self.fail_map.get() {
            return Err(Error::NoMemory);
        }
        self.maps.set(self.maps.get() + 1);
        Ok(0x8000_0000 + u64::from(ds) * 0x1000_0000 + offset)
    }

    fn unmap(&self, _addr: DmaAddr, _len: usize, _dir: Direction) {
        self.unmaps.set(self.unmaps.get() + 1);
    }
}
