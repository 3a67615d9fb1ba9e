//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! AHCI port state machine.
//!
//! Multi-step operations are queued as [`Op`]s. An op that has to wait for
//! a register bit parks a [`Job`] and asks the caller, through
//! [`PortStep::wake`], to re-enter [`Port::step`] after the poll interval.
//! Every tick carries the epoch of the job it belongs to; starting error
//! recovery bumps the epoch so ticks of a cancelled job are ignored.
//!
//! Completed and aborted commands come back as [`Completion`]s in the
//! returned step, never as calls into the owner.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use kernel_log::{klog_debug, klog_error, klog_info, klog_trace, klog_warn, Logger};

use crate::errand::PollBudget;
use crate::error::{Error, Result};
use crate::hw::{Direction, DmaMemory, DmaSpace, Registers, Window};
use crate::regs::{
    port as reg, DeviceType, PortCmd, PortIs, Tfd, SCTL_DET_RESET, SSTS_DET_MASK,
    SSTS_DET_PRESENT,
};
use crate::slot::{
    command_memory_size, CommandSlot, DataBlock, Taskfile, FIS_RX_OFFSET, MAX_PRD_ENTRIES,
    MAX_SLOTS,
};

const SUBSYS: &str = "ahci-port";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Undefined,
    Present,
    PresentInit,
    Attached,
    Disabled,
    Enabling,
    Ready,
    Disabling,
    Error,
    ErrorInit,
    Fatal,
}

/// Timing of the register handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub handshake: PollBudget,
    pub reset_settle_us: u64,
}

impl PortConfig {
    #[must_use]
    pub const fn default() -> Self {
        Self {
            handshake: PollBudget::new(10, 50_000),
            reset_settle_us: 5_000,
        }
    }
}

/// Outcome of one command slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<T> {
    pub token: T,
    pub result: Result<usize>,
}

/// Request to re-enter [`Port::step`] with `PortEvent::Tick(epoch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub after_us: u64,
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Tick(u32),
}

#[derive(Debug)]
pub struct PortStep<T> {
    pub completions: Vec<Completion<T>>,
    pub wake: Option<Wake>,
    /// Set when the op queue drained, with the state it left behind.
    pub settled: Option<PortState>,
}

impl<T> Default for PortStep<T> {
    fn default() -> Self {
        Self {
            completions: Vec::new(),
            wake: None,
            settled: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Initialize,
    Enable,
    Disable,
    AbortSlots,
    Reset,
    ClearErrors,
    Reissue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    StopEngine,
    StopFis,
    ClearClo,
    StartEngine,
    StopForDisable,
    ResetSettle,
    ResetPresence,
    ResetIdle,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    wait: Wait,
    budget: PollBudget,
}

pub struct Port<R, T> {
    index: usize,
    regs: Window<R>,
    state: PortState,
    devtype: DeviceType,
    s64a: bool,
    slots: Vec<CommandSlot<T>>,
    mem: Option<Box<dyn DmaMemory>>,
    ops: VecDeque<Op>,
    job: Option<Job>,
    epoch: u32,
    disable_target: PortState,
    reissue: u32,
    cfg: PortConfig,
    log: Logger,
}

impl<R: Registers, T> Port<R, T> {
    pub fn new(index: usize, regs: Window<R>, s64a: bool, cfg: PortConfig, log: Logger) -> Self {
        Self {
            index,
            regs,
            state: PortState::Undefined,
            devtype: DeviceType::None,
            s64a,
            slots: Vec::new(),
            mem: None,
            ops: VecDeque::new(),
            job: None,
            epoch: 0,
            disable_target: PortState::Disabled,
            reissue: 0,
            cfg,
            log,
        }
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn state(&self) -> PortState {
        self.state
    }

    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.devtype
    }

    #[must_use]
    pub fn supports_64bit(&self) -> bool {
        self.s64a
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == PortState::Ready
    }

    /// An operation is still waiting on hardware.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.job.is_some() || !self.ops.is_empty()
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_busy()).count()
    }

    fn busy_mask(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.is_busy())
            .fold(0, |mask, s| mask | 1 << s.index())
    }

    #[must_use]
    pub fn device_present(&self) -> bool {
        self.regs.read(reg::SSTS) & SSTS_DET_MASK == SSTS_DET_PRESENT
    }

    #[must_use]
    pub fn device_ready(&self) -> bool {
        self.devtype != DeviceType::None && self.device_present()
    }

    fn cmd(&self) -> PortCmd {
        PortCmd::from_bits_retain(self.regs.read(reg::CMD))
    }

    fn command_list_disabled(&self) -> bool {
        !self.cmd().intersects(PortCmd::ST | PortCmd::CR)
    }

    fn fis_receive_disabled(&self) -> bool {
        !self.cmd().intersects(PortCmd::FRE | PortCmd::FR)
    }

    fn port_idle(&self) -> bool {
        !Tfd::from_bits_retain(self.regs.read(reg::TFD)).intersects(Tfd::BSY | Tfd::DRQ)
    }

    // ----------------------------------------------------------------------
    // Synchronous transitions
    // ----------------------------------------------------------------------

    /// Classify the attached device from its signature.
    pub fn attach(&mut self) -> Result<()> {
        if self.state != PortState::Undefined {
            return Err(Error::Exists);
        }
        if !self.device_present() {
            return Err(Error::NoDevice);
        }
        let devtype = DeviceType::from_signature(self.regs.read(reg::SIG));
        if devtype == DeviceType::Unknown {
            klog_debug!(
                self.log,
                SUBSYS,
                "port {}: unknown signature {:#010x}",
                self.index,
                self.regs.read(reg::SIG)
            );
            return Err(Error::NoDevice);
        }
        self.devtype = devtype;
        self.state = PortState::Present;
        klog_info!(self.log, SUBSYS, "port {}: {} device present", self.index, devtype.as_str());
        Ok(())
    }

    /// Allocate command list, received FIS area and command tables for
    /// `slots` command slots and hand them to the controller.
    pub fn initialize_memory(&mut self, dma: &dyn DmaSpace, slots: usize) -> Result<()> {
        if self.state != PortState::Attached {
            klog_error!(
                self.log,
                SUBSYS,
                "port {}: memory setup in state {:?}",
                self.index,
                self.state
            );
            return Err(Error::Io);
        }
        if self.devtype == DeviceType::None {
            return Err(Error::NoDevice);
        }

        let slots = slots.clamp(1, MAX_SLOTS);
        let size = command_memory_size(slots);
        let mem = dma.alloc(size, Direction::Bidirectional)?;
        let base = mem.device_addr();
        if base & 0x3ff != 0 {
            return Err(Error::Invalid);
        }
        if !self.s64a && base + size as u64 > 1 << 32 {
            klog_error!(self.log, SUBSYS, "port {}: command memory above 4G", self.index);
            return Err(Error::NoMemory);
        }

        self.regs.write(reg::IE, 0);
        let fb = base + FIS_RX_OFFSET as u64;
        self.regs.write(reg::CLB, base as u32);
        self.regs.write(reg::CLBU, (base >> 32) as u32);
        self.regs.write(reg::FB, fb as u32);
        self.regs.write(reg::FBU, (fb >> 32) as u32);
        self.regs.set_bits(reg::CMD, PortCmd::FRE.bits());
        self.regs.write(reg::SERR, u32::MAX);

        let active = self.regs.read(reg::CI) | self.regs.read(reg::SACT);
        self.slots = (0..slots)
            .map(|i| CommandSlot::new(i, active & (1 << i) != 0))
            .collect();
        self.mem = Some(mem);
        self.state = PortState::Disabled;
        klog_debug!(
            self.log,
            SUBSYS,
            "port {}: {} command slots at {:#x}",
            self.index,
            slots,
            base
        );
        Ok(())
    }

    /// Queue `tf` on the first free slot and ring the doorbell.
    ///
    /// `NotReady` means the port is recovering or failed, `Busy` that all
    /// slots are occupied. On error the token is dropped and no completion
    /// will follow.
    pub fn send_command(&mut self, tf: &Taskfile, blocks: &[DataBlock], token: T) -> Result<usize> {
        if self.devtype == DeviceType::None {
            return Err(Error::NoDevice);
        }
        if blocks.len() > MAX_PRD_ENTRIES {
            return Err(Error::Invalid);
        }
        // The link drops out while a reset is in progress.
        if self.state != PortState::Ready {
            return Err(Error::NotReady);
        }
        if !self.device_present() {
            return Err(Error::NoDevice);
        }
        let Some(mem) = self.mem.as_mut() else {
            return Err(Error::NotReady);
        };
        let Some(slot) = self.slots.iter_mut().find(|s| !s.is_busy()) else {
            return Err(Error::Busy);
        };

        slot.reserve();
        let base = mem.device_addr();
        if let Err(err) = slot.setup(mem.as_mut_slice(), base, tf, blocks) {
            slot.release();
            return Err(err);
        }
        slot.attach(token);
        let index = slot.index();

        // Command table must be visible before the doorbell.
        fence(Ordering::SeqCst);
        self.regs.write(reg::CI, 1 << index);
        klog_trace!(
            self.log,
            SUBSYS,
            "port {}: slot {} cmd {:#04x} lba {} count {}",
            self.index,
            index,
            tf.command,
            tf.lba,
            tf.count
        );
        Ok(index)
    }

    // ----------------------------------------------------------------------
    // Queued operations
    // ----------------------------------------------------------------------

    /// Stop the DMA engine and FIS receive. Lands on `Attached` from
    /// `Present` and on `Disabled` from `Error`.
    pub fn initialize(&mut self) -> PortStep<T> {
        self.submit(&[Op::Initialize], false)
    }

    /// Start the DMA engine and unmask port interrupts.
    pub fn enable(&mut self) -> PortStep<T> {
        self.submit(&[Op::Enable], false)
    }

    pub fn disable(&mut self) -> PortStep<T> {
        self.submit(&[Op::Disable], false)
    }

    /// Stop the engine, then abort every outstanding slot.
    pub fn abort(&mut self) -> PortStep<T> {
        self.submit(&[Op::Disable, Op::AbortSlots], true)
    }

    /// COMRESET the link and wait for the device to come back.
    pub fn reset(&mut self) -> PortStep<T> {
        self.submit(&[Op::Reset], false)
    }

    /// Re-enter after a scheduled wake.
    pub fn step(&mut self, event: PortEvent) -> PortStep<T> {
        let mut out = PortStep::default();
        let PortEvent::Tick(epoch) = event;
        if epoch != self.epoch {
            return out;
        }
        let Some(mut job) = self.job.take() else {
            return out;
        };

        if job.wait == Wait::ResetSettle || self.probe(job.wait) {
            self.advance(job.wait, &mut out);
        } else if job.budget.consume() {
            self.job = Some(job);
        } else {
            self.timed_out(job.wait, &mut out);
        }
        self.run(&mut out);
        out
    }

    /// Dispatch the port's interrupt status.
    ///
    /// A device topology change aborts and resets the port and is reported
    /// as `Io`.
    pub fn process_interrupts(&mut self) -> (PortStep<T>, Result<()>) {
        let mut out = PortStep::default();
        if self.devtype == DeviceType::None {
            klog_warn!(self.log, SUBSYS, "port {}: interrupt without device", self.index);
            return (out, Err(Error::NoDevice));
        }

        let is = PortIs::from_bits_retain(self.regs.read(reg::IS));
        if is.intersects(PortIs::STATUS) {
            klog_warn!(
                self.log,
                SUBSYS,
                "port {}: device state changed (IS {:#010x}), resetting",
                self.index,
                is.bits()
            );
            self.regs.write(reg::IS, is.bits());
            self.submit_into(&[Op::Disable, Op::AbortSlots, Op::Reset], true, &mut out);
            return (out, Err(Error::Io));
        }

        if is.intersects(PortIs::FATAL | PortIs::ERROR) {
            self.handle_error(is, &mut out);
        } else {
            self.check_pending_commands(&mut out);
        }
        self.regs.write(reg::IS, PortIs::DATA.bits());
        (out, Ok(()))
    }

    fn handle_error(&mut self, is: PortIs, out: &mut PortStep<T>) {
        klog_warn!(
            self.log,
            SUBSYS,
            "port {}: error IS {:#010x} SERR {:#010x} TFD {:#06x}",
            self.index,
            is.bits(),
            self.regs.read(reg::SERR),
            self.regs.read(reg::TFD)
        );
        self.regs.write(reg::IE, 0);

        if self.command_list_disabled() {
            self.abort_slots(out);
        } else {
            let current = PortCmd::current_slot(self.regs.read(reg::CMD));
            self.abort_slot(current, out);
            self.check_pending_commands(out);
        }

        // Clearing ST wipes PxCI, remember what is still outstanding.
        self.reissue = self.regs.read(reg::CI) & self.busy_mask();
        self.state = PortState::Error;
        self.submit_into(
            &[Op::Initialize, Op::ClearErrors, Op::Enable, Op::Reissue],
            true,
            out,
        );
    }

    fn check_pending_commands(&mut self, out: &mut PortStep<T>) {
        let ci = self.regs.read(reg::CI);
        let Some(mem) = self.mem.as_ref() else {
            return;
        };
        for slot in self.slots.iter_mut() {
            if !slot.is_busy() || ci & (1 << slot.index()) != 0 {
                continue;
            }
            let bytes = slot.bytes_transferred(mem.as_slice());
            if let Some(token) = slot.release() {
                out.completions.push(Completion {
                    token,
                    result: Ok(bytes),
                });
            }
        }
    }

    fn abort_slot(&mut self, index: usize, out: &mut PortStep<T>) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if !slot.is_busy() {
            return;
        }
        if let Some(token) = slot.release() {
            out.completions.push(Completion {
                token,
                result: Err(Error::Aborted),
            });
        }
    }

    fn abort_slots(&mut self, out: &mut PortStep<T>) {
        for index in 0..self.slots.len() {
            self.abort_slot(index, out);
        }
    }

    // ----------------------------------------------------------------------
    // Op queue
    // ----------------------------------------------------------------------

    fn submit(&mut self, ops: &[Op], preempt: bool) -> PortStep<T> {
        let mut out = PortStep::default();
        self.submit_into(ops, preempt, &mut out);
        out
    }

    fn submit_into(&mut self, ops: &[Op], preempt: bool, out: &mut PortStep<T>) {
        if preempt {
            if self.job.take().is_some() {
                klog_debug!(self.log, SUBSYS, "port {}: handshake cancelled", self.index);
            }
            self.epoch = self.epoch.wrapping_add(1);
            self.ops.clear();
        }
        let idle = self.job.is_none();
        self.ops.extend(ops.iter().copied());
        if idle {
            self.run(out);
        }
    }

    fn run(&mut self, out: &mut PortStep<T>) {
        while self.job.is_none() {
            let Some(op) = self.ops.pop_front() else {
                out.settled = Some(self.state);
                return;
            };
            self.begin(op, out);
        }
        if let Some(job) = self.job {
            out.wake = Some(Wake {
                after_us: job.budget.interval_us,
                epoch: self.epoch,
            });
        }
    }

    fn begin(&mut self, op: Op, out: &mut PortStep<T>) {
        match op {
            Op::Initialize => {
                self.state = match self.state {
                    PortState::Present => PortState::PresentInit,
                    PortState::Error => PortState::ErrorInit,
                    other => {
                        klog_error!(
                            self.log,
                            SUBSYS,
                            "port {}: initialize in state {:?}",
                            self.index,
                            other
                        );
                        PortState::Fatal
                    }
                };
                if self.state == PortState::Fatal {
                    return;
                }
                self.regs.clear_bits(reg::CMD, PortCmd::ST.bits());
                self.wait_for(Wait::StopEngine, out);
            }
            Op::Enable => {
                if self.state != PortState::Disabled {
                    klog_debug!(
                        self.log,
                        SUBSYS,
                        "port {}: enable skipped in state {:?}",
                        self.index,
                        self.state
                    );
                    return;
                }
                self.state = PortState::Enabling;
                if self.port_idle() {
                    self.start_engine(out);
                } else {
                    self.regs.set_bits(reg::CMD, PortCmd::CLO.bits());
                    self.wait_for(Wait::ClearClo, out);
                }
            }
            Op::Disable => {
                let target = match self.state {
                    PortState::Ready
                    | PortState::Enabling
                    | PortState::Disabling
                    | PortState::Disabled => PortState::Disabled,
                    other => other,
                };
                if self.command_list_disabled() {
                    self.state = target;
                    return;
                }
                self.regs.write(reg::IE, 0);
                self.regs.clear_bits(reg::CMD, PortCmd::ST.bits());
                if target == PortState::Disabled {
                    self.state = PortState::Disabling;
                }
                self.disable_target = target;
                self.wait_for(Wait::StopForDisable, out);
            }
            Op::AbortSlots => self.abort_slots(out),
            Op::Reset => {
                let sctl = self.regs.read(reg::SCTL) & !SSTS_DET_MASK;
                self.regs.write(reg::SCTL, sctl | SCTL_DET_RESET);
                self.job = Some(Job {
                    wait: Wait::ResetSettle,
                    budget: PollBudget::new(1, self.cfg.reset_settle_us),
                });
            }
            Op::ClearErrors => {
                self.regs.write(reg::SERR, u32::MAX);
                self.regs.write(reg::IS, (PortIs::FATAL | PortIs::ERROR).bits());
            }
            Op::Reissue => {
                let mask = core::mem::take(&mut self.reissue) & self.busy_mask();
                if mask == 0 {
                    return;
                }
                if self.state == PortState::Ready {
                    klog_debug!(self.log, SUBSYS, "port {}: reissue {:#010x}", self.index, mask);
                    fence(Ordering::SeqCst);
                    self.regs.write(reg::CI, mask);
                } else {
                    self.abort_slots(out);
                }
            }
        }
    }

    fn start_engine(&mut self, out: &mut PortStep<T>) {
        self.regs.set_bits(reg::CMD, PortCmd::ST.bits());
        self.wait_for(Wait::StartEngine, out);
    }

    fn wait_for(&mut self, wait: Wait, out: &mut PortStep<T>) {
        if self.probe(wait) {
            self.advance(wait, out);
        } else {
            self.job = Some(Job {
                wait,
                budget: self.cfg.handshake,
            });
        }
    }

    fn probe(&self, wait: Wait) -> bool {
        match wait {
            Wait::StopEngine | Wait::StopForDisable => self.command_list_disabled(),
            Wait::StopFis => self.fis_receive_disabled(),
            Wait::ClearClo => !self.cmd().contains(PortCmd::CLO),
            Wait::StartEngine => self.cmd().contains(PortCmd::CR),
            Wait::ResetSettle => false,
            Wait::ResetPresence => self.device_present(),
            Wait::ResetIdle => self.port_idle(),
        }
    }

    fn advance(&mut self, wait: Wait, out: &mut PortStep<T>) {
        match wait {
            Wait::StopEngine => {
                self.regs.clear_bits(reg::CMD, PortCmd::FRE.bits());
                self.wait_for(Wait::StopFis, out);
            }
            Wait::StopFis => {
                self.state = if self.state == PortState::PresentInit {
                    PortState::Attached
                } else {
                    PortState::Disabled
                };
                klog_debug!(self.log, SUBSYS, "port {}: initialized", self.index);
            }
            Wait::ClearClo => self.start_engine(out),
            Wait::StartEngine => {
                self.regs.write(reg::IE, PortIs::NONFATAL.bits());
                self.state = PortState::Ready;
                klog_info!(self.log, SUBSYS, "port {}: ready", self.index);
            }
            Wait::StopForDisable => self.state = self.disable_target,
            Wait::ResetSettle => {
                let sctl = self.regs.read(reg::SCTL) & !SSTS_DET_MASK;
                self.regs.write(reg::SCTL, sctl);
                self.wait_for(Wait::ResetPresence, out);
            }
            Wait::ResetPresence => self.wait_for(Wait::ResetIdle, out),
            Wait::ResetIdle => {
                self.regs.write(reg::SERR, u32::MAX);
                self.regs.write(reg::IS, u32::MAX);
                klog_info!(self.log, SUBSYS, "port {}: reset complete", self.index);
            }
        }
    }

    fn timed_out(&mut self, wait: Wait, out: &mut PortStep<T>) {
        match wait {
            Wait::StopEngine | Wait::StopFis | Wait::StopForDisable => {
                klog_error!(
                    self.log,
                    SUBSYS,
                    "port {}: {:?} timed out (CMD {:#010x}), port disabled for good",
                    self.index,
                    wait,
                    self.regs.read(reg::CMD)
                );
                self.state = PortState::Fatal;
            }
            Wait::ClearClo | Wait::StartEngine => {
                klog_error!(
                    self.log,
                    SUBSYS,
                    "port {}: DMA engine did not start (CMD {:#010x} TFD {:#06x})",
                    self.index,
                    self.regs.read(reg::CMD),
                    self.regs.read(reg::TFD)
                );
                self.state = PortState::Error;
                self.ops.push_front(Op::Disable);
            }
            Wait::ResetPresence => {
                klog_warn!(self.log, SUBSYS, "port {}: no device after reset", self.index);
            }
            Wait::ResetIdle => {
                klog_warn!(self.log, SUBSYS, "port {}: device busy after reset", self.index);
            }
            Wait::ResetSettle => self.advance(wait, out),
        }
    }
}
