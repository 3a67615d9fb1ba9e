//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Driver context: controllers, logical devices and client interfaces.
//!
//! Everything runs on the server thread. Interrupts and timers enter
//! through [`Driver::handle_irq`] and the [`Errands`] queue; port state
//! machines hand their results back as [`PortStep`]s which are routed
//! here by command token.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use kernel_log::{klog_debug, klog_error, klog_info, klog_warn, Logger};

use crate::config::{Config, StaticClient};
use crate::device::{
    identify_taskfile, inout_data, Device, DeviceId, DeviceInfo, DeviceKind, Devices,
    DiskLocation, IDENTIFY_SIZE,
};
use crate::errand::Errands;
use crate::error::{Error, Result};
use crate::gpt::{PartitionInfo, PartitionReader};
use crate::hba::Hba;
use crate::hw::{
    enable_bus_master, is_ahci_controller, Direction, DmaMemory, DmaSpace, IrqLine, PciFunction,
    Registers,
};
use crate::port::{Completion, PortEvent, PortState, PortStep};
use crate::regs::DeviceType;
use crate::slot::{CommandFlags, DataBlock, Taskfile, MAX_PRD_BYTES, MAX_PRD_ENTRIES};
use crate::virtio::{BlockGeometry, BlockTarget, RequestId, VirtioBlock};

const SUBSYS: &str = "ahci";

/// Largest number of dataspaces one client may register.
pub const MAX_NUM_DS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Header,
    Array,
}

/// Who is waiting on a command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoToken {
    Identify { hba: usize, port: usize },
    PartitionTable { disk: DeviceId, phase: ScanPhase },
    Client { iface: usize, device: DeviceId, req: RequestId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Identifying,
    Online,
    Failed,
}

struct Scan {
    reader: PartitionReader,
    scratch: Option<Box<dyn DmaMemory>>,
}

pub struct Interface {
    device: DeviceId,
    bridge: VirtioBlock,
    released: bool,
}

impl Interface {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn bridge(&self) -> &VirtioBlock {
        &self.bridge
    }
}

/// Routes bridge requests of one interface to its device.
struct DeviceTarget<'a, R> {
    devices: &'a mut Devices,
    hbas: &'a mut [Hba<R, IoToken>],
    device: DeviceId,
    iface: usize,
}

impl<R: Registers + Clone> BlockTarget for DeviceTarget<'_, R> {
    fn inout_data(
        &mut self,
        sector: u64,
        blocks: &[DataBlock],
        flags: CommandFlags,
        req: RequestId,
    ) -> Result<()> {
        let token = IoToken::Client {
            iface: self.iface,
            device: self.device,
            req,
        };
        inout_data(self.devices, self.hbas, self.device, sector, blocks, flags, token).map(|_| ())
    }
}

/// Split `len` bytes at `addr` into PRD-sized blocks.
fn dma_blocks(addr: u64, len: usize) -> Vec<DataBlock> {
    let mut blocks = Vec::new();
    let mut done = 0usize;
    while done < len {
        let size = (len - done).min(MAX_PRD_BYTES as usize);
        blocks.push(DataBlock::new(addr + done as u64, size as u32));
        done += size;
    }
    blocks
}

pub struct Driver<R> {
    cfg: Config,
    dma: Rc<dyn DmaSpace>,
    hbas: Vec<Hba<R, IoToken>>,
    devices: Devices,
    phases: BTreeMap<(usize, usize), Phase>,
    identify: BTreeMap<(usize, usize), Box<dyn DmaMemory>>,
    scans: BTreeMap<DeviceId, Scan>,
    interfaces: Vec<Option<Interface>>,
    waiting_clients: Vec<StaticClient>,
    static_interfaces: Vec<(String, usize)>,
    log: Logger,
}

impl<R: Registers + Clone + 'static> Driver<R> {
    pub fn new(cfg: Config, dma: Rc<dyn DmaSpace>, log: Logger) -> Self {
        log.set_level(cfg.log_level);
        let waiting_clients = cfg.clients.clone();
        Self {
            cfg,
            dma,
            hbas: Vec::new(),
            devices: Devices::new(),
            phases: BTreeMap::new(),
            identify: BTreeMap::new(),
            scans: BTreeMap::new(),
            interfaces: Vec::new(),
            waiting_clients,
            static_interfaces: Vec::new(),
            log,
        }
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.log
    }

    #[must_use]
    pub fn hba(&self, index: usize) -> Option<&Hba<R, IoToken>> {
        self.hbas.get(index)
    }

    #[must_use]
    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Device whose hid is `name`: a disk serial number or a partition GUID.
    #[must_use]
    pub fn find_device(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, d)| d.hid().eq_ignore_ascii_case(name))
            .map(|(id, _)| id)
    }

    /// Ports are still being brought up or disks scanned.
    #[must_use]
    pub fn scans_running(&self) -> bool {
        !self.scans.is_empty()
            || self
                .phases
                .values()
                .any(|p| matches!(p, Phase::Starting | Phase::Identifying))
    }

    #[must_use]
    pub fn interface(&self, iface: usize) -> Option<&Interface> {
        self.interfaces
            .get(iface)
            .and_then(Option::as_ref)
            .filter(|i| !i.released)
    }

    /// Bridge of a live interface, for client setup.
    pub fn bridge_mut(&mut self, iface: usize) -> Option<&mut VirtioBlock> {
        self.interfaces
            .get_mut(iface)
            .and_then(Option::as_mut)
            .filter(|i| !i.released)
            .map(|i| &mut i.bridge)
    }

    /// Interfaces created for configured static clients, by capability.
    #[must_use]
    pub fn static_interfaces(&self) -> &[(String, usize)] {
        &self.static_interfaces
    }

    // ----------------------------------------------------------------------
    // Controller discovery
    // ----------------------------------------------------------------------

    /// Take over a PCI function if it is an AHCI controller.
    pub fn probe_pci(&mut self, pci: &dyn PciFunction, regs: R, e: &mut Errands<Self>) -> Result<usize> {
        if !is_ahci_controller(pci)? {
            return Err(Error::NoDevice);
        }
        enable_bus_master(pci)?;
        self.add_hba(regs, e)
    }

    /// Register a controller and start bringing up its ports.
    pub fn add_hba(&mut self, regs: R, e: &mut Errands<Self>) -> Result<usize> {
        let hba = Hba::new(regs, &self.cfg.hba_config(), self.log.clone())?;
        let index = self.hbas.len();
        let ports = hba.attached_ports();
        hba.enable_interrupts();
        self.hbas.push(hba);

        for port in ports {
            self.phases.insert((index, port), Phase::Starting);
            let Some(p) = self.hbas[index].port_mut(port) else {
                continue;
            };
            let step = p.initialize();
            self.apply_step(index, port, step, e);
        }
        Ok(index)
    }

    /// Interrupt of controller `hba`. The line is unmasked again once the
    /// ports are serviced.
    pub fn handle_irq(&mut self, hba: usize, line: &dyn IrqLine, e: &mut Errands<Self>) {
        let Some(h) = self.hbas.get_mut(hba) else {
            return;
        };
        for irq in h.handle_irq() {
            if let Err(err) = irq.status {
                klog_warn!(self.log, SUBSYS, "hba {} port {}: {}", hba, irq.port, err);
            }
            self.apply_step(hba, irq.port, irq.step, e);
        }
        if line.level_triggered() {
            line.unmask();
        }
    }

    // ----------------------------------------------------------------------
    // Port steps
    // ----------------------------------------------------------------------

    fn port_tick(&mut self, hba: usize, port: usize, epoch: u32, e: &mut Errands<Self>) {
        let Some(p) = self.hbas.get_mut(hba).and_then(|h| h.port_mut(port)) else {
            return;
        };
        let step = p.step(PortEvent::Tick(epoch));
        self.apply_step(hba, port, step, e);
    }

    fn apply_step(&mut self, hba: usize, port: usize, step: PortStep<IoToken>, e: &mut Errands<Self>) {
        let freed = !step.completions.is_empty();
        for completion in step.completions {
            self.complete(completion, e);
        }
        if let Some(wake) = step.wake {
            e.schedule(wake.after_us, move |drv: &mut Self, e| {
                drv.port_tick(hba, port, wake.epoch, e);
            });
        }
        if let Some(state) = step.settled {
            self.port_settled(hba, port, state, e);
        }
        if freed {
            self.slot_freed(hba, port);
        }
    }

    fn port_settled(&mut self, hba: usize, port: usize, state: PortState, e: &mut Errands<Self>) {
        let phase = self.phases.get(&(hba, port)).copied();
        match state {
            PortState::Attached => self.setup_port(hba, port, e),
            PortState::Ready => match phase {
                Some(Phase::Starting) => self.identify_device(hba, port, e),
                _ => self.slot_freed(hba, port),
            },
            PortState::Disabled if phase == Some(Phase::Online) => {
                // Back from a link reset.
                let Some(p) = self.hbas.get_mut(hba).and_then(|h| h.port_mut(port)) else {
                    return;
                };
                if !p.device_present() {
                    klog_warn!(self.log, SUBSYS, "hba {} port {}: device gone", hba, port);
                    return;
                }
                let step = p.enable();
                self.apply_step(hba, port, step, e);
            }
            PortState::Error | PortState::Fatal => {
                klog_error!(
                    self.log,
                    SUBSYS,
                    "hba {} port {}: settled in {:?}",
                    hba,
                    port,
                    state
                );
                if matches!(phase, Some(Phase::Starting)) {
                    self.bringup_failed(hba, port, "port start");
                }
            }
            _ => {}
        }
    }

    fn setup_port(&mut self, hba: usize, port: usize, e: &mut Errands<Self>) {
        let Some(h) = self.hbas.get_mut(hba) else {
            return;
        };
        let slots = h.command_slots();
        let Some(p) = h.port_mut(port) else {
            return;
        };
        if let Err(err) = p.initialize_memory(&*self.dma, slots) {
            klog_error!(self.log, SUBSYS, "hba {} port {}: no command memory: {}", hba, port, err);
            self.bringup_failed(hba, port, "command memory");
            return;
        }
        let step = p.enable();
        self.apply_step(hba, port, step, e);
    }

    fn bringup_failed(&mut self, hba: usize, port: usize, what: &str) {
        klog_warn!(self.log, SUBSYS, "hba {} port {}: {} failed", hba, port, what);
        self.phases.insert((hba, port), Phase::Failed);
        self.identify.remove(&(hba, port));
    }

    /// Retry waiting client requests of every interface living on the port.
    fn slot_freed(&mut self, hba: usize, port: usize) {
        let here = DiskLocation { hba, port };
        for index in 0..self.interfaces.len() {
            let on_port = self.interfaces[index]
                .as_ref()
                .is_some_and(|i| !i.released && self.devices.location(i.device) == Some(here));
            if on_port {
                self.kick_interface(index);
            }
        }
    }

    // ----------------------------------------------------------------------
    // Completions
    // ----------------------------------------------------------------------

    fn complete(&mut self, completion: Completion<IoToken>, e: &mut Errands<Self>) {
        match completion.token {
            IoToken::Identify { hba, port } => self.identify_done(hba, port, completion.result, e),
            IoToken::PartitionTable { disk, phase } => {
                self.scan_step(disk, phase, completion.result, e);
            }
            IoToken::Client { iface, device, req } => {
                self.devices.retire(device);
                let Some(slot) = self.interfaces.get_mut(iface) else {
                    return;
                };
                let Some(intf) = slot.as_mut() else {
                    return;
                };
                intf.bridge.task_finished(req, completion.result);
                if intf.released && intf.bridge.in_flight_len() == 0 {
                    *slot = None;
                }
            }
        }
    }

    // ----------------------------------------------------------------------
    // Bring-up I/O
    // ----------------------------------------------------------------------

    /// Issue a bring-up command, retrying while the port has no room.
    /// A hard failure or a spent budget calls `failed`.
    fn issue<F>(
        &mut self,
        e: &mut Errands<Self>,
        token: IoToken,
        send: F,
        what: &'static str,
        failed: fn(&mut Self, IoToken),
    ) where
        F: Fn(&mut Self, IoToken) -> Result<usize> + 'static,
    {
        let budget = self.cfg.io_poll;
        e.poll(
            self,
            budget,
            move |drv, _| match send(drv, token) {
                Ok(slot) => {
                    klog_debug!(drv.log, SUBSYS, "{} on slot {}", what, slot);
                    true
                }
                Err(Error::Busy | Error::Again | Error::NotReady) => false,
                Err(err) => {
                    klog_warn!(drv.log, SUBSYS, "{} not issued: {}", what, err);
                    failed(drv, token);
                    true
                }
            },
            move |drv, _, ok| {
                if !ok {
                    klog_warn!(drv.log, SUBSYS, "{}: port never accepted the command", what);
                    failed(drv, token);
                }
            },
        );
    }

    fn send_raw(&mut self, hba: usize, port: usize, tf: &Taskfile, blocks: &[DataBlock], token: IoToken) -> Result<usize> {
        let p = self
            .hbas
            .get_mut(hba)
            .and_then(|h| h.port_mut(port))
            .ok_or(Error::NoDevice)?;
        p.send_command(tf, blocks, token)
    }

    fn identify_device(&mut self, hba: usize, port: usize, e: &mut Errands<Self>) {
        let devtype = self
            .hbas
            .get(hba)
            .and_then(|h| h.port(port))
            .map_or(DeviceType::None, |p| p.device_type());
        if devtype != DeviceType::Ata {
            klog_info!(
                self.log,
                SUBSYS,
                "hba {} port {}: {} device not handled",
                hba,
                port,
                devtype.as_str()
            );
            self.phases.insert((hba, port), Phase::Failed);
            return;
        }

        let mem = match self.dma.alloc(IDENTIFY_SIZE, Direction::FromDevice) {
            Ok(mem) => mem,
            Err(err) => {
                klog_error!(self.log, SUBSYS, "identify buffer: {}", err);
                self.bringup_failed(hba, port, "identify");
                return;
            }
        };
        let blocks = [DataBlock::new(mem.device_addr(), IDENTIFY_SIZE as u32)];
        self.identify.insert((hba, port), mem);
        self.phases.insert((hba, port), Phase::Identifying);

        self.issue(
            e,
            IoToken::Identify { hba, port },
            move |drv, token| drv.send_raw(hba, port, &identify_taskfile(), &blocks, token),
            "IDENTIFY",
            |drv, token| {
                if let IoToken::Identify { hba, port } = token {
                    drv.bringup_failed(hba, port, "IDENTIFY");
                }
            },
        );
    }

    fn identify_done(&mut self, hba: usize, port: usize, result: Result<usize>, e: &mut Errands<Self>) {
        let Some(mem) = self.identify.remove(&(hba, port)) else {
            return;
        };
        if let Err(err) = result {
            klog_warn!(self.log, SUBSYS, "hba {} port {}: IDENTIFY: {}", hba, port, err);
            self.bringup_failed(hba, port, "IDENTIFY");
            return;
        }
        let s64a = self
            .hbas
            .get(hba)
            .and_then(|h| h.port(port))
            .is_some_and(|p| p.supports_64bit());
        let info = match DeviceInfo::from_identify(mem.as_slice(), s64a) {
            Ok(info) => info,
            Err(err) => {
                klog_warn!(self.log, SUBSYS, "hba {} port {}: bad IDENTIFY data: {}", hba, port, err);
                self.bringup_failed(hba, port, "IDENTIFY");
                return;
            }
        };
        drop(mem);

        klog_info!(
            self.log,
            SUBSYS,
            "hba {} port {}: {} ({}) {} sectors of {} bytes, LBA48 {}",
            hba,
            port,
            info.model,
            info.hid,
            info.num_sectors,
            info.sector_size,
            info.features.contains(crate::device::DeviceFeatures::LBA48)
        );
        let disk = self.devices.insert(Device::disk(DiskLocation { hba, port }, info));
        self.phases.insert((hba, port), Phase::Online);
        self.scan_partitions(disk, e);
    }

    // ----------------------------------------------------------------------
    // Partition scan
    // ----------------------------------------------------------------------

    fn scan_partitions(&mut self, disk: DeviceId, e: &mut Errands<Self>) {
        let Some(device) = self.devices.get(disk) else {
            return;
        };
        let reader = PartitionReader::new(device.info.sector_size, self.cfg.verify_gpt_crc);
        let len = reader.header_read_len();
        self.scans.insert(
            disk,
            Scan {
                reader,
                scratch: None,
            },
        );
        self.scan_read(disk, 0, len, ScanPhase::Header, e);
    }

    fn scan_read(&mut self, disk: DeviceId, lba: u64, len: usize, phase: ScanPhase, e: &mut Errands<Self>) {
        if len > MAX_PRD_ENTRIES * MAX_PRD_BYTES as usize {
            klog_warn!(self.log, "gpt", "disk {}: partition array of {} bytes too large", disk, len);
            self.scan_finished(disk, Vec::new());
            return;
        }
        let mem = match self.dma.alloc(len, Direction::FromDevice) {
            Ok(mem) => mem,
            Err(err) => {
                klog_error!(self.log, "gpt", "disk {}: scratch buffer: {}", disk, err);
                self.scan_finished(disk, Vec::new());
                return;
            }
        };
        let blocks = dma_blocks(mem.device_addr(), len);
        let Some(scan) = self.scans.get_mut(&disk) else {
            return;
        };
        scan.scratch = Some(mem);

        self.issue(
            e,
            IoToken::PartitionTable { disk, phase },
            move |drv, token| {
                inout_data(
                    &mut drv.devices,
                    &mut drv.hbas,
                    disk,
                    lba,
                    &blocks,
                    CommandFlags::empty(),
                    token,
                )
            },
            "partition table read",
            |drv, token| {
                if let IoToken::PartitionTable { disk, .. } = token {
                    drv.scan_finished(disk, Vec::new());
                }
            },
        );
    }

    fn scan_step(&mut self, disk: DeviceId, phase: ScanPhase, result: Result<usize>, e: &mut Errands<Self>) {
        let Some(scan) = self.scans.get_mut(&disk) else {
            return;
        };
        // Scratch memory lives for exactly one phase.
        let Some(mem) = scan.scratch.take() else {
            return;
        };
        if let Err(err) = result {
            klog_warn!(self.log, "gpt", "disk {}: read failed: {}", disk, err);
            self.scan_finished(disk, Vec::new());
            return;
        }

        match phase {
            ScanPhase::Header => match scan.reader.read_header(mem.as_slice()) {
                Ok(None) => {
                    klog_info!(self.log, "gpt", "disk {}: no partition table", disk);
                    self.scan_finished(disk, Vec::new());
                }
                Ok(Some(read)) => {
                    drop(mem);
                    let sector_size = self.devices.get(disk).map_or(0, |d| d.info.sector_size);
                    let len = usize::try_from(read.sectors)
                        .ok()
                        .and_then(|s| s.checked_mul(sector_size))
                        .unwrap_or(usize::MAX);
                    self.scan_read(disk, read.lba, len, ScanPhase::Array, e);
                }
                Err(err) => {
                    klog_warn!(self.log, "gpt", "disk {}: invalid GPT header ({})", disk, err);
                    self.scan_finished(disk, Vec::new());
                }
            },
            ScanPhase::Array => {
                let parts = match scan.reader.read_array(mem.as_slice()) {
                    Ok(parts) => parts,
                    Err(err) => {
                        klog_warn!(self.log, "gpt", "disk {}: partition array rejected ({})", disk, err);
                        Vec::new()
                    }
                };
                drop(mem);
                self.scan_finished(disk, parts);
            }
        }
    }

    fn scan_finished(&mut self, disk: DeviceId, parts: Vec<PartitionInfo>) {
        if self.scans.remove(&disk).is_none() {
            return;
        }
        let Some(parent) = self.devices.get(disk).map(|d| d.info.clone()) else {
            return;
        };
        for part in &parts {
            match Device::partition(disk, &parent, part) {
                Ok(mut device) => {
                    device.set_max_in_flight(self.cfg.max_in_flight);
                    let id = self.devices.insert(device);
                    klog_info!(
                        self.log,
                        "gpt",
                        "disk {}: partition {} {} sectors {}..={} as device {}",
                        disk,
                        part.guid,
                        part.name,
                        part.first,
                        part.last,
                        id
                    );
                }
                Err(err) => {
                    klog_warn!(self.log, "gpt", "disk {}: partition {} skipped: {}", disk, part.guid, err);
                }
            }
        }
        self.connect_static_clients();
    }

    fn connect_static_clients(&mut self) {
        let waiting = core::mem::take(&mut self.waiting_clients);
        for client in waiting {
            if self.find_device(&client.device).is_none() {
                self.waiting_clients.push(client);
                continue;
            }
            match self.create_interface_for(&client.device, client.num_ds as usize) {
                Ok(iface) => {
                    klog_info!(
                        self.log,
                        SUBSYS,
                        "static client {} on {} as interface {}",
                        client.capability,
                        client.device,
                        iface
                    );
                    self.static_interfaces.push((client.capability, iface));
                }
                Err(err) => {
                    klog_warn!(self.log, SUBSYS, "static client {}: {}", client.capability, err);
                }
            }
        }
    }

    // ----------------------------------------------------------------------
    // Client interfaces
    // ----------------------------------------------------------------------

    fn in_use(&self, device: DeviceId) -> bool {
        self.interfaces
            .iter()
            .flatten()
            .any(|i| !i.released && i.device == device)
    }

    /// Open a virtio block interface on the disk or partition called
    /// `name`. A disk and its partitions are used exclusively.
    pub fn create_interface_for(&mut self, name: &str, num_ds: usize) -> Result<usize> {
        if !(1..=MAX_NUM_DS).contains(&num_ds) {
            return Err(Error::Invalid);
        }
        let Some(id) = self.find_device(name) else {
            return Err(if self.scans_running() {
                Error::Again
            } else {
                Error::NoDevice
            });
        };
        let device = self.devices.get(id).ok_or(Error::NoDevice)?;
        let conflict = self.in_use(id)
            || match device.kind {
                DeviceKind::Disk(_) => self.devices.children(id).into_iter().any(|c| self.in_use(c)),
                DeviceKind::Partition(ref w) => self.in_use(w.parent),
            };
        if conflict {
            return Err(Error::Busy);
        }

        let geometry = BlockGeometry {
            sector_size: device.info.sector_size,
            num_sectors: device.info.num_sectors,
            read_only: device.info.read_only(),
        };
        let interface = Interface {
            device: id,
            bridge: VirtioBlock::new(geometry, num_ds, Rc::clone(&self.dma), self.log.clone()),
            released: false,
        };
        let index = match self.interfaces.iter().position(Option::is_none) {
            Some(free) => {
                self.interfaces[free] = Some(interface);
                free
            }
            None => {
                self.interfaces.push(Some(interface));
                self.interfaces.len() - 1
            }
        };
        klog_info!(self.log, SUBSYS, "interface {} on {} ({})", index, name, id);
        Ok(index)
    }

    /// Tear an interface down. Waiting requests are answered with IOERR;
    /// the slot is reused once the hardware returned every in-flight one.
    pub fn release_interface(&mut self, iface: usize) -> Result<()> {
        let slot = self.interfaces.get_mut(iface).ok_or(Error::NoDevice)?;
        let intf = slot.as_mut().filter(|i| !i.released).ok_or(Error::NoDevice)?;
        intf.bridge.reset();
        intf.released = true;
        if intf.bridge.in_flight_len() == 0 {
            *slot = None;
        }
        klog_info!(self.log, SUBSYS, "interface {} released", iface);
        Ok(())
    }

    /// Client notification on interface `iface`.
    pub fn kick(&mut self, iface: usize) -> Result<()> {
        if self.interface(iface).is_none() {
            return Err(Error::NoDevice);
        }
        self.kick_interface(iface);
        Ok(())
    }

    fn kick_interface(&mut self, iface: usize) {
        let Some(intf) = self.interfaces.get_mut(iface).and_then(Option::as_mut) else {
            return;
        };
        let mut target = DeviceTarget {
            devices: &mut self.devices,
            hbas: self.hbas.as_mut_slice(),
            device: intf.device,
            iface,
        };
        intf.bridge.kick(&mut target);
    }
}
