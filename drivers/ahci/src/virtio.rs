//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Virtio block front end of one logical device.
//!
//! Requests come off a single split virtqueue, have their data segments
//! mapped into the controller's DMA space and go to a [`BlockTarget`].
//! When the target has no room the request waits in a FIFO; waiting
//! requests always go before anything new from the ring.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;

use kernel_log::{klog_debug, klog_error, klog_info, klog_warn, Logger};

use crate::error::{Error, Result};
use crate::hw::{ClientMemory, Direction, DmaMapping, DmaSpace, Doorbell, DsId};
use crate::slot::{CommandFlags, DataBlock, MAX_PRD_BYTES, MAX_PRD_ENTRIES};
use crate::virtqueue::{ClientRegions, Descriptor, QueueLayout, Virtqueue};

const SUBSYS: &str = "virtio-blk";

pub const VIRTIO_ID_BLOCK: u32 = 2;
pub const VIRTIO_VENDOR_ID: u32 = 0x44;
pub const QUEUE_SIZE: u16 = 0x100;
pub const SEG_MAX: u32 = MAX_PRD_ENTRIES as u32;
pub const SIZE_MAX: u32 = MAX_PRD_BYTES;
/// type (u32), ioprio (u32), sector (u64)
pub const HEADER_SIZE: u32 = 16;
const VIRTIO_SECTOR_SIZE: u64 = 512;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Device feature bits.
pub mod feature {
    pub const SIZE_MAX: u64 = 1 << 1;
    pub const SEG_MAX: u64 = 1 << 2;
    pub const GEOMETRY: u64 = 1 << 4;
    pub const RO: u64 = 1 << 5;
    pub const BLK_SIZE: u64 = 1 << 6;
    pub const TOPOLOGY: u64 = 1 << 10;
    pub const RING_INDIRECT_DESC: u64 = 1 << 28;
}

/// Identifies a request between submission and [`VirtioBlock::task_finished`].
pub type RequestId = u32;

/// Where requests end up. Completion is reported asynchronously through
/// [`VirtioBlock::task_finished`] with the same `req`.
pub trait BlockTarget {
    /// `Busy` and `Again` park the request in the pending queue.
    fn inout_data(
        &mut self,
        sector: u64,
        blocks: &[DataBlock],
        flags: CommandFlags,
        req: RequestId,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub sector_size: usize,
    pub num_sectors: u64,
    pub read_only: bool,
}

/// Virtio block configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioConfig {
    /// In 512-byte sectors.
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub blk_size: u32,
    pub read_only: bool,
}

impl VirtioConfig {
    #[must_use]
    pub fn for_geometry(geometry: &BlockGeometry) -> Self {
        Self {
            capacity: geometry
                .num_sectors
                .saturating_mul((geometry.sector_size as u64 / VIRTIO_SECTOR_SIZE).max(1)),
            size_max: SIZE_MAX,
            seg_max: SEG_MAX,
            blk_size: geometry.sector_size as u32,
            read_only: geometry.read_only,
        }
    }

    #[must_use]
    pub fn features(&self) -> u64 {
        let mut features = feature::SIZE_MAX
            | feature::SEG_MAX
            | feature::GEOMETRY
            | feature::BLK_SIZE
            | feature::TOPOLOGY
            | feature::RING_INDIRECT_DESC;
        if self.read_only {
            features |= feature::RO;
        }
        features
    }

    fn bytes(&self) -> [u8; 32] {
        let mut raw = [0u8; 32];
        raw[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        raw[8..12].copy_from_slice(&self.size_max.to_le_bytes());
        raw[12..16].copy_from_slice(&self.seg_max.to_le_bytes());
        // Geometry (16..20) and topology (24..32) stay zero.
        raw[20..24].copy_from_slice(&self.blk_size.to_le_bytes());
        raw
    }

    /// Read `width` bytes (1, 2, 4 or 8) of configuration space.
    pub fn read(&self, offset: usize, width: usize) -> Result<u64> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(Error::Invalid);
        }
        let raw = self.bytes();
        let bytes = raw.get(offset..offset + width).ok_or(Error::Invalid)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| acc << 8 | u64::from(b)))
    }
}

struct Request {
    id: RequestId,
    head: u16,
    kind: u32,
    /// Already in device sectors.
    sector: u64,
    status_addr: u64,
    blocks: Vec<DataBlock>,
    mappings: Vec<DmaMapping>,
    /// Answer without touching the target.
    early: Option<u8>,
    /// Left behind by a reset; its completion is swallowed.
    orphan: bool,
}

impl Request {
    fn mapped_bytes(&self) -> u32 {
        self.mappings.iter().map(|m| m.len() as u32).sum()
    }

    fn flags(&self) -> CommandFlags {
        if self.kind == VIRTIO_BLK_T_OUT {
            CommandFlags::WRITE
        } else {
            CommandFlags::empty()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Started,
    Queued,
    Finished,
}

struct Segment {
    ds: DsId,
    offset: u64,
    len: u32,
}

pub struct VirtioBlock {
    geometry: BlockGeometry,
    config: VirtioConfig,
    dma: Rc<dyn DmaSpace>,
    regions: ClientRegions,
    queue: Option<Virtqueue>,
    doorbell: Option<Rc<dyn Doorbell>>,
    pending: VecDeque<Request>,
    in_flight: BTreeMap<RequestId, Request>,
    next_id: RequestId,
    failed: bool,
    notify: bool,
    log: Logger,
}

impl VirtioBlock {
    pub fn new(geometry: BlockGeometry, num_ds: usize, dma: Rc<dyn DmaSpace>, log: Logger) -> Self {
        Self {
            geometry,
            config: VirtioConfig::for_geometry(&geometry),
            dma,
            regions: ClientRegions::new(num_ds),
            queue: None,
            doorbell: None,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_id: 0,
            failed: false,
            notify: false,
            log,
        }
    }

    #[must_use]
    pub fn config(&self) -> &VirtioConfig {
        &self.config
    }

    #[must_use]
    pub fn device_features(&self) -> u64 {
        self.config.features()
    }

    pub fn register_region(&mut self, ds: DsId, base: u64, mem: Rc<dyn ClientMemory>) -> Result<()> {
        self.regions.add(ds, base, mem)
    }

    pub fn set_doorbell(&mut self, doorbell: Rc<dyn Doorbell>) {
        self.doorbell = Some(doorbell);
    }

    pub fn setup_queue(&mut self, layout: QueueLayout) -> Result<()> {
        // The rings must live in registered memory.
        let num = u64::from(layout.num);
        self.regions.resolve(layout.desc, num * 16)?;
        self.regions.resolve(layout.avail, 4 + 2 * num)?;
        self.regions.resolve(layout.used, 4 + 8 * num)?;
        self.queue = Some(Virtqueue::new(layout, QUEUE_SIZE)?);
        Ok(())
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub fn queue_ready(&self) -> bool {
        self.queue.is_some()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Process the ring: waiting requests first, then new ones until the
    /// ring is empty or the target pushes back.
    pub fn kick(&mut self, target: &mut dyn BlockTarget) {
        if self.failed || self.queue.is_none() {
            return;
        }
        if self.check_pending(target) {
            loop {
                let head = match self.next_head() {
                    Ok(Some(head)) => head,
                    Ok(None) => break,
                    Err(err) => {
                        self.fail("unreadable available ring", err);
                        break;
                    }
                };
                let req = match self.process_request(head) {
                    Ok(req) => req,
                    Err(err) => {
                        self.fail("malformed descriptor chain", err);
                        break;
                    }
                };
                if self.submit(req, target) == Admission::Queued || self.failed {
                    break;
                }
            }
        }
        self.flush_notify();
    }

    /// Completion of request `id` from the target.
    pub fn task_finished(&mut self, id: RequestId, result: Result<usize>) {
        let Some(req) = self.in_flight.remove(&id) else {
            klog_warn!(self.log, SUBSYS, "completion for unknown request {}", id);
            return;
        };
        if req.orphan {
            return;
        }
        let status = match result {
            Ok(_) => VIRTIO_BLK_S_OK,
            Err(err) => {
                klog_debug!(self.log, SUBSYS, "request {} failed: {}", id, err);
                VIRTIO_BLK_S_IOERR
            }
        };
        self.finish(req, status);
        self.flush_notify();
    }

    /// Retry waiting requests in order. Returns true once the queue drained.
    pub fn check_pending(&mut self, target: &mut dyn BlockTarget) -> bool {
        while let Some(req) = self.pending.pop_front() {
            match target.inout_data(req.sector, &req.blocks, req.flags(), req.id) {
                Ok(()) => {
                    self.in_flight.insert(req.id, req);
                }
                Err(err) if err.is_transient() => {
                    self.pending.push_front(req);
                    return false;
                }
                Err(err) => self.rejected(req, err),
            }
        }
        true
    }

    /// Answer everything still waiting with IOERR, forget in-flight work
    /// and drop the queue until the client sets it up again.
    pub fn reset(&mut self) {
        while let Some(req) = self.pending.pop_front() {
            self.finish(req, VIRTIO_BLK_S_IOERR);
        }
        for req in self.in_flight.values_mut() {
            req.orphan = true;
        }
        self.flush_notify();
        self.queue = None;
        self.failed = false;
        klog_info!(self.log, SUBSYS, "device reset");
    }

    fn next_head(&mut self) -> Result<Option<u16>> {
        let Some(queue) = self.queue.as_mut() else {
            return Ok(None);
        };
        queue.pop_avail(&self.regions)
    }

    fn fail(&mut self, what: &str, err: Error) {
        klog_error!(self.log, SUBSYS, "{} ({}), device failed", what, err);
        self.failed = true;
    }

    /// Walk chain `head` into a request. An error means the ring can no
    /// longer be trusted.
    fn process_request(&mut self, head: u16) -> Result<Request> {
        let queue = self.queue.as_ref().ok_or(Error::NotReady)?;
        let chain = queue.chain(&self.regions, head)?;
        let header = chain.first().copied().ok_or(Error::Invalid)?;
        if header.len < HEADER_SIZE {
            return Err(Error::Invalid);
        }
        let mut raw = [0u8; HEADER_SIZE as usize];
        self.regions.read(header.addr, &mut raw)?;
        let kind = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut sector_raw = [0u8; 8];
        sector_raw.copy_from_slice(&raw[8..16]);
        let sector = u64::from_le_bytes(sector_raw);

        let (data, status_addr) = Self::split_status(&header, &chain)?;
        self.regions.resolve(status_addr, 1)?;

        let mut early = None;
        let mut segments = Vec::new();
        let last = data.len().saturating_sub(1);
        for (i, desc) in data.iter().enumerate() {
            // The final byte of the last segment carries the status.
            let len = if i == last { desc.len - 1 } else { desc.len };
            if len == 0 {
                continue;
            }
            if len > self.config.size_max {
                early = Some(VIRTIO_BLK_S_UNSUPP);
                continue;
            }
            let (region, offset) = self.regions.resolve(desc.addr, u64::from(len))?;
            segments.push(Segment {
                ds: region.ds,
                offset,
                len,
            });
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut req = Request {
            id,
            head,
            kind,
            sector: 0,
            status_addr,
            blocks: Vec::new(),
            mappings: Vec::new(),
            early,
            orphan: false,
        };
        if req.early.is_none() {
            req.early = self.prepare(&mut req, sector, &segments);
        }
        Ok(req)
    }

    /// Status slot location and the descriptors that carry data.
    fn split_status<'a>(header: &Descriptor, chain: &'a [Descriptor]) -> Result<(&'a [Descriptor], u64)> {
        match chain.split_last() {
            Some((_, [])) => {
                // Lone header descriptor with room for the status behind it.
                if header.len <= HEADER_SIZE {
                    return Err(Error::Invalid);
                }
                Ok((&[], Self::last_byte(header)?))
            }
            Some((last, _)) => {
                if last.len == 0 {
                    return Err(Error::Invalid);
                }
                Ok((&chain[1..], Self::last_byte(last)?))
            }
            None => Err(Error::Invalid),
        }
    }

    /// Address of the final byte of `desc`.
    fn last_byte(desc: &Descriptor) -> Result<u64> {
        desc.addr
            .checked_add(u64::from(desc.len))
            .and_then(|end| end.checked_sub(1))
            .ok_or(Error::Invalid)
    }

    /// Validate a read or write and map its segments. Returns the status to
    /// answer with when the request cannot go to the target.
    fn prepare(&self, req: &mut Request, sector: u64, segments: &[Segment]) -> Option<u8> {
        let dir = match req.kind {
            VIRTIO_BLK_T_IN => Direction::FromDevice,
            VIRTIO_BLK_T_OUT => Direction::ToDevice,
            _ => return Some(VIRTIO_BLK_S_UNSUPP),
        };
        if req.kind == VIRTIO_BLK_T_OUT && self.geometry.read_only {
            return Some(VIRTIO_BLK_S_IOERR);
        }
        if segments.len() > MAX_PRD_ENTRIES {
            klog_debug!(
                self.log,
                SUBSYS,
                "request {}: {} segments exceed {}",
                req.id,
                segments.len(),
                MAX_PRD_ENTRIES
            );
            return Some(VIRTIO_BLK_S_IOERR);
        }

        let per_sector = (self.geometry.sector_size as u64 / VIRTIO_SECTOR_SIZE).max(1);
        req.sector = sector / per_sector;
        for seg in segments {
            match DmaMapping::new(&self.dma, seg.ds, seg.offset, seg.len as usize, dir) {
                Ok(mapping) => {
                    req.blocks.push(DataBlock::new(mapping.addr(), seg.len));
                    req.mappings.push(mapping);
                }
                Err(err) => {
                    klog_warn!(self.log, SUBSYS, "request {}: DMA mapping failed: {}", req.id, err);
                    return Some(VIRTIO_BLK_S_IOERR);
                }
            }
        }
        None
    }

    fn submit(&mut self, req: Request, target: &mut dyn BlockTarget) -> Admission {
        if let Some(status) = req.early {
            self.finish(req, status);
            return Admission::Finished;
        }
        match target.inout_data(req.sector, &req.blocks, req.flags(), req.id) {
            Ok(()) => {
                self.in_flight.insert(req.id, req);
                Admission::Started
            }
            Err(err) if err.is_transient() => {
                klog_debug!(self.log, SUBSYS, "request {} waits for a free slot", req.id);
                self.pending.push_back(req);
                Admission::Queued
            }
            Err(err) => {
                self.rejected(req, err);
                Admission::Finished
            }
        }
    }

    fn rejected(&mut self, req: Request, err: Error) {
        klog_debug!(self.log, SUBSYS, "request {} rejected: {}", req.id, err);
        self.finish(req, VIRTIO_BLK_S_IOERR);
        if err == Error::NoDevice {
            self.fail("device gone", err);
        }
    }

    /// Write the status byte, release the mappings and return the chain.
    fn finish(&mut self, req: Request, status: u8) {
        let written = if status == VIRTIO_BLK_S_OK && req.kind == VIRTIO_BLK_T_IN {
            req.mapped_bytes() + 1
        } else {
            1
        };
        if let Err(err) = self.regions.write(req.status_addr, &[status]) {
            self.fail("status byte unwritable", err);
            return;
        }
        let head = req.head;
        drop(req);

        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        match queue.push_used(&self.regions, head, written) {
            Ok(()) => self.notify = true,
            Err(err) => self.fail("used ring unwritable", err),
        }
    }

    fn flush_notify(&mut self) {
        if !self.notify {
            return;
        }
        self.notify = false;
        if let Some(doorbell) = self.doorbell.as_ref() {
            doorbell.ring();
        }
    }
}
