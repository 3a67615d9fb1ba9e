//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: integration_tests
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Discovery, partition scan and virtio I/O through the whole driver.

#[cfg(test)]
mod storage_integration_tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use ahci::config::Config;
    use ahci::device::{ata, DeviceFeatures};
    use ahci::driver::Driver;
    use ahci::hw::DmaSpace;
    use ahci::regs::PortIs;
    use ahci::virtio::{VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP};
    use ahci::{Errands, Error, PortState};
    use kernel_log::{LogLevel, Logger};

    use crate::sim::{pattern, Rig, SimDisk, SimDma, SimHba, SimPci};

    const SERIAL: &str = "SIM-0001";

    fn gpt_disk(parts: &[(u64, u64)]) -> (SimDisk, Vec<String>) {
        SimDisk::new(SERIAL, 512, 16384).with_gpt(parts)
    }

    fn port_state(rig: &Rig) -> Option<PortState> {
        rig.drv.hba(0).and_then(|h| h.port(0)).map(|p| p.state())
    }

    #[test]
    fn test_discovery_identify_and_partitions() {
        let (disk, guids) = gpt_disk(&[(2048, 4095), (4096, 8191)]);
        let rig = Rig::new(vec![Some(disk), None], Config::default());

        assert!(!rig.drv.scans_running());
        assert_eq!(rig.drv.devices().iter().count(), 3);
        assert_eq!(port_state(&rig), Some(PortState::Ready));
        assert!(rig.drv.hba(0).and_then(|h| h.port(1)).map_or(true, |p| !p.is_ready()));

        let disk_id = rig.drv.find_device(SERIAL).unwrap();
        let info = &rig.drv.devices().get(disk_id).unwrap().info;
        assert_eq!(info.model, "GuardBSD SIM-DISK");
        assert_eq!(info.firmware, "SIM 1.0");
        assert_eq!(info.num_sectors, 16384);
        assert_eq!(info.sector_size, 512);
        assert!(info.features.contains(DeviceFeatures::LBA48 | DeviceFeatures::DMA));

        for (guid, size) in guids.iter().zip([2048u64, 4096]) {
            let id = rig.drv.find_device(guid).unwrap();
            let part = rig.drv.devices().get(id).unwrap();
            assert_eq!(part.parent(), Some(disk_id));
            assert_eq!(part.info.num_sectors, size);
        }
        // Lookups ignore case.
        assert!(rig.drv.find_device(&guids[0].to_lowercase()).is_some());

        let log = rig.sim.executed();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].command, ata::ID_DEVICE);
        assert_eq!((log[1].command, log[1].lba, log[1].count), (ata::READ_DMA_EXT, 0, 2));
        assert_eq!((log[2].lba, log[2].count), (2, 32));
        assert_eq!(rig.line.unmasked.get(), 3);
    }

    #[test]
    fn test_lba28_disk_without_partition_table() {
        let mut disk = SimDisk::new("OLD-28", 512, 4096);
        disk.lba48 = false;
        let rig = Rig::new(vec![Some(disk)], Config::default());

        assert_eq!(rig.drv.devices().iter().count(), 1);
        let id = rig.drv.find_device("OLD-28").unwrap();
        assert!(!rig.drv.devices().get(id).unwrap().info.features.contains(DeviceFeatures::LBA48));
        let log = rig.sim.executed();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].command, ata::READ_DMA);
    }

    #[test]
    fn test_bad_header_crc_hides_partitions() {
        let (mut disk, guids) = gpt_disk(&[(2048, 4095)]);
        disk.image[512 + 16] ^= 0xff;

        let rig = Rig::new(vec![Some(disk.clone())], Config::default());
        assert_eq!(rig.drv.devices().iter().count(), 1);
        assert!(rig.drv.find_device(&guids[0]).is_none());

        let mut cfg = Config::default();
        cfg.verify_gpt_crc = false;
        let rig = Rig::new(vec![Some(disk)], cfg);
        assert!(rig.drv.find_device(&guids[0]).is_some());
    }

    #[test]
    fn test_interface_waits_for_bringup() {
        let (disk, _) = gpt_disk(&[(2048, 4095)]);
        let mut rig = Rig::with_slots(vec![Some(disk)], 32, Config::default());
        assert!(rig.drv.scans_running());
        assert_eq!(rig.drv.create_interface_for(SERIAL, 4), Err(Error::Again));
        assert_eq!(rig.drv.create_interface_for("unknown", 4), Err(Error::Again));

        rig.settle();
        assert_eq!(rig.drv.create_interface_for("unknown", 4), Err(Error::NoDevice));
        assert!(rig.drv.create_interface_for(SERIAL, 4).is_ok());
    }

    #[test]
    fn test_partition_write_then_read() {
        let (disk, guids) = gpt_disk(&[(2048, 4095)]);
        let mut rig = Rig::new(vec![Some(disk)], Config::default());
        let (iface, mut client) = rig.client(&guids[0]);
        assert_eq!(rig.drv.interface(iface).unwrap().bridge().config().capacity, 2048);

        let data = pattern(4096, 0x5a);
        let w = client.write(3, &data);
        rig.drv.kick(iface).unwrap();
        rig.settle();
        assert_eq!(client.status(&w), VIRTIO_BLK_S_OK);
        let image = rig.sim.disk(0).image;
        let at = (2048 + 3) * 512;
        assert_eq!(&image[at..at + 4096], &data[..]);

        let r = client.read(3, 4096);
        rig.drv.kick(iface).unwrap();
        rig.settle();
        assert_eq!(client.status(&r), VIRTIO_BLK_S_OK);
        assert_eq!(client.data(&r), data);

        assert_eq!(client.take_used(), vec![(w.head, 1), (r.head, 4097)]);
        assert_eq!(client.bell.0.get(), 2);
        assert_eq!(rig.dma.live_mappings(), 0);

        let last = *rig.sim.executed().last().unwrap();
        assert_eq!((last.command, last.lba, last.count), (ata::READ_DMA_EXT, 2051, 8));
    }

    #[test]
    fn test_partition_bounds_and_unsupported_requests() {
        let (disk, guids) = gpt_disk(&[(2048, 4095)]);
        let mut rig = Rig::new(vec![Some(disk)], Config::default());
        let (iface, mut client) = rig.client(&guids[0]);
        let before = rig.sim.executed().len();

        let past_end = client.read(2047, 1024);
        let flush = client.submit(4, 0, &[]);
        rig.drv.kick(iface).unwrap();
        rig.settle();

        assert_eq!(client.status(&past_end), VIRTIO_BLK_S_IOERR);
        assert_eq!(client.status(&flush), VIRTIO_BLK_S_UNSUPP);
        assert_eq!(rig.sim.executed().len(), before);
        assert!(!rig.drv.interface(iface).unwrap().bridge().is_failed());
    }

    #[test]
    fn test_4k_sector_disk() {
        let disk = SimDisk::new("BIG-4K", 4096, 1024);
        let mut rig = Rig::new(vec![Some(disk)], Config::default());
        let (iface, mut client) = rig.client("BIG-4K");
        let config = *rig.drv.interface(iface).unwrap().bridge().config();
        assert_eq!(config.capacity, 1024 * 8);
        assert_eq!(config.blk_size, 4096);

        let data = pattern(8192, 0x33);
        let w = client.write(16, &data);
        rig.drv.kick(iface).unwrap();
        rig.settle();
        assert_eq!(client.status(&w), VIRTIO_BLK_S_OK);

        let last = *rig.sim.executed().last().unwrap();
        assert_eq!((last.command, last.lba, last.count), (ata::WRITE_DMA_EXT, 2, 2));
        assert_eq!(&rig.sim.disk(0).image[2 * 4096..4 * 4096], &data[..]);
    }

    #[test]
    fn test_backpressure_keeps_fifo_order() {
        let mut disk = SimDisk::new(SERIAL, 512, 4096);
        disk.image = pattern(512 * 4096, 0x11);
        let mut rig = Rig::with_slots(vec![Some(disk)], 2, Config::default());
        rig.settle();
        let (iface, mut client) = rig.client(SERIAL);
        let before = rig.sim.executed().len();

        let reqs: Vec<_> = (0..5u64).map(|i| client.read(8 * i, 4096)).collect();
        rig.drv.kick(iface).unwrap();
        assert_eq!(rig.sim.queued(0), 2);
        assert_eq!(rig.drv.interface(iface).unwrap().bridge().pending_len(), 1);
        assert_eq!(rig.drv.interface(iface).unwrap().bridge().in_flight_len(), 2);

        rig.settle();
        let image = rig.sim.disk(0).image;
        for (i, req) in reqs.iter().enumerate() {
            assert_eq!(client.status(req), VIRTIO_BLK_S_OK);
            assert_eq!(client.data(req), &image[i * 4096..(i + 1) * 4096]);
        }
        let lbas: Vec<u64> = rig.sim.executed()[before..].iter().map(|c| c.lba).collect();
        assert_eq!(lbas, vec![0, 8, 16, 24, 32]);
        assert_eq!(rig.drv.interface(iface).unwrap().bridge().pending_len(), 0);
        assert_eq!(rig.dma.live_mappings(), 0);
    }

    #[test]
    fn test_partition_in_flight_limit() {
        let (disk, guids) = gpt_disk(&[(2048, 4095)]);
        let mut cfg = Config::default();
        cfg.max_in_flight = 1;
        let mut rig = Rig::new(vec![Some(disk)], cfg);
        let (iface, mut client) = rig.client(&guids[0]);

        let reqs: Vec<_> = (0..3u64).map(|i| client.read(i, 512)).collect();
        rig.drv.kick(iface).unwrap();
        assert_eq!(rig.sim.queued(0), 1);
        assert_eq!(rig.drv.interface(iface).unwrap().bridge().pending_len(), 1);

        rig.settle();
        assert!(reqs.iter().all(|r| client.status(r) == VIRTIO_BLK_S_OK));
    }

    #[test]
    fn test_task_file_error_recovers_port() {
        let mut rig = Rig::new(vec![Some(SimDisk::new(SERIAL, 512, 4096))], Config::default());
        let (iface, mut client) = rig.client(SERIAL);

        let first = client.read(0, 512);
        let second = client.read(1, 512);
        rig.drv.kick(iface).unwrap();
        rig.sim.fail_next(0, 1);
        rig.settle();

        assert_eq!(client.status(&first), VIRTIO_BLK_S_IOERR);
        assert_eq!(client.status(&second), VIRTIO_BLK_S_OK);
        assert_eq!(port_state(&rig), Some(PortState::Ready));

        let third = client.read(2, 512);
        rig.drv.kick(iface).unwrap();
        rig.settle();
        assert_eq!(client.status(&third), VIRTIO_BLK_S_OK);
        assert_eq!(rig.dma.live_mappings(), 0);
    }

    #[test]
    fn test_link_change_resets_port() {
        let mut rig = Rig::new(vec![Some(SimDisk::new(SERIAL, 512, 4096))], Config::default());
        let (iface, mut client) = rig.client(SERIAL);

        let lost = client.read(0, 512);
        rig.drv.kick(iface).unwrap();
        rig.sim.raise_port_irq(0, PortIs::PRCS);
        rig.settle();
        assert_eq!(client.status(&lost), VIRTIO_BLK_S_IOERR);
        assert_eq!(port_state(&rig), Some(PortState::Ready));
        assert!(rig.errands.now() >= Config::default().reset_settle_us);

        let after = client.read(0, 512);
        rig.drv.kick(iface).unwrap();
        rig.settle();
        assert_eq!(client.status(&after), VIRTIO_BLK_S_OK);
    }

    #[test]
    fn test_exclusive_use_and_release_with_io_in_flight() {
        let (disk, guids) = gpt_disk(&[(2048, 4095)]);
        let mut rig = Rig::new(vec![Some(disk)], Config::default());
        let (iface, mut client) = rig.client(SERIAL);
        assert_eq!(rig.drv.create_interface_for(&guids[0], 4), Err(Error::Busy));

        let orphan = client.read(0, 512);
        rig.drv.kick(iface).unwrap();
        rig.drv.release_interface(iface).unwrap();
        assert!(rig.drv.interface(iface).is_none());
        assert_eq!(rig.drv.kick(iface), Err(Error::NoDevice));
        assert_eq!(rig.dma.live_mappings(), 1);

        rig.settle();
        assert_eq!(rig.dma.live_mappings(), 0);
        assert_eq!(client.status(&orphan), 0xff);

        let part = rig.drv.create_interface_for(&guids[0], 4).unwrap();
        assert_eq!(part, iface);
    }

    #[test]
    fn test_static_clients_from_command_line() {
        let (disk, guids) = gpt_disk(&[(2048, 4095)]);
        let args = [format!("vda,{},4", guids[0]), String::from("vdb,NOPE,2")];
        let rig = Rig::new(vec![Some(disk)], Config::from_args(args).unwrap());

        let statics = rig.drv.static_interfaces();
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].0, "vda");
        let device = rig.drv.interface(statics[0].1).unwrap().device();
        assert_eq!(Some(device), rig.drv.find_device(&guids[0]));
    }

    #[test]
    fn test_pci_probe() {
        let dma = SimDma::new();
        let space: Rc<dyn DmaSpace> = dma.clone();
        let mut drv = Driver::new(Config::default(), space, Logger::memory_only(LogLevel::Info));
        let mut errands = Errands::new();

        let nic = SimPci {
            class: 0x020000,
            command: Cell::new(0),
        };
        let sim = SimHba::new(vec![None], 32, dma.clone());
        assert_eq!(drv.probe_pci(&nic, sim.clone(), &mut errands), Err(Error::NoDevice));
        assert_eq!(nic.command.get(), 0);

        let sata = SimPci {
            class: 0x010601,
            command: Cell::new(0x0002),
        };
        assert_eq!(drv.probe_pci(&sata, sim, &mut errands), Ok(0));
        assert_eq!(sata.command.get(), 0x0006);
        assert!(drv.hba(0).is_some());
    }
}
