// SPDX-License-Identifier: Apache-2.0

//! Virtio block device backend.
//!
//! Requests arrive as three chained descriptors: a 16-byte header, the data
//! buffer and a one-byte status. A single worker blocks on the queue's
//! ioeventfd and drains every available request per kick.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, warn};
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use super::pci::{VirtioDeviceInfo, VirtioPciDev};
use super::queue::{handle_avail, Virtq};
use super::{
    VirtqOps, VIRTIO_BLK_PCI_CLASS, VIRTIO_F_RING_PACKED, VIRTIO_F_VERSION_1,
    VIRTIO_PCI_DEVICE_ID_BLK, VIRTIO_PCI_ISR_QUEUE,
};
use crate::bus::Bus;
use crate::devices::diskimg::DiskImg;
use crate::devices::pci::PciRoot;
use crate::devices::{Error, Result, VmNotify};

pub const VIRTIO_BLK_IRQ: u32 = 15;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const SECTOR_SHIFT: u64 = 9;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for BlkReqHeader {}

/// Device configuration region (`struct virtio_blk_config`); only the
/// capacity is filled in, the rest reads as zero.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct VirtioBlkConfig {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    cylinders: u16,
    heads: u8,
    sectors: u8,
    blk_size: u32,
    physical_block_exp: u8,
    alignment_offset: u8,
    min_io_size: u16,
    opt_io_size: u32,
    writeback: u8,
    unused0: u8,
    num_queues: u16,
    max_discard_sectors: u32,
    max_discard_seg: u32,
    discard_sector_alignment: u32,
    max_write_zeroes_sectors: u32,
    max_write_zeroes_seg: u32,
    write_zeroes_may_unmap: u8,
    unused1: [u8; 3],
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for VirtioBlkConfig {}

pub struct VirtioBlk {
    mem: GuestMemoryMmap,
    disk: DiskImg,
    vm: Arc<dyn VmNotify>,
    isr: Arc<AtomicU8>,
    irqfd: EventFd,
    ioeventfd: EventFd,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VirtioBlk {
    /// Bring the device up on the PCI bus. Returns the device handle (for
    /// shutdown) and its slot number on bus 0.
    pub fn new(
        vm: Arc<dyn VmNotify>,
        mem: GuestMemoryMmap,
        disk: DiskImg,
        pci_root: &Arc<PciRoot>,
        io_bus: &Bus,
        mmio_bus: &Bus,
    ) -> Result<(Arc<Self>, u16)> {
        let dev = Self::device(vm, mem, disk)?;

        let queues = vec![Arc::new(Mutex::new(Virtq::new(dev.mem.clone())))];
        let ops: Vec<Arc<dyn VirtqOps>> = vec![Arc::new(BlkQueue(dev.clone()))];
        let config = VirtioBlkConfig {
            capacity: dev.disk.size() >> SECTOR_SHIFT,
            ..Default::default()
        };

        let (_, dev_num) = VirtioPciDev::new(
            VirtioDeviceInfo {
                device_id: VIRTIO_PCI_DEVICE_ID_BLK,
                class: VIRTIO_BLK_PCI_CLASS,
                irq: VIRTIO_BLK_IRQ,
                device_feature: (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_F_RING_PACKED),
                notify_off_multiplier: 0,
            },
            pci_root,
            io_bus,
            mmio_bus,
            queues,
            ops,
            dev.isr.clone(),
            config.as_slice().to_vec(),
        )?;
        Ok((dev, dev_num))
    }

    fn device(vm: Arc<dyn VmNotify>, mem: GuestMemoryMmap, disk: DiskImg) -> Result<Arc<Self>> {
        let irqfd = EventFd::new(libc::EFD_CLOEXEC).map_err(Error::EventFd)?;
        let ioeventfd = EventFd::new(libc::EFD_CLOEXEC).map_err(Error::EventFd)?;
        vm.register_irqfd(&irqfd, VIRTIO_BLK_IRQ)
            .map_err(Error::Plumbing)?;

        Ok(Arc::new(VirtioBlk {
            mem,
            disk,
            vm,
            isr: Arc::new(AtomicU8::new(0)),
            irqfd,
            ioeventfd,
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }))
    }

    /// Stop and join the queue worker. Safe to call with the worker blocked
    /// on its ioeventfd: the flag is raised first, then the fd is poked.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.ioeventfd.write(1);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The per-queue ops trio for the single request queue.
struct BlkQueue(Arc<VirtioBlk>);

impl VirtqOps for BlkQueue {
    fn enable_vq(&self, vq: &Arc<Mutex<Virtq>>, notify_addr: u64) {
        let dev = self.0.clone();
        if let Err(e) = dev.vm.register_ioeventfd(&dev.ioeventfd, notify_addr) {
            error!("virtio-blk: failed to register ioeventfd: {}", e);
            return;
        }

        let vq = vq.clone();
        let handle = std::thread::spawn(move || {
            loop {
                match dev.ioeventfd.read() {
                    Ok(_) => {}
                    Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        warn!("virtio-blk: ioeventfd read failed: {}", e);
                        break;
                    }
                }
                if dev.stop.load(Ordering::Relaxed) {
                    break;
                }
                handle_avail(&vq, &BlkQueue(dev.clone()));
            }
        });
        *self.0.worker.lock().unwrap() = Some(handle);
    }

    fn complete_request(&self, vq: &mut Virtq) {
        let dev = &self.0;
        while let Some((head_slot, head)) = vq.get_next_avail() {
            let hdr = dev
                .mem
                .read_obj::<BlkReqHeader>(GuestAddress(head.addr))
                .unwrap_or(BlkReqHeader {
                    req_type: u32::MAX,
                    ..Default::default()
                });

            let mut last = head;
            let mut status = VIRTIO_BLK_S_UNSUPP;
            let mut transferred = 0u32;

            if hdr.req_type == VIRTIO_BLK_T_IN || hdr.req_type == VIRTIO_BLK_T_OUT {
                if !last.has_next() {
                    return;
                }
                let data = match vq.get_next_avail() {
                    Some((_, desc)) => desc,
                    None => return,
                };
                let offset = hdr.sector << SECTOR_SHIFT;
                let mut buf = vec![0u8; data.len as usize];

                let result = if hdr.req_type == VIRTIO_BLK_T_IN {
                    dev.disk.read_at(&mut buf, offset).and_then(|n| {
                        dev.mem
                            .write_slice(&buf[..n], GuestAddress(data.addr))
                            .map(|_| n)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                    })
                } else {
                    dev.mem
                        .read_slice(&mut buf, GuestAddress(data.addr))
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                        .and_then(|_| dev.disk.write_at(&buf, offset))
                };

                match result {
                    Ok(n) => {
                        status = VIRTIO_BLK_S_OK;
                        transferred = n as u32;
                    }
                    Err(e) => {
                        warn!("virtio-blk: disk I/O failed: {}", e);
                        status = VIRTIO_BLK_S_IOERR;
                    }
                }
                last = data;
            }

            if !last.has_next() {
                return;
            }
            let status_desc = match vq.get_next_avail() {
                Some((_, desc)) => desc,
                None => return,
            };
            let _ = dev.mem.write_obj(status, GuestAddress(status_desc.addr));

            vq.write_used(head_slot, &head, transferred);
            dev.isr.fetch_or(VIRTIO_PCI_ISR_QUEUE, Ordering::AcqRel);
        }
    }

    fn notify_used(&self) {
        if let Err(e) = self.0.irqfd.write(1) {
            error!("virtio-blk: failed to write the irqfd: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::FakeVm;
    use crate::devices::virtio::queue::tests::{post_desc, test_mem, test_queue};
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    const HDR_GPA: u64 = 0x4000;
    const DATA_GPA: u64 = 0x5000;
    const STATUS_GPA: u64 = 0x6000;

    fn test_disk(content: &[u8]) -> DiskImg {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(content).unwrap();
        DiskImg::open(tmp.as_path()).unwrap()
    }

    fn test_blk(disk: DiskImg) -> (Arc<VirtioBlk>, GuestMemoryMmap) {
        let mem = test_mem();
        let dev = VirtioBlk::device(Arc::new(FakeVm::default()), mem.clone(), disk).unwrap();
        (dev, mem)
    }

    fn post_request(mem: &GuestMemoryMmap, req_type: u32, sector: u64, data_len: u32) {
        mem.write_obj(
            BlkReqHeader {
                req_type,
                reserved: 0,
                sector,
            },
            GuestAddress(HDR_GPA),
        )
        .unwrap();
        post_desc(mem, 0, HDR_GPA, 16, true);
        post_desc(mem, 1, DATA_GPA, data_len, true);
        post_desc(mem, 2, STATUS_GPA, 1, false);
    }

    fn status_byte(mem: &GuestMemoryMmap) -> u8 {
        mem.read_obj(GuestAddress(STATUS_GPA)).unwrap()
    }

    #[test]
    fn read_request_fills_buffer_from_disk() {
        let mut content = vec![0u8; 1024];
        content[..4].copy_from_slice(b"boot");
        let (dev, mem) = test_blk(test_disk(&content));
        let mut vq = test_queue(&mem);
        post_request(&mem, VIRTIO_BLK_T_IN, 0, 512);

        BlkQueue(dev.clone()).complete_request(&mut vq);

        let mut buf = [0u8; 4];
        mem.read_slice(&mut buf, GuestAddress(DATA_GPA)).unwrap();
        assert_eq!(&buf, b"boot");
        assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
        assert_eq!(dev.isr.load(Ordering::SeqCst), VIRTIO_PCI_ISR_QUEUE);

        // The head descriptor was completed with the transferred length.
        let head: crate::devices::virtio::queue::PackedDesc =
            mem.read_obj(GuestAddress(crate::devices::virtio::queue::tests::DESC_RING)).unwrap();
        assert_eq!(head.len, 512);
        assert_ne!(head.flags & (1 << 15), 0);
    }

    #[test]
    fn read_of_second_sector_uses_byte_offset() {
        let mut content = vec![0u8; 1024];
        content[512..518].copy_from_slice(b"sector");
        let (dev, mem) = test_blk(test_disk(&content));
        let mut vq = test_queue(&mem);
        post_request(&mem, VIRTIO_BLK_T_IN, 1, 512);

        BlkQueue(dev).complete_request(&mut vq);

        let mut buf = [0u8; 6];
        mem.read_slice(&mut buf, GuestAddress(DATA_GPA)).unwrap();
        assert_eq!(&buf, b"sector");
    }

    #[test]
    fn write_request_updates_disk() {
        let (dev, mem) = test_blk(test_disk(&vec![0u8; 1024]));
        mem.write_slice(b"written!", GuestAddress(DATA_GPA)).unwrap();
        let mut vq = test_queue(&mem);
        post_request(&mem, VIRTIO_BLK_T_OUT, 1, 8);

        BlkQueue(dev.clone()).complete_request(&mut vq);

        assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
        let mut back = [0u8; 8];
        dev.disk.read_at(&mut back, 512).unwrap();
        assert_eq!(&back, b"written!");
    }

    #[test]
    fn unknown_request_type_is_unsupported() {
        let (dev, mem) = test_blk(test_disk(&vec![0u8; 1024]));
        let mut vq = test_queue(&mem);
        mem.write_obj(
            BlkReqHeader {
                req_type: 0xABCD,
                reserved: 0,
                sector: 0,
            },
            GuestAddress(HDR_GPA),
        )
        .unwrap();
        post_desc(&mem, 0, HDR_GPA, 16, true);
        post_desc(&mem, 1, STATUS_GPA, 1, false);

        BlkQueue(dev).complete_request(&mut vq);
        assert_eq!(status_byte(&mem), VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn notify_used_pokes_the_irqfd() {
        let (dev, _) = test_blk(test_disk(&vec![0u8; 512]));
        BlkQueue(dev.clone()).notify_used();
        assert_eq!(dev.irqfd.read().unwrap(), 1);
    }

    #[test]
    fn kick_on_the_ioeventfd_reaches_the_worker() {
        let mut content = vec![0u8; 1024];
        content[..4].copy_from_slice(b"live");
        let (dev, mem) = test_blk(test_disk(&content));
        let vq = Arc::new(Mutex::new(test_queue(&mem)));
        post_request(&mem, VIRTIO_BLK_T_IN, 0, 512);
        // Sentinel so completion is observable.
        mem.write_obj(0xFFu8, GuestAddress(STATUS_GPA)).unwrap();

        // Enable spawns the worker; the eventfd write stands in for a guest
        // kick at the notify address.
        BlkQueue(dev.clone()).enable_vq(&vq, 0xC000_003C);
        dev.ioeventfd.write(1).unwrap();

        let mut completed = false;
        for _ in 0..200 {
            if status_byte(&mem) == VIRTIO_BLK_S_OK {
                completed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        dev.stop();
        assert!(completed);
        let mut buf = [0u8; 4];
        mem.read_slice(&mut buf, GuestAddress(DATA_GPA)).unwrap();
        assert_eq!(&buf, b"live");
    }

    #[test]
    fn capacity_is_reported_in_sectors() {
        let disk = test_disk(&vec![0u8; 4096]);
        let config = VirtioBlkConfig {
            capacity: disk.size() >> SECTOR_SHIFT,
            ..Default::default()
        };
        assert_eq!(config.capacity, 8);
        assert_eq!(config.as_slice().len(), 60);
    }
}
