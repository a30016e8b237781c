// SPDX-License-Identifier: Apache-2.0

//! Virtio network device backend over a TAP interface.
//!
//! Two packed queues: RX (0) and TX (1), each with its own worker and kick
//! eventfd. The TX worker waits for a kick AND a writable TAP before moving a
//! frame; the RX worker mirrors TAP ingress into guest buffers. Frames carry
//! a 12-byte virtio net header on the ring that never reaches the TAP fd.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, warn};
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use super::pci::{VirtioDeviceInfo, VirtioPciDev};
use super::queue::{
    handle_avail, Virtq, VRING_PACKED_EVENT_FLAG_DISABLE, VRING_PACKED_EVENT_FLAG_ENABLE,
};
use super::{
    VirtioNetHdr, VirtqOps, VIRTIO_F_RING_PACKED, VIRTIO_F_VERSION_1, VIRTIO_NET_F_MQ,
    VIRTIO_NET_HDR_SIZE, VIRTIO_NET_PCI_CLASS, VIRTIO_PCI_DEVICE_ID_NET, VIRTIO_PCI_ISR_QUEUE,
};
use crate::bus::Bus;
use crate::devices::pci::PciRoot;
use crate::devices::tap::Tap;
use crate::devices::{Error, Result, VmNotify};

pub const VIRTIO_NET_IRQ: u32 = 9;

const VIRTQ_RX: usize = 0;
const VIRTQ_TX: usize = 1;

/// Kick addresses are spread out so each queue gets its own ioeventfd slot.
const NOTIFY_OFF_MULTIPLIER: u32 = 2;

/// Device configuration region (`struct virtio_net_config`). With only MQ
/// negotiated the guest reads the queue-pair count; the MAC stays zero and
/// the driver generates one.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct VirtioNetConfig {
    mac: [u8; 6],
    status: u16,
    max_virtqueue_pairs: u16,
    mtu: u16,
    speed: u32,
    duplex: u8,
    rss_max_key_size: u8,
    rss_max_indirection_table_length: u16,
    supported_hash_types: u32,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for VirtioNetConfig {}

pub struct VirtioNet {
    mem: GuestMemoryMmap,
    tap: Tap,
    vm: Arc<dyn VmNotify>,
    isr: Arc<AtomicU8>,
    irqfd: EventFd,
    rx_ioeventfd: EventFd,
    tx_ioeventfd: EventFd,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VirtioNet {
    /// Open a TAP interface and bring the device up on the PCI bus.
    pub fn new(
        vm: Arc<dyn VmNotify>,
        mem: GuestMemoryMmap,
        pci_root: &Arc<PciRoot>,
        io_bus: &Bus,
        mmio_bus: &Bus,
    ) -> Result<Arc<Self>> {
        let tap = Tap::open()?;
        let dev = Self::device(vm, mem, tap)?;

        let mut queues = Vec::new();
        for i in [VIRTQ_RX, VIRTQ_TX] {
            let mut vq = Virtq::new(dev.mem.clone());
            vq.info.notify_off = i as u16;
            queues.push(Arc::new(Mutex::new(vq)));
        }
        let ops: Vec<Arc<dyn VirtqOps>> = vec![
            Arc::new(RxQueue(dev.clone())),
            Arc::new(TxQueue(dev.clone())),
        ];
        let config = VirtioNetConfig {
            max_virtqueue_pairs: 1,
            ..Default::default()
        };

        VirtioPciDev::new(
            VirtioDeviceInfo {
                device_id: VIRTIO_PCI_DEVICE_ID_NET,
                class: VIRTIO_NET_PCI_CLASS,
                irq: VIRTIO_NET_IRQ,
                device_feature: (1u64 << VIRTIO_F_VERSION_1)
                    | (1u64 << VIRTIO_F_RING_PACKED)
                    | (1u64 << VIRTIO_NET_F_MQ),
                notify_off_multiplier: NOTIFY_OFF_MULTIPLIER,
            },
            pci_root,
            io_bus,
            mmio_bus,
            queues,
            ops,
            dev.isr.clone(),
            config.as_slice().to_vec(),
        )?;
        Ok(dev)
    }

    fn device(vm: Arc<dyn VmNotify>, mem: GuestMemoryMmap, tap: Tap) -> Result<Arc<Self>> {
        let irqfd = EventFd::new(libc::EFD_CLOEXEC).map_err(Error::EventFd)?;
        let rx_ioeventfd =
            EventFd::new(libc::EFD_CLOEXEC | libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        let tx_ioeventfd =
            EventFd::new(libc::EFD_CLOEXEC | libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        vm.register_irqfd(&irqfd, VIRTIO_NET_IRQ)
            .map_err(Error::Plumbing)?;

        Ok(Arc::new(VirtioNet {
            mem,
            tap,
            vm,
            isr: Arc::new(AtomicU8::new(0)),
            irqfd,
            rx_ioeventfd,
            tx_ioeventfd,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn tap_name(&self) -> String {
        self.tap.name()
    }

    /// Stop both workers and join them; each is woken through its kick
    /// eventfd.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.rx_ioeventfd.write(1);
        let _ = self.tx_ioeventfd.write(1);
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    fn notify_guest(&self) {
        if let Err(e) = self.irqfd.write(1) {
            error!("virtio-net: failed to write the irqfd: {}", e);
        }
    }

    /// Mirror one TAP frame into the next available RX buffer. Errors and
    /// exhausted rings suppress guest kicks until the driver re-arms.
    fn complete_rx(&self, vq: &mut Virtq) {
        if let Some((slot, desc)) = vq.get_next_avail() {
            if (desc.len as usize) < VIRTIO_NET_HDR_SIZE {
                vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
                return;
            }
            let mut frame = vec![0u8; desc.len as usize - VIRTIO_NET_HDR_SIZE];
            let read = match self.tap.read_frame(&mut frame) {
                Ok(n) => n,
                Err(_) => {
                    vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
                    return;
                }
            };

            let hdr = VirtioNetHdr {
                num_buffers: 1,
                ..Default::default()
            };
            if self.mem.write_obj(hdr, GuestAddress(desc.addr)).is_err()
                || self
                    .mem
                    .write_slice(
                        &frame[..read],
                        GuestAddress(desc.addr + VIRTIO_NET_HDR_SIZE as u64),
                    )
                    .is_err()
            {
                vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
                return;
            }
            vq.write_used(slot, &desc, (VIRTIO_NET_HDR_SIZE + read) as u32);
            self.isr.fetch_or(VIRTIO_PCI_ISR_QUEUE, Ordering::AcqRel);
            return;
        }
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
    }

    /// Strip the virtio header from one TX buffer and push the frame out.
    fn complete_tx(&self, vq: &mut Virtq) {
        if let Some((slot, desc)) = vq.get_next_avail() {
            if (desc.len as usize) < VIRTIO_NET_HDR_SIZE {
                vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
                return;
            }
            let mut frame = vec![0u8; desc.len as usize - VIRTIO_NET_HDR_SIZE];
            if self
                .mem
                .read_slice(
                    &mut frame,
                    GuestAddress(desc.addr + VIRTIO_NET_HDR_SIZE as u64),
                )
                .is_err()
                || self.tap.write_frame(&frame).is_err()
            {
                vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
                return;
            }
            vq.write_used(slot, &desc, desc.len);
            self.isr.fetch_or(VIRTIO_PCI_ISR_QUEUE, Ordering::AcqRel);
            return;
        }
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
    }
}

fn pollfd(fd: i32, events: i16) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Ops trio for the receive queue.
struct RxQueue(Arc<VirtioNet>);

impl VirtqOps for RxQueue {
    fn enable_vq(&self, vq: &Arc<Mutex<Virtq>>, notify_addr: u64) {
        let dev = self.0.clone();
        if let Err(e) = dev.vm.register_ioeventfd(&dev.rx_ioeventfd, notify_addr) {
            error!("virtio-net: failed to register the RX ioeventfd: {}", e);
            return;
        }

        let vq = vq.clone();
        let handle = std::thread::spawn(move || {
            while !dev.stop.load(Ordering::Relaxed) {
                vq.lock().unwrap().set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
                let mut fds = [
                    pollfd(dev.tap.as_raw_fd(), libc::POLLIN),
                    pollfd(dev.rx_ioeventfd.as_raw_fd(), libc::POLLIN),
                ];
                let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
                if dev.stop.load(Ordering::Relaxed) {
                    break;
                }
                if ret <= 0 {
                    continue;
                }
                if fds[1].revents & libc::POLLIN != 0 {
                    // A kick only re-arms the queue; data moves when the TAP
                    // side is readable.
                    let _ = dev.rx_ioeventfd.read();
                }
                if fds[0].revents & libc::POLLIN != 0 {
                    handle_avail(&vq, &RxQueue(dev.clone()));
                }
            }
        });
        self.0.workers.lock().unwrap().push(handle);
    }

    fn complete_request(&self, vq: &mut Virtq) {
        self.0.complete_rx(vq);
    }

    fn notify_used(&self) {
        self.0.notify_guest();
    }
}

/// Ops trio for the transmit queue.
struct TxQueue(Arc<VirtioNet>);

impl VirtqOps for TxQueue {
    fn enable_vq(&self, vq: &Arc<Mutex<Virtq>>, notify_addr: u64) {
        let dev = self.0.clone();
        if let Err(e) = dev.vm.register_ioeventfd(&dev.tx_ioeventfd, notify_addr) {
            error!("virtio-net: failed to register the TX ioeventfd: {}", e);
            return;
        }

        let vq = vq.clone();
        let handle = std::thread::spawn(move || {
            while !dev.stop.load(Ordering::Relaxed) {
                vq.lock().unwrap().set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
                let mut fds = [
                    pollfd(dev.tx_ioeventfd.as_raw_fd(), libc::POLLIN),
                    pollfd(dev.tap.as_raw_fd(), libc::POLLOUT),
                ];
                let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
                if dev.stop.load(Ordering::Relaxed) {
                    break;
                }
                // A frame moves only when a kick is pending and the TAP side
                // can take it.
                if ret > 0
                    && fds[0].revents & libc::POLLIN != 0
                    && fds[1].revents & libc::POLLOUT != 0
                {
                    let _ = dev.tx_ioeventfd.read();
                    handle_avail(&vq, &TxQueue(dev.clone()));
                }
            }
        });
        self.0.workers.lock().unwrap().push(handle);
    }

    fn complete_request(&self, vq: &mut Virtq) {
        self.0.complete_tx(vq);
    }

    fn notify_used(&self) {
        if self.0.stop.load(Ordering::Relaxed) {
            warn!("virtio-net: dropping completion notify during shutdown");
            return;
        }
        self.0.notify_guest();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::FakeVm;
    use crate::devices::virtio::queue::tests::{post_desc, test_mem, test_queue};
    use std::os::unix::io::RawFd;

    const BUF_GPA: u64 = 0x5000;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) },
            0
        );
        (fds[0], fds[1])
    }

    fn test_net(tap_fd: RawFd) -> (Arc<VirtioNet>, GuestMemoryMmap) {
        let mem = test_mem();
        let dev =
            VirtioNet::device(Arc::new(FakeVm::default()), mem.clone(), Tap::from_fd(tap_fd))
                .unwrap();
        (dev, mem)
    }

    #[test]
    fn tx_strips_header_before_the_tap() {
        let (rx_fd, tx_fd) = nonblocking_pipe();
        let (dev, mem) = test_net(tx_fd);
        let peer = Tap::from_fd(rx_fd);

        // 12-byte header followed by the frame.
        let mut payload = vec![0u8; VIRTIO_NET_HDR_SIZE];
        payload.extend_from_slice(b"ethernet-frame");
        mem.write_slice(&payload, GuestAddress(BUF_GPA)).unwrap();
        post_desc(&mem, 0, BUF_GPA, payload.len() as u32, false);

        let mut vq = test_queue(&mem);
        dev.complete_tx(&mut vq);

        let mut out = [0u8; 64];
        let n = peer.read_frame(&mut out).unwrap();
        assert_eq!(&out[..n], b"ethernet-frame");
        assert_eq!(dev.isr.load(Ordering::SeqCst), VIRTIO_PCI_ISR_QUEUE);
    }

    #[test]
    fn rx_prepends_a_zero_header() {
        let (rx_fd, tx_fd) = nonblocking_pipe();
        let (dev, mem) = test_net(rx_fd);
        let peer = Tap::from_fd(tx_fd);

        peer.write_frame(b"incoming").unwrap();
        post_desc(&mem, 0, BUF_GPA, 64, false);

        let mut vq = test_queue(&mem);
        dev.complete_rx(&mut vq);

        let hdr: VirtioNetHdr = mem.read_obj(GuestAddress(BUF_GPA)).unwrap();
        assert_eq!(hdr.num_buffers, 1);
        assert_eq!(hdr.flags, 0);
        let mut frame = [0u8; 8];
        mem.read_slice(&mut frame, GuestAddress(BUF_GPA + VIRTIO_NET_HDR_SIZE as u64))
            .unwrap();
        assert_eq!(&frame, b"incoming");

        // Completed length covers header + frame.
        let desc: crate::devices::virtio::queue::PackedDesc = mem
            .read_obj(GuestAddress(crate::devices::virtio::queue::tests::DESC_RING))
            .unwrap();
        assert_eq!(desc.len as usize, VIRTIO_NET_HDR_SIZE + 8);
    }

    #[test]
    fn rx_short_buffer_backs_off() {
        let (rx_fd, tx_fd) = nonblocking_pipe();
        let (dev, mem) = test_net(rx_fd);
        let peer = Tap::from_fd(tx_fd);
        peer.write_frame(b"data").unwrap();

        // Too small to hold even the header.
        post_desc(&mem, 0, BUF_GPA, 4, false);
        let mut vq = test_queue(&mem);
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
        dev.complete_rx(&mut vq);
        assert_eq!(vq.driver_event_flags(), VRING_PACKED_EVENT_FLAG_DISABLE);
    }

    #[test]
    fn rx_with_no_tap_data_backs_off() {
        let (rx_fd, _tx_fd) = nonblocking_pipe();
        let (dev, mem) = test_net(rx_fd);

        post_desc(&mem, 0, BUF_GPA, 64, false);
        let mut vq = test_queue(&mem);
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
        dev.complete_rx(&mut vq);
        assert_eq!(vq.driver_event_flags(), VRING_PACKED_EVENT_FLAG_DISABLE);
    }

    #[test]
    fn empty_tx_ring_backs_off() {
        let (_rx_fd, tx_fd) = nonblocking_pipe();
        let (dev, mem) = test_net(tx_fd);

        let mut vq = test_queue(&mem);
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
        dev.complete_tx(&mut vq);
        assert_eq!(vq.driver_event_flags(), VRING_PACKED_EVENT_FLAG_DISABLE);
    }
}
