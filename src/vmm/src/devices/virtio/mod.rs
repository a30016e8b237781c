// SPDX-License-Identifier: Apache-2.0

//! Virtio 1.x over PCI with packed virtqueues.

use vm_memory::ByteValued;

pub mod block;
pub mod net;
pub mod pci;
pub mod queue;

/// Identifies compliance with virtio 1.x.
pub const VIRTIO_F_VERSION_1: u64 = 32;
/// Packed virtqueue layout support.
pub const VIRTIO_F_RING_PACKED: u64 = 34;
/// Device supports multiple receive/transmit queue pairs.
pub const VIRTIO_NET_F_MQ: u64 = 22;

pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1AF4;
pub const VIRTIO_PCI_DEVICE_ID_NET: u16 = 0x1041;
pub const VIRTIO_PCI_DEVICE_ID_BLK: u16 = 0x1042;

/// ISR status: a used buffer was queued.
pub const VIRTIO_PCI_ISR_QUEUE: u8 = 1;

pub const VIRTIO_BLK_PCI_CLASS: u32 = 0x018000;
pub const VIRTIO_NET_PCI_CLASS: u32 = 0x020000;

/// Per-queue capability trio supplied by the owning device. Each queue gets
/// its own instance (virtio-net installs different ones for RX and TX).
pub trait VirtqOps: Send + Sync {
    /// The guest enabled the queue: wire the kick eventfd at `notify_addr`
    /// and bring up whatever worker services the queue.
    fn enable_vq(&self, vq: &std::sync::Arc<std::sync::Mutex<queue::Virtq>>, notify_addr: u64);

    /// Consume available descriptors and complete them.
    fn complete_request(&self, vq: &mut queue::Virtq);

    /// Tell the guest about completions (irqfd write).
    fn notify_used(&self);
}

/// Virtio 1.x network header (the 12-byte `virtio_net_hdr_v1`), prepended to
/// every frame crossing a net virtqueue.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for VirtioNetHdr {}

pub const VIRTIO_NET_HDR_SIZE: usize = std::mem::size_of::<VirtioNetHdr>();
