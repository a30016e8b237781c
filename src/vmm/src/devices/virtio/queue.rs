// SPDX-License-Identifier: Apache-2.0

//! Packed virtqueue (virtio 1.1 §2.7).
//!
//! The descriptor ring and the two event-suppression words live in guest
//! memory and are only touched through `vm-memory` accessors; the host-side
//! state is the ring cursor and the wrap counter.

use std::sync::{Arc, Mutex};

use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

use super::VirtqOps;

pub const VIRTQ_SIZE: u16 = 128;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_PACKED_DESC_F_AVAIL: u16 = 1 << 7;
const VIRTQ_PACKED_DESC_F_USED: u16 = 1 << 15;

pub const VRING_PACKED_EVENT_FLAG_ENABLE: u16 = 0x0;
pub const VRING_PACKED_EVENT_FLAG_DISABLE: u16 = 0x1;

const DESC_SIZE: u64 = 16;
/// Byte offsets of the `len` and `flags` fields inside a packed descriptor.
const DESC_LEN_OFFSET: u64 = 8;
const DESC_FLAGS_OFFSET: u64 = 14;
/// The `flags` word of an event-suppression structure follows its
/// `off_wrap` word.
const EVENT_FLAGS_OFFSET: u64 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PackedDesc {
    pub addr: u64,
    pub len: u32,
    pub id: u16,
    pub flags: u16,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for PackedDesc {}

impl PackedDesc {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// Mirror of the `queue_size..queue_device` window of the common
/// configuration region; the transport copies guest writes straight into
/// this struct and reads it back on queue select.
///
/// Window order: `device_addr` receives the `queue_driver` word and
/// `driver_addr` the `queue_device` word. The event-suppression flags the
/// device consults and writes live behind `driver_addr`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VirtqInfo {
    pub size: u16,
    pub msix_vector: u16,
    pub enable: u16,
    pub notify_off: u16,
    pub desc_addr: u64,
    pub device_addr: u64,
    pub driver_addr: u64,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for VirtqInfo {}

pub struct Virtq {
    pub info: VirtqInfo,
    next_avail_idx: u16,
    used_wrap_count: bool,
    mem: GuestMemoryMmap,
}

impl Virtq {
    pub fn new(mem: GuestMemoryMmap) -> Self {
        Virtq {
            info: VirtqInfo {
                size: VIRTQ_SIZE,
                ..Default::default()
            },
            next_avail_idx: 0,
            used_wrap_count: true,
            mem,
        }
    }

    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn enabled(&self) -> bool {
        self.info.enable != 0
    }

    pub fn next_avail_idx(&self) -> u16 {
        self.next_avail_idx
    }

    pub fn used_wrap_count(&self) -> bool {
        self.used_wrap_count
    }

    fn desc_gpa(&self, slot: u16) -> GuestAddress {
        GuestAddress(self.info.desc_addr).unchecked_add(slot as u64 * DESC_SIZE)
    }

    /// Return the next available descriptor, advancing the ring cursor and
    /// flipping the wrap counter when the cursor passes the ring end. A
    /// descriptor is available when its AVAIL flag matches the wrap counter
    /// and its USED flag does not.
    pub fn get_next_avail(&mut self) -> Option<(u16, PackedDesc)> {
        let slot = self.next_avail_idx;
        let desc: PackedDesc = self.mem.read_obj(self.desc_gpa(slot)).ok()?;
        let avail = desc.flags & VIRTQ_PACKED_DESC_F_AVAIL != 0;
        let used = desc.flags & VIRTQ_PACKED_DESC_F_USED != 0;
        if avail != self.used_wrap_count || used == self.used_wrap_count {
            return None;
        }
        self.next_avail_idx += 1;
        if self.next_avail_idx >= self.info.size {
            self.next_avail_idx -= self.info.size;
            self.used_wrap_count = !self.used_wrap_count;
        }
        Some((slot, desc))
    }

    /// Complete the descriptor at `slot`: publish the written length, then
    /// flip its USED flag. The fence orders the length store before the flag
    /// store so the guest never pairs USED with a stale length.
    pub fn write_used(&mut self, slot: u16, desc: &PackedDesc, len: u32) {
        let gpa = self.desc_gpa(slot);
        let _ = self
            .mem
            .write_obj(len, gpa.unchecked_add(DESC_LEN_OFFSET));
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        let _ = self.mem.write_obj(
            desc.flags ^ VIRTQ_PACKED_DESC_F_USED,
            gpa.unchecked_add(DESC_FLAGS_OFFSET),
        );
    }

    /// Event-suppression flags the device consults before interrupting and
    /// writes to throttle kicks.
    pub fn driver_event_flags(&self) -> u16 {
        self.mem
            .read_obj(GuestAddress(self.info.driver_addr).unchecked_add(EVENT_FLAGS_OFFSET))
            .unwrap_or(VRING_PACKED_EVENT_FLAG_DISABLE)
    }

    pub fn set_driver_event_flags(&self, flags: u16) {
        let _ = self.mem.write_obj(
            flags,
            GuestAddress(self.info.driver_addr).unchecked_add(EVENT_FLAGS_OFFSET),
        );
    }
}

/// One guest kick: drain the queue through its ops trio, then interrupt if
/// the guest has not suppressed notifications.
pub fn handle_avail(vq: &Arc<Mutex<Virtq>>, ops: &dyn VirtqOps) {
    let mut q = vq.lock().unwrap();
    if !q.enabled() {
        return;
    }
    ops.complete_request(&mut q);
    if q.driver_event_flags() == VRING_PACKED_EVENT_FLAG_ENABLE {
        ops.notify_used();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const DESC_RING: u64 = 0x1000;
    pub const DRIVER_EVENT: u64 = 0x2000;
    pub const DEVICE_EVENT: u64 = 0x3000;

    pub fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap()
    }

    pub fn test_queue(mem: &GuestMemoryMmap) -> Virtq {
        let mut vq = Virtq::new(mem.clone());
        vq.info.enable = 1;
        vq.info.desc_addr = DESC_RING;
        vq.info.device_addr = DEVICE_EVENT;
        vq.info.driver_addr = DRIVER_EVENT;
        vq
    }

    /// Mark `slot` available for the first ring pass (wrap counter 1).
    pub fn post_desc(mem: &GuestMemoryMmap, slot: u16, addr: u64, len: u32, chained: bool) {
        let mut flags = VIRTQ_PACKED_DESC_F_AVAIL;
        if chained {
            flags |= VIRTQ_DESC_F_NEXT;
        }
        let desc = PackedDesc {
            addr,
            len,
            id: slot,
            flags,
        };
        mem.write_obj(desc, GuestAddress(DESC_RING + slot as u64 * DESC_SIZE))
            .unwrap();
    }

    fn read_desc(mem: &GuestMemoryMmap, slot: u16) -> PackedDesc {
        mem.read_obj(GuestAddress(DESC_RING + slot as u64 * DESC_SIZE))
            .unwrap()
    }

    #[test]
    fn empty_ring_has_no_available_descriptor() {
        let mem = test_mem();
        let mut vq = test_queue(&mem);
        assert!(vq.get_next_avail().is_none());
        assert_eq!(vq.next_avail_idx(), 0);
    }

    #[test]
    fn available_descriptor_is_popped_once() {
        let mem = test_mem();
        let mut vq = test_queue(&mem);
        post_desc(&mem, 0, 0x8000, 512, false);

        let (slot, desc) = vq.get_next_avail().unwrap();
        assert_eq!(slot, 0);
        assert_eq!(desc.addr, 0x8000);
        assert_eq!(desc.len, 512);
        assert_eq!(vq.next_avail_idx(), 1);
        // Slot 1 was never posted.
        assert!(vq.get_next_avail().is_none());
    }

    #[test]
    fn cursor_advances_and_wrap_flips_at_ring_end() {
        let mem = test_mem();
        let mut vq = test_queue(&mem);
        for slot in 0..VIRTQ_SIZE {
            post_desc(&mem, slot, 0x8000 + slot as u64 * 0x100, 64, false);
        }

        assert!(vq.used_wrap_count());
        for n in 1..=VIRTQ_SIZE {
            assert!(vq.get_next_avail().is_some());
            assert_eq!(vq.next_avail_idx(), n % VIRTQ_SIZE);
        }
        // The window crossed the ring end exactly once.
        assert!(!vq.used_wrap_count());

        // Second pass availability uses the flipped wrap counter.
        let desc = PackedDesc {
            addr: 0x9000,
            len: 64,
            id: 0,
            flags: VIRTQ_PACKED_DESC_F_USED,
        };
        mem.write_obj(desc, GuestAddress(DESC_RING)).unwrap();
        assert!(vq.get_next_avail().is_some());
    }

    #[test]
    fn write_used_flips_flag_and_stores_length() {
        let mem = test_mem();
        let mut vq = test_queue(&mem);
        post_desc(&mem, 0, 0x8000, 512, false);

        let (slot, desc) = vq.get_next_avail().unwrap();
        vq.write_used(slot, &desc, 300);

        let back = read_desc(&mem, 0);
        assert_eq!(back.len, 300);
        assert_ne!(
            back.flags & VIRTQ_PACKED_DESC_F_USED == 0,
            desc.flags & VIRTQ_PACKED_DESC_F_USED == 0
        );
        // AVAIL is left as the driver wrote it.
        assert_eq!(back.flags & VIRTQ_PACKED_DESC_F_AVAIL, VIRTQ_PACKED_DESC_F_AVAIL);
    }

    #[test]
    fn chained_descriptor_flag_is_reported() {
        let mem = test_mem();
        let mut vq = test_queue(&mem);
        post_desc(&mem, 0, 0x8000, 16, true);
        post_desc(&mem, 1, 0x9000, 512, false);

        let (_, head) = vq.get_next_avail().unwrap();
        assert!(head.has_next());
        let (_, tail) = vq.get_next_avail().unwrap();
        assert!(!tail.has_next());
    }

    #[test]
    fn driver_event_flags_roundtrip() {
        let mem = test_mem();
        let vq = test_queue(&mem);
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_ENABLE);
        assert_eq!(vq.driver_event_flags(), VRING_PACKED_EVENT_FLAG_ENABLE);
        vq.set_driver_event_flags(VRING_PACKED_EVENT_FLAG_DISABLE);
        assert_eq!(vq.driver_event_flags(), VRING_PACKED_EVENT_FLAG_DISABLE);
    }

    #[test]
    fn handle_avail_skips_disabled_queue() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountOps(AtomicUsize);
        impl VirtqOps for CountOps {
            fn enable_vq(&self, _vq: &Arc<Mutex<Virtq>>, _notify_addr: u64) {}
            fn complete_request(&self, _vq: &mut Virtq) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn notify_used(&self) {}
        }

        let mem = test_mem();
        let mut vq = test_queue(&mem);
        vq.info.enable = 0;
        let vq = Arc::new(Mutex::new(vq));
        let ops = CountOps(AtomicUsize::new(0));
        handle_avail(&vq, &ops);
        assert_eq!(ops.0.load(Ordering::SeqCst), 0);

        vq.lock().unwrap().info.enable = 1;
        handle_avail(&vq, &ops);
        assert_eq!(ops.0.load(Ordering::SeqCst), 1);
    }
}
