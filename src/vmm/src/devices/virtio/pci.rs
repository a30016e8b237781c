// SPDX-License-Identifier: Apache-2.0

//! Virtio-over-PCI transport (virtio 1.1 §4.1), packed-ring only.
//!
//! BAR0 exposes the common configuration, ISR, notify and device-specific
//! regions at fixed offsets; a five-entry vendor capability list in PCI
//! configuration space advertises them to the guest.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use vm_memory::ByteValued;

use super::queue::{handle_avail, Virtq, VirtqInfo};
use super::VirtqOps;
use crate::bus::{Bus, BusDevice};
use crate::devices::pci::{
    PciConfig, PciRoot, PCI_CAPABILITY_LIST, PCI_CLASS_REVISION, PCI_DEVICE_ID, PCI_HEADER_TYPE,
    PCI_HEADER_TYPE_NORMAL, PCI_INTERRUPT_LINE, PCI_INTERRUPT_PIN, PCI_STATUS,
    PCI_STATUS_CAP_LIST, PCI_STATUS_INTERRUPT, PCI_VENDOR_ID,
};
use crate::devices::Result;

use super::VIRTIO_PCI_VENDOR_ID;

/// BAR0 region layout.
const COMMON_CFG_OFFSET: u64 = 0;
const COMMON_CFG_LEN: u64 = 56;
const ISR_OFFSET: u64 = 56;
const ISR_LEN: u64 = 4;
const NOTIFY_OFFSET: u64 = 60;
const NOTIFY_LEN: u64 = 4;
const DEV_CFG_OFFSET: u64 = 64;
pub const BAR0_SIZE: u32 = 0x100;

/// Common-configuration register offsets (virtio 1.1 §4.1.4.3).
const COMMON_DFSELECT: u64 = 0;
const COMMON_GFSELECT: u64 = 8;
const COMMON_GF: u64 = 12;
const COMMON_STATUS: u64 = 20;
const COMMON_Q_SELECT: u64 = 22;
const COMMON_Q_SIZE: u64 = 24;
const COMMON_Q_ENABLE: u64 = 28;
const COMMON_Q_USEDHI: u64 = 52;

/// Vendor-specific capability ids (cfg_type).
const CAP_COMMON_CFG: u8 = 1;
const CAP_NOTIFY_CFG: u8 = 2;
const CAP_ISR_CFG: u8 = 3;
const CAP_DEVICE_CFG: u8 = 4;
const CAP_PCI_CFG: u8 = 5;

const PCI_CAP_ID_VNDR: u8 = 0x09;
const CAP_LIST_START: usize = 0x40;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct CommonCfg {
    device_feature_select: u32,
    device_feature: u32,
    guest_feature_select: u32,
    guest_feature: u32,
    msix_config: u16,
    num_queues: u16,
    device_status: u8,
    config_generation: u8,
    queue_select: u16,
    /// The `queue_size..queue_device` window; selects mirror the chosen
    /// queue's info here for the guest to read back.
    queue: VirtqInfo,
}

// Safe: plain-old-data with no padding.
unsafe impl ByteValued for CommonCfg {}

struct TransportState {
    common: CommonCfg,
    notify: [u8; NOTIFY_LEN as usize],
    dev_cfg: Vec<u8>,
    guest_feature: u64,
}

/// Static identity of one virtio PCI function.
pub struct VirtioDeviceInfo {
    pub device_id: u16,
    pub class: u32,
    pub irq: u32,
    pub device_feature: u64,
    pub notify_off_multiplier: u32,
}

/// Deferred side effects computed under the state lock, run after it drops
/// (queue enabling takes the PCI lock, notification takes the queue lock).
enum Action {
    None,
    QueueEnable(u16),
    QueueDisable(u16),
    Notify(u16),
}

pub struct VirtioPciDev {
    pci: Mutex<PciConfig>,
    state: Mutex<TransportState>,
    isr: Arc<AtomicU8>,
    queues: Vec<Arc<Mutex<Virtq>>>,
    ops: Vec<Arc<dyn VirtqOps>>,
    device_feature: u64,
    notify_off_multiplier: u32,
}

impl VirtioPciDev {
    /// Build the PCI function, wire BAR0 and the capability list, and attach
    /// it to the next free slot on bus 0. Returns the assigned device
    /// number.
    pub fn new(
        info: VirtioDeviceInfo,
        pci_root: &Arc<PciRoot>,
        io_bus: &Bus,
        mmio_bus: &Bus,
        queues: Vec<Arc<Mutex<Virtq>>>,
        ops: Vec<Arc<dyn VirtqOps>>,
        isr: Arc<AtomicU8>,
        dev_cfg: Vec<u8>,
    ) -> Result<(Arc<Self>, u16)> {
        let num_queues = queues.len() as u16;
        let dev = Arc::new(VirtioPciDev {
            pci: Mutex::new(PciConfig::new(io_bus.clone(), mmio_bus.clone())),
            state: Mutex::new(TransportState {
                common: CommonCfg {
                    num_queues,
                    ..Default::default()
                },
                notify: [0; NOTIFY_LEN as usize],
                dev_cfg,
                guest_feature: 0,
            }),
            isr,
            queues,
            ops,
            device_feature: info.device_feature,
            notify_off_multiplier: info.notify_off_multiplier,
        });

        {
            let mut pci = dev.pci.lock().unwrap();
            pci.write_u16(PCI_VENDOR_ID, VIRTIO_PCI_VENDOR_ID);
            pci.write_u16(PCI_DEVICE_ID, info.device_id);
            pci.write_u32(PCI_CLASS_REVISION, info.class << 8);
            pci.write_u8(PCI_HEADER_TYPE, PCI_HEADER_TYPE_NORMAL);
            pci.write_u16(PCI_STATUS, PCI_STATUS_CAP_LIST | PCI_STATUS_INTERRUPT);
            pci.write_u8(PCI_CAPABILITY_LIST, CAP_LIST_START as u8);
            pci.write_u8(PCI_INTERRUPT_PIN, 1);
            pci.write_u8(PCI_INTERRUPT_LINE, info.irq as u8);
            pci.set_bar(0, BAR0_SIZE, false, Arc::new(BarSpace(dev.clone())))?;
            Self::write_caps(
                &mut pci,
                info.notify_off_multiplier,
                dev.state.lock().unwrap().dev_cfg.len() as u32,
            );
        }

        let dev_num = pci_root.attach(Arc::new(ConfigSpace(dev.clone())))?;
        Ok((dev, dev_num))
    }

    /// Lay the five vendor capabilities out back to back from 0x40. The
    /// notify and PCI-cfg entries carry an extra dword (the multiplier and
    /// the window data respectively).
    fn write_caps(pci: &mut PciConfig, multiplier: u32, dev_cfg_len: u32) {
        let entries: [(u8, u32, u32, Option<u32>); 5] = [
            (CAP_COMMON_CFG, COMMON_CFG_OFFSET as u32, COMMON_CFG_LEN as u32, None),
            (CAP_NOTIFY_CFG, NOTIFY_OFFSET as u32, NOTIFY_LEN as u32, Some(multiplier)),
            (CAP_ISR_CFG, ISR_OFFSET as u32, ISR_LEN as u32, None),
            (CAP_DEVICE_CFG, DEV_CFG_OFFSET as u32, dev_cfg_len, None),
            (CAP_PCI_CFG, 0, 0, Some(0)),
        ];

        let mut pos = CAP_LIST_START;
        for (cfg_type, offset, length, extra) in entries {
            let cap_len = 16 + if extra.is_some() { 4 } else { 0 };
            pci.write_u8(pos, PCI_CAP_ID_VNDR);
            pci.write_u8(pos + 1, (pos + cap_len) as u8);
            pci.write_u8(pos + 2, cap_len as u8);
            pci.write_u8(pos + 3, cfg_type);
            pci.write_u8(pos + 4, 0); // all regions live in BAR 0
            pci.write_u32(pos + 8, offset);
            pci.write_u32(pos + 12, length);
            if let Some(extra) = extra {
                pci.write_u32(pos + 16, extra);
            }
            pos += cap_len;
        }
    }

    /// Guest-visible kick address for a queue, derived from the programmed
    /// BAR0 base and the notify capability.
    pub fn notify_addr(&self, sel: u16) -> u64 {
        let base = self.pci.lock().unwrap().bar_base(0);
        let notify_off = self.queues[sel as usize].lock().unwrap().info.notify_off;
        base + NOTIFY_OFFSET + (self.notify_off_multiplier as u64) * notify_off as u64
    }

    pub fn guest_feature(&self) -> u64 {
        self.state.lock().unwrap().guest_feature
    }

    fn enable_vq(&self, sel: u16) {
        if sel as usize >= self.queues.len() {
            return;
        }
        let vq = &self.queues[sel as usize];
        {
            let mut q = vq.lock().unwrap();
            if q.enabled() {
                return;
            }
            q.info.enable = 1;
        }
        let notify_addr = self.notify_addr(sel);
        self.ops[sel as usize].enable_vq(vq, notify_addr);
    }

    fn space_write(&self, data: &[u8], offset: u64) {
        let action = {
            let mut st = self.state.lock().unwrap();
            if offset >= DEV_CFG_OFFSET {
                let off = (offset - DEV_CFG_OFFSET) as usize;
                let end = (off + data.len()).min(st.dev_cfg.len());
                if off < end {
                    let n = end - off;
                    st.dev_cfg[off..end].copy_from_slice(&data[..n]);
                }
                return;
            }

            // Mirror the bytes; the ISR word is read-only.
            for (i, byte) in data.iter().enumerate() {
                let off = offset + i as u64;
                if off < COMMON_CFG_LEN {
                    st.common.as_mut_slice()[off as usize] = *byte;
                } else if (NOTIFY_OFFSET..NOTIFY_OFFSET + NOTIFY_LEN).contains(&off) {
                    st.notify[(off - NOTIFY_OFFSET) as usize] = *byte;
                }
            }

            match offset {
                COMMON_DFSELECT => {
                    st.common.device_feature = match st.common.device_feature_select {
                        0 => self.device_feature as u32,
                        1 => (self.device_feature >> 32) as u32,
                        _ => 0,
                    };
                    Action::None
                }
                COMMON_GF => {
                    // Unadvertised bits are accepted but never honoured.
                    let word = st.common.guest_feature as u64;
                    match st.common.guest_feature_select {
                        0 => st.guest_feature |= word,
                        1 => st.guest_feature |= word << 32,
                        _ => {}
                    }
                    Action::None
                }
                COMMON_STATUS => {
                    if st.common.device_status == 0 {
                        // Device reset; the cleared status the guest reads
                        // back is the only state this transport carries.
                    }
                    Action::None
                }
                COMMON_Q_SELECT => {
                    let sel = st.common.queue_select;
                    st.common.queue = if sel < st.common.num_queues {
                        self.queues[sel as usize].lock().unwrap().info
                    } else {
                        VirtqInfo::default()
                    };
                    Action::None
                }
                COMMON_Q_ENABLE => {
                    let sel = st.common.queue_select;
                    if st.common.queue.enable != 0 {
                        Action::QueueEnable(sel)
                    } else {
                        Action::QueueDisable(sel)
                    }
                }
                COMMON_Q_SIZE..=COMMON_Q_USEDHI => {
                    let sel = st.common.queue_select;
                    if sel < st.common.num_queues {
                        let mut q = self.queues[sel as usize].lock().unwrap();
                        let info_off = (offset - COMMON_Q_SIZE) as usize;
                        let end = (info_off + data.len()).min(std::mem::size_of::<VirtqInfo>());
                        if info_off < end {
                            let n = end - info_off;
                            q.info.as_mut_slice()[info_off..end].copy_from_slice(&data[..n]);
                        }
                    }
                    Action::None
                }
                NOTIFY_OFFSET => {
                    let vqn = u16::from_le_bytes([st.notify[0], st.notify[1]]);
                    Action::Notify(vqn)
                }
                _ => Action::None,
            }
        };

        match action {
            Action::None => {}
            Action::QueueEnable(sel) => self.enable_vq(sel),
            // Queue teardown is not modelled; the worker parks on an empty
            // ring until reset.
            Action::QueueDisable(_) => {}
            Action::Notify(vqn) => {
                if (vqn as usize) < self.queues.len() {
                    handle_avail(&self.queues[vqn as usize], &*self.ops[vqn as usize]);
                }
            }
        }
    }

    fn space_read(&self, data: &mut [u8], offset: u64) {
        if offset == ISR_OFFSET {
            // Reading the ISR returns and clears it.
            let value = self.isr.swap(0, Ordering::AcqRel);
            let bytes = (value as u32).to_le_bytes();
            let n = data.len().min(4);
            data[..n].copy_from_slice(&bytes[..n]);
            return;
        }

        let st = self.state.lock().unwrap();
        if offset >= DEV_CFG_OFFSET {
            let off = (offset - DEV_CFG_OFFSET) as usize;
            let end = (off + data.len()).min(st.dev_cfg.len());
            if off < end {
                let n = end - off;
                data[..n].copy_from_slice(&st.dev_cfg[off..end]);
            }
            return;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            let off = offset + i as u64;
            *byte = if off < COMMON_CFG_LEN {
                st.common.as_slice()[off as usize]
            } else if (NOTIFY_OFFSET..NOTIFY_OFFSET + NOTIFY_LEN).contains(&off) {
                st.notify[(off - NOTIFY_OFFSET) as usize]
            } else {
                0
            };
        }
    }
}

/// BAR0 handler: the virtio register regions.
struct BarSpace(Arc<VirtioPciDev>);

impl BusDevice for BarSpace {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        if is_write {
            self.0.space_write(data, offset);
        } else {
            self.0.space_read(data, offset);
        }
    }
}

/// Configuration-space handler on the internal PCI bus.
struct ConfigSpace(Arc<VirtioPciDev>);

impl BusDevice for ConfigSpace {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        let mut pci = self.0.pci.lock().unwrap();
        if is_write {
            pci.write(offset, data);
        } else {
            pci.read(offset, data);
        }
    }
}
