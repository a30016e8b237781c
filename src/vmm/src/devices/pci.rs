// SPDX-License-Identifier: Apache-2.0

//! PCI host bridge and per-device configuration-space machinery.
//!
//! The root keeps a latched config-address register (the x86 `0xCF8` port) and
//! an internal bus indexed by config-address values. Each device contributes a
//! 256-byte config-space range on that internal bus; its BARs are registered
//! on the platform I/O or MMIO bus only while the matching COMMAND enable bit
//! is set and the BAR holds a non-zero base.

use std::sync::{Arc, Mutex};

use crate::bus::{Bus, BusDevice};
use crate::devices::{Error, Result};

pub const PCI_CFG_SPACE_SIZE: usize = 256;
pub const PCI_STD_NUM_BARS: usize = 6;

pub const PCI_CONFIG_ADDR_PORT: u64 = 0xCF8;
pub const PCI_CONFIG_DATA_PORT: u64 = 0xCFC;

// Configuration-space register offsets.
pub const PCI_VENDOR_ID: usize = 0x00;
pub const PCI_DEVICE_ID: usize = 0x02;
pub const PCI_COMMAND: usize = 0x04;
pub const PCI_STATUS: usize = 0x06;
pub const PCI_CLASS_REVISION: usize = 0x08;
pub const PCI_HEADER_TYPE: usize = 0x0E;
pub const PCI_BASE_ADDRESS_0: usize = 0x10;
pub const PCI_BASE_ADDRESS_5: usize = 0x24;
pub const PCI_ROM_ADDRESS: usize = 0x30;
pub const PCI_CAPABILITY_LIST: usize = 0x34;
pub const PCI_INTERRUPT_LINE: usize = 0x3C;
pub const PCI_INTERRUPT_PIN: usize = 0x3D;

pub const PCI_COMMAND_IO: u16 = 0x1;
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
pub const PCI_STATUS_INTERRUPT: u16 = 0x08;
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;
pub const PCI_HEADER_TYPE_NORMAL: u8 = 0x00;

const PCI_BUS_DEVICES: u16 = 32;

/// Config-address-register layout:
/// `enable(1) | reserved(7) | bus(8) | dev(5) | func(3) | reg(6) | off(2)`.
const CONFIG_ENABLE: u32 = 1 << 31;
const CONFIG_DEV_SHIFT: u32 = 11;

/// Address of a device's configuration range on the internal PCI bus.
pub fn config_space_base(dev_num: u16) -> u64 {
    (CONFIG_ENABLE | ((dev_num as u32) << CONFIG_DEV_SHIFT)) as u64
}

pub fn bar_offset(bar: usize) -> usize {
    PCI_BASE_ADDRESS_0 + (bar << 2)
}

#[derive(Default)]
struct PciBar {
    size: u32,
    is_io: bool,
    active: bool,
    /// Base the space range is (or would be) registered at, type bits masked.
    base: u64,
    handler: Option<Arc<dyn BusDevice>>,
}

/// One device's configuration space plus its BAR activation state.
pub struct PciConfig {
    space: [u8; PCI_CFG_SPACE_SIZE],
    bars: [PciBar; PCI_STD_NUM_BARS],
    io_bus: Bus,
    mmio_bus: Bus,
}

impl PciConfig {
    pub fn new(io_bus: Bus, mmio_bus: Bus) -> Self {
        PciConfig {
            space: [0; PCI_CFG_SPACE_SIZE],
            bars: Default::default(),
            io_bus,
            mmio_bus,
        }
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.space[offset..offset + 2].try_into().unwrap())
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.space[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.space[offset] = value;
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.space[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.space[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Declare a BAR. `size` must be a power of two; the space range is not
    /// put on any bus until the guest programs a base and enables the space
    /// type in COMMAND.
    pub fn set_bar(
        &mut self,
        bar: usize,
        size: u32,
        is_io: bool,
        handler: Arc<dyn BusDevice>,
    ) -> Result<()> {
        if !size.is_power_of_two() {
            return Err(Error::BarSize(size));
        }
        self.write_u32(bar_offset(bar), is_io as u32);
        self.bars[bar] = PciBar {
            size,
            is_io,
            active: false,
            base: 0,
            handler: Some(handler),
        };
        Ok(())
    }

    /// Current guest-programmed base of a BAR, type bits masked.
    pub fn bar_base(&self, bar: usize) -> u64 {
        let size = self.bars[bar].size;
        (self.read_u32(bar_offset(bar)) & !(size.wrapping_sub(1))) as u64
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) {
        let offset = offset as usize;
        if offset + data.len() > PCI_CFG_SPACE_SIZE {
            return;
        }
        data.copy_from_slice(&self.space[offset..offset + data.len()]);
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if offset + data.len() > PCI_CFG_SPACE_SIZE {
            return;
        }
        self.space[offset..offset + data.len()].copy_from_slice(data);

        if offset == PCI_COMMAND {
            self.evaluate_bars();
        } else if (PCI_BASE_ADDRESS_0..=PCI_BASE_ADDRESS_5).contains(&offset) {
            self.rewrite_bar((offset - PCI_BASE_ADDRESS_0) >> 2);
        } else if offset == PCI_ROM_ADDRESS {
            // No expansion ROM.
            self.write_u32(PCI_ROM_ADDRESS, 0);
        }
        // Writes into the capability list area are stored with no side
        // effect.
    }

    fn bus_for(&self, bar: usize) -> Bus {
        if self.bars[bar].is_io {
            self.io_bus.clone()
        } else {
            self.mmio_bus.clone()
        }
    }

    /// COMMAND changed: (de)register every BAR space range to match the
    /// enable bits and programmed bases.
    fn evaluate_bars(&mut self) {
        let command = self.read_u16(PCI_COMMAND);
        for bar in 0..PCI_STD_NUM_BARS {
            if self.bars[bar].handler.is_none() {
                continue;
            }
            let enabled = if self.bars[bar].is_io {
                command & PCI_COMMAND_IO != 0
            } else {
                command & PCI_COMMAND_MEMORY != 0
            };
            let base = self.bar_base(bar);
            if enabled && base != 0 {
                self.activate_bar(bar, base);
            } else {
                self.deactivate_bar(bar);
            }
        }
    }

    /// BAR register written: mask the value to the BAR's alignment, put the
    /// space-type bit back, and move the space range if it is live.
    fn rewrite_bar(&mut self, bar: usize) {
        let size = self.bars[bar].size;
        let raw = self.read_u32(bar_offset(bar));
        let value = (raw & !(size.wrapping_sub(1))) | self.bars[bar].is_io as u32;
        self.write_u32(bar_offset(bar), value);

        if self.bars[bar].handler.is_none() {
            self.write_u32(bar_offset(bar), 0);
            return;
        }
        self.deactivate_bar(bar);
        self.evaluate_bars();
    }

    fn activate_bar(&mut self, bar: usize, base: u64) {
        if self.bars[bar].active && self.bars[bar].base == base {
            return;
        }
        if self.bars[bar].active {
            self.deactivate_bar(bar);
        }
        let handler = self.bars[bar].handler.as_ref().unwrap().clone();
        let size = self.bars[bar].size as u64;
        if self.bus_for(bar).register(base, size, handler).is_ok() {
            self.bars[bar].active = true;
            self.bars[bar].base = base;
        }
    }

    fn deactivate_bar(&mut self, bar: usize) {
        if !self.bars[bar].active {
            return;
        }
        let size = self.bars[bar].size as u64;
        let base = self.bars[bar].base;
        self.bus_for(bar).deregister(base, size);
        self.bars[bar].active = false;
        self.bars[bar].base = 0;
    }

    #[cfg(test)]
    pub fn bar_active(&self, bar: usize) -> bool {
        self.bars[bar].active
    }
}

/// The PCI host: latched address register plus the internal config bus.
pub struct PciRoot {
    addr: Mutex<u32>,
    pci_bus: Bus,
    dev_count: Mutex<u16>,
}

impl PciRoot {
    pub fn new() -> Arc<Self> {
        Arc::new(PciRoot {
            addr: Mutex::new(0),
            pci_bus: Bus::new(),
            dev_count: Mutex::new(0),
        })
    }

    /// Register the legacy `0xCF8`/`0xCFC` port pair (x86 host bridge).
    pub fn init_ports(self: &Arc<Self>, io_bus: &Bus) -> Result<()> {
        io_bus.register(PCI_CONFIG_ADDR_PORT, 4, Arc::new(AddressPort(self.clone())))?;
        io_bus.register(PCI_CONFIG_DATA_PORT, 4, Arc::new(DataPort(self.clone())))?;
        Ok(())
    }

    /// Register the memory-mapped configuration window (arm64 host bridge).
    /// Window offsets use the CAM layout, which matches the config-address
    /// register with the enable bit synthesized by the bridge.
    pub fn init_mmio_window(self: &Arc<Self>, mmio_bus: &Bus, base: u64, len: u64) -> Result<()> {
        mmio_bus.register(base, len, Arc::new(CamWindow(self.clone())))?;
        Ok(())
    }

    /// Attach a device's configuration handler to the next free slot on
    /// bus 0 and return the assigned device number.
    pub fn attach(&self, config: Arc<dyn BusDevice>) -> Result<u16> {
        let mut count = self.dev_count.lock().unwrap();
        if *count >= PCI_BUS_DEVICES {
            return Err(Error::PciSlots);
        }
        let dev_num = *count;
        self.pci_bus
            .register(config_space_base(dev_num), PCI_CFG_SPACE_SIZE as u64, config)?;
        *count += 1;
        Ok(dev_num)
    }
}

/// `0xCF8`: byte-granular access to the latched address register. Every
/// access leaves the two low register-offset bits cleared.
struct AddressPort(Arc<PciRoot>);

impl BusDevice for AddressPort {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        let mut addr = self.0.addr.lock().unwrap();
        let mut bytes = addr.to_le_bytes();
        let offset = offset as usize;
        if offset + data.len() > 4 {
            return;
        }
        if is_write {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        } else {
            data.copy_from_slice(&bytes[offset..offset + data.len()]);
        }
        *addr = u32::from_le_bytes(bytes) & !0x3;
    }
}

/// `0xCFC`: forwards onto the internal PCI bus at the latched address.
struct DataPort(Arc<PciRoot>);

impl BusDevice for DataPort {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        let addr = *self.0.addr.lock().unwrap() as u64 | offset;
        self.0.pci_bus.dispatch(data, is_write, addr);
    }
}

/// Memory-mapped configuration window used on arm64.
struct CamWindow(Arc<PciRoot>);

impl BusDevice for CamWindow {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        let addr = CONFIG_ENABLE as u64 | offset;
        self.0.pci_bus.dispatch(data, is_write, addr);
    }
}
