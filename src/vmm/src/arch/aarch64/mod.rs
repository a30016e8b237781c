// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! arm64 backend: vGIC (v3 with a v2 fallback), the Image boot protocol, a
//! generated device tree, and PCI through a memory-mapped config window.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use kvm_bindings::{
    kvm_create_device, kvm_device_attr, kvm_vcpu_init, kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V2,
    kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3, KVM_ARM_IRQ_NUM_MASK, KVM_ARM_IRQ_TYPE_SHIFT,
    KVM_ARM_IRQ_TYPE_SPI, KVM_DEV_ARM_VGIC_CTRL_INIT, KVM_DEV_ARM_VGIC_GRP_ADDR,
    KVM_DEV_ARM_VGIC_GRP_CTRL, KVM_REG_ARM64, KVM_REG_ARM_CORE, KVM_REG_SIZE_U64,
    KVM_VGIC_V2_ADDR_TYPE_CPU, KVM_VGIC_V2_ADDR_TYPE_DIST, KVM_VGIC_V3_ADDR_TYPE_DIST,
    KVM_VGIC_V3_ADDR_TYPE_REDIST,
};
use kvm_ioctls::{DeviceFd, Kvm, VcpuFd, VmFd};
use vm_memory::{Bytes, GuestAddress};

use crate::bus::{Bus, BusDevice};
use crate::devices::pci::PciRoot;
use crate::{Error, Result, VMM};

mod fdt;
pub mod layout;

pub use layout::RAM_BASE;

pub const CMDLINE: &str = "console=ttyS0";

/// Offset used when the image header predates the image_size field.
const LEGACY_TEXT_OFFSET: u64 = 0x80000;
const ARM64_IMAGE_MAGIC: u32 = 0x644D_5241; // "ARM\x64"

/// SPI interrupt IDs start at 32 on the GIC.
const ARM_GIC_SPI_BASE: u32 = 32;

pub struct ArchState {
    /// Keeps the in-kernel GIC device alive for the VM's lifetime.
    #[allow(dead_code)]
    gic: DeviceFd,
    gic_is_v3: bool,
    entry: u64,
    initrd_size: u64,
}

fn set_gic_addr(gic: &DeviceFd, attr: u64, addr: u64) -> Result<()> {
    let attr = kvm_device_attr {
        group: KVM_DEV_ARM_VGIC_GRP_ADDR,
        attr,
        addr: &addr as *const u64 as u64,
        flags: 0,
    };
    gic.set_device_attr(&attr).map_err(Error::KvmIoctl)
}

/// Create the in-kernel interrupt controller, preferring GICv3.
pub fn init(vm_fd: &VmFd) -> Result<ArchState> {
    let mut device = kvm_create_device {
        type_: kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
        fd: 0,
        flags: 0,
    };

    let (gic, gic_is_v3) = match vm_fd.create_device(&mut device) {
        Ok(gic) => (gic, true),
        Err(_) => {
            let mut device = kvm_create_device {
                type_: kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V2,
                fd: 0,
                flags: 0,
            };
            (vm_fd.create_device(&mut device).map_err(Error::KvmIoctl)?, false)
        }
    };

    if gic_is_v3 {
        set_gic_addr(&gic, KVM_VGIC_V3_ADDR_TYPE_DIST as u64, layout::ARM_GIC_DIST_BASE)?;
        set_gic_addr(
            &gic,
            KVM_VGIC_V3_ADDR_TYPE_REDIST as u64,
            layout::ARM_GIC_REDIST_BASE,
        )?;
    } else {
        set_gic_addr(&gic, KVM_VGIC_V2_ADDR_TYPE_DIST as u64, layout::ARM_GIC_DIST_BASE)?;
        set_gic_addr(
            &gic,
            KVM_VGIC_V2_ADDR_TYPE_CPU as u64,
            layout::ARM_GIC_REDIST_BASE,
        )?;
    }

    Ok(ArchState {
        gic,
        gic_is_v3,
        entry: 0,
        initrd_size: 0,
    })
}

/// Initialize the vCPU to the host's preferred target.
pub fn cpu_init(_kvm: &Kvm, vm_fd: &VmFd, vcpu_fd: &VcpuFd) -> Result<()> {
    let mut vcpu_init = kvm_vcpu_init::default();
    vm_fd
        .get_preferred_target(&mut vcpu_init)
        .map_err(Error::KvmIoctl)?;
    vcpu_fd.vcpu_init(&vcpu_init).map_err(Error::KvmIoctl)
}

/// Bridges the low 64 KiB of the physical address space onto the port bus,
/// where the serial device lives.
struct PortWindow {
    io_bus: Bus,
}

impl BusDevice for PortWindow {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        self.io_bus.dispatch(data, is_write, offset);
    }
}

/// Wire the platform bridges and finalize the GIC (which requires the vCPU
/// to exist).
pub fn init_platform_devices(
    state: &mut ArchState,
    io_bus: &Bus,
    mmio_bus: &Bus,
    pci_root: &Arc<PciRoot>,
) -> Result<()> {
    mmio_bus.register(
        layout::ARM_IOPORT_BASE,
        layout::ARM_IOPORT_SIZE,
        Arc::new(PortWindow {
            io_bus: io_bus.clone(),
        }),
    )
    .map_err(crate::devices::Error::Bus)?;

    pci_root.init_mmio_window(mmio_bus, layout::ARM_PCI_CFG_BASE, layout::ARM_PCI_CFG_SIZE)?;

    let init_attr = kvm_device_attr {
        group: KVM_DEV_ARM_VGIC_GRP_CTRL,
        attr: KVM_DEV_ARM_VGIC_CTRL_INIT as u64,
        addr: 0,
        flags: 0,
    };
    state.gic.set_device_attr(&init_attr).map_err(Error::KvmIoctl)?;

    Ok(())
}

/// Validate the arm64 Image header and copy the kernel to its load offset.
/// Reference: https://docs.kernel.org/arch/arm64/booting.html
pub fn load_image(vmm: &mut VMM, kernel_image: &mut File) -> Result<()> {
    let mut data = Vec::new();
    kernel_image.read_to_end(&mut data).map_err(Error::IO)?;
    if data.len() < 64 {
        return Err(Error::InvalidImage("image shorter than the arm64 header"));
    }

    let field_u64 =
        |off: usize| u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
    let text_offset = field_u64(8);
    let image_size = field_u64(16);
    let magic = u32::from_le_bytes(data[56..60].try_into().unwrap());
    if magic != ARM64_IMAGE_MAGIC {
        return Err(Error::InvalidImage("bad arm64 image magic"));
    }

    let offset = if image_size == 0 {
        LEGACY_TEXT_OFFSET
    } else {
        text_offset
    };
    if offset + data.len() as u64 >= layout::ARM_KERNEL_SIZE
        || offset + image_size >= layout::ARM_KERNEL_SIZE
    {
        return Err(Error::InvalidImage("image too large"));
    }

    vmm.guest_memory
        .write_slice(&data, GuestAddress(layout::ARM_KERNEL_BASE + offset))
        .map_err(Error::GuestMemory)?;
    vmm.arch.entry = layout::ARM_KERNEL_BASE + offset;
    Ok(())
}

/// The initrd sits at a fixed offset above the kernel window.
pub fn load_initrd(vmm: &mut VMM, initrd: &mut File) -> Result<()> {
    let mut data = Vec::new();
    initrd.read_to_end(&mut data).map_err(Error::IO)?;
    if data.len() as u64 > layout::ARM_INITRD_SIZE {
        return Err(Error::InitrdAddress);
    }

    vmm.guest_memory
        .write_slice(&data, GuestAddress(layout::ARM_INITRD_BASE))
        .map_err(Error::GuestMemory)?;
    vmm.arch.initrd_size = data.len() as u64;
    Ok(())
}

fn core_reg_id(offset: usize) -> u64 {
    // The kernel indexes core registers as if kvm_regs were a u32 array.
    KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE as u64 | (offset / 4) as u64
}

fn reg_x(index: usize) -> u64 {
    let base = std::mem::offset_of!(kvm_bindings::kvm_regs, regs)
        + std::mem::offset_of!(kvm_bindings::user_pt_regs, regs);
    core_reg_id(base + index * 8)
}

fn reg_pc() -> u64 {
    let offset = std::mem::offset_of!(kvm_bindings::kvm_regs, regs)
        + std::mem::offset_of!(kvm_bindings::user_pt_regs, pc);
    core_reg_id(offset)
}

const KVM_REG_ARM64_SYSREG: u64 = 0x0013 << 16;

fn arm64_sys_reg(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    KVM_REG_ARM64
        | KVM_REG_SIZE_U64
        | KVM_REG_ARM64_SYSREG
        | (op0 << 14)
        | (op1 << 11)
        | (crn << 7)
        | (crm << 3)
        | op2
}

const ARM_MPIDR_BITMASK: u64 = 0xFF_00FF_FFFF;

fn mpidr(vcpu_fd: &VcpuFd) -> Result<u64> {
    let reg = arm64_sys_reg(3, 0, 0, 0, 5);
    Ok(vcpu_fd.get_one_reg(reg).map_err(Error::KvmIoctl)? & ARM_MPIDR_BITMASK)
}

/// Generate the device tree and seed the boot registers per the arm64 boot
/// protocol: x0 = FDT, x1..x3 = 0, pc = kernel entry.
pub fn late_init(vmm: &mut VMM) -> Result<()> {
    if vmm.arch.entry == 0 {
        return Err(Error::InvalidImage("no kernel image loaded"));
    }

    let blob = fdt::generate(
        vmm.arch.gic_is_v3,
        vmm.arch.initrd_size,
        vmm.blk_dev_num,
        mpidr(&vmm.vcpu_fd)?,
    )?;
    if blob.len() as u64 > layout::ARM_FDT_MAX_SIZE {
        return Err(Error::InvalidImage("device tree exceeds its window"));
    }
    vmm.guest_memory
        .write_slice(&blob, GuestAddress(layout::ARM_FDT_BASE))
        .map_err(Error::GuestMemory)?;

    for index in 1..=3 {
        vmm.vcpu_fd
            .set_one_reg(reg_x(index), 0)
            .map_err(Error::KvmIoctl)?;
    }
    vmm.vcpu_fd
        .set_one_reg(reg_x(0), layout::ARM_FDT_BASE)
        .map_err(Error::KvmIoctl)?;
    vmm.vcpu_fd
        .set_one_reg(reg_pc(), vmm.arch.entry)
        .map_err(Error::KvmIoctl)?;
    Ok(())
}

/// Inject a level on an SPI line.
pub fn irq_line(vm_fd: &VmFd, irq: u32, level: bool) -> std::result::Result<(), kvm_ioctls::Error> {
    let irq_field = (KVM_ARM_IRQ_TYPE_SPI << KVM_ARM_IRQ_TYPE_SHIFT)
        | ((irq + ARM_GIC_SPI_BASE) & KVM_ARM_IRQ_NUM_MASK);
    vm_fd.set_irq_line(irq_field, level)
}
