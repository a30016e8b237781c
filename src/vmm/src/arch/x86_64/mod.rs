// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! x86-64 backend: in-kernel IRQ chip and PIT, flat protected-mode boot,
//! bzImage loading with Linux boot-protocol parameters, PCI through the
//! legacy port pair.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use kvm_bindings::{kvm_msr_entry, kvm_pit_config, Msrs, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use linux_loader::cmdline::Cmdline;
use linux_loader::configurator::linux::LinuxBootConfigurator;
use linux_loader::configurator::{BootConfigurator, BootParams};
use linux_loader::loader::bootparam::boot_params;
use linux_loader::loader::bzimage::BzImage;
use linux_loader::loader::KernelLoader;
use vm_memory::{Bytes, GuestAddress};
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::bus::Bus;
use crate::devices::pci::PciRoot;
use crate::{Error, Result, RAM_SIZE, VMM};

/// Guest RAM starts at physical zero.
pub const RAM_BASE: u64 = 0;

pub const CMDLINE: &str = "console=ttyS0 pci=conf1";

/// Address of the zeropage, where Linux kernel boot parameters are written.
const ZEROPG_START: u64 = 0x10000;
/// Address where the kernel command line is written.
const CMDLINE_START: u64 = 0x20000;
/// Protected-mode kernel load address.
const HIMEM_START: u64 = 0x0010_0000; // 1 MB

// x86_64 boot constants. See https://www.kernel.org/doc/Documentation/x86/boot.txt for the full
// documentation.
const KERNEL_LOADER_OTHER: u8 = 0xFF;
const KERNEL_LOADFLAG_LOADED_HIGH: u8 = 0x01;
const KERNEL_LOADFLAG_KEEP_SEGMENTS: u8 = 0x40;
const KERNEL_LOADFLAG_CAN_USE_HEAP: u8 = 0x80;
const KERNEL_HEAP_END: u16 = 0xFE00;
const KERNEL_VID_MODE_VGA: u16 = 0xFFFF;

/// The legacy VGA/BIOS hole: RAM is reported around it.
const ISA_START_ADDRESS: u64 = 0x000A_0000;
const ISA_END_ADDRESS: u64 = 0x0010_0000;
// RAM memory type in the E820 table.
const E820_RAM: u32 = 1;

const TSS_ADDRESS: usize = 0xFFFF_D000;
const IDENTITY_MAP_ADDRESS: u64 = 0xFFFF_C000;

// KVM paravirt CPUID leaves (linux/kvm_para.h).
const KVM_CPUID_SIGNATURE: u32 = 0x4000_0000;
const KVM_CPUID_FEATURES: u32 = 0x4000_0001;

const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01A0;
const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 0x1;

const KVMIO: ::std::os::raw::c_uint = 0xAE;
// Not wrapped by the kvm-ioctls version this crate pins.
ioctl_iow_nr!(KVM_SET_IDENTITY_MAP_ADDR, KVMIO, 0x48, u64);

/// x86 keeps the boot parameters host-side until `late_init` writes the
/// zeropage, so the initrd loader can patch them in between.
#[derive(Default)]
pub struct ArchState {
    boot: Option<boot_params>,
}

/// IRQ chip, PIT and the magic pages KVM needs carved out of the guest
/// address space. Must run before the first vCPU exists.
pub fn init(vm_fd: &VmFd) -> Result<ArchState> {
    vm_fd.set_tss_address(TSS_ADDRESS).map_err(Error::KvmIoctl)?;

    let addr: u64 = IDENTITY_MAP_ADDRESS;
    // Safe: the ioctl only reads the address word.
    let ret = unsafe { ioctl_with_ref(vm_fd, KVM_SET_IDENTITY_MAP_ADDR(), &addr) };
    if ret < 0 {
        return Err(Error::KvmIoctl(kvm_ioctls::Error::last()));
    }

    vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;
    vm_fd
        .create_pit2(kvm_pit_config::default())
        .map_err(Error::KvmIoctl)?;

    Ok(ArchState::default())
}

/// Seed the vCPU: flat protected mode without paging, entry at the
/// protected-mode kernel with RSI pointing at the zeropage.
pub fn cpu_init(kvm: &Kvm, _vm_fd: &VmFd, vcpu_fd: &VcpuFd) -> Result<()> {
    let mut sregs = vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;
    for seg in [
        &mut sregs.cs,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
        &mut sregs.ss,
    ] {
        seg.base = 0;
        seg.limit = !0;
        seg.g = 1;
    }
    sregs.cs.db = 1;
    sregs.ss.db = 1;
    // Protected mode.
    sregs.cr0 |= 0x1;
    vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)?;

    let mut regs = vcpu_fd.get_regs().map_err(Error::KvmIoctl)?;
    regs.rflags = 0x2;
    regs.rip = HIMEM_START;
    // Must point to the boot parameters per the Linux x86 boot ABI.
    regs.rsi = ZEROPG_START;
    vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)?;

    // Advertise the KVM paravirt feature leaf under the hypervisor
    // signature.
    let mut cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(Error::KvmIoctl)?;
    for entry in cpuid.as_mut_slice().iter_mut() {
        if entry.function == KVM_CPUID_SIGNATURE {
            entry.eax = KVM_CPUID_FEATURES;
            entry.ebx = 0x4b4d564b; // KVMK
            entry.ecx = 0x564b4d56; // VMKV
            entry.edx = 0x4d; // M
        }
    }
    vcpu_fd.set_cpuid2(&cpuid).map_err(Error::KvmIoctl)?;

    let msrs = Msrs::from_entries(&[kvm_msr_entry {
        index: MSR_IA32_MISC_ENABLE,
        data: MSR_IA32_MISC_ENABLE_FAST_STRING,
        ..Default::default()
    }])
    .unwrap();
    vcpu_fd.set_msrs(&msrs).map_err(Error::KvmIoctl)?;

    Ok(())
}

/// The PCI host bridge answers on the legacy `0xCF8`/`0xCFC` port pair.
pub fn init_platform_devices(
    _state: &mut ArchState,
    io_bus: &Bus,
    _mmio_bus: &Bus,
    pci_root: &std::sync::Arc<PciRoot>,
) -> Result<()> {
    pci_root.init_ports(io_bus)?;
    Ok(())
}

fn add_e820_entry(params: &mut boot_params, addr: u64, size: u64, mem_type: u32) {
    let idx = params.e820_entries as usize;
    params.e820_table[idx].addr = addr;
    params.e820_table[idx].size = size;
    params.e820_table[idx].type_ = mem_type;
    params.e820_entries += 1;
}

/// Load a bzImage at 1 MiB and assemble its boot parameters: command line,
/// loader flags, heap end, and an E820 map with RAM on both sides of the
/// ISA hole.
pub fn load_image(vmm: &mut VMM, kernel_image: &mut File) -> Result<()> {
    let load_result = BzImage::load(
        &vmm.guest_memory,
        Some(GuestAddress(HIMEM_START)),
        kernel_image,
        None,
    )
    .map_err(Error::KernelLoad)?;
    let setup_header = load_result
        .setup_header
        .ok_or(Error::InvalidImage("missing bzImage setup header"))?;

    let mut params = boot_params::default();
    params.hdr = setup_header;
    params.hdr.vid_mode = KERNEL_VID_MODE_VGA;
    params.hdr.type_of_loader = KERNEL_LOADER_OTHER;
    params.hdr.loadflags |= KERNEL_LOADFLAG_CAN_USE_HEAP
        | KERNEL_LOADFLAG_LOADED_HIGH
        | KERNEL_LOADFLAG_KEEP_SEGMENTS;
    params.hdr.heap_end_ptr = KERNEL_HEAP_END;
    params.hdr.ext_loader_ver = 0;
    params.hdr.cmd_line_ptr = CMDLINE_START as u32;
    params.hdr.cmdline_size = CMDLINE.len() as u32 + 1;

    // Usable RAM around the ISA hole, so the initrd has somewhere to go.
    add_e820_entry(&mut params, 0, ISA_START_ADDRESS - 1, E820_RAM);
    add_e820_entry(
        &mut params,
        ISA_END_ADDRESS,
        RAM_SIZE as u64 - ISA_END_ADDRESS,
        E820_RAM,
    );

    let mut cmdline = Cmdline::new(CMDLINE.len() + 1);
    cmdline.insert_str(CMDLINE).map_err(Error::Cmdline)?;
    linux_loader::loader::load_cmdline(
        &vmm.guest_memory,
        GuestAddress(CMDLINE_START),
        &cmdline,
    )
    .map_err(Error::KernelLoad)?;

    vmm.arch.boot = Some(params);
    Ok(())
}

/// Highest 1 MiB-aligned address at or below `addr_max` where `size` bytes
/// still fit under the top of RAM; below 1 MiB there is nowhere left.
fn initrd_load_addr(addr_max: u64, ram_size: u64, size: u64) -> Result<u64> {
    let mut addr = addr_max & !0xFFFFF;
    loop {
        if addr < 0x10_0000 {
            return Err(Error::InitrdAddress);
        }
        if addr < ram_size.saturating_sub(size) {
            return Ok(addr);
        }
        addr -= 0x10_0000;
    }
}

pub fn load_initrd(vmm: &mut VMM, initrd: &mut File) -> Result<()> {
    let size = initrd
        .seek(SeekFrom::End(0))
        .and_then(|size| initrd.seek(SeekFrom::Start(0)).map(|_| size))
        .map_err(Error::IO)?;

    let boot = vmm
        .arch
        .boot
        .as_mut()
        .ok_or(Error::InvalidImage("initrd loaded before the kernel"))?;
    let addr = initrd_load_addr(boot.hdr.initrd_addr_max as u64, RAM_SIZE as u64, size)?;

    vmm.guest_memory
        .read_from(GuestAddress(addr), initrd, size as usize)
        .map_err(Error::GuestMemory)?;

    boot.hdr.ramdisk_image = addr as u32;
    boot.hdr.ramdisk_size = size as u32;
    Ok(())
}

/// Commit the boot parameters to the zeropage.
pub fn late_init(vmm: &mut VMM) -> Result<()> {
    let params = vmm
        .arch
        .boot
        .ok_or(Error::InvalidImage("no kernel image loaded"))?;
    LinuxBootConfigurator::write_bootparams::<vm_memory::GuestMemoryMmap>(
        &BootParams::new::<boot_params>(&params, GuestAddress(ZEROPG_START)),
        &vmm.guest_memory,
    )
    .map_err(Error::BootConfigure)
}

/// Drive a GSI on the in-kernel chip.
pub fn irq_line(vm_fd: &VmFd, irq: u32, level: bool) -> std::result::Result<(), kvm_ioctls::Error> {
    vm_fd.set_irq_line(irq, level)
}
