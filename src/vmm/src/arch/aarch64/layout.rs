// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest physical memory map.
//!
//! ```text
//!    0 -  64K  I/O ports (bridged onto the port bus)
//!   1M -  ~1M  GIC
//!  1GB -  2GB  PCI (config window, then MMIO)
//!  2GB -       DRAM
//! ```

/// Guest RAM starts at 2 GiB.
pub const RAM_BASE: u64 = 0x8000_0000;

pub const ARM_IOPORT_BASE: u64 = 0;
pub const ARM_IOPORT_SIZE: u64 = 1 << 16;

pub const ARM_GIC_DIST_BASE: u64 = 0x10_0000;
pub const ARM_GIC_DIST_SIZE: u64 = 0x1_0000;
pub const ARM_GIC_REDIST_BASE: u64 = ARM_GIC_DIST_BASE + ARM_GIC_DIST_SIZE;
pub const ARM_GIC_REDIST_SIZE: u64 = 0x2_0000;

pub const ARM_PCI_CFG_BASE: u64 = 0x4000_0000;
pub const ARM_PCI_CFG_SIZE: u64 = 1 << 16;
pub const ARM_PCI_MMIO_BASE: u64 = ARM_PCI_CFG_BASE + ARM_PCI_CFG_SIZE;
pub const ARM_PCI_MMIO_SIZE: u64 = RAM_BASE - ARM_PCI_MMIO_BASE;

/// 128 MiB for the kernel image.
pub const ARM_KERNEL_BASE: u64 = RAM_BASE;
pub const ARM_KERNEL_SIZE: u64 = 0x800_0000;

/// 128 MiB for the initrd.
pub const ARM_INITRD_BASE: u64 = ARM_KERNEL_BASE + ARM_KERNEL_SIZE;
pub const ARM_INITRD_SIZE: u64 = 0x800_0000;

/// The device tree is limited to 2 MiB.
/// Reference: https://docs.kernel.org/arm64/booting.html
pub const ARM_FDT_BASE: u64 = ARM_INITRD_BASE + ARM_INITRD_SIZE;
pub const ARM_FDT_MAX_SIZE: u64 = 1 << 21;
