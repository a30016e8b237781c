// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Flattened device tree handed to the arm64 kernel.

use vm_fdt::FdtWriter;

use super::layout;
use super::CMDLINE;
use crate::devices::serial::{COM1_PORT_BASE, COM1_PORT_SIZE, SERIAL_IRQ};
use crate::devices::virtio::block::VIRTIO_BLK_IRQ;
use crate::{Error, Result, RAM_SIZE};

const FDT_PHANDLE_GIC: u32 = 1;

/// GIC interrupt specifier types and trigger modes.
const IRQ_TYPE_SPI: u32 = 0;
const IRQ_TYPE_PPI: u32 = 1;
const IRQ_EDGE_TRIGGER: u32 = 1;
const IRQ_LEVEL_TRIGGER: u32 = 4;

/// PCI address-space code for 32-bit MMIO in `ranges`.
const FDT_PCI_MMIO_SPACE: u32 = 0x0200_0000;

fn u64_cells(value: u64) -> [u32; 2] {
    [(value >> 32) as u32, value as u32]
}

/// Build the device tree: root, /chosen, /memory, /cpus, the arch timer,
/// the GIC, the UART and the PCI host with an interrupt map for the
/// virtio-blk slot.
pub fn generate(
    gic_is_v3: bool,
    initrd_size: u64,
    blk_dev_num: Option<u16>,
    mpidr: u64,
) -> Result<Vec<u8>> {
    let mut fdt = FdtWriter::new().map_err(Error::Fdt)?;

    let root = fdt.begin_node("").map_err(Error::Fdt)?;
    fdt.property_u32("#address-cells", 0x2).map_err(Error::Fdt)?;
    fdt.property_u32("#size-cells", 0x2).map_err(Error::Fdt)?;
    fdt.property_u32("interrupt-parent", FDT_PHANDLE_GIC)
        .map_err(Error::Fdt)?;
    fdt.property_string("compatible", "linux,dummy-virt")
        .map_err(Error::Fdt)?;

    let chosen = fdt.begin_node("chosen").map_err(Error::Fdt)?;
    fdt.property_string("bootargs", CMDLINE).map_err(Error::Fdt)?;
    fdt.property_string("stdout-path", "/uart").map_err(Error::Fdt)?;
    if initrd_size > 0 {
        fdt.property_u64("linux,initrd-start", layout::ARM_INITRD_BASE)
            .map_err(Error::Fdt)?;
        fdt.property_u64("linux,initrd-end", layout::ARM_INITRD_BASE + initrd_size)
            .map_err(Error::Fdt)?;
    }
    fdt.end_node(chosen).map_err(Error::Fdt)?;

    let memory = fdt.begin_node("memory").map_err(Error::Fdt)?;
    fdt.property_string("device_type", "memory").map_err(Error::Fdt)?;
    fdt.property_array_u64("reg", &[layout::RAM_BASE, RAM_SIZE as u64])
        .map_err(Error::Fdt)?;
    fdt.end_node(memory).map_err(Error::Fdt)?;

    let cpus = fdt.begin_node("cpus").map_err(Error::Fdt)?;
    fdt.property_u32("#address-cells", 0x1).map_err(Error::Fdt)?;
    fdt.property_u32("#size-cells", 0x0).map_err(Error::Fdt)?;
    let cpu = fdt.begin_node("cpu").map_err(Error::Fdt)?;
    fdt.property_u32("reg", mpidr as u32).map_err(Error::Fdt)?;
    fdt.property_string("device_type", "cpu").map_err(Error::Fdt)?;
    fdt.property_string("compatible", "arm,arm-v8").map_err(Error::Fdt)?;
    fdt.end_node(cpu).map_err(Error::Fdt)?;
    fdt.end_node(cpus).map_err(Error::Fdt)?;

    // Virtual timer PPIs, active-low level.
    let timer = fdt.begin_node("timer").map_err(Error::Fdt)?;
    fdt.property_string("compatible", "arm,armv8-timer")
        .map_err(Error::Fdt)?;
    fdt.property_array_u32(
        "interrupts",
        &[
            IRQ_TYPE_PPI, 13, 0xF08,
            IRQ_TYPE_PPI, 14, 0xF08,
            IRQ_TYPE_PPI, 11, 0xF08,
            IRQ_TYPE_PPI, 10, 0xF08,
        ],
    )
    .map_err(Error::Fdt)?;
    fdt.property_null("always-on").map_err(Error::Fdt)?;
    fdt.end_node(timer).map_err(Error::Fdt)?;

    let intr = fdt.begin_node("intr").map_err(Error::Fdt)?;
    if gic_is_v3 {
        fdt.property_string("compatible", "arm,gic-v3").map_err(Error::Fdt)?;
    } else {
        fdt.property_string("compatible", "arm,cortex-a15-gic")
            .map_err(Error::Fdt)?;
    }
    fdt.property_u32("#interrupt-cells", 3).map_err(Error::Fdt)?;
    fdt.property_null("interrupt-controller").map_err(Error::Fdt)?;
    fdt.property_array_u64(
        "reg",
        &[
            layout::ARM_GIC_DIST_BASE,
            layout::ARM_GIC_DIST_SIZE,
            layout::ARM_GIC_REDIST_BASE,
            layout::ARM_GIC_REDIST_SIZE,
        ],
    )
    .map_err(Error::Fdt)?;
    fdt.property_u32("phandle", FDT_PHANDLE_GIC).map_err(Error::Fdt)?;
    fdt.end_node(intr).map_err(Error::Fdt)?;

    let uart = fdt.begin_node("uart").map_err(Error::Fdt)?;
    fdt.property_string("compatible", "ns16550a").map_err(Error::Fdt)?;
    fdt.property_u32("clock-frequency", 1_843_200).map_err(Error::Fdt)?;
    fdt.property_array_u64(
        "reg",
        &[layout::ARM_IOPORT_BASE + COM1_PORT_BASE, COM1_PORT_SIZE],
    )
    .map_err(Error::Fdt)?;
    fdt.property_array_u32("interrupts", &[IRQ_TYPE_SPI, SERIAL_IRQ, IRQ_LEVEL_TRIGGER])
        .map_err(Error::Fdt)?;
    fdt.end_node(uart).map_err(Error::Fdt)?;

    let pci = fdt.begin_node("pci").map_err(Error::Fdt)?;
    fdt.property_string("device_type", "pci").map_err(Error::Fdt)?;
    fdt.property_u32("#address-cells", 3).map_err(Error::Fdt)?;
    fdt.property_u32("#size-cells", 2).map_err(Error::Fdt)?;
    fdt.property_u32("#interrupt-cells", 1).map_err(Error::Fdt)?;
    fdt.property_string("compatible", "pci-host-cam-generic")
        .map_err(Error::Fdt)?;
    fdt.property_null("dma-coherent").map_err(Error::Fdt)?;
    fdt.property_array_u32("bus-range", &[0, 0]).map_err(Error::Fdt)?;
    fdt.property_array_u64(
        "reg",
        &[layout::ARM_PCI_CFG_BASE, layout::ARM_PCI_CFG_SIZE],
    )
    .map_err(Error::Fdt)?;
    // Only the MMIO window is mapped; I/O space stays behind the port
    // bridge.
    let mmio = u64_cells(layout::ARM_PCI_MMIO_BASE);
    let mmio_size = u64_cells(layout::ARM_PCI_MMIO_SIZE);
    fdt.property_array_u32(
        "ranges",
        &[
            FDT_PCI_MMIO_SPACE,
            mmio[0],
            mmio[1],
            mmio[0],
            mmio[1],
            mmio_size[0],
            mmio_size[1],
        ],
    )
    .map_err(Error::Fdt)?;
    if let Some(dev_num) = blk_dev_num {
        // <slot address> <INTA> -> <GIC SPI, edge>
        let slot_hi = (dev_num as u32) << 11;
        fdt.property_array_u32(
            "interrupt-map",
            &[
                slot_hi,
                0,
                0,
                1,
                FDT_PHANDLE_GIC,
                IRQ_TYPE_SPI,
                VIRTIO_BLK_IRQ,
                IRQ_EDGE_TRIGGER,
            ],
        )
        .map_err(Error::Fdt)?;
    }
    fdt.end_node(pci).map_err(Error::Fdt)?;

    fdt.end_node(root).map_err(Error::Fdt)?;
    fdt.finish().map_err(Error::Fdt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tree_fits_its_window_and_is_valid_fdt() {
        let blob = generate(true, 0x1000, Some(1), 0x80000000).unwrap();
        assert!(blob.len() as u64 <= layout::ARM_FDT_MAX_SIZE);
        // FDT magic, big endian.
        assert_eq!(&blob[..4], &[0xD0, 0x0D, 0xFE, 0xED]);
    }

    #[test]
    fn tree_without_disk_omits_the_interrupt_map() {
        let with = generate(true, 0, Some(0), 0).unwrap();
        let without = generate(true, 0, None, 0).unwrap();
        assert!(with.len() > without.len());
    }
}
