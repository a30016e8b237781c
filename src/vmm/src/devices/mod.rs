// SPDX-License-Identifier: Apache-2.0

use std::io::Error as IoError;

use vmm_sys_util::eventfd::EventFd;

pub mod diskimg;
pub mod fifo;
pub mod pci;
pub mod serial;
pub mod tap;
pub mod virtio;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error related to devices and their host-side resources
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot register a device range on the bus")]
    Bus(#[from] crate::bus::Error),

    #[error("Failed to create an eventfd")]
    EventFd(#[source] IoError),

    #[error("Failed to wire a device interrupt or notification")]
    Plumbing(#[source] IoError),

    #[error("Failed to open /dev/net/tun")]
    OpenTun(#[source] IoError),

    #[error("Failed to communicate with device")]
    IoctlError(#[source] IoError),

    #[error("BAR size {0:#x} is not a power of two")]
    BarSize(u32),

    #[error("PCI bus 0 is full, no free device slot")]
    PciSlots,
}

/// Plumbing the VM core exposes to devices: synchronous line interrupts plus
/// the two eventfd-based fast paths. Devices hold this behind an `Arc` so
/// worker threads can inject without involving the vCPU thread.
pub trait VmNotify: Send + Sync {
    /// Drive a platform IRQ line to `level`.
    fn irq_line(&self, irq: u32, level: bool) -> std::io::Result<()>;

    /// Writing to `fd` injects `gsi` into the in-kernel interrupt controller.
    fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> std::io::Result<()>;

    /// A guest write to `addr` makes `fd` readable without a VM exit.
    fn register_ioeventfd(&self, fd: &EventFd, addr: u64) -> std::io::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records plumbing calls instead of reaching into KVM.
    #[derive(Default)]
    pub struct FakeVm {
        pub lines: Mutex<Vec<(u32, bool)>>,
        pub irqfds: Mutex<Vec<u32>>,
        pub ioeventfds: Mutex<Vec<u64>>,
    }

    impl VmNotify for FakeVm {
        fn irq_line(&self, irq: u32, level: bool) -> std::io::Result<()> {
            self.lines.lock().unwrap().push((irq, level));
            Ok(())
        }

        fn register_irqfd(&self, _fd: &EventFd, gsi: u32) -> std::io::Result<()> {
            self.irqfds.lock().unwrap().push(gsi);
            Ok(())
        }

        fn register_ioeventfd(&self, _fd: &EventFd, addr: u64) -> std::io::Result<()> {
            self.ioeventfds.lock().unwrap().push(addr);
            Ok(())
        }
    }
}
