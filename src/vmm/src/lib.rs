// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A minimal KVM-based virtual machine monitor: one vCPU, a flat gigabyte of
//! guest RAM, a 16550A console, and virtio-blk/virtio-net over PCI with
//! packed queues.

extern crate libc;

extern crate linux_loader;
extern crate vm_memory;

use std::fs::File;
use std::io;
use std::sync::Arc;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{error, info, warn};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

pub mod arch;
pub mod bus;
pub mod config;
pub mod devices;
pub mod epoll_context;

use bus::Bus;
use config::VMMConfig;
use devices::diskimg::DiskImg;
use devices::pci::PciRoot;
use devices::serial::Serial;
use devices::virtio::block::VirtioBlk;
use devices::virtio::net::VirtioNet;
use devices::VmNotify;

/// Guest physical memory size (1 GiB).
pub const RAM_SIZE: usize = 1 << 30;

/// VMM errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to write boot parameters to guest memory.
    #[error("Failed to write boot parameters to guest memory")]
    BootConfigure(#[source] linux_loader::configurator::Error),
    /// Error configuring the kernel command line.
    #[error("Failed to configure the kernel command line")]
    Cmdline(#[source] linux_loader::cmdline::Error),
    /// Failed to load kernel.
    #[error("Failed to load the kernel image")]
    KernelLoad(#[source] linux_loader::loader::Error),
    /// The image is not something this machine can boot.
    #[error("Invalid kernel image: {0}")]
    InvalidImage(&'static str),
    /// No suitable guest address for the initial RAM disk.
    #[error("Not enough memory for initrd")]
    InitrdAddress,
    /// I/O error.
    #[error("I/O error")]
    IO(#[source] io::Error),
    /// Error issuing an ioctl to KVM.
    #[error("Error issuing an ioctl to KVM")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    /// Memory error.
    #[error("Failed to set up guest memory")]
    Memory(#[source] vm_memory::Error),
    /// Failed to operate on guest memory.
    #[error("Failed to access guest memory")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),
    /// Device setup error.
    #[error("Failed to set up a device")]
    Device(#[from] devices::Error),
    /// The guest stopped in a way the exit loop does not understand.
    #[error("Unhandled VM exit: {0}")]
    UnhandledVmExit(String),
    /// Flattened device tree generation failed.
    #[cfg(target_arch = "aarch64")]
    #[error("Failed to generate the device tree")]
    Fdt(#[source] vm_fdt::Error),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

/// Device-facing plumbing backed by the KVM VM fd: level interrupts plus
/// irqfd/ioeventfd registration.
struct VmHandle {
    vm_fd: Arc<VmFd>,
}

fn kvm_to_io(e: kvm_ioctls::Error) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

impl VmNotify for VmHandle {
    fn irq_line(&self, irq: u32, level: bool) -> io::Result<()> {
        arch::irq_line(&self.vm_fd, irq, level).map_err(kvm_to_io)
    }

    fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> io::Result<()> {
        self.vm_fd.register_irqfd(fd, gsi).map_err(kvm_to_io)
    }

    fn register_ioeventfd(&self, fd: &EventFd, addr: u64) -> io::Result<()> {
        self.vm_fd
            .register_ioevent(fd, &kvm_ioctls::IoEventAddress::Mmio(addr), kvm_ioctls::NoDatamatch)
            .map_err(kvm_to_io)
    }
}

pub struct VMM {
    #[allow(dead_code)]
    kvm: Kvm,
    /// Canonical owner of the VM control fd; devices hold clones through
    /// their plumbing handle.
    #[allow(dead_code)]
    pub(crate) vm_fd: Arc<VmFd>,
    pub(crate) vcpu_fd: VcpuFd,
    pub(crate) guest_memory: GuestMemoryMmap,
    pub(crate) io_bus: Bus,
    pub(crate) mmio_bus: Bus,
    pub(crate) pci_root: Arc<PciRoot>,
    notify: Arc<dyn VmNotify>,
    serial: Arc<Serial>,
    net: Option<Arc<VirtioNet>>,
    blk: Option<Arc<VirtioBlk>>,
    pub(crate) blk_dev_num: Option<u16>,
    pub(crate) arch: arch::ArchState,
}

impl VMM {
    /// Create the VM: KVM handles, interrupt chip, guest memory, the vCPU,
    /// both buses and the platform devices (PCI host, serial console, and a
    /// network device when a TAP interface is available).
    pub fn new() -> Result<Self> {
        // Open /dev/kvm and get a file descriptor to it.
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;

        // Create a KVM VM object.
        // KVM returns a file descriptor to the VM object.
        let vm_fd = Arc::new(kvm.create_vm().map_err(Error::KvmIoctl)?);

        // The interrupt chip (and on x86 the PIT and the TSS/identity-map
        // slots) must exist before the first vCPU.
        let mut arch_state = arch::init(&vm_fd)?;

        let guest_memory =
            GuestMemoryMmap::from_ranges(&[(GuestAddress(arch::RAM_BASE), RAM_SIZE)])
                .map_err(Error::Memory)?;
        let host_addr = guest_memory
            .get_host_address(GuestAddress(arch::RAM_BASE))
            .map_err(Error::GuestMemory)?;
        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: arch::RAM_BASE,
            memory_size: RAM_SIZE as u64,
            userspace_addr: host_addr as u64,
        };
        // Safe because the region maps our own anonymous mapping, which
        // outlives the VM fd.
        unsafe {
            vm_fd
                .set_user_memory_region(region)
                .map_err(Error::KvmIoctl)?;
        }

        let vcpu_fd = vm_fd.create_vcpu(0).map_err(Error::KvmIoctl)?;
        arch::cpu_init(&kvm, &vm_fd, &vcpu_fd)?;

        let io_bus = Bus::new();
        let mmio_bus = Bus::new();
        let notify: Arc<dyn VmNotify> = Arc::new(VmHandle {
            vm_fd: vm_fd.clone(),
        });

        let pci_root = PciRoot::new();
        arch::init_platform_devices(&mut arch_state, &io_bus, &mmio_bus, &pci_root)?;

        let serial = Serial::new(notify.clone(), libc::STDIN_FILENO, libc::STDOUT_FILENO)?;
        serial.register(&io_bus)?;
        serial.start();

        // The NIC is opportunistic: a host without a usable TAP device still
        // boots, just without networking.
        let net = match VirtioNet::new(
            notify.clone(),
            guest_memory.clone(),
            &pci_root,
            &io_bus,
            &mmio_bus,
        ) {
            Ok(net) => {
                info!("virtio-net attached to host interface {}", net.tap_name());
                Some(net)
            }
            Err(e) => {
                warn!("running without a network device: {}", e);
                None
            }
        };

        Ok(VMM {
            kvm,
            vm_fd,
            vcpu_fd,
            guest_memory,
            io_bus,
            mmio_bus,
            pci_root,
            notify,
            serial,
            net,
            blk: None,
            blk_dev_num: None,
            arch: arch_state,
        })
    }

    /// Load the kernel, the optional initrd and the optional disk image,
    /// then let the arch backend finish boot state (device tree, boot
    /// registers, zero page).
    pub fn configure(&mut self, config: &VMMConfig) -> Result<()> {
        self.load_image(&config.kernel)?;
        if let Some(initrd) = &config.initrd {
            self.load_initrd(initrd)?;
        }
        if let Some(disk) = &config.disk {
            self.load_diskimg(disk)?;
        }
        arch::late_init(self)
    }

    pub fn load_image<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let mut file = File::open(path).map_err(Error::IO)?;
        arch::load_image(self, &mut file)
    }

    pub fn load_initrd<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let mut file = File::open(path).map_err(Error::IO)?;
        arch::load_initrd(self, &mut file)
    }

    /// Attach the disk as a virtio-blk PCI function.
    pub fn load_diskimg<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let disk = DiskImg::open(path).map_err(Error::IO)?;
        let (blk, dev_num) = VirtioBlk::new(
            self.notify.clone(),
            self.guest_memory.clone(),
            disk,
            &self.pci_root,
            &self.io_bus,
            &self.mmio_bus,
        )?;
        self.blk = Some(blk);
        self.blk_dev_num = Some(dev_num);
        Ok(())
    }

    /// Port I/O arrives as one buffer per exit; replay it onto the bus in
    /// port-sized pieces, advancing the cursor and the address together.
    /// String I/O is byte wide on every port this machine decodes.
    fn handle_io(&self, port: u16, data: &mut [u8], is_write: bool) {
        let chunk = if data.len() <= 4 { data.len() } else { 1 };
        let mut addr = port as u64;
        for piece in data.chunks_mut(chunk) {
            self.io_bus.dispatch(piece, is_write, addr);
            addr += chunk as u64;
        }
    }

    /// vCPU emulation loop.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.vcpu_fd.run() {
                Ok(exit_reason) => match exit_reason {
                    VcpuExit::IoIn(port, data) => self.handle_io(port, data, false),
                    VcpuExit::IoOut(port, data) => {
                        let mut buf = [0u8; 8];
                        let len = data.len().min(buf.len());
                        buf[..len].copy_from_slice(&data[..len]);
                        self.handle_io(port, &mut buf[..len], true);
                    }
                    VcpuExit::MmioRead(addr, data) => {
                        self.mmio_bus.dispatch(data, false, addr);
                    }
                    VcpuExit::MmioWrite(addr, data) => {
                        let mut buf = [0u8; 8];
                        let len = data.len().min(buf.len());
                        buf[..len].copy_from_slice(&data[..len]);
                        self.mmio_bus.dispatch(&mut buf[..len], true, addr);
                    }
                    // A signal kicked the vCPU out of guest mode; re-enter.
                    VcpuExit::Intr => {}
                    VcpuExit::Shutdown => {
                        println!("shutdown");
                        return Ok(());
                    }
                    other => {
                        error!("unhandled VM exit: {:?}", other);
                        return Err(Error::UnhandledVmExit(format!("{:?}", other)));
                    }
                },
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => continue,
                Err(e) => return Err(Error::KvmIoctl(e)),
            }
        }
    }

    /// Stop every device worker and join it. Each worker is woken once
    /// through its own eventfd; device fds close when the VMM drops.
    pub fn shutdown(&mut self) {
        self.serial.stop();
        if let Some(net) = &self.net {
            net.stop();
        }
        if let Some(blk) = &self.blk {
            blk.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::Bytes;

    #[test]
    fn guest_memory_translation_is_linear_and_bounded() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(arch::RAM_BASE), 0x20_0000)])
            .unwrap();

        let base = mem.get_host_address(GuestAddress(arch::RAM_BASE)).unwrap() as usize;
        for offset in [0u64, 1, 0x1000, 0x1F_FFFF] {
            let hva = mem
                .get_host_address(GuestAddress(arch::RAM_BASE + offset))
                .unwrap() as usize;
            assert_eq!(hva, base + offset as usize);
        }
        // One past the end fails.
        assert!(mem
            .get_host_address(GuestAddress(arch::RAM_BASE + 0x20_0000))
            .is_err());
        // Below the region base fails (meaningful on arm64 where RAM starts
        // at 2 GiB; on x86 there is no lower gap).
        if arch::RAM_BASE > 0 {
            assert!(mem.get_host_address(GuestAddress(0)).is_err());
        }
        // Writes land where reads find them.
        mem.write_obj(0xABu8, GuestAddress(arch::RAM_BASE + 0x1234)).unwrap();
        assert_eq!(mem.read_obj::<u8>(GuestAddress(arch::RAM_BASE + 0x1234)).unwrap(), 0xAB);
    }
}
