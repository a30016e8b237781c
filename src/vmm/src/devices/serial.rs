// SPDX-License-Identifier: Apache-2.0

//! NS16550A serial port (COM1) in FIFO mode.
//!
//! The register file lives under a mutex; the TX/RX FIFOs are lock-free so
//! interrupt-identification reads can sample fill levels without taking it.
//! A single worker thread moves bytes between the FIFOs and the host
//! terminal, woken through an eventfd whenever register state changes in a
//! way that may require I/O.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::bus::{Bus, BusDevice};
use crate::devices::fifo::Fifo;
use crate::devices::{Error, Result, VmNotify};
use crate::epoll_context::EpollContext;

pub const COM1_PORT_BASE: u64 = 0x3F8;
pub const COM1_PORT_SIZE: u64 = 8;
pub const SERIAL_IRQ: u32 = 4;

// Register offsets.
const UART_RX: u64 = 0; // also THR / DLL
const UART_IER: u64 = 1; // also DLM
const UART_IIR: u64 = 2; // also FCR
const UART_LCR: u64 = 3;
const UART_MCR: u64 = 4;
const UART_LSR: u64 = 5;
const UART_MSR: u64 = 6;
const UART_SCR: u64 = 7;

// Interrupt-enable bits; only the low four are honoured.
const UART_IER_RDI: u8 = 0x01;
const UART_IER_THRI: u8 = 0x02;
const UART_IER_RLSI: u8 = 0x04;
const UART_IER_MSI: u8 = 0x08;
const UART_IER_MASK: u8 = 0x0F;

// Interrupt-identification values, highest priority first.
const UART_IIR_NO_INT: u8 = 0x01;
const UART_IIR_RLSI: u8 = 0x06;
const UART_IIR_RDI: u8 = 0x04;
const UART_IIR_RX_TIMEOUT: u8 = 0x0C;
const UART_IIR_THRI: u8 = 0x02;
const UART_IIR_MSI: u8 = 0x00;
/// FIFOs-enabled marker ORed into every IIR read.
const UART_IIR_FIFO: u8 = 0xC0;

const UART_FCR_CLEAR_RCVR: u8 = 0x02;
const UART_FCR_CLEAR_XMIT: u8 = 0x04;
const UART_FCR_MASK: u8 = 0xC9;

const UART_LCR_DLAB: u8 = 0x80;

const UART_MCR_DTR: u8 = 0x01;
const UART_MCR_RTS: u8 = 0x02;
const UART_MCR_OUT1: u8 = 0x04;
const UART_MCR_OUT2: u8 = 0x08;
const UART_MCR_LOOP: u8 = 0x10;
const UART_MCR_MASK: u8 = 0x1F;

const UART_LSR_DR: u8 = 0x01;
const UART_LSR_OE: u8 = 0x02;
const UART_LSR_BI: u8 = 0x10;
const UART_LSR_THRE: u8 = 0x20;
const UART_LSR_TEMT: u8 = 0x40;
/// Error bits cleared by reading LSR.
const UART_LSR_ERR_BITS: u8 = 0x1E;

const UART_MSR_ANY_DELTA: u8 = 0x0F;
const UART_MSR_CTS: u8 = 0x10;
const UART_MSR_DSR: u8 = 0x20;
const UART_MSR_RI: u8 = 0x40;
const UART_MSR_DCD: u8 = 0x80;

/// Receive trigger levels selected by FCR bits 6..7 (64-byte FIFO mode).
const RX_TRIGGERS: [usize; 4] = [1, 16, 32, 56];

const TOKEN_EVFD: u64 = 0;
const TOKEN_STDIN: u64 = 1;
const TOKEN_STDOUT: u64 = 2;

struct Regs {
    dll: u8,
    dlm: u8,
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,
    /// A THR-empty interrupt is owed to the guest.
    thre_pending: bool,
    trigger: usize,
}

impl Default for Regs {
    fn default() -> Self {
        Regs {
            dll: 0,
            dlm: 0,
            ier: 0,
            fcr: 0,
            lcr: 0,
            mcr: UART_MCR_OUT2,
            lsr: UART_LSR_TEMT | UART_LSR_THRE,
            msr: UART_MSR_DCD | UART_MSR_DSR | UART_MSR_CTS,
            scr: 0,
            thre_pending: false,
            trigger: RX_TRIGGERS[0],
        }
    }
}

pub struct Serial {
    regs: Mutex<Regs>,
    rx: Fifo,
    tx: Fifo,
    evfd: EventFd,
    infd: RawFd,
    outfd: RawFd,
    vm: Arc<dyn VmNotify>,
    stopped: AtomicBool,
    /// While MCR.LOOP is held the worker stays off the FIFO host paths.
    loopback: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Serial {
    pub fn new(vm: Arc<dyn VmNotify>, infd: RawFd, outfd: RawFd) -> Result<Arc<Self>> {
        let evfd = EventFd::new(libc::EFD_NONBLOCK | libc::EFD_CLOEXEC).map_err(Error::EventFd)?;
        Ok(Arc::new(Serial {
            regs: Mutex::new(Regs::default()),
            rx: Fifo::new(),
            tx: Fifo::new(),
            evfd,
            infd,
            outfd,
            vm,
            stopped: AtomicBool::new(false),
            loopback: AtomicBool::new(false),
            worker: Mutex::new(None),
        }))
    }

    pub fn register(self: &Arc<Self>, bus: &Bus) -> Result<()> {
        bus.register(COM1_PORT_BASE, COM1_PORT_SIZE, self.clone())?;
        Ok(())
    }

    pub fn start(self: &Arc<Self>) {
        let dev = self.clone();
        let handle = std::thread::spawn(move || dev.run_worker());
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop and join the worker; a pending LOOP state cannot wedge shutdown
    /// because the loopback gate is advisory to the worker only.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let _ = self.evfd.write(1);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Highest-priority pending interrupt for the current state.
    fn current_iir(&self, regs: &Regs) -> u8 {
        let rx_level = self.rx.level();
        if regs.ier & UART_IER_RLSI != 0 && regs.lsr & UART_LSR_ERR_BITS != 0 {
            UART_IIR_RLSI
        } else if regs.ier & UART_IER_RDI != 0 && rx_level >= regs.trigger {
            UART_IIR_RDI
        } else if regs.ier & UART_IER_RDI != 0 && rx_level > 0 {
            UART_IIR_RX_TIMEOUT
        } else if regs.ier & UART_IER_THRI != 0 && regs.thre_pending {
            UART_IIR_THRI
        } else if regs.ier & UART_IER_MSI != 0 && regs.msr & UART_MSR_ANY_DELTA != 0 {
            UART_IIR_MSI
        } else {
            UART_IIR_NO_INT
        }
    }

    /// Drive the platform line to match the interrupt state.
    fn update_irq(&self, regs: &Regs) {
        let active = self.current_iir(regs) & UART_IIR_NO_INT == 0;
        if let Err(e) = self.vm.irq_line(SERIAL_IRQ, active) {
            error!("serial: failed to set the IRQ line: {}", e);
        }
    }

    fn reg_read(&self, offset: u64) -> u8 {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            UART_RX => {
                if regs.lcr & UART_LCR_DLAB != 0 {
                    regs.dll
                } else {
                    let value = self.rx.get().unwrap_or(0);
                    if self.rx.is_empty() {
                        regs.lsr &= !UART_LSR_DR;
                    }
                    self.update_irq(&regs);
                    self.kick_worker();
                    value
                }
            }
            UART_IER => {
                if regs.lcr & UART_LCR_DLAB != 0 {
                    regs.dlm
                } else {
                    regs.ier
                }
            }
            UART_IIR => {
                let iir = self.current_iir(&regs);
                if iir == UART_IIR_THRI {
                    regs.thre_pending = false;
                    self.update_irq(&regs);
                }
                iir | UART_IIR_FIFO
            }
            UART_LCR => regs.lcr,
            UART_MCR => regs.mcr,
            UART_LSR => {
                let value = regs.lsr;
                regs.lsr &= !UART_LSR_ERR_BITS;
                self.update_irq(&regs);
                value
            }
            UART_MSR => {
                let value = regs.msr;
                regs.msr &= !UART_MSR_ANY_DELTA;
                self.update_irq(&regs);
                value
            }
            UART_SCR => regs.scr,
            _ => 0,
        }
    }

    fn reg_write(&self, offset: u64, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            UART_RX => {
                if regs.lcr & UART_LCR_DLAB != 0 {
                    regs.dll = value;
                } else if regs.mcr & UART_MCR_LOOP != 0 {
                    // Loopback: transmitted bytes come back on the receiver.
                    if self.rx.put(value) {
                        regs.lsr |= UART_LSR_DR;
                    } else {
                        regs.lsr |= UART_LSR_OE;
                    }
                    self.update_irq(&regs);
                } else {
                    if !self.tx.put(value) {
                        // The transmitter is saturated; the byte is lost the
                        // way a real overrun would lose it.
                        warn!("serial: TX FIFO overrun, dropping byte");
                    }
                    regs.lsr &= !(UART_LSR_THRE | UART_LSR_TEMT);
                    regs.thre_pending = false;
                    self.update_irq(&regs);
                    self.kick_worker();
                }
            }
            UART_IER => {
                if regs.lcr & UART_LCR_DLAB != 0 {
                    regs.dlm = value;
                } else {
                    regs.ier = value & UART_IER_MASK;
                    if regs.ier & UART_IER_THRI != 0 && regs.lsr & UART_LSR_THRE != 0 {
                        regs.thre_pending = true;
                    } else if regs.ier & UART_IER_THRI == 0 {
                        regs.thre_pending = false;
                    }
                    self.update_irq(&regs);
                }
            }
            UART_IIR => {
                if value & UART_FCR_CLEAR_RCVR != 0 {
                    self.rx.clear();
                    regs.lsr &= !UART_LSR_DR;
                }
                if value & UART_FCR_CLEAR_XMIT != 0 {
                    self.tx.clear();
                    regs.lsr |= UART_LSR_THRE | UART_LSR_TEMT;
                    if regs.ier & UART_IER_THRI != 0 {
                        regs.thre_pending = true;
                    }
                }
                regs.fcr = value & UART_FCR_MASK;
                regs.trigger = RX_TRIGGERS[((regs.fcr >> 6) & 0x3) as usize];
                self.update_irq(&regs);
            }
            UART_LCR => regs.lcr = value,
            UART_MCR => {
                let was_loop = regs.mcr & UART_MCR_LOOP != 0;
                regs.mcr = value & UART_MCR_MASK;
                let in_loop = regs.mcr & UART_MCR_LOOP != 0;
                if was_loop != in_loop {
                    self.loopback.store(in_loop, Ordering::Release);
                    if in_loop {
                        // Host-side I/O is parked; the worker must notice.
                        self.kick_worker();
                    }
                }
                if in_loop {
                    // Modem-control outputs wrap onto the status inputs.
                    let mut status = 0u8;
                    if regs.mcr & UART_MCR_DTR != 0 {
                        status |= UART_MSR_DSR;
                    }
                    if regs.mcr & UART_MCR_RTS != 0 {
                        status |= UART_MSR_CTS;
                    }
                    if regs.mcr & UART_MCR_OUT1 != 0 {
                        status |= UART_MSR_RI;
                    }
                    if regs.mcr & UART_MCR_OUT2 != 0 {
                        status |= UART_MSR_DCD;
                    }
                    let delta = ((regs.msr ^ status) >> 4) & UART_MSR_ANY_DELTA;
                    regs.msr = status | (regs.msr & UART_MSR_ANY_DELTA) | delta;
                }
                self.update_irq(&regs);
            }
            // LSR and MSR writes are factory-test and unused respectively.
            UART_LSR | UART_MSR => {}
            UART_SCR => regs.scr = value,
            _ => {}
        }
    }

    fn kick_worker(&self) {
        let _ = self.evfd.write(1);
    }

    /// Drain the TX FIFO to the host. Returns true when the FIFO emptied.
    fn transmit(&self) -> bool {
        if self.loopback.load(Ordering::Acquire) {
            return true;
        }
        while let Some(byte) = self.tx.peek() {
            let ret = unsafe { libc::write(self.outfd, &byte as *const u8 as *const libc::c_void, 1) };
            if ret != 1 {
                return false;
            }
            self.tx.get();
        }
        let mut regs = self.regs.lock().unwrap();
        if regs.lsr & UART_LSR_THRE == 0 && self.tx.is_empty() {
            regs.lsr |= UART_LSR_THRE | UART_LSR_TEMT;
            if regs.ier & UART_IER_THRI != 0 {
                regs.thre_pending = true;
            }
            self.update_irq(&regs);
        }
        true
    }

    fn host_readable(&self) -> bool {
        let mut fds = [libc::pollfd {
            fd: self.infd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        ret > 0 && fds[0].revents & libc::POLLIN != 0
    }

    /// Pull host bytes into the RX FIFO up to its capacity.
    fn receive(&self) {
        if self.loopback.load(Ordering::Acquire) {
            return;
        }
        let mut moved = false;
        let mut overrun = false;
        while self.host_readable() {
            if self.rx.is_full() {
                overrun = true;
                break;
            }
            let mut byte = 0u8;
            let ret =
                unsafe { libc::read(self.infd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
            if ret != 1 {
                break;
            }
            if self.rx.put(byte) {
                moved = true;
            }
        }
        if moved || overrun {
            let mut regs = self.regs.lock().unwrap();
            if !self.rx.is_empty() {
                regs.lsr |= UART_LSR_DR;
            }
            if overrun {
                regs.lsr |= UART_LSR_OE;
            }
            self.update_irq(&regs);
        }
    }

    fn run_worker(&self) {
        let epoll = match EpollContext::new() {
            Ok(epoll) => epoll,
            Err(e) => {
                error!("serial: failed to create the worker epoll: {}", e);
                return;
            }
        };
        if epoll.add(self.evfd.as_raw_fd(), epoll::Events::EPOLLIN, TOKEN_EVFD).is_err()
            || epoll.add(self.infd, epoll::Events::EPOLLIN, TOKEN_STDIN).is_err()
            || epoll.add(self.outfd, epoll::Events::empty(), TOKEN_STDOUT).is_err()
        {
            error!("serial: failed to populate the worker epoll");
            return;
        }

        let mut stdout_armed = false;
        let mut events = [epoll::Event::new(epoll::Events::empty(), 0); 3];
        while !self.stopped.load(Ordering::Relaxed) {
            let count = match epoll.wait(&mut events, -1) {
                Ok(count) => count,
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    error!("serial: epoll wait failed: {}", e);
                    break;
                }
            };
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }

            for event in events.iter().take(count) {
                match event.data {
                    TOKEN_EVFD => {
                        let _ = self.evfd.read();
                        // An internal wakeup tries both directions.
                        self.transmit();
                        self.receive();
                    }
                    TOKEN_STDIN => self.receive(),
                    TOKEN_STDOUT => {
                        self.transmit();
                    }
                    _ => {}
                }
            }

            // Keep EPOLLOUT armed only while a drain is incomplete, so an
            // idle transmitter does not spin on a writable terminal.
            let want_armed = !self.tx.is_empty() && !self.loopback.load(Ordering::Acquire);
            if want_armed != stdout_armed {
                let mask = if want_armed {
                    epoll::Events::EPOLLOUT
                } else {
                    epoll::Events::empty()
                };
                if epoll.modify(self.outfd, mask, TOKEN_STDOUT).is_ok() {
                    stdout_armed = want_armed;
                }
            }
        }
    }
}

impl BusDevice for Serial {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
        // Registers are byte wide; wider accesses act on the low byte.
        if is_write {
            self.reg_write(offset, data[0]);
        } else {
            data[0] = self.reg_read(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::FakeVm;

    struct Fixture {
        serial: Arc<Serial>,
        vm: Arc<FakeVm>,
        host_in: RawFd,
        host_out: RawFd,
    }

    impl Fixture {
        fn new() -> Self {
            // host_in feeds the guest; host_out captures guest output.
            let mut in_pipe = [0 as RawFd; 2];
            let mut out_pipe = [0 as RawFd; 2];
            assert_eq!(unsafe { libc::pipe2(in_pipe.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
            assert_eq!(unsafe { libc::pipe2(out_pipe.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
            let vm = Arc::new(FakeVm::default());
            let serial = Serial::new(vm.clone(), in_pipe[0], out_pipe[1]).unwrap();
            Fixture {
                serial,
                vm,
                host_in: in_pipe[1],
                host_out: out_pipe[0],
            }
        }

        fn write(&self, offset: u64, value: u8) {
            self.serial.reg_write(offset, value);
        }

        fn read(&self, offset: u64) -> u8 {
            self.serial.reg_read(offset)
        }

        fn feed_host(&self, bytes: &[u8]) {
            let ret = unsafe {
                libc::write(self.host_in, bytes.as_ptr() as *const libc::c_void, bytes.len())
            };
            assert_eq!(ret as usize, bytes.len());
            self.serial.receive();
        }

        fn captured_output(&self) -> Vec<u8> {
            let mut buf = [0u8; 256];
            let ret = unsafe {
                libc::read(self.host_out, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if ret <= 0 {
                return Vec::new();
            }
            buf[..ret as usize].to_vec()
        }

        fn line_level(&self) -> Option<bool> {
            self.vm.lines.lock().unwrap().last().map(|(_, level)| *level)
        }
    }

    #[test]
    fn reset_state_reports_empty_transmitter() {
        let f = Fixture::new();
        assert_eq!(f.read(UART_LSR) & (UART_LSR_THRE | UART_LSR_TEMT), 0x60);
        assert_eq!(f.read(UART_IIR), UART_IIR_NO_INT | UART_IIR_FIFO);
    }

    #[test]
    fn divisor_latch_roundtrips_independently_of_data_registers() {
        let f = Fixture::new();
        // Touch RBR/IER first with DLAB off.
        f.write(UART_IER, 0x05);
        f.write(UART_LCR, UART_LCR_DLAB);
        f.write(UART_RX, 0x78);
        f.write(UART_IER, 0x12);
        assert_eq!(f.read(UART_RX), 0x78);
        assert_eq!(f.read(UART_IER), 0x12);
        f.write(UART_LCR, 0);
        assert_eq!(f.read(UART_IER), 0x05);
    }

    #[test]
    fn ier_is_masked_to_four_bits() {
        let f = Fixture::new();
        f.write(UART_IER, 0xFF);
        assert_eq!(f.read(UART_IER), 0x0F);
    }

    #[test]
    fn thr_write_clears_thre_until_drained() {
        let f = Fixture::new();
        f.write(UART_RX, b'h');
        assert_eq!(f.read(UART_LSR) & (UART_LSR_THRE | UART_LSR_TEMT), 0);

        assert!(f.serial.transmit());
        assert_eq!(f.read(UART_LSR) & (UART_LSR_THRE | UART_LSR_TEMT), 0x60);
        assert_eq!(f.captured_output(), b"h");
    }

    #[test]
    fn draining_the_transmitter_raises_exactly_one_thri() {
        let f = Fixture::new();
        f.write(UART_IER, UART_IER_THRI);
        f.write(UART_RX, b'x');
        // THR is no longer empty: the pending interrupt was withdrawn.
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_NO_INT);

        f.serial.transmit();
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_THRI);
        assert_eq!(f.line_level(), Some(false));
        // The read above acknowledged it.
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_NO_INT);
    }

    #[test]
    fn single_byte_fires_rdi_at_default_trigger() {
        let f = Fixture::new();
        f.write(UART_IER, UART_IER_RDI);
        f.feed_host(b"a");
        assert_eq!(f.read(UART_LSR) & UART_LSR_DR, UART_LSR_DR);
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_RDI);
        assert_eq!(f.line_level(), Some(true));
    }

    #[test]
    fn below_trigger_level_reports_rx_timeout() {
        let f = Fixture::new();
        f.write(UART_IER, UART_IER_RDI);
        // FIFO enabled, trigger level 16.
        f.write(UART_IIR, 0x41);
        f.feed_host(&[b'x'; 15]);
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_RX_TIMEOUT);
        // One more byte reaches the trigger.
        f.feed_host(b"x");
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_RDI);
    }

    #[test]
    fn draining_receiver_clears_data_ready() {
        let f = Fixture::new();
        f.feed_host(b"ab");
        assert_eq!(f.read(UART_RX), b'a');
        assert_eq!(f.read(UART_LSR) & UART_LSR_DR, UART_LSR_DR);
        assert_eq!(f.read(UART_RX), b'b');
        assert_eq!(f.read(UART_LSR) & UART_LSR_DR, 0);
    }

    #[test]
    fn receiver_overrun_sets_and_read_clears_oe() {
        let f = Fixture::new();
        f.write(UART_IER, UART_IER_RLSI);
        f.feed_host(&[b'x'; 70]);
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_RLSI);
        let lsr = f.read(UART_LSR);
        assert_eq!(lsr & UART_LSR_OE, UART_LSR_OE);
        // Reading LSR cleared the error.
        assert_eq!(f.read(UART_LSR) & UART_LSR_OE, 0);
    }

    #[test]
    fn fcr_clear_bits_drain_the_fifos() {
        let f = Fixture::new();
        f.feed_host(b"pending");
        f.write(UART_RX, b'q');
        f.write(UART_IIR, UART_FCR_CLEAR_RCVR | UART_FCR_CLEAR_XMIT);
        assert_eq!(f.read(UART_LSR) & UART_LSR_DR, 0);
        assert_eq!(f.read(UART_LSR) & UART_LSR_THRE, UART_LSR_THRE);
        // Nothing left to transmit.
        f.serial.transmit();
        assert!(f.captured_output().is_empty());
    }

    #[test]
    fn loopback_echoes_writes_to_the_receiver() {
        let f = Fixture::new();
        f.write(UART_MCR, UART_MCR_LOOP);
        f.write(UART_RX, b'z');
        assert_eq!(f.read(UART_LSR) & UART_LSR_DR, UART_LSR_DR);
        assert_eq!(f.read(UART_RX), b'z');
        // The host side saw nothing.
        f.serial.transmit();
        assert!(f.captured_output().is_empty());
    }

    #[test]
    fn loopback_maps_modem_control_onto_status() {
        let f = Fixture::new();
        f.write(UART_MCR, UART_MCR_LOOP | UART_MCR_DTR);
        let msr = f.read(UART_MSR);
        assert_eq!(msr & UART_MSR_DSR, UART_MSR_DSR);
        assert_ne!(msr & UART_MSR_ANY_DELTA, 0);
        // The read cleared the delta nibble.
        assert_eq!(f.read(UART_MSR) & UART_MSR_ANY_DELTA, 0);
    }

    #[test]
    fn rdi_outranks_thri() {
        let f = Fixture::new();
        f.write(UART_IER, UART_IER_RDI | UART_IER_THRI);
        f.write(UART_RX, b'x');
        f.serial.transmit();
        f.feed_host(b"r");
        assert_eq!(f.read(UART_IIR) & 0x0F, UART_IIR_RDI);
    }

    #[test]
    fn scratch_register_roundtrips() {
        let f = Fixture::new();
        f.write(UART_SCR, 0xA5);
        assert_eq!(f.read(UART_SCR), 0xA5);
    }

    #[test]
    fn bus_access_reads_and_writes_low_byte() {
        let f = Fixture::new();
        let mut data = [0xA5u8];
        f.serial.bus_io(&mut data, true, UART_SCR);
        let mut back = [0u8];
        f.serial.bus_io(&mut back, false, UART_SCR);
        assert_eq!(back[0], 0xA5);
    }

    #[test]
    fn worker_moves_guest_output_to_host() {
        let f = Fixture::new();
        f.serial.start();
        f.write(UART_RX, b'h');
        f.write(UART_RX, b'i');

        // The worker drains asynchronously.
        let mut out = Vec::new();
        for _ in 0..200 {
            out.extend(f.captured_output());
            if out.len() >= 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        f.serial.stop();
        assert_eq!(out, b"hi");
    }

    #[test]
    fn stop_joins_worker_even_in_loopback() {
        let f = Fixture::new();
        f.serial.start();
        f.write(UART_MCR, UART_MCR_LOOP);
        f.serial.stop();
        assert!(f.serial.worker.lock().unwrap().is_none());
    }
}
