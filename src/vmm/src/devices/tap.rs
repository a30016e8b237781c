// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! TAP interface used by the virtio-net backend.
//!
//! The device is opened with `IFF_TAP | IFF_NO_PI` and no VNET header: the
//! 12-byte virtio net header is handled by the device model, so frames cross
//! this fd bare. The fd is non-blocking because two workers poll it for
//! opposite directions.

use std::fs::File;
use std::io::{Error as IoError, Result as IoResult};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::{c_char, c_int, IFF_NO_PI, IFF_TAP};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::devices::{Error, Result};

const TUN_PATH: *const c_char = b"/dev/net/tun\0".as_ptr() as *const c_char;

// See linux/if_tun.h; 84 is the ascii code for "T".
const TUNTAP: ::std::os::raw::c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);

const IFNAMSIZ: usize = 16;

/// Matches `struct ifreq` for the TUNSETIFF request: interface name followed
/// by the flags word, padded to the kernel's union size.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: i16,
    _pad: [u8; 22],
}

fn ifr_name(pattern: &str) -> [u8; IFNAMSIZ] {
    let mut name = [0u8; IFNAMSIZ];
    let bytes = pattern.as_bytes();
    let len = bytes.len().min(IFNAMSIZ - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    name
}

#[derive(Debug)]
pub struct Tap {
    file: File,
    if_name: [u8; IFNAMSIZ],
}

impl Tap {
    /// Create a TAP device, letting the kernel pick the interface index.
    pub fn open() -> Result<Self> {
        // O_CLOEXEC so the fd does not leak across an exec; O_NONBLOCK
        // because both net workers poll it.
        let fd = unsafe {
            libc::open(
                TUN_PATH,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::OpenTun(IoError::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let mut req = IfReq {
            ifr_name: ifr_name("tap%d"),
            ifr_flags: (IFF_TAP | IFF_NO_PI) as i16,
            _pad: [0; 22],
        };
        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut req) };
        if ret < 0 {
            return Err(Error::IoctlError(IoError::last_os_error()));
        }

        Ok(Tap {
            file,
            if_name: req.ifr_name,
        })
    }

    /// Interface name the kernel assigned.
    pub fn name(&self) -> String {
        let len = self
            .if_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.if_name[..len]).into_owned()
    }

    /// Read one frame. Takes `&self`: the RX and TX workers share the fd.
    pub fn read_frame(&self, buf: &mut [u8]) -> IoResult<usize> {
        let ret = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Write one frame.
    pub fn write_frame(&self, buf: &[u8]) -> IoResult<usize> {
        let ret = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Wrap an arbitrary fd; lets tests stand in a pipe for the real device.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: RawFd) -> Self {
        Tap {
            file: unsafe { File::from_raw_fd(fd) },
            if_name: ifr_name("test"),
        }
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_pattern_is_nul_terminated() {
        let name = ifr_name("tap%d");
        assert_eq!(&name[..5], b"tap%d");
        assert!(name[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn overlong_pattern_is_truncated_with_terminator() {
        let name = ifr_name("an-interface-name-way-too-long");
        assert_eq!(name[IFNAMSIZ - 1], 0);
    }

    #[test]
    fn frames_cross_a_pipe_fd() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read_end = Tap::from_fd(fds[0]);
        let write_end = Tap::from_fd(fds[1]);

        assert_eq!(write_end.write_frame(b"frame").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(read_end.read_frame(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"frame");
    }
}
