// SPDX-License-Identifier: Apache-2.0

extern crate epoll;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::result;

pub struct EpollContext {
    raw_fd: RawFd,
}

impl EpollContext {
    pub fn new() -> result::Result<EpollContext, io::Error> {
        let raw_fd = epoll::create(true)?;
        Ok(EpollContext { raw_fd })
    }

    pub fn add(&self, fd: RawFd, events: epoll::Events, token: u64) -> result::Result<(), io::Error> {
        epoll::ctl(
            self.raw_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(events, token),
        )?;

        Ok(())
    }

    /// Re-arm an already registered fd with a new event mask.
    pub fn modify(
        &self,
        fd: RawFd,
        events: epoll::Events,
        token: u64,
    ) -> result::Result<(), io::Error> {
        epoll::ctl(
            self.raw_fd,
            epoll::ControlOptions::EPOLL_CTL_MOD,
            fd,
            epoll::Event::new(events, token),
        )?;

        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut [epoll::Event],
        timeout: i32,
    ) -> result::Result<usize, io::Error> {
        epoll::wait(self.raw_fd, timeout, events)
    }
}

impl AsRawFd for EpollContext {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}

impl Drop for EpollContext {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.raw_fd);
        }
    }
}
