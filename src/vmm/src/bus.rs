// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Address-decode buses for port and memory-mapped I/O.
//!
//! A bus is a list of `(base, len)` ranges, each owned by a device handler.
//! Dispatch routes one guest access to the unique range covering it; the bus
//! models address decode only, so overlapping registrations are rejected and
//! an access that straddles the end of a range is dropped rather than split.

use std::sync::{Arc, RwLock};

/// A device handler reachable through a bus range.
///
/// `data` carries the access payload; its length is the access size. Reads
/// fill `data`, writes consume it. `offset` is relative to the range base.
pub trait BusDevice: Send + Sync {
    fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64);
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus range [{0:#x}; {1:#x}) overlaps an existing registration")]
    Overlap(u64, u64),
}

pub type Result<T> = std::result::Result<T, Error>;

struct BusRange {
    base: u64,
    len: u64,
    dev: Arc<dyn BusDevice>,
}

/// One I/O address space. Cloning yields a handle to the same bus, so a
/// device may keep a handle and (de)register ranges while the VM runs
/// (BAR activation).
#[derive(Clone, Default)]
pub struct Bus {
    ranges: Arc<RwLock<Vec<BusRange>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `[base; base+len)` for `dev`. Newest registrations are
    /// searched first, matching the original front-insertion order.
    pub fn register(&self, base: u64, len: u64, dev: Arc<dyn BusDevice>) -> Result<()> {
        let mut ranges = self.ranges.write().unwrap();
        for r in ranges.iter() {
            if base <= r.base + r.len - 1 && r.base <= base + len - 1 {
                return Err(Error::Overlap(base, len));
            }
        }
        ranges.insert(0, BusRange { base, len, dev });
        Ok(())
    }

    /// Unlink the first range matching `(base, len)`. Unknown ranges are
    /// ignored, as deregistration is only driven by BAR state the PCI layer
    /// already tracks.
    pub fn deregister(&self, base: u64, len: u64) {
        let mut ranges = self.ranges.write().unwrap();
        if let Some(pos) = ranges.iter().position(|r| r.base == base && r.len == len) {
            ranges.remove(pos);
        }
    }

    /// Route one access. Accesses outside every range, or running past the
    /// end of their range, are dropped silently: the guest probing
    /// unimplemented addresses is not an error.
    pub fn dispatch(&self, data: &mut [u8], is_write: bool, addr: u64) {
        let size = data.len() as u64;
        let hit = {
            let ranges = self.ranges.read().unwrap();
            ranges
                .iter()
                .find(|r| addr >= r.base && addr <= r.base + r.len - 1)
                .map(|r| (r.base, r.len, r.dev.clone()))
        };
        // The lock is released before the handler runs so that a handler may
        // mutate this bus (PCI COMMAND writes re-register BAR ranges).
        if let Some((base, len, dev)) = hit {
            if addr + size - 1 <= base + len - 1 {
                dev.bus_io(data, is_write, addr - base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        hits: Mutex<Vec<(bool, u64, usize)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                hits: Mutex::new(Vec::new()),
            })
        }
    }

    impl BusDevice for Recorder {
        fn bus_io(&self, data: &mut [u8], is_write: bool, offset: u64) {
            self.hits.lock().unwrap().push((is_write, offset, data.len()));
            if !is_write {
                data.fill(0xAB);
            }
        }
    }

    #[test]
    fn dispatch_routes_to_covering_range() {
        let bus = Bus::new();
        let dev = Recorder::new();
        bus.register(0x3F8, 8, dev.clone()).unwrap();

        let mut data = [0u8; 1];
        bus.dispatch(&mut data, false, 0x3FD);
        assert_eq!(data[0], 0xAB);
        assert_eq!(*dev.hits.lock().unwrap(), vec![(false, 5, 1)]);
    }

    #[test]
    fn access_outside_any_range_is_dropped() {
        let bus = Bus::new();
        let dev = Recorder::new();
        bus.register(0x100, 0x10, dev.clone()).unwrap();

        let mut data = [0u8; 4];
        bus.dispatch(&mut data, true, 0xF0);
        bus.dispatch(&mut data, true, 0x110);
        assert!(dev.hits.lock().unwrap().is_empty());
    }

    #[test]
    fn straddling_access_is_dropped_not_split() {
        let bus = Bus::new();
        let dev = Recorder::new();
        bus.register(0x100, 0x10, dev.clone()).unwrap();

        // Last byte would land at 0x112, past the end of the range.
        let mut data = [0u8; 4];
        bus.dispatch(&mut data, true, 0x10E);
        assert!(dev.hits.lock().unwrap().is_empty());

        // Exactly reaching the last covered byte is fine.
        bus.dispatch(&mut data, true, 0x10C);
        assert_eq!(dev.hits.lock().unwrap().len(), 1);
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let bus = Bus::new();
        bus.register(0x100, 0x10, Recorder::new()).unwrap();
        assert!(bus.register(0x10F, 0x10, Recorder::new()).is_err());
        assert!(bus.register(0xF8, 0x10, Recorder::new()).is_err());
        assert!(bus.register(0x110, 0x10, Recorder::new()).is_ok());
    }

    #[test]
    fn deregistered_range_no_longer_dispatches() {
        let bus = Bus::new();
        let dev = Recorder::new();
        bus.register(0x200, 4, dev.clone()).unwrap();
        bus.deregister(0x200, 4);

        let mut data = [0u8; 1];
        bus.dispatch(&mut data, true, 0x200);
        assert!(dev.hits.lock().unwrap().is_empty());
    }
}
