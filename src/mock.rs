//! Host-side backends used when the `mock` feature is enabled, so the
//! fabric can be exercised without a real kernel beneath it.

extern crate std;

use crate::error::{DeviceError, DeviceResult};
use crate::ring::{MappedRegion, PageMapper, WorkerClock};
use std::sync::Mutex;
use std::vec::Vec;

/// A `PageMapper` backed by an ordinary heap allocation instead of a
/// real page-pin/vmap; good enough to drive the ring protocol's memory
/// ordering under a host test.
pub struct HeapPageMapper {
    regions: Mutex<Vec<Option<Vec<u8>>>>,
}

impl HeapPageMapper {
    pub fn new() -> Self {
        HeapPageMapper { regions: Mutex::new(Vec::new()) }
    }
}

impl Default for HeapPageMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for HeapPageMapper {
    fn map(&self, _user_ptr: u64, size: usize) -> DeviceResult<(MappedRegion, u64)> {
        let mut regions = self.regions.lock().unwrap();
        let buf = std::vec![0u8; size];
        let base = buf.as_ptr() as u64;
        regions.push(Some(buf));
        Ok((MappedRegion(regions.len() - 1), base))
    }

    fn unmap(&self, region: MappedRegion) {
        let mut regions = self.regions.lock().unwrap();
        if let Some(slot) = regions.get_mut(region.0) {
            *slot = None;
        }
    }
}

/// A `WorkerClock` backed by `std::thread::sleep`.
pub struct StdClock;

impl WorkerClock for StdClock {
    fn sleep_micros(&self, micros: u64) {
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }
}

/// Resolve a BAR purely by index * a fixed stride, for tests that only
/// care that resource derivation runs, not that it matches real
/// hardware.
pub fn fake_bar_resolver() -> crate::fabric::BarResolver {
    std::sync::Arc::new(|bar_idx: u32| -> DeviceResult<u64> {
        if bar_idx > 5 {
            return Err(DeviceError::Invalid);
        }
        Ok(0x1_0000_0000 + (bar_idx as u64) * 0x10_0000)
    })
}
