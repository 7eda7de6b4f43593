//! Ring transport (C5): a per-leaf, opt-in shared-memory SQ/CQ pair
//! with an adaptive poll->sleep worker.

mod worker;

pub use worker::{Stage, Worker, WorkerClock};

use crate::error::{DeviceError, DeviceResult};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Hard caps from the component design.
pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;
pub const MAX_RINGS_PER_HANDLE: usize = 2048;

const CACHE_LINE: usize = 64;
const HEADER_SIZE: usize = CACHE_LINE;
const ENTRY_HEADER_SIZE: usize = 16;

bitflags::bitflags! {
    pub struct RingFlags: u64 {
        /// Set by the worker when it falls idle; user-space checks it
        /// after `store_release(head)` and issues `SQ_WAKEUP` iff set.
        const NEEDS_WAKEUP = 1 << 0;
    }
}

/// A request to donate a shared buffer, from `REGISTER_RING`.
pub struct RegisterRequest {
    pub user_ptr: u64,
    pub size: usize,
    pub sqe_arg_size: usize,
    pub cqe_arg_size: usize,
}

/// What `register` hands back: the entry count and byte offset of every
/// field, so user-space can lay its own view over the same region.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    pub entries: usize,
    pub flags_offset: usize,
    pub sq_head_offset: usize,
    pub cq_head_offset: usize,
    pub sq_tail_offset: usize,
    pub cq_tail_offset: usize,
    pub sq_entries_offset: usize,
    pub cq_entries_offset: usize,
    pub sqe_size: usize,
    pub cqe_size: usize,
}

/// Injected by the embedding kernel: pin a user region and map it into
/// a kernel-addressable, volatile byte slice. Bare-metal specifics (page
/// tables, DMA direction) live entirely on the other side of this trait.
pub trait PageMapper: Send + Sync {
    /// Pin `size` bytes at `user_ptr` (write access) and map them.
    /// Returns an opaque handle plus the mapped base address.
    fn map(&self, user_ptr: u64, size: usize) -> DeviceResult<(MappedRegion, u64)>;
    /// Unpin and unmap a region previously returned by `map`.
    fn unmap(&self, region: MappedRegion);
}

/// An opaque mapped-region handle; only meaningful to the `PageMapper`
/// that produced it.
pub struct MappedRegion(pub usize);

fn derive_entry_count(region_size: usize, sqe_arg_size: usize, cqe_arg_size: usize) -> usize {
    if region_size <= HEADER_SIZE {
        return 0;
    }
    let usable = region_size - HEADER_SIZE;
    let per_entry_pair = 2 * ENTRY_HEADER_SIZE + sqe_arg_size + cqe_arg_size;
    if per_entry_pair == 0 {
        return 0;
    }
    let max_n = usable / per_entry_pair;
    // Largest power of two <= max_n.
    if max_n == 0 {
        0
    } else {
        1usize << (usize::BITS - 1 - max_n.leading_zeros())
    }
}

/// The shared header, laid out cache-line aligned at the start of the
/// mapped region. Every field is accessed with explicit release/acquire
/// ordering; the whole header is logically an `UnsafeCell`-backed word
/// set shared with user-space.
pub struct RingHeader {
    pub flags: AtomicU64,
    pub sq_head: AtomicU32,
    pub cq_head: AtomicU32,
    pub sq_tail: AtomicU32,
    pub cq_tail: AtomicU32,
}

impl RingHeader {
    fn new() -> Self {
        RingHeader {
            flags: AtomicU64::new(0),
            sq_head: AtomicU32::new(0),
            cq_head: AtomicU32::new(0),
            sq_tail: AtomicU32::new(0),
            cq_tail: AtomicU32::new(0),
        }
    }
}

/// One registered SQ/CQ ring.
pub struct Ring {
    pub layout: RingLayout,
    pub header: Arc<RingHeader>,
    region: MappedRegion,
    worker_signal: Arc<crate::sync::Signal>,
    closing: core::sync::atomic::AtomicBool,
}

impl Ring {
    /// `N = largest power of two <= floor((region_size - header) /
    /// (2*entry_header + sqe_arg_size + cqe_arg_size))`.
    fn entries(region_size: usize, sqe_arg_size: usize, cqe_arg_size: usize) -> usize {
        derive_entry_count(region_size, sqe_arg_size, cqe_arg_size)
    }

    /// SQ entries produced but not yet consumed. Always `<= N`: the user
    /// producer never advances `sq_head` past `sq_tail + N`.
    pub fn used(&self) -> u32 {
        self.header.sq_head.load(Ordering::Acquire).wrapping_sub(self.header.sq_tail.load(Ordering::Acquire))
    }

    /// Begin consuming one SQ entry; returns the slot index to read from,
    /// or `None` if the consumer has caught up with the producer
    /// (`sq_head == sq_tail`).
    pub fn sq_consume_begin(&self) -> Option<u32> {
        let head = self.header.sq_head.load(Ordering::Acquire);
        let tail = self.header.sq_tail.load(Ordering::Relaxed);
        if head == tail {
            None
        } else {
            Some(tail % self.layout.entries as u32)
        }
    }

    /// Publish that the SQ entry read after `sq_consume_begin` has been
    /// consumed.
    pub fn sq_consume_end(&self) {
        self.header.sq_tail.fetch_add(1, Ordering::Release);
    }

    /// Begin producing one CQ entry; returns the slot index to write
    /// into.
    pub fn cq_produce_begin(&self) -> u32 {
        self.header.cq_head.load(Ordering::Relaxed) % self.layout.entries as u32
    }

    /// Publish the CQ entry written after `cq_produce_begin`.
    pub fn cq_produce_end(&self) {
        self.header.cq_head.fetch_add(1, Ordering::Release);
    }

    /// Set `NEEDS_WAKEUP` and ring the doorbell the worker's `sleep`
    /// stage blocks on.
    pub fn sq_wakeup(&self) {
        self.header.flags.fetch_or(RingFlags::NEEDS_WAKEUP.bits(), Ordering::Release);
        self.worker_signal.send();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Per-leaf ring set: the rings array and the lock guarding it.
pub struct RingSet<M: PageMapper> {
    mapper: Arc<M>,
    rings: Mutex<Vec<Arc<Ring>>>,
    max_n: usize,
}

impl<M: PageMapper> RingSet<M> {
    pub fn probe(mapper: Arc<M>, max_n: usize) -> Self {
        RingSet { mapper, rings: Mutex::new(Vec::new()), max_n }
    }

    /// Validate, pin, and map a user-donated buffer; returns the handle
    /// index and the computed layout.
    pub fn register(&self, req: RegisterRequest) -> DeviceResult<(usize, RingLayout)> {
        if req.size == 0 || req.size > MAX_REGION_SIZE {
            return Err(DeviceError::Invalid);
        }
        let mut rings = self.rings.lock();
        if rings.len() >= MAX_RINGS_PER_HANDLE.min(self.max_n) {
            return Err(DeviceError::Invalid);
        }
        let entries = Ring::entries(req.size, req.sqe_arg_size, req.cqe_arg_size);
        if entries == 0 {
            return Err(DeviceError::Invalid);
        }
        let (region, _base) = self.mapper.map(req.user_ptr, req.size)?;

        let sq_entry_size = ENTRY_HEADER_SIZE + req.sqe_arg_size;
        let cq_entry_size = ENTRY_HEADER_SIZE + req.cqe_arg_size;
        let layout = RingLayout {
            entries,
            flags_offset: 0,
            sq_head_offset: 8,
            cq_head_offset: 12,
            sq_tail_offset: 16,
            cq_tail_offset: 20,
            sq_entries_offset: HEADER_SIZE,
            cq_entries_offset: HEADER_SIZE + entries * sq_entry_size,
            sqe_size: sq_entry_size,
            cqe_size: cq_entry_size,
        };

        let ring = Arc::new(Ring {
            layout,
            header: Arc::new(RingHeader::new()),
            region,
            worker_signal: Arc::new(crate::sync::Signal::new()),
            closing: core::sync::atomic::AtomicBool::new(false),
        });
        rings.push(ring);
        Ok((rings.len() - 1, layout))
    }

    /// Unpin and unmap a previously registered ring, signalling its
    /// worker to stop first.
    pub fn unregister(&self, handle: usize) -> DeviceResult {
        let mut rings = self.rings.lock();
        if handle >= rings.len() {
            return Err(DeviceError::NotFound);
        }
        let ring = rings.remove(handle);
        ring.closing.store(true, Ordering::Release);
        ring.worker_signal.send();
        match Arc::try_unwrap(ring) {
            Ok(ring) => {
                self.mapper.unmap(ring.region);
                Ok(())
            }
            Err(ring) => {
                // A worker thread still holds a clone; it will observe
                // `closing` and exit, but the caller asked for an
                // immediate unregister, so surface it as busy rather
                // than silently leaking the mapping.
                rings.push(ring);
                Err(DeviceError::Busy)
            }
        }
    }

    pub fn get(&self, handle: usize) -> DeviceResult<Arc<Ring>> {
        self.rings.lock().get(handle).cloned().ok_or(DeviceError::NotFound)
    }
}

/// A leaf's completion handler for one SQ entry: given the raw argument
/// bytes, produce the matching CQ result. The handler is responsible for
/// calling [`Ring::cq_produce_begin`]/[`Ring::cq_produce_end`].
pub type ReqHandler = Box<dyn Fn(&Ring, u64, &[u8]) -> i32 + Send + Sync>;

#[cfg(all(test, feature = "std"))]
pub(crate) fn test_ring() -> Ring {
    Ring {
        layout: RingLayout {
            entries: 128,
            flags_offset: 0,
            sq_head_offset: 8,
            cq_head_offset: 12,
            sq_tail_offset: 16,
            cq_tail_offset: 20,
            sq_entries_offset: HEADER_SIZE,
            cq_entries_offset: HEADER_SIZE,
            sqe_size: 16,
            cqe_size: 16,
        },
        header: Arc::new(RingHeader::new()),
        region: MappedRegion(0),
        worker_signal: Arc::new(crate::sync::Signal::new()),
        closing: core::sync::atomic::AtomicBool::new(false),
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn entry_count_is_a_power_of_two() {
        let n = derive_entry_count(8192, 0, 0);
        assert!(n.is_power_of_two() || n == 0);
    }

    #[test]
    fn entry_count_respects_tiny_regions() {
        assert_eq!(derive_entry_count(HEADER_SIZE, 0, 0), 0);
    }

    #[test]
    fn used_reads_sq_head_minus_sq_tail() {
        let ring = test_ring();
        ring.header.sq_head.store(10, Ordering::Relaxed);
        ring.header.sq_tail.store(3, Ordering::Relaxed);
        ring.header.cq_tail.store(9000, Ordering::Relaxed);
        assert_eq!(ring.used(), 7);
    }

    #[test]
    fn sq_consume_walks_every_produced_entry_exactly_once() {
        let ring = test_ring();
        for produced in 1..=300u32 {
            ring.header.sq_head.store(produced, Ordering::Release);
            let slot = ring.sq_consume_begin().expect("producer stayed ahead of consumer");
            assert_eq!(slot, (produced - 1) % ring.layout.entries as u32);
            ring.sq_consume_end();
            assert_eq!(ring.used(), 0);
        }
        assert!(ring.sq_consume_begin().is_none());
    }

    #[test]
    fn used_stays_within_entry_count_under_a_full_queue() {
        let ring = test_ring();
        let n = ring.layout.entries as u32;
        ring.header.sq_head.store(n, Ordering::Release);
        assert_eq!(ring.used(), n);
        assert!(ring.sq_consume_begin().is_some());
    }
}
