//! S5 (ring IOPS, spec §8): exercises the SQ head/tail bookkeeping that
//! backs property 6 ("every SQ entry produced is consumed exactly once,
//! and used = head - tail <= N") under both a tight single-threaded loop
//! and genuinely concurrent producer/consumer threads. Scaled down from
//! the full 10,000,000-submission scenario to keep the suite fast; the
//! index arithmetic under test does not depend on the iteration count.

use accel_drivers::error::DeviceResult;
use accel_drivers::ring::{MappedRegion, PageMapper, RegisterRequest, RingSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A `PageMapper` backed by a leaked heap buffer; good enough to hand
/// back a stable base address for the duration of a test process.
struct LeakingPageMapper;

impl PageMapper for LeakingPageMapper {
    fn map(&self, _user_ptr: u64, size: usize) -> DeviceResult<(MappedRegion, u64)> {
        let buf: &'static mut [u8] = vec![0u8; size].leak();
        Ok((MappedRegion(0), buf.as_ptr() as u64))
    }

    fn unmap(&self, _region: MappedRegion) {}
}

fn register(set: &RingSet<LeakingPageMapper>) -> accel_drivers::ring::RingLayout {
    let (handle, layout) = set
        .register(RegisterRequest { user_ptr: 0, size: 64 * 1024, sqe_arg_size: 0, cqe_arg_size: 0 })
        .unwrap();
    assert_eq!(handle, 0);
    layout
}

#[test]
fn s5_single_threaded_producer_consumer_never_over_or_under_consumes() {
    let set = RingSet::probe(Arc::new(LeakingPageMapper), 1);
    let layout = register(&set);
    let ring = set.get(0).unwrap();
    let n = layout.entries as u32;

    let mut produced = 0u32;
    let mut consumed = 0u32;
    for _ in 0..10_000u32 {
        if ring.used() < n {
            ring.header.sq_head.fetch_add(1, Ordering::Release);
            produced += 1;
        }
        if ring.sq_consume_begin().is_some() {
            ring.sq_consume_end();
            consumed += 1;
        }
        assert!(ring.used() <= n, "used() exceeded entry count");
    }
    while ring.sq_consume_begin().is_some() {
        ring.sq_consume_end();
        consumed += 1;
    }
    assert_eq!(produced, consumed);
}

#[test]
fn s5_concurrent_producer_and_consumer_stay_within_bound() {
    const TOTAL: u32 = 20_000;

    let set = RingSet::probe(Arc::new(LeakingPageMapper), 1);
    let layout = register(&set);
    let ring = set.get(0).unwrap();
    let n = layout.entries as u32;

    let producer_ring = ring.clone();
    let producer = std::thread::spawn(move || {
        let mut produced = 0u32;
        while produced < TOTAL {
            if producer_ring.used() < n {
                producer_ring.header.sq_head.fetch_add(1, Ordering::Release);
                produced += 1;
            }
        }
    });

    let mut consumed = 0u32;
    while consumed < TOTAL {
        if ring.sq_consume_begin().is_some() {
            ring.sq_consume_end();
            consumed += 1;
        }
        assert!(ring.used() <= n, "used() exceeded entry count under concurrency");
    }
    producer.join().unwrap();
    assert_eq!(consumed, TOTAL);
}
