//! The adaptive poll -> sleep worker state machine, one per ring.

use super::{Ring, RingFlags};
use core::sync::atomic::Ordering;

/// Miss thresholds per stage, taken directly from the original ring
/// driver's worker: busy_poll tolerates 50 empty polls before backing
/// off, slow_poll 500, and the wakeup-flag stage just 1 before sleeping.
const BUSY_POLL_MISSES: u32 = 50;
const SLOW_POLL_MISSES: u32 = 500;
const WAKEUP_FLAG_MISSES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BusyPoll,
    SlowPoll,
    WakeupFlag,
    Sleep,
}

/// Drives one ring: polls for SQ entries, hands each to `handler`, and
/// backs off through the four stages on sustained misses.
pub struct Worker<'a> {
    ring: &'a Ring,
    stage: Stage,
    misses: u32,
}

/// Environment hook so the worker's "sleep a while" and "block on
/// completion" steps are injectable rather than hard-coded to a
/// particular scheduler.
pub trait WorkerClock {
    fn sleep_micros(&self, micros: u64);
}

impl<'a> Worker<'a> {
    pub fn new(ring: &'a Ring) -> Self {
        Worker { ring, stage: Stage::BusyPoll, misses: 0 }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run one poll iteration. `poll` returns `Some(arg)` on a hit.
    /// `clock` provides the stage's sleep/park behaviour.
    pub fn step<C: WorkerClock>(&mut self, clock: &C, poll: impl FnOnce() -> Option<(u64, alloc::vec::Vec<u8>)>, handler: impl FnOnce(&Ring, u64, &[u8]) -> i32) {
        match poll() {
            Some((id, arg)) => {
                handler(self.ring, id, &arg);
                self.on_hit();
            }
            None => self.on_miss(clock),
        }
    }

    fn on_hit(&mut self) {
        self.misses = 0;
        if self.stage != Stage::BusyPoll {
            self.ring.header.flags.fetch_and(!RingFlags::NEEDS_WAKEUP.bits(), Ordering::Release);
        }
        self.stage = Stage::BusyPoll;
    }

    fn on_miss<C: WorkerClock>(&mut self, clock: &C) {
        self.misses += 1;
        match self.stage {
            Stage::BusyPoll => {
                if self.ring.header.flags.load(Ordering::Acquire) & RingFlags::NEEDS_WAKEUP.bits() != 0 {
                    self.ring.header.flags.fetch_and(!RingFlags::NEEDS_WAKEUP.bits(), Ordering::Release);
                }
                if self.misses >= BUSY_POLL_MISSES {
                    self.stage = Stage::SlowPoll;
                    self.misses = 0;
                }
            }
            Stage::SlowPoll => {
                clock.sleep_micros(1);
                if self.misses >= SLOW_POLL_MISSES {
                    self.stage = Stage::WakeupFlag;
                    self.misses = 0;
                }
            }
            Stage::WakeupFlag => {
                self.ring.header.flags.fetch_or(RingFlags::NEEDS_WAKEUP.bits(), Ordering::Release);
                clock.sleep_micros(1);
                if self.misses >= WAKEUP_FLAG_MISSES {
                    self.stage = Stage::Sleep;
                    self.misses = 0;
                }
            }
            Stage::Sleep => {
                // The caller's poll loop is expected to have blocked on
                // the ring's completion before calling `step` again;
                // waking from that block always returns to busy_poll.
                self.stage = Stage::BusyPoll;
                self.misses = 0;
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::ring::test_ring;

    struct NoSleep;
    impl WorkerClock for NoSleep {
        fn sleep_micros(&self, _micros: u64) {}
    }

    #[test]
    fn backs_off_through_every_stage_on_sustained_misses() {
        let ring = test_ring();
        let mut worker = Worker::new(&ring);
        let clock = NoSleep;
        for _ in 0..BUSY_POLL_MISSES {
            worker.step(&clock, || None, |_, _, _| 0);
        }
        assert_eq!(worker.stage(), Stage::SlowPoll);
        for _ in 0..SLOW_POLL_MISSES {
            worker.step(&clock, || None, |_, _, _| 0);
        }
        assert_eq!(worker.stage(), Stage::WakeupFlag);
        worker.step(&clock, || None, |_, _, _| 0);
        assert_eq!(worker.stage(), Stage::Sleep);
    }

    #[test]
    fn a_hit_always_returns_to_busy_poll() {
        let ring = test_ring();
        let mut worker = Worker::new(&ring);
        let clock = NoSleep;
        for _ in 0..BUSY_POLL_MISSES {
            worker.step(&clock, || None, |_, _, _| 0);
        }
        assert_eq!(worker.stage(), Stage::SlowPoll);
        worker.step(&clock, || Some((1, alloc::vec::Vec::new())), |_, _, _| 0);
        assert_eq!(worker.stage(), Stage::BusyPoll);
    }
}
