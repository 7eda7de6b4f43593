//! Synchronisation primitives shared by every component.
//!
//! The framework's own lock is `spin::Mutex`: every sleepable mutex is
//! implemented as a spinlock here, the same trade-off the mock/bare-metal
//! split elsewhere in this crate makes, since there is no scheduler
//! beneath this crate to sleep on.

pub use spin::{Mutex, MutexGuard};

/// A single-slot completion signal.
///
/// Used wherever something needs to wait on a completion (holder drain,
/// synchronous event delivery, the ring worker's `sleep` stage).
/// `wait` returns `false` if woken by [`Signal::cancel`] rather than
/// [`Signal::send`], which callers treat as a killed wait.
pub struct Signal {
    inner: Inner,
}

#[cfg(feature = "std")]
struct Inner {
    state: std::sync::Mutex<State>,
    condvar: std::sync::Condvar,
}

#[cfg(not(feature = "std"))]
struct Inner {
    state: Mutex<State>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum State {
    Pending,
    Sent,
    Cancelled,
}

impl Signal {
    pub fn new() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                Signal {
                    inner: Inner {
                        state: std::sync::Mutex::new(State::Pending),
                        condvar: std::sync::Condvar::new(),
                    },
                }
            } else {
                Signal {
                    inner: Inner {
                        state: Mutex::new(State::Pending),
                    },
                }
            }
        }
    }

    /// Mark the signal as delivered and wake any waiter.
    pub fn send(&self) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                let mut state = self.inner.state.lock().unwrap();
                *state = State::Sent;
                self.inner.condvar.notify_all();
            } else {
                *self.inner.state.lock() = State::Sent;
            }
        }
    }

    /// Cancel a pending wait; the waiter's [`wait`](Signal::wait) returns
    /// `false`. Models an interrupted killable wait.
    pub fn cancel(&self) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                let mut state = self.inner.state.lock().unwrap();
                *state = State::Cancelled;
                self.inner.condvar.notify_all();
            } else {
                *self.inner.state.lock() = State::Cancelled;
            }
        }
    }

    /// Block until [`send`](Signal::send) or [`cancel`](Signal::cancel).
    /// Returns `true` iff woken by `send`.
    pub fn wait(&self) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                let mut state = self.inner.state.lock().unwrap();
                while *state == State::Pending {
                    state = self.inner.condvar.wait(state).unwrap();
                }
                *state == State::Sent
            } else {
                loop {
                    match *self.inner.state.lock() {
                        State::Pending => core::hint::spin_loop(),
                        State::Sent => return true,
                        State::Cancelled => return false,
                    }
                }
            }
        }
    }

    /// Non-blocking poll of the current state; does not consume it.
    pub fn is_pending(&self) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                *self.inner.state.lock().unwrap() == State::Pending
            } else {
                *self.inner.state.lock() == State::Pending
            }
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
