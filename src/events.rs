//! Event dispatcher (C4): sync/async broadcast across the pool with
//! ordering guarantees and back-pressure via a single pending list.

use crate::error::{DeviceError, DeviceResult};
use crate::fabric::SubdeviceId;
use crate::sync::{Mutex, Signal};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use log::debug;

/// The framework's lifecycle event set. `PostCreation`/`PreRemoval`
/// carry the `(subdevice_id, instance)` of the leaf that changed; the
/// rest carry nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PostCreation(SubdeviceId, u32),
    PreRemoval(SubdeviceId, u32),
    PreHotReset,
    PostHotReset,
    PreGateClose,
    PostGateOpen,
    Test,
}

impl Event {
    /// `POST_CREATION` may only be emitted by the infrastructure itself
    /// on leaf creation, never via the public broadcast entry point.
    fn public_broadcast_allowed(&self) -> bool {
        !matches!(self, Event::PostCreation(..))
    }
}

struct Pending {
    event: Event,
    completion: Option<Arc<Signal>>,
}

/// `pending` and `draining` share one lock so a thread can never observe
/// "queue non-empty, nobody draining" torn apart from "I am now the
/// drainer", the race that would otherwise let two threads both decide
/// they're responsible, or let a pushed item sit unclaimed.
struct State {
    pending: VecDeque<Pending>,
    draining: bool,
}

/// A single-producer/single-consumer work queue of pending events:
/// concurrent `trigger` callers enqueue freely, but only one of them at
/// a time actually runs the delivery loop.
pub struct EventDispatcher<F> {
    state: Mutex<State>,
    deliver: F,
    closing: Mutex<bool>,
}

impl<F: Fn(&Event) + Send + Sync> EventDispatcher<F> {
    /// `deliver` is called once per dequeued event; in this framework it
    /// is always `pool.handle_event`, visiting every leaf.
    pub fn new(deliver: F) -> Self {
        EventDispatcher {
            state: Mutex::new(State { pending: VecDeque::new(), draining: false }),
            deliver,
            closing: Mutex::new(false),
        }
    }

    /// Enqueue `event` and drive the worker inline (this framework has
    /// no background scheduler of its own; the work-queue semantics are
    /// modelled as "drain whatever is pending right now", which keeps
    /// the in-`trigger`-order delivery guarantee).
    ///
    /// Fails with [`DeviceError::Invalid`] if `event` is `PostCreation`
    /// and this is a public call site: callers creating a leaf should
    /// use [`EventDispatcher::trigger_creation`] instead.
    pub fn trigger(&self, event: Event, is_async: bool) -> DeviceResult {
        if !event.public_broadcast_allowed() {
            return Err(DeviceError::Invalid);
        }
        self.trigger_internal(event, is_async)
    }

    /// Internal entry point used by the infrastructure itself to emit
    /// `PostCreation`, bypassing the public-broadcast restriction.
    pub(crate) fn trigger_creation(&self, id: SubdeviceId, instance: u32) {
        let _ = self.trigger_internal(Event::PostCreation(id, instance), true);
    }

    fn trigger_internal(&self, event: Event, is_async: bool) -> DeviceResult {
        let completion = if is_async { None } else { Some(Arc::new(Signal::new())) };
        self.state.lock().pending.push_back(Pending { event, completion: completion.clone() });
        self.drain();
        if let Some(completion) = completion {
            completion.wait();
        }
        Ok(())
    }

    /// Pop and deliver pending events in order. Every caller enqueues its
    /// own event before calling this, but only one caller at a time
    /// actually runs the loop below (claimed by flipping `draining` in
    /// the same lock acquisition as the pop); the rest return
    /// immediately, relying on the active drainer to reach their event
    /// too since the loop only stops once it observes the queue empty
    /// under that same lock. This keeps delivery single-threaded even
    /// when `trigger` is called from several threads at once.
    fn drain(&self) {
        loop {
            let item = {
                let mut state = self.state.lock();
                if state.draining {
                    return;
                }
                match state.pending.pop_front() {
                    Some(item) => {
                        state.draining = true;
                        item
                    }
                    None => return,
                }
            };
            debug!("event dispatcher: delivering {:?}", item.event);
            (self.deliver)(&item.event);
            if let Some(completion) = item.completion {
                completion.send();
            }
            self.state.lock().draining = false;
        }
    }

    /// Flush the work queue and assert it is empty.
    pub fn fini(&self) {
        *self.closing.lock() = true;
        self.drain();
        debug_assert!(self.state.lock().pending.is_empty());
    }
}
