//! Subdevice pool (C2): a reference-counted, ordered registry of leaf
//! instances with wait-for-quiesce deletion and a matcher protocol.

use crate::error::{DeviceError, DeviceResult};
use crate::metadata::Blob;
use crate::sync::{Mutex, Signal};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitmap_allocator::{BitAlloc, BitAlloc256};
use core::fmt::Write as _;
use log::{error, warn};

use crate::events::Event;
use crate::fabric::{Arg, EventArg, LeafCall, Resource, SubdeviceId, CMD_EVENT};
use alloc::boxed::Box;

/// Sentinel matchers for [`SubdevicePool::get`]'s directional-iteration
/// mode: `arg` names the leaf to walk from rather than a search key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Match<'a> {
    /// Match a specific `(id, instance)` pair.
    Id(SubdeviceId, u32),
    /// First leaf whose endpoint set contains `ep_name`.
    EpName(&'a str),
    /// Directional walk: the entry right after `arg`, in insertion
    /// order.
    Next(u64),
    /// Directional walk: the entry right before `arg`, in insertion
    /// order.
    Prev(u64),
    /// Any leaf (used by lookups that only care "does one exist").
    Any,
}

/// `(holding-device-name, refcount)`: who is currently holding a leaf.
struct Holder {
    name: String,
    count: u32,
}

pub struct Leaf {
    pub id: SubdeviceId,
    pub instance: u32,
    /// Stable identity used by [`Match::Next`]/[`Match::Prev`] so a
    /// directional walk survives entries being removed between calls.
    pub(crate) seq: u64,
    pub blob: Blob,
    pub resources: Vec<Resource>,
    pub endpoint_names: Vec<String>,
    /// The driver's own `leaf_call` implementation, dispatched to for
    /// `EVENT` and any leaf-custom command.
    pub handler: Box<dyn LeafCall>,
    holders: Mutex<Vec<Holder>>,
    drained: Signal,
}

impl Leaf {
    fn new(
        id: SubdeviceId,
        instance: u32,
        seq: u64,
        blob: Blob,
        resources: Vec<Resource>,
        endpoint_names: Vec<String>,
        handler: Box<dyn LeafCall>,
    ) -> Self {
        Leaf {
            id,
            instance,
            seq,
            blob,
            resources,
            endpoint_names,
            handler,
            holders: Mutex::new(Vec::new()),
            drained: Signal::new(),
        }
    }

    /// Invoke the `EVENT` command against this leaf's handler.
    pub fn dispatch_event(&self, event: &Event) {
        let mut arg = EventArg(*event);
        let erased: Arg = &mut arg;
        if let Err(e) = self.handler.leaf_call(CMD_EVENT, erased) {
            warn!("leaf {:?}:{} failed to handle event: {:?}", self.id, self.instance, e);
        }
    }

    fn has_holders(&self) -> bool {
        !self.holders.lock().is_empty()
    }

    fn hold(&self, holder: &str) {
        let mut holders = self.holders.lock();
        if let Some(h) = holders.iter_mut().find(|h| h.name == holder) {
            h.count += 1;
        } else {
            holders.push(Holder { name: holder.to_string(), count: 1 });
        }
    }

    fn release(&self, holder: &str) {
        let mut holders = self.holders.lock();
        if let Some(idx) = holders.iter().position(|h| h.name == holder) {
            holders[idx].count -= 1;
            if holders[idx].count == 0 {
                holders.remove(idx);
            }
        }
        if holders.is_empty() {
            self.drained.send();
        }
    }

    pub fn format_holders(&self) -> String {
        let holders = self.holders.lock();
        let mut out = String::new();
        for h in holders.iter() {
            let _ = write!(out, "{}:{} ", h.name, h.count);
        }
        out
    }
}

/// An ordered list of leaves, guarded by a single lock, with wait-for-
/// quiesce deletion.
/// Upper bound on live instances of a single [`SubdeviceId`], matching the
/// `[0, 128)` instance-number space spec.md's pool requires.
const MAX_INSTANCES: usize = 128;

pub struct SubdevicePool {
    owner: String,
    leaves: Mutex<Vec<Arc<Leaf>>>,
    closing: Mutex<bool>,
    next_seq: Mutex<u64>,
    instances: Mutex<BTreeMap<SubdeviceId, BitAlloc256>>,
}

impl SubdevicePool {
    pub fn init(owner_device: &str) -> Self {
        SubdevicePool {
            owner: owner_device.to_string(),
            leaves: Mutex::new(Vec::new()),
            closing: Mutex::new(false),
            next_seq: Mutex::new(0),
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    fn alloc_instance(&self, id: SubdeviceId) -> DeviceResult<u32> {
        let mut table = self.instances.lock();
        let bitmap = table.entry(id).or_insert_with(|| {
            let mut b = BitAlloc256::DEFAULT;
            b.insert(0..MAX_INSTANCES);
            b
        });
        bitmap.alloc().map(|n| n as u32).ok_or(DeviceError::OutOfMemory)
    }

    fn free_instance(&self, id: SubdeviceId, instance: u32) {
        let mut table = self.instances.lock();
        if let Some(bitmap) = table.get_mut(&id) {
            bitmap.dealloc(instance as usize);
        }
    }

    /// Construct and append a new leaf; refuses with [`DeviceError::NotFound`]
    /// (NODEV) once the pool is closing.
    pub fn add(
        &self,
        id: SubdeviceId,
        blob: Blob,
        resources: Vec<Resource>,
        endpoint_names: Vec<String>,
        handler: Box<dyn LeafCall>,
    ) -> DeviceResult<u32> {
        if *self.closing.lock() {
            return Err(DeviceError::NotFound);
        }
        let instance = self.alloc_instance(id)?;
        let seq = {
            let mut seq = self.next_seq.lock();
            let cur = *seq;
            *seq += 1;
            cur
        };
        let leaf = Arc::new(Leaf::new(id, instance, seq, blob, resources, endpoint_names, handler));
        self.leaves.lock().push(leaf);
        Ok(instance)
    }

    /// Wait for one leaf's holder set to drain, killably: if the wait is
    /// interrupted (`cancel`), its holders are force-dropped and the
    /// event is logged.
    fn quiesce(&self, leaf: &Leaf) {
        if leaf.has_holders() {
            if !leaf.drained.wait() {
                error!(
                    "{}: forcing removal of leaf {:?}:{} with outstanding holders after interrupted wait",
                    self.owner, leaf.id, leaf.instance
                );
                leaf.holders.lock().clear();
            }
        }
    }

    /// Remove one leaf by `(id, instance)`, waiting for it to quiesce.
    /// The leaf stays in `leaves` (so a racing [`get`](SubdevicePool::get)
    /// can still find it and add a hold) until `quiesce` returns; it is
    /// unlinked only once no holder remains.
    pub fn del(&self, id: SubdeviceId, instance: u32) -> DeviceResult {
        let leaf = {
            let leaves = self.leaves.lock();
            leaves
                .iter()
                .find(|l| l.id == id && l.instance == instance)
                .cloned()
                .ok_or(DeviceError::NotFound)?
        };
        self.quiesce(&leaf);
        {
            let mut leaves = self.leaves.lock();
            if let Some(idx) = leaves.iter().position(|l| l.id == id && l.instance == instance) {
                leaves.remove(idx);
            }
        }
        self.free_instance(id, instance);
        Ok(())
    }

    /// Set `closing`, then drain the list strictly in reverse insertion
    /// order, quiescing each entry before dropping it. Idempotent. Each
    /// entry is unlinked only after its own `quiesce` returns, matching
    /// `del`'s sequencing.
    pub fn fini(&self) {
        *self.closing.lock() = true;
        loop {
            let leaf = match self.leaves.lock().last().cloned() {
                Some(l) => l,
                None => break,
            };
            self.quiesce(&leaf);
            self.leaves.lock().pop();
            self.free_instance(leaf.id, leaf.instance);
        }
    }

    /// Look up a leaf per `Match`, hold it for `holder`, and return it.
    pub fn get(&self, m: Match, holder: &str) -> DeviceResult<Arc<Leaf>> {
        let leaves = self.leaves.lock();
        let found = match m {
            Match::Id(id, instance) => leaves.iter().find(|l| l.id == id && l.instance == instance),
            Match::EpName(name) => leaves.iter().find(|l| l.endpoint_names.iter().any(|n| n == name)),
            Match::Any => leaves.first(),
            Match::Next(seq) => leaves.iter().find(|l| l.seq > seq).min_by_key(|l| l.seq),
            Match::Prev(seq) => leaves.iter().filter(|l| l.seq < seq).max_by_key(|l| l.seq),
        };
        let leaf = found.ok_or(DeviceError::NotFound)?.clone();
        leaf.hold(holder);
        Ok(leaf)
    }

    /// Release a previously [`get`](SubdevicePool::get)-held leaf.
    pub fn put(&self, leaf: &Leaf, holder: &str) {
        leaf.release(holder);
    }

    pub fn get_holders(&self, leaf: &Leaf) -> String {
        leaf.format_holders()
    }

    /// Forward `event` to `on_leaf` for every leaf, holding each only
    /// momentarily so a concurrent `quiesce` can't race ahead and tear
    /// the leaf down mid-dispatch.
    pub fn trigger_event<F: Fn(&Leaf)>(&self, on_leaf: F) {
        const EVENT_HOLDER: &str = "event-dispatch";
        let snapshot: Vec<Arc<Leaf>> = self.leaves.lock().iter().cloned().collect();
        for leaf in snapshot.iter() {
            leaf.hold(EVENT_HOLDER);
            on_leaf(leaf);
            leaf.release(EVENT_HOLDER);
        }
    }

    /// Broadcast an event handler call down to every leaf.
    pub fn handle_event<F: Fn(&Leaf)>(&self, on_leaf: F) {
        self.trigger_event(on_leaf);
    }

    /// `true` iff a leaf with this `(id, instance)` is currently in the
    /// pool, without taking a hold on it.
    pub fn contains(&self, id: SubdeviceId, instance: u32) -> bool {
        self.leaves.lock().iter().any(|l| l.id == id && l.instance == instance)
    }

    pub fn len(&self) -> usize {
        self.leaves.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SubdevicePool {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!("{}: pool dropped with {} leaves still present", self.owner, self.len());
        }
    }
}

/// A handler that answers every command with `NotSupported`, for tests
/// and for leaves that have no commands of their own beyond `EVENT`.
pub struct NoopHandler;

impl LeafCall for NoopHandler {
    fn leaf_call(&self, cmd: u32, _arg: Arg) -> DeviceResult<i32> {
        if cmd == CMD_EVENT {
            Ok(0)
        } else {
            Err(DeviceError::NotSupported)
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::metadata::Blob;

    fn blob() -> Blob {
        Blob::create().unwrap()
    }

    fn add(pool: &SubdevicePool, id: SubdeviceId) -> u32 {
        pool.add(id, blob(), Vec::new(), Vec::new(), Box::new(NoopHandler)).unwrap()
    }

    #[test]
    fn add_then_get_holds_and_put_releases() {
        let pool = SubdevicePool::init("test");
        let inst = add(&pool, SubdeviceId::Test);
        let leaf = pool.get(Match::Id(SubdeviceId::Test, inst), "holderA").unwrap();
        assert_eq!(pool.get_holders(&leaf), "holderA:1 ");
        pool.put(&leaf, "holderA");
        assert_eq!(pool.get_holders(&leaf), "");
    }

    #[test]
    fn del_waits_for_drain_then_removes() {
        let pool = SubdevicePool::init("test");
        let inst = add(&pool, SubdeviceId::Test);
        let leaf = pool.get(Match::Id(SubdeviceId::Test, inst), "holderA").unwrap();
        pool.put(&leaf, "holderA");
        drop(leaf);
        pool.del(SubdeviceId::Test, inst).unwrap();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn fini_tears_down_in_reverse_order() {
        let pool = SubdevicePool::init("test");
        add(&pool, SubdeviceId::Test);
        add(&pool, SubdeviceId::Test);
        pool.fini();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn instance_numbers_are_unique_per_id() {
        let pool = SubdevicePool::init("test");
        let a = add(&pool, SubdeviceId::Test);
        let b = add(&pool, SubdeviceId::Test);
        assert_ne!(a, b);
    }
}
