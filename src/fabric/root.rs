//! Root (C3.5): exactly one per PCIe function. Owns the group pool, the
//! event dispatcher, and the physical-function callback table.

use super::group::{BarResolver, Group};
use super::{
    root_cmd, Arg, CreateGroupArg, EventArg, GetIdArg, GetLeafArg, GetLeafHoldersArg, GetResourceArg,
    HwmonRegisterArg, LeafCall, LookupGroupArg, PutLeafArg, Registry, RemoveGroupArg, SubdeviceId,
    WaitGroupBringupArg, CMD_EVENT,
};
use crate::error::{DeviceError, DeviceResult};
use crate::events::{Event, EventDispatcher};
use crate::metadata::Blob;
use crate::pool::{Leaf, Match};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};

/// Synchronous callbacks back to the PCIe shim.
pub struct PfCallbacks {
    pub get_id: Arc<dyn Fn() -> (u16, u16, u16, u16) + Send + Sync>,
    pub get_resource: BarResolver,
    pub hot_reset: Arc<dyn Fn() -> DeviceResult + Send + Sync>,
    /// Opaque pass-through to the host's hwmon glue; the payload is
    /// never interpreted here.
    pub hwmon_register: Arc<dyn Fn(&[u8]) -> DeviceResult + Send + Sync>,
}

struct GroupEntry {
    instance: u32,
    group: Arc<Group>,
}

type RootDispatcher = EventDispatcher<Box<dyn Fn(&Event) + Send + Sync>>;

pub struct Root {
    groups: Arc<Mutex<Vec<GroupEntry>>>,
    next_instance: Mutex<u32>,
    registry: Arc<Registry>,
    pf: PfCallbacks,
    dispatcher: RootDispatcher,
}

impl Root {
    pub fn probe(registry: Registry, pf: PfCallbacks) -> Arc<Root> {
        let groups: Arc<Mutex<Vec<GroupEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let deliver_groups = groups.clone();
        let deliver: Box<dyn Fn(&Event) + Send + Sync> = Box::new(move |event: &Event| {
            let snapshot: Vec<Arc<Group>> = deliver_groups.lock().iter().map(|e| e.group.clone()).collect();
            for group in snapshot.iter() {
                group.handle_event(event);
            }
        });
        Arc::new(Root {
            groups,
            next_instance: Mutex::new(0),
            registry: Arc::new(registry),
            pf,
            dispatcher: EventDispatcher::new(deliver),
        })
    }

    /// Allocate an instance, bring up a new `Group` from `dtb`, and
    /// return the instance. Bring-up runs synchronously; the bring-up
    /// worker described by the design maps onto this call plus the
    /// `POST_CREATION` broadcast it triggers on success.
    pub fn create_group(&self, dtb: Blob) -> DeviceResult<u32> {
        let instance = {
            let mut next = self.next_instance.lock();
            let cur = *next;
            *next += 1;
            cur
        };
        let group = Arc::new(Group::new(instance, dtb, self.pf.get_resource.clone(), self.registry.clone()));
        self.groups.lock().push(GroupEntry { instance, group: group.clone() });

        let result = group.init_children();
        self.dispatcher.trigger_creation(SubdeviceId::Group, instance);
        result.map(|_| instance).or_else(|e| if e == DeviceError::ChildFailed { Ok(instance) } else { Err(e) })
    }

    /// `true` iff the most recent `create_group` bring-up recorded no
    /// failure.
    pub fn wait_for_bringup(&self, last_result: DeviceResult) -> bool {
        last_result.is_ok()
    }

    /// Cascading reverse-order removal of `instance` and every group
    /// created after it.
    pub fn remove_group(&self, instance: u32) -> DeviceResult {
        let victims: Vec<Arc<Group>> = {
            let mut groups = self.groups.lock();
            let idx = groups
                .iter()
                .position(|g| g.instance == instance)
                .ok_or(DeviceError::NotFound)?;
            groups.split_off(idx).into_iter().map(|e| e.group).collect()
        };
        for group in victims.iter().rev() {
            debug!("root: tearing down group {}", group.instance);
            group.fini_children();
        }
        Ok(())
    }

    /// Iterate last -> first, returning the first group whose pool has
    /// a leaf matching `m`.
    pub fn lookup_group(&self, m: Match) -> DeviceResult<u32> {
        let groups = self.groups.lock();
        for entry in groups.iter().rev() {
            let hit = match entry.group.get_leaf(m, "lookup_group") {
                Ok(leaf) => {
                    entry.group.put_leaf(&leaf, "lookup_group");
                    true
                }
                Err(_) => false,
            };
            if hit {
                return Ok(entry.instance);
            }
        }
        Err(DeviceError::NotFound)
    }

    /// Delegate to each group's `get` until one succeeds.
    pub fn get_leaf(&self, m: Match, holder: &str) -> DeviceResult<Arc<Leaf>> {
        let groups = self.groups.lock();
        for entry in groups.iter() {
            if let Ok(leaf) = entry.group.get_leaf(m, holder) {
                return Ok(leaf);
            }
        }
        Err(DeviceError::NotFound)
    }

    pub fn put_leaf(&self, leaf: &Leaf, holder: &str) {
        let groups = self.groups.lock();
        for entry in groups.iter() {
            if entry.group.contains(leaf.id, leaf.instance) {
                entry.group.put_leaf(leaf, holder);
                return;
            }
        }
        warn!("put_leaf: leaf {:?}:{} not found in any group", leaf.id, leaf.instance);
    }

    /// Hold `m`'s leaf just long enough to format its holder list.
    pub fn get_leaf_holders(&self, m: Match) -> DeviceResult<alloc::string::String> {
        let leaf = self.get_leaf(m, "get_leaf_holders")?;
        let holders = leaf.format_holders();
        self.put_leaf(&leaf, "get_leaf_holders");
        Ok(holders)
    }

    /// Invoke the PF `hot_reset` callback; no fabric state changes at
    /// this layer.
    pub fn hot_reset(&self) -> DeviceResult {
        (self.pf.hot_reset)()
    }

    pub fn get_id(&self) -> (u16, u16, u16, u16) {
        (self.pf.get_id)()
    }

    pub fn get_resource(&self, bar_idx: u32) -> DeviceResult<u64> {
        (self.pf.get_resource)(bar_idx)
    }

    /// Pass `desc` through to the PF `hwmon_register` callback.
    pub fn hwmon_register(&self, desc: &[u8]) -> DeviceResult {
        (self.pf.hwmon_register)(desc)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &RootDispatcher {
        &self.dispatcher
    }
}

impl LeafCall for Root {
    fn leaf_call(&self, cmd: u32, arg: Arg) -> DeviceResult<i32> {
        match cmd {
            CMD_EVENT => {
                let event_arg = arg.downcast_mut::<EventArg>().ok_or(DeviceError::Invalid)?;
                self.dispatcher.trigger(event_arg.0, false)?;
                Ok(0)
            }
            root_cmd::GET_LEAF => {
                let get_arg = arg.downcast_mut::<GetLeafArg>().ok_or(DeviceError::Invalid)?;
                get_arg.out = Some(self.get_leaf(get_arg.m.as_match(), &get_arg.holder)?);
                Ok(0)
            }
            root_cmd::PUT_LEAF => {
                let put_arg = arg.downcast_mut::<PutLeafArg>().ok_or(DeviceError::Invalid)?;
                self.put_leaf(&put_arg.leaf, &put_arg.holder);
                Ok(0)
            }
            root_cmd::GET_LEAF_HOLDERS => {
                let holders_arg = arg.downcast_mut::<GetLeafHoldersArg>().ok_or(DeviceError::Invalid)?;
                holders_arg.out = Some(self.get_leaf_holders(holders_arg.m.as_match())?);
                Ok(0)
            }
            root_cmd::CREATE_GROUP => {
                let create_arg = arg.downcast_mut::<CreateGroupArg>().ok_or(DeviceError::Invalid)?;
                let dtb = create_arg.dtb.take().ok_or(DeviceError::Invalid)?;
                create_arg.out = Some(self.create_group(dtb)?);
                Ok(0)
            }
            root_cmd::REMOVE_GROUP => {
                let remove_arg = arg.downcast_mut::<RemoveGroupArg>().ok_or(DeviceError::Invalid)?;
                self.remove_group(remove_arg.instance)?;
                Ok(0)
            }
            root_cmd::LOOKUP_GROUP => {
                let lookup_arg = arg.downcast_mut::<LookupGroupArg>().ok_or(DeviceError::Invalid)?;
                lookup_arg.out = Some(self.lookup_group(lookup_arg.m.as_match())?);
                Ok(0)
            }
            root_cmd::WAIT_GROUP_BRINGUP => {
                let wait_arg = arg.downcast_mut::<WaitGroupBringupArg>().ok_or(DeviceError::Invalid)?;
                wait_arg.out = Some(self.wait_for_bringup(wait_arg.last_result));
                Ok(0)
            }
            root_cmd::EVENT_ASYNC => {
                let event_arg = arg.downcast_mut::<EventArg>().ok_or(DeviceError::Invalid)?;
                self.dispatcher.trigger(event_arg.0, true)?;
                Ok(0)
            }
            root_cmd::GET_RESOURCE => {
                let resource_arg = arg.downcast_mut::<GetResourceArg>().ok_or(DeviceError::Invalid)?;
                resource_arg.out = Some(self.get_resource(resource_arg.bar_idx)?);
                Ok(0)
            }
            root_cmd::GET_ID => {
                let id_arg = arg.downcast_mut::<GetIdArg>().ok_or(DeviceError::Invalid)?;
                id_arg.out = Some(self.get_id());
                Ok(0)
            }
            root_cmd::HOT_RESET => {
                self.hot_reset()?;
                Ok(0)
            }
            root_cmd::HWMON_REGISTER => {
                let hwmon_arg = arg.downcast_mut::<HwmonRegisterArg>().ok_or(DeviceError::Invalid)?;
                self.hwmon_register(&hwmon_arg.desc)?;
                Ok(0)
            }
            _ => Err(super::invalid_command()),
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::metadata::Blob;

    fn pf() -> PfCallbacks {
        PfCallbacks {
            get_id: Arc::new(|| (0x10ee, 0x5000, 0, 0)),
            get_resource: Arc::new(|_: u32| Ok(0)),
            hot_reset: Arc::new(|| Ok(())),
            hwmon_register: Arc::new(|_: &[u8]| Ok(())),
        }
    }

    #[test]
    fn s3_remove_group_cascades_to_later_groups() {
        let root = Root::probe(Registry::new(), pf());
        let g0 = root.create_group(Blob::create().unwrap()).unwrap();
        let g1 = root.create_group(Blob::create().unwrap()).unwrap();
        let g2 = root.create_group(Blob::create().unwrap()).unwrap();

        root.remove_group(g1).unwrap();

        assert!(root.lookup_group(Match::Id(SubdeviceId::Group, g0)).is_err());
        assert_eq!(root.groups.lock().len(), 1);
        assert_eq!(root.groups.lock()[0].instance, g0);
        let _ = g2;
    }

    #[test]
    fn remove_group_rejects_unknown_instance() {
        let root = Root::probe(Registry::new(), pf());
        assert_eq!(root.remove_group(42).unwrap_err(), DeviceError::NotFound);
    }

    #[test]
    fn s4_remove_group_blocks_until_holder_releases() {
        use crate::fabric::{EndpointClaim, LeafDriver};
        use crate::metadata::EndpointDesc;
        use crate::pool::{Match, NoopHandler};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Barrier;
        use std::time::Duration;

        let registry = Registry::new();
        registry
            .register(LeafDriver {
                id: SubdeviceId::Test,
                claims: alloc::vec![EndpointClaim { ep_name: Some("ep_test_a".into()), compat: None, min_count: 1 }],
                probe: Box::new(|_blob| Ok(Box::new(NoopHandler) as Box<dyn LeafCall>)),
            })
            .unwrap();

        let root = Root::probe(registry, pf());
        let mut blob = Blob::create().unwrap();
        blob.add_endpoint(&EndpointDesc {
            name: "ep_test_a".into(),
            bar_index: 0,
            bar_offset: 0,
            size: 0,
            compat_family: None,
            compat_version: None,
        })
        .unwrap();
        let instance = root.create_group(blob).unwrap();

        let leaf = root.get_leaf(Match::Id(SubdeviceId::Test, 0), "threadA").unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let b_done = Arc::new(AtomicBool::new(false));
        let root_for_b = root.clone();
        let barrier_b = barrier.clone();
        let b_done_for_b = b_done.clone();
        let handle = std::thread::spawn(move || {
            barrier_b.wait();
            root_for_b.remove_group(instance).unwrap();
            b_done_for_b.store(true, Ordering::SeqCst);
        });

        barrier.wait();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!b_done.load(Ordering::SeqCst), "remove_group completed before the holder released");

        root.put_leaf(&leaf, "threadA");
        handle.join().unwrap();
        assert!(b_done.load(Ordering::SeqCst));
    }
}
