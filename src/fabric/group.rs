//! Group bring-up (C3.3) and the group-as-driver command hub (C3.6).

use super::{
    group_cmd, Arg, EventArg, GetLeafArg, LeafCall, PutLeafArg, Registry, Resource, ResourceFlags,
    SubdeviceId, CMD_EVENT,
};
use crate::error::{DeviceError, DeviceResult};
use crate::events::Event;
use crate::metadata::Blob;
use crate::pool::{Match, SubdevicePool};
use crate::sync::Mutex;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};

/// A BAR-resolution callback supplied by the embedding PCIe shim: given
/// a `pcie_bar_mapping` index, return that BAR's start address.
pub type BarResolver = Arc<dyn Fn(u32) -> DeviceResult<u64> + Send + Sync>;

pub struct Group {
    pub instance: u32,
    blob: Mutex<Blob>,
    pool: SubdevicePool,
    leaves_created: Mutex<bool>,
    bar: BarResolver,
    registry: Arc<Registry>,
}

impl Group {
    pub fn new(instance: u32, blob: Blob, bar: BarResolver, registry: Arc<Registry>) -> Self {
        Group {
            instance,
            blob: Mutex::new(blob),
            pool: SubdevicePool::init("group"),
            leaves_created: Mutex::new(false),
            bar,
            registry,
        }
    }

    /// Run bring-up once: walk the registry in enum order, claim
    /// matching endpoints out of the group blob into a child blob per
    /// driver, probe the driver when its claim threshold is met.
    /// Returns `Ok(())`, or `Err(ChildFailed)` if at least one driver
    /// failed to probe (the successful leaves are left in place).
    pub fn init_children(&self) -> DeviceResult {
        let registry = &self.registry;
        let mut leaves_created = self.leaves_created.lock();
        if *leaves_created {
            return Err(DeviceError::Exists);
        }

        let mut any_failed = false;
        for id in registry.ordered() {
            if id == SubdeviceId::Group {
                continue;
            }
            let claims = registry.with_driver(id, |d| d.claims.clone());
            let claims = match claims {
                Some(c) => c,
                None => continue,
            };

            let mut child_blob = match Blob::create() {
                Ok(b) => b,
                Err(e) => {
                    warn!("group {}: failed to allocate child blob for {:?}: {:?}", self.instance, id, e);
                    any_failed = true;
                    continue;
                }
            };
            let mut claimed = 0usize;

            {
                let mut group_blob = self.blob.lock();
                for claim in &claims {
                    let ep_name = match &claim.ep_name {
                        Some(name) => name.clone(),
                        None => {
                            let compat = match &claim.compat {
                                Some(c) => c,
                                None => continue,
                            };
                            match group_blob.get_compatible_endpoint(compat) {
                                Ok(name) => name,
                                Err(_) => continue,
                            }
                        }
                    };
                    if child_blob
                        .copy_endpoint(&group_blob, &ep_name, claim.compat.as_deref(), None)
                        .is_ok()
                    {
                        let _ = group_blob.del_endpoint(&ep_name, claim.compat.as_deref());
                        claimed += 1;
                    }
                }

                let total_min: usize = claims.iter().map(|c| c.min_count).sum();
                if claimed < total_min {
                    // Return the claimed endpoints to the parent: overlay
                    // the child blob back onto the group blob.
                    let _ = group_blob.copy_all_eps(&child_blob);
                    continue;
                }
            }

            let resources = derive_resources(&child_blob, &self.bar);
            let resources = match resources {
                Ok(r) => r,
                Err(e) => {
                    warn!("group {}: resource conflict bringing up {:?}: {:?}", self.instance, id, e);
                    any_failed = true;
                    continue;
                }
            };
            let endpoint_names = endpoint_names(&child_blob);

            let probed = registry.with_driver(id, |d| (d.probe)(child_blob.clone()));
            let leaf = match probed {
                Some(Ok(leaf)) => leaf,
                Some(Err(e)) => {
                    warn!("group {}: probe failed for {:?}: {:?}", self.instance, id, e);
                    any_failed = true;
                    continue;
                }
                None => continue,
            };

            match self.pool.add(id, child_blob, resources, endpoint_names, leaf) {
                Ok(instance) => {
                    debug!("group {}: brought up {:?}:{}", self.instance, id, instance);
                }
                Err(e) => {
                    warn!("group {}: pool.add failed for {:?}: {:?}", self.instance, id, e);
                    any_failed = true;
                }
            }
        }

        *leaves_created = true;
        if any_failed {
            Err(DeviceError::ChildFailed)
        } else {
            Ok(())
        }
    }

    pub fn fini_children(&self) {
        self.pool.fini();
    }

    pub fn get_leaf(&self, m: Match, holder: &str) -> DeviceResult<Arc<crate::pool::Leaf>> {
        self.pool.get(m, holder)
    }

    pub fn put_leaf(&self, leaf: &crate::pool::Leaf, holder: &str) {
        self.pool.put(leaf, holder)
    }

    pub fn contains(&self, id: SubdeviceId, instance: u32) -> bool {
        self.pool.contains(id, instance)
    }

    /// Forward `event` to root as `EVENT`; used when a leaf asks its
    /// group to propagate something up rather than broadcast down.
    pub fn trigger_event(&self, event: &Event) {
        self.pool.trigger_event(|leaf| leaf.dispatch_event(event));
    }

    /// Broadcast `event` down to every leaf in this group's pool.
    pub fn handle_event(&self, event: &Event) {
        self.pool.handle_event(|leaf| leaf.dispatch_event(event));
    }
}

fn endpoint_names(blob: &Blob) -> Vec<String> {
    let mut names = Vec::new();
    let mut cur: Option<String> = None;
    loop {
        match blob.get_next_endpoint(cur.as_deref(), None) {
            Ok(Some((name, _))) => {
                names.push(name.clone());
                cur = Some(name);
            }
            _ => break,
        }
    }
    names
}

fn derive_resources(blob: &Blob, bar: &BarResolver) -> DeviceResult<Vec<Resource>> {
    let mut resources = Vec::new();
    let mut cur: Option<String> = None;
    loop {
        let next = blob.get_next_endpoint(cur.as_deref(), None);
        let (name, _) = match next {
            Ok(Some(n)) => n,
            Ok(None) => break,
            Err(_) => break,
        };
        cur = Some(name.clone());

        if let Ok(reg) = blob.get_prop(Some(&name), None, "reg") {
            if reg.len() == 16 {
                let bar_offset = u64::from_be_bytes(reg[0..8].try_into().unwrap());
                let size = u64::from_be_bytes(reg[8..16].try_into().unwrap());
                let mapping = blob
                    .get_prop(Some(&name), None, "pcie_bar_mapping")
                    .ok()
                    .and_then(|b| b.get(0..4).map(|s| u32::from_be_bytes(s.try_into().unwrap())))
                    .unwrap_or(0);
                let bar_start = bar(mapping)?;
                resources.push(Resource {
                    start: bar_start + bar_offset,
                    end: bar_start + bar_offset + size,
                    flags: ResourceFlags::MEM,
                    name,
                });
            }
        }
    }
    Ok(resources)
}

impl LeafCall for Group {
    fn leaf_call(&self, cmd: u32, arg: Arg) -> DeviceResult<i32> {
        match cmd {
            CMD_EVENT => {
                let event_arg = arg
                    .downcast_mut::<EventArg>()
                    .ok_or(DeviceError::Invalid)?;
                self.handle_event(&event_arg.0);
                Ok(0)
            }
            group_cmd::GET_LEAF => {
                let get_arg = arg.downcast_mut::<GetLeafArg>().ok_or(DeviceError::Invalid)?;
                get_arg.out = Some(self.get_leaf(get_arg.m.as_match(), &get_arg.holder)?);
                Ok(0)
            }
            group_cmd::PUT_LEAF => {
                let put_arg = arg.downcast_mut::<PutLeafArg>().ok_or(DeviceError::Invalid)?;
                self.put_leaf(&put_arg.leaf, &put_arg.holder);
                Ok(0)
            }
            group_cmd::INIT_CHILDREN => {
                self.init_children()?;
                Ok(0)
            }
            group_cmd::TRIGGER_EVENT => {
                let event_arg = arg
                    .downcast_mut::<EventArg>()
                    .ok_or(DeviceError::Invalid)?;
                self.trigger_event(&event_arg.0);
                Ok(0)
            }
            group_cmd::FINI_CHILDREN => {
                self.fini_children();
                Ok(0)
            }
            _ => Err(super::invalid_command()),
        }
    }
}
