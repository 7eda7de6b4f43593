//! Black-box, multi-module scenarios exercised purely through the
//! crate's public API: metadata, pool, and fabric working together the
//! way an embedding PCIe shim would drive them.

use accel_drivers::error::DeviceError;
use accel_drivers::fabric::{EndpointClaim, LeafCall, LeafDriver, PfCallbacks, Registry, Root, SubdeviceId};
use accel_drivers::metadata::{Blob, EndpointDesc};
use accel_drivers::pool::{Match, NoopHandler};
use std::sync::Arc;

fn pf() -> PfCallbacks {
    PfCallbacks {
        get_id: Arc::new(|| (0x10ee, 0x5000, 0, 0)),
        get_resource: Arc::new(|_: u32| Ok(0)),
        hot_reset: Arc::new(|| Ok(())),
        hwmon_register: Arc::new(|_: &[u8]| Ok(())),
    }
}

fn endpoint(name: &str, compat: &str) -> EndpointDesc {
    EndpointDesc {
        name: name.to_string(),
        bar_index: 0,
        bar_offset: 0,
        size: 0,
        compat_family: Some(compat.to_string()),
        compat_version: None,
    }
}

/// S1: an empty blob brings up a group with zero leaves.
#[test]
fn s1_empty_blob_bring_up_has_no_leaves() {
    let root = Root::probe(Registry::new(), pf());
    let instance = root.create_group(Blob::create().unwrap()).unwrap();
    assert_eq!(instance, 0);
    assert_eq!(root.get_leaf(Match::Any, "s1").unwrap_err(), DeviceError::NotFound);
}

/// S2: two disjoint endpoints are each claimed by their own driver, and
/// the parent blob ends up fully drained.
#[test]
fn s2_two_leaf_group_claims_disjointly() {
    let registry = Registry::new();
    registry
        .register(LeafDriver {
            id: SubdeviceId::Test,
            claims: vec![EndpointClaim { ep_name: Some("ep_test_a".into()), compat: None, min_count: 1 }],
            probe: Box::new(|_blob| Ok(Box::new(NoopHandler) as Box<dyn LeafCall>)),
        })
        .unwrap();
    registry
        .register(LeafDriver {
            id: SubdeviceId::Clock,
            claims: vec![EndpointClaim { ep_name: Some("ep_clock_0".into()), compat: None, min_count: 1 }],
            probe: Box::new(|_blob| Ok(Box::new(NoopHandler) as Box<dyn LeafCall>)),
        })
        .unwrap();

    let root = Root::probe(registry, pf());
    let mut blob = Blob::create().unwrap();
    blob.add_endpoint(&endpoint("ep_test_a", "test")).unwrap();
    blob.add_endpoint(&endpoint("ep_clock_0", "clock")).unwrap();
    root.create_group(blob).unwrap();

    let leaf = root.get_leaf(Match::Id(SubdeviceId::Clock, 0), "s2").unwrap();
    root.put_leaf(&leaf, "s2");
}

/// S3: removing a middle group cascades to every group created after
/// it, in reverse order, leaving earlier groups untouched.
#[test]
fn s3_delete_cascade_removes_later_groups_first() {
    let root = Root::probe(Registry::new(), pf());
    let g0 = root.create_group(Blob::create().unwrap()).unwrap();
    let g1 = root.create_group(Blob::create().unwrap()).unwrap();
    let _g2 = root.create_group(Blob::create().unwrap()).unwrap();

    root.remove_group(g1).unwrap();

    assert_eq!(root.lookup_group(Match::Id(SubdeviceId::Group, g0)).unwrap_err(), DeviceError::NotFound);
    assert_eq!(root.remove_group(g1).unwrap_err(), DeviceError::NotFound);
}

/// S4: a thread blocked on `remove_group` for a held leaf only unblocks
/// once the holder calls `put_leaf`.
#[test]
fn s4_holder_blocks_removal_until_released() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    let registry = Registry::new();
    registry
        .register(LeafDriver {
            id: SubdeviceId::Test,
            claims: vec![EndpointClaim { ep_name: Some("ep_test_a".into()), compat: None, min_count: 1 }],
            probe: Box::new(|_blob| Ok(Box::new(NoopHandler) as Box<dyn LeafCall>)),
        })
        .unwrap();

    let root = Root::probe(registry, pf());
    let mut blob = Blob::create().unwrap();
    blob.add_endpoint(&endpoint("ep_test_a", "test")).unwrap();
    let instance = root.create_group(blob).unwrap();

    let leaf = root.get_leaf(Match::Id(SubdeviceId::Test, 0), "s4").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let removed = Arc::new(AtomicBool::new(false));
    let root2 = root.clone();
    let barrier2 = barrier.clone();
    let removed2 = removed.clone();
    let remover = std::thread::spawn(move || {
        barrier2.wait();
        root2.remove_group(instance).unwrap();
        removed2.store(true, Ordering::SeqCst);
    });

    barrier.wait();
    std::thread::sleep(Duration::from_millis(50));
    assert!(!removed.load(Ordering::SeqCst));

    root.put_leaf(&leaf, "s4");
    remover.join().unwrap();
    assert!(removed.load(Ordering::SeqCst));
}
