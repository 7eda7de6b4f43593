//! Metadata engine (C1): the sole authority over flattened device-tree
//! blobs. Every other component treats a [`Blob`] as opaque and goes
//! through the operations here.

mod node;
mod uuid;

pub use uuid::{trans_str2uuid, trans_uuid2str, Uuid};

use crate::error::{DeviceError, DeviceResult};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use node::Node;

/// Sentinel returned by [`Blob::size`] when the blob's encoded size
/// exceeds [`MAX_BLOB_SIZE`].
pub const INVALID_LENGTH: u32 = u32::MAX;
/// Hard cap on a blob's encoded size.
pub const MAX_BLOB_SIZE: u64 = 102_400;
/// Recursion limit for [`Blob::copy_endpoint`] / [`Blob::copy_all_eps`]
/// overlay, guarding against runaway recursion on malformed input.
pub const MAX_OVERLAY_DEPTH: u32 = 5;

const ENDPOINTS: &str = "endpoints";
const INTERFACES: &str = "interfaces";

/// The user-facing record C1 builds blob nodes from.
#[derive(Clone, Debug)]
pub struct EndpointDesc {
    pub name: String,
    pub bar_index: u32,
    pub bar_offset: u64,
    pub size: u64,
    pub compat_family: Option<String>,
    pub compat_version: Option<String>,
}

/// An opaque flattened-tree blob, bounded at [`MAX_BLOB_SIZE`] bytes.
#[derive(Clone)]
pub struct Blob {
    root: Node,
}

impl Blob {
    /// Total encoded size, or [`INVALID_LENGTH`] if it exceeds the cap.
    pub fn size(&self) -> u32 {
        let size = self.root.encoded_size();
        if size > MAX_BLOB_SIZE {
            INVALID_LENGTH
        } else {
            size as u32
        }
    }

    /// Allocate an empty blob: one root node with an empty `endpoints`
    /// subnode.
    pub fn create() -> DeviceResult<Blob> {
        let mut root = Node::new("");
        root.child_or_insert(ENDPOINTS);
        Ok(Blob { root })
    }

    /// Allocate a new blob and overlay `self` onto it.
    pub fn dup(&self) -> DeviceResult<Blob> {
        let mut out = Blob::create()?;
        overlay_node(&mut out.root, &self.root, 0)?;
        if out.size() == INVALID_LENGTH {
            return Err(DeviceError::Invalid);
        }
        Ok(out)
    }

    /// Insert `desc` as a new endpoint under `endpoints`, replacing any
    /// existing endpoint of the same name to preserve the uniqueness
    /// invariant.
    pub fn add_endpoint(&mut self, desc: &EndpointDesc) -> DeviceResult {
        if desc.name.is_empty() {
            return Err(DeviceError::Invalid);
        }
        let mut node = Node::new(&desc.name);
        if desc.size != 0 {
            node.properties
                .insert("pcie_bar_mapping".to_string(), desc.bar_index.to_be_bytes().to_vec());
            let mut reg = Vec::with_capacity(16);
            reg.extend_from_slice(&desc.bar_offset.to_be_bytes());
            reg.extend_from_slice(&desc.size.to_be_bytes());
            node.properties.insert("reg".to_string(), reg);
        }
        if let Some(family) = &desc.compat_family {
            let compat = encode_compatible(family, desc.compat_version.as_deref());
            node.properties.insert("compatible".to_string(), compat);
        }

        let endpoints = self.root.child_or_insert(ENDPOINTS);
        endpoints.remove_child(&desc.name);
        endpoints.children.push(node);

        if self.size() == INVALID_LENGTH {
            self.root.child_mut(ENDPOINTS).unwrap().remove_child(&desc.name);
            return Err(DeviceError::OutOfMemory);
        }
        Ok(())
    }

    /// Remove an endpoint by name, optionally requiring a `compatible`
    /// match too.
    pub fn del_endpoint(&mut self, name: &str, compat: Option<&str>) -> DeviceResult {
        let endpoints = self.root.child_mut(ENDPOINTS).ok_or(DeviceError::NotFound)?;
        let node = endpoints.child(name).ok_or(DeviceError::NotFound)?;
        if let Some(compat) = compat {
            if !node.matches_compat(compat) {
                return Err(DeviceError::NotFound);
            }
        }
        endpoints.remove_child(name);
        Ok(())
    }

    /// Read a property, from an endpoint if `ep_name` is given, or from
    /// the root node otherwise.
    pub fn get_prop(&self, ep_name: Option<&str>, compat: Option<&str>, prop: &str) -> DeviceResult<Vec<u8>> {
        let node = self.resolve_endpoint(ep_name, compat)?;
        node.properties.get(prop).cloned().ok_or(DeviceError::NotFound)
    }

    /// Write a property, symmetric with [`Blob::get_prop`].
    pub fn set_prop(&mut self, ep_name: Option<&str>, compat: Option<&str>, prop: &str, val: &[u8]) -> DeviceResult {
        let node = self.resolve_endpoint_mut(ep_name, compat)?;
        node.properties.insert(prop.to_string(), val.to_vec());
        Ok(())
    }

    fn resolve_endpoint(&self, ep_name: Option<&str>, compat: Option<&str>) -> DeviceResult<&Node> {
        match ep_name {
            None => Ok(&self.root),
            Some(name) => {
                let endpoints = self.root.child(ENDPOINTS).ok_or(DeviceError::NotFound)?;
                let node = endpoints.child(name).ok_or(DeviceError::NotFound)?;
                if let Some(compat) = compat {
                    if !node.matches_compat(compat) {
                        return Err(DeviceError::NotFound);
                    }
                }
                Ok(node)
            }
        }
    }

    fn resolve_endpoint_mut(&mut self, ep_name: Option<&str>, compat: Option<&str>) -> DeviceResult<&mut Node> {
        match ep_name {
            None => Ok(&mut self.root),
            Some(name) => {
                let endpoints = self.root.child_mut(ENDPOINTS).ok_or(DeviceError::NotFound)?;
                if let Some(compat) = compat {
                    let found = endpoints.child(name).ok_or(DeviceError::NotFound)?;
                    if !found.matches_compat(compat) {
                        return Err(DeviceError::NotFound);
                    }
                }
                endpoints.child_mut(name).ok_or(DeviceError::NotFound)
            }
        }
    }

    /// Locate `name` (optionally requiring `compat`) anywhere in `src`
    /// (root included), create it in `self` if absent (under
    /// `endpoints` unless the source was a direct child of the tree
    /// root, in which case at `self`'s own root), then overlay the
    /// source subtree onto it.
    pub fn copy_endpoint(&mut self, src: &Blob, name: &str, compat: Option<&str>, new_name: Option<&str>) -> DeviceResult {
        let (found, at_root) = find_with_parent(&src.root, name, compat).ok_or(DeviceError::NotFound)?;
        let dst_name = new_name.unwrap_or(name);
        let dst_parent = if at_root {
            &mut self.root
        } else {
            self.root.child_or_insert(ENDPOINTS)
        };
        dst_parent.child_or_insert(dst_name);
        let dst_node = dst_parent.child_mut(dst_name).unwrap();
        overlay_node(dst_node, found, 0)?;
        if self.size() == INVALID_LENGTH {
            return Err(DeviceError::Invalid);
        }
        Ok(())
    }

    /// Overlay `src`'s whole `endpoints` subtree onto `self`'s.
    pub fn copy_all_eps(&mut self, src: &Blob) -> DeviceResult {
        let src_endpoints = src.root.child(ENDPOINTS).ok_or(DeviceError::NotFound)?;
        let dst_endpoints = self.root.child_or_insert(ENDPOINTS);
        overlay_node(dst_endpoints, src_endpoints, 0)?;
        if self.size() == INVALID_LENGTH {
            return Err(DeviceError::Invalid);
        }
        Ok(())
    }

    /// Enumerate endpoints. `cur_name = None` returns the first child of
    /// `endpoints`; otherwise the sibling after `cur_name`. Returns
    /// `Ok(None)` once enumeration is exhausted.
    pub fn get_next_endpoint(&self, cur_name: Option<&str>, cur_compat: Option<&str>) -> DeviceResult<Option<(String, Option<String>)>> {
        let endpoints = match self.root.child(ENDPOINTS) {
            Some(e) => e,
            None => return Ok(None),
        };
        let describe = |n: &Node| (n.name.clone(), n.compatible_entries().first().map(|s| s.to_string()));

        match cur_name {
            None => Ok(endpoints.children.first().map(describe)),
            Some(name) => {
                let idx = endpoints
                    .children
                    .iter()
                    .position(|c| c.name == name)
                    .ok_or(DeviceError::NotFound)?;
                if let Some(compat) = cur_compat {
                    if !endpoints.children[idx].matches_compat(compat) {
                        return Err(DeviceError::NotFound);
                    }
                }
                Ok(endpoints.children.get(idx + 1).map(describe))
            }
        }
    }

    /// First endpoint whose `compatible` stringlist matches `compat`
    /// (substring test against each entry).
    pub fn get_compatible_endpoint(&self, compat: &str) -> DeviceResult<String> {
        let endpoints = self.root.child(ENDPOINTS).ok_or(DeviceError::NotFound)?;
        endpoints
            .children
            .iter()
            .find(|n| n.matches_compat(compat))
            .map(|n| n.name.clone())
            .ok_or(DeviceError::NotFound)
    }

    /// Validate that `name` (optionally matching `compat`) exists
    /// anywhere in the tree (preorder, strict-equality name compare).
    pub fn find_endpoint(&self, name: &str, compat: Option<&str>) -> DeviceResult<String> {
        self.root
            .preorder()
            .find(|n| n.name == name && compat.map_or(true, |c| n.matches_compat(c)))
            .map(|n| n.name.clone())
            .ok_or(DeviceError::NotFound)
    }

    /// Canonical name for the endpoint matching `compat`, resolving it
    /// the way group bring-up does when a driver claims by `compat`
    /// rather than by literal endpoint name.
    pub fn get_epname_pointer(&self, compat: &str) -> DeviceResult<String> {
        self.get_compatible_endpoint(compat)
    }

    /// Parse every `interface_uuid` under `interfaces/`, in child order.
    /// Returns an empty list if `interfaces` is absent (count-only
    /// callers see `n = 0`, not an error).
    pub fn get_interface_uuids(&self) -> DeviceResult<Vec<Uuid>> {
        let interfaces = match self.root.child(INTERFACES) {
            Some(n) => n,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(interfaces.children.len());
        for child in &interfaces.children {
            let raw = child.properties.get("interface_uuid").ok_or(DeviceError::Invalid)?;
            let text = core::str::from_utf8(raw).map_err(|_| DeviceError::Invalid)?;
            out.push(trans_str2uuid(text)?);
        }
        Ok(out)
    }

    /// `true` iff every interface UUID in `subset` also appears in
    /// `self`.
    pub fn check_uuids(&self, subset: &Blob) -> DeviceResult<bool> {
        let ours = self.get_interface_uuids()?;
        let theirs = subset.get_interface_uuids()?;
        Ok(theirs.iter().all(|u| ours.contains(u)))
    }

    /// Compact the blob. The in-memory tree representation carries no
    /// encoding slack to reclaim; kept for API parity with callers that
    /// pack before handing a blob off.
    pub fn pack(&mut self) -> DeviceResult {
        Ok(())
    }
}

fn encode_compatible(family: &str, version: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(version) = version {
        out.extend_from_slice(family.as_bytes());
        out.push(b'-');
        out.extend_from_slice(version.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(family.as_bytes());
    out.push(0);
    out
}

/// Overlay `src` onto `dst`: copy every property, then recurse into
/// every child, creating it in `dst` if absent. Fails past
/// [`MAX_OVERLAY_DEPTH`].
fn overlay_node(dst: &mut Node, src: &Node, depth: u32) -> DeviceResult {
    if depth > MAX_OVERLAY_DEPTH {
        return Err(DeviceError::Invalid);
    }
    for (key, val) in &src.properties {
        dst.properties.insert(key.clone(), val.clone());
    }
    for child in &src.children {
        dst.child_or_insert(&child.name);
        let dst_child = dst.child_mut(&child.name).unwrap();
        overlay_node(dst_child, child, depth + 1)?;
    }
    Ok(())
}

/// Preorder search for `name` (optionally requiring `compat`),
/// reporting whether the match is a direct child of the tree root
/// (true) or nested deeper (false): the distinction `copy_endpoint`
/// uses to choose the destination parent.
fn find_with_parent<'a>(root: &'a Node, name: &str, compat: Option<&str>) -> Option<(&'a Node, bool)> {
    for child in &root.children {
        if child.name == name && compat.map_or(true, |c| child.matches_compat(c)) {
            return Some((child, true));
        }
    }
    for child in &root.children {
        if let Some(found) = child
            .preorder()
            .find(|n| n.name == name && compat.map_or(true, |c| n.matches_compat(c)))
        {
            return Some((found, false));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, family: &str) -> EndpointDesc {
        EndpointDesc {
            name: name.to_string(),
            bar_index: 0,
            bar_offset: 0x1000,
            size: 0x100,
            compat_family: Some(family.to_string()),
            compat_version: Some("1.0".to_string()),
        }
    }

    #[test]
    fn create_has_empty_endpoints() {
        let b = Blob::create().unwrap();
        assert_eq!(b.get_next_endpoint(None, None).unwrap(), None);
    }

    #[test]
    fn add_and_enumerate_endpoints() {
        let mut b = Blob::create().unwrap();
        b.add_endpoint(&desc("ep_clock_0", "clock")).unwrap();
        b.add_endpoint(&desc("ep_test_a", "test")).unwrap();
        let (first, _) = b.get_next_endpoint(None, None).unwrap().unwrap();
        assert_eq!(first, "ep_clock_0");
        let (second, _) = b.get_next_endpoint(Some("ep_clock_0"), None).unwrap().unwrap();
        assert_eq!(second, "ep_test_a");
        assert_eq!(b.get_next_endpoint(Some("ep_test_a"), None).unwrap(), None);
    }

    #[test]
    fn add_endpoint_rejects_empty_name() {
        let mut b = Blob::create().unwrap();
        let err = b.add_endpoint(&desc("", "clock")).unwrap_err();
        assert_eq!(err, DeviceError::Invalid);
    }

    #[test]
    fn dup_preserves_endpoints_and_shrinks_or_equals() {
        let mut b = Blob::create().unwrap();
        b.add_endpoint(&desc("ep_clock_0", "clock")).unwrap();
        let dup = b.dup().unwrap();
        assert!(dup.size() <= b.size());
        assert_eq!(dup.find_endpoint("ep_clock_0", None).unwrap(), "ep_clock_0");
    }

    #[test]
    fn del_endpoint_removes_it() {
        let mut b = Blob::create().unwrap();
        b.add_endpoint(&desc("ep_clock_0", "clock")).unwrap();
        b.del_endpoint("ep_clock_0", None).unwrap();
        assert_eq!(b.find_endpoint("ep_clock_0", None).unwrap_err(), DeviceError::NotFound);
    }

    #[test]
    fn copy_endpoint_moves_subtree_disjointly() {
        let mut group = Blob::create().unwrap();
        group.add_endpoint(&desc("ep_clock_0", "clock")).unwrap();
        group.add_endpoint(&desc("ep_test_a", "test")).unwrap();

        let mut child = Blob::create().unwrap();
        child.copy_endpoint(&group, "ep_clock_0", None, None).unwrap();
        group.del_endpoint("ep_clock_0", None).unwrap();

        assert_eq!(child.find_endpoint("ep_clock_0", None).unwrap(), "ep_clock_0");
        assert_eq!(group.find_endpoint("ep_clock_0", None).unwrap_err(), DeviceError::NotFound);
        assert_eq!(group.find_endpoint("ep_test_a", None).unwrap(), "ep_test_a");
    }

    #[test]
    fn interface_uuids_round_trip() {
        let mut b = Blob::create().unwrap();
        let interfaces = b.root.child_or_insert(INTERFACES);
        let mut i0 = Node::new("interface_0");
        i0.properties.insert(
            "interface_uuid".to_string(),
            b"0123abcd-4567-89ef-0123-456789abcdef".to_vec(),
        );
        interfaces.children.push(i0);

        let uuids = b.get_interface_uuids().unwrap();
        assert_eq!(uuids.len(), 1);
        assert_eq!(trans_uuid2str(&uuids[0]), "0123abcd-4567-89ef-0123-456789abcdef");
    }

    #[test]
    fn two_interface_uuids_enumerate_in_child_order() {
        let mut b = Blob::create().unwrap();
        let interfaces = b.root.child_or_insert(INTERFACES);

        let mut i0 = Node::new("interface_0");
        i0.properties.insert(
            "interface_uuid".to_string(),
            b"01234567-89ab-cdef-0123-456789abcdef".to_vec(),
        );
        interfaces.children.push(i0);

        let mut i1 = Node::new("interface_1");
        i1.properties.insert(
            "interface_uuid".to_string(),
            b"fedcba98-7654-3210-fedc-ba9876543210".to_vec(),
        );
        interfaces.children.push(i1);

        let uuids = b.get_interface_uuids().unwrap();
        assert_eq!(uuids.len(), 2);
        assert_eq!(trans_uuid2str(&uuids[0]), "01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(trans_uuid2str(&uuids[1]), "fedcba98-7654-3210-fedc-ba9876543210");
    }

    #[test]
    fn size_cap_is_enforced() {
        let mut b = Blob::create().unwrap();
        let big = alloc::vec![0u8; MAX_BLOB_SIZE as usize];
        let err = b.set_prop(None, None, "oversized", &big);
        assert!(err.is_ok());
        assert_eq!(b.size(), INVALID_LENGTH);
    }
}
