//! In-memory tree node backing a [`Blob`](super::Blob).
//!
//! The contract callers get is that the blob is opaque to everyone but the
//! metadata engine, not that it is byte-compatible with a real `.dtb`. So
//! the blob is an owned tree of [`Node`]s; `size()` sums a per-node/
//! per-property encoding cost so the 100 KiB cap still bites the way it
//! would against a packed flattened devicetree.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// Fixed per-node overhead charged by [`Node::encoded_size`], standing in
/// for an FDT node's begin/end tags and name field.
const NODE_OVERHEAD: u32 = 16;
/// Fixed per-property overhead, standing in for an FDT property header
/// (name offset + length word).
const PROP_OVERHEAD: u32 = 12;

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub properties: BTreeMap<String, Vec<u8>>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Node {
            name: String::from(name),
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn child_or_insert(&mut self, name: &str) -> &mut Node {
        if self.child(name).is_none() {
            self.children.push(Node::new(name));
        }
        self.child_mut(name).unwrap()
    }

    pub fn remove_child(&mut self, name: &str) -> Option<Node> {
        let idx = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(idx))
    }

    /// Encoded size of this node and its whole subtree, including the
    /// name comparison used by strict-equality endpoint lookup.
    pub fn encoded_size(&self) -> u64 {
        let mut total = NODE_OVERHEAD as u64 + self.name.len() as u64 + 1;
        for (key, val) in &self.properties {
            total += PROP_OVERHEAD as u64 + key.len() as u64 + 1 + val.len() as u64;
        }
        for child in &self.children {
            total += child.encoded_size();
        }
        total
    }

    /// Preorder traversal (self, then each child's preorder), matching
    /// the strict-equality name-comparison lookup the engine performs.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder { stack: alloc::vec![self] }
    }

    pub fn preorder_mut(&mut self) -> PreorderMut<'_> {
        PreorderMut { stack: alloc::vec![self] }
    }

    /// Parse this node's `compatible` property (if any) into its
    /// NUL-separated entries.
    pub fn compatible_entries(&self) -> Vec<&str> {
        match self.properties.get("compatible") {
            None => Vec::new(),
            Some(bytes) => bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .filter_map(|s| core::str::from_utf8(s).ok())
                .collect(),
        }
    }

    pub fn matches_compat(&self, compat: &str) -> bool {
        self.compatible_entries()
            .iter()
            .any(|entry| entry.contains(compat))
    }
}

pub struct Preorder<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = &'a Node;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

pub struct PreorderMut<'a> {
    stack: Vec<&'a mut Node>,
}

impl<'a> Iterator for PreorderMut<'a> {
    type Item = &'a mut Node;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter_mut().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}
