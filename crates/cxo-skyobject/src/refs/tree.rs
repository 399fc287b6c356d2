use std::collections::{BTreeSet, HashMap};

use cxo_codec::{Decode, Encode};
use cxo_types::Hash;
use tracing::debug;

use super::node::{max_capacity, Body, BranchNode, Leaf, Node, NodeId, RootNode};
use crate::error::{SkyError, SkyResult};
use crate::pack::{Pack, PackFlags};

/// Position of a leaf: the node holding it and the slot inside the node.
pub(crate) type Slot = (NodeId, usize);

pub(crate) fn invalid(msg: impl Into<String>) -> SkyError {
    SkyError::InvalidRefs(msg.into())
}

/// Loaded state of a Refs: an arena of nodes linked by parent indices.
///
/// Unlinked nodes stay in the arena until the next rebuild; nothing
/// reachable from `root` points at them.
#[derive(Debug)]
pub(crate) struct Tree {
    pub nodes: Vec<Node>,
    pub root: NodeId,
    /// Level of the root node; 0 means the root holds leaves.
    pub depth: u32,
    pub degree: u32,
    pub flags: PackFlags,
    index: Option<HashMap<Hash, BTreeSet<Slot>>>,
}

impl Tree {
    pub fn empty(degree: u32, flags: PackFlags) -> Self {
        Self::with_depth(degree, flags, 0)
    }

    pub fn with_depth(degree: u32, flags: PackFlags, depth: u32) -> Self {
        let mut root = Node::empty(None, depth);
        root.dirty = false;
        Self {
            nodes: vec![root],
            root: 0,
            depth,
            degree,
            flags,
            index: flags.contains(PackFlags::HASH_TABLE_INDEX).then(HashMap::new),
        }
    }

    /// Decode the top node stored under `hash`.
    pub fn load(pack: &Pack, hash: Hash) -> SkyResult<Self> {
        let top = RootNode::decode(&pack.get(&hash)?)?;
        let count = top.hashes.len();
        let length = top.length as usize;
        if count > top.degree as usize {
            return Err(invalid(format!(
                "root holds {count} children with degree {}",
                top.degree
            )));
        }
        if length as u64 > max_capacity(top.degree, top.depth) {
            return Err(invalid(format!(
                "length {length} exceeds capacity of depth {}",
                top.depth
            )));
        }
        if top.depth == 0 && length != count {
            return Err(invalid(format!("root length {length} with {count} leaves")));
        }

        let flags = pack.flags();
        let mut tree = Self::with_depth(top.degree, flags, top.depth);
        {
            let root = &mut tree.nodes[0];
            root.hash = hash;
            root.length = length;
        }
        let body = tree.child_body(0, top.depth, top.hashes);
        tree.nodes[0].body = body;

        if flags.contains(PackFlags::ENTIRE_REFS) || tree.index.is_some() {
            tree.load_all(pack)?;
        }
        debug!(hash = %hash.short_hex(), depth = top.depth, length, "refs loaded");
        Ok(tree)
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn child_body(&mut self, parent: NodeId, level: u32, hashes: Vec<Hash>) -> Body {
        if level == 0 {
            Body::Leaves(
                hashes
                    .into_iter()
                    .map(|hash| Leaf {
                        hash,
                        deleted: false,
                    })
                    .collect(),
            )
        } else {
            Body::Branches(
                hashes
                    .into_iter()
                    .map(|h| self.push(Node::stub(parent, level - 1, h)))
                    .collect(),
            )
        }
    }

    /// Fetch and decode a stub node.
    pub fn ensure_loaded(&mut self, pack: &Pack, id: NodeId) -> SkyResult<()> {
        if self.nodes[id].loaded {
            return Ok(());
        }
        let (hash, level) = (self.nodes[id].hash, self.nodes[id].level);
        let branch = BranchNode::decode(&pack.get(&hash)?)?;
        let count = branch.hashes.len();
        let length = branch.length as usize;
        if count == 0 || count > self.degree as usize {
            return Err(invalid(format!(
                "node {} holds {count} children",
                hash.short_hex()
            )));
        }
        if length as u64 > max_capacity(self.degree, level) {
            return Err(invalid(format!(
                "node {} length {length} exceeds its capacity",
                hash.short_hex()
            )));
        }
        if level == 0 && length != count {
            return Err(invalid(format!(
                "leaf node {} length {length} with {count} leaves",
                hash.short_hex()
            )));
        }
        let body = self.child_body(id, level, branch.hashes);
        let node = &mut self.nodes[id];
        node.length = length;
        node.body = body;
        node.loaded = true;
        Ok(())
    }

    /// Load every node, check lengths and build the hash index.
    pub fn load_all(&mut self, pack: &Pack) -> SkyResult<()> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            self.ensure_loaded(pack, id)?;
            stack.extend_from_slice(self.children(id));
        }
        self.check_lengths(self.root)?;
        self.rebuild_index();
        Ok(())
    }

    fn check_lengths(&self, id: NodeId) -> SkyResult<usize> {
        let node = &self.nodes[id];
        let actual = match &node.body {
            Body::Leaves(leaves) => leaves.iter().filter(|l| !l.deleted).count(),
            Body::Branches(children) => {
                let mut sum = 0;
                for &child in children {
                    sum += self.check_lengths(child)?;
                }
                sum
            }
        };
        if actual != node.length {
            return Err(invalid(format!(
                "node {} claims length {} but holds {actual}",
                node.hash.short_hex(),
                node.length
            )));
        }
        Ok(actual)
    }

    pub fn length(&self) -> usize {
        self.nodes[self.root].length
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.nodes[id].body {
            Body::Branches(children) => children,
            Body::Leaves(_) => &[],
        }
    }

    pub fn leaves(&self, id: NodeId) -> &[Leaf] {
        match &self.nodes[id].body {
            Body::Leaves(leaves) => leaves,
            Body::Branches(_) => &[],
        }
    }

    pub fn leaves_mut(&mut self, id: NodeId) -> Option<&mut Vec<Leaf>> {
        match &mut self.nodes[id].body {
            Body::Leaves(leaves) => Some(leaves),
            Body::Branches(_) => None,
        }
    }

    pub fn children_mut(&mut self, id: NodeId) -> Option<&mut Vec<NodeId>> {
        match &mut self.nodes[id].body {
            Body::Branches(children) => Some(children),
            Body::Leaves(_) => None,
        }
    }

    /// Find the leaf holding element `i`, loading nodes on the way.
    pub fn locate(&mut self, pack: &Pack, index: usize) -> SkyResult<Slot> {
        let len = self.length();
        if index >= len {
            return Err(SkyError::IndexOutOfRange { index, len });
        }
        let mut id = self.root;
        let mut i = index;
        loop {
            self.ensure_loaded(pack, id)?;
            if self.nodes[id].level == 0 {
                let slot = self
                    .leaves(id)
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| !l.deleted)
                    .nth(i)
                    .map(|(slot, _)| slot);
                return slot.map(|slot| (id, slot)).ok_or_else(|| {
                    invalid(format!("leaf node shorter than its length at {index}"))
                });
            }
            let mut next = None;
            for child in self.children(id).to_vec() {
                self.ensure_loaded(pack, child)?;
                let child_len = self.nodes[child].length;
                if i < child_len {
                    next = Some(child);
                    break;
                }
                i -= child_len;
            }
            id = next.ok_or_else(|| invalid(format!("branch shorter than its length at {index}")))?;
        }
    }

    pub fn hash_at(&mut self, pack: &Pack, index: usize) -> SkyResult<Hash> {
        let (id, slot) = self.locate(pack, index)?;
        Ok(self.leaves(id)[slot].hash)
    }

    /// Global index of a live leaf. Every node on the path and every
    /// preceding sibling must be loaded.
    pub fn position(&self, (id, slot): Slot) -> usize {
        let mut pos = self.leaves(id)[..slot].iter().filter(|l| !l.deleted).count();
        let mut child = id;
        while let Some(parent) = self.nodes[child].parent {
            for &sibling in self.children(parent) {
                if sibling == child {
                    break;
                }
                pos += self.nodes[sibling].length;
            }
            child = parent;
        }
        pos
    }

    /// Leaf nodes in element order, loading the whole tree.
    pub fn leaf_nodes(&mut self, pack: &Pack) -> SkyResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            self.ensure_loaded(pack, id)?;
            if self.nodes[id].level == 0 {
                out.push(id);
            } else {
                stack.extend(self.children(id).iter().rev().copied());
            }
        }
        Ok(out)
    }

    /// All live element hashes in order.
    pub fn all_hashes(&mut self, pack: &Pack) -> SkyResult<Vec<Hash>> {
        let mut out = Vec::with_capacity(self.length());
        for id in self.leaf_nodes(pack)? {
            out.extend(self.leaves(id).iter().filter(|l| !l.deleted).map(|l| l.hash));
        }
        Ok(out)
    }

    // ---- hash index -------------------------------------------------

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Slots holding `hash`, or `None` when the tree keeps no index.
    pub fn slots_of(&self, hash: &Hash) -> Option<Vec<Slot>> {
        self.index.as_ref().map(|ix| {
            ix.get(hash)
                .map(|slots| slots.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    pub fn index_insert(&mut self, hash: Hash, slot: Slot) {
        if let Some(ix) = &mut self.index {
            ix.entry(hash).or_default().insert(slot);
        }
    }

    pub fn index_remove(&mut self, hash: &Hash, slot: Slot) {
        if let Some(ix) = &mut self.index {
            if let Some(slots) = ix.get_mut(hash) {
                slots.remove(&slot);
                if slots.is_empty() {
                    ix.remove(hash);
                }
            }
        }
    }

    /// Rebuild the index from loaded nodes.
    fn rebuild_index(&mut self) {
        if self.index.is_none() {
            return;
        }
        let mut ix: HashMap<Hash, BTreeSet<Slot>> = HashMap::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            for (slot, leaf) in self.leaves(id).iter().enumerate() {
                if !leaf.deleted {
                    ix.entry(leaf.hash).or_default().insert((id, slot));
                }
            }
            stack.extend_from_slice(self.children(id));
        }
        self.index = Some(ix);
    }

    // ---- hashing ----------------------------------------------------

    pub fn mark_dirty(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(n) = cur {
            self.nodes[n].dirty = true;
            cur = self.nodes[n].parent;
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[self.root].hash
    }

    pub fn is_dirty(&self) -> bool {
        self.nodes[self.root].dirty
    }

    /// Recompute and store every dirty node, children first.
    pub fn flush(&mut self, pack: &Pack) -> SkyResult<()> {
        self.flush_node(pack, self.root)
    }

    fn flush_node(&mut self, pack: &Pack, id: NodeId) -> SkyResult<()> {
        if !self.nodes[id].dirty {
            return Ok(());
        }
        for child in self.children(id).to_vec() {
            self.flush_node(pack, child)?;
        }
        self.store_node(pack, id)
    }

    fn store_node(&mut self, pack: &Pack, id: NodeId) -> SkyResult<()> {
        let node = &self.nodes[id];
        let hashes: Vec<Hash> = match &node.body {
            Body::Leaves(leaves) => leaves.iter().filter(|l| !l.deleted).map(|l| l.hash).collect(),
            Body::Branches(children) => children.iter().map(|&c| self.nodes[c].hash).collect(),
        };
        let length =
            u32::try_from(node.length).map_err(|_| invalid("length does not fit in u32"))?;
        let encoded = if id != self.root {
            Some(BranchNode { length, hashes }.encode())
        } else if length == 0 {
            None
        } else {
            Some(
                RootNode {
                    depth: self.depth,
                    degree: self.degree,
                    length,
                    hashes,
                }
                .encode(),
            )
        };
        let hash = encoded.as_deref().map(Hash::sum).unwrap_or(Hash::ZERO);
        let (old, owned) = (node.hash, node.owned);

        if hash != old {
            if let Some(val) = &encoded {
                pack.set(&hash, val)?;
            }
            if owned && !old.is_zero() {
                pack.release(&old)?;
            }
            let node = &mut self.nodes[id];
            node.hash = hash;
            node.owned = !hash.is_zero();
        }
        self.nodes[id].dirty = false;
        Ok(())
    }

    /// Drop this session's hold on a node version.
    pub fn release_node(&mut self, pack: &Pack, id: NodeId) -> SkyResult<()> {
        let node = &mut self.nodes[id];
        if node.owned && !node.hash.is_zero() {
            node.owned = false;
            pack.release(&node.hash)?;
        }
        Ok(())
    }

    /// Drop every hold this session has on stored nodes.
    pub fn release_all(&mut self, pack: &Pack) -> SkyResult<()> {
        for id in 0..self.nodes.len() {
            self.release_node(pack, id)?;
        }
        Ok(())
    }

    /// Forget holds without releasing them; whoever references the tree
    /// now keeps them.
    pub fn disown(&mut self) {
        for node in &mut self.nodes {
            node.owned = false;
        }
    }

    /// Any tombstone reachable from the root. Loads the whole tree.
    pub fn has_tombstones(&mut self, pack: &Pack) -> SkyResult<bool> {
        for id in self.leaf_nodes(pack)? {
            if self.leaves(id).iter().any(|l| l.deleted) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
