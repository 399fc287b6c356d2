use cxo_types::Hash;
use tracing::debug;

use super::node::{depth_to_fit, pow, Body, Leaf, Node, NodeId};
use super::tree::{invalid, Tree};
use crate::error::{SkyError, SkyResult};
use crate::pack::Pack;

impl Tree {
    /// Elements that can be appended under `id` without a rebuild.
    pub fn free_space(&mut self, pack: &Pack, id: NodeId) -> SkyResult<u64> {
        self.ensure_loaded(pack, id)?;
        let degree = u64::from(self.degree);
        let (level, count, last) = match &self.nodes[id].body {
            Body::Leaves(leaves) => {
                let live = leaves.iter().filter(|l| !l.deleted).count() as u64;
                return Ok(degree.saturating_sub(live));
            }
            Body::Branches(children) => (
                self.nodes[id].level,
                children.len() as u64,
                children.last().copied(),
            ),
        };
        let mut free = degree.saturating_sub(count).saturating_mul(pow(degree, level));
        if let Some(last) = last {
            free = free.saturating_add(self.free_space(pack, last)?);
        }
        Ok(free)
    }

    /// Append hashes at the tail, growing the tree when they do not fit.
    ///
    /// Growing rebuilds the tree, which is refused while `iterating`.
    pub fn append(&mut self, pack: &Pack, hashes: &[Hash], iterating: bool) -> SkyResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        if self.free_space(pack, self.root)? < hashes.len() as u64 {
            if iterating {
                return Err(SkyError::RefsIterating);
            }
            let depth = depth_to_fit(self.degree, self.length() + hashes.len());
            self.rebuild_to(pack, depth)?;
        }
        for hash in hashes {
            self.append_one(pack, *hash)?;
        }
        Ok(())
    }

    fn append_one(&mut self, pack: &Pack, hash: Hash) -> SkyResult<()> {
        let mut id = self.root;
        loop {
            self.ensure_loaded(pack, id)?;
            let level = self.nodes[id].level;
            if level == 0 {
                break;
            }
            let last = self.children(id).last().copied();
            id = match last {
                Some(last) if self.free_space(pack, last)? > 0 => last,
                _ => {
                    if self.children(id).len() >= self.degree as usize {
                        return Err(invalid("no room at the tail"));
                    }
                    self.nodes.push(Node::empty(Some(id), level - 1));
                    let child = self.nodes.len() - 1;
                    if let Some(children) = self.children_mut(id) {
                        children.push(child);
                    }
                    child
                }
            };
        }

        self.compact(id);
        let slot = match self.leaves_mut(id) {
            Some(leaves) => {
                leaves.push(Leaf {
                    hash,
                    deleted: false,
                });
                leaves.len() - 1
            }
            None => return Err(invalid("append target is not a leaf node")),
        };
        self.index_insert(hash, (id, slot));

        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &mut self.nodes[n];
            node.length += 1;
            node.dirty = true;
            cur = node.parent;
        }
        Ok(())
    }

    /// Drop the tombstones of a leaf node so that its slots can be reused.
    fn compact(&mut self, id: NodeId) {
        if !self.leaves(id).iter().any(|l| l.deleted) {
            return;
        }
        let old: Vec<Leaf> = self.leaves(id).to_vec();
        for (slot, leaf) in old.iter().enumerate() {
            if !leaf.deleted {
                self.index_remove(&leaf.hash, (id, slot));
            }
        }
        let live: Vec<Leaf> = old.into_iter().filter(|l| !l.deleted).collect();
        for (slot, leaf) in live.iter().enumerate() {
            self.index_insert(leaf.hash, (id, slot));
        }
        if let Some(leaves) = self.leaves_mut(id) {
            *leaves = live;
        }
    }

    /// Replace the tree by a packed one of `depth` holding the same
    /// elements. Holds on the old nodes are released.
    pub fn rebuild_to(&mut self, pack: &Pack, depth: u32) -> SkyResult<()> {
        let hashes = self.all_hashes(pack)?;
        self.release_all(pack)?;
        let mut fresh = Tree::with_depth(self.degree, self.flags, depth);
        for hash in &hashes {
            fresh.append_one(pack, *hash)?;
        }
        debug!(
            from = self.depth,
            to = depth,
            length = hashes.len(),
            "refs rebuilt"
        );
        *self = fresh;
        Ok(())
    }

    /// Rebuild to the smallest depth, dropping tombstones. No-op when the
    /// tree is already minimal.
    pub fn rebuild_min(&mut self, pack: &Pack) -> SkyResult<()> {
        let depth = depth_to_fit(self.degree, self.length());
        if depth == self.depth && !self.has_tombstones(pack)? {
            return Ok(());
        }
        self.rebuild_to(pack, depth)
    }

    pub fn set_hash(&mut self, pack: &Pack, index: usize, hash: Hash) -> SkyResult<()> {
        let (id, slot) = self.locate(pack, index)?;
        let old = match self.leaves_mut(id) {
            Some(leaves) => std::mem::replace(&mut leaves[slot].hash, hash),
            None => return Err(invalid("located slot is not a leaf")),
        };
        if old != hash {
            self.index_remove(&old, (id, slot));
            self.index_insert(hash, (id, slot));
            self.mark_dirty(id);
        }
        Ok(())
    }

    pub fn delete_at(&mut self, pack: &Pack, index: usize) -> SkyResult<()> {
        let slot = self.locate(pack, index)?;
        self.delete_slot(pack, slot)
    }

    /// Tombstone a leaf and shrink its ancestors. Non-root nodes left
    /// empty are unlinked from their parents.
    pub fn delete_slot(&mut self, pack: &Pack, (id, slot): (NodeId, usize)) -> SkyResult<()> {
        let hash = match self.leaves_mut(id) {
            Some(leaves) if !leaves[slot].deleted => {
                leaves[slot].deleted = true;
                leaves[slot].hash
            }
            _ => return Err(invalid("delete of a missing leaf")),
        };
        self.index_remove(&hash, (id, slot));

        let mut cur = Some(id);
        while let Some(n) = cur {
            let parent = {
                let node = &mut self.nodes[n];
                node.length -= 1;
                node.dirty = true;
                node.parent
            };
            if self.nodes[n].length == 0 && n != self.root {
                if let Some(p) = parent {
                    if let Some(children) = self.children_mut(p) {
                        children.retain(|&c| c != n);
                    }
                }
                self.release_node(pack, n)?;
            }
            cur = parent;
        }
        Ok(())
    }
}
