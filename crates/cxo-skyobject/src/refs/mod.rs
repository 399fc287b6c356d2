//! Refs: an ordered list of element hashes stored as a Merkle tree of
//! bounded fan-out.
//!
//! A [`Refs`] arrives as a top hash and is loaded lazily from the
//! [`Pack`] passed to each call. Every method that reads structure may
//! fetch nodes; every method that mutates stores the changed nodes back
//! (or, with [`PackFlags::LAZY_UPDATING`], defers that to [`Refs::hash`]).
//!
//! Nodes hold their encodings in CXDS once each. Versions superseded
//! during the session are released; call [`Refs::seal`] once a saved
//! root references the current version so later edits keep it alive.

mod edit;
mod iterate;
mod node;
mod tree;

use std::fmt;

use cxo_types::Hash;

use crate::error::{SkyError, SkyResult};
use crate::pack::{Pack, PackFlags};
use crate::registry::Value;

pub use iterate::RefsVisitor;
pub use node::{depth_to_fit, max_capacity, pow, BranchNode, RootNode};

use tree::Tree;

enum State {
    Unloaded(Hash),
    Loaded(Box<Tree>),
}

/// Iterator frame. For ascending iteration `bound` is the next index to
/// visit; for descending iteration it is one past it.
#[derive(Clone, Copy, Debug)]
struct Frame {
    bound: usize,
}

/// Merkle list of element hashes. Not thread-safe.
pub struct Refs {
    state: State,
    frames: Vec<Frame>,
}

impl Default for Refs {
    fn default() -> Self {
        Self::new()
    }
}

impl Refs {
    /// An empty Refs.
    pub fn new() -> Self {
        Self::from_hash(Hash::ZERO)
    }

    /// A Refs stored under `hash`; nothing is loaded until first use.
    pub fn from_hash(hash: Hash) -> Self {
        Self {
            state: State::Unloaded(hash),
            frames: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, State::Loaded(_))
    }

    /// An iteration is in progress.
    pub fn is_iterating(&self) -> bool {
        !self.frames.is_empty()
    }

    fn tree(&mut self, pack: &Pack) -> SkyResult<&mut Tree> {
        if let State::Unloaded(hash) = self.state {
            let tree = if hash.is_zero() {
                Tree::empty(pack.degree(), pack.flags())
            } else {
                Tree::load(pack, hash)?
            };
            self.state = State::Loaded(Box::new(tree));
        }
        match &mut self.state {
            State::Loaded(tree) => Ok(tree.as_mut()),
            State::Unloaded(_) => Err(SkyError::InvalidRefs("refs not loaded".into())),
        }
    }

    /// Tree for a mutation: refuses view-only trees.
    fn tree_mut(&mut self, pack: &Pack) -> SkyResult<&mut Tree> {
        let tree = self.tree(pack)?;
        if tree.flags.contains(PackFlags::VIEW_ONLY) {
            return Err(SkyError::ViewOnlyTree);
        }
        Ok(tree)
    }

    /// Store changed nodes unless updates are lazy.
    fn updated(&mut self, pack: &Pack) -> SkyResult<()> {
        let tree = self.tree(pack)?;
        if !tree.flags.contains(PackFlags::LAZY_UPDATING) {
            tree.flush(pack)?;
        }
        Ok(())
    }

    /// Top hash, storing pending changes first. Zero for an empty Refs.
    pub fn hash(&mut self, pack: &Pack) -> SkyResult<Hash> {
        match &mut self.state {
            State::Unloaded(hash) => Ok(*hash),
            State::Loaded(tree) => {
                tree.flush(pack)?;
                Ok(tree.root_hash())
            }
        }
    }

    /// Store pending changes and hand this session's holds on the
    /// stored nodes to whatever references the returned hash.
    pub fn seal(&mut self, pack: &Pack) -> SkyResult<Hash> {
        let hash = self.hash(pack)?;
        if let State::Loaded(tree) = &mut self.state {
            tree.disown();
        }
        Ok(hash)
    }

    pub fn len(&mut self, pack: &Pack) -> SkyResult<usize> {
        Ok(self.tree(pack)?.length())
    }

    pub fn is_empty(&mut self, pack: &Pack) -> SkyResult<bool> {
        Ok(self.len(pack)? == 0)
    }

    /// Number of node levels; 0 for an empty Refs.
    pub fn depth(&mut self, pack: &Pack) -> SkyResult<u32> {
        let tree = self.tree(pack)?;
        Ok(if tree.length() == 0 { 0 } else { tree.depth + 1 })
    }

    pub fn degree(&mut self, pack: &Pack) -> SkyResult<u32> {
        Ok(self.tree(pack)?.degree)
    }

    // ---- lookup -----------------------------------------------------

    pub fn hash_by_index(&mut self, pack: &Pack, index: usize) -> SkyResult<Hash> {
        self.tree(pack)?.hash_at(pack, index)
    }

    /// Decode the element at `index`.
    pub fn value_by_index<T: Value>(&mut self, pack: &Pack, index: usize) -> SkyResult<T> {
        let hash = self.hash_by_index(pack, index)?;
        if hash.is_zero() {
            return Err(SkyError::RefsElementIsNil(index));
        }
        pack.get_value(&hash)
    }

    pub fn has_hash(&mut self, pack: &Pack, hash: &Hash) -> SkyResult<bool> {
        let tree = self.tree(pack)?;
        match tree.slots_of(hash) {
            Some(slots) => Ok(!slots.is_empty()),
            None => Ok(tree.all_hashes(pack)?.contains(hash)),
        }
    }

    /// Lowest index holding `hash`.
    pub fn index_of_hash(&mut self, pack: &Pack, hash: &Hash) -> SkyResult<usize> {
        self.indices_by_hash(pack, hash)?
            .first()
            .copied()
            .ok_or(SkyError::NotFound(*hash))
    }

    /// Every index holding `hash`, ascending. `NotFound` when there is none.
    pub fn indices_by_hash(&mut self, pack: &Pack, hash: &Hash) -> SkyResult<Vec<usize>> {
        let tree = self.tree(pack)?;
        let mut indices: Vec<usize> = match tree.slots_of(hash) {
            Some(slots) => slots.into_iter().map(|s| tree.position(s)).collect(),
            None => tree
                .all_hashes(pack)?
                .iter()
                .enumerate()
                .filter(|(_, h)| *h == hash)
                .map(|(i, _)| i)
                .collect(),
        };
        if indices.is_empty() {
            return Err(SkyError::NotFound(*hash));
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Every live element hash in order.
    pub fn hashes(&mut self, pack: &Pack) -> SkyResult<Vec<Hash>> {
        self.tree(pack)?.all_hashes(pack)
    }

    /// Every element decoded in order.
    pub fn values<T: Value>(&mut self, pack: &Pack) -> SkyResult<Vec<T>> {
        self.hashes(pack)?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if h.is_zero() {
                    Err(SkyError::RefsElementIsNil(i))
                } else {
                    pack.get_value(h)
                }
            })
            .collect()
    }

    // ---- mutation ---------------------------------------------------

    pub fn set_hash_by_index(&mut self, pack: &Pack, index: usize, hash: Hash) -> SkyResult<()> {
        self.tree_mut(pack)?.set_hash(pack, index, hash)?;
        self.updated(pack)
    }

    /// Store `value` and put its hash at `index`.
    pub fn set_value_by_index<T: Value>(
        &mut self,
        pack: &Pack,
        index: usize,
        value: &T,
    ) -> SkyResult<()> {
        let len = self.tree_mut(pack)?.length();
        if index >= len {
            return Err(SkyError::IndexOutOfRange { index, len });
        }
        let hash = pack.add_value(value)?;
        self.set_hash_by_index(pack, index, hash)
    }

    pub fn delete_by_index(&mut self, pack: &Pack, index: usize) -> SkyResult<()> {
        self.tree_mut(pack)?.delete_at(pack, index)?;
        self.deleted(index);
        self.updated(pack)
    }

    /// Delete every element equal to `hash`. Absent hashes are a no-op.
    pub fn delete_by_hash(&mut self, pack: &Pack, hash: &Hash) -> SkyResult<()> {
        self.tree_mut(pack)?;
        let indices = match self.indices_by_hash(pack, hash) {
            Ok(indices) => indices,
            Err(SkyError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for &index in indices.iter().rev() {
            self.tree(pack)?.delete_at(pack, index)?;
            self.deleted(index);
        }
        self.updated(pack)
    }

    /// Shift open iterators past a deleted index.
    fn deleted(&mut self, index: usize) {
        for frame in &mut self.frames {
            if index < frame.bound {
                frame.bound -= 1;
            }
        }
    }

    pub fn append_hashes(&mut self, pack: &Pack, hashes: &[Hash]) -> SkyResult<()> {
        let iterating = self.is_iterating();
        self.tree_mut(pack)?.append(pack, hashes, iterating)?;
        self.updated(pack)
    }

    /// Store each value and append their hashes.
    pub fn append_values<T: Value>(&mut self, pack: &Pack, values: &[T]) -> SkyResult<()> {
        self.tree_mut(pack)?;
        let hashes = values
            .iter()
            .map(|v| pack.add_value(v))
            .collect::<SkyResult<Vec<_>>>()?;
        self.append_hashes(pack, &hashes)
    }

    /// Append the elements of `other`.
    pub fn append_refs(&mut self, pack: &Pack, other: &mut Refs) -> SkyResult<()> {
        let hashes = other.hashes(pack)?;
        self.append_hashes(pack, &hashes)
    }

    /// A new Refs holding elements `[start, end)`.
    pub fn slice(&mut self, pack: &Pack, start: usize, end: usize) -> SkyResult<Refs> {
        let tree = self.tree(pack)?;
        let len = tree.length();
        if start > end || end > len {
            return Err(SkyError::InvalidSliceIndex { start, end, len });
        }
        let flags = tree.flags.without(PackFlags::VIEW_ONLY);
        let mut hashes = Vec::with_capacity(end - start);
        for i in start..end {
            hashes.push(tree.hash_at(pack, i)?);
        }
        let mut sliced = Tree::empty(tree.degree, flags);
        sliced.append(pack, &hashes, false)?;
        let mut refs = Refs {
            state: State::Loaded(Box::new(sliced)),
            frames: Vec::new(),
        };
        refs.updated(pack)?;
        Ok(refs)
    }

    /// Remove every element. Refused while iterating.
    pub fn clear(&mut self, pack: &Pack) -> SkyResult<()> {
        let iterating = self.is_iterating();
        let tree = self.tree_mut(pack)?;
        if iterating {
            return Err(SkyError::RefsIterating);
        }
        tree.release_all(pack)?;
        *tree = Tree::empty(tree.degree, tree.flags);
        Ok(())
    }

    /// Repack to the smallest depth, dropping tombstones. Refused while
    /// iterating.
    pub fn rebuild(&mut self, pack: &Pack) -> SkyResult<()> {
        let iterating = self.is_iterating();
        let tree = self.tree_mut(pack)?;
        if iterating {
            return Err(SkyError::RefsIterating);
        }
        tree.rebuild_min(pack)?;
        self.updated(pack)
    }
}

impl fmt::Debug for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Unloaded(hash) => write!(f, "Refs({}, unloaded)", hash.short_hex()),
            State::Loaded(tree) => f
                .debug_struct("Refs")
                .field("hash", &tree.root_hash())
                .field("dirty", &tree.is_dirty())
                .field("length", &tree.length())
                .field("depth", &tree.depth)
                .field("degree", &tree.degree)
                .field("indexed", &tree.has_index())
                .field("iterators", &self.frames.len())
                .finish(),
        }
    }
}
