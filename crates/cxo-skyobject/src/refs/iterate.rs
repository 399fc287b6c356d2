use cxo_types::Hash;

use super::{Frame, Refs};
use crate::error::{SkyError, SkyResult};
use crate::pack::Pack;

/// Visitor of [`Refs::ascend`] and [`Refs::descend`]: receives the Refs
/// itself, so it may read or edit it, the element index and its hash.
///
/// Deleting elements and setting hashes are allowed during iteration;
/// each live element is still visited at most once. Appends that need the
/// tree to grow fail with [`SkyError::RefsIterating`]. Returning
/// [`SkyError::StopIteration`] ends the iteration without an error.
pub type RefsVisitor<'a> = dyn FnMut(&mut Refs, usize, Hash) -> SkyResult<()> + 'a;

impl Refs {
    /// Visit elements in increasing index order.
    pub fn ascend(&mut self, pack: &Pack, visit: &mut RefsVisitor<'_>) -> SkyResult<()> {
        self.ascend_from(pack, 0, visit)
    }

    /// Visit elements from `start` on in increasing index order.
    pub fn ascend_from(
        &mut self,
        pack: &Pack,
        start: usize,
        visit: &mut RefsVisitor<'_>,
    ) -> SkyResult<()> {
        self.tree(pack)?;
        self.frames.push(Frame { bound: start });
        let top = self.frames.len() - 1;
        let res = self.run(pack, top, true, visit);
        self.frames.pop();
        res
    }

    /// Visit elements in decreasing index order.
    pub fn descend(&mut self, pack: &Pack, visit: &mut RefsVisitor<'_>) -> SkyResult<()> {
        let len = self.len(pack)?;
        self.frames.push(Frame { bound: len });
        let top = self.frames.len() - 1;
        let res = self.run(pack, top, false, visit);
        self.frames.pop();
        res
    }

    fn run(
        &mut self,
        pack: &Pack,
        top: usize,
        ascending: bool,
        visit: &mut RefsVisitor<'_>,
    ) -> SkyResult<()> {
        loop {
            let bound = self.frames[top].bound;
            let index = if ascending {
                if bound >= self.len(pack)? {
                    return Ok(());
                }
                self.frames[top].bound = bound + 1;
                bound
            } else {
                if bound == 0 {
                    return Ok(());
                }
                self.frames[top].bound = bound - 1;
                bound - 1
            };
            let hash = self.hash_by_index(pack, index)?;
            match visit(self, index, hash) {
                Ok(()) => {}
                Err(SkyError::StopIteration) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
