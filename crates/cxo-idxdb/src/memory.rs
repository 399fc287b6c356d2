//! In-memory index for testing and ephemeral use.
//!
//! [`InMemoryIdxDb`] keeps feeds, heads and roots in nested ordered maps
//! behind a `RwLock`. Data is lost when the index is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cxo_types::{now_nanos, Hash, PubKey, Sig};
use tracing::debug;

use crate::error::{IdxError, Result};
use crate::traits::{FeedFn, HeadFn, IdxDb, RootFn};
use crate::types::{visit_all, Root};

type Roots = BTreeMap<u64, Root>;
type Heads = BTreeMap<u64, Roots>;
type Feeds = BTreeMap<PubKey, Heads>;

/// An in-memory implementation of [`IdxDb`]. Always reports a safe close.
#[derive(Debug, Default)]
pub struct InMemoryIdxDb {
    feeds: RwLock<Feeds>,
    closed: AtomicBool,
}

impl InMemoryIdxDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Feeds>> {
        let feeds = self.feeds.read().expect("lock poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(IdxError::Closed);
        }
        Ok(feeds)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Feeds>> {
        let feeds = self.feeds.write().expect("lock poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(IdxError::Closed);
        }
        Ok(feeds)
    }
}

fn heads<'a>(feeds: &'a Feeds, pk: &PubKey) -> Result<&'a Heads> {
    feeds.get(pk).ok_or(IdxError::NoSuchFeed(*pk))
}

fn heads_mut<'a>(feeds: &'a mut Feeds, pk: &PubKey) -> Result<&'a mut Heads> {
    feeds.get_mut(pk).ok_or(IdxError::NoSuchFeed(*pk))
}

fn roots<'a>(feeds: &'a Feeds, pk: &PubKey, nonce: u64) -> Result<&'a Roots> {
    heads(feeds, pk)?
        .get(&nonce)
        .ok_or(IdxError::NoSuchHead { feed: *pk, nonce })
}

fn roots_mut<'a>(feeds: &'a mut Feeds, pk: &PubKey, nonce: u64) -> Result<&'a mut Roots> {
    heads_mut(feeds, pk)?
        .get_mut(&nonce)
        .ok_or(IdxError::NoSuchHead { feed: *pk, nonce })
}

impl IdxDb for InMemoryIdxDb {
    fn add_feed(&self, pk: &PubKey) -> Result<()> {
        let mut feeds = self.write()?;
        feeds.entry(*pk).or_default();
        Ok(())
    }

    fn del_feed(&self, pk: &PubKey) -> Result<()> {
        let mut feeds = self.write()?;
        let removed = feeds.remove(pk).ok_or(IdxError::NoSuchFeed(*pk))?;
        debug!(feed = %pk, heads = removed.len(), "feed deleted");
        Ok(())
    }

    fn has_feed(&self, pk: &PubKey) -> Result<bool> {
        Ok(self.read()?.contains_key(pk))
    }

    fn feeds_len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn iterate_feeds(&self, visit: &mut FeedFn<'_>) -> Result<()> {
        let snapshot: Vec<PubKey> = self.read()?
            .keys()
            .copied()
            .collect();
        visit_all(snapshot, |pk| visit(&pk))
    }

    fn add_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        let mut feeds = self.write()?;
        heads_mut(&mut feeds, pk)?.entry(nonce).or_default();
        Ok(())
    }

    fn del_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        let mut feeds = self.write()?;
        heads_mut(&mut feeds, pk)?
            .remove(&nonce)
            .map(|_| ())
            .ok_or(IdxError::NoSuchHead { feed: *pk, nonce })
    }

    fn has_head(&self, pk: &PubKey, nonce: u64) -> Result<bool> {
        let feeds = self.read()?;
        Ok(heads(&feeds, pk)?.contains_key(&nonce))
    }

    fn iterate_heads(&self, pk: &PubKey, visit: &mut HeadFn<'_>) -> Result<()> {
        let snapshot: Vec<u64> = {
            let feeds = self.read()?;
            heads(&feeds, pk)?.keys().copied().collect()
        };
        visit_all(snapshot, visit)
    }

    fn heads_len(&self, pk: &PubKey) -> Result<usize> {
        let feeds = self.read()?;
        Ok(heads(&feeds, pk)?.len())
    }

    fn ascend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()> {
        let snapshot: Vec<(u64, Root)> = {
            let feeds = self.read()?;
            roots(&feeds, pk, nonce)?
                .iter()
                .map(|(seq, r)| (*seq, r.clone()))
                .collect()
        };
        visit_all(snapshot, |(seq, r)| visit(seq, &r))
    }

    fn descend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()> {
        let snapshot: Vec<(u64, Root)> = {
            let feeds = self.read()?;
            roots(&feeds, pk, nonce)?
                .iter()
                .rev()
                .map(|(seq, r)| (*seq, r.clone()))
                .collect()
        };
        visit_all(snapshot, |(seq, r)| visit(seq, &r))
    }

    fn has_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<bool> {
        let feeds = self.read()?;
        Ok(roots(&feeds, pk, nonce)?.contains_key(&seq))
    }

    fn roots_len(&self, pk: &PubKey, nonce: u64) -> Result<usize> {
        let feeds = self.read()?;
        Ok(roots(&feeds, pk, nonce)?.len())
    }

    fn put_root(
        &self,
        pk: &PubKey,
        nonce: u64,
        seq: u64,
        hash: &Hash,
        sig: &Sig,
        touch: bool,
    ) -> Result<Root> {
        let now = now_nanos();
        let mut feeds = self.write()?;
        let roots = roots_mut(&mut feeds, pk, nonce)?;
        Ok(match roots.get_mut(&seq) {
            Some(root) => {
                let prev = root.access_time;
                root.hash = *hash;
                root.sig = *sig;
                if touch {
                    root.access_time = now;
                }
                Root {
                    access_time: prev,
                    ..root.clone()
                }
            }
            None => {
                let root = Root {
                    hash: *hash,
                    sig: *sig,
                    access_time: if touch { now } else { 0 },
                    create_time: now,
                };
                roots.insert(seq, root.clone());
                Root {
                    access_time: 0,
                    ..root
                }
            }
        })
    }

    fn get_root_with(&self, pk: &PubKey, nonce: u64, seq: u64, touch: bool) -> Result<Root> {
        let not_found = || IdxError::NotFound {
            feed: *pk,
            nonce,
            seq,
        };
        if !touch {
            let feeds = self.read()?;
            return roots(&feeds, pk, nonce)?.get(&seq).cloned().ok_or_else(not_found);
        }
        let mut feeds = self.write()?;
        let root = roots_mut(&mut feeds, pk, nonce)?
            .get_mut(&seq)
            .ok_or_else(not_found)?;
        let reply = root.clone();
        root.access_time = now_nanos();
        Ok(reply)
    }

    fn take_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root> {
        let mut feeds = self.write()?;
        roots_mut(&mut feeds, pk, nonce)?
            .remove(&seq)
            .ok_or(IdxError::NotFound {
                feed: *pk,
                nonce,
                seq,
            })
    }

    fn is_safe_closed(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("in-memory idxdb closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn seq_ordering() {
        testing::seq_ordering(&InMemoryIdxDb::new());
    }

    #[test]
    fn feed_deletion_cascades() {
        testing::feed_deletion_cascades(&InMemoryIdxDb::new());
    }

    #[test]
    fn set_root_semantics() {
        testing::set_root_semantics(&InMemoryIdxDb::new());
    }

    #[test]
    fn rejects_bad_signature() {
        testing::rejects_bad_signature(&InMemoryIdxDb::new());
    }

    #[test]
    fn heads_and_feeds() {
        testing::heads_and_feeds(&InMemoryIdxDb::new());
    }

    #[test]
    fn visitors_may_modify() {
        testing::visitors_may_modify(&InMemoryIdxDb::new());
    }

    #[test]
    fn close_is_idempotent() {
        let idx = InMemoryIdxDb::new();
        idx.close().unwrap();
        idx.close().unwrap();
        assert!(idx.is_safe_closed());
    }

    #[test]
    fn operations_after_close_fail() {
        let idx = InMemoryIdxDb::new();
        let pk = PubKey::default();
        idx.add_feed(&pk).unwrap();
        idx.add_head(&pk, 0).unwrap();
        idx.close().unwrap();

        assert!(matches!(idx.add_feed(&pk), Err(IdxError::Closed)));
        assert!(matches!(idx.has_feed(&pk), Err(IdxError::Closed)));
        assert!(matches!(idx.feeds_len(), Err(IdxError::Closed)));
        assert!(matches!(idx.heads_len(&pk), Err(IdxError::Closed)));
        assert!(matches!(idx.roots_len(&pk, 0), Err(IdxError::Closed)));
        assert!(matches!(
            idx.iterate_feeds(&mut |_| Ok(())),
            Err(IdxError::Closed)
        ));
        assert!(matches!(idx.take_root(&pk, 0, 0), Err(IdxError::Closed)));
    }
}
