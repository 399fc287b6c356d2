//! The [`IdxDb`] trait defining the signed-head index interface.
//!
//! Any backend (in-memory, file) implements this trait to keep the
//! `(feed, head nonce, seq) -> Root` index of a node.

use cxo_crypto::verify_hash;
use cxo_types::{Hash, PubKey, Sig};

use crate::error::{IdxError, Result};
use crate::types::Root;

/// Visitor of feeds.
pub type FeedFn<'a> = dyn FnMut(&PubKey) -> Result<()> + 'a;
/// Visitor of head nonces.
pub type HeadFn<'a> = dyn FnMut(u64) -> Result<()> + 'a;
/// Visitor of roots: `(seq, root)`.
pub type RootFn<'a> = dyn FnMut(u64, &Root) -> Result<()> + 'a;

/// Storage backend for the root index.
///
/// Feeds contain heads, heads contain roots. Deleting a feed removes its
/// heads; deleting a head removes its roots. Head operations fail with
/// [`IdxError::NoSuchFeed`] when the feed is missing, root operations
/// additionally with [`IdxError::NoSuchHead`].
///
/// Iterations work on a snapshot, so visitors may modify the index. Return
/// [`IdxError::StopIteration`] from a visitor to stop early.
pub trait IdxDb: Send + Sync {
    /// Add a feed. Adding an existing feed is a no-op.
    fn add_feed(&self, pk: &PubKey) -> Result<()>;

    /// Delete a feed with all its heads and roots.
    fn del_feed(&self, pk: &PubKey) -> Result<()>;

    fn has_feed(&self, pk: &PubKey) -> Result<bool>;

    fn feeds_len(&self) -> Result<usize>;

    /// Visit feeds in ascending key order.
    fn iterate_feeds(&self, visit: &mut FeedFn<'_>) -> Result<()>;

    /// Add a head to a feed. Adding an existing head is a no-op.
    fn add_head(&self, pk: &PubKey, nonce: u64) -> Result<()>;

    /// Delete a head with all its roots.
    fn del_head(&self, pk: &PubKey, nonce: u64) -> Result<()>;

    fn has_head(&self, pk: &PubKey, nonce: u64) -> Result<bool>;

    /// Visit head nonces of a feed in ascending order.
    fn iterate_heads(&self, pk: &PubKey, visit: &mut HeadFn<'_>) -> Result<()>;

    fn heads_len(&self, pk: &PubKey) -> Result<usize>;

    /// Visit roots of a head in strictly increasing seq order.
    /// Does not touch access times.
    fn ascend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()>;

    /// Visit roots of a head in strictly decreasing seq order.
    fn descend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()>;

    fn has_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<bool>;

    fn roots_len(&self, pk: &PubKey, nonce: u64) -> Result<usize>;

    /// Create or update a root without checking its signature.
    ///
    /// An existing record gets the new hash and signature and, with `touch`,
    /// a fresh access time; the reply carries the previous access time. A
    /// created record replies with access time zero.
    fn put_root(
        &self,
        pk: &PubKey,
        nonce: u64,
        seq: u64,
        hash: &Hash,
        sig: &Sig,
        touch: bool,
    ) -> Result<Root>;

    /// Read a root, optionally setting its access time to now.
    /// The reply carries the access time before this call.
    fn get_root_with(&self, pk: &PubKey, nonce: u64, seq: u64, touch: bool) -> Result<Root>;

    /// Delete a root and return it.
    fn take_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root>;

    /// `false` when the previous session ended without a clean close.
    fn is_safe_closed(&self) -> bool;

    /// Release the backend. Closing twice is a no-op.
    fn close(&self) -> Result<()>;

    // -----------------------------------------------------------------------
    // Convenience methods
    // -----------------------------------------------------------------------

    /// Verify the signature, then create or touch the root.
    fn set_root(&self, pk: &PubKey, nonce: u64, seq: u64, hash: &Hash, sig: &Sig) -> Result<Root> {
        check_signature(pk, nonce, seq, hash, sig)?;
        self.put_root(pk, nonce, seq, hash, sig, true)
    }

    /// Verify the signature, then create the root or update it in place.
    fn set_not_touch_root(
        &self,
        pk: &PubKey,
        nonce: u64,
        seq: u64,
        hash: &Hash,
        sig: &Sig,
    ) -> Result<Root> {
        check_signature(pk, nonce, seq, hash, sig)?;
        self.put_root(pk, nonce, seq, hash, sig, false)
    }

    fn get_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root> {
        self.get_root_with(pk, nonce, seq, true)
    }

    fn get_not_touch_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root> {
        self.get_root_with(pk, nonce, seq, false)
    }

    fn del_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<()> {
        self.take_root(pk, nonce, seq).map(|_| ())
    }

    /// The root with the greatest seq of a head, if any.
    fn last_root(&self, pk: &PubKey, nonce: u64) -> Result<Option<(u64, Root)>> {
        let mut last = None;
        self.descend_roots(pk, nonce, &mut |seq, root| {
            last = Some((seq, root.clone()));
            Err(IdxError::StopIteration)
        })?;
        Ok(last)
    }
}

fn check_signature(pk: &PubKey, nonce: u64, seq: u64, hash: &Hash, sig: &Sig) -> Result<()> {
    verify_hash(pk, hash, sig).map_err(|_| IdxError::InvalidSignature {
        feed: *pk,
        nonce,
        seq,
    })
}
