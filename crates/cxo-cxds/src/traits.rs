use cxo_types::Hash;

use crate::error::CxdsResult;
use crate::object::Object;

/// Visitor of [`Cxds::iterate`].
pub type IterateFn<'a> = dyn FnMut(&Hash, &Object) -> CxdsResult<()> + 'a;

/// Visitor of [`Cxds::iterate_del`]. Returns `true` to delete the entry.
pub type IterateDelFn<'a> = dyn FnMut(&Hash, &Object) -> CxdsResult<bool> + 'a;

/// Content-addressed store with reference counters.
///
/// All implementations must satisfy these invariants:
/// - A key is always the SHA-256 of its value; values are never empty.
/// - RC mutations are atomic per key and never go below zero.
/// - `amount()` and `volume()` reflect every acknowledged mutation.
/// - The "touch" family sets the access time to now; the "not touch"
///   family leaves it alone.
/// - Operations on absent keys fail with `NotFound`, except sets.
pub trait Cxds: Send + Sync {
    /// Set the access time to now and return the previous one.
    fn touch(&self, key: &Hash) -> CxdsResult<i64>;

    /// Read an object, adding `by` to its rc (may be zero or negative).
    ///
    /// The reply carries the new rc and the access time before this call.
    fn get_with(&self, key: &Hash, by: i64, touch: bool) -> CxdsResult<Object>;

    /// Insert `val` under `key` with rc `by`, or add `by` to an existing rc.
    ///
    /// The reply carries the new rc and the previous access time, zero if
    /// the object was created.
    ///
    /// # Panics
    ///
    /// Panics if `by` is not positive.
    fn set_with(&self, key: &Hash, val: &[u8], by: i64, touch: bool) -> CxdsResult<Object>;

    /// Add `by` to the rc of an existing object and return the new rc.
    fn incr_with(&self, key: &Hash, by: i64, touch: bool) -> CxdsResult<i64>;

    /// Store an object as is, replacing any previous record.
    fn set_raw(&self, key: &Hash, obj: &Object) -> CxdsResult<()>;

    /// Delete an object regardless of its rc and return it.
    fn take(&self, key: &Hash) -> CxdsResult<Object>;

    /// Visit every object in ascending key order.
    ///
    /// Mutations of the store are allowed from the visitor. Entries deleted
    /// before they are reached are skipped. Return
    /// [`CxdsError::StopIteration`](crate::CxdsError::StopIteration) to stop.
    fn iterate(&self, visit: &mut IterateFn<'_>) -> CxdsResult<()>;

    /// Visit every object and delete those the visitor selects.
    ///
    /// The visitor runs inside the entry's write critical section and must
    /// not call back into the store. Deleting scans exclude each other and
    /// read-only scans.
    fn iterate_del(&self, visit: &mut IterateDelFn<'_>) -> CxdsResult<()>;

    /// Number of objects: (all, used).
    fn amount(&self) -> (u64, u64);

    /// Total size of values in bytes: (all, used).
    fn volume(&self) -> (u64, u64);

    /// `false` when the previous session ended without a clean close.
    fn is_safe_closed(&self) -> bool;

    /// Flush statistics and release the backend. Closing twice is a no-op.
    fn close(&self) -> CxdsResult<()>;

    // -----------------------------------------------------------------------
    // Convenience methods
    // -----------------------------------------------------------------------

    fn get(&self, key: &Hash) -> CxdsResult<Object> {
        self.get_with(key, 0, true)
    }

    fn get_not_touch(&self, key: &Hash) -> CxdsResult<Object> {
        self.get_with(key, 0, false)
    }

    fn get_incr(&self, key: &Hash, by: i64) -> CxdsResult<Object> {
        self.get_with(key, by, true)
    }

    fn get_incr_not_touch(&self, key: &Hash, by: i64) -> CxdsResult<Object> {
        self.get_with(key, by, false)
    }

    fn set(&self, key: &Hash, val: &[u8]) -> CxdsResult<Object> {
        self.set_with(key, val, 1, true)
    }

    fn set_not_touch(&self, key: &Hash, val: &[u8]) -> CxdsResult<Object> {
        self.set_with(key, val, 1, false)
    }

    fn set_incr(&self, key: &Hash, val: &[u8], by: i64) -> CxdsResult<Object> {
        self.set_with(key, val, by, true)
    }

    fn set_incr_not_touch(&self, key: &Hash, val: &[u8], by: i64) -> CxdsResult<Object> {
        self.set_with(key, val, by, false)
    }

    fn incr(&self, key: &Hash, by: i64) -> CxdsResult<i64> {
        self.incr_with(key, by, true)
    }

    fn incr_not_touch(&self, key: &Hash, by: i64) -> CxdsResult<i64> {
        self.incr_with(key, by, false)
    }

    /// Delete an object regardless of its rc.
    fn del(&self, key: &Hash) -> CxdsResult<()> {
        self.take(key).map(|_| ())
    }

    /// Returns `true` if the key is stored. Does not touch.
    fn has(&self, key: &Hash) -> CxdsResult<bool> {
        match self.get_not_touch(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
