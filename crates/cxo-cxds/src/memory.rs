use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use cxo_types::{now_nanos, Hash};
use tracing::debug;

use crate::error::{CxdsError, CxdsResult};
use crate::iterate::{scan, IterGate, DEFAULT_SCAN_COUNT};
use crate::object::{check_set, ops, validate, Mutation, Object, Store};
use crate::stat::Stat;
use crate::traits::{Cxds, IterateDelFn, IterateFn};

/// In-memory CXDS backed by an ordered map.
///
/// Intended for tests and embedding. Always reports a safe close.
pub struct InMemoryCxds {
    objects: RwLock<BTreeMap<Hash, Object>>,
    stat: Mutex<Stat>,
    gate: IterGate,
    scan_count: usize,
    closed: AtomicBool,
}

impl InMemoryCxds {
    pub fn new() -> Self {
        Self::with_scan_count(DEFAULT_SCAN_COUNT)
    }

    /// Create a store that iterates `scan_count` keys per batch.
    pub fn with_scan_count(scan_count: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            stat: Mutex::new(Stat::default()),
            gate: IterGate::default(),
            scan_count: scan_count.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Snapshot of the statistics.
    pub fn stat(&self) -> Stat {
        *self.stat.lock().expect("lock poisoned")
    }

    fn check_open(&self) -> CxdsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CxdsError::Closed);
        }
        Ok(())
    }

    fn update<R, F>(&self, key: &Hash, f: F) -> CxdsResult<R>
    where
        F: FnOnce(Option<Object>) -> CxdsResult<Mutation<R>>,
    {
        let mut map = self.objects.write().expect("lock poisoned");
        self.check_open()?;
        let Mutation {
            store,
            reply,
            change,
        } = f(map.get(key).cloned())?;
        match store {
            Store::Keep => {}
            Store::Put(obj) => {
                map.insert(*key, obj);
            }
            Store::Delete => {
                map.remove(key);
            }
        }
        self.stat.lock().expect("lock poisoned").apply(&change);
        Ok(reply)
    }

    fn load(&self, key: &Hash) -> CxdsResult<Option<Object>> {
        let map = self.objects.read().expect("lock poisoned");
        self.check_open()?;
        Ok(map.get(key).cloned())
    }

    fn keys_after(&self, cursor: Option<Hash>, n: usize) -> CxdsResult<Vec<Hash>> {
        let map = self.objects.read().expect("lock poisoned");
        self.check_open()?;
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        Ok(map
            .range((lower, Bound::Unbounded))
            .take(n)
            .map(|(k, _)| *k)
            .collect())
    }
}

impl Default for InMemoryCxds {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCxds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCxds")
            .field("objects", &self.len())
            .field("stat", &self.stat())
            .finish()
    }
}

impl Cxds for InMemoryCxds {
    fn touch(&self, key: &Hash) -> CxdsResult<i64> {
        self.update(key, ops::touch(*key, now_nanos()))
    }

    fn get_with(&self, key: &Hash, by: i64, touch: bool) -> CxdsResult<Object> {
        if by == 0 && !touch {
            return self.load(key)?.ok_or(CxdsError::NotFound(*key));
        }
        self.update(key, ops::get_incr(*key, by, touch, now_nanos()))
    }

    fn set_with(&self, key: &Hash, val: &[u8], by: i64, touch: bool) -> CxdsResult<Object> {
        check_set(key, val, by)?;
        self.update(key, ops::set_incr(val.to_vec(), by, touch, now_nanos()))
    }

    fn incr_with(&self, key: &Hash, by: i64, touch: bool) -> CxdsResult<i64> {
        self.update(key, ops::incr(*key, by, touch, now_nanos()))
    }

    fn set_raw(&self, key: &Hash, obj: &Object) -> CxdsResult<()> {
        validate(key, &obj.val)?;
        self.update(key, ops::set_raw(obj.clone()))
    }

    fn take(&self, key: &Hash) -> CxdsResult<Object> {
        self.update(key, ops::take(*key))
    }

    fn iterate(&self, visit: &mut IterateFn<'_>) -> CxdsResult<()> {
        let _gate = self.gate.shared();
        scan(
            self.scan_count,
            |cursor, n| self.keys_after(cursor, n),
            |key| match self.load(key)? {
                Some(obj) => visit(key, &obj),
                None => Ok(()),
            },
        )
    }

    fn iterate_del(&self, visit: &mut IterateDelFn<'_>) -> CxdsResult<()> {
        let _gate = self.gate.exclusive();
        let mut removed = 0u64;
        let res = scan(
            self.scan_count,
            |cursor, n| self.keys_after(cursor, n),
            |key| {
                if self.update(key, ops::delete_if(*key, |k, o| visit(k, o)))? {
                    removed += 1;
                }
                Ok(())
            },
        );
        debug!(removed, "iterate_del finished");
        res
    }

    fn amount(&self) -> (u64, u64) {
        let s = self.stat();
        (s.amount_all, s.amount_used)
    }

    fn volume(&self) -> (u64, u64) {
        let s = self.stat();
        (s.volume_all, s.volume_used)
    }

    fn is_safe_closed(&self) -> bool {
        true
    }

    fn close(&self) -> CxdsResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(objects = self.len(), "in-memory cxds closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn lifecycle() {
        testing::lifecycle(&InMemoryCxds::new());
    }

    #[test]
    fn stat_accounting() {
        testing::stat_accounting(&InMemoryCxds::new());
    }

    #[test]
    fn touch_semantics() {
        testing::touch_semantics(&InMemoryCxds::new());
    }

    #[test]
    fn rejects_bad_input() {
        testing::rejects_bad_input(&InMemoryCxds::new());
    }

    #[test]
    fn iterate_tolerates_deletion() {
        testing::iterate_tolerates_deletion(&InMemoryCxds::with_scan_count(2));
    }

    #[test]
    fn iterate_del_removes_selected() {
        testing::iterate_del_removes_selected(&InMemoryCxds::with_scan_count(3));
    }

    #[test]
    fn set_raw_replaces() {
        testing::set_raw_replaces(&InMemoryCxds::new());
    }

    #[test]
    #[should_panic(expected = "non-positive increment")]
    fn set_with_zero_increment_panics() {
        let db = InMemoryCxds::new();
        let _ = db.set_incr(&Hash::sum(b"x"), b"x", 0);
    }

    #[test]
    fn close_is_idempotent() {
        let db = InMemoryCxds::new();
        db.close().unwrap();
        db.close().unwrap();
        assert!(db.is_safe_closed());
    }

    #[test]
    fn operations_after_close_fail() {
        let db = InMemoryCxds::new();
        let key = Hash::sum(b"kept");
        db.set(&key, b"kept").unwrap();
        db.close().unwrap();

        assert!(matches!(db.get(&key), Err(CxdsError::Closed)));
        assert!(matches!(db.get_not_touch(&key), Err(CxdsError::Closed)));
        assert!(matches!(db.set(&key, b"kept"), Err(CxdsError::Closed)));
        assert!(matches!(db.incr(&key, 1), Err(CxdsError::Closed)));
        assert!(matches!(db.take(&key), Err(CxdsError::Closed)));
        assert!(matches!(
            db.iterate(&mut |_, _| Ok(())),
            Err(CxdsError::Closed)
        ));
        assert!(matches!(
            db.iterate_del(&mut |_, _| Ok(true)),
            Err(CxdsError::Closed)
        ));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn debug_reports_counts() {
        let db = InMemoryCxds::new();
        db.set(&Hash::sum(b"a"), b"a").unwrap();
        assert!(format!("{db:?}").contains("objects: 1"));
    }

    #[test]
    fn concurrent_increments_are_atomic() {
        use std::sync::Arc;

        let db = Arc::new(InMemoryCxds::new());
        let key = Hash::sum(b"shared");
        db.set(&key, b"shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        db.incr(&key, 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.get_not_touch(&key).unwrap().rc, 801);
        assert_eq!(db.amount(), (1, 1));
    }
}
