use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cxo_types::Hash;

use crate::error::{CxdsError, CxdsResult};

/// Number of keys read per batch when no other value is configured.
pub const DEFAULT_SCAN_COUNT: usize = 100;

/// Serializes deleting scans against read-only scans.
///
/// Any number of [`Cxds::iterate`](crate::Cxds::iterate) calls may run
/// together; [`Cxds::iterate_del`](crate::Cxds::iterate_del) runs alone.
#[derive(Debug, Default)]
pub struct IterGate {
    lock: RwLock<()>,
}

impl IterGate {
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().expect("lock poisoned")
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().expect("lock poisoned")
    }
}

/// Walk all keys in ascending order, `scan_count` keys at a time.
///
/// `next_batch(cursor, n)` returns up to `n` keys strictly after `cursor`
/// and must release any backend lock before returning, so `step` runs
/// with the store unlocked. A [`CxdsError::StopIteration`] from `step`
/// ends the walk with `Ok(())`.
pub(crate) fn scan<N, S>(scan_count: usize, mut next_batch: N, mut step: S) -> CxdsResult<()>
where
    N: FnMut(Option<Hash>, usize) -> CxdsResult<Vec<Hash>>,
    S: FnMut(&Hash) -> CxdsResult<()>,
{
    let scan_count = scan_count.max(1);
    let mut cursor = None;
    loop {
        let batch = next_batch(cursor, scan_count)?;
        for key in &batch {
            match step(key) {
                Ok(()) => {}
                Err(CxdsError::StopIteration) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        match batch.last() {
            Some(last) if batch.len() == scan_count => cursor = Some(*last),
            _ => return Ok(()),
        }
        std::thread::yield_now();
    }
}
