//! sled-backed CXDS.
//!
//! Objects live in the default keyspace under their raw 32-byte hash. The
//! [`MetaInfo`] record sits under the one-byte key `"i"`, which can never
//! collide with an object key.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use cxo_codec::{CodecError, Decode, Encode};
use cxo_types::{now_nanos, Hash, HASH_LEN};
use tracing::{debug, info, warn};

use crate::error::{CxdsError, CxdsResult};
use crate::iterate::{scan, IterGate, DEFAULT_SCAN_COUNT};
use crate::object::{check_set, ops, validate, Mutation, Object, Store};
use crate::stat::{MetaInfo, Stat};
use crate::traits::{Cxds, IterateDelFn, IterateFn};

const META_KEY: &[u8] = b"i";

/// Persistent CXDS in a sled log-structured database.
///
/// Writes go through one writer lock so that every read-modify-write of
/// a key is atomic. sled buffers writes and syncs them in the background;
/// [`flush`](Self::flush) and [`Cxds::close`] sync at once. The safe-close
/// protocol is the one of [`FileCxds`](crate::FileCxds).
pub struct LsmCxds {
    path: PathBuf,
    db: RwLock<Option<sled::Db>>,
    writer: Mutex<()>,
    stat: Mutex<Stat>,
    gate: IterGate,
    scan_count: usize,
    safe_closed: bool,
}

impl LsmCxds {
    /// Open or create the store in directory `path`.
    pub fn open(path: impl AsRef<Path>) -> CxdsResult<Self> {
        Self::open_with(path, DEFAULT_SCAN_COUNT)
    }

    /// Open or create the store, iterating `scan_count` keys per batch.
    pub fn open_with(path: impl AsRef<Path>, scan_count: usize) -> CxdsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;

        let (stat, safe_closed) = match read_meta(&db)? {
            None => (Stat::default(), true),
            Some(meta) if meta.safe_closed => (meta.stat, true),
            Some(_) => {
                warn!(path = %path.display(), "cxds was not closed safely, recounting");
                (recount(&db)?, false)
            }
        };
        write_meta(
            &db,
            &MetaInfo {
                stat,
                safe_closed: false,
            },
        )?;
        db.flush()?;

        info!(
            path = %path.display(),
            amount = stat.amount_all,
            volume = stat.volume_all,
            safe_closed,
            "lsm cxds opened"
        );
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
            writer: Mutex::new(()),
            stat: Mutex::new(stat),
            gate: IterGate::default(),
            scan_count: scan_count.max(1),
            safe_closed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the statistics.
    pub fn stat(&self) -> Stat {
        *self.stat.lock().expect("lock poisoned")
    }

    /// Sync buffered writes to disk. Returns the bytes written.
    pub fn flush(&self) -> CxdsResult<usize> {
        self.with_db(|db| Ok(db.flush()?))
    }

    fn with_db<R>(&self, f: impl FnOnce(&sled::Db) -> CxdsResult<R>) -> CxdsResult<R> {
        let guard = self.db.read().expect("lock poisoned");
        let db = guard.as_ref().ok_or(CxdsError::Closed)?;
        f(db)
    }

    fn update<R, F>(&self, key: &Hash, f: F) -> CxdsResult<R>
    where
        F: FnOnce(Option<Object>) -> CxdsResult<Mutation<R>>,
    {
        let k = key.as_bytes().as_slice();
        self.with_db(|db| {
            let _writer = self.writer.lock().expect("lock poisoned");
            let existing = db.get(k)?.map(|v| Object::decode(&v)).transpose()?;
            let m = f(existing)?;
            match &m.store {
                Store::Keep => {}
                Store::Put(obj) => {
                    db.insert(k, obj.try_encode()?)?;
                }
                Store::Delete => {
                    db.remove(k)?;
                }
            }
            self.stat.lock().expect("lock poisoned").apply(&m.change);
            Ok(m.reply)
        })
    }

    fn load(&self, key: &Hash) -> CxdsResult<Option<Object>> {
        self.with_db(|db| {
            let obj = db
                .get(key.as_bytes())?
                .map(|v| Object::decode(&v))
                .transpose()?;
            Ok(obj)
        })
    }

    fn keys_after(&self, cursor: Option<Hash>, n: usize) -> CxdsResult<Vec<Hash>> {
        self.with_db(|db| {
            let lower = match &cursor {
                Some(c) => Bound::Excluded(c.as_bytes().as_slice()),
                None => Bound::Unbounded,
            };
            let mut keys = Vec::with_capacity(n);
            for entry in db.range::<&[u8], _>((lower, Bound::Unbounded)) {
                let (k, _) = entry?;
                if k.len() != HASH_LEN {
                    continue;
                }
                keys.push(object_key(&k)?);
                if keys.len() == n {
                    break;
                }
            }
            Ok(keys)
        })
    }
}

impl std::fmt::Debug for LsmCxds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmCxds")
            .field("path", &self.path)
            .field("stat", &self.stat())
            .field("safe_closed", &self.safe_closed)
            .finish()
    }
}

fn object_key(k: &[u8]) -> CxdsResult<Hash> {
    Hash::from_slice(k).map_err(|e| {
        CodecError::InvalidField {
            field: "key",
            reason: e.to_string(),
        }
        .into()
    })
}

fn read_meta(db: &sled::Db) -> CxdsResult<Option<MetaInfo>> {
    let meta = db.get(META_KEY)?.map(|v| MetaInfo::decode(&v)).transpose()?;
    Ok(meta)
}

fn write_meta(db: &sled::Db, meta: &MetaInfo) -> CxdsResult<()> {
    db.insert(META_KEY, meta.encode())?;
    Ok(())
}

fn recount(db: &sled::Db) -> CxdsResult<Stat> {
    let mut stat = Stat::default();
    for entry in db.iter() {
        let (k, v) = entry?;
        if k.len() != HASH_LEN {
            continue;
        }
        let obj = Object::decode(&v)?;
        stat.count(obj.vol(), obj.rc);
    }
    Ok(stat)
}

impl Cxds for LsmCxds {
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
        debug!(removed, path = %self.path.display(), "iterate_del finished");
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
        self.safe_closed
    }

    fn close(&self) -> CxdsResult<()> {
        let mut guard = self.db.write().expect("lock poisoned");
        let Some(db) = guard.take() else {
            return Ok(());
        };
        let stat = self.stat();
        write_meta(
            &db,
            &MetaInfo {
                stat,
                safe_closed: true,
            },
        )?;
        db.flush()?;
        info!(
            path = %self.path.display(),
            amount = stat.amount_all,
            volume = stat.volume_all,
            "lsm cxds closed"
        );
        Ok(())
    }
}
