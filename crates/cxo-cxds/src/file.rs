use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use cxo_codec::{CodecError, Decode, Encode};
use cxo_types::{now_nanos, Hash};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::{debug, info, warn};

use crate::error::{CxdsError, CxdsResult};
use crate::iterate::{scan, IterGate, DEFAULT_SCAN_COUNT};
use crate::object::{check_set, ops, validate, Mutation, Object, Store};
use crate::stat::{MetaInfo, Stat};
use crate::traits::{Cxds, IterateDelFn, IterateFn};

/// Objects: key hash -> encoded [`Object`].
const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("o");
/// Meta bucket holding the single [`MetaInfo`] record.
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("i");
const META_KEY: &str = "i";

/// Persistent CXDS in a single redb file.
///
/// The safe-close flag is cleared when the store opens and set again by
/// [`Cxds::close`]. If a previous session ended without closing, the
/// statistics are rebuilt by a full scan.
pub struct FileCxds {
    path: PathBuf,
    db: RwLock<Option<Database>>,
    stat: Mutex<Stat>,
    gate: IterGate,
    scan_count: usize,
    safe_closed: bool,
}

impl FileCxds {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> CxdsResult<Self> {
        Self::open_with(path, DEFAULT_SCAN_COUNT)
    }

    /// Open or create the store, iterating `scan_count` keys per batch.
    pub fn open_with(path: impl AsRef<Path>, scan_count: usize) -> CxdsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

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

        info!(
            path = %path.display(),
            amount = stat.amount_all,
            volume = stat.volume_all,
            safe_closed,
            "cxds opened"
        );
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
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

    fn with_db<R>(&self, f: impl FnOnce(&Database) -> CxdsResult<R>) -> CxdsResult<R> {
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
            let txn = db.begin_write()?;
            let m = {
                let mut table = txn.open_table(OBJECTS)?;
                let existing = table
                    .get(k)?
                    .map(|g| Object::decode(g.value()))
                    .transpose()?;
                let m = f(existing)?;
                match &m.store {
                    Store::Keep => {}
                    Store::Put(obj) => {
                        table.insert(k, obj.try_encode()?.as_slice())?;
                    }
                    Store::Delete => {
                        table.remove(k)?;
                    }
                }
                m
            };
            if matches!(m.store, Store::Keep) {
                txn.abort()?;
            } else {
                txn.commit()?;
            }
            self.stat.lock().expect("lock poisoned").apply(&m.change);
            Ok(m.reply)
        })
    }

    fn load(&self, key: &Hash) -> CxdsResult<Option<Object>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = match txn.open_table(OBJECTS) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let obj = table
                .get(key.as_bytes().as_slice())?
                .map(|g| Object::decode(g.value()))
                .transpose()?;
            Ok(obj)
        })
    }

    fn keys_after(&self, cursor: Option<Hash>, n: usize) -> CxdsResult<Vec<Hash>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = match txn.open_table(OBJECTS) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let lower = match &cursor {
                Some(c) => Bound::Excluded(c.as_bytes().as_slice()),
                None => Bound::Unbounded,
            };
            let mut keys = Vec::with_capacity(n);
            for entry in table.range::<&[u8]>((lower, Bound::Unbounded))?.take(n) {
                let (k, _) = entry?;
                let key = Hash::from_slice(k.value()).map_err(|e| CodecError::InvalidField {
                    field: "key",
                    reason: e.to_string(),
                })?;
                keys.push(key);
            }
            Ok(keys)
        })
    }
}

impl std::fmt::Debug for FileCxds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCxds")
            .field("path", &self.path)
            .field("stat", &self.stat())
            .field("safe_closed", &self.safe_closed)
            .finish()
    }
}

fn read_meta(db: &Database) -> CxdsResult<Option<MetaInfo>> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(META) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta = match table.get(META_KEY)? {
        Some(g) => Some(MetaInfo::decode(g.value())?),
        None => None,
    };
    Ok(meta)
}

fn write_meta(db: &Database, meta: &MetaInfo) -> CxdsResult<()> {
    let txn = db.begin_write()?;
    {
        txn.open_table(OBJECTS)?;
        let mut table = txn.open_table(META)?;
        table.insert(META_KEY, meta.encode().as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

fn recount(db: &Database) -> CxdsResult<Stat> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(OBJECTS) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Stat::default()),
        Err(e) => return Err(e.into()),
    };
    let mut stat = Stat::default();
    for entry in table.iter()? {
        let (_, v) = entry?;
        let obj = Object::decode(v.value())?;
        stat.count(obj.vol(), obj.rc);
    }
    Ok(stat)
}

impl Cxds for FileCxds {
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
        info!(
            path = %self.path.display(),
            amount = stat.amount_all,
            volume = stat.volume_all,
            "cxds closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn open_temp() -> (tempfile::TempDir, FileCxds) {
        let dir = tempfile::tempdir().unwrap();
        let db = FileCxds::open_with(dir.path().join("cxds.db"), 3).unwrap();
        (dir, db)
    }

    #[test]
    fn lifecycle() {
        let (_dir, db) = open_temp();
        testing::lifecycle(&db);
    }

    #[test]
    fn stat_accounting() {
        let (_dir, db) = open_temp();
        testing::stat_accounting(&db);
    }

    #[test]
    fn touch_semantics() {
        let (_dir, db) = open_temp();
        testing::touch_semantics(&db);
    }

    #[test]
    fn rejects_bad_input() {
        let (_dir, db) = open_temp();
        testing::rejects_bad_input(&db);
    }

    #[test]
    fn iterate_tolerates_deletion() {
        let (_dir, db) = open_temp();
        testing::iterate_tolerates_deletion(&db);
    }

    #[test]
    fn iterate_del_removes_selected() {
        let (_dir, db) = open_temp();
        testing::iterate_del_removes_selected(&db);
    }

    #[test]
    fn set_raw_replaces() {
        let (_dir, db) = open_temp();
        testing::set_raw_replaces(&db);
    }

    #[test]
    fn safe_close_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cxds.db");

        let db = FileCxds::open(&path).unwrap();
        assert!(db.is_safe_closed());
        db.close().unwrap();

        let db = FileCxds::open(&path).unwrap();
        assert!(db.is_safe_closed());
        // dropped without close
        drop(db);

        let db = FileCxds::open(&path).unwrap();
        assert!(!db.is_safe_closed());
        db.close().unwrap();
    }

    #[test]
    fn stats_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cxds.db");

        let db = FileCxds::open(&path).unwrap();
        let a = Hash::sum(b"alpha");
        db.set(&a, b"alpha").unwrap();
        let b = Hash::sum(b"be");
        db.set(&b, b"be").unwrap();
        db.incr(&b, -1).unwrap();
        db.close().unwrap();

        let db = FileCxds::open(&path).unwrap();
        assert_eq!(db.amount(), (2, 1));
        assert_eq!(db.volume(), (7, 5));
        assert_eq!(db.get_not_touch(&a).unwrap().val, b"alpha");
        db.close().unwrap();
    }

    #[test]
    fn unclean_shutdown_recounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cxds.db");

        let db = FileCxds::open(&path).unwrap();
        for i in 0u8..5 {
            db.set(&Hash::sum(&[i]), &[i]).unwrap();
        }
        drop(db);

        let db = FileCxds::open(&path).unwrap();
        assert!(!db.is_safe_closed());
        assert_eq!(db.amount(), (5, 5));
        assert_eq!(db.volume(), (5, 5));
        db.close().unwrap();
    }

    #[test]
    fn corrupted_meta_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cxds.db");
        {
            let raw = Database::create(&path).unwrap();
            let txn = raw.begin_write().unwrap();
            {
                let mut table = txn.open_table(META).unwrap();
                table.insert(META_KEY, [1u8, 2, 3].as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }
        let err = FileCxds::open(&path).unwrap_err();
        assert!(matches!(err, CxdsError::Codec(_)));
        // the file is released and can be opened again
        assert!(Database::create(&path).is_ok());
    }

    #[test]
    fn operations_after_close_fail() {
        let (_dir, db) = open_temp();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.set(&Hash::sum(b"x"), b"x"),
            Err(CxdsError::Closed)
        ));
        assert!(matches!(db.iterate(&mut |_, _| Ok(())), Err(CxdsError::Closed)));
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileCxds::open(dir.path().join("a/b/cxds.db")).unwrap();
        assert!(db.path().exists());
        db.close().unwrap();
    }
}
