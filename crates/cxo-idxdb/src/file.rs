//! redb-backed index.
//!
//! Layout:
//!
//! - `feeds`: `pk` -> empty
//! - `heads`: `pk ‖ nonce` -> empty
//! - `roots`: `pk ‖ nonce ‖ seq` -> encoded [`Root`]
//! - `i`: key `"i"` -> one-byte safe-close flag (`0x00` open, `0xff` closed)
//!
//! Nonces and seqs are big-endian so that key order is numeric order.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use cxo_codec::{CodecError, Decode, Encode};
use cxo_types::{now_nanos, Hash, PubKey, Sig, PUBKEY_LEN};
use redb::{
    Database, ReadTransaction, ReadableTable, TableDefinition, TableError, WriteTransaction,
};
use tracing::{debug, info, warn};

use crate::error::{IdxError, Result};
use crate::traits::{FeedFn, HeadFn, IdxDb, RootFn};
use crate::types::{visit_all, Root};

const FEEDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("feeds");
const HEADS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("heads");
const ROOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("roots");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("i");
const META_KEY: &str = "i";

const EMPTY: &[u8] = &[];

const FLAG_OPEN: u8 = 0x00;
const FLAG_SAFE_CLOSED: u8 = 0xff;

const HEAD_KEY_LEN: usize = PUBKEY_LEN + 8;
const ROOT_KEY_LEN: usize = HEAD_KEY_LEN + 8;

fn head_key(pk: &PubKey, nonce: u64) -> [u8; HEAD_KEY_LEN] {
    let mut key = [0u8; HEAD_KEY_LEN];
    key[..PUBKEY_LEN].copy_from_slice(pk.as_bytes());
    key[PUBKEY_LEN..].copy_from_slice(&nonce.to_be_bytes());
    key
}

fn root_key(pk: &PubKey, nonce: u64, seq: u64) -> [u8; ROOT_KEY_LEN] {
    let mut key = [0u8; ROOT_KEY_LEN];
    key[..HEAD_KEY_LEN].copy_from_slice(&head_key(pk, nonce));
    key[HEAD_KEY_LEN..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Trailing big-endian u64 of a composite key.
fn key_tail(key: &[u8]) -> Result<u64> {
    let tail: [u8; 8] = key
        .get(key.len().saturating_sub(8)..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CodecError::InvalidSize(format!("index key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(tail))
}

fn require_feed<T>(feeds: &T, pk: &PubKey) -> Result<()>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    match feeds.get(pk.as_bytes().as_slice())? {
        Some(_) => Ok(()),
        None => Err(IdxError::NoSuchFeed(*pk)),
    }
}

fn require_head<F, H>(feeds: &F, heads: &H, pk: &PubKey, nonce: u64) -> Result<()>
where
    F: ReadableTable<&'static [u8], &'static [u8]>,
    H: ReadableTable<&'static [u8], &'static [u8]>,
{
    require_feed(feeds, pk)?;
    match heads.get(head_key(pk, nonce).as_slice())? {
        Some(_) => Ok(()),
        None => Err(IdxError::NoSuchHead { feed: *pk, nonce }),
    }
}

/// Keys of `table` between `lo` and `hi` inclusive.
fn keys_between<T>(table: &T, lo: &[u8], hi: &[u8]) -> Result<Vec<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range::<&[u8]>(lo..=hi)? {
        let (k, _) = entry?;
        keys.push(k.value().to_vec());
    }
    Ok(keys)
}

/// Persistent [`IdxDb`] in a single redb file.
pub struct FileIdxDb {
    path: PathBuf,
    db: RwLock<Option<Database>>,
    safe_closed: bool,
}

impl FileIdxDb {
    /// Open or create the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let safe_closed = match read_flag(&db)? {
            None => true,
            Some(flag) => flag,
        };
        if !safe_closed {
            warn!(path = %path.display(), "idxdb was not closed safely");
        }
        write_flag(&db, FLAG_OPEN)?;

        info!(path = %path.display(), safe_closed, "idxdb opened");
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
            safe_closed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<R>(&self, f: impl FnOnce(&ReadTransaction) -> Result<R>) -> Result<R> {
        let guard = self.db.read().expect("lock poisoned");
        let db = guard.as_ref().ok_or(IdxError::Closed)?;
        let txn = db.begin_read()?;
        f(&txn)
    }

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let guard = self.db.read().expect("lock poisoned");
        let db = guard.as_ref().ok_or(IdxError::Closed)?;
        let txn = db.begin_write()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    fn collect_roots(&self, pk: &PubKey, nonce: u64) -> Result<Vec<(u64, Root)>> {
        self.read(|txn| {
            let feeds = txn.open_table(FEEDS)?;
            let heads = txn.open_table(HEADS)?;
            require_head(&feeds, &heads, pk, nonce)?;
            let roots = txn.open_table(ROOTS)?;
            let lo = root_key(pk, nonce, 0);
            let hi = root_key(pk, nonce, u64::MAX);
            let mut out = Vec::new();
            for entry in roots.range::<&[u8]>(lo.as_slice()..=hi.as_slice())? {
                let (k, v) = entry?;
                out.push((key_tail(k.value())?, Root::decode(v.value())?));
            }
            Ok(out)
        })
    }
}

impl std::fmt::Debug for FileIdxDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIdxDb")
            .field("path", &self.path)
            .field("safe_closed", &self.safe_closed)
            .finish()
    }
}

fn read_flag(db: &Database) -> Result<Option<bool>> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(META) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let Some(guard) = table.get(META_KEY)? else {
        return Ok(None);
    };
    match guard.value() {
        [FLAG_OPEN] => Ok(Some(false)),
        [FLAG_SAFE_CLOSED] => Ok(Some(true)),
        other => Err(CodecError::InvalidField {
            field: "safe_closed",
            reason: format!("unexpected flag {other:?}"),
        }
        .into()),
    }
}

/// Store the flag, creating all tables on first use.
fn write_flag(db: &Database, flag: u8) -> Result<()> {
    let txn = db.begin_write()?;
    {
        txn.open_table(FEEDS)?;
        txn.open_table(HEADS)?;
        txn.open_table(ROOTS)?;
        let mut meta = txn.open_table(META)?;
        meta.insert(META_KEY, [flag].as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

impl IdxDb for FileIdxDb {
    fn add_feed(&self, pk: &PubKey) -> Result<()> {
        self.write(|txn| {
            let mut feeds = txn.open_table(FEEDS)?;
            feeds.insert(pk.as_bytes().as_slice(), EMPTY)?;
            Ok(())
        })
    }

    fn del_feed(&self, pk: &PubKey) -> Result<()> {
        self.write(|txn| {
            let mut feeds = txn.open_table(FEEDS)?;
            if feeds.remove(pk.as_bytes().as_slice())?.is_none() {
                return Err(IdxError::NoSuchFeed(*pk));
            }

            let mut heads = txn.open_table(HEADS)?;
            let head_keys = keys_between(
                &heads,
                &head_key(pk, 0),
                &head_key(pk, u64::MAX),
            )?;
            for k in &head_keys {
                heads.remove(k.as_slice())?;
            }

            let mut roots = txn.open_table(ROOTS)?;
            let root_keys = keys_between(
                &roots,
                &root_key(pk, 0, 0),
                &root_key(pk, u64::MAX, u64::MAX),
            )?;
            for k in &root_keys {
                roots.remove(k.as_slice())?;
            }
            debug!(feed = %pk, heads = head_keys.len(), roots = root_keys.len(), "feed deleted");
            Ok(())
        })
    }

    fn has_feed(&self, pk: &PubKey) -> Result<bool> {
        self.read(|txn| {
            let feeds = txn.open_table(FEEDS)?;
            let found = feeds.get(pk.as_bytes().as_slice())?.is_some();
            Ok(found)
        })
    }

    fn feeds_len(&self) -> Result<usize> {
        self.read(|txn| {
            let feeds = txn.open_table(FEEDS)?;
            let len = feeds.iter()?.count();
            Ok(len)
        })
    }

    fn iterate_feeds(&self, visit: &mut FeedFn<'_>) -> Result<()> {
        let snapshot = self.read(|txn| {
            let feeds = txn.open_table(FEEDS)?;
            let mut out = Vec::new();
            for entry in feeds.iter()? {
                let (k, _) = entry?;
                out.push(PubKey::from_slice(k.value()).map_err(|e| {
                    CodecError::InvalidField {
                        field: "feed",
                        reason: e.to_string(),
                    }
                })?);
            }
            Ok(out)
        })?;
        visit_all(snapshot, |pk| visit(&pk))
    }

    fn add_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        self.write(|txn| {
            require_feed(&txn.open_table(FEEDS)?, pk)?;
            let mut heads = txn.open_table(HEADS)?;
            heads.insert(head_key(pk, nonce).as_slice(), EMPTY)?;
            Ok(())
        })
    }

    fn del_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        self.write(|txn| {
            require_feed(&txn.open_table(FEEDS)?, pk)?;
            let mut heads = txn.open_table(HEADS)?;
            if heads.remove(head_key(pk, nonce).as_slice())?.is_none() {
                return Err(IdxError::NoSuchHead { feed: *pk, nonce });
            }
            let mut roots = txn.open_table(ROOTS)?;
            let keys = keys_between(
                &roots,
                &root_key(pk, nonce, 0),
                &root_key(pk, nonce, u64::MAX),
            )?;
            for k in &keys {
                roots.remove(k.as_slice())?;
            }
            Ok(())
        })
    }

    fn has_head(&self, pk: &PubKey, nonce: u64) -> Result<bool> {
        self.read(|txn| {
            require_feed(&txn.open_table(FEEDS)?, pk)?;
            let heads = txn.open_table(HEADS)?;
            let found = heads.get(head_key(pk, nonce).as_slice())?.is_some();
            Ok(found)
        })
    }

    fn iterate_heads(&self, pk: &PubKey, visit: &mut HeadFn<'_>) -> Result<()> {
        let snapshot = self.read(|txn| {
            require_feed(&txn.open_table(FEEDS)?, pk)?;
            let heads = txn.open_table(HEADS)?;
            keys_between(&heads, &head_key(pk, 0), &head_key(pk, u64::MAX))?
                .iter()
                .map(|k| key_tail(k))
                .collect::<Result<Vec<u64>>>()
        })?;
        visit_all(snapshot, visit)
    }

    fn heads_len(&self, pk: &PubKey) -> Result<usize> {
        self.read(|txn| {
            require_feed(&txn.open_table(FEEDS)?, pk)?;
            let heads = txn.open_table(HEADS)?;
            let keys = keys_between(&heads, &head_key(pk, 0), &head_key(pk, u64::MAX))?;
            Ok(keys.len())
        })
    }

    fn ascend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()> {
        let snapshot = self.collect_roots(pk, nonce)?;
        visit_all(snapshot, |(seq, r)| visit(seq, &r))
    }

    fn descend_roots(&self, pk: &PubKey, nonce: u64, visit: &mut RootFn<'_>) -> Result<()> {
        let snapshot = self.collect_roots(pk, nonce)?;
        visit_all(snapshot.into_iter().rev(), |(seq, r)| visit(seq, &r))
    }

    fn has_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<bool> {
        self.read(|txn| {
            require_head(&txn.open_table(FEEDS)?, &txn.open_table(HEADS)?, pk, nonce)?;
            let roots = txn.open_table(ROOTS)?;
            let found = roots.get(root_key(pk, nonce, seq).as_slice())?.is_some();
            Ok(found)
        })
    }

    fn roots_len(&self, pk: &PubKey, nonce: u64) -> Result<usize> {
        Ok(self.collect_roots(pk, nonce)?.len())
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
        let key = root_key(pk, nonce, seq);
        self.write(|txn| {
            require_head(&txn.open_table(FEEDS)?, &txn.open_table(HEADS)?, pk, nonce)?;
            let mut roots = txn.open_table(ROOTS)?;
            let existing = roots
                .get(key.as_slice())?
                .map(|g| Root::decode(g.value()))
                .transpose()?;
            let (stored, reply) = match existing {
                Some(mut root) => {
                    let prev = root.access_time;
                    root.hash = *hash;
                    root.sig = *sig;
                    if touch {
                        root.access_time = now;
                    }
                    let reply = Root {
                        access_time: prev,
                        ..root.clone()
                    };
                    (root, reply)
                }
                None => {
                    let root = Root {
                        hash: *hash,
                        sig: *sig,
                        access_time: if touch { now } else { 0 },
                        create_time: now,
                    };
                    let reply = Root {
                        access_time: 0,
                        ..root.clone()
                    };
                    (root, reply)
                }
            };
            roots.insert(key.as_slice(), stored.encode().as_slice())?;
            Ok(reply)
        })
    }

    fn get_root_with(&self, pk: &PubKey, nonce: u64, seq: u64, touch: bool) -> Result<Root> {
        let key = root_key(pk, nonce, seq);
        let not_found = || IdxError::NotFound {
            feed: *pk,
            nonce,
            seq,
        };
        if !touch {
            return self.read(|txn| {
                require_head(&txn.open_table(FEEDS)?, &txn.open_table(HEADS)?, pk, nonce)?;
                let roots = txn.open_table(ROOTS)?;
                let root = roots
                    .get(key.as_slice())?
                    .map(|g| Root::decode(g.value()))
                    .transpose()?;
                root.ok_or_else(not_found)
            });
        }
        self.write(|txn| {
            require_head(&txn.open_table(FEEDS)?, &txn.open_table(HEADS)?, pk, nonce)?;
            let mut roots = txn.open_table(ROOTS)?;
            let reply = roots
                .get(key.as_slice())?
                .map(|g| Root::decode(g.value()))
                .transpose()?
                .ok_or_else(not_found)?;
            let touched = Root {
                access_time: now_nanos(),
                ..reply.clone()
            };
            roots.insert(key.as_slice(), touched.encode().as_slice())?;
            Ok(reply)
        })
    }

    fn take_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root> {
        self.write(|txn| {
            require_head(&txn.open_table(FEEDS)?, &txn.open_table(HEADS)?, pk, nonce)?;
            let mut roots = txn.open_table(ROOTS)?;
            let root = roots
                .remove(root_key(pk, nonce, seq).as_slice())?
                .map(|g| Root::decode(g.value()))
                .transpose()?;
            root.ok_or(IdxError::NotFound {
                feed: *pk,
                nonce,
                seq,
            })
        })
    }

    fn is_safe_closed(&self) -> bool {
        self.safe_closed
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.write().expect("lock poisoned");
        let Some(db) = guard.take() else {
            return Ok(());
        };
        write_flag(&db, FLAG_SAFE_CLOSED)?;
        info!(path = %self.path.display(), "idxdb closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn open_temp() -> (tempfile::TempDir, FileIdxDb) {
        let dir = tempfile::tempdir().unwrap();
        let idx = FileIdxDb::open(dir.path().join("idx.db")).unwrap();
        (dir, idx)
    }

    #[test]
    fn seq_ordering() {
        let (_dir, idx) = open_temp();
        testing::seq_ordering(&idx);
    }

    #[test]
    fn feed_deletion_cascades() {
        let (_dir, idx) = open_temp();
        testing::feed_deletion_cascades(&idx);
    }

    #[test]
    fn set_root_semantics() {
        let (_dir, idx) = open_temp();
        testing::set_root_semantics(&idx);
    }

    #[test]
    fn rejects_bad_signature() {
        let (_dir, idx) = open_temp();
        testing::rejects_bad_signature(&idx);
    }

    #[test]
    fn heads_and_feeds() {
        let (_dir, idx) = open_temp();
        testing::heads_and_feeds(&idx);
    }

    #[test]
    fn visitors_may_modify() {
        let (_dir, idx) = open_temp();
        testing::visitors_may_modify(&idx);
    }

    #[test]
    fn key_order_is_numeric() {
        // 256 sorts after 1 only with big-endian encoding
        assert!(root_key(&PubKey::default(), 0, 256) > root_key(&PubKey::default(), 0, 1));
        assert_eq!(key_tail(&root_key(&PubKey::default(), 3, 99)).unwrap(), 99);
    }

    #[test]
    fn safe_close_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.db");

        let idx = FileIdxDb::open(&path).unwrap();
        assert!(idx.is_safe_closed());
        idx.close().unwrap();

        let idx = FileIdxDb::open(&path).unwrap();
        assert!(idx.is_safe_closed());
        drop(idx);

        let idx = FileIdxDb::open(&path).unwrap();
        assert!(!idx.is_safe_closed());
        idx.close().unwrap();
    }

    #[test]
    fn roots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.db");
        let (pk, sk) = cxo_crypto::generate_keypair();
        let hash = Hash::sum(b"body");

        let idx = FileIdxDb::open(&path).unwrap();
        idx.add_feed(&pk).unwrap();
        idx.add_head(&pk, 1).unwrap();
        idx.set_root(&pk, 1, 5, &hash, &sk.sign_hash(&hash)).unwrap();
        idx.close().unwrap();

        let idx = FileIdxDb::open(&path).unwrap();
        let root = idx.get_not_touch_root(&pk, 1, 5).unwrap();
        assert_eq!(root.hash, hash);
        idx.close().unwrap();
    }

    #[test]
    fn operations_after_close_fail() {
        let (_dir, idx) = open_temp();
        idx.close().unwrap();
        idx.close().unwrap();
        assert!(matches!(
            idx.add_feed(&PubKey::default()),
            Err(IdxError::Closed)
        ));
    }
}
