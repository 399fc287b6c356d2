//! sled-backed index.
//!
//! Layout, one sled tree per redb table of [`FileIdxDb`](crate::FileIdxDb):
//!
//! - `feeds`: `pk` -> empty
//! - `heads`: `pk ‖ nonce` -> empty
//! - `roots`: `pk ‖ nonce ‖ seq` -> encoded [`Root`]
//! - default tree: key `"i"` -> one-byte safe-close flag
//!
//! Mutations take one writer lock, so a cascade is never interleaved
//! with another write.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use cxo_codec::{CodecError, Decode, Encode};
use cxo_types::{now_nanos, Hash, PubKey, Sig, PUBKEY_LEN};
use tracing::{debug, info, warn};

use crate::error::{IdxError, Result};
use crate::traits::{FeedFn, HeadFn, IdxDb, RootFn};
use crate::types::{visit_all, Root};

const META_KEY: &[u8] = b"i";
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

fn key_tail(key: &[u8]) -> Result<u64> {
    let tail: [u8; 8] = key
        .get(key.len().saturating_sub(8)..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CodecError::InvalidSize(format!("index key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(tail))
}

/// The open database and its trees.
struct Trees {
    db: sled::Db,
    feeds: sled::Tree,
    heads: sled::Tree,
    roots: sled::Tree,
}

impl Trees {
    fn require_feed(&self, pk: &PubKey) -> Result<()> {
        if self.feeds.contains_key(pk.as_bytes())? {
            Ok(())
        } else {
            Err(IdxError::NoSuchFeed(*pk))
        }
    }

    fn require_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        self.require_feed(pk)?;
        if self.heads.contains_key(head_key(pk, nonce))? {
            Ok(())
        } else {
            Err(IdxError::NoSuchHead { feed: *pk, nonce })
        }
    }

    fn head_keys(&self, pk: &PubKey) -> Result<Vec<sled::IVec>> {
        let mut keys = Vec::new();
        for entry in self.heads.scan_prefix(pk.as_bytes()) {
            let (k, _) = entry?;
            keys.push(k);
        }
        Ok(keys)
    }

    fn load_root(&self, key: &[u8]) -> Result<Option<Root>> {
        let root = self.roots.get(key)?.map(|v| Root::decode(&v)).transpose()?;
        Ok(root)
    }
}

/// Persistent [`IdxDb`] in a sled log-structured database.
pub struct LsmIdxDb {
    path: PathBuf,
    trees: RwLock<Option<Trees>>,
    writer: Mutex<()>,
    safe_closed: bool,
}

impl LsmIdxDb {
    /// Open or create the index in directory `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;

        let safe_closed = match read_flag(&db)? {
            None => true,
            Some(flag) => flag,
        };
        if !safe_closed {
            warn!(path = %path.display(), "idxdb was not closed safely");
        }
        db.insert(META_KEY, [FLAG_OPEN].as_slice())?;
        db.flush()?;

        let trees = Trees {
            feeds: db.open_tree("feeds")?,
            heads: db.open_tree("heads")?,
            roots: db.open_tree("roots")?,
            db,
        };
        info!(path = %path.display(), safe_closed, "lsm idxdb opened");
        Ok(Self {
            path,
            trees: RwLock::new(Some(trees)),
            writer: Mutex::new(()),
            safe_closed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync buffered writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.read(|t| {
            t.db.flush()?;
            Ok(())
        })
    }

    fn read<R>(&self, f: impl FnOnce(&Trees) -> Result<R>) -> Result<R> {
        let guard = self.trees.read().expect("lock poisoned");
        let trees = guard.as_ref().ok_or(IdxError::Closed)?;
        f(trees)
    }

    fn write<R>(&self, f: impl FnOnce(&Trees) -> Result<R>) -> Result<R> {
        self.read(|trees| {
            let _writer = self.writer.lock().expect("lock poisoned");
            f(trees)
        })
    }

    fn collect_roots(&self, pk: &PubKey, nonce: u64) -> Result<Vec<(u64, Root)>> {
        self.read(|t| {
            t.require_head(pk, nonce)?;
            let mut out = Vec::new();
            for entry in t.roots.scan_prefix(head_key(pk, nonce)) {
                let (k, v) = entry?;
                out.push((key_tail(&k)?, Root::decode(&v)?));
            }
            Ok(out)
        })
    }
}

impl std::fmt::Debug for LsmIdxDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmIdxDb")
            .field("path", &self.path)
            .field("safe_closed", &self.safe_closed)
            .finish()
    }
}

fn read_flag(db: &sled::Db) -> Result<Option<bool>> {
    let Some(v) = db.get(META_KEY)? else {
        return Ok(None);
    };
    match &v[..] {
        [FLAG_OPEN] => Ok(Some(false)),
        [FLAG_SAFE_CLOSED] => Ok(Some(true)),
        other => Err(CodecError::InvalidField {
            field: "safe_closed",
            reason: format!("unexpected flag {other:?}"),
        }
        .into()),
    }
}

impl IdxDb for LsmIdxDb {
    fn add_feed(&self, pk: &PubKey) -> Result<()> {
        self.write(|t| {
            t.feeds.insert(pk.as_bytes(), EMPTY)?;
            Ok(())
        })
    }

    fn del_feed(&self, pk: &PubKey) -> Result<()> {
        self.write(|t| {
            if t.feeds.remove(pk.as_bytes())?.is_none() {
                return Err(IdxError::NoSuchFeed(*pk));
            }
            let head_keys = t.head_keys(pk)?;
            for k in &head_keys {
                t.heads.remove(k)?;
            }
            let mut roots = 0usize;
            for entry in t.roots.scan_prefix(pk.as_bytes()) {
                let (k, _) = entry?;
                t.roots.remove(k)?;
                roots += 1;
            }
            debug!(feed = %pk, heads = head_keys.len(), roots, "feed deleted");
            Ok(())
        })
    }

    fn has_feed(&self, pk: &PubKey) -> Result<bool> {
        self.read(|t| Ok(t.feeds.contains_key(pk.as_bytes())?))
    }

    fn feeds_len(&self) -> Result<usize> {
        self.read(|t| Ok(t.feeds.len()))
    }

    fn iterate_feeds(&self, visit: &mut FeedFn<'_>) -> Result<()> {
        let snapshot = self.read(|t| {
            let mut out = Vec::new();
            for entry in t.feeds.iter() {
                let (k, _) = entry?;
                out.push(PubKey::from_slice(&k).map_err(|e| CodecError::InvalidField {
                    field: "feed",
                    reason: e.to_string(),
                })?);
            }
            Ok(out)
        })?;
        visit_all(snapshot, |pk| visit(&pk))
    }

    fn add_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        self.write(|t| {
            t.require_feed(pk)?;
            t.heads.insert(head_key(pk, nonce), EMPTY)?;
            Ok(())
        })
    }

    fn del_head(&self, pk: &PubKey, nonce: u64) -> Result<()> {
        self.write(|t| {
            t.require_feed(pk)?;
            let head = head_key(pk, nonce);
            if t.heads.remove(head)?.is_none() {
                return Err(IdxError::NoSuchHead { feed: *pk, nonce });
            }
            for entry in t.roots.scan_prefix(head) {
                let (k, _) = entry?;
                t.roots.remove(k)?;
            }
            Ok(())
        })
    }

    fn has_head(&self, pk: &PubKey, nonce: u64) -> Result<bool> {
        self.read(|t| {
            t.require_feed(pk)?;
            Ok(t.heads.contains_key(head_key(pk, nonce))?)
        })
    }

    fn iterate_heads(&self, pk: &PubKey, visit: &mut HeadFn<'_>) -> Result<()> {
        let snapshot = self.read(|t| {
            t.require_feed(pk)?;
            t.head_keys(pk)?
                .iter()
                .map(|k| key_tail(k))
                .collect::<Result<Vec<u64>>>()
        })?;
        visit_all(snapshot, visit)
    }

    fn heads_len(&self, pk: &PubKey) -> Result<usize> {
        self.read(|t| {
            t.require_feed(pk)?;
            Ok(t.head_keys(pk)?.len())
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
        self.read(|t| {
            t.require_head(pk, nonce)?;
            Ok(t.roots.contains_key(root_key(pk, nonce, seq))?)
        })
    }

    fn roots_len(&self, pk: &PubKey, nonce: u64) -> Result<usize> {
        self.read(|t| {
            t.require_head(pk, nonce)?;
            Ok(t.roots.scan_prefix(head_key(pk, nonce)).count())
        })
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
        self.write(|t| {
            t.require_head(pk, nonce)?;
            let (stored, reply) = match t.load_root(&key)? {
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
            t.roots.insert(key, stored.encode())?;
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
            return self.read(|t| {
                t.require_head(pk, nonce)?;
                t.load_root(&key)?.ok_or_else(not_found)
            });
        }
        self.write(|t| {
            t.require_head(pk, nonce)?;
            let reply = t.load_root(&key)?.ok_or_else(not_found)?;
            let touched = Root {
                access_time: now_nanos(),
                ..reply.clone()
            };
            t.roots.insert(key, touched.encode())?;
            Ok(reply)
        })
    }

    fn take_root(&self, pk: &PubKey, nonce: u64, seq: u64) -> Result<Root> {
        self.write(|t| {
            t.require_head(pk, nonce)?;
            let root = t
                .roots
                .remove(root_key(pk, nonce, seq))?
                .map(|v| Root::decode(&v))
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
        let mut guard = self.trees.write().expect("lock poisoned");
        let Some(trees) = guard.take() else {
            return Ok(());
        };
        trees.db.insert(META_KEY, [FLAG_SAFE_CLOSED].as_slice())?;
        trees.db.flush()?;
        info!(path = %self.path.display(), "lsm idxdb closed");
        Ok(())
    }
}
