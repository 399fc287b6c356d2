//! IdxDB: the signed-head index of CXO.
//!
//! The index maps `(feed, head nonce, seq)` to a [`Root`] record: the hash
//! of a root body stored in CXDS and the feed owner's signature of it.
//! Feeds contain heads and heads contain roots; deletions cascade down.
//!
//! Three backends implement [`IdxDb`]:
//!
//! - [`InMemoryIdxDb`] for tests and ephemeral nodes
//! - [`FileIdxDb`] backed by a redb file with a safe-close flag
//! - [`LsmIdxDb`] backed by a sled database with the same flag
//!
//! # Example
//!
//! ```
//! use cxo_crypto::generate_keypair;
//! use cxo_idxdb::{IdxDb, InMemoryIdxDb};
//! use cxo_types::Hash;
//!
//! let (pk, sk) = generate_keypair();
//! let idx = InMemoryIdxDb::new();
//! idx.add_feed(&pk).unwrap();
//! idx.add_head(&pk, 0).unwrap();
//!
//! let hash = Hash::sum(b"root body");
//! idx.set_root(&pk, 0, 1, &hash, &sk.sign_hash(&hash)).unwrap();
//! assert!(idx.has_root(&pk, 0, 1).unwrap());
//! ```

pub mod error;
pub mod file;
pub mod lsm;
pub mod memory;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{IdxError, Result};
pub use file::FileIdxDb;
pub use lsm::LsmIdxDb;
pub use memory::InMemoryIdxDb;
pub use traits::{FeedFn, HeadFn, IdxDb, RootFn};
pub use types::Root;
