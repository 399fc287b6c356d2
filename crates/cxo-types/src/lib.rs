//! Foundation types for the CXO object store.
//!
//! Every other CXO crate depends on `cxo-types`.
//!
//! # Key Types
//!
//! - [`Hash`] -- SHA-256 content address of a stored value
//! - [`PubKey`] -- public key identifying a feed
//! - [`Sig`] -- signature of a root hash
//! - [`temporal`] -- nanosecond wall-clock helpers for access/create times

pub mod error;
pub mod hash;
pub mod keys;
pub mod temporal;

pub use error::TypeError;
pub use hash::{Hash, HASH_LEN};
pub use keys::{PubKey, Sig, PUBKEY_LEN, SIG_LEN};
pub use temporal::{now_nanos, ZERO_EPOCH};
