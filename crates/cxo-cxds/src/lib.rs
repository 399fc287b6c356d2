//! CXDS: the content-addressed data store of CXO.
//!
//! Every value is stored under the SHA-256 of its bytes together with a
//! reference counter and access/creation timestamps. Objects whose counter
//! drops to zero stay in the store until garbage collection removes them.
//!
//! # Storage Backends
//!
//! All backends implement the [`Cxds`] trait:
//!
//! - [`InMemoryCxds`] -- ordered in-memory map for tests and embedding
//! - [`FileCxds`] -- single-file redb database with persisted statistics
//! - [`LsmCxds`] -- sled log-structured database, same meta protocol
//!
//! # Design Rules
//!
//! 1. A key is always `SHA256(value)`; empty values are rejected.
//! 2. Counter changes are atomic per key and saturate at zero.
//! 3. Statistics are updated only after the backend acknowledges a write.
//! 4. Iteration reads keys in batches and visits them with the store
//!    unlocked, so visitors may mutate the store.
//! 5. A persistent store that was not closed cleanly reports it and recounts.

pub mod error;
pub mod file;
pub mod iterate;
pub mod lsm;
pub mod memory;
pub mod object;
pub mod stat;
pub mod traits;

#[cfg(test)]
mod testing;

pub use error::{CxdsError, CxdsResult};
pub use file::FileCxds;
pub use iterate::{IterGate, DEFAULT_SCAN_COUNT};
pub use lsm::LsmCxds;
pub use memory::InMemoryCxds;
pub use object::{Change, Object};
pub use stat::{MetaInfo, Stat};
pub use traits::{Cxds, IterateDelFn, IterateFn};
