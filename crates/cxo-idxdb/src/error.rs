//! Error types for index operations.

use cxo_codec::CodecError;
use cxo_types::PubKey;
use thiserror::Error;

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
pub enum IdxError {
    /// The feed is not in the index.
    #[error("no such feed: {0}")]
    NoSuchFeed(PubKey),

    /// The head is not in the feed.
    #[error("no such head: {feed}/{nonce}")]
    NoSuchHead { feed: PubKey, nonce: u64 },

    /// No root with this seq in the head.
    #[error("root not found: {feed}/{nonce}/{seq}")]
    NotFound { feed: PubKey, nonce: u64, seq: u64 },

    /// The root signature does not verify under the feed key.
    #[error("invalid signature of root {feed}/{nonce}/{seq}")]
    InvalidSignature { feed: PubKey, nonce: u64, seq: u64 },

    /// Sentinel returned by a visitor to end an iteration early.
    #[error("stop iteration")]
    StopIteration,

    /// The index was closed.
    #[error("index is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("lsm error: {0}")]
    Lsm(#[from] sled::Error),
}

impl IdxError {
    /// Returns `true` for any of the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchFeed(_) | Self::NoSuchHead { .. } | Self::NotFound { .. }
        )
    }
}

/// Convenience type alias for index operations.
pub type Result<T> = std::result::Result<T, IdxError>;
