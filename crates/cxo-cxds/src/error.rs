use cxo_codec::CodecError;
use cxo_types::Hash;

/// Errors from CXDS operations.
#[derive(Debug, thiserror::Error)]
pub enum CxdsError {
    /// The requested key is not stored.
    #[error("object not found: {0}")]
    NotFound(Hash),

    /// Values must not be empty.
    #[error("empty value")]
    EmptyValue,

    /// The key is not the SHA-256 of the value.
    #[error("invalid key {key}: value hashes to {computed}")]
    InvalidKey { key: Hash, computed: Hash },

    /// Sentinel returned by a visitor to end an iteration early.
    /// Iterations swallow it and return `Ok(())`.
    #[error("stop iteration")]
    StopIteration,

    /// The store was closed.
    #[error("store is closed")]
    Closed,

    /// A stored record or the meta record could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
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

impl CxdsError {
    /// Returns `true` for [`CxdsError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for CXDS operations.
pub type CxdsResult<T> = Result<T, CxdsError>;
