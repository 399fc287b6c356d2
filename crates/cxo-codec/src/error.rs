/// Errors from encoding or decoding records.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The encoded record is shorter or longer than its layout requires.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// A field holds a value the layout does not allow.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Typed value serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
