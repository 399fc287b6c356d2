use cxo_codec::CodecError;
use cxo_cxds::CxdsError;
use cxo_types::Hash;

use crate::registry::SchemaRef;

/// Errors from packing, unpacking and Refs operations.
#[derive(Debug, thiserror::Error)]
pub enum SkyError {
    /// Element index outside `[0, len)`.
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Slice bounds that do not satisfy `start <= end <= len`.
    #[error("invalid slice [{start}, {end}) of len {len}")]
    InvalidSliceIndex { start: usize, end: usize, len: usize },

    /// The element at this index has the zero hash.
    #[error("refs element {0} is nil")]
    RefsElementIsNil(usize),

    /// A Refs node is malformed.
    #[error("invalid refs: {0}")]
    InvalidRefs(String),

    /// Structural change attempted while the Refs is being iterated.
    #[error("refs is being iterated")]
    RefsIterating,

    /// Mutation of a Refs opened in view-only mode.
    #[error("view-only tree")]
    ViewOnlyTree,

    /// The hash is not an element of the Refs.
    #[error("hash not found: {0}")]
    NotFound(Hash),

    /// Sentinel returned by a visitor to end an iteration early.
    #[error("stop iteration")]
    StopIteration,

    /// A registry names a schema the local library does not provide.
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// A value refers to a schema that is not in the registry.
    #[error("schema not registered: {0:?}")]
    UnregisteredSchema(SchemaRef),

    /// Split needs room for at least one byte of payload per chunk.
    #[error("max object size {0} leaves no room for chunk data")]
    InvalidChunkSize(usize),

    #[error("cxds error: {0}")]
    Cxds(#[from] CxdsError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SkyError {
    /// Returns `true` if the error means a missing object or element.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Cxds(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result alias for skyobject operations.
pub type SkyResult<T> = Result<T, SkyError>;
