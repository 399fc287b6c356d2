use cxo_codec::CodecError;
use cxo_cxds::CxdsError;
use cxo_idxdb::IdxError;
use cxo_skyobject::SkyError;
use cxo_types::{Hash, PubKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// A filler was closed before it finished.
    #[error("terminated")]
    Terminated,

    /// Requests of a container can be listened to once.
    #[error("requests are already listened to")]
    AlreadyListen,

    #[error("container is closed")]
    Closed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A received root names a feed this container does not follow.
    #[error("no such feed: {0}")]
    NoSuchFeed(PubKey),

    /// A received root whose signature does not verify.
    #[error("invalid signature of root {0}")]
    InvalidSignature(Hash),

    #[error("cxds error: {0}")]
    Cxds(#[from] CxdsError),

    #[error("index error: {0}")]
    Idx(#[from] IdxError),

    #[error("skyobject error: {0}")]
    Sky(#[from] SkyError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Returns `true` if the error means a missing object or root.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cxds(e) => e.is_not_found(),
            Self::Idx(e) => matches!(e, IdxError::NotFound { .. }),
            Self::Sky(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;
