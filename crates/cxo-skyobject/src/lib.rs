//! Typed object graphs on top of CXDS.
//!
//! A root body lists [`Dynamic`] references to typed values. Values are
//! encoded with the typed codec and name other values through [`Ref`],
//! [`Dynamic`] and [`Refs`] fields, which their [`Value::references`]
//! lists so that walkers and fillers can follow them.
//!
//! # Pieces
//!
//! - [`Registry`] -- schemas a root's values are encoded with
//! - [`Pack`] -- CXDS + registry + flags used to read and edit a root
//! - [`Refs`] -- Merkle list of element hashes with bounded fan-out
//! - [`split`] / [`concat`] -- byte streams as Refs of [`Chunk`]s
//! - [`Walker`] -- visits every object a root body references
//!
//! # Design Rules
//!
//! 1. Every stored value is held at least once by whoever stored it.
//! 2. An empty Refs has the zero hash; so does a blank reference.
//! 3. Refs are single-threaded; packs are cheap to clone and share.

pub mod dynamic;
pub mod error;
pub mod pack;
pub mod refs;
pub mod registry;
pub mod root;
pub mod split;
pub mod walk;

pub use dynamic::{Dynamic, Ref};
pub use error::{SkyError, SkyResult};
pub use pack::{Pack, PackFlags, PackOptions, DEFAULT_DEGREE};
pub use refs::{BranchNode, Refs, RefsVisitor, RootNode};
pub use registry::{Reference, Registry, RegistryRef, Schema, SchemaRef, TypedSchema, Value};
pub use root::{Root, RootBody};
pub use split::{concat, split, Chunk, CHUNK_OVERHEAD};
pub use walk::{Visit, WalkFn, Walker};
