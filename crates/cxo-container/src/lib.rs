//! The CXO container.
//!
//! A [`Container`] owns one CXDS and one index. It keeps the schema
//! library and the registries loaded from storage, builds [`Pack`]s for
//! reading and editing roots, publishes signed roots and imports roots
//! received from peers. A [`Filler`] completes a received root by
//! requesting missing objects through the container's request channel;
//! the [`gc`] module prunes old roots and sweeps unheld objects.
//!
//! ```no_run
//! # async fn demo() -> cxo_container::ContainerResult<()> {
//! use std::sync::Arc;
//! use cxo_container::{Config, Container};
//! use cxo_skyobject::{Chunk, Dynamic, PackFlags};
//!
//! let c = Arc::new(Container::open(Config::in_memory())?);
//! c.register::<Chunk>();
//! let reg = c.library();
//! let reg_ref = c.save_registry(&reg)?;
//! let pack = c.pack(reg, PackFlags::NONE);
//! let chunk = pack.add_value(&Chunk { data: b"hello".to_vec() })?;
//!
//! let sk = cxo_crypto::SecKey::generate();
//! let root = c.save(&sk, 0, vec![Dynamic::of::<Chunk>(chunk)], reg_ref)?;
//! c.fill(root).wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod container;
pub mod error;
pub mod filler;
pub mod gc;

#[cfg(test)]
mod testing;

pub use config::{Config, Engine};
pub use container::{Container, Want};
pub use error::{ContainerError, ContainerResult};
pub use filler::Filler;
pub use gc::{remove_objects, remove_root_objects, run_gc};

pub use cxo_skyobject::Pack;
