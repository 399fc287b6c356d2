//! Fixtures shared by the container tests.

use std::sync::Arc;

use cxo_skyobject::{Chunk, Reference, Value};
use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::container::Container;

/// In-memory container with small Refs nodes.
pub fn container() -> Arc<Container> {
    let config = Config {
        refs_degree: 2,
        max_object_size: 64,
        ..Config::in_memory()
    };
    Arc::new(Container::open(config).unwrap())
}

/// A named list of chunks.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub files: Hash,
}

impl Value for Folder {
    const SCHEMA: &'static str = "test.Folder";

    fn references(&self) -> Vec<Reference> {
        vec![Reference::Refs {
            schema: Chunk::schema_ref(),
            hash: self.files,
        }]
    }
}
