use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use crate::registry::{SchemaRef, Value};

/// A reference to a value of any registered schema.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dynamic {
    pub schema: SchemaRef,
    pub hash: Hash,
}

impl Dynamic {
    pub fn new(schema: SchemaRef, hash: Hash) -> Self {
        Self { schema, hash }
    }

    /// Dynamic reference to a value of type `T` stored under `hash`.
    pub fn of<T: Value>(hash: Hash) -> Self {
        Self::new(T::schema_ref(), hash)
    }

    /// Points nowhere.
    pub fn is_blank(&self) -> bool {
        self.hash.is_zero()
    }

    /// Either fully blank or fully set.
    pub fn is_valid(&self) -> bool {
        self.schema.is_zero() == self.hash.is_zero()
    }
}

/// A reference to a single value whose schema is known from context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub hash: Hash,
}

impl Ref {
    pub fn new(hash: Hash) -> Self {
        Self { hash }
    }

    pub fn is_blank(&self) -> bool {
        self.hash.is_zero()
    }
}
