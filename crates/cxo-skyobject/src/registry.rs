use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use cxo_codec::{decode_value, CodecResult, Decode, Decoder, Encode, Encoder};
use cxo_types::Hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dynamic::Dynamic;
use crate::error::{SkyError, SkyResult};

/// Identifier of a schema: the SHA-256 of its name.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaRef(pub Hash);

impl SchemaRef {
    pub fn of(name: &str) -> Self {
        Self(Hash::sum(name.as_bytes()))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Debug for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaRef({})", self.0.short_hex())
    }
}

/// Hash of an encoded [`Registry`] stored in CXDS.
pub type RegistryRef = Hash;

/// A reference held inside an encoded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    /// A single value of `schema`.
    Ref { schema: SchemaRef, hash: Hash },
    /// A Refs tree whose elements are values of `schema`.
    Refs { schema: SchemaRef, hash: Hash },
    /// A value of any registered schema.
    Dynamic(Dynamic),
}

impl Reference {
    /// The hash this reference points to.
    pub fn hash(&self) -> Hash {
        match self {
            Self::Ref { hash, .. } | Self::Refs { hash, .. } => *hash,
            Self::Dynamic(d) => d.hash,
        }
    }

    /// Blank references point nowhere and are skipped by walkers.
    pub fn is_blank(&self) -> bool {
        self.hash().is_zero()
    }
}

/// Knows how to find the references inside encoded values of one type.
pub trait Schema: Send + Sync {
    fn name(&self) -> &str;

    fn references(&self, val: &[u8]) -> SkyResult<Vec<Reference>>;
}

/// A typed value that can be stored in CXDS.
///
/// Values are encoded with the typed codec (bincode). Types that point to
/// other values list them in [`Value::references`] so that walkers and
/// fillers can follow them.
pub trait Value: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Globally unique schema name.
    const SCHEMA: &'static str;

    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    fn schema_ref() -> SchemaRef {
        SchemaRef::of(Self::SCHEMA)
    }
}

/// [`Schema`] of a Rust type implementing [`Value`].
pub struct TypedSchema<T>(PhantomData<fn() -> T>);

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Value> Schema for TypedSchema<T> {
    fn name(&self) -> &str {
        T::SCHEMA
    }

    fn references(&self, val: &[u8]) -> SkyResult<Vec<Reference>> {
        let value: T = decode_value(val)?;
        Ok(value.references())
    }
}

/// The set of schemas a root's values are encoded with.
///
/// The persisted form is the sorted list of schema names. Loading it maps
/// each name back onto a schema from a local library.
#[derive(Clone, Default)]
pub struct Registry {
    schemas: BTreeMap<SchemaRef, Arc<dyn Schema>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed value. Registering twice is a no-op.
    pub fn register<T: Value>(&mut self) -> SchemaRef {
        self.register_schema(Arc::new(TypedSchema::<T>::default()))
    }

    pub fn register_schema(&mut self, schema: Arc<dyn Schema>) -> SchemaRef {
        let sr = SchemaRef::of(schema.name());
        self.schemas.entry(sr).or_insert(schema);
        sr
    }

    pub fn schema(&self, sr: &SchemaRef) -> SkyResult<&Arc<dyn Schema>> {
        self.schemas
            .get(sr)
            .ok_or(SkyError::UnregisteredSchema(*sr))
    }

    pub fn contains(&self, sr: &SchemaRef) -> bool {
        self.schemas.contains_key(sr)
    }

    /// Schema names in ascending order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.values().map(|s| s.name()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Hash of the persisted form.
    pub fn reference(&self) -> RegistryRef {
        Hash::sum(&self.encode())
    }

    /// Rebuild a registry from its persisted form, taking schemas from
    /// `library`.
    pub fn load(val: &[u8], library: &Registry) -> SkyResult<Self> {
        let names = RegistryNames::decode(val)?;
        let mut reg = Registry::new();
        for name in names.0 {
            let schema = library
                .schemas
                .get(&SchemaRef::of(&name))
                .ok_or(SkyError::UnknownSchema(name))?;
            reg.register_schema(Arc::clone(schema));
        }
        Ok(reg)
    }
}

impl Encode for Registry {
    fn encode_into(&self, enc: &mut Encoder) {
        RegistryNames(self.names().into_iter().map(String::from).collect()).encode_into(enc);
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("schemas", &self.names())
            .finish()
    }
}

struct RegistryNames(Vec<String>);

impl Encode for RegistryNames {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_len(self.0.len());
        for name in &self.0 {
            enc.put_str(name);
        }
    }
}

impl Decode for RegistryNames {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        let count = dec.get_u32()? as usize;
        let mut names = Vec::with_capacity(count.min(dec.remaining() / 4));
        for _ in 0..count {
            names.push(dec.get_str()?);
        }
        Ok(Self(names))
    }
}
