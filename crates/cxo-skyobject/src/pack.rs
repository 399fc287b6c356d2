use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use cxo_codec::{decode_value, encode_value};
use cxo_cxds::Cxds;
use cxo_types::Hash;

use crate::error::SkyResult;
use crate::registry::{Registry, Value};

/// Default fan-out of new Refs trees.
pub const DEFAULT_DEGREE: u32 = 16;

/// Behaviour switches of a [`Pack`] and the Refs loaded through it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PackFlags(u8);

impl PackFlags {
    pub const NONE: Self = Self(0);
    /// Keep an element-hash index in every Refs.
    pub const HASH_TABLE_INDEX: Self = Self(1);
    /// Load entire Refs trees on first use.
    pub const ENTIRE_REFS: Self = Self(1 << 1);
    /// Recompute Refs hashes only when they are read.
    pub const LAZY_UPDATING: Self = Self(1 << 2);
    /// Refuse all Refs mutations.
    pub const VIEW_ONLY: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for PackFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PackFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::HASH_TABLE_INDEX, "HASH_TABLE_INDEX"),
            (Self::ENTIRE_REFS, "ENTIRE_REFS"),
            (Self::LAZY_UPDATING, "LAZY_UPDATING"),
            (Self::VIEW_ONLY, "VIEW_ONLY"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PackFlags({})", set.join(" | "))
    }
}

/// Flags and fan-out a [`Pack`] is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackOptions {
    pub flags: PackFlags,
    pub degree: u32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            flags: PackFlags::NONE,
            degree: DEFAULT_DEGREE,
        }
    }
}

/// Unpacking context: a CXDS, the registry of the root being edited or
/// read, and the options Refs trees are loaded with.
#[derive(Clone)]
pub struct Pack {
    cxds: Arc<dyn Cxds>,
    registry: Arc<Registry>,
    flags: PackFlags,
    degree: u32,
}

impl Pack {
    pub fn new(cxds: Arc<dyn Cxds>, registry: Arc<Registry>, flags: PackFlags, degree: u32) -> Self {
        Self {
            cxds,
            registry,
            flags,
            degree,
        }
    }

    pub fn with_options(cxds: Arc<dyn Cxds>, registry: Arc<Registry>, opts: PackOptions) -> Self {
        Self::new(cxds, registry, opts.flags, opts.degree)
    }

    pub fn cxds(&self) -> &Arc<dyn Cxds> {
        &self.cxds
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn flags(&self) -> PackFlags {
        self.flags
    }

    /// Degree of Refs created through this pack.
    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// Read an encoded value, touching it.
    pub fn get(&self, key: &Hash) -> SkyResult<Vec<u8>> {
        Ok(self.cxds.get(key)?.val)
    }

    /// Store an encoded value under its hash, holding it once more.
    pub fn set(&self, key: &Hash, val: &[u8]) -> SkyResult<()> {
        self.cxds.set(key, val)?;
        Ok(())
    }

    /// Store an encoded value and return its hash.
    pub fn add(&self, val: &[u8]) -> SkyResult<Hash> {
        let key = Hash::sum(val);
        self.set(&key, val)?;
        Ok(key)
    }

    /// Drop one hold on a value. Missing values are ignored.
    pub fn release(&self, key: &Hash) -> SkyResult<()> {
        match self.cxds.incr(key, -1) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Encode and store a typed value.
    pub fn add_value<T: Value>(&self, value: &T) -> SkyResult<Hash> {
        self.add(&encode_value(value)?)
    }

    /// Load and decode a typed value.
    pub fn get_value<T: Value>(&self, key: &Hash) -> SkyResult<T> {
        Ok(decode_value(&self.get(key)?)?)
    }
}

impl fmt::Debug for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pack")
            .field("registry", &self.registry)
            .field("flags", &self.flags)
            .field("degree", &self.degree)
            .finish()
    }
}
