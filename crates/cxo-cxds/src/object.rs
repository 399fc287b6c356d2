use cxo_codec::{CodecResult, Decode, Decoder, Encode, Encoder};
use cxo_types::Hash;

use crate::error::{CxdsError, CxdsResult};

/// A stored value with its reference counter and access metadata.
///
/// On-disk layout (little-endian):
/// ```text
/// [4 bytes: len][len bytes: val][8: rc][8: access_time][8: create_time]
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// The encoded value. Its SHA-256 is the key it is stored under.
    pub val: Vec<u8>,
    /// Reference counter. Zero makes the object eligible for GC.
    pub rc: i64,
    /// Last access, UNIX nanoseconds. Zero means "never accessed".
    pub access_time: i64,
    /// Creation time, UNIX nanoseconds.
    pub create_time: i64,
}

impl Object {
    /// Size of the value in bytes, as counted by the volume statistics.
    pub fn vol(&self) -> u64 {
        self.val.len() as u64
    }

    /// Returns `true` if the object is referenced (rc > 0).
    pub fn is_used(&self) -> bool {
        self.rc > 0
    }

    /// Adjust the reference counter by `by`, saturating at zero.
    pub(crate) fn add_rc(&mut self, by: i64) {
        self.rc = self.rc.saturating_add(by).max(0);
    }

    fn footprint(&self) -> (u64, i64) {
        (self.vol(), self.rc)
    }
}

impl Encode for Object {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_bytes(&self.val)
            .put_i64(self.rc)
            .put_i64(self.access_time)
            .put_i64(self.create_time);
    }
}

impl Decode for Object {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self {
            val: dec.get_bytes()?,
            rc: dec.get_i64()?,
            access_time: dec.get_i64()?,
            create_time: dec.get_i64()?,
        })
    }
}

/// Check the arguments of a set before touching the store.
///
/// # Panics
///
/// Panics if `by` is not positive.
pub(crate) fn check_set(key: &Hash, val: &[u8], by: i64) -> CxdsResult<()> {
    assert!(by > 0, "cxds: set with non-positive increment {by}");
    validate(key, val)
}

/// Check that `val` may be stored under `key`.
pub(crate) fn validate(key: &Hash, val: &[u8]) -> CxdsResult<()> {
    if val.is_empty() {
        return Err(CxdsError::EmptyValue);
    }
    let computed = Hash::sum(val);
    if computed != *key {
        return Err(CxdsError::InvalidKey {
            key: *key,
            computed,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Effect of a mutation on the statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    None,
    Created { vol: u64, rc: i64 },
    Updated { old: (u64, i64), new: (u64, i64) },
    Deleted { vol: u64, rc: i64 },
}

/// What a backend must write back for a key.
#[derive(Debug)]
pub(crate) enum Store {
    Keep,
    Put(Object),
    Delete,
}

/// Outcome of a read-modify-write on a single key.
#[derive(Debug)]
pub(crate) struct Mutation<R> {
    pub store: Store,
    pub reply: R,
    pub change: Change,
}

/// Per-key read-modify-write steps shared by every backend.
///
/// Each function receives the record currently stored (if any) and
/// returns what to write back, what to reply, and the statistics change.
/// Backends run them inside their per-key critical section.
pub(crate) mod ops {
    use super::*;

    pub fn touch(key: Hash, now: i64) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<i64>> {
        move |existing| {
            let mut obj = existing.ok_or(CxdsError::NotFound(key))?;
            let prev = obj.access_time;
            obj.access_time = now;
            Ok(Mutation {
                store: Store::Put(obj),
                reply: prev,
                change: Change::None,
            })
        }
    }

    /// Reply carries the new rc and the previous access time.
    pub fn get_incr(
        key: Hash,
        by: i64,
        touch: bool,
        now: i64,
    ) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<Object>> {
        move |existing| {
            let mut obj = existing.ok_or(CxdsError::NotFound(key))?;
            let old = obj.footprint();
            let prev_access = obj.access_time;
            obj.add_rc(by);
            if touch {
                obj.access_time = now;
            }
            let mut reply = obj.clone();
            reply.access_time = prev_access;
            Ok(Mutation {
                change: Change::Updated {
                    old,
                    new: obj.footprint(),
                },
                store: Store::Put(obj),
                reply,
            })
        }
    }

    /// Insert-or-increment. A created record replies with a zero access
    /// time; an existing one with its previous access time.
    pub fn set_incr(
        val: Vec<u8>,
        by: i64,
        touch: bool,
        now: i64,
    ) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<Object>> {
        move |existing| match existing {
            None => {
                let obj = Object {
                    val,
                    rc: by,
                    access_time: if touch { now } else { 0 },
                    create_time: now,
                };
                let mut reply = obj.clone();
                reply.access_time = 0;
                Ok(Mutation {
                    change: Change::Created {
                        vol: obj.vol(),
                        rc: obj.rc,
                    },
                    store: Store::Put(obj),
                    reply,
                })
            }
            Some(mut obj) => {
                let old = obj.footprint();
                let prev_access = obj.access_time;
                obj.val = val;
                obj.add_rc(by);
                if touch {
                    obj.access_time = now;
                }
                let mut reply = obj.clone();
                reply.access_time = prev_access;
                Ok(Mutation {
                    change: Change::Updated {
                        old,
                        new: obj.footprint(),
                    },
                    store: Store::Put(obj),
                    reply,
                })
            }
        }
    }

    /// Replies with the new rc.
    pub fn incr(
        key: Hash,
        by: i64,
        touch: bool,
        now: i64,
    ) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<i64>> {
        move |existing| {
            let mut obj = existing.ok_or(CxdsError::NotFound(key))?;
            let old = obj.footprint();
            obj.add_rc(by);
            if touch {
                obj.access_time = now;
            }
            Ok(Mutation {
                change: Change::Updated {
                    old,
                    new: obj.footprint(),
                },
                reply: obj.rc,
                store: Store::Put(obj),
            })
        }
    }

    pub fn take(key: Hash) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<Object>> {
        move |existing| {
            let obj = existing.ok_or(CxdsError::NotFound(key))?;
            Ok(Mutation {
                store: Store::Delete,
                change: Change::Deleted {
                    vol: obj.vol(),
                    rc: obj.rc,
                },
                reply: obj,
            })
        }
    }

    pub fn set_raw(obj: Object) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<()>> {
        move |existing| {
            let change = match existing {
                None => Change::Created {
                    vol: obj.vol(),
                    rc: obj.rc,
                },
                Some(prev) => Change::Updated {
                    old: prev.footprint(),
                    new: obj.footprint(),
                },
            };
            Ok(Mutation {
                store: Store::Put(obj),
                reply: (),
                change,
            })
        }
    }

    /// Delete the record when `pred` says so; absent records are skipped.
    pub fn delete_if<F>(key: Hash, pred: F) -> impl FnOnce(Option<Object>) -> CxdsResult<Mutation<bool>>
    where
        F: FnOnce(&Hash, &Object) -> CxdsResult<bool>,
    {
        move |existing| {
            let Some(obj) = existing else {
                return Ok(Mutation {
                    store: Store::Keep,
                    reply: false,
                    change: Change::None,
                });
            };
            if pred(&key, &obj)? {
                Ok(Mutation {
                    store: Store::Delete,
                    reply: true,
                    change: Change::Deleted {
                        vol: obj.vol(),
                        rc: obj.rc,
                    },
                })
            } else {
                Ok(Mutation {
                    store: Store::Keep,
                    reply: false,
                    change: Change::None,
                })
            }
        }
    }
}
