use cxo_codec::{CodecError, CodecResult, Decode, Decoder, Encode, Encoder};
use cxo_types::{Hash, PubKey, Sig};

use crate::dynamic::Dynamic;
use crate::registry::{RegistryRef, SchemaRef};

/// The object a root record points to.
///
/// Layout (little-endian):
/// ```text
/// [4: n][n * (32 schema, 32 hash)]  refs
/// [32] reg  [32] pub  [8] nonce  [8] seq  [8] time  [32] prev
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootBody {
    /// Top-level references of the object graph.
    pub refs: Vec<Dynamic>,
    /// Registry the referenced values are encoded with.
    pub reg: RegistryRef,
    /// Feed this root belongs to.
    pub pub_key: PubKey,
    /// Head nonce.
    pub nonce: u64,
    pub seq: u64,
    /// Creation time, UNIX nanoseconds.
    pub time: i64,
    /// Hash of the previous root of the head; zero for the first one.
    pub prev: Hash,
}

impl RootBody {
    /// Hash of the encoded body; this is what the feed owner signs.
    pub fn hash(&self) -> Hash {
        Hash::sum(&self.encode())
    }
}

impl Encode for RootBody {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_len(self.refs.len());
        for d in &self.refs {
            enc.put_hash(&d.schema.0).put_hash(&d.hash);
        }
        enc.put_hash(&self.reg)
            .put_pub_key(&self.pub_key)
            .put_u64(self.nonce)
            .put_u64(self.seq)
            .put_i64(self.time)
            .put_hash(&self.prev);
    }
}

impl Decode for RootBody {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        let count = dec.get_u32()? as usize;
        if count > dec.remaining() / 64 {
            return Err(CodecError::InvalidSize(format!(
                "{count} root refs exceed remaining {} bytes",
                dec.remaining()
            )));
        }
        let mut refs = Vec::with_capacity(count);
        for _ in 0..count {
            let schema = SchemaRef(dec.get_hash()?);
            let hash = dec.get_hash()?;
            refs.push(Dynamic { schema, hash });
        }
        Ok(Self {
            refs,
            reg: dec.get_hash()?,
            pub_key: dec.get_pub_key()?,
            nonce: dec.get_u64()?,
            seq: dec.get_u64()?,
            time: dec.get_i64()?,
            prev: dec.get_hash()?,
        })
    }
}

/// A root body together with its hash and signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub body: RootBody,
    pub hash: Hash,
    pub sig: Sig,
}

impl Root {
    pub fn pub_key(&self) -> &PubKey {
        &self.body.pub_key
    }

    pub fn nonce(&self) -> u64 {
        self.body.nonce
    }

    pub fn seq(&self) -> u64 {
        self.body.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> RootBody {
        RootBody {
            refs: vec![
                Dynamic::new(SchemaRef::of("a"), Hash::sum(b"1")),
                Dynamic::default(),
            ],
            reg: Hash::sum(b"reg"),
            pub_key: PubKey::from_bytes([3u8; 32]),
            nonce: 9,
            seq: 2,
            time: 1_000,
            prev: Hash::sum(b"prev"),
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let b = body();
        let bytes = b.encode();
        assert_eq!(bytes.len(), 4 + 2 * 64 + 32 + 32 + 8 * 3 + 32);
        assert_eq!(RootBody::decode(&bytes).unwrap(), b);
    }

    #[test]
    fn hash_covers_every_field() {
        let a = body();
        let mut b = body();
        b.seq += 1;
        assert_ne!(a.hash(), b.hash());
        let mut c = body();
        c.refs.pop();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn oversized_ref_count_is_rejected() {
        let mut bytes = body().encode();
        bytes[..4].copy_from_slice(&1_000u32.to_le_bytes());
        assert!(RootBody::decode(&bytes).is_err());
    }
}
