use cxo_types::{Hash, PubKey, Sig, HASH_LEN, PUBKEY_LEN, SIG_LEN};

use crate::error::{CodecError, CodecResult};

/// Append-only little-endian writer for fixed-layout records.
///
/// Variable-length fields are prefixed with a `u32` count:
/// ```text
/// bytes  = [4 bytes: len (u32 LE)][len bytes]
/// hashes = [4 bytes: count (u32 LE)][count * 32 bytes]
/// ```
///
/// A count that does not fit in a `u32` is never truncated. The encoder
/// remembers the first such error and [`try_finish`](Self::try_finish)
/// returns it.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
    error: Option<CodecError>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            error: None,
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// `u32` count prefix of a variable-length field.
    pub fn put_len(&mut self, len: usize) -> &mut Self {
        match u32::try_from(len) {
            Ok(n) => self.put_u32(n),
            Err(_) => {
                self.error.get_or_insert(CodecError::InvalidSize(format!(
                    "length {len} exceeds {}",
                    u32::MAX
                )));
                self
            }
        }
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_len(v.len());
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_hash(&mut self, v: &Hash) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    /// Count-prefixed list of hashes.
    pub fn put_hashes<'a, I>(&mut self, hashes: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a Hash>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = hashes.into_iter();
        self.put_len(iter.len());
        for h in iter {
            self.put_hash(h);
        }
        self
    }

    pub fn put_pub_key(&mut self, v: &PubKey) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn put_sig(&mut self, v: &Sig) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The encoded bytes. Only for records whose counts are bounded by
    /// construction; see [`try_finish`](Self::try_finish).
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// The encoded bytes, or the first count that overflowed.
    pub fn try_finish(self) -> CodecResult<Vec<u8>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }
}

/// Cursor over an encoded record. Mirrors [`Encoder`].
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::InvalidSize(format!(
                "need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let data = self.data;
        let out = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> CodecResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> CodecResult<String> {
        String::from_utf8(self.get_bytes()?).map_err(|e| CodecError::InvalidField {
            field: "string",
            reason: e.to_string(),
        })
    }

    pub fn get_hash(&mut self) -> CodecResult<Hash> {
        Ok(Hash::from_bytes(self.take_array::<HASH_LEN>()?))
    }

    pub fn get_hashes(&mut self) -> CodecResult<Vec<Hash>> {
        let count = self.get_u32()? as usize;
        // Bound the allocation by what the input can actually hold.
        if count > self.remaining() / HASH_LEN {
            return Err(CodecError::InvalidSize(format!(
                "hash list of {count} entries exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        (0..count).map(|_| self.get_hash()).collect()
    }

    pub fn get_pub_key(&mut self) -> CodecResult<PubKey> {
        Ok(PubKey::from_bytes(self.take_array::<PUBKEY_LEN>()?))
    }

    pub fn get_sig(&mut self) -> CodecResult<Sig> {
        Ok(Sig::from_bytes(self.take_array::<SIG_LEN>()?))
    }

    /// Fail unless every byte was consumed.
    pub fn finish(self) -> CodecResult<()> {
        if self.remaining() != 0 {
            return Err(CodecError::InvalidSize(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// A record with a deterministic, position-dependent byte layout.
pub trait Encode {
    fn encode_into(&self, enc: &mut Encoder);

    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.finish()
    }

    /// Like [`encode`](Self::encode), failing instead of writing a count
    /// that does not fit its prefix.
    fn try_encode(&self) -> CodecResult<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.try_finish()
    }
}

/// Inverse of [`Encode`].
pub trait Decode: Sized {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self>;

    /// Decode a whole record; trailing bytes are an error.
    fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut dec = Decoder::new(data);
        let value = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(value)
    }
}

/// Encode a typed value to its deterministic byte string.
pub fn encode_value<T: serde::Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decode a typed value previously produced by [`encode_value`].
pub fn decode_value<T: serde::de::DeserializeOwned>(data: &[u8]) -> CodecResult<T> {
    bincode::deserialize(data).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn integers_are_little_endian() {
        let mut enc = Encoder::new();
        enc.put_u32(1).put_i64(-2);
        let bytes = enc.finish();
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..], &(-2i64).to_le_bytes());
    }

    #[test]
    fn bytes_are_length_prefixed() {
        let mut enc = Encoder::new();
        enc.put_bytes(b"abc");
        assert_eq!(enc.finish(), vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_count_is_an_error() {
        let mut enc = Encoder::new();
        enc.put_len(u32::MAX as usize + 1).put_u8(7);
        assert!(matches!(enc.try_finish(), Err(CodecError::InvalidSize(_))));

        let mut enc = Encoder::new();
        enc.put_len(u32::MAX as usize).put_u8(7);
        assert_eq!(enc.try_finish().unwrap(), vec![0xff, 0xff, 0xff, 0xff, 7]);
    }

    #[test]
    fn mixed_fields_decode_in_order() {
        let h = Hash::sum(b"x");
        let mut enc = Encoder::new();
        enc.put_u8(0xff)
            .put_u64(u64::MAX)
            .put_str("name")
            .put_hashes(&[h, Hash::ZERO]);
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_u8().unwrap(), 0xff);
        assert_eq!(dec.get_u64().unwrap(), u64::MAX);
        assert_eq!(dec.get_str().unwrap(), "name");
        assert_eq!(dec.get_hashes().unwrap(), vec![h, Hash::ZERO]);
        dec.finish().unwrap();
    }

    #[test]
    fn truncated_input_is_invalid_size() {
        let mut dec = Decoder::new(&[1, 2]);
        assert!(matches!(dec.get_u32(), Err(CodecError::InvalidSize(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut dec = Decoder::new(&[1, 0, 0, 0, 9]);
        dec.get_u32().unwrap();
        assert!(matches!(dec.finish(), Err(CodecError::InvalidSize(_))));
    }

    #[test]
    fn oversized_hash_count_is_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32(1_000_000);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.get_hashes(), Err(CodecError::InvalidSize(_))));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: u32,
    }

    #[test]
    fn typed_values_are_deterministic() {
        let u = User {
            name: "alice".into(),
            age: 30,
        };
        let a = encode_value(&u).unwrap();
        let b = encode_value(&u).unwrap();
        assert_eq!(a, b);
        assert_eq!(decode_value::<User>(&a).unwrap(), u);
    }

    #[test]
    fn typed_decode_of_garbage_fails() {
        let err = decode_value::<User>(&[0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Serialization(_)));
    }
}
