//! The root record and iteration helpers.

use cxo_codec::{CodecResult, Decode, Decoder, Encode, Encoder};
use cxo_types::{Hash, Sig};

use crate::error::{IdxError, Result};

/// Signed descriptor of one root of a head, keyed by `(feed, nonce, seq)`.
///
/// Persisted layout: `[32: hash][64: sig][8: access_time][8: create_time]`,
/// integers little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    /// Hash of the encoded root body stored in CXDS.
    pub hash: Hash,
    /// Signature of `hash` by the feed's secret key.
    pub sig: Sig,
    /// Last access, UNIX nanoseconds. Zero means "never accessed".
    pub access_time: i64,
    /// Creation time, UNIX nanoseconds.
    pub create_time: i64,
}

impl Root {
    pub const ENCODED_LEN: usize = 32 + 64 + 8 + 8;
}

impl Encode for Root {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_hash(&self.hash)
            .put_sig(&self.sig)
            .put_i64(self.access_time)
            .put_i64(self.create_time);
    }
}

impl Decode for Root {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self {
            hash: dec.get_hash()?,
            sig: dec.get_sig()?,
            access_time: dec.get_i64()?,
            create_time: dec.get_i64()?,
        })
    }
}

/// Deliver snapshot items to a visitor, treating
/// [`IdxError::StopIteration`] as a normal end.
pub(crate) fn visit_all<T>(
    items: impl IntoIterator<Item = T>,
    mut visit: impl FnMut(T) -> Result<()>,
) -> Result<()> {
    for item in items {
        match visit(item) {
            Ok(()) => {}
            Err(IdxError::StopIteration) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
