//! Deterministic encoding for the CXO object store.
//!
//! Two encoders live here:
//!
//! - [`Encoder`] / [`Decoder`] with the [`Encode`] / [`Decode`] traits write
//!   the fixed, position-dependent layouts of the store's own records
//!   (objects, root records, meta records, Refs nodes).
//! - [`encode_value`] / [`decode_value`] map typed user values to
//!   deterministic byte strings and back.

pub mod codec;
pub mod error;

pub use codec::{decode_value, encode_value, Decode, Decoder, Encode, Encoder};
pub use error::{CodecError, CodecResult};
