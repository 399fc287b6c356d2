//! Cryptographic primitives for the CXO object store.
//!
//! Feeds are identified by Ed25519 public keys; every root published on a
//! feed carries a signature of its hash made with the feed's secret key.
//!
//! All crypto operations wrap established libraries -- no custom cryptography.

pub mod signer;

pub use signer::{generate_keypair, verify_hash, verify_pub_key, SecKey, SignatureError};
