use cxo_types::{Hash, PubKey, Sig};

/// Secret key of a feed (Ed25519).
pub struct SecKey(ed25519_dalek::SigningKey);

impl SecKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    /// Create from a raw 32-byte secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    /// The feed public key belonging to this secret key.
    pub fn pub_key(&self) -> PubKey {
        PubKey::from_bytes(self.0.verifying_key().to_bytes())
    }

    /// Sign a root hash.
    pub fn sign_hash(&self, hash: &Hash) -> Sig {
        use ed25519_dalek::Signer;
        Sig::from_bytes(self.0.sign(hash.as_bytes()).to_bytes())
    }

    /// Raw secret key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecKey(<redacted>)")
    }
}

/// Generate a fresh feed key pair.
pub fn generate_keypair() -> (PubKey, SecKey) {
    let sk = SecKey::generate();
    (sk.pub_key(), sk)
}

/// Verify that `sig` is a signature of `hash` under the feed key `pk`.
pub fn verify_hash(pk: &PubKey, hash: &Hash, sig: &Sig) -> Result<(), SignatureError> {
    use ed25519_dalek::Verifier;
    let key = ed25519_dalek::VerifyingKey::from_bytes(pk.as_bytes())
        .map_err(|_| SignatureError::InvalidKey)?;
    let signature = ed25519_dalek::Signature::from_bytes(sig.as_bytes());
    key.verify(hash.as_bytes(), &signature)
        .map_err(|_| SignatureError::InvalidSignature)
}

/// Check that a public key is a valid curve point.
pub fn verify_pub_key(pk: &PubKey) -> Result<(), SignatureError> {
    ed25519_dalek::VerifyingKey::from_bytes(pk.as_bytes())
        .map(|_| ())
        .map_err(|_| SignatureError::InvalidKey)
}

/// Errors from signing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let (pk, sk) = generate_keypair();
        let hash = Hash::sum(b"root body");
        let sig = sk.sign_hash(&hash);
        assert!(verify_hash(&pk, &hash, &sig).is_ok());
    }

    #[test]
    fn verify_fails_on_wrong_hash() {
        let (pk, sk) = generate_keypair();
        let sig = sk.sign_hash(&Hash::sum(b"correct"));
        assert_eq!(
            verify_hash(&pk, &Hash::sum(b"wrong"), &sig),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let (_, sk1) = generate_keypair();
        let (pk2, _) = generate_keypair();
        let hash = Hash::sum(b"message");
        let sig = sk1.sign_hash(&hash);
        assert!(verify_hash(&pk2, &hash, &sig).is_err());
    }

    #[test]
    fn from_bytes_roundtrip() {
        let sk = SecKey::generate();
        let sk2 = SecKey::from_bytes(*sk.as_bytes());
        assert_eq!(sk.pub_key(), sk2.pub_key());
    }

    #[test]
    fn signatures_are_deterministic() {
        let sk = SecKey::from_bytes([9u8; 32]);
        let hash = Hash::sum(b"same");
        assert_eq!(sk.sign_hash(&hash), sk.sign_hash(&hash));
    }

    #[test]
    fn generated_pub_key_is_valid() {
        let (pk, _) = generate_keypair();
        assert!(verify_pub_key(&pk).is_ok());
    }

    #[test]
    fn debug_redacts_secret_key() {
        let sk = SecKey::generate();
        assert!(format!("{sk:?}").contains("redacted"));
    }
}
