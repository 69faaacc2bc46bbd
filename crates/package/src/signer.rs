use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::PackageError;

/// Signs and verifies manifest digests.
pub trait SignatureOracle: Send + Sync {
    fn sign(&self, buffer: &[u8]) -> Result<Vec<u8>, PackageError>;

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 oracle. Verification-only when built from a public key.
#[derive(Debug, Clone)]
pub struct Ed25519Oracle {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
}

impl Ed25519Oracle {
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(secret);
        let verifying = signing.verifying_key();
        Self {
            signing: Some(signing),
            verifying,
        }
    }

    pub fn verifier(public: &[u8; 32]) -> Result<Self, PackageError> {
        let verifying = VerifyingKey::from_bytes(public)
            .map_err(|e| PackageError::Signature(format!("bad public key: {e}")))?;
        Ok(Self {
            signing: None,
            verifying,
        })
    }

    /// Parses a hex-encoded 32-byte public key.
    pub fn verifier_from_hex(public: &str) -> Result<Self, PackageError> {
        let bytes = hex::decode(public.trim())
            .map_err(|e| PackageError::Signature(format!("bad public key hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PackageError::Signature("public key must be 32 bytes".into()))?;
        Self::verifier(&key)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }
}

impl SignatureOracle for Ed25519Oracle {
    fn sign(&self, buffer: &[u8]) -> Result<Vec<u8>, PackageError> {
        let key = self
            .signing
            .as_ref()
            .ok_or_else(|| PackageError::Signature("no signing key loaded".into()))?;
        Ok(key.sign(buffer).to_bytes().to_vec())
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying.verify(digest, &sig).is_ok(),
            Err(_) => false,
        }
    }
}
