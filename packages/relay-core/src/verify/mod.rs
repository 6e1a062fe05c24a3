use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Relayer identity used to sign payloads and transactions.
#[cfg_attr(test, automock)]
pub trait PayloadSigner: Send + Sync {
    /// Hex-encoded public key, the relayer's address on every destination.
    fn address(&self) -> String;

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()>;
}

/// Ed25519 signer over the blake2b-512 digest of a payload. Signatures are
/// deterministic, so re-signing the same payload yields the same bytes.
pub struct RelaySigner {
    signing_key: SigningKey,
}

impl RelaySigner {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn from_bytes(secret_key: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = secret_key
            .try_into()
            .map_err(|_| Error::Config(format!("Invalid secret key length: {}", secret_key.len())))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn from_hex(secret_key: &str) -> Result<Self> {
        let bytes = hex::decode(secret_key.trim_start_matches("0x"))
            .map_err(|e| Error::Config(format!("Invalid secret key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn digest(payload: &[u8]) -> Vec<u8> {
        let mut hasher = Blake2b512::new();
        hasher.update(payload);
        hasher.finalize().to_vec()
    }
}

impl PayloadSigner for RelaySigner {
    fn address(&self) -> String {
        format!("0x{}", hex::encode(self.public_key()))
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(Error::Validation("Refusing to sign an empty payload".to_string()));
        }
        let signature = self.signing_key.sign(&Self::digest(payload));
        debug!(payload_len = payload.len(), "payload signed");
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| Error::Validation(format!("Invalid signature format: {}", e)))?;
        self.signing_key
            .verifying_key()
            .verify(&Self::digest(payload), &signature)
            .map_err(|e| {
                warn!(error = %e, "signature verification failed");
                Error::Validation("Invalid message signature".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = RelaySigner::generate();
        let signature = signer.sign(b"loan disbursement").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signer.verify(b"loan disbursement", &signature).is_ok());
    }

    #[test]
    fn test_signatures_are_deterministic() {
        let signer = RelaySigner::from_bytes(&[1u8; 32]).unwrap();
        assert_eq!(signer.sign(b"payload").unwrap(), signer.sign(b"payload").unwrap());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let signer1 = RelaySigner::generate();
        let signer2 = RelaySigner::generate();
        let signature = signer1.sign(b"payload").unwrap();
        assert!(matches!(signer2.verify(b"payload", &signature), Err(Error::Validation(_))));
        assert!(matches!(signer1.verify(b"payload", &[0u8; 3]), Err(Error::Validation(_))));
    }

    #[test]
    fn test_from_hex() {
        let signer = RelaySigner::from_hex(&format!("0x{}", "01".repeat(32))).unwrap();
        assert_eq!(signer.address(), RelaySigner::from_bytes(&[1u8; 32]).unwrap().address());
        assert!(RelaySigner::from_hex("zz").is_err());
        assert!(RelaySigner::from_hex("0101").is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let signer = RelaySigner::generate();
        assert!(signer.sign(&[]).is_err());
    }
}
