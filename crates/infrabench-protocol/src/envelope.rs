//! Hotkey-signed request envelope.
//!
//! Each outbound request carries the protocol version, the validator's
//! hotkey, a timestamp, and an ed25519 signature over the SHA-256 of the
//! serialized payload. Miners verify the signature against the hotkey they
//! see in the metagraph; the orchestrator trusts the transport's
//! verification and never inspects signatures on replies.

use crate::messages::{MinerRequest, PROTOCOL_VERSION};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("hotkey is not valid hex: {0}")]
    BadHotkey(String),
    #[error("signature verification failed")]
    BadSignature,
}

/// Signs outbound requests with the validator's hotkey.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    hotkey: String,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        let hotkey = hex::encode(key.verifying_key().to_bytes());
        Self { key, hotkey }
    }

    /// Fresh random identity, for tests and local development.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::new(SigningKey::generate(&mut rng))
    }

    /// Hex-encoded public key, as published in the metagraph.
    pub fn hotkey(&self) -> &str {
        &self.hotkey
    }

    fn sign(&self, payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        hex::encode(self.key.sign(&digest).to_bytes())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("hotkey", &self.hotkey).finish()
    }
}

/// Wire form of a signed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub version: String,
    pub hotkey: String,
    /// Unix seconds at signing time.
    pub timestamp: u64,
    /// Hex ed25519 signature over sha256(payload JSON).
    pub signature: String,
    pub payload: MinerRequest,
}

impl RequestEnvelope {
    pub fn seal(
        signer: &Signer,
        timestamp: u64,
        payload: MinerRequest,
    ) -> Result<Self, EnvelopeError> {
        let bytes = serde_json::to_vec(&payload)?;
        Ok(Self {
            version: PROTOCOL_VERSION.to_string(),
            hotkey: signer.hotkey().to_string(),
            timestamp,
            signature: signer.sign(&bytes),
            payload,
        })
    }

    /// Verify the signature against the embedded hotkey. Used by the miner
    /// side of the transport and by tests; the validator never calls this
    /// on its own requests.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        let key_bytes: [u8; 32] = hex::decode(&self.hotkey)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| EnvelopeError::BadHotkey(self.hotkey.clone()))?;
        let key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| EnvelopeError::BadSignature)?;
        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(EnvelopeError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        let payload = serde_json::to_vec(&self.payload)?;
        let digest = Sha256::digest(&payload);
        key.verify(&digest, &signature).map_err(|_| EnvelopeError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::HandshakeRequest;

    fn handshake() -> MinerRequest {
        MinerRequest::Handshake(HandshakeRequest { round_id: "r-1".to_string(), timestamp: 10 })
    }

    #[test]
    fn test_seal_and_verify() {
        let signer = Signer::generate();
        let env = RequestEnvelope::seal(&signer, 10, handshake()).unwrap();
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.hotkey, signer.hotkey());
        env.verify().unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let signer = Signer::generate();
        let mut env = RequestEnvelope::seal(&signer, 10, handshake()).unwrap();
        env.payload = MinerRequest::Handshake(HandshakeRequest {
            round_id: "r-2".to_string(),
            timestamp: 10,
        });
        assert!(matches!(env.verify(), Err(EnvelopeError::BadSignature)));
    }

    #[test]
    fn test_foreign_hotkey_fails_verification() {
        let signer = Signer::generate();
        let other = Signer::generate();
        let mut env = RequestEnvelope::seal(&signer, 10, handshake()).unwrap();
        env.hotkey = other.hotkey().to_string();
        assert!(env.verify().is_err());
    }
}
