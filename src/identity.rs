//! The local node's keypair and the id derived from it.
//!
//! An [Identity] is constructed by the caller and handed to the engine at
//! construction; the engine never generates or persists key material on
//! its own.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::common::Id;

#[derive(Clone)]
/// The local node's ed25519 keypair and the id derived from its public key.
pub struct Identity {
    signing_key: SigningKey,
    id: Id,
}

impl Identity {
    /// Wrap an existing signing key. The node id is the SHA-1 digest of the
    /// verifying key, so peers can check that a sender's advertised id
    /// matches its advertised key.
    pub fn from_signing_key(signing_key: SigningKey) -> Identity {
        let id = Id::hash_of(signing_key.verifying_key().as_bytes());

        Identity { signing_key, id }
    }

    /// A throwaway identity from a random key. Meant for tests and demos;
    /// a real node should load its keypair from wherever the application
    /// keeps identity material.
    pub fn random() -> Identity {
        Identity::from_signing_key(SigningKey::from_bytes(&rand::random()))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    // === Public Methods ===

    /// Sign a payload with this identity's key.
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing_key.sign(payload).to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the signing key.
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

/// Verify a signature over `payload` against a node's advertised public key.
///
/// Returns false for malformed keys or signatures as well as for honest
/// verification failures; the caller drops the message either way.
pub fn verify(public_key: &[u8; 32], payload: &[u8], signature: &[u8; 64]) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key
            .verify(payload, &Signature::from_bytes(signature))
            .is_ok(),
        Err(_) => false,
    }
}
