//! Cryptographic identity primitives for confidential keys
//!
//! This module provides the cryptographic foundation for the provisioning
//! and synchronization protocols:
//! - `ChallengeResponse`: single-use anti-replay nonces
//! - `PublicKey` / `KeyManager` / `LocalKeyManager`: Ed25519 key material
//! - `SignedOwnershipClaim`: signed proof that a key belongs to a party

pub mod challenge;
pub mod claim;
pub mod keys;

pub use challenge::ChallengeResponse;
pub use claim::{sign_ownership, verify_ownership, SignedOwnershipClaim};
pub use keys::{KeyManager, LocalKeyManager, PublicKey};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("No private key material for {0}")]
    UnknownKey(PublicKey),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
