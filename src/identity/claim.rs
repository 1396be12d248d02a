//! Ownership claims: signed proof that a party controls a public key
//!
//! The provider never signs the requester's challenge directly. It mixes in
//! a second, independently generated challenge before hashing, so the signed
//! digest always depends on entropy the requester could not predict. That
//! stops a requester from maneuvering the provider into blind-signing an
//! attacker-chosen value such as a transaction id.
//!
//! Verification is split in two: `verify_ownership` checks only the
//! signature (anyone can run it), while digest correctness against the first
//! challenge is the requester's own check, since only the requester knows
//! which challenge it issued.

use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::challenge::ChallengeResponse;
use super::keys::{KeyManager, PublicKey};
use super::IdentityError;

/// Domain-separation tag for ownership digests.
const OWNERSHIP_TAG: &[u8] = b"veilkey-ownership-v1";

/// A signed assertion that `public_key` is controlled by its producer.
///
/// `raw_digest` serializes `hash(first_challenge, second_challenge)`;
/// `signature` is an Ed25519 signature by `public_key` over
/// `hash(raw_digest)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOwnershipClaim {
    pub public_key: PublicKey,
    pub raw_digest: Vec<u8>,
    pub signature: Vec<u8>,
    pub second_challenge: ChallengeResponse,
}

impl SignedOwnershipClaim {
    /// Recompute the expected digest from the first challenge the requester
    /// issued and compare against the digest embedded in the claim.
    pub fn matches_challenge(&self, first_challenge: &ChallengeResponse) -> bool {
        let expected = ownership_digest(first_challenge, &self.second_challenge);
        self.raw_digest.as_slice() == expected
    }
}

/// Tagged SHA-256 over both challenges, in issue order.
pub fn ownership_digest(
    first_challenge: &ChallengeResponse,
    second_challenge: &ChallengeResponse,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(OWNERSHIP_TAG);
    hasher.update(first_challenge.as_bytes());
    hasher.update(second_challenge.as_bytes());
    hasher.finalize().into()
}

/// Produce a signed ownership claim for `key`.
///
/// Generates the provider-side second challenge, computes the combined
/// digest, and signs its hash with the private material behind `key`.
pub fn sign_ownership(
    key_manager: &dyn KeyManager,
    first_challenge: &ChallengeResponse,
    key: &PublicKey,
) -> Result<SignedOwnershipClaim, IdentityError> {
    let second_challenge = ChallengeResponse::generate();
    let raw_digest = ownership_digest(first_challenge, &second_challenge).to_vec();

    let signed_over = Sha256::digest(&raw_digest);
    let signature = key_manager.sign(signed_over.as_slice(), key)?;

    Ok(SignedOwnershipClaim {
        public_key: *key,
        raw_digest,
        signature: signature.to_bytes().to_vec(),
        second_challenge,
    })
}

/// Verify the claim's signature: `claim.public_key` over `hash(raw_digest)`.
///
/// Does not check the digest against any challenge; that is the
/// requester's separate step via [`SignedOwnershipClaim::matches_challenge`].
pub fn verify_ownership(claim: &SignedOwnershipClaim) -> Result<(), IdentityError> {
    let verifying_key = claim
        .public_key
        .verifying_key()
        .map_err(|e| IdentityError::SignatureVerification(e.to_string()))?;

    let sig_bytes: [u8; 64] = claim.signature.as_slice().try_into().map_err(|_| {
        IdentityError::SignatureVerification(format!(
            "signature must be 64 bytes, got {}",
            claim.signature.len()
        ))
    })?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let signed_over = Sha256::digest(&claim.raw_digest);
    verifying_key
        .verify(signed_over.as_slice(), &signature)
        .map_err(|e| IdentityError::SignatureVerification(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::keys::LocalKeyManager;
    use uuid::Uuid;

    fn setup() -> (LocalKeyManager, PublicKey) {
        let manager = LocalKeyManager::new(Uuid::new_v4());
        let key = manager.fresh_key(None).unwrap();
        (manager, key)
    }

    #[test]
    fn test_sign_then_verify() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let claim = sign_ownership(&manager, &first, &key).unwrap();
        verify_ownership(&claim).unwrap();
        assert!(claim.matches_challenge(&first));
    }

    #[test]
    fn test_second_challenge_is_fresh_per_claim() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let a = sign_ownership(&manager, &first, &key).unwrap();
        let b = sign_ownership(&manager, &first, &key).unwrap();

        assert_ne!(a.second_challenge, b.second_challenge);
        assert_ne!(a.raw_digest, b.raw_digest);
    }

    #[test]
    fn test_tampered_digest_fails_verification() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let mut claim = sign_ownership(&manager, &first, &key).unwrap();
        claim.raw_digest[0] ^= 0xFF;

        assert!(matches!(
            verify_ownership(&claim),
            Err(IdentityError::SignatureVerification(_))
        ));
    }

    #[test]
    fn test_tampered_signature_fails_verification() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let mut claim = sign_ownership(&manager, &first, &key).unwrap();
        claim.signature[10] ^= 0x01;

        assert!(verify_ownership(&claim).is_err());
    }

    #[test]
    fn test_substituted_key_fails_verification() {
        let (manager, key) = setup();
        let (other_manager, other_key) = setup();
        let _ = other_manager;
        let first = ChallengeResponse::generate();

        let mut claim = sign_ownership(&manager, &first, &key).unwrap();
        // Swap in a key whose private material never touched the claim
        claim.public_key = other_key;

        assert!(verify_ownership(&claim).is_err());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let mut claim = sign_ownership(&manager, &first, &key).unwrap();
        claim.signature.truncate(10);

        assert!(matches!(
            verify_ownership(&claim),
            Err(IdentityError::SignatureVerification(_))
        ));
    }

    #[test]
    fn test_wrong_first_challenge_mismatches() {
        let (manager, key) = setup();
        let first = ChallengeResponse::generate();

        let claim = sign_ownership(&manager, &first, &key).unwrap();
        // Signature is valid, but the digest belongs to a different run
        verify_ownership(&claim).unwrap();
        assert!(!claim.matches_challenge(&ChallengeResponse::generate()));
    }

    #[test]
    fn test_digest_depends_on_both_challenges() {
        let c1 = ChallengeResponse::generate();
        let c2 = ChallengeResponse::generate();
        let c3 = ChallengeResponse::generate();

        assert_ne!(ownership_digest(&c1, &c2), ownership_digest(&c1, &c3));
        assert_ne!(ownership_digest(&c1, &c2), ownership_digest(&c2, &c1));
    }
}
