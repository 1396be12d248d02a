//! Key provisioning protocol
//!
//! Two-role challenge-response exchange that issues a confidential public
//! key and proves its ownership:
//!
//! **Requester:** generate a challenge → send a `KeyOwnershipRequest` →
//!   await the signed claim → verify signature → verify digest against the
//!   issued challenge → register the key to the counterparty.
//!
//! **Provider:** receive the request → resolve or generate the key →
//!   sign an ownership claim (mixing in a second challenge) → respond;
//!   for known keys, also record the key against its own identity.
//!
//! Exactly one request and one response travel over the session per run.
//! Any failure aborts the run for both ends; a retry is a fresh run with a
//! fresh challenge.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::identity::{
    sign_ownership, verify_ownership, ChallengeResponse, IdentityError, KeyManager, PublicKey,
    SignedOwnershipClaim,
};
use crate::registry::{KeyRegistry, RegistryError};
use crate::session::{Session, SessionError};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// The request half of the exchange. Exactly one variant per run; the
/// challenge is always present and unique to the run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum KeyOwnershipRequest {
    /// Provider must generate a brand-new key.
    FreshKey { challenge: ChallengeResponse },
    /// Provider must prove ownership of an already-existing key.
    KnownKey {
        challenge: ChallengeResponse,
        public_key: PublicKey,
    },
    /// Provider must generate a new key under an external scope id.
    ScopedKey {
        challenge: ChallengeResponse,
        scope_id: Uuid,
    },
}

/// Messages exchanged over a session during provisioning.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum ProvisionMessage {
    Request(KeyOwnershipRequest),
    Claim(SignedOwnershipClaim),
    /// Either side can abort before its counterpart stops listening.
    Rejected { reason: String },
}

// ---------------------------------------------------------------------------
// States & errors
// ---------------------------------------------------------------------------

/// Observable state of a requester run.
#[derive(Clone, Debug, PartialEq)]
pub enum RequesterState {
    Start,
    AwaitingClaim,
    Verifying,
    VerifyingChallenge,
    Done,
    Failed { reason: String },
}

/// Observable state of a provider run.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderState {
    AwaitingRequest,
    Resolving,
    Signing,
    Responded,
    Failed { reason: String },
}

/// Errors that can occur during a provisioning run.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Challenge mismatch: claim digest does not match the issued challenge")]
    ChallengeMismatch,

    #[error("Claim covers key {got}, but key {expected} was requested")]
    KeyMismatch { expected: PublicKey, got: PublicKey },

    #[error("Key conflict: {0}")]
    KeyConflict(RegistryError),

    #[error("Registry error: {0}")]
    Registry(RegistryError),

    #[error("Key management error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transport error: {0}")]
    Transport(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Rejected by peer: {0}")]
    Rejected(String),
}

fn registry_error(e: RegistryError) -> ProvisionError {
    match e {
        conflict @ RegistryError::Conflict { .. } => ProvisionError::KeyConflict(conflict),
        other => ProvisionError::Registry(other),
    }
}

/// Caller intent, mapped onto the wire request variants.
#[derive(Clone, Debug)]
pub enum KeyRequest {
    /// Ask the provider for a brand-new key.
    Fresh,
    /// Ask the provider to prove ownership of an existing key.
    Known(PublicKey),
    /// Ask the provider for a new key under a scope id.
    Scoped(Uuid),
}

/// The confidential identity handle a successful run returns: a key the
/// requester can now resolve to the provider, invisible to third parties.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfidentialKey {
    pub public_key: PublicKey,
    pub party: Uuid,
    pub scope_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, ProvisionError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProvisionError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, ProvisionError> {
    ciborium::from_reader(data).map_err(|e| ProvisionError::Serialization(e.to_string()))
}

async fn send_msg(session: &dyn Session, msg: &ProvisionMessage) -> Result<(), ProvisionError> {
    let bytes = cbor_serialize(msg)?;
    session.send(&bytes).await.map_err(ProvisionError::Transport)
}

async fn recv_msg(session: &dyn Session) -> Result<ProvisionMessage, ProvisionError> {
    let bytes = session.recv().await.map_err(ProvisionError::Transport)?;
    cbor_deserialize(&bytes)
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// Requester side of the provisioning protocol. One run at a time.
pub struct ProvisionRequester {
    registry: Arc<dyn KeyRegistry>,
    state: RwLock<RequesterState>,
}

impl ProvisionRequester {
    pub fn new(registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(RequesterState::Start),
        }
    }

    /// Current observable state.
    pub async fn state(&self) -> RequesterState {
        self.state.read().await.clone()
    }

    /// Drive one full requester run over `session`.
    ///
    /// On success the returned key resolves to the counterparty in the
    /// local registry.
    pub async fn request_key(
        &self,
        session: &dyn Session,
        intent: KeyRequest,
    ) -> Result<ConfidentialKey, ProvisionError> {
        *self.state.write().await = RequesterState::Start;
        match self.run(session, intent).await {
            Ok(confidential) => {
                *self.state.write().await = RequesterState::Done;
                Ok(confidential)
            }
            Err(e) => {
                log::warn!(
                    "Provisioning request to {} failed: {}",
                    session.counterparty(),
                    e
                );
                *self.state.write().await = RequesterState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        session: &dyn Session,
        intent: KeyRequest,
    ) -> Result<ConfidentialKey, ProvisionError> {
        let first_challenge = ChallengeResponse::generate();

        let (request, expected_key, scope_id) = match &intent {
            KeyRequest::Fresh => (
                KeyOwnershipRequest::FreshKey {
                    challenge: first_challenge.clone(),
                },
                None,
                None,
            ),
            KeyRequest::Known(key) => (
                KeyOwnershipRequest::KnownKey {
                    challenge: first_challenge.clone(),
                    public_key: *key,
                },
                Some(*key),
                None,
            ),
            KeyRequest::Scoped(scope) => (
                KeyOwnershipRequest::ScopedKey {
                    challenge: first_challenge.clone(),
                    scope_id: *scope,
                },
                None,
                Some(*scope),
            ),
        };

        *self.state.write().await = RequesterState::AwaitingClaim;
        send_msg(session, &ProvisionMessage::Request(request)).await?;

        let claim = match recv_msg(session).await? {
            ProvisionMessage::Claim(claim) => claim,
            ProvisionMessage::Rejected { reason } => return Err(ProvisionError::Rejected(reason)),
            other => {
                return Err(ProvisionError::UnexpectedMessage {
                    expected: "Claim",
                    got: msg_name(&other),
                })
            }
        };

        *self.state.write().await = RequesterState::Verifying;
        verify_ownership(&claim)
            .map_err(|e| ProvisionError::SignatureVerification(e.to_string()))?;

        *self.state.write().await = RequesterState::VerifyingChallenge;
        if !claim.matches_challenge(&first_challenge) {
            return Err(ProvisionError::ChallengeMismatch);
        }
        if let Some(expected) = expected_key {
            if claim.public_key != expected {
                return Err(ProvisionError::KeyMismatch {
                    expected,
                    got: claim.public_key,
                });
            }
        }

        let counterparty = session.counterparty();
        self.registry
            .register(claim.public_key, counterparty, scope_id)
            .map_err(registry_error)?;

        log::debug!(
            "Provisioned confidential key {} for party {}",
            claim.public_key,
            counterparty
        );

        Ok(ConfidentialKey {
            public_key: claim.public_key,
            party: counterparty,
            scope_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Provider side of the provisioning protocol. One run at a time.
pub struct ProvisionProvider {
    key_manager: Arc<dyn KeyManager>,
    registry: Arc<dyn KeyRegistry>,
    party_id: Uuid,
    state: RwLock<ProviderState>,
}

impl ProvisionProvider {
    pub fn new(
        key_manager: Arc<dyn KeyManager>,
        registry: Arc<dyn KeyRegistry>,
        party_id: Uuid,
    ) -> Self {
        Self {
            key_manager,
            registry,
            party_id,
            state: RwLock::new(ProviderState::AwaitingRequest),
        }
    }

    /// Current observable state.
    pub async fn state(&self) -> ProviderState {
        self.state.read().await.clone()
    }

    /// Service one provisioning request over `session`. Returns the key the
    /// claim was issued for.
    pub async fn provide_key(&self, session: &dyn Session) -> Result<PublicKey, ProvisionError> {
        *self.state.write().await = ProviderState::AwaitingRequest;
        match self.run(session).await {
            Ok(key) => {
                *self.state.write().await = ProviderState::Responded;
                Ok(key)
            }
            Err(e) => {
                log::warn!(
                    "Provisioning for {} failed: {}",
                    session.counterparty(),
                    e
                );
                *self.state.write().await = ProviderState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    async fn run(&self, session: &dyn Session) -> Result<PublicKey, ProvisionError> {
        let request = match recv_msg(session).await? {
            ProvisionMessage::Request(request) => request,
            ProvisionMessage::Rejected { reason } => return Err(ProvisionError::Rejected(reason)),
            other => {
                return Err(ProvisionError::UnexpectedMessage {
                    expected: "Request",
                    got: msg_name(&other),
                })
            }
        };

        *self.state.write().await = ProviderState::Resolving;
        match request {
            KeyOwnershipRequest::FreshKey { challenge } => {
                self.issue_fresh(session, &challenge, None).await
            }
            KeyOwnershipRequest::ScopedKey {
                challenge,
                scope_id,
            } => self.issue_fresh(session, &challenge, Some(scope_id)).await,
            KeyOwnershipRequest::KnownKey {
                challenge,
                public_key,
            } => self.prove_known(session, &challenge, public_key).await,
        }
    }

    /// Fresh and scoped paths: generation itself associates the key with
    /// this party, so the local record is written as part of issuance,
    /// before the claim goes out.
    async fn issue_fresh(
        &self,
        session: &dyn Session,
        challenge: &ChallengeResponse,
        scope_id: Option<Uuid>,
    ) -> Result<PublicKey, ProvisionError> {
        let key = match self.key_manager.fresh_key(scope_id) {
            Ok(key) => key,
            Err(e) => {
                self.reject(session, "key generation failed").await;
                return Err(e.into());
            }
        };
        // A freshly generated key cannot conflict
        self.registry
            .register(key, self.party_id, scope_id)
            .map_err(registry_error)?;

        self.sign_and_send(session, challenge, &key).await?;
        Ok(key)
    }

    /// Known-key path: the claim goes out first, then the local record is
    /// written. A conflict at that point is reported locally only; the
    /// claim is already on the wire and is not retracted.
    async fn prove_known(
        &self,
        session: &dyn Session,
        challenge: &ChallengeResponse,
        public_key: PublicKey,
    ) -> Result<PublicKey, ProvisionError> {
        if !self.key_manager.contains(&public_key) {
            self.reject(session, "unknown key").await;
            return Err(IdentityError::UnknownKey(public_key).into());
        }

        self.sign_and_send(session, challenge, &public_key).await?;

        self.registry
            .register(public_key, self.party_id, None)
            .map_err(registry_error)?;
        Ok(public_key)
    }

    async fn sign_and_send(
        &self,
        session: &dyn Session,
        challenge: &ChallengeResponse,
        key: &PublicKey,
    ) -> Result<(), ProvisionError> {
        *self.state.write().await = ProviderState::Signing;
        let claim = match sign_ownership(self.key_manager.as_ref(), challenge, key) {
            Ok(claim) => claim,
            Err(e) => {
                self.reject(session, "signing failed").await;
                return Err(e.into());
            }
        };
        send_msg(session, &ProvisionMessage::Claim(claim)).await
    }

    /// Best-effort abort notification to the peer.
    async fn reject(&self, session: &dyn Session, reason: &str) {
        let _ = send_msg(
            session,
            &ProvisionMessage::Rejected {
                reason: reason.to_string(),
            },
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Human-readable name for a `ProvisionMessage` variant (for error messages).
fn msg_name(msg: &ProvisionMessage) -> &'static str {
    match msg {
        ProvisionMessage::Request(_) => "Request",
        ProvisionMessage::Claim(_) => "Claim",
        ProvisionMessage::Rejected { .. } => "Rejected",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalKeyManager;
    use crate::registry::InMemoryKeyRegistry;
    use crate::session::SimSession;
    use std::time::Duration;

    struct Party {
        id: Uuid,
        key_manager: Arc<LocalKeyManager>,
        registry: Arc<InMemoryKeyRegistry>,
    }

    fn make_party() -> Party {
        let id = Uuid::new_v4();
        Party {
            id,
            key_manager: Arc::new(LocalKeyManager::new(id)),
            registry: Arc::new(InMemoryKeyRegistry::new()),
        }
    }

    fn requester_for(party: &Party) -> ProvisionRequester {
        ProvisionRequester::new(party.registry.clone())
    }

    fn provider_for(party: &Party) -> ProvisionProvider {
        ProvisionProvider::new(party.key_manager.clone(), party.registry.clone(), party.id)
    }

    #[tokio::test]
    async fn test_fresh_key_happy_path() {
        let alice = make_party();
        let bob = make_party();
        let (session_a, session_b) = SimSession::pair(alice.id, bob.id);

        let requester = requester_for(&alice);
        let provider = provider_for(&bob);
        let bob_id = bob.id;

        let provider_handle = tokio::spawn(async move {
            let key = provider.provide_key(&session_b).await.unwrap();
            assert_eq!(provider.state().await, ProviderState::Responded);
            key
        });

        let confidential = requester
            .request_key(&session_a, KeyRequest::Fresh)
            .await
            .unwrap();
        assert_eq!(requester.state().await, RequesterState::Done);

        let provider_key = provider_handle.await.unwrap();
        assert_eq!(confidential.public_key, provider_key);
        assert_eq!(confidential.party, bob_id);
        assert_eq!(confidential.scope_id, None);

        // Requester resolves the key to the provider; the provider resolves
        // it to itself
        assert_eq!(alice.registry.resolve(&provider_key), Some(bob_id));
        assert_eq!(bob.registry.resolve(&provider_key), Some(bob_id));
    }

    #[tokio::test]
    async fn test_scoped_key_records_scope() {
        let alice = make_party();
        let bob = make_party();
        let scope = Uuid::new_v4();
        let (session_a, session_b) = SimSession::pair(alice.id, bob.id);

        let requester = requester_for(&alice);
        let provider = provider_for(&bob);

        let provider_handle =
            tokio::spawn(async move { provider.provide_key(&session_b).await.unwrap() });

        let confidential = requester
            .request_key(&session_a, KeyRequest::Scoped(scope))
            .await
            .unwrap();
        let key = provider_handle.await.unwrap();

        assert_eq!(confidential.scope_id, Some(scope));
        assert_eq!(
            alice.registry.record(&key).unwrap().scope_id,
            Some(scope)
        );
        assert_eq!(bob.key_manager.scope_of(&key), Some(scope));
        assert_eq!(bob.registry.record(&key).unwrap().scope_id, Some(scope));
    }

    #[tokio::test]
    async fn test_known_key_happy_path() {
        let alice = make_party();
        let bob = make_party();
        let known = bob.key_manager.fresh_key(None).unwrap();
        let (session_a, session_b) = SimSession::pair(alice.id, bob.id);

        let requester = requester_for(&alice);
        let provider = provider_for(&bob);

        let provider_handle =
            tokio::spawn(async move { provider.provide_key(&session_b).await.unwrap() });

        let confidential = requester
            .request_key(&session_a, KeyRequest::Known(known))
            .await
            .unwrap();
        provider_handle.await.unwrap();

        assert_eq!(confidential.public_key, known);
        assert_eq!(alice.registry.resolve(&known), Some(bob.id));
        assert_eq!(bob.registry.resolve(&known), Some(bob.id));
    }

    #[tokio::test]
    async fn test_known_key_conflict_is_local_to_provider() {
        let alice = make_party();
        let bob = make_party();
        let carol_id = Uuid::new_v4();

        // Bob holds the key but his registry already maps it to Carol
        let known = bob.key_manager.fresh_key(None).unwrap();
        bob.registry.register(known, carol_id, None).unwrap();

        let (session_a, session_b) = SimSession::pair(alice.id, bob.id);
        let requester = requester_for(&alice);
        let provider = provider_for(&bob);

        let provider_handle = tokio::spawn(async move {
            let result = provider.provide_key(&session_b).await;
            assert!(matches!(result, Err(ProvisionError::KeyConflict(_))));
            assert!(matches!(
                provider.state().await,
                ProviderState::Failed { .. }
            ));
        });

        // The claim went out before the conflict, so the requester completes
        let confidential = requester
            .request_key(&session_a, KeyRequest::Known(known))
            .await
            .unwrap();
        assert_eq!(confidential.public_key, known);

        provider_handle.await.unwrap();
        // Bob's registry still maps the key to Carol
        assert_eq!(bob.registry.resolve(&known), Some(carol_id));
    }

    #[tokio::test]
    async fn test_known_key_unknown_to_provider_is_rejected() {
        let alice = make_party();
        let bob = make_party();
        // A key Bob has no private material for
        let foreign = alice.key_manager.fresh_key(None).unwrap();

        let (session_a, session_b) = SimSession::pair(alice.id, bob.id);
        let requester = requester_for(&alice);
        let provider = provider_for(&bob);

        let provider_handle = tokio::spawn(async move {
            let result = provider.provide_key(&session_b).await;
            assert!(matches!(
                result,
                Err(ProvisionError::Identity(IdentityError::UnknownKey(_)))
            ));
        });

        let result = requester
            .request_key(&session_a, KeyRequest::Known(foreign))
            .await;
        assert!(matches!(result, Err(ProvisionError::Rejected(_))));
        assert!(matches!(
            requester.state().await,
            RequesterState::Failed { .. }
        ));

        provider_handle.await.unwrap();
        assert_eq!(alice.registry.resolve(&foreign), None);
    }

    #[tokio::test]
    async fn test_garbage_signature_fails_verification() {
        let alice = make_party();
        let mallory = make_party();
        let (session_a, session_m) = SimSession::pair(alice.id, mallory.id);

        let requester = requester_for(&alice);
        let forged_key = mallory.key_manager.fresh_key(None).unwrap();

        // A peer that answers with a claim whose signature is garbage
        let mallory_handle = tokio::spawn(async move {
            let bytes = session_m.recv().await.unwrap();
            let msg: ProvisionMessage = cbor_deserialize(&bytes).unwrap();
            let challenge = match msg {
                ProvisionMessage::Request(KeyOwnershipRequest::FreshKey { challenge }) => challenge,
                other => panic!("Expected FreshKey request, got {:?}", msg_name(&other)),
            };

            let second = ChallengeResponse::generate();
            let claim = SignedOwnershipClaim {
                public_key: forged_key,
                raw_digest: crate::identity::claim::ownership_digest(&challenge, &second).to_vec(),
                signature: vec![0u8; 64],
                second_challenge: second,
            };
            let bytes = cbor_serialize(&ProvisionMessage::Claim(claim)).unwrap();
            session_m.send(&bytes).await.unwrap();
        });

        let result = requester.request_key(&session_a, KeyRequest::Fresh).await;
        assert!(matches!(
            result,
            Err(ProvisionError::SignatureVerification(_))
        ));

        mallory_handle.await.unwrap();
        assert_eq!(alice.registry.resolve(&forged_key), None);
    }

    #[tokio::test]
    async fn test_stale_challenge_fails_digest_check() {
        let alice = make_party();
        let mallory = make_party();
        let (session_a, session_m) = SimSession::pair(alice.id, mallory.id);

        let requester = requester_for(&alice);
        let key_manager = mallory.key_manager.clone();

        // A peer that signs correctly, but over a challenge from some other
        // run; the signature verifies, the digest check must not
        let mallory_handle = tokio::spawn(async move {
            let _request = session_m.recv().await.unwrap();
            let key = key_manager.fresh_key(None).unwrap();
            let stale = ChallengeResponse::generate();
            let claim = sign_ownership(key_manager.as_ref(), &stale, &key).unwrap();
            let bytes = cbor_serialize(&ProvisionMessage::Claim(claim)).unwrap();
            session_m.send(&bytes).await.unwrap();
        });

        let result = requester.request_key(&session_a, KeyRequest::Fresh).await;
        assert!(matches!(result, Err(ProvisionError::ChallengeMismatch)));

        mallory_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_for_wrong_key_is_rejected() {
        let alice = make_party();
        let mallory = make_party();
        let requested = mallory.key_manager.fresh_key(None).unwrap();
        let (session_a, session_m) = SimSession::pair(alice.id, mallory.id);

        let requester = requester_for(&alice);
        let key_manager = mallory.key_manager.clone();

        // A peer that answers a known-key request with a valid claim for a
        // different key it also owns
        let mallory_handle = tokio::spawn(async move {
            let bytes = session_m.recv().await.unwrap();
            let msg: ProvisionMessage = cbor_deserialize(&bytes).unwrap();
            let challenge = match msg {
                ProvisionMessage::Request(KeyOwnershipRequest::KnownKey { challenge, .. }) => {
                    challenge
                }
                other => panic!("Expected KnownKey request, got {:?}", msg_name(&other)),
            };

            let other_key = key_manager.fresh_key(None).unwrap();
            let claim = sign_ownership(key_manager.as_ref(), &challenge, &other_key).unwrap();
            let bytes = cbor_serialize(&ProvisionMessage::Claim(claim)).unwrap();
            session_m.send(&bytes).await.unwrap();
        });

        let result = requester
            .request_key(&session_a, KeyRequest::Known(requested))
            .await;
        assert!(matches!(result, Err(ProvisionError::KeyMismatch { .. })));

        mallory_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_provider_times_out() {
        let alice = make_party();
        let bob = make_party();
        let (mut session_a, _session_b) = SimSession::pair(alice.id, bob.id);
        session_a.set_read_timeout(Duration::from_secs(5));

        let requester = requester_for(&alice);
        let result = requester.request_key(&session_a, KeyRequest::Fresh).await;

        assert!(matches!(
            result,
            Err(ProvisionError::Transport(SessionError::Timeout))
        ));
        assert!(matches!(
            requester.state().await,
            RequesterState::Failed { .. }
        ));
    }
}
