//! Identity synchronization protocol
//!
//! Two-role exchange that reconciles which confidential keys a peer can
//! resolve to identities:
//!
//! **Initiator:** send a candidate set of confidential keys → await the
//!   peer's requested subset → validate it against the offer → resolve each
//!   requested key through the local registry → send the resolved map.
//!
//! **Responder:** receive candidates → request the ones it cannot resolve
//!   locally → await the resolved map → optionally prove ownership via the
//!   provisioning protocol → register each mapping.
//!
//! An empty resolved map is a normal terminal state: the peer simply had
//! nothing to offer. Everything else that goes wrong aborts the run for
//! both ends.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{KeyManager, PublicKey};
use crate::provision::{KeyRequest, ProvisionError, ProvisionProvider, ProvisionRequester};
use crate::registry::{KeyRegistry, RegistryError};
use crate::session::{Session, SessionError};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// One entry of the resolved map.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub public_key: PublicKey,
    pub party: Uuid,
}

/// Messages exchanged over a session during synchronization.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum SyncMessage {
    /// Initiator → responder: keys on offer.
    Candidates { keys: Vec<PublicKey> },
    /// Responder → initiator: the subset it wants identities for.
    /// `require_proof` announces the nested ownership exchanges that follow
    /// the resolved map, so both ends agree on what comes next.
    Requested {
        keys: Vec<PublicKey>,
        require_proof: bool,
    },
    /// Initiator → responder: the mappings it could resolve.
    Resolved { mappings: Vec<ResolvedMapping> },
    /// Either side can abort.
    Rejected { reason: String },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during a synchronization run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Missing argument: supply either a transaction or an explicit key list")]
    MissingArgument,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Key conflict: {0}")]
    KeyConflict(RegistryError),

    #[error("Registry error: {0}")]
    Registry(RegistryError),

    #[error("Ownership proof failed: {0}")]
    Provision(#[from] ProvisionError),

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

fn registry_error(e: RegistryError) -> SyncError {
    match e {
        conflict @ RegistryError::Conflict { .. } => SyncError::KeyConflict(conflict),
        other => SyncError::Registry(other),
    }
}

// ---------------------------------------------------------------------------
// Collaborator seam
// ---------------------------------------------------------------------------

/// Extracts the participant keys of a ledger transaction. Only consumed by
/// the initiator when it is given a transaction instead of an explicit key
/// list; the transaction type itself stays opaque to this crate.
pub trait TransactionInspector<T>: Send + Sync {
    fn participant_keys(&self, transaction: &T) -> Vec<PublicKey>;
}

/// Inspector for runs that never look at a transaction.
struct NullInspector;

impl TransactionInspector<()> for NullInspector {
    fn participant_keys(&self, _transaction: &()) -> Vec<PublicKey> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SyncError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, SyncError> {
    ciborium::from_reader(data).map_err(|e| SyncError::Serialization(e.to_string()))
}

async fn send_msg(session: &dyn Session, msg: &SyncMessage) -> Result<(), SyncError> {
    let bytes = cbor_serialize(msg)?;
    session.send(&bytes).await.map_err(SyncError::Transport)
}

async fn recv_msg(session: &dyn Session) -> Result<SyncMessage, SyncError> {
    let bytes = session.recv().await.map_err(SyncError::Transport)?;
    cbor_deserialize(&bytes)
}

/// Dedupe preserving first-occurrence order.
fn dedupe(keys: Vec<PublicKey>) -> Vec<PublicKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(*key)).collect()
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// Summary of a completed initiator run.
#[derive(Clone, Debug)]
pub struct SyncReport {
    /// Candidate keys offered to the peer.
    pub candidates: Vec<PublicKey>,
    /// Subset the peer asked identities for.
    pub requested: Vec<PublicKey>,
    /// Mappings sent back (only successful resolutions).
    pub resolved: Vec<ResolvedMapping>,
}

/// Initiator side of the synchronization protocol. One run at a time.
pub struct SyncInitiator {
    registry: Arc<dyn KeyRegistry>,
    key_manager: Arc<dyn KeyManager>,
    party_id: Uuid,
}

impl SyncInitiator {
    pub fn new(
        registry: Arc<dyn KeyRegistry>,
        key_manager: Arc<dyn KeyManager>,
        party_id: Uuid,
    ) -> Self {
        Self {
            registry,
            key_manager,
            party_id,
        }
    }

    /// General entry point: candidates come from the explicit list when
    /// given, otherwise from inspecting the transaction's participants and
    /// keeping only the keys this party cannot resolve. Supplying neither
    /// fails with [`SyncError::MissingArgument`].
    pub async fn run<T>(
        &self,
        session: &dyn Session,
        inspector: &dyn TransactionInspector<T>,
        transaction: Option<&T>,
        explicit_keys: Option<Vec<PublicKey>>,
    ) -> Result<SyncReport, SyncError> {
        let candidates = match (explicit_keys, transaction) {
            (Some(keys), _) => dedupe(keys),
            (None, Some(tx)) => dedupe(
                inspector
                    .participant_keys(tx)
                    .into_iter()
                    .filter(|key| self.registry.resolve(key).is_none())
                    .collect(),
            ),
            (None, None) => return Err(SyncError::MissingArgument),
        };

        self.exchange(session, candidates).await
    }

    /// Synchronize an explicit candidate list.
    pub async fn run_with_keys(
        &self,
        session: &dyn Session,
        keys: Vec<PublicKey>,
    ) -> Result<SyncReport, SyncError> {
        self.run::<()>(session, &NullInspector, None, Some(keys)).await
    }

    /// Synchronize the unresolvable participants of a transaction.
    pub async fn run_with_transaction<T>(
        &self,
        session: &dyn Session,
        transaction: &T,
        inspector: &dyn TransactionInspector<T>,
    ) -> Result<SyncReport, SyncError> {
        self.run(session, inspector, Some(transaction), None).await
    }

    async fn exchange(
        &self,
        session: &dyn Session,
        candidates: Vec<PublicKey>,
    ) -> Result<SyncReport, SyncError> {
        send_msg(
            session,
            &SyncMessage::Candidates {
                keys: candidates.clone(),
            },
        )
        .await?;

        let (requested, require_proof) = match recv_msg(session).await? {
            SyncMessage::Requested {
                keys,
                require_proof,
            } => (keys, require_proof),
            SyncMessage::Rejected { reason } => return Err(SyncError::Rejected(reason)),
            other => {
                return Err(SyncError::UnexpectedMessage {
                    expected: "Requested",
                    got: msg_name(&other),
                })
            }
        };

        // The peer may only ask for what it was offered
        let offered: HashSet<PublicKey> = candidates.iter().copied().collect();
        if let Some(rogue) = requested.iter().find(|key| !offered.contains(key)) {
            let reason = format!("requested key {} was never offered", rogue);
            let _ = send_msg(
                session,
                &SyncMessage::Rejected {
                    reason: reason.clone(),
                },
            )
            .await;
            return Err(SyncError::ProtocolViolation(reason));
        }

        let resolved: Vec<ResolvedMapping> = requested
            .iter()
            .filter_map(|key| {
                self.registry.resolve(key).map(|party| ResolvedMapping {
                    public_key: *key,
                    party,
                })
            })
            .collect();

        send_msg(
            session,
            &SyncMessage::Resolved {
                mappings: resolved.clone(),
            },
        )
        .await?;

        if require_proof {
            self.serve_proofs(session, &resolved).await?;
        }

        log::debug!(
            "Sync with {}: offered {}, requested {}, resolved {}",
            session.counterparty(),
            candidates.len(),
            requested.len(),
            resolved.len()
        );

        Ok(SyncReport {
            candidates,
            requested,
            resolved,
        })
    }

    /// Service the responder's nested ownership exchanges: one known-key
    /// provisioning run per resolved mapping that names this party. Both
    /// ends derive the same sublist from the resolved map, in order.
    async fn serve_proofs(
        &self,
        session: &dyn Session,
        resolved: &[ResolvedMapping],
    ) -> Result<(), SyncError> {
        for mapping in resolved.iter().filter(|m| m.party == self.party_id) {
            let provider = ProvisionProvider::new(
                self.key_manager.clone(),
                self.registry.clone(),
                self.party_id,
            );
            let proven = provider.provide_key(session).await?;
            if proven != mapping.public_key {
                return Err(SyncError::ProtocolViolation(format!(
                    "peer requested proof for {}, expected {}",
                    proven, mapping.public_key
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Summary of a completed responder run.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    /// Mappings registered during this run.
    pub registered: Vec<ResolvedMapping>,
    /// Requested keys the peer could not resolve. Left unresolved without
    /// error.
    pub unresolved: Vec<PublicKey>,
}

/// Responder side of the synchronization protocol. One run at a time.
///
/// With `verify_ownership` enabled, each mapping the resolved map attributes
/// to the initiator itself is registered through a full known-key
/// provisioning exchange, a genuine proof of ownership. Mappings naming
/// third parties cannot be proven by the initiator and are registered on
/// the strength of the authenticated session alone.
pub struct SyncResponder {
    registry: Arc<dyn KeyRegistry>,
    verify_ownership: bool,
}

impl SyncResponder {
    pub fn new(registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            registry,
            verify_ownership: false,
        }
    }

    /// Demand ownership proofs for the initiator's own mappings.
    pub fn with_ownership_proofs(mut self) -> Self {
        self.verify_ownership = true;
        self
    }

    /// Drive one full responder run over `session`.
    pub async fn run(&self, session: &dyn Session) -> Result<SyncOutcome, SyncError> {
        let candidates = match recv_msg(session).await? {
            SyncMessage::Candidates { keys } => keys,
            SyncMessage::Rejected { reason } => return Err(SyncError::Rejected(reason)),
            other => {
                return Err(SyncError::UnexpectedMessage {
                    expected: "Candidates",
                    got: msg_name(&other),
                })
            }
        };

        // The keys we need identities for
        let requested: Vec<PublicKey> = dedupe(candidates)
            .into_iter()
            .filter(|key| self.registry.resolve(key).is_none())
            .collect();

        send_msg(
            session,
            &SyncMessage::Requested {
                keys: requested.clone(),
                require_proof: self.verify_ownership,
            },
        )
        .await?;

        let mappings = match recv_msg(session).await? {
            SyncMessage::Resolved { mappings } => mappings,
            SyncMessage::Rejected { reason } => return Err(SyncError::Rejected(reason)),
            other => {
                return Err(SyncError::UnexpectedMessage {
                    expected: "Resolved",
                    got: msg_name(&other),
                })
            }
        };

        // Mirror of the initiator's subset check: only requested keys may
        // come back resolved
        let asked: HashSet<PublicKey> = requested.iter().copied().collect();
        if let Some(rogue) = mappings.iter().find(|m| !asked.contains(&m.public_key)) {
            let reason = format!("resolved key {} was never requested", rogue.public_key);
            let _ = send_msg(
                session,
                &SyncMessage::Rejected {
                    reason: reason.clone(),
                },
            )
            .await;
            return Err(SyncError::ProtocolViolation(reason));
        }

        let counterparty = session.counterparty();
        let mut registered = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            if self.verify_ownership && mapping.party == counterparty {
                // Full challenge-response over the same session; the
                // requester registers the key as part of its run
                let requester = ProvisionRequester::new(self.registry.clone());
                requester
                    .request_key(session, KeyRequest::Known(mapping.public_key))
                    .await?;
            } else {
                self.registry
                    .register(mapping.public_key, mapping.party, None)
                    .map_err(registry_error)?;
            }
            registered.push(mapping.clone());
        }

        let resolved_keys: HashSet<PublicKey> =
            mappings.iter().map(|m| m.public_key).collect();
        let unresolved: Vec<PublicKey> = requested
            .into_iter()
            .filter(|key| !resolved_keys.contains(key))
            .collect();

        if registered.is_empty() {
            // Normal terminal state: the peer had nothing for us
            log::debug!("Sync with {}: nothing resolved", counterparty);
        }

        Ok(SyncOutcome {
            registered,
            unresolved,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Human-readable name for a `SyncMessage` variant (for error messages).
fn msg_name(msg: &SyncMessage) -> &'static str {
    match msg {
        SyncMessage::Candidates { .. } => "Candidates",
        SyncMessage::Requested { .. } => "Requested",
        SyncMessage::Resolved { .. } => "Resolved",
        SyncMessage::Rejected { .. } => "Rejected",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
