//! Identity registry: durable public-key → party associations
//!
//! The registry is the only durable, shared state the protocols touch. It
//! enforces one invariant: a public key maps to at most one party. A second
//! registration of the same key to a *different* party fails with
//! `Conflict` instead of overwriting; re-registering to the same party is
//! idempotent.

pub mod file;
pub mod memory;

pub use file::FileKeyRegistry;
pub use memory::InMemoryKeyRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::PublicKey;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Key {key} is already registered to a different party ({existing}, attempted {attempted})")]
    Conflict {
        key: PublicKey,
        existing: Uuid,
        attempted: Uuid,
    },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// One durable key → party association.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyMappingRecord {
    pub public_key: PublicKey,
    pub party: Uuid,
    pub scope_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

/// The registry seam consumed by the protocol drivers.
///
/// `register` must be atomic per key: conflicting registrations to two
/// different parties are detected and rejected, never interleaved into an
/// overwrite. Registrations of distinct keys must not block one another
/// beyond the map lock.
pub trait KeyRegistry: Send + Sync {
    /// Associate `key` with `party`. Idempotent for the same party;
    /// `Conflict` if the key already belongs to someone else.
    fn register(
        &self,
        key: PublicKey,
        party: Uuid,
        scope_id: Option<Uuid>,
    ) -> Result<(), RegistryError>;

    /// Party currently associated with `key`, if any.
    fn resolve(&self, key: &PublicKey) -> Option<Uuid>;

    /// Full record for `key`, if any.
    fn record(&self, key: &PublicKey) -> Option<KeyMappingRecord>;
}
