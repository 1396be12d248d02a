//! In-memory key registry
//!
//! The check-and-insert runs under a single write lock, which makes
//! conflicting registrations of the same key impossible to interleave.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use crate::identity::PublicKey;

use super::{KeyMappingRecord, KeyRegistry, RegistryError};

/// Registry backed by a `HashMap` behind an `RwLock`.
#[derive(Default)]
pub struct InMemoryKeyRegistry {
    mappings: RwLock<HashMap<PublicKey, KeyMappingRecord>>,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered mappings.
    pub fn len(&self) -> usize {
        self.mappings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyRegistry for InMemoryKeyRegistry {
    fn register(
        &self,
        key: PublicKey,
        party: Uuid,
        scope_id: Option<Uuid>,
    ) -> Result<(), RegistryError> {
        let mut mappings = self.mappings.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = mappings.get(&key) {
            if existing.party != party {
                return Err(RegistryError::Conflict {
                    key,
                    existing: existing.party,
                    attempted: party,
                });
            }
            // Same party again: keep the original record
            return Ok(());
        }

        mappings.insert(
            key,
            KeyMappingRecord {
                public_key: key,
                party,
                scope_id,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn resolve(&self, key: &PublicKey) -> Option<Uuid> {
        let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());
        mappings.get(key).map(|record| record.party)
    }

    fn record(&self, key: &PublicKey) -> Option<KeyMappingRecord> {
        let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());
        mappings.get(key).cloned()
    }
}
