//! On-disk persistence for key mappings
//!
//! Stores each mapping as `{key-hex}.json` in a directory and keeps an
//! in-memory cache for fast resolution. The conflict check and the disk
//! write happen under one write lock, so the durable state never holds two
//! parties for one key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use crate::identity::PublicKey;

use super::{KeyMappingRecord, KeyRegistry, RegistryError};

fn write_record(storage_path: &Path, record: &KeyMappingRecord) -> Result<(), RegistryError> {
    std::fs::create_dir_all(storage_path).map_err(|e| RegistryError::IoError(e.to_string()))?;

    let path = storage_path.join(format!("{}.json", record.public_key.to_hex()));
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| RegistryError::SerializationError(e.to_string()))?;

    std::fs::write(path, json).map_err(|e| RegistryError::IoError(e.to_string()))?;
    Ok(())
}

/// Persistent registry: one JSON file per mapping plus an in-memory cache.
pub struct FileKeyRegistry {
    storage_path: PathBuf,
    mappings: RwLock<HashMap<PublicKey, KeyMappingRecord>>,
}

impl FileKeyRegistry {
    /// Create a registry with an empty cache (does not read from disk).
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            mappings: RwLock::new(HashMap::new()),
        }
    }

    /// Load all mappings from the storage directory.
    pub fn load(storage_path: &Path) -> Result<Self, RegistryError> {
        let mut mappings = HashMap::new();

        if storage_path.exists() {
            let entries = std::fs::read_dir(storage_path)
                .map_err(|e| RegistryError::IoError(e.to_string()))?;

            for entry in entries {
                let entry = entry.map_err(|e| RegistryError::IoError(e.to_string()))?;
                let path = entry.path();

                if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                    let data = std::fs::read(&path)
                        .map_err(|e| RegistryError::IoError(e.to_string()))?;
                    let record: KeyMappingRecord = serde_json::from_slice(&data)
                        .map_err(|e| RegistryError::SerializationError(e.to_string()))?;
                    mappings.insert(record.public_key, record);
                }
            }
        }

        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            mappings: RwLock::new(mappings),
        })
    }

    pub fn len(&self) -> usize {
        self.mappings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyRegistry for FileKeyRegistry {
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
            return Ok(());
        }

        let record = KeyMappingRecord {
            public_key: key,
            party,
            scope_id,
            registered_at: Utc::now(),
        };

        // Disk first: if the write fails, the cache stays consistent with disk
        write_record(&self.storage_path, &record)?;
        mappings.insert(key, record);
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
