//! Confidential key material
//!
//! Each party holds a set of short-lived Ed25519 keypairs, optionally bound
//! to an external scope id (an account or sub-identity). The `KeyManager`
//! trait is the seam through which the protocols ask for key generation and
//! signing; `LocalKeyManager` is the in-process implementation with a
//! zeroized JSON keystore for persistence.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use super::IdentityError;

/// A raw 32-byte Ed25519 public key, the wire identity of a confidential key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse into a dalek verifying key. Fails for bytes that are not a
    /// valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| IdentityError::InvalidKeyMaterial(e.to_string()))
    }

    /// Full hex encoding (used for registry file names).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

/// Key generation and signing, as consumed by the protocol drivers.
///
/// Implementations hold the private material; the protocols only ever see
/// `PublicKey` values and signatures.
pub trait KeyManager: Send + Sync {
    /// Generate a brand-new keypair, optionally bound to a scope id.
    /// The public half is returned; the private half stays inside.
    fn fresh_key(&self, scope_id: Option<Uuid>) -> Result<PublicKey, IdentityError>;

    /// Sign `data` with the private material for `key`.
    /// Fails with `UnknownKey` if this manager never generated `key`.
    fn sign(&self, data: &[u8], key: &PublicKey) -> Result<ed25519_dalek::Signature, IdentityError>;

    /// Whether this manager holds private material for `key`.
    fn contains(&self, key: &PublicKey) -> bool;
}

struct KeyEntry {
    signing_key: SigningKey,
    scope_id: Option<Uuid>,
}

/// Serializable form of one keystore entry. Secret bytes are zeroized on drop.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    secret_bytes: [u8; 32],
    scope_id: Option<Uuid>,
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.secret_bytes.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    party_id: Uuid,
    entries: Vec<StoredKey>,
}

/// In-process key manager for one party.
///
/// Holds every confidential keypair this party has generated, keyed by the
/// public half. Interior locking makes `fresh_key` safe to call from
/// concurrent protocol runs.
pub struct LocalKeyManager {
    party_id: Uuid,
    keys: RwLock<HashMap<PublicKey, KeyEntry>>,
}

impl LocalKeyManager {
    /// Create an empty key manager for `party_id`.
    pub fn new(party_id: Uuid) -> Self {
        Self {
            party_id,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn party_id(&self) -> Uuid {
        self.party_id
    }

    /// Scope id a key was generated under, if any.
    pub fn scope_of(&self, key: &PublicKey) -> Option<Uuid> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(key).and_then(|entry| entry.scope_id)
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
        let store: KeyStoreFile = serde_json::from_slice(&data)
            .map_err(|e| IdentityError::DeserializationError(e.to_string()))?;

        let mut keys = HashMap::new();
        for entry in &store.entries {
            let signing_key = SigningKey::from_bytes(&entry.secret_bytes);
            let public = PublicKey::from_bytes(signing_key.verifying_key().to_bytes());
            keys.insert(
                public,
                KeyEntry {
                    signing_key,
                    scope_id: entry.scope_id,
                },
            );
        }

        Ok(Self {
            party_id: store.party_id,
            keys: RwLock::new(keys),
        })
    }

    /// Persist to a JSON keystore file.
    ///
    /// Future: encrypt with a platform keychain.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::IoError(e.to_string()))?;
        }

        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let store = KeyStoreFile {
            party_id: self.party_id,
            entries: keys
                .values()
                .map(|entry| StoredKey {
                    secret_bytes: entry.signing_key.to_bytes(),
                    scope_id: entry.scope_id,
                })
                .collect(),
        };

        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;

        std::fs::write(path, json).map_err(|e| IdentityError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Load from path if it exists, otherwise create an empty store and save.
    pub fn load_or_create(path: &Path, party_id: Uuid) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let manager = Self::new(party_id);
            manager.save(path)?;
            Ok(manager)
        }
    }
}

impl KeyManager for LocalKeyManager {
    fn fresh_key(&self, scope_id: Option<Uuid>) -> Result<PublicKey, IdentityError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from_bytes(signing_key.verifying_key().to_bytes());

        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(
            public,
            KeyEntry {
                signing_key,
                scope_id,
            },
        );

        Ok(public)
    }

    fn sign(&self, data: &[u8], key: &PublicKey) -> Result<ed25519_dalek::Signature, IdentityError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let entry = keys.get(key).ok_or(IdentityError::UnknownKey(*key))?;
        Ok(entry.signing_key.sign(data))
    }

    fn contains(&self, key: &PublicKey) -> bool {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.contains_key(key)
    }
}
