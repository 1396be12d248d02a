//! Single-use anti-replay challenges
//!
//! A `ChallengeResponse` is an opaque 256-bit random value generated fresh
//! for every protocol run. Challenges are compared only by equality and are
//! discarded after verification; reusing one across runs defeats the
//! anti-replay property.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A 256-bit single-use random challenge.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse([u8; 32]);

impl ChallengeResponse {
    /// Generate a fresh challenge from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChallengeResponse {
    /// Short hex prefix, enough to correlate log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for ChallengeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeResponse({})", self)
    }
}
