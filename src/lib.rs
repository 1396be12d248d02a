// Veilkey - Confidential Identity Provisioning & Synchronization

pub mod identity;
pub mod provision;
pub mod registry;
pub mod session;
pub mod sync;

pub use identity::{ChallengeResponse, KeyManager, LocalKeyManager, PublicKey, SignedOwnershipClaim};
pub use provision::{ConfidentialKey, KeyRequest, ProvisionProvider, ProvisionRequester};
pub use registry::{InMemoryKeyRegistry, KeyMappingRecord, KeyRegistry};
pub use session::Session;
pub use sync::{SyncInitiator, SyncResponder, TransactionInspector};
