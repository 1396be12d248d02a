//! Session trait definition
//!
//! The abstract channel interface the protocol drivers run over. Real
//! deployments implement this on top of their authenticated transport; the
//! simulated implementation lives in `simulated.rs`.

use async_trait::async_trait;
use uuid::Uuid;

use super::SessionError;

/// An established, authenticated channel to one counterparty.
///
/// Implementations must deliver messages reliably and in order, and must
/// bound every receive: a peer that never answers surfaces as
/// [`SessionError::Timeout`], not a hang.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send one message to the counterparty.
    async fn send(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Receive the next message from the counterparty, bounded by the
    /// session's read timeout.
    async fn recv(&self) -> Result<Vec<u8>, SessionError>;

    /// Close the session. Pending receives on either side fail.
    async fn close(&self) -> Result<(), SessionError>;

    /// Identity of the party on the other end. Sessions only exist between
    /// already-identified members, so this is always known.
    fn counterparty(&self) -> Uuid;

    /// Whether both ends still consider the session open.
    fn is_open(&self) -> bool;
}
