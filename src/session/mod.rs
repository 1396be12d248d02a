//! Session layer for protocol runs
//!
//! A session is a reliable, ordered, authenticated point-to-point channel
//! between two already-identified parties. Each protocol run owns exactly
//! one session and drives it to completion or failure; message send and
//! receive are the protocols' only suspension points.
//!
//! Transport establishment and discovery are out of scope; the crate ships
//! the abstract `Session` trait and an in-process simulated implementation
//! for tests and embedding.

pub mod simulated;
pub mod transport;

pub use simulated::SimSession;
pub use transport::Session;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
