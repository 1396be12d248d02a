//! In-process simulated sessions
//!
//! Backs a session pair with tokio mpsc channels so two protocol tasks can
//! talk entirely in-process. Used for integration testing without a real
//! transport. Supports a configurable read timeout and simulated link
//! latency (tokio virtual time, so paused clocks advance instantly in tests).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::transport::Session;
use super::SessionError;

/// Default bound on every receive. Protocol runs fail with
/// [`SessionError::Timeout`] instead of hanging on a silent peer.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One end of a simulated session pair.
pub struct SimSession {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    open: Arc<AtomicBool>,
    peer_open: Arc<AtomicBool>,
    counterparty: Uuid,
    read_timeout: Duration,
    latency: Duration,
}

impl SimSession {
    /// Create a symmetric session pair between two parties. The first
    /// session belongs to `party_a` (its counterparty is `party_b`) and
    /// vice versa.
    pub fn pair(party_a: Uuid, party_b: Uuid) -> (SimSession, SimSession) {
        let (tx_ab, rx_ab) = mpsc::channel(64);
        let (tx_ba, rx_ba) = mpsc::channel(64);
        let open_a = Arc::new(AtomicBool::new(true));
        let open_b = Arc::new(AtomicBool::new(true));

        let session_a = SimSession {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            open: Arc::clone(&open_a),
            peer_open: Arc::clone(&open_b),
            counterparty: party_b,
            read_timeout: DEFAULT_READ_TIMEOUT,
            latency: Duration::ZERO,
        };

        let session_b = SimSession {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            open: open_b,
            peer_open: open_a,
            counterparty: party_a,
            read_timeout: DEFAULT_READ_TIMEOUT,
            latency: Duration::ZERO,
        };

        (session_a, session_b)
    }

    /// Bound applied to each `recv()`.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Simulated link latency applied to each `send()`.
    /// Uses tokio virtual time, so paused clocks advance instantly in tests.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }
}

#[async_trait]
impl Session for SimSession {
    async fn send(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Disconnected);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, SessionError> {
        if !self.is_open() {
            return Err(SessionError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(self.read_timeout, rx.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(SessionError::Disconnected),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn counterparty(&self) -> Uuid {
        self.counterparty
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.peer_open.load(Ordering::SeqCst)
    }
}
