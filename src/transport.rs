//! Transport seam between the connection stack and the radio driver.
//!
//! The stack never talks to a radio directly. A driver (BLE GATT, RFCOMM,
//! or an in-memory pipe in tests) delivers connections as [`Transport`]
//! values: a pair of chunk channels plus the link MTU. Dropping either end
//! disconnects the other. Reconnect and out-of-band association work over
//! every transport; the seam carries no per-transport capability flags.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// Chunk channel depth per direction.
const CHANNEL_DEPTH: usize = 64;

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Transport stopped")]
    Stopped,
}

/// Which side of the radio link this stack played for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We scanned and initiated the physical connect.
    Central,
    /// We advertised and accepted the physical connect.
    Peripheral,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionRole::Central => write!(f, "central"),
            ConnectionRole::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// One established byte link to a peer, seen as ordered chunks of at most
/// `mtu` bytes each.
pub struct Transport {
    address: String,
    mtu: usize,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Transport {
    /// Wrap driver-provided channels. The driver feeds inbound chunks into
    /// `rx`'s sender and drains `tx`'s receiver onto the radio.
    pub fn new(
        address: impl Into<String>,
        mtu: usize,
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            address: address.into(),
            mtu,
            tx,
            rx,
        }
    }

    /// A connected in-memory pair, used by tests and loopback drivers.
    pub fn pair(mtu: usize) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let left = Transport::new("pipe:left", mtu, a_tx, b_rx);
        let right = Transport::new("pipe:right", mtu, b_tx, a_rx);
        (left, right)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Send one chunk. Chunks must already respect the MTU; the framing
    /// layer owns the splitting.
    pub async fn send_chunk(&self, chunk: Vec<u8>) -> Result<(), TransportError> {
        debug_assert!(chunk.len() <= self.mtu, "chunk exceeds MTU");
        self.tx
            .send(chunk)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    /// Receive the next chunk in arrival order. `None` means the peer is
    /// gone.
    pub async fn recv_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.address)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Radio-driver seam. Injected at manager construction — there is no
/// process-wide driver registry.
///
/// `advertise` and `scan` are accept-style: each call resolves with the
/// next connection obtained in that role, and is polled again for the one
/// after. `connect` dials a known address for the background reconnect
/// path.
pub trait TransportFactory: Send + Sync + 'static {
    /// Wait for the next phone that connects to our advertisement
    /// (peripheral role).
    fn advertise(&self) -> BoxFuture<'_, Result<Transport, TransportError>>;

    /// Wait for the next phone discovered by scanning (central role).
    fn scan(&self) -> BoxFuture<'_, Result<Transport, TransportError>>;

    /// Connect to a specific stored address (central role).
    fn connect(&self, address: &str) -> BoxFuture<'_, Result<Transport, TransportError>>;
}
