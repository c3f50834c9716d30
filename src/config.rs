//! Stack-wide configuration and protocol constants.

use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "Headlink";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Messaging protocol version spoken by this stack.
pub const MESSAGING_VERSION: u8 = 2;
/// Security (handshake) protocol version spoken by this stack.
pub const SECURITY_VERSION: u8 = 2;

/// Default chunk size for BLE-style transports (bytes per write).
pub const DEFAULT_MTU: usize = 185;

/// Hard cap on a single frame body. Anything larger is treated as a
/// malformed stream, not a large message.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Get the head-unit data directory.
/// ~/Headlink/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Headlink")
}

/// Get the directory holding paired-device records and the unit id.
pub fn devices_dir() -> PathBuf {
    app_data_dir().join("devices")
}

/// Default log filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    format!("warn,{}=info", env!("CARGO_PKG_NAME"))
}

/// Runtime tunables for the connection stack.
///
/// Constructed once at startup and handed to the manager. Tests point
/// `storage_dir` at a tempdir and shrink the deadlines.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the key store.
    pub storage_dir: PathBuf,
    /// Total deadline for a handshake, measured from physical connect.
    pub handshake_timeout: Duration,
    /// Deadline for an out-of-band material exchange.
    pub oob_timeout: Duration,
    /// Chunk size used when splitting frames for the transport.
    pub mtu: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: devices_dir(),
            handshake_timeout: Duration::from_secs(30),
            oob_timeout: Duration::from_secs(10),
            mtu: DEFAULT_MTU,
        }
    }
}

impl Config {
    /// Config rooted at an explicit storage directory.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn oob_timeout(mut self, timeout: Duration) -> Self {
        self.oob_timeout = timeout;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}
