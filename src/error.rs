//! Error kinds surfaced to the layers above the connection stack.
//!
//! Every kind is terminal for its session: the session closes, the kind is
//! reported once, and the caller (or the background reconnect path) starts
//! over. Nothing in this crate retries on its own.

use serde::{Deserialize, Serialize};

/// Terminal session failure, reported through `on_device_error` and
/// association callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    /// A handshake step was rejected by the key-agreement layer.
    #[error("Handshake rejected")]
    InvalidHandshake,
    /// A handshake frame carried a null or empty payload.
    #[error("Empty handshake frame")]
    InvalidMessage,
    /// Device id missing, duplicated, or unparseable.
    #[error("Invalid device id")]
    InvalidDeviceId,
    /// Verification code mismatch, or out-of-band decrypt failed.
    #[error("Verification failed")]
    InvalidVerification,
    /// Frame arrived in the wrong handshake state, or an encrypted frame
    /// arrived before the channel was established.
    #[error("Frame arrived in invalid state")]
    InvalidState,
    /// Reconnect requested but the stored key is absent or malformed.
    #[error("Stored encryption key missing or unusable")]
    InvalidEncryptionKey,
    /// Persisting the rotated or freshly agreed key failed.
    #[error("Key store write failed")]
    StorageError,
    /// The same recipient id was registered twice; the id is now refused
    /// process-wide.
    #[error("Recipient id registered twice — id blocklisted")]
    InsecureRecipientIdDetected,
    /// Version exchange found no common protocol version.
    #[error("No common protocol version")]
    VersionUnsupported,
    /// Handshake or out-of-band deadline exceeded.
    #[error("Deadline exceeded")]
    Timeout,
    /// AES-GCM authentication failed on an inbound encrypted payload.
    #[error("Message authentication failed")]
    MacFailure,
    /// The byte stream could not be parsed into frames.
    #[error("Malformed frame")]
    FrameMalformed,
    /// A secure send was attempted before the channel was established.
    #[error("Secure channel not established")]
    NotEstablished,
    /// The transport dropped.
    #[error("Transport disconnected")]
    Disconnected,
    /// The operation was interrupted cooperatively.
    #[error("Cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_plain_names() {
        let json = serde_json::to_string(&ErrorKind::InvalidVerification).unwrap();
        assert_eq!(json, "\"InvalidVerification\"");
    }

    #[test]
    fn kinds_roundtrip() {
        for kind in [
            ErrorKind::InvalidHandshake,
            ErrorKind::StorageError,
            ErrorKind::Timeout,
            ErrorKind::NotEstablished,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(kind, back);
        }
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            ErrorKind::NotEstablished.to_string(),
            "Secure channel not established"
        );
    }
}
