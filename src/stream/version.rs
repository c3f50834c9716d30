//! Version exchange — the handshake before the handshake.
//!
//! The payload is four unsigned bytes: `{min_msg, max_msg, min_sec,
//! max_sec}`. Both sides advertise their ranges; the session continues only
//! when the ranges intersect at the versions this stack speaks.

use super::StreamError;
use crate::config::{MESSAGING_VERSION, SECURITY_VERSION};

/// Advertised version ranges for the messaging and security protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min_messaging: u8,
    pub max_messaging: u8,
    pub min_security: u8,
    pub max_security: u8,
}

/// The version pair both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedVersion {
    pub messaging: u8,
    pub security: u8,
}

impl VersionRange {
    /// The ranges this stack supports.
    pub fn supported() -> Self {
        Self {
            min_messaging: MESSAGING_VERSION,
            max_messaging: MESSAGING_VERSION,
            min_security: SECURITY_VERSION,
            max_security: SECURITY_VERSION,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![
            self.min_messaging,
            self.max_messaging,
            self.min_security,
            self.max_security,
        ]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StreamError> {
        let bytes: [u8; 4] = payload.try_into().map_err(|_| {
            StreamError::FrameMalformed(format!(
                "version payload must be 4 bytes, got {}",
                payload.len()
            ))
        })?;
        Ok(Self {
            min_messaging: bytes[0],
            max_messaging: bytes[1],
            min_security: bytes[2],
            max_security: bytes[3],
        })
    }

    /// Intersect with a peer's ranges. The intersection must contain the
    /// versions this stack speaks.
    pub fn negotiate(&self, peer: &VersionRange) -> Result<NegotiatedVersion, StreamError> {
        let messaging_ok = peer.min_messaging <= MESSAGING_VERSION
            && MESSAGING_VERSION <= peer.max_messaging
            && self.min_messaging <= MESSAGING_VERSION
            && MESSAGING_VERSION <= self.max_messaging;
        let security_ok = peer.min_security <= SECURITY_VERSION
            && SECURITY_VERSION <= peer.max_security
            && self.min_security <= SECURITY_VERSION
            && SECURITY_VERSION <= self.max_security;
        if !messaging_ok || !security_ok {
            return Err(StreamError::VersionUnsupported);
        }
        Ok(NegotiatedVersion {
            messaging: MESSAGING_VERSION,
            security: SECURITY_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_identity() {
        let range = VersionRange {
            min_messaging: 1,
            max_messaging: 3,
            min_security: 2,
            max_security: 4,
        };
        assert_eq!(VersionRange::decode(&range.encode()).unwrap(), range);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(matches!(
            VersionRange::decode(&[2, 2, 2]),
            Err(StreamError::FrameMalformed(_))
        ));
        assert!(matches!(
            VersionRange::decode(&[2, 2, 2, 2, 2]),
            Err(StreamError::FrameMalformed(_))
        ));
    }

    #[test]
    fn matching_ranges_negotiate() {
        let ours = VersionRange::supported();
        let peer = VersionRange::supported();
        let negotiated = ours.negotiate(&peer).unwrap();
        assert_eq!(negotiated.messaging, MESSAGING_VERSION);
        assert_eq!(negotiated.security, SECURITY_VERSION);
    }

    #[test]
    fn wide_peer_range_negotiates() {
        let peer = VersionRange {
            min_messaging: 1,
            max_messaging: 5,
            min_security: 1,
            max_security: 5,
        };
        assert!(VersionRange::supported().negotiate(&peer).is_ok());
    }

    #[test]
    fn disjoint_messaging_range_fails() {
        let peer = VersionRange {
            min_messaging: 3,
            max_messaging: 3,
            min_security: 2,
            max_security: 2,
        };
        let result = VersionRange::supported().negotiate(&peer);
        assert!(matches!(result, Err(StreamError::VersionUnsupported)));
    }

    #[test]
    fn disjoint_security_range_fails() {
        let peer = VersionRange {
            min_messaging: 2,
            max_messaging: 2,
            min_security: 3,
            max_security: 9,
        };
        let result = VersionRange::supported().negotiate(&peer);
        assert!(matches!(result, Err(StreamError::VersionUnsupported)));
    }
}
