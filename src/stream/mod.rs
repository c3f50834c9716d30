//! Framed message stream over an unreliable chunk transport.
//!
//! Frames are length-prefixed, operation-typed, and carried in MTU-sized
//! chunks. Before any application frame passes upward, both sides must
//! complete a version exchange; disagreement ends the session.

pub mod frame;
pub mod framed;
pub mod version;

pub use frame::{Frame, Operation};
pub use framed::FramedStream;
pub use version::{NegotiatedVersion, VersionRange};

use crate::error::ErrorKind;

/// Errors from the framing layer. All of them terminate the session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Malformed frame: {0}")]
    FrameMalformed(String),
    #[error("No common protocol version")]
    VersionUnsupported,
    #[error("Version exchange has not completed")]
    VersionNotExchanged,
    #[error("Transport disconnected")]
    Disconnected,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::FrameMalformed(_) => ErrorKind::FrameMalformed,
            StreamError::VersionUnsupported => ErrorKind::VersionUnsupported,
            StreamError::VersionNotExchanged => ErrorKind::InvalidState,
            StreamError::Disconnected => ErrorKind::Disconnected,
        }
    }
}
