//! Wire frame encoding.
//!
//! Body layout (after the `u32` big-endian length prefix):
//!
//! ```text
//! u8   operation
//! u8   flags             bit 0 = payload encrypted
//! u8   recipient_present
//! [16] recipient uuid    only when recipient_present = 1
//! ...  payload           length deduced from the body length
//! ```

use uuid::Uuid;

use super::StreamError;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// Frame operation, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    VersionExchange = 1,
    EncryptionHandshake = 2,
    ClientMessage = 3,
}

impl Operation {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Operation::VersionExchange),
            2 => Some(Operation::EncryptionHandshake),
            3 => Some(Operation::ClientMessage),
            _ => None,
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation: Operation,
    pub payload_encrypted: bool,
    pub recipient: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Version-exchange frame. Never encrypted, never addressed.
    pub fn version_exchange(payload: Vec<u8>) -> Self {
        Self {
            operation: Operation::VersionExchange,
            payload_encrypted: false,
            recipient: None,
            payload,
        }
    }

    /// Handshake frame. The payload is opaque to this layer.
    pub fn handshake(payload: Vec<u8>) -> Self {
        Self {
            operation: Operation::EncryptionHandshake,
            payload_encrypted: false,
            recipient: None,
            payload,
        }
    }

    /// Application frame addressed to a recipient endpoint.
    pub fn message(recipient: Uuid, payload: Vec<u8>, encrypted: bool) -> Self {
        Self {
            operation: Operation::ClientMessage,
            payload_encrypted: encrypted,
            recipient: Some(recipient),
            payload,
        }
    }

    /// Serialize the frame body (without the length prefix).
    pub fn encode_body(&self) -> Vec<u8> {
        let recipient_len = if self.recipient.is_some() { 16 } else { 0 };
        let mut body = Vec::with_capacity(3 + recipient_len + self.payload.len());
        body.push(self.operation as u8);
        body.push(if self.payload_encrypted { FLAG_ENCRYPTED } else { 0 });
        match &self.recipient {
            Some(recipient) => {
                body.push(1);
                body.extend_from_slice(recipient.as_bytes());
            }
            None => body.push(0),
        }
        body.extend_from_slice(&self.payload);
        body
    }

    /// Serialize with the `u32` big-endian length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut wire = Vec::with_capacity(4 + body.len());
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(&body);
        wire
    }

    /// Parse a frame body (the length prefix has already been consumed).
    pub fn decode_body(body: &[u8]) -> Result<Self, StreamError> {
        if body.len() < 3 {
            return Err(StreamError::FrameMalformed("body shorter than header".into()));
        }
        let operation = Operation::from_u8(body[0]).ok_or_else(|| {
            StreamError::FrameMalformed(format!("unknown operation {}", body[0]))
        })?;
        let payload_encrypted = body[1] & FLAG_ENCRYPTED != 0;
        let (recipient, payload_start) = match body[2] {
            0 => (None, 3),
            1 => {
                if body.len() < 19 {
                    return Err(StreamError::FrameMalformed("truncated recipient".into()));
                }
                let bytes: [u8; 16] = body[3..19].try_into().expect("sliced 16 bytes");
                (Some(Uuid::from_bytes(bytes)), 19)
            }
            other => {
                return Err(StreamError::FrameMalformed(format!(
                    "invalid recipient marker {other}"
                )))
            }
        };
        Ok(Self {
            operation,
            payload_encrypted,
            recipient,
            payload: body[payload_start..].to_vec(),
        })
    }
}
