//! The framed stream: chunk reassembly, length-prefix parsing, and the
//! version gate.

use super::frame::{Frame, Operation};
use super::version::{NegotiatedVersion, VersionRange};
use super::StreamError;
use crate::config::MAX_FRAME_LEN;
use crate::transport::Transport;

/// Frame stream over one transport.
///
/// Owned by a single session actor; all methods take `&mut self`, so frame
/// order on each side is exactly arrival order. No frame is handed upward
/// (and none may be sent, other than the version frame itself) until
/// [`FramedStream::exchange_versions`] has completed.
pub struct FramedStream {
    transport: Transport,
    buffer: Vec<u8>,
    negotiated: Option<NegotiatedVersion>,
}

impl FramedStream {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
            negotiated: None,
        }
    }

    pub fn peer_address(&self) -> &str {
        self.transport.address()
    }

    pub fn version(&self) -> Option<NegotiatedVersion> {
        self.negotiated
    }

    /// Send our version frame, wait for the peer's, and negotiate.
    ///
    /// Any non-version frame received first is a protocol violation. A
    /// failed negotiation terminates the session before a single handshake
    /// frame is accepted.
    pub async fn exchange_versions(&mut self) -> Result<NegotiatedVersion, StreamError> {
        let ours = VersionRange::supported();
        self.write_frame(&Frame::version_exchange(ours.encode())).await?;

        let frame = self.read_frame().await?;
        if frame.operation != Operation::VersionExchange {
            return Err(StreamError::FrameMalformed(
                "expected version exchange before any other frame".into(),
            ));
        }
        let peer = VersionRange::decode(&frame.payload)?;
        let negotiated = ours.negotiate(&peer)?;
        self.negotiated = Some(negotiated);
        tracing::debug!(
            peer = %self.transport.address(),
            messaging = negotiated.messaging,
            security = negotiated.security,
            "Version exchange complete"
        );
        Ok(negotiated)
    }

    /// Send a frame, splitting it into MTU-sized chunks.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), StreamError> {
        if self.negotiated.is_none() {
            return Err(StreamError::VersionNotExchanged);
        }
        self.write_frame(frame).await
    }

    /// Receive the next complete frame, reassembling chunks as needed.
    pub async fn next_frame(&mut self) -> Result<Frame, StreamError> {
        if self.negotiated.is_none() {
            return Err(StreamError::VersionNotExchanged);
        }
        let frame = self.read_frame().await?;
        if frame.operation == Operation::VersionExchange {
            // Exactly one version frame per side per session.
            return Err(StreamError::FrameMalformed(
                "unexpected version frame after negotiation".into(),
            ));
        }
        Ok(frame)
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), StreamError> {
        let wire = frame.encode();
        for chunk in wire.chunks(self.transport.mtu()) {
            self.transport
                .send_chunk(chunk.to_vec())
                .await
                .map_err(|_| StreamError::Disconnected)?;
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, StreamError> {
        loop {
            if self.buffer.len() >= 4 {
                let len_bytes: [u8; 4] = self.buffer[..4].try_into().expect("4-byte prefix");
                let body_len = u32::from_be_bytes(len_bytes) as usize;
                if body_len > MAX_FRAME_LEN {
                    return Err(StreamError::FrameMalformed(format!(
                        "frame body of {body_len} bytes exceeds limit"
                    )));
                }
                if self.buffer.len() >= 4 + body_len {
                    let body: Vec<u8> = self.buffer.drain(..4 + body_len).skip(4).collect();
                    return Frame::decode_body(&body);
                }
            }
            let chunk = self
                .transport
                .recv_chunk()
                .await
                .ok_or(StreamError::Disconnected)?;
            self.buffer.extend_from_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn connected_pair(mtu: usize) -> (FramedStream, FramedStream) {
        let (left, right) = Transport::pair(mtu);
        let mut left = FramedStream::new(left);
        let mut right = FramedStream::new(right);
        let (a, b) = tokio::join!(left.exchange_versions(), right.exchange_versions());
        a.unwrap();
        b.unwrap();
        (left, right)
    }

    #[tokio::test]
    async fn version_exchange_negotiates_supported_pair() {
        let (left, _right) = connected_pair(64).await;
        let version = left.version().unwrap();
        assert_eq!(version.messaging, 2);
        assert_eq!(version.security, 2);
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut left, mut right) = connected_pair(64).await;
        let frame = Frame::message(Uuid::new_v4(), b"turn on seat heating".to_vec(), false);
        left.send_frame(&frame).await.unwrap();
        assert_eq!(right.next_frame().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn large_frames_are_split_and_reassembled() {
        // Frame body far larger than the 23-byte MTU.
        let (mut left, mut right) = connected_pair(23).await;
        let payload = vec![0x5A; 4096];
        let frame = Frame::message(Uuid::new_v4(), payload.clone(), true);
        let send = left.send_frame(&frame);
        let recv = right.next_frame();
        let (sent, received) = tokio::join!(send, recv);
        sent.unwrap();
        assert_eq!(received.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (mut left, mut right) = connected_pair(64).await;
        for i in 0..10u8 {
            left.send_frame(&Frame::handshake(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(right.next_frame().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn send_before_version_exchange_is_refused() {
        let (left, _right) = Transport::pair(64);
        let mut stream = FramedStream::new(left);
        let result = stream.send_frame(&Frame::handshake(vec![])).await;
        assert!(matches!(result, Err(StreamError::VersionNotExchanged)));
    }

    #[tokio::test]
    async fn version_mismatch_fails_before_handshake() {
        let (left, mut right_raw) = Transport::pair(64);
        let mut stream = FramedStream::new(left);

        // Peer only speaks messaging version 3.
        let peer_versions = VersionRange {
            min_messaging: 3,
            max_messaging: 3,
            min_security: 2,
            max_security: 2,
        };
        let exchange = stream.exchange_versions();
        let peer = async {
            let frame = Frame::version_exchange(peer_versions.encode());
            for chunk in frame.encode().chunks(64) {
                right_raw.send_chunk(chunk.to_vec()).await.unwrap();
            }
            right_raw.recv_chunk().await
        };
        let (result, _peer_saw) = tokio::join!(exchange, peer);
        assert!(matches!(result, Err(StreamError::VersionUnsupported)));
    }

    #[tokio::test]
    async fn non_version_first_frame_is_malformed() {
        let (left, right_raw) = Transport::pair(64);
        let mut stream = FramedStream::new(left);

        let exchange = stream.exchange_versions();
        let peer = async {
            let frame = Frame::handshake(b"too eager".to_vec());
            for chunk in frame.encode().chunks(64) {
                right_raw.send_chunk(chunk.to_vec()).await.unwrap();
            }
        };
        let (result, ()) = tokio::join!(exchange, peer);
        assert!(matches!(result, Err(StreamError::FrameMalformed(_))));
    }

    #[tokio::test]
    async fn second_version_frame_is_malformed() {
        let (mut left, mut right) = connected_pair(64).await;
        left.send_frame(&Frame {
            operation: Operation::VersionExchange,
            payload_encrypted: false,
            recipient: None,
            payload: VersionRange::supported().encode(),
        })
        .await
        .unwrap();
        let result = right.next_frame().await;
        assert!(matches!(result, Err(StreamError::FrameMalformed(_))));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_malformed() {
        let (mut left, right_raw) = connected_pair(64).await;
        let bogus = (MAX_FRAME_LEN as u32 + 1).to_be_bytes().to_vec();
        right_raw.transport.send_chunk(bogus).await.unwrap();
        let result = left.next_frame().await;
        assert!(matches!(result, Err(StreamError::FrameMalformed(_))));
    }

    #[tokio::test]
    async fn disconnect_mid_frame_surfaces() {
        let (mut left, right) = connected_pair(64).await;
        // Peer sends half a length prefix, then vanishes.
        right.transport.send_chunk(vec![0, 0]).await.unwrap();
        drop(right);
        let result = left.next_frame().await;
        assert!(matches!(result, Err(StreamError::Disconnected)));
    }
}
