//! One device's session: the actor that owns the framed stream, the
//! handshake engine, and (once established) the session key.
//!
//! All inbound bytes for a session pass through this single task in
//! arrival order. Commands from the manager arrive on an mpsc channel and
//! outbound sends are serialized here, so per-session ordering holds on
//! both directions. Nothing encrypted leaves or is accepted before the
//! handshake finishes, and no key is installed before it has been
//! persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::crypto::SessionKey;
use crate::error::ErrorKind;
use crate::handshake::{HandshakeAction, HandshakeEngine, HandshakeInput, HandshakeState};
use crate::store::{KeyStore, PairedDeviceRecord};
use crate::stream::{Frame, FramedStream, Operation, StreamError};
use crate::transport::Transport;

/// Command channel depth per session.
const COMMAND_DEPTH: usize = 16;

// ═══════════════════════════════════════════════════════════
// Events and commands
// ═══════════════════════════════════════════════════════════

/// What a session reports upward, in emission order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The peer's device id arrived in the handshake.
    DeviceIdKnown {
        device_id: Uuid,
        friendly_name: String,
        reconnect: bool,
    },
    /// A verification code needs user confirmation.
    VerificationCode { code: String },
    /// The secure channel is up; the key digest is safe to log.
    Established { device_id: Uuid, key_digest: String },
    /// An application message cleared decryption (or arrived
    /// intentionally public).
    Message { recipient: Uuid, payload: Vec<u8> },
    /// Terminal failure. A `Disconnected` event follows.
    Error { kind: ErrorKind },
    /// The session is gone. Always the last event.
    Disconnected,
}

/// A session event tagged with its session.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: u64,
    pub event: ChannelEvent,
}

enum ChannelCommand {
    SendSecure {
        recipient: Uuid,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ErrorKind>>,
    },
    SendUnsecure {
        recipient: Uuid,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ErrorKind>>,
    },
    ConfirmVerification,
    Close,
}

/// The manager's grip on one running session.
#[derive(Clone)]
pub struct ChannelHandle {
    session_id: u64,
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub async fn send_secure(
        &self,
        recipient: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), ErrorKind> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::SendSecure {
                recipient,
                payload,
                reply,
            })
            .await
            .map_err(|_| ErrorKind::Disconnected)?;
        response.await.map_err(|_| ErrorKind::Disconnected)?
    }

    pub async fn send_unsecure(
        &self,
        recipient: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), ErrorKind> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::SendUnsecure {
                recipient,
                payload,
                reply,
            })
            .await
            .map_err(|_| ErrorKind::Disconnected)?;
        response.await.map_err(|_| ErrorKind::Disconnected)?
    }

    /// Signal that the user confirmed the displayed verification code.
    pub async fn confirm_verification(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::ConfirmVerification).await;
    }

    /// Ask the session to shut down. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Close).await;
    }
}

// ═══════════════════════════════════════════════════════════
// SecureChannel
// ═══════════════════════════════════════════════════════════

/// The session actor. Constructed by the manager, consumed by `run`.
pub struct SecureChannel {
    session_id: u64,
    stream: FramedStream,
    engine: HandshakeEngine,
    store: Arc<KeyStore>,
    handshake_timeout: Duration,
    events: mpsc::Sender<SessionEvent>,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    key: Option<SessionKey>,
    device_id: Option<Uuid>,
}

impl SecureChannel {
    pub fn new(
        session_id: u64,
        transport: Transport,
        engine: HandshakeEngine,
        store: Arc<KeyStore>,
        handshake_timeout: Duration,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Self, ChannelHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
        let channel = Self {
            session_id,
            stream: FramedStream::new(transport),
            engine,
            store,
            handshake_timeout,
            events,
            cmd_rx,
            key: None,
            device_id: None,
        };
        (
            channel,
            ChannelHandle {
                session_id,
                cmd_tx,
            },
        )
    }

    /// Drive the session to completion. Emits `Disconnected` as its final
    /// act, no matter how the session ends.
    pub async fn run(mut self) {
        self.run_inner().await;
        tracing::debug!(
            session = self.session_id,
            device_id = ?self.device_id,
            "Session ended"
        );
        self.emit(ChannelEvent::Disconnected).await;
    }

    async fn run_inner(&mut self) {
        if let Err(error) = self.stream.exchange_versions().await {
            tracing::warn!(
                session = self.session_id,
                peer = %self.stream.peer_address(),
                %error,
                "Version exchange failed"
            );
            self.emit_stream_error(error).await;
            return;
        }

        match self.engine.start() {
            Ok(actions) => {
                if self.execute(actions).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                self.emit(ChannelEvent::Error { kind: error.kind() }).await;
                return;
            }
        }

        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            let finished = self.engine.state() == HandshakeState::Finished;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if !finished => {
                    tracing::warn!(session = self.session_id, "Handshake deadline exceeded");
                    self.emit(ChannelEvent::Error { kind: ErrorKind::Timeout }).await;
                    return;
                }
                frame = self.stream.next_frame() => match frame {
                    Ok(frame) => {
                        if self.on_frame(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        self.emit_stream_error(error).await;
                        return;
                    }
                },
                command = self.cmd_rx.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await.is_err() {
                            return;
                        }
                    }
                    // Every handle dropped: the manager is gone.
                    None => return,
                },
            }
        }
    }

    // ── Inbound frames ───────────────────────────────────────

    async fn on_frame(&mut self, frame: Frame) -> Result<(), ()> {
        match frame.operation {
            // The stream consumes version frames during the exchange and
            // rejects later ones before we ever see them.
            Operation::VersionExchange => {
                self.emit(ChannelEvent::Error {
                    kind: ErrorKind::FrameMalformed,
                })
                .await;
                Err(())
            }
            Operation::EncryptionHandshake => {
                if self.engine.state() == HandshakeState::Finished {
                    self.emit(ChannelEvent::Error {
                        kind: ErrorKind::InvalidState,
                    })
                    .await;
                    return Err(());
                }
                match self.engine.advance(HandshakeInput::Frame(frame.payload)) {
                    Ok(actions) => self.execute(actions).await,
                    Err(error) => {
                        self.emit(ChannelEvent::Error { kind: error.kind() }).await;
                        Err(())
                    }
                }
            }
            Operation::ClientMessage => self.on_client_message(frame).await,
        }
    }

    async fn on_client_message(&mut self, frame: Frame) -> Result<(), ()> {
        let Some(recipient) = frame.recipient else {
            self.emit(ChannelEvent::Error {
                kind: ErrorKind::FrameMalformed,
            })
            .await;
            return Err(());
        };

        if !frame.payload_encrypted {
            // Intentionally public message.
            self.emit(ChannelEvent::Message {
                recipient,
                payload: frame.payload,
            })
            .await;
            return Ok(());
        }

        let established = self.engine.state() == HandshakeState::Finished;
        let Some(key) = self.key.as_ref().filter(|_| established) else {
            self.emit(ChannelEvent::Error {
                kind: ErrorKind::InvalidState,
            })
            .await;
            return Err(());
        };

        match key.open(&frame.payload) {
            Ok(plaintext) => {
                self.emit(ChannelEvent::Message {
                    recipient,
                    payload: plaintext,
                })
                .await;
                Ok(())
            }
            Err(_) => {
                self.emit(ChannelEvent::Error {
                    kind: ErrorKind::MacFailure,
                })
                .await;
                Err(())
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────

    async fn on_command(&mut self, command: ChannelCommand) -> Result<(), ()> {
        match command {
            ChannelCommand::SendSecure {
                recipient,
                payload,
                reply,
            } => {
                let established = self.engine.state() == HandshakeState::Finished;
                let Some(key) = self.key.as_ref().filter(|_| established) else {
                    let _ = reply.send(Err(ErrorKind::NotEstablished));
                    return Ok(());
                };
                let sealed = match key.seal(&payload) {
                    Ok(sealed) => sealed,
                    Err(_) => {
                        let _ = reply.send(Err(ErrorKind::InvalidState));
                        return Ok(());
                    }
                };
                let frame = Frame::message(recipient, sealed, true);
                match self.stream.send_frame(&frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        Ok(())
                    }
                    Err(_) => {
                        let _ = reply.send(Err(ErrorKind::Disconnected));
                        Err(())
                    }
                }
            }
            ChannelCommand::SendUnsecure {
                recipient,
                payload,
                reply,
            } => {
                // Plaintext sends only need the version exchange, which is
                // already behind us once commands are being processed.
                let frame = Frame::message(recipient, payload, false);
                match self.stream.send_frame(&frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        Ok(())
                    }
                    Err(_) => {
                        let _ = reply.send(Err(ErrorKind::Disconnected));
                        Err(())
                    }
                }
            }
            ChannelCommand::ConfirmVerification => {
                match self.engine.advance(HandshakeInput::ConfirmVerification) {
                    Ok(actions) => self.execute(actions).await,
                    Err(error) => {
                        self.emit(ChannelEvent::Error { kind: error.kind() }).await;
                        Err(())
                    }
                }
            }
            ChannelCommand::Close => Err(()),
        }
    }

    // ── Engine actions ───────────────────────────────────────

    async fn execute(&mut self, actions: Vec<HandshakeAction>) -> Result<(), ()> {
        let mut queue = std::collections::VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                HandshakeAction::SendFrame(payload) => {
                    let frame = Frame::handshake(payload);
                    if let Err(error) = self.stream.send_frame(&frame).await {
                        self.emit_stream_error(error).await;
                        return Err(());
                    }
                }
                HandshakeAction::DeviceIdKnown {
                    device_id,
                    friendly_name,
                    reconnect,
                } => {
                    self.device_id = Some(device_id);
                    self.emit(ChannelEvent::DeviceIdKnown {
                        device_id,
                        friendly_name,
                        reconnect,
                    })
                    .await;
                }
                HandshakeAction::RequireStoredKey { device_id } => {
                    let key = self
                        .store
                        .load(&device_id)
                        .and_then(|record| record.encryption_key.try_into().ok());
                    match self.engine.advance(HandshakeInput::StoredKey(key)) {
                        Ok(actions) => queue.extend(actions),
                        Err(error) => {
                            self.emit(ChannelEvent::Error { kind: error.kind() }).await;
                            return Err(());
                        }
                    }
                }
                HandshakeAction::DisplayVerificationCode { code } => {
                    self.emit(ChannelEvent::VerificationCode { code }).await;
                }
                HandshakeAction::PersistKey {
                    device_id,
                    friendly_name,
                    key,
                } => {
                    if let Err(error) = self.persist_key(device_id, friendly_name, &key) {
                        tracing::error!(
                            session = self.session_id,
                            device_id = %device_id,
                            %error,
                            "Key persistence failed — abandoning handshake"
                        );
                        self.emit(ChannelEvent::Error {
                            kind: ErrorKind::StorageError,
                        })
                        .await;
                        // The confirmation frame and the Established event
                        // queued behind this persist never happen.
                        return Err(());
                    }
                }
                HandshakeAction::Established { device_id, key } => {
                    let key = SessionKey::from_bytes(key);
                    let key_digest = key.digest();
                    self.key = Some(key);
                    self.device_id = Some(device_id);
                    tracing::info!(
                        session = self.session_id,
                        device_id = %device_id,
                        key_digest,
                        "Secure channel established"
                    );
                    self.emit(ChannelEvent::Established {
                        device_id,
                        key_digest,
                    })
                    .await;
                }
            }
        }
        Ok(())
    }

    fn persist_key(
        &self,
        device_id: Uuid,
        friendly_name: String,
        key: &[u8; 32],
    ) -> Result<(), crate::store::StoreError> {
        let record = match self.store.load(&device_id) {
            Some(mut existing) => {
                existing.encryption_key = key.to_vec();
                existing.address = self.stream.peer_address().to_string();
                existing.last_seen = Utc::now();
                existing
            }
            None => {
                let mut record = PairedDeviceRecord::new(
                    device_id,
                    self.stream.peer_address().to_string(),
                    friendly_name,
                    key.to_vec(),
                );
                // A freshly associated phone becomes the active user's
                // device; the store clears the flag elsewhere.
                record.active_user = true;
                record
            }
        };
        self.store.save(&record)
    }

    // ── Event plumbing ───────────────────────────────────────

    async fn emit(&self, event: ChannelEvent) {
        let _ = self
            .events
            .send(SessionEvent {
                session_id: self.session_id,
                event,
            })
            .await;
    }

    async fn emit_stream_error(&self, error: StreamError) {
        match error {
            StreamError::Disconnected => {}
            other => {
                self.emit(ChannelEvent::Error { kind: other.kind() }).await;
            }
        }
    }
}
