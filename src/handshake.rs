//! Handshake engine: association and reconnect flows.
//!
//! The engine is a pure state machine. It consumes inputs (handshake
//! frames, the external verification confirmation, a stored-key lookup
//! result) and emits ordered actions for the session actor to execute:
//! frames to send, keys to persist, events to raise. All I/O — the framed
//! stream, the key store, deadlines — lives in the session actor, which
//! keeps every transition here unit-testable.
//!
//! Association (phone initiates):
//! 1. `Hello` carries the phone's device id and an ephemeral X25519 key.
//! 2. `UnitHello` answers with the head-unit id and its ephemeral key.
//! 3. Both sides derive a 6-digit verification code from the shared
//!    secret and wait for confirmation — human on both screens, or the
//!    out-of-band cipher exchange confirming automatically.
//! 4. The responder persists the agreed key, sends `Confirmation`, and
//!    finishes; the initiator finishes once it holds both its own
//!    confirmation and a valid `Confirmation` tag.
//!
//! Reconnect (either role initiates):
//! 1. `Hello` names the device; the responder looks up the previous key.
//! 2. `ResumeAuth` / `ServerAuth` tags prove possession of that key on
//!    both sides; a fresh ephemeral agreement mixed with the old key
//!    yields the rotated session key, persisted before anything is
//!    announced. A bad tag yields `InvalidVerification` and no key
//!    material.

use base64::Engine as _;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::KEY_LENGTH;
use crate::error::ErrorKind;
use crate::oob::OobCipher;

const ASSOCIATION_SALT: &[u8] = b"headlink-association-v2";
const VERIFICATION_INFO: &[u8] = b"verification-code";
const SESSION_KEY_INFO: &[u8] = b"session-key";
const CONFIRMATION_INFO: &[u8] = b"confirmation";
const CLIENT_AUTH_INFO: &[u8] = b"client-auth";
const SERVER_AUTH_INFO: &[u8] = b"server-auth";

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Terminal handshake failures. Any of these flips the engine to
/// `Invalid`; the session closes and reports the matching [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Peer key material rejected")]
    InvalidHandshake,
    #[error("Empty handshake frame")]
    InvalidMessage,
    #[error("Device id missing or duplicated")]
    InvalidDeviceId,
    #[error("Verification failed")]
    InvalidVerification,
    #[error("Handshake frame arrived in the wrong state")]
    InvalidState,
    #[error("No usable stored key for reconnect")]
    InvalidEncryptionKey,
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::InvalidHandshake => ErrorKind::InvalidHandshake,
            HandshakeError::InvalidMessage => ErrorKind::InvalidMessage,
            HandshakeError::InvalidDeviceId => ErrorKind::InvalidDeviceId,
            HandshakeError::InvalidVerification => ErrorKind::InvalidVerification,
            HandshakeError::InvalidState => ErrorKind::InvalidState,
            HandshakeError::InvalidEncryptionKey => ErrorKind::InvalidEncryptionKey,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Wire messages (opaque to the frame layer)
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum HandshakeMessage {
    /// Initiator's opener: who is pairing, and how.
    Hello {
        device_id: Uuid,
        friendly_name: String,
        reconnect: bool,
        public_key: String,
    },
    /// Responder's answer: the head-unit's stable id plus its ephemeral
    /// key.
    UnitHello { unit_id: Uuid, public_key: String },
    /// Verification code sealed with the out-of-band material.
    OobVerification { ciphertext: String },
    /// Responder's confirmation tag ending an association.
    Confirmation { tag: String },
    /// Initiator's proof of the previous key (reconnect).
    ResumeAuth { tag: String },
    /// Responder's proof of the previous key (reconnect).
    ServerAuth { tag: String },
}

fn encode_message(message: &HandshakeMessage) -> Vec<u8> {
    serde_json::to_vec(message).expect("handshake message serializes")
}

fn decode_message(payload: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
    if payload.is_empty() {
        return Err(HandshakeError::InvalidMessage);
    }
    serde_json::from_slice(payload).map_err(|_| HandshakeError::InvalidHandshake)
}

fn encode_key(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_key_32(encoded: &str) -> Result<[u8; 32], HandshakeError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| HandshakeError::InvalidHandshake)?;
    bytes
        .try_into()
        .map_err(|_| HandshakeError::InvalidHandshake)
}

// ═══════════════════════════════════════════════════════════
// Inputs, actions, states
// ═══════════════════════════════════════════════════════════

/// What the session actor feeds into the engine.
#[derive(Debug)]
pub enum HandshakeInput {
    /// Payload of an inbound encryption-handshake frame.
    Frame(Vec<u8>),
    /// External confirmation that the displayed codes match.
    ConfirmVerification,
    /// Result of the stored-key lookup requested by `RequireStoredKey`.
    StoredKey(Option<[u8; KEY_LENGTH]>),
}

/// What the session actor must do, in order. `PersistKey` must complete
/// successfully before any action after it is executed.
#[derive(Debug)]
pub enum HandshakeAction {
    SendFrame(Vec<u8>),
    DeviceIdKnown {
        device_id: Uuid,
        friendly_name: String,
        reconnect: bool,
    },
    RequireStoredKey {
        device_id: Uuid,
    },
    DisplayVerificationCode {
        code: String,
    },
    PersistKey {
        device_id: Uuid,
        friendly_name: String,
        key: [u8; KEY_LENGTH],
    },
    Established {
        device_id: Uuid,
        key: [u8; KEY_LENGTH],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unknown,
    InProgress,
    VerificationNeeded,
    ResumingSession,
    Finished,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeRole {
    Initiator,
    Responder,
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

pub struct HandshakeEngine {
    role: HandshakeRole,
    state: HandshakeState,
    reconnect: bool,
    /// Head-unit id (responder) or the initiator's advertised id.
    local_id: Uuid,
    local_name: String,
    /// The paired-device identity this session settles on.
    pair_id: Option<Uuid>,
    peer_name: Option<String>,
    secret: StaticSecret,
    shared: Option<Zeroizing<[u8; 32]>>,
    previous_key: Option<Zeroizing<[u8; KEY_LENGTH]>>,
    verification_code: Option<String>,
    oob: Option<OobCipher>,
    local_confirmed: bool,
    peer_confirmed: bool,
}

impl HandshakeEngine {
    /// Head-unit side: answers whatever the phone opens with.
    pub fn responder(unit_id: Uuid) -> Self {
        Self::new(HandshakeRole::Responder, unit_id, String::new(), false)
    }

    /// Phone side of an association (also exercised by the test peers).
    pub fn initiator(device_id: Uuid, friendly_name: impl Into<String>) -> Self {
        let mut engine = Self::new(
            HandshakeRole::Initiator,
            device_id,
            friendly_name.into(),
            false,
        );
        engine.pair_id = Some(device_id);
        engine
    }

    /// Reconnect initiator holding the previous key for the target
    /// device.
    pub fn initiator_reconnect(
        device_id: Uuid,
        friendly_name: impl Into<String>,
        previous_key: [u8; KEY_LENGTH],
    ) -> Self {
        let mut engine = Self::new(
            HandshakeRole::Initiator,
            device_id,
            friendly_name.into(),
            true,
        );
        engine.pair_id = Some(device_id);
        engine.previous_key = Some(Zeroizing::new(previous_key));
        engine
    }

    fn new(role: HandshakeRole, local_id: Uuid, local_name: String, reconnect: bool) -> Self {
        Self {
            role,
            state: HandshakeState::Unknown,
            reconnect,
            local_id,
            local_name,
            pair_id: None,
            peer_name: None,
            secret: StaticSecret::random_from_rng(rand::thread_rng()),
            shared: None,
            previous_key: None,
            verification_code: None,
            oob: None,
            local_confirmed: false,
            peer_confirmed: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    pub fn pair_id(&self) -> Option<Uuid> {
        self.pair_id
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn verification_code(&self) -> Option<&str> {
        self.verification_code.as_deref()
    }

    /// Attach out-of-band material. Must happen before the engine reaches
    /// `VerificationNeeded`; late material is ignored.
    pub fn set_oob(&mut self, cipher: OobCipher) {
        match self.state {
            HandshakeState::Unknown | HandshakeState::InProgress => self.oob = Some(cipher),
            _ => {
                tracing::debug!("Ignoring out-of-band material after verification started");
            }
        }
    }

    /// Kick off the handshake. The initiator opens with `Hello`; the
    /// responder waits.
    pub fn start(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state != HandshakeState::Unknown {
            return Err(self.fail(HandshakeError::InvalidState));
        }
        match self.role {
            HandshakeRole::Responder => Ok(Vec::new()),
            HandshakeRole::Initiator => {
                self.state = HandshakeState::InProgress;
                let hello = HandshakeMessage::Hello {
                    device_id: self.local_id,
                    friendly_name: self.local_name.clone(),
                    reconnect: self.reconnect,
                    public_key: encode_key(PublicKey::from(&self.secret).as_bytes()),
                };
                Ok(vec![HandshakeAction::SendFrame(encode_message(&hello))])
            }
        }
    }

    /// Feed one input and collect the resulting actions. Errors are
    /// terminal: the engine flips to `Invalid` and stays there.
    pub fn advance(
        &mut self,
        input: HandshakeInput,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state == HandshakeState::Invalid {
            return Err(HandshakeError::InvalidState);
        }
        match self.advance_inner(input) {
            Ok(actions) => Ok(actions),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeError {
        self.state = HandshakeState::Invalid;
        self.shared = None;
        error
    }

    fn advance_inner(
        &mut self,
        input: HandshakeInput,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match input {
            HandshakeInput::Frame(payload) => {
                if self.state == HandshakeState::Finished {
                    return Err(HandshakeError::InvalidState);
                }
                let message = decode_message(&payload)?;
                self.on_message(message)
            }
            HandshakeInput::ConfirmVerification => self.on_confirm(),
            HandshakeInput::StoredKey(key) => self.on_stored_key(key),
        }
    }

    fn on_message(
        &mut self,
        message: HandshakeMessage,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match message {
            HandshakeMessage::Hello {
                device_id,
                friendly_name,
                reconnect,
                public_key,
            } => self.on_hello(device_id, friendly_name, reconnect, &public_key),
            HandshakeMessage::UnitHello {
                unit_id,
                public_key,
            } => self.on_unit_hello(unit_id, &public_key),
            HandshakeMessage::OobVerification { ciphertext } => self.on_oob_code(&ciphertext),
            HandshakeMessage::Confirmation { tag } => self.on_confirmation(&tag),
            HandshakeMessage::ResumeAuth { tag } => self.on_resume_auth(&tag),
            HandshakeMessage::ServerAuth { tag } => self.on_server_auth(&tag),
        }
    }

    // ── Responder path ───────────────────────────────────────

    fn on_hello(
        &mut self,
        device_id: Uuid,
        friendly_name: String,
        reconnect: bool,
        public_key: &str,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Responder {
            return Err(HandshakeError::InvalidState);
        }
        if self.state != HandshakeState::Unknown || self.pair_id.is_some() {
            // A device id may arrive exactly once per session.
            return Err(HandshakeError::InvalidDeviceId);
        }
        let peer_public = PublicKey::from(decode_key_32(public_key)?);
        self.adopt_shared(&peer_public);
        self.pair_id = Some(device_id);
        self.peer_name = Some(friendly_name.clone());
        self.reconnect = reconnect;

        let mut actions = vec![
            HandshakeAction::DeviceIdKnown {
                device_id,
                friendly_name,
                reconnect,
            },
            HandshakeAction::SendFrame(encode_message(&HandshakeMessage::UnitHello {
                unit_id: self.local_id,
                public_key: encode_key(PublicKey::from(&self.secret).as_bytes()),
            })),
        ];

        if reconnect {
            self.state = HandshakeState::InProgress;
            actions.push(HandshakeAction::RequireStoredKey { device_id });
        } else {
            self.enter_verification(&mut actions)?;
        }
        Ok(actions)
    }

    fn on_stored_key(
        &mut self,
        key: Option<[u8; KEY_LENGTH]>,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Responder
            || self.state != HandshakeState::InProgress
            || !self.reconnect
        {
            return Err(HandshakeError::InvalidState);
        }
        let key = key.ok_or(HandshakeError::InvalidEncryptionKey)?;
        self.previous_key = Some(Zeroizing::new(key));
        self.state = HandshakeState::ResumingSession;
        Ok(Vec::new())
    }

    fn on_resume_auth(&mut self, tag: &str) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Responder
            || self.state != HandshakeState::ResumingSession
        {
            return Err(HandshakeError::InvalidState);
        }
        let received = decode_key_32(tag)?;
        let expected = self.resume_tag(CLIENT_AUTH_INFO)?;
        if expected.ct_eq(&received).unwrap_u8() == 0 {
            return Err(HandshakeError::InvalidVerification);
        }

        let key = self.derive_session_key()?;
        let device_id = self.pair_id.ok_or(HandshakeError::InvalidDeviceId)?;
        let server_tag = self.resume_tag(SERVER_AUTH_INFO)?;
        self.state = HandshakeState::Finished;
        Ok(vec![
            HandshakeAction::PersistKey {
                device_id,
                friendly_name: self.peer_name.clone().unwrap_or_default(),
                key,
            },
            HandshakeAction::SendFrame(encode_message(&HandshakeMessage::ServerAuth {
                tag: encode_key(&server_tag),
            })),
            HandshakeAction::Established { device_id, key },
        ])
    }

    // ── Initiator path ───────────────────────────────────────

    fn on_unit_hello(
        &mut self,
        unit_id: Uuid,
        public_key: &str,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Initiator || self.state != HandshakeState::InProgress {
            return Err(HandshakeError::InvalidState);
        }
        let peer_public = PublicKey::from(decode_key_32(public_key)?);
        self.adopt_shared(&peer_public);
        self.peer_name = Some(unit_id.to_string());

        if self.reconnect {
            let tag = self.resume_tag(CLIENT_AUTH_INFO)?;
            self.state = HandshakeState::ResumingSession;
            return Ok(vec![HandshakeAction::SendFrame(encode_message(
                &HandshakeMessage::ResumeAuth {
                    tag: encode_key(&tag),
                },
            ))]);
        }

        let mut actions = Vec::new();
        self.enter_verification(&mut actions)?;
        Ok(actions)
    }

    fn on_server_auth(&mut self, tag: &str) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Initiator
            || self.state != HandshakeState::ResumingSession
        {
            return Err(HandshakeError::InvalidState);
        }
        let received = decode_key_32(tag)?;
        let expected = self.resume_tag(SERVER_AUTH_INFO)?;
        if expected.ct_eq(&received).unwrap_u8() == 0 {
            return Err(HandshakeError::InvalidVerification);
        }

        let key = self.derive_session_key()?;
        let device_id = self.pair_id.ok_or(HandshakeError::InvalidDeviceId)?;
        self.state = HandshakeState::Finished;
        Ok(vec![
            HandshakeAction::PersistKey {
                device_id,
                friendly_name: self.local_name.clone(),
                key,
            },
            HandshakeAction::Established { device_id, key },
        ])
    }

    fn on_confirmation(&mut self, tag: &str) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Initiator
            || self.state != HandshakeState::VerificationNeeded
        {
            return Err(HandshakeError::InvalidState);
        }
        let received = decode_key_32(tag)?;
        let expected = self.confirmation_tag()?;
        if expected.ct_eq(&received).unwrap_u8() == 0 {
            return Err(HandshakeError::InvalidVerification);
        }
        self.peer_confirmed = true;
        self.try_finish_association()
    }

    // ── Shared verification path ─────────────────────────────

    fn enter_verification(
        &mut self,
        actions: &mut Vec<HandshakeAction>,
    ) -> Result<(), HandshakeError> {
        let code = self.derive_verification_code()?;
        self.verification_code = Some(code.clone());
        self.state = HandshakeState::VerificationNeeded;

        match (&self.oob, self.role) {
            // Out-of-band: the initiator sends its sealed code; the
            // responder waits to check it.
            (Some(oob), HandshakeRole::Initiator) => {
                let sealed = oob
                    .encrypt_verification(code.as_bytes())
                    .map_err(|_| HandshakeError::InvalidVerification)?;
                self.local_confirmed = true;
                actions.push(HandshakeAction::SendFrame(encode_message(
                    &HandshakeMessage::OobVerification {
                        ciphertext: encode_key(&sealed),
                    },
                )));
            }
            (Some(_), HandshakeRole::Responder) => {}
            // Manual: surface the code and wait for the confirmation
            // signal.
            (None, _) => {
                actions.push(HandshakeAction::DisplayVerificationCode { code });
            }
        }
        Ok(())
    }

    fn on_confirm(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state != HandshakeState::VerificationNeeded {
            return Err(HandshakeError::InvalidState);
        }
        self.local_confirmed = true;
        match self.role {
            HandshakeRole::Responder => self.finish_association_responder(),
            HandshakeRole::Initiator => self.try_finish_association(),
        }
    }

    fn on_oob_code(&mut self, ciphertext: &str) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != HandshakeRole::Responder
            || self.state != HandshakeState::VerificationNeeded
        {
            return Err(HandshakeError::InvalidState);
        }
        let oob = self
            .oob
            .as_ref()
            .ok_or(HandshakeError::InvalidVerification)?;
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|_| HandshakeError::InvalidHandshake)?;
        let peer_code = oob
            .decrypt_verification(&sealed)
            .map_err(|_| HandshakeError::InvalidVerification)?;
        let ours = self
            .verification_code
            .as_ref()
            .ok_or(HandshakeError::InvalidState)?;
        if ours.as_bytes().ct_eq(&peer_code).unwrap_u8() == 0 {
            return Err(HandshakeError::InvalidVerification);
        }
        self.local_confirmed = true;
        self.finish_association_responder()
    }

    fn finish_association_responder(
        &mut self,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let key = self.derive_session_key()?;
        let tag = self.confirmation_tag()?;
        let device_id = self.pair_id.ok_or(HandshakeError::InvalidDeviceId)?;
        self.state = HandshakeState::Finished;
        Ok(vec![
            HandshakeAction::PersistKey {
                device_id,
                friendly_name: self.peer_name.clone().unwrap_or_default(),
                key,
            },
            HandshakeAction::SendFrame(encode_message(&HandshakeMessage::Confirmation {
                tag: encode_key(&tag),
            })),
            HandshakeAction::Established { device_id, key },
        ])
    }

    fn try_finish_association(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if !(self.local_confirmed && self.peer_confirmed) {
            return Ok(Vec::new());
        }
        let key = self.derive_session_key()?;
        let device_id = self.pair_id.ok_or(HandshakeError::InvalidDeviceId)?;
        self.state = HandshakeState::Finished;
        Ok(vec![
            HandshakeAction::PersistKey {
                device_id,
                friendly_name: self.local_name.clone(),
                key,
            },
            HandshakeAction::Established { device_id, key },
        ])
    }

    // ── Key derivation ───────────────────────────────────────

    fn adopt_shared(&mut self, peer_public: &PublicKey) {
        let shared = self.secret.diffie_hellman(peer_public);
        self.shared = Some(Zeroizing::new(*shared.as_bytes()));
    }

    fn shared(&self) -> Result<&[u8; 32], HandshakeError> {
        self.shared
            .as_deref()
            .ok_or(HandshakeError::InvalidState)
    }

    fn derive_verification_code(&self) -> Result<String, HandshakeError> {
        let mut bytes = [0u8; 4];
        self.expand(ASSOCIATION_SALT, VERIFICATION_INFO, &mut bytes)?;
        let code = u32::from_be_bytes(bytes) % 1_000_000;
        Ok(format!("{code:06}"))
    }

    fn confirmation_tag(&self) -> Result<[u8; 32], HandshakeError> {
        let mut tag = [0u8; 32];
        self.expand(ASSOCIATION_SALT, CONFIRMATION_INFO, &mut tag)?;
        Ok(tag)
    }

    fn resume_tag(&self, info: &[u8]) -> Result<[u8; 32], HandshakeError> {
        let previous = self
            .previous_key
            .as_ref()
            .ok_or(HandshakeError::InvalidEncryptionKey)?;
        let mut tag = [0u8; 32];
        self.expand(&previous[..], info, &mut tag)?;
        Ok(tag)
    }

    /// Association mixes the fresh agreement alone; reconnect salts it
    /// with the previous key, which is what makes the rotated key both new
    /// and bound to the old pairing.
    fn derive_session_key(&self) -> Result<[u8; KEY_LENGTH], HandshakeError> {
        let salt: &[u8] = match &self.previous_key {
            Some(previous) if self.reconnect => &previous[..],
            _ => ASSOCIATION_SALT,
        };
        let mut key = [0u8; KEY_LENGTH];
        self.expand(salt, SESSION_KEY_INFO, &mut key)?;
        Ok(key)
    }

    fn expand(&self, salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), HandshakeError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.shared()?);
        hk.expand(info, out)
            .map_err(|_| HandshakeError::InvalidHandshake)
    }
}

impl std::fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("reconnect", &self.reconnect)
            .field("pair_id", &self.pair_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(actions: &[HandshakeAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                HandshakeAction::SendFrame(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn established_key(actions: &[HandshakeAction]) -> Option<[u8; KEY_LENGTH]> {
        actions.iter().find_map(|action| match action {
            HandshakeAction::Established { key, .. } => Some(*key),
            _ => None,
        })
    }

    fn persisted_key(actions: &[HandshakeAction]) -> Option<[u8; KEY_LENGTH]> {
        actions.iter().find_map(|action| match action {
            HandshakeAction::PersistKey { key, .. } => Some(*key),
            _ => None,
        })
    }

    fn feed(
        engine: &mut HandshakeEngine,
        frames_in: Vec<Vec<u8>>,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let mut out = Vec::new();
        for frame in frames_in {
            out.extend(engine.advance(HandshakeInput::Frame(frame))?);
        }
        Ok(out)
    }

    /// Run association up to `VerificationNeeded` on both sides.
    fn associate_to_verification(
        phone: &mut HandshakeEngine,
        unit: &mut HandshakeEngine,
    ) -> (Vec<HandshakeAction>, Vec<HandshakeAction>) {
        let hello = phone.start().unwrap();
        let unit_actions = feed(unit, frames(&hello)).unwrap();
        let phone_actions = feed(phone, frames(&unit_actions)).unwrap();
        (phone_actions, unit_actions)
    }

    // ── Association ──────────────────────────────────────────

    #[test]
    fn association_reaches_verification_with_matching_codes() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Aiko's Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        assert_eq!(phone.state(), HandshakeState::VerificationNeeded);
        assert_eq!(unit.state(), HandshakeState::VerificationNeeded);
        let code = phone.verification_code().unwrap();
        assert_eq!(code, unit.verification_code().unwrap());
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn association_emits_device_id_known_with_name() {
        let device_id = Uuid::new_v4();
        let mut phone = HandshakeEngine::initiator(device_id, "Aiko's Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        let hello = phone.start().unwrap();
        let actions = feed(&mut unit, frames(&hello)).unwrap();

        assert!(actions.iter().any(|action| matches!(
            action,
            HandshakeAction::DeviceIdKnown { device_id: id, friendly_name, reconnect: false }
                if *id == device_id && friendly_name == "Aiko's Phone"
        )));
    }

    #[test]
    fn association_completes_after_both_confirmations() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        // Head-unit user confirms first: key persisted, confirmation sent.
        let unit_done = unit.advance(HandshakeInput::ConfirmVerification).unwrap();
        assert_eq!(unit.state(), HandshakeState::Finished);
        let unit_key = established_key(&unit_done).unwrap();
        assert_eq!(persisted_key(&unit_done), Some(unit_key));

        // Phone receives the confirmation, then its user confirms.
        let phone_pending = feed(&mut phone, frames(&unit_done)).unwrap();
        assert!(established_key(&phone_pending).is_none());
        let phone_done = phone.advance(HandshakeInput::ConfirmVerification).unwrap();
        assert_eq!(phone.state(), HandshakeState::Finished);
        assert_eq!(established_key(&phone_done), Some(unit_key));
    }

    #[test]
    fn confirmation_order_does_not_matter() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        // Phone user confirms before the unit's confirmation arrives.
        let early = phone.advance(HandshakeInput::ConfirmVerification).unwrap();
        assert!(early.is_empty());
        assert_eq!(phone.state(), HandshakeState::VerificationNeeded);

        let unit_done = unit.advance(HandshakeInput::ConfirmVerification).unwrap();
        let phone_done = feed(&mut phone, frames(&unit_done)).unwrap();
        assert_eq!(phone.state(), HandshakeState::Finished);
        assert!(established_key(&phone_done).is_some());
    }

    #[test]
    fn persist_precedes_established_and_confirmation() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        let actions = unit.advance(HandshakeInput::ConfirmVerification).unwrap();
        let persist_at = actions
            .iter()
            .position(|a| matches!(a, HandshakeAction::PersistKey { .. }))
            .unwrap();
        let send_at = actions
            .iter()
            .position(|a| matches!(a, HandshakeAction::SendFrame(_)))
            .unwrap();
        let established_at = actions
            .iter()
            .position(|a| matches!(a, HandshakeAction::Established { .. }))
            .unwrap();
        assert!(persist_at < send_at);
        assert!(send_at < established_at);
    }

    #[test]
    fn duplicate_hello_fails_with_invalid_device_id() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        let hello = phone.start().unwrap();
        let hello_frames = frames(&hello);
        feed(&mut unit, hello_frames.clone()).unwrap();

        let result = feed(&mut unit, hello_frames);
        assert!(matches!(result, Err(HandshakeError::InvalidDeviceId)));
        assert_eq!(unit.state(), HandshakeState::Invalid);
    }

    #[test]
    fn frame_after_finished_fails_with_invalid_state() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);
        let unit_done = unit.advance(HandshakeInput::ConfirmVerification).unwrap();

        let result = feed(&mut unit, frames(&unit_done));
        assert!(matches!(result, Err(HandshakeError::InvalidState)));
    }

    #[test]
    fn empty_frame_fails_with_invalid_message() {
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        unit.start().unwrap();
        let result = unit.advance(HandshakeInput::Frame(Vec::new()));
        assert!(matches!(result, Err(HandshakeError::InvalidMessage)));
    }

    #[test]
    fn garbage_frame_fails_with_invalid_handshake() {
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        unit.start().unwrap();
        let result = unit.advance(HandshakeInput::Frame(b"not json".to_vec()));
        assert!(matches!(result, Err(HandshakeError::InvalidHandshake)));
    }

    #[test]
    fn engine_stays_invalid_after_failure() {
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        unit.start().unwrap();
        let _ = unit.advance(HandshakeInput::Frame(Vec::new()));
        let result = unit.advance(HandshakeInput::ConfirmVerification);
        assert!(matches!(result, Err(HandshakeError::InvalidState)));
    }

    #[test]
    fn forged_confirmation_tag_is_rejected() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);
        phone.advance(HandshakeInput::ConfirmVerification).unwrap();

        let forged = encode_message(&HandshakeMessage::Confirmation {
            tag: encode_key(&[0u8; 32]),
        });
        let result = phone.advance(HandshakeInput::Frame(forged));
        assert!(matches!(result, Err(HandshakeError::InvalidVerification)));
    }

    // ── Reconnect ────────────────────────────────────────────

    fn run_reconnect(
        previous_phone: [u8; KEY_LENGTH],
        previous_unit: Option<[u8; KEY_LENGTH]>,
    ) -> (
        Result<Vec<HandshakeAction>, HandshakeError>,
        HandshakeEngine,
        HandshakeEngine,
    ) {
        let device_id = Uuid::new_v4();
        let mut phone =
            HandshakeEngine::initiator_reconnect(device_id, "Phone", previous_phone);
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());

        let run = (|| {
            let hello = phone.start()?;
            let mut unit_actions = feed(&mut unit, frames(&hello))?;
            if unit_actions
                .iter()
                .any(|a| matches!(a, HandshakeAction::RequireStoredKey { .. }))
            {
                unit_actions.extend(unit.advance(HandshakeInput::StoredKey(previous_unit))?);
            }
            let phone_actions = feed(&mut phone, frames(&unit_actions))?;
            let unit_final = feed(&mut unit, frames(&phone_actions))?;
            let phone_final = feed(&mut phone, frames(&unit_final))?;
            let mut all = unit_final;
            all.extend(phone_final);
            Ok(all)
        })();
        (run, phone, unit)
    }

    #[test]
    fn reconnect_completes_and_rotates_key() {
        let old_key = [0x11u8; KEY_LENGTH];
        let (result, phone, unit) = run_reconnect(old_key, Some(old_key));
        let actions = result.unwrap();

        assert_eq!(phone.state(), HandshakeState::Finished);
        assert_eq!(unit.state(), HandshakeState::Finished);
        let new_key = persisted_key(&actions).unwrap();
        assert_ne!(new_key, old_key);
    }

    #[test]
    fn reconnect_derives_same_key_on_both_sides() {
        let old_key = [0x22u8; KEY_LENGTH];
        let device_id = Uuid::new_v4();
        let mut phone = HandshakeEngine::initiator_reconnect(device_id, "Phone", old_key);
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());

        let hello = phone.start().unwrap();
        let mut unit_actions = feed(&mut unit, frames(&hello)).unwrap();
        unit_actions.extend(unit.advance(HandshakeInput::StoredKey(Some(old_key))).unwrap());
        let phone_actions = feed(&mut phone, frames(&unit_actions)).unwrap();
        let unit_final = feed(&mut unit, frames(&phone_actions)).unwrap();
        let phone_final = feed(&mut phone, frames(&unit_final)).unwrap();

        assert_eq!(
            established_key(&unit_final).unwrap(),
            established_key(&phone_final).unwrap()
        );
    }

    #[test]
    fn reconnect_without_stored_key_fails() {
        let (result, _phone, unit) = run_reconnect([0x33u8; KEY_LENGTH], None);
        assert!(matches!(result, Err(HandshakeError::InvalidEncryptionKey)));
        assert_eq!(unit.state(), HandshakeState::Invalid);
    }

    #[test]
    fn reconnect_with_mismatched_keys_fails_verification() {
        let (result, _phone, unit) =
            run_reconnect([0x44u8; KEY_LENGTH], Some([0x55u8; KEY_LENGTH]));
        assert!(matches!(result, Err(HandshakeError::InvalidVerification)));
        assert_eq!(unit.state(), HandshakeState::Invalid);
    }

    #[test]
    fn two_reconnects_produce_distinct_keys() {
        let old_key = [0x66u8; KEY_LENGTH];
        let (first, _, _) = run_reconnect(old_key, Some(old_key));
        let (second, _, _) = run_reconnect(old_key, Some(old_key));
        // Fresh ephemerals each time: rotation never repeats.
        assert_ne!(
            persisted_key(&first.unwrap()).unwrap(),
            persisted_key(&second.unwrap()).unwrap()
        );
    }

    // ── Out-of-band ──────────────────────────────────────────

    fn oob_pair() -> (OobCipher, OobCipher) {
        use crate::oob::{OobMaterial, OobRole};
        let raw = OobMaterial::generate_raw();
        (
            OobCipher::new(OobMaterial::split(&raw, OobRole::Client).unwrap()),
            OobCipher::new(OobMaterial::split(&raw, OobRole::Server).unwrap()),
        )
    }

    #[test]
    fn oob_association_auto_confirms() {
        let (phone_oob, unit_oob) = oob_pair();
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        phone.set_oob(phone_oob);
        unit.set_oob(unit_oob);

        let hello = phone.start().unwrap();
        let unit_actions = feed(&mut unit, frames(&hello)).unwrap();
        // Phone seals its code without showing it to anyone.
        let phone_actions = feed(&mut phone, frames(&unit_actions)).unwrap();
        assert!(!phone_actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::DisplayVerificationCode { .. })));

        // The sealed code auto-confirms the unit, which finishes and
        // confirms the phone in turn.
        let unit_done = feed(&mut unit, frames(&phone_actions)).unwrap();
        assert_eq!(unit.state(), HandshakeState::Finished);
        let phone_done = feed(&mut phone, frames(&unit_done)).unwrap();
        assert_eq!(phone.state(), HandshakeState::Finished);
        assert_eq!(
            established_key(&unit_done).unwrap(),
            established_key(&phone_done).unwrap()
        );
    }

    #[test]
    fn oob_with_mismatched_material_fails() {
        let (phone_oob, _) = oob_pair();
        let (_, unit_oob) = oob_pair();
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        phone.set_oob(phone_oob);
        unit.set_oob(unit_oob);

        let hello = phone.start().unwrap();
        let unit_actions = feed(&mut unit, frames(&hello)).unwrap();
        let phone_actions = feed(&mut phone, frames(&unit_actions)).unwrap();
        let result = feed(&mut unit, frames(&phone_actions));
        assert!(matches!(result, Err(HandshakeError::InvalidVerification)));
    }

    #[test]
    fn late_oob_material_is_ignored() {
        let (phone_oob, unit_oob) = oob_pair();
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        // Material arrives after VerificationNeeded: both sides stay on
        // the manual path.
        phone.set_oob(phone_oob);
        unit.set_oob(unit_oob);
        let actions = unit.advance(HandshakeInput::ConfirmVerification).unwrap();
        assert!(established_key(&actions).is_some());
    }

    #[test]
    fn oob_frame_without_material_fails() {
        let mut phone = HandshakeEngine::initiator(Uuid::new_v4(), "Phone");
        let mut unit = HandshakeEngine::responder(Uuid::new_v4());
        associate_to_verification(&mut phone, &mut unit);

        let sealed = encode_message(&HandshakeMessage::OobVerification {
            ciphertext: encode_key(b"whatever"),
        });
        let result = unit.advance(HandshakeInput::Frame(sealed));
        assert!(matches!(result, Err(HandshakeError::InvalidVerification)));
    }
}
