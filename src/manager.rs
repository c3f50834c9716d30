//! Device connection manager — the public face of the stack.
//!
//! Tracks every live session, runs the central (scan) and peripheral
//! (advertise) accept loops side by side, demultiplexes inbound messages
//! by recipient id, and enforces the recipient blocklist. The radio driver
//! is injected as a [`TransportFactory`]; the manager itself holds no
//! process-wide state.
//!
//! Role coordination: a device may briefly hold one central and one
//! peripheral session. When both establish, the later one wins and the
//! earlier one is closed; callbacks only ever see the survivor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::callbacks::{CallbackSet, Executor, IdGenerator};
use crate::config::Config;
use crate::error::ErrorKind;
use crate::handshake::HandshakeEngine;
use crate::oob::{OobChannel, OobCipher, OobError, OobRole};
use crate::secure_channel::{ChannelEvent, ChannelHandle, SecureChannel, SessionEvent};
use crate::store::{KeyStore, PairedDeviceRecord, StoreError};
use crate::transport::{ConnectionRole, Transport, TransportError, TransportFactory};

/// Session event channel depth across all sessions.
const EVENT_DEPTH: usize = 64;

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Errors from manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Manager is not running")]
    NotRunning,
    #[error("Manager already running")]
    AlreadyRunning,
    #[error("Device not connected: {0}")]
    DeviceNotConnected(Uuid),
    #[error("Secure channel not established")]
    NotEstablished,
    #[error("Recipient id blocklisted: {0}")]
    InsecureRecipientId(Uuid),
    #[error("No active-user device is paired")]
    NoActiveUserDevice,
    #[error("A reconnect attempt is already in progress")]
    ConnectInProgress,
    #[error("An association is already in progress")]
    AssociationActive,
    #[error("No association in progress")]
    NoAssociation,
    #[error("Out-of-band exchange failed: {0}")]
    Oob(#[from] OobError),
    #[error("Connect failed: {0}")]
    Connect(#[from] TransportError),
    #[error("Key store error: {0}")]
    Store(#[from] StoreError),
    #[error("Channel error: {0}")]
    Channel(ErrorKind),
}

// ═══════════════════════════════════════════════════════════
// Public callback surfaces
// ═══════════════════════════════════════════════════════════

/// Which devices a connection callback wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackScope {
    ActiveUser,
    All,
}

/// Immutable snapshot of a connected device, regenerated on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub device_id: Uuid,
    pub friendly_name: String,
    pub belongs_to_active_user: bool,
    pub has_secure_channel: bool,
}

/// Connection lifecycle notifications.
pub trait ConnectionCallback: Send + Sync {
    fn on_device_connected(&self, device: &ConnectedDevice);
    fn on_device_disconnected(&self, device: &ConnectedDevice);
}

/// Per-recipient notifications for one device.
pub trait DeviceCallback: Send + Sync {
    fn on_secure_channel_established(&self, device: &ConnectedDevice);
    fn on_message_received(&self, device: &ConnectedDevice, recipient: Uuid, payload: &[u8]);
    fn on_device_error(&self, device: &ConnectedDevice, kind: ErrorKind);
}

/// Association progress notifications.
pub trait AssociationCallback: Send + Sync {
    fn on_verification_code(&self, code: &str);
    fn on_association_completed(&self, device: &ConnectedDevice);
    fn on_association_error(&self, kind: ErrorKind);
}

// ═══════════════════════════════════════════════════════════
// Internal state
// ═══════════════════════════════════════════════════════════

struct SessionEntry {
    handle: ChannelHandle,
    role: ConnectionRole,
    device_id: Option<Uuid>,
    friendly_name: String,
    active_user: bool,
    established: bool,
    is_association: bool,
    task: tokio::task::JoinHandle<()>,
}

impl SessionEntry {
    fn snapshot(&self) -> Option<ConnectedDevice> {
        self.device_id.map(|device_id| ConnectedDevice {
            device_id,
            friendly_name: self.friendly_name.clone(),
            belongs_to_active_user: self.active_user,
            has_secure_channel: self.established,
        })
    }
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<u64, SessionEntry>,
    by_device: HashMap<Uuid, u64>,
}

struct DeviceCallbackEntry {
    id: u64,
    callback: Arc<dyn DeviceCallback>,
    executor: Executor,
}

struct AssociationState {
    callback: Arc<dyn AssociationCallback>,
    executor: Executor,
    /// One-shot: taken by the first association session.
    oob: Option<OobCipher>,
    session_id: Option<u64>,
}

enum SessionMode {
    /// Wait for the phone's opener (association or phone-initiated
    /// reconnect).
    Responder,
    /// Dial out and resume a stored pairing.
    Reconnect(PairedDeviceRecord),
}

struct Inner {
    config: Config,
    store: Arc<KeyStore>,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<ManagerState>,
    /// Connection callbacks, one set per scope, sharing `callback_ids`.
    connection_active: CallbackSet<dyn ConnectionCallback>,
    connection_all: CallbackSet<dyn ConnectionCallback>,
    device_callbacks: Mutex<HashMap<(Uuid, Uuid), Vec<DeviceCallbackEntry>>>,
    /// Append-only for the life of the process.
    blocklist: Mutex<HashSet<Uuid>>,
    callback_ids: Arc<IdGenerator>,
    session_ids: IdGenerator,
    association: Mutex<Option<AssociationState>>,
    /// Session id of the single in-flight targeted reconnect.
    connecting: Mutex<Option<u64>>,
    running: AtomicBool,
    event_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

// ═══════════════════════════════════════════════════════════
// DeviceConnectionManager
// ═══════════════════════════════════════════════════════════

/// The singleton entry point, configured once at startup.
pub struct DeviceConnectionManager {
    inner: Arc<Inner>,
}

impl DeviceConnectionManager {
    pub fn new(
        config: Config,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ManagerError> {
        let store = Arc::new(KeyStore::open(&config.storage_dir)?);
        let callback_ids = Arc::new(IdGenerator::new());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                factory,
                state: Mutex::new(ManagerState::default()),
                connection_active: CallbackSet::with_generator(callback_ids.clone()),
                connection_all: CallbackSet::with_generator(callback_ids.clone()),
                device_callbacks: Mutex::new(HashMap::new()),
                blocklist: Mutex::new(HashSet::new()),
                callback_ids,
                session_ids: IdGenerator::new(),
                association: Mutex::new(None),
                connecting: Mutex::new(None),
                running: AtomicBool::new(false),
                event_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The head-unit's stable id, generated on first use.
    pub fn unit_id(&self) -> Result<Uuid, ManagerError> {
        Ok(self.inner.store.unit_id()?)
    }

    /// Direct access to the paired-device store.
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.inner.store
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Begin advertising (peripheral) and scanning (central)
    /// concurrently.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyRunning);
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_DEPTH);
        *self.inner.event_tx.lock().expect("event lock poisoned") = Some(event_tx);

        let pump = tokio::spawn(event_pump(self.inner.clone(), event_rx));
        let advertise = tokio::spawn(accept_loop(self.inner.clone(), ConnectionRole::Peripheral));
        let scan = tokio::spawn(accept_loop(self.inner.clone(), ConnectionRole::Central));
        let mut tasks = self.inner.tasks.lock().expect("task lock poisoned");
        tasks.push(pump);
        tasks.push(advertise);
        tasks.push(scan);
        tracing::info!("Connection manager started");
        Ok(())
    }

    /// Cancel both accept loops and close every open session.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
            .collect();
        let handles: Vec<ChannelHandle> = {
            let state = self.inner.state.lock().expect("state lock poisoned");
            state.sessions.values().map(|e| e.handle.clone()).collect()
        };
        for handle in handles {
            handle.close().await;
        }
        // Give the actors a beat, then tear everything down.
        tokio::task::yield_now().await;
        for task in tasks {
            task.abort();
        }
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            for (session_id, entry) in state.sessions.drain() {
                entry.task.abort();
                self.inner.session_ids.release(session_id);
            }
            state.by_device.clear();
        }
        *self.inner.association.lock().expect("association lock poisoned") = None;
        *self.inner.connecting.lock().expect("connecting lock poisoned") = None;
        *self.inner.event_tx.lock().expect("event lock poisoned") = None;
        tracing::info!("Connection manager stopped");
    }

    // ── Queries ──────────────────────────────────────────────

    /// Snapshots of every identified connected device.
    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        let state = self.inner.state.lock().expect("state lock poisoned");
        state
            .sessions
            .values()
            .filter_map(|entry| entry.snapshot())
            .collect()
    }

    /// Connected devices that belong to the active user.
    pub fn connected_active_user_devices(&self) -> Vec<ConnectedDevice> {
        self.connected_devices()
            .into_iter()
            .filter(|device| device.belongs_to_active_user)
            .collect()
    }

    // ── Targeted reconnect ───────────────────────────────────

    /// Dial the first active-user device and resume its pairing. At most
    /// one such attempt runs at a time; the guard clears on success,
    /// failure, or disconnect.
    pub async fn connect_to_active_user_device(&self) -> Result<(), ManagerError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        {
            let mut connecting = self
                .inner
                .connecting
                .lock()
                .expect("connecting lock poisoned");
            if connecting.is_some() {
                return Err(ManagerError::ConnectInProgress);
            }
            // Placeholder until the dial resolves into a session.
            *connecting = Some(u64::MAX);
        }

        let record = match self.inner.store.active_user_devices().into_iter().next() {
            Some(record) => record,
            None => {
                self.inner.clear_connecting(u64::MAX);
                return Err(ManagerError::NoActiveUserDevice);
            }
        };

        match self.inner.factory.connect(&record.address).await {
            Ok(transport) => {
                let session_id = self.inner.spawn_session(
                    transport,
                    ConnectionRole::Central,
                    SessionMode::Reconnect(record),
                );
                let Some(session_id) = session_id else {
                    self.inner.clear_connecting(u64::MAX);
                    return Err(ManagerError::Channel(ErrorKind::InvalidEncryptionKey));
                };
                let mut connecting = self
                    .inner
                    .connecting
                    .lock()
                    .expect("connecting lock poisoned");
                *connecting = Some(session_id);
                Ok(())
            }
            Err(error) => {
                self.inner.clear_connecting(u64::MAX);
                tracing::warn!(device_id = %record.device_id, %error, "Reconnect dial failed");
                Err(error.into())
            }
        }
    }

    /// Close the session for one device.
    pub async fn disconnect_device(&self, device_id: Uuid) -> Result<(), ManagerError> {
        let handle = {
            let state = self.inner.state.lock().expect("state lock poisoned");
            state
                .sessions
                .values()
                .find(|entry| entry.device_id == Some(device_id))
                .map(|entry| entry.handle.clone())
        };
        match handle {
            Some(handle) => {
                handle.close().await;
                Ok(())
            }
            None => Err(ManagerError::DeviceNotConnected(device_id)),
        }
    }

    /// Forget a paired device entirely: close its session and remove its
    /// record.
    pub async fn remove_device(&self, device_id: Uuid) -> Result<(), ManagerError> {
        let _ = self.disconnect_device(device_id).await;
        self.inner.store.remove(&device_id)?;
        Ok(())
    }

    // ── Connection callbacks ─────────────────────────────────

    pub fn register_active_user_connection_callback(
        &self,
        callback: Arc<dyn ConnectionCallback>,
        executor: Executor,
    ) -> u64 {
        self.register_connection_callback(CallbackScope::ActiveUser, callback, executor)
    }

    pub fn register_all_users_connection_callback(
        &self,
        callback: Arc<dyn ConnectionCallback>,
        executor: Executor,
    ) -> u64 {
        self.register_connection_callback(CallbackScope::All, callback, executor)
    }

    pub fn register_connection_callback(
        &self,
        scope: CallbackScope,
        callback: Arc<dyn ConnectionCallback>,
        executor: Executor,
    ) -> u64 {
        match scope {
            CallbackScope::ActiveUser => self.inner.connection_active.register(callback, executor),
            CallbackScope::All => self.inner.connection_all.register(callback, executor),
        }
    }

    pub fn unregister_connection_callback(&self, id: u64) -> bool {
        self.inner.connection_active.unregister(id) || self.inner.connection_all.unregister(id)
    }

    // ── Device callbacks & the recipient blocklist ───────────

    /// Register for messages to `recipient` on `device`.
    ///
    /// A second registration for the same recipient id proves the id has
    /// leaked: the id joins the process-wide blocklist, every registration
    /// under it (old and new, any device) is notified once with
    /// `InsecureRecipientIdDetected` and removed, and nothing addressed to
    /// it is ever delivered again.
    pub fn register_device_callback(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        callback: Arc<dyn DeviceCallback>,
        executor: Executor,
    ) -> Result<u64, ManagerError> {
        let device = self.inner.device_snapshot(device_id);

        if self
            .inner
            .blocklist
            .lock()
            .expect("blocklist lock poisoned")
            .contains(&recipient)
        {
            let callback = callback.clone();
            let snapshot = device.clone();
            executor.execute(move || {
                callback.on_device_error(&snapshot, ErrorKind::InsecureRecipientIdDetected)
            });
            return Err(ManagerError::InsecureRecipientId(recipient));
        }

        let mut registry = self
            .inner
            .device_callbacks
            .lock()
            .expect("registry lock poisoned");
        let duplicate = registry
            .get(&(device_id, recipient))
            .map(|entries| !entries.is_empty())
            .unwrap_or(false);

        if duplicate {
            tracing::warn!(
                device_id = %device_id,
                recipient = %recipient,
                "Duplicate recipient registration — blocklisting id"
            );
            self.inner
                .blocklist
                .lock()
                .expect("blocklist lock poisoned")
                .insert(recipient);

            // Collect every registration under this recipient id, for any
            // device, plus the offending newcomer.
            let mut evicted: Vec<DeviceCallbackEntry> = Vec::new();
            let affected: Vec<(Uuid, Uuid)> = registry
                .keys()
                .filter(|(_, r)| *r == recipient)
                .copied()
                .collect();
            for key in affected {
                if let Some(entries) = registry.remove(&key) {
                    evicted.extend(entries);
                }
            }
            drop(registry);

            for entry in &evicted {
                self.inner.callback_ids.release(entry.id);
            }
            let snapshot = device.clone();
            for entry in evicted {
                let snapshot = snapshot.clone();
                let cb = entry.callback;
                entry.executor.execute(move || {
                    cb.on_device_error(&snapshot, ErrorKind::InsecureRecipientIdDetected)
                });
            }
            executor.execute(move || {
                callback.on_device_error(&device, ErrorKind::InsecureRecipientIdDetected)
            });
            return Err(ManagerError::InsecureRecipientId(recipient));
        }

        let id = self.inner.callback_ids.issue();
        registry
            .entry((device_id, recipient))
            .or_default()
            .push(DeviceCallbackEntry {
                id,
                callback,
                executor,
            });
        Ok(id)
    }

    pub fn unregister_device_callback(&self, id: u64) -> bool {
        let mut registry = self
            .inner
            .device_callbacks
            .lock()
            .expect("registry lock poisoned");
        let mut removed = false;
        registry.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= entries.len() < before;
            !entries.is_empty()
        });
        if removed {
            self.inner.callback_ids.release(id);
        }
        removed
    }

    // ── Messaging ────────────────────────────────────────────

    /// Send an encrypted message. Requires an established secure channel.
    pub async fn send_secure(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), ManagerError> {
        let handle = self.inner.established_handle(device_id)?;
        handle
            .send_secure(recipient, payload)
            .await
            .map_err(|kind| match kind {
                ErrorKind::NotEstablished => ManagerError::NotEstablished,
                other => ManagerError::Channel(other),
            })
    }

    /// Send an intentionally public message. Permitted as soon as the
    /// session's version exchange has completed.
    pub async fn send_unsecure(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), ManagerError> {
        let handle = {
            let state = self.inner.state.lock().expect("state lock poisoned");
            state
                .sessions
                .values()
                .find(|entry| entry.device_id == Some(device_id))
                .map(|entry| entry.handle.clone())
        };
        let handle = handle.ok_or(ManagerError::DeviceNotConnected(device_id))?;
        handle
            .send_unsecure(recipient, payload)
            .await
            .map_err(ManagerError::Channel)
    }

    // ── Association ──────────────────────────────────────────

    /// Enter association mode: the next phone that connects goes through
    /// the full pairing flow, reporting progress on `callback`.
    pub fn start_association(
        &self,
        callback: Arc<dyn AssociationCallback>,
        executor: Executor,
    ) -> Result<(), ManagerError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let mut association = self
            .inner
            .association
            .lock()
            .expect("association lock poisoned");
        if association.is_some() {
            return Err(ManagerError::AssociationActive);
        }
        *association = Some(AssociationState {
            callback,
            executor,
            oob: None,
            session_id: None,
        });
        tracing::info!("Association mode entered");
        Ok(())
    }

    /// Enter association mode with an out-of-band side channel. The
    /// exchange runs first (bounded by the configured deadline); the
    /// resulting cipher lets the handshake skip the on-screen code.
    pub async fn start_out_of_band_association(
        &self,
        channel: &dyn OobChannel,
        callback: Arc<dyn AssociationCallback>,
        executor: Executor,
    ) -> Result<(), ManagerError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let material = match tokio::time::timeout(
            self.inner.config.oob_timeout,
            channel.exchange(OobRole::Server),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                channel.interrupt();
                return Err(ManagerError::Oob(OobError::Cancelled));
            }
        };

        let mut association = self
            .inner
            .association
            .lock()
            .expect("association lock poisoned");
        if association.is_some() {
            return Err(ManagerError::AssociationActive);
        }
        *association = Some(AssociationState {
            callback,
            executor,
            oob: Some(OobCipher::new(material)),
            session_id: None,
        });
        tracing::info!("Out-of-band association mode entered");
        Ok(())
    }

    /// Leave association mode, closing an in-flight association session.
    pub async fn stop_association(&self) {
        let state = self
            .inner
            .association
            .lock()
            .expect("association lock poisoned")
            .take();
        if let Some(state) = state {
            if let Some(session_id) = state.session_id {
                let handle = {
                    let state = self.inner.state.lock().expect("state lock poisoned");
                    state.sessions.get(&session_id).map(|e| e.handle.clone())
                };
                if let Some(handle) = handle {
                    handle.close().await;
                }
            }
        }
    }

    /// Confirm the verification code shown for the in-flight association.
    pub async fn accept_verification(&self) -> Result<(), ManagerError> {
        let session_id = self
            .inner
            .association
            .lock()
            .expect("association lock poisoned")
            .as_ref()
            .and_then(|state| state.session_id)
            .ok_or(ManagerError::NoAssociation)?;
        let handle = {
            let state = self.inner.state.lock().expect("state lock poisoned");
            state.sessions.get(&session_id).map(|e| e.handle.clone())
        };
        if let Some(handle) = handle {
            handle.confirm_verification().await;
        }
        Ok(())
    }

    /// The out-of-band surface accepted the pairing; equivalent to a code
    /// confirmation.
    pub async fn notify_out_of_band_accepted(&self) -> Result<(), ManagerError> {
        self.accept_verification().await
    }
}

// ═══════════════════════════════════════════════════════════
// Inner helpers
// ═══════════════════════════════════════════════════════════

impl Inner {
    fn established_handle(&self, device_id: Uuid) -> Result<ChannelHandle, ManagerError> {
        let state = self.state.lock().expect("state lock poisoned");
        let session_id = state
            .by_device
            .get(&device_id)
            .copied()
            .ok_or(ManagerError::NotEstablished)?;
        let entry = state
            .sessions
            .get(&session_id)
            .ok_or(ManagerError::NotEstablished)?;
        if !entry.established {
            return Err(ManagerError::NotEstablished);
        }
        Ok(entry.handle.clone())
    }

    /// Best-effort snapshot for a device that may or may not be live.
    fn device_snapshot(&self, device_id: Uuid) -> ConnectedDevice {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if let Some(entry) = state
                .sessions
                .values()
                .find(|entry| entry.device_id == Some(device_id))
            {
                if let Some(snapshot) = entry.snapshot() {
                    return snapshot;
                }
            }
        }
        match self.store.load(&device_id) {
            Some(record) => ConnectedDevice {
                device_id,
                friendly_name: record.friendly_name,
                belongs_to_active_user: record.active_user,
                has_secure_channel: false,
            },
            None => ConnectedDevice {
                device_id,
                friendly_name: String::new(),
                belongs_to_active_user: false,
                has_secure_channel: false,
            },
        }
    }

    fn clear_connecting(&self, session_id: u64) {
        let mut connecting = self.connecting.lock().expect("connecting lock poisoned");
        if *connecting == Some(session_id) {
            *connecting = None;
        }
    }

    fn spawn_session(
        self: &Arc<Self>,
        transport: Transport,
        role: ConnectionRole,
        mode: SessionMode,
    ) -> Option<u64> {
        let event_tx = self.event_tx.lock().expect("event lock poisoned").clone()?;
        let session_id = self.session_ids.issue();

        let (engine, device_id, friendly_name, active_user, is_association) = match mode {
            SessionMode::Responder => {
                let unit_id = match self.store.unit_id() {
                    Ok(unit_id) => unit_id,
                    Err(error) => {
                        tracing::error!(%error, "Cannot load unit id — dropping connection");
                        self.session_ids.release(session_id);
                        return None;
                    }
                };
                let mut engine = HandshakeEngine::responder(unit_id);
                let mut is_association = false;
                {
                    let mut association =
                        self.association.lock().expect("association lock poisoned");
                    if let Some(state) = association.as_mut() {
                        if state.session_id.is_none() {
                            state.session_id = Some(session_id);
                            is_association = true;
                            if let Some(oob) = state.oob.take() {
                                engine.set_oob(oob);
                            }
                        }
                    }
                }
                (engine, None, String::new(), false, is_association)
            }
            SessionMode::Reconnect(record) => {
                let key: [u8; 32] = match record.encryption_key.clone().try_into() {
                    Ok(key) => key,
                    Err(_) => {
                        tracing::warn!(device_id = %record.device_id, "Stored key unusable");
                        self.session_ids.release(session_id);
                        return None;
                    }
                };
                let engine = HandshakeEngine::initiator_reconnect(
                    record.device_id,
                    record.friendly_name.clone(),
                    key,
                );
                (
                    engine,
                    Some(record.device_id),
                    record.friendly_name,
                    record.active_user,
                    false,
                )
            }
        };

        let (channel, handle) = SecureChannel::new(
            session_id,
            transport,
            engine,
            self.store.clone(),
            self.config.handshake_timeout,
            event_tx,
        );
        let task = tokio::spawn(channel.run());

        let entry = SessionEntry {
            handle,
            role,
            device_id,
            friendly_name,
            active_user,
            established: false,
            is_association,
            task,
        };
        let snapshot = entry.snapshot();
        self.state
            .lock()
            .expect("state lock poisoned")
            .sessions
            .insert(session_id, entry);
        tracing::debug!(session = session_id, %role, "Session started");

        // Outbound reconnects know their device up front; inbound sessions
        // announce it at DeviceIdKnown.
        if let Some(snapshot) = snapshot {
            self.notify_connected(&snapshot);
        }
        Some(session_id)
    }

    fn notify_connected(&self, device: &ConnectedDevice) {
        let snapshot = device.clone();
        self.connection_all
            .invoke(move |callback| callback.on_device_connected(&snapshot));
        if device.belongs_to_active_user {
            let snapshot = device.clone();
            self.connection_active
                .invoke(move |callback| callback.on_device_connected(&snapshot));
        }
    }

    fn notify_disconnected(&self, device: &ConnectedDevice) {
        let snapshot = device.clone();
        self.connection_all
            .invoke(move |callback| callback.on_device_disconnected(&snapshot));
        if device.belongs_to_active_user {
            let snapshot = device.clone();
            self.connection_active
                .invoke(move |callback| callback.on_device_disconnected(&snapshot));
        }
    }

    fn invoke_device_callbacks<F>(&self, device_id: Uuid, invoke: F)
    where
        F: Fn(&dyn DeviceCallback, &ConnectedDevice, Uuid) + Send + Sync + Clone + 'static,
    {
        let snapshot = self.device_snapshot(device_id);
        let targets: Vec<(Arc<dyn DeviceCallback>, Executor, Uuid)> = {
            let registry = self.device_callbacks.lock().expect("registry lock poisoned");
            registry
                .iter()
                .filter(|((target, _), _)| *target == device_id)
                .flat_map(|((_, recipient), entries)| {
                    entries
                        .iter()
                        .map(|entry| (entry.callback.clone(), entry.executor.clone(), *recipient))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (callback, executor, recipient) in targets {
            let snapshot = snapshot.clone();
            let invoke = invoke.clone();
            executor.execute(move || invoke(&*callback, &snapshot, recipient));
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Accept loops and the event pump
// ═══════════════════════════════════════════════════════════

async fn accept_loop(inner: Arc<Inner>, role: ConnectionRole) {
    while inner.running.load(Ordering::SeqCst) {
        let accepted = match role {
            ConnectionRole::Peripheral => inner.factory.advertise().await,
            ConnectionRole::Central => inner.factory.scan().await,
        };
        let transport = match accepted {
            Ok(transport) => transport,
            Err(TransportError::Stopped) => break,
            Err(error) => {
                tracing::warn!(%role, %error, "Accept loop error");
                break;
            }
        };

        // A scanned device with a stored record resumes its pairing;
        // everything else waits for the phone to open.
        let mode = match role {
            ConnectionRole::Central => inner
                .store
                .all_devices()
                .into_iter()
                .find(|record| record.address == transport.address())
                .map(SessionMode::Reconnect)
                .unwrap_or(SessionMode::Responder),
            ConnectionRole::Peripheral => SessionMode::Responder,
        };
        let _ = inner.spawn_session(transport, role, mode);
    }
    tracing::debug!(%role, "Accept loop ended");
}

async fn event_pump(inner: Arc<Inner>, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(SessionEvent { session_id, event }) = events.recv().await {
        match event {
            ChannelEvent::DeviceIdKnown {
                device_id,
                friendly_name,
                reconnect,
            } => {
                let active_user = inner
                    .store
                    .load(&device_id)
                    .map(|record| record.active_user)
                    .unwrap_or(false);
                let (snapshot, role) = {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    let Some(entry) = state.sessions.get_mut(&session_id) else {
                        continue;
                    };
                    entry.device_id = Some(device_id);
                    entry.friendly_name = friendly_name;
                    entry.active_user = active_user;
                    (entry.snapshot(), entry.role)
                };
                tracing::info!(
                    session = session_id,
                    device_id = %device_id,
                    %role,
                    reconnect,
                    "Device identified"
                );
                if let Some(snapshot) = snapshot {
                    inner.notify_connected(&snapshot);
                }
            }

            ChannelEvent::VerificationCode { code } => {
                let target = {
                    let association =
                        inner.association.lock().expect("association lock poisoned");
                    association
                        .as_ref()
                        .filter(|state| state.session_id == Some(session_id))
                        .map(|state| (state.callback.clone(), state.executor.clone()))
                };
                match target {
                    Some((callback, executor)) => {
                        executor.execute(move || callback.on_verification_code(&code));
                    }
                    None => {
                        tracing::warn!(
                            session = session_id,
                            "Verification code with no association in progress"
                        );
                    }
                }
            }

            ChannelEvent::Established {
                device_id,
                key_digest,
            } => {
                let (snapshot, displaced) = {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    let Some(entry) = state.sessions.get_mut(&session_id) else {
                        continue;
                    };
                    entry.established = true;
                    entry.device_id = Some(device_id);
                    if let Some(record) = inner.store.load(&device_id) {
                        entry.friendly_name = record.friendly_name;
                        entry.active_user = record.active_user;
                    }
                    let snapshot = entry.snapshot();
                    // Later-finishing session wins; the earlier one is
                    // closed quietly.
                    let displaced = match state.by_device.insert(device_id, session_id) {
                        Some(previous) if previous != session_id => state
                            .sessions
                            .get(&previous)
                            .map(|entry| entry.handle.clone()),
                        _ => None,
                    };
                    (snapshot, displaced)
                };
                if let Some(previous) = displaced {
                    tracing::info!(
                        device_id = %device_id,
                        "Duplicate role sessions — keeping the later one"
                    );
                    previous.close().await;
                }
                tracing::info!(
                    session = session_id,
                    device_id = %device_id,
                    key_digest,
                    "Secure channel ready"
                );
                inner.clear_connecting(session_id);

                let association_done = {
                    let mut association =
                        inner.association.lock().expect("association lock poisoned");
                    let ours = association
                        .as_ref()
                        .map(|state| state.session_id == Some(session_id))
                        .unwrap_or(false);
                    if ours {
                        association.take()
                    } else {
                        None
                    }
                };
                if let (Some(state), Some(snapshot)) = (association_done, snapshot.clone()) {
                    let callback = state.callback.clone();
                    state
                        .executor
                        .execute(move || callback.on_association_completed(&snapshot));
                }
                inner.invoke_device_callbacks(device_id, |callback, device, _recipient| {
                    callback.on_secure_channel_established(device)
                });
            }

            ChannelEvent::Message { recipient, payload } => {
                let device_id = {
                    let state = inner.state.lock().expect("state lock poisoned");
                    state
                        .sessions
                        .get(&session_id)
                        .and_then(|entry| entry.device_id)
                };
                let Some(device_id) = device_id else {
                    tracing::warn!(session = session_id, "Message from unidentified session");
                    continue;
                };
                if inner
                    .blocklist
                    .lock()
                    .expect("blocklist lock poisoned")
                    .contains(&recipient)
                {
                    tracing::warn!(
                        recipient = %recipient,
                        "Dropping message for blocklisted recipient"
                    );
                    continue;
                }
                let entries: Vec<(Arc<dyn DeviceCallback>, Executor)> = {
                    let registry =
                        inner.device_callbacks.lock().expect("registry lock poisoned");
                    registry
                        .get(&(device_id, recipient))
                        .map(|entries| {
                            entries
                                .iter()
                                .map(|e| (e.callback.clone(), e.executor.clone()))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                if entries.is_empty() {
                    tracing::warn!(
                        device_id = %device_id,
                        recipient = %recipient,
                        "Dropping message for unknown recipient"
                    );
                    continue;
                }
                let snapshot = inner.device_snapshot(device_id);
                let payload = Arc::new(payload);
                for (callback, executor) in entries {
                    let snapshot = snapshot.clone();
                    let payload = payload.clone();
                    executor.execute(move || {
                        callback.on_message_received(&snapshot, recipient, &payload)
                    });
                }
            }

            ChannelEvent::Error { kind } => {
                let device_id = {
                    let state = inner.state.lock().expect("state lock poisoned");
                    state
                        .sessions
                        .get(&session_id)
                        .and_then(|entry| entry.device_id)
                };
                tracing::warn!(session = session_id, ?kind, "Session error");
                inner.clear_connecting(session_id);

                let association_target = {
                    let mut association =
                        inner.association.lock().expect("association lock poisoned");
                    match association.as_mut() {
                        Some(state) if state.session_id == Some(session_id) => {
                            // Let the next connection retry the pairing.
                            state.session_id = None;
                            Some((state.callback.clone(), state.executor.clone()))
                        }
                        _ => None,
                    }
                };
                if let Some((callback, executor)) = association_target {
                    executor.execute(move || callback.on_association_error(kind));
                }
                if let Some(device_id) = device_id {
                    inner.invoke_device_callbacks(device_id, move |callback, device, _| {
                        callback.on_device_error(device, kind)
                    });
                }
            }

            ChannelEvent::Disconnected => {
                let (entry, displaced_only) = {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    let entry = state.sessions.remove(&session_id);
                    let mut displaced_only = false;
                    if let Some(entry) = &entry {
                        if let Some(device_id) = entry.device_id {
                            if state.by_device.get(&device_id) == Some(&session_id) {
                                state.by_device.remove(&device_id);
                            } else {
                                // The device lives on in a newer session;
                                // this close was only the loser of a role
                                // collision.
                                displaced_only = state.by_device.contains_key(&device_id);
                            }
                        }
                    }
                    (entry, displaced_only)
                };
                inner.session_ids.release(session_id);
                inner.clear_connecting(session_id);
                {
                    let mut association =
                        inner.association.lock().expect("association lock poisoned");
                    if let Some(state) = association.as_mut() {
                        if state.session_id == Some(session_id) {
                            state.session_id = None;
                        }
                    }
                }
                if let Some(entry) = entry {
                    tracing::info!(session = session_id, "Session closed");
                    if let Some(snapshot) = entry.snapshot() {
                        if !displaced_only {
                            inner.notify_disconnected(&snapshot);
                        }
                    }
                }
            }
        }
    }
}
