//! Persistent store for paired-device records and the head-unit id.
//!
//! One JSON file per device under the storage root, plus a singleton
//! `unit_id` file. Every write goes through the atomic replace discipline
//! (write to temp, fsync, rename) so a crash mid-write leaves either the
//! old record or the new one, never a torn file. Torn or malformed records
//! found on load are discarded.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::KEY_LENGTH;

const UNIT_ID_FILE: &str = "unit_id";
const RECORD_EXT: &str = "json";

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Errors from the key store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Device not found: {0}")]
    NotFound(Uuid),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// A paired phone, as persisted by the head-unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDeviceRecord {
    /// Stable 128-bit identity generated during association.
    pub device_id: Uuid,
    /// Transport address. May change between sessions.
    pub address: String,
    /// Human-readable name advertised by the phone.
    pub friendly_name: String,
    /// Long-term symmetric key. Rotated on every reconnect.
    #[serde(with = "key_blob")]
    pub encryption_key: Vec<u8>,
    /// Whether this device belongs to the active user.
    pub active_user: bool,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PairedDeviceRecord {
    pub fn new(
        device_id: Uuid,
        address: String,
        friendly_name: String,
        encryption_key: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            address,
            friendly_name,
            encryption_key,
            active_user: false,
            paired_at: now,
            last_seen: now,
        }
    }
}

/// Base64 encoding for the key blob inside the JSON record.
mod key_blob {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════
// KeyStore
// ═══════════════════════════════════════════════════════════

/// File-backed store for paired devices. Shared by all session actors,
/// serialized by an internal mutex.
pub struct KeyStore {
    root: PathBuf,
    // Serializes writers and the unit-id bootstrap.
    lock: Mutex<Option<Uuid>>,
}

impl KeyStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(None),
        })
    }

    /// The head-unit's own stable id. Generated and persisted on first
    /// call; a corrupt file is replaced with a fresh id.
    pub fn unit_id(&self) -> Result<Uuid, StoreError> {
        let mut cached = self.lock.lock().expect("store lock poisoned");
        if let Some(id) = *cached {
            return Ok(id);
        }

        let path = self.root.join(UNIT_ID_FILE);
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(id) = content.trim().parse::<Uuid>() {
                *cached = Some(id);
                return Ok(id);
            }
            tracing::warn!("Unit id file unreadable, regenerating");
        }

        let id = Uuid::new_v4();
        write_atomic(&path, id.to_string().as_bytes())?;
        tracing::info!(unit_id = %id, "Generated head-unit id");
        *cached = Some(id);
        Ok(id)
    }

    /// Load one device record. Returns `None` when the record is absent,
    /// torn, or carries a key of the wrong length.
    pub fn load(&self, device_id: &Uuid) -> Option<PairedDeviceRecord> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.load_unlocked(device_id)
    }

    fn load_unlocked(&self, device_id: &Uuid) -> Option<PairedDeviceRecord> {
        let path = self.record_path(device_id);
        let content = fs::read_to_string(&path).ok()?;
        let record: PairedDeviceRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(_) => {
                tracing::warn!(device_id = %device_id, "Discarding unparseable device record");
                return None;
            }
        };
        if record.device_id != *device_id || record.encryption_key.len() != KEY_LENGTH {
            tracing::warn!(device_id = %device_id, "Discarding inconsistent device record");
            return None;
        }
        Some(record)
    }

    /// Persist a device record atomically. When the record is flagged
    /// active-user, every other record loses the flag — at most one device
    /// per user is active.
    pub fn save(&self, record: &PairedDeviceRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&self.record_path(&record.device_id), json.as_bytes())?;

        if record.active_user {
            for mut other in self.list_unlocked() {
                if other.device_id != record.device_id && other.active_user {
                    other.active_user = false;
                    let json = serde_json::to_string_pretty(&other)?;
                    write_atomic(&self.record_path(&other.device_id), json.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Flip the active-user flag on a stored device.
    pub fn set_active_user(&self, device_id: &Uuid, active: bool) -> Result<(), StoreError> {
        let mut record = self
            .load(device_id)
            .ok_or(StoreError::NotFound(*device_id))?;
        record.active_user = active;
        self.save(&record)
    }

    /// Remove a device record. Returns whether a record existed.
    pub fn remove(&self, device_id: &Uuid) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        match fs::remove_file(self.record_path(device_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable device records.
    pub fn all_devices(&self) -> Vec<PairedDeviceRecord> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.list_unlocked()
    }

    /// Records flagged as belonging to the active user.
    pub fn active_user_devices(&self) -> Vec<PairedDeviceRecord> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.list_unlocked()
            .into_iter()
            .filter(|r| r.active_user)
            .collect()
    }

    fn list_unlocked(&self) -> Vec<PairedDeviceRecord> {
        let mut by_id: HashMap<Uuid, PairedDeviceRecord> = HashMap::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(device_id) = stem.parse::<Uuid>() else {
                continue;
            };
            if let Some(record) = self.load_unlocked(&device_id) {
                by_id.insert(device_id, record);
            }
        }
        let mut records: Vec<_> = by_id.into_values().collect();
        records.sort_by_key(|r| r.paired_at);
        records
    }

    fn record_path(&self, device_id: &Uuid) -> PathBuf {
        self.root.join(format!("{device_id}.{RECORD_EXT}"))
    }
}

/// Write-to-temp, fsync, rename. The rename makes the replacement atomic
/// on every platform we target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
