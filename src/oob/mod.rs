//! Out-of-band channel — pre-sharing secret material over a side channel.
//!
//! One exchange per association. The material is `2·12 + 32` random bytes:
//! two fixed AES-GCM nonces plus a 256-bit key, split role-dependently so
//! each direction of the verification exchange gets its own nonce. How the
//! bytes travel (RFCOMM socket, scanned QR code) is up to the channel
//! implementation; this module ships an in-process channel pair and a QR
//! presentation helper.

pub mod cipher;

pub use cipher::OobCipher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;
use zeroize::Zeroize;

pub const OOB_NONCE_LENGTH: usize = 12;
pub const OOB_KEY_LENGTH: usize = 32;
/// Total length of the raw material moved across the side channel.
pub const OOB_MATERIAL_LENGTH: usize = 2 * OOB_NONCE_LENGTH + OOB_KEY_LENGTH;

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Errors from the out-of-band layer.
#[derive(Debug, thiserror::Error)]
pub enum OobError {
    #[error("Out-of-band exchange interrupted")]
    Cancelled,
    #[error("Out-of-band material has the wrong length")]
    InvalidMaterial,
    #[error("Verification code exceeds 16 bytes")]
    CodeTooLong,
    #[error("Out-of-band encryption failed")]
    EncryptionFailed,
    #[error("Out-of-band decryption failed — mismatched material or swapped roles")]
    DecryptionFailed,
    #[error("QR rendering failed: {0}")]
    QrRender(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which side of the out-of-band exchange this stack plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobRole {
    /// The side that receives the material (the phone).
    Client,
    /// The side that generates the material (the head-unit).
    Server,
}

/// Split out-of-band material: two fixed nonces and one key, zeroed on
/// drop. The IVs are mirrored between roles so that one side's encrypt
/// nonce is the other side's decrypt nonce.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct OobMaterial {
    pub(crate) enc_iv: [u8; OOB_NONCE_LENGTH],
    pub(crate) dec_iv: [u8; OOB_NONCE_LENGTH],
    pub(crate) key: [u8; OOB_KEY_LENGTH],
}

impl OobMaterial {
    /// Generate fresh raw material for the side channel.
    pub fn generate_raw() -> [u8; OOB_MATERIAL_LENGTH] {
        use rand::RngCore;
        let mut bytes = [0u8; OOB_MATERIAL_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// Split raw material for one role. Client and Server swap the IVs.
    pub fn split(bytes: &[u8], role: OobRole) -> Result<Self, OobError> {
        if bytes.len() != OOB_MATERIAL_LENGTH {
            return Err(OobError::InvalidMaterial);
        }
        let first: [u8; OOB_NONCE_LENGTH] =
            bytes[..OOB_NONCE_LENGTH].try_into().expect("sliced");
        let second: [u8; OOB_NONCE_LENGTH] = bytes[OOB_NONCE_LENGTH..2 * OOB_NONCE_LENGTH]
            .try_into()
            .expect("sliced");
        let key: [u8; OOB_KEY_LENGTH] =
            bytes[2 * OOB_NONCE_LENGTH..].try_into().expect("sliced");
        let (enc_iv, dec_iv) = match role {
            OobRole::Server => (first, second),
            OobRole::Client => (second, first),
        };
        Ok(Self { enc_iv, dec_iv, key })
    }
}

impl std::fmt::Debug for OobMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret material never reaches logs.
        f.debug_struct("OobMaterial").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════
// Channel trait
// ═══════════════════════════════════════════════════════════

/// A one-shot side channel that moves the raw material between peers.
///
/// Failure is surfaced, never retried here — the caller decides. After
/// `interrupt`, an in-flight exchange resolves with `Cancelled`.
pub trait OobChannel: Send + Sync {
    fn exchange(&self, role: OobRole) -> BoxFuture<'_, Result<OobMaterial, OobError>>;

    fn interrupt(&self);
}

// ═══════════════════════════════════════════════════════════
// In-process channel pair
// ═══════════════════════════════════════════════════════════

struct LocalOobShared {
    material: Mutex<Option<[u8; OOB_MATERIAL_LENGTH]>>,
    notify: Notify,
    cancelled: AtomicBool,
}

/// An in-process side channel: the server half generates the material, the
/// client half picks it up. Used by tests and by transports that carry
/// their own secondary link.
pub struct LocalOobChannel {
    shared: Arc<LocalOobShared>,
}

impl LocalOobChannel {
    /// Two connected halves sharing one exchange.
    pub fn pair() -> (LocalOobChannel, LocalOobChannel) {
        let shared = Arc::new(LocalOobShared {
            material: Mutex::new(None),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        });
        (
            LocalOobChannel {
                shared: shared.clone(),
            },
            LocalOobChannel { shared },
        )
    }
}

impl OobChannel for LocalOobChannel {
    fn exchange(&self, role: OobRole) -> BoxFuture<'_, Result<OobMaterial, OobError>> {
        async move {
            if role == OobRole::Server {
                if self.shared.cancelled.load(Ordering::Acquire) {
                    return Err(OobError::Cancelled);
                }
                let raw = OobMaterial::generate_raw();
                *self.shared.material.lock().expect("oob lock poisoned") = Some(raw);
                self.shared.notify.notify_waiters();
                return OobMaterial::split(&raw, role);
            }

            loop {
                let notified = self.shared.notify.notified();
                if self.shared.cancelled.load(Ordering::Acquire) {
                    return Err(OobError::Cancelled);
                }
                if let Some(raw) = *self.shared.material.lock().expect("oob lock poisoned") {
                    return OobMaterial::split(&raw, role);
                }
                notified.await;
            }
        }
        .boxed()
    }

    fn interrupt(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

// ═══════════════════════════════════════════════════════════
// QR presentation
// ═══════════════════════════════════════════════════════════

/// Encode raw material as a URL-safe token for QR payloads.
pub fn material_token(raw: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Decode a scanned token back into raw material.
pub fn material_from_token(token: &str) -> Result<[u8; OOB_MATERIAL_LENGTH], OobError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| OobError::InvalidMaterial)?;
    bytes.try_into().map_err(|_| OobError::InvalidMaterial)
}

/// Render raw material as a scannable QR code (SVG).
pub fn material_qr_svg(raw: &[u8]) -> Result<String, OobError> {
    use qrcode::render::svg;
    use qrcode::QrCode;

    let code = QrCode::new(material_token(raw).as_bytes())
        .map_err(|e| OobError::QrRender(e.to_string()))?;

    let svg_string = code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .max_dimensions(300, 300)
        .dark_color(svg::Color("#1c1917"))
        .light_color(svg::Color("#ffffff"))
        .quiet_zone(true)
        .build();

    Ok(svg_string)
}
