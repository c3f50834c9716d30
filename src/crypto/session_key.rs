use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroize;

use super::CryptoError;

pub const KEY_LENGTH: usize = 32; // AES-256
pub const NONCE_LENGTH: usize = 12;

/// Symmetric session key agreed by the handshake — zeroed on drop.
///
/// Sealed payloads are `[12-byte nonce][ciphertext + 16-byte tag]` with a
/// fresh random nonce per call and empty associated data.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SessionKey {
    key_bytes: [u8; KEY_LENGTH],
}

impl SessionKey {
    pub fn from_bytes(key_bytes: [u8; KEY_LENGTH]) -> Self {
        Self { key_bytes }
    }

    /// Access the raw key bytes (internal use only)
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key_bytes
    }

    /// Encrypt a payload for the wire.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key_bytes);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed wire payload. Authentication failure is surfaced
    /// as `MacFailure` and must close the session.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LENGTH + 16 {
            // AES-GCM auth tag is 16 bytes minimum
            return Err(CryptoError::TruncatedCiphertext);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);

        let key = Key::<Aes256Gcm>::from_slice(&self.key_bytes);
        let cipher = Aes256Gcm::new(key);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::MacFailure)
    }

    /// Short hex digest of the key for log correlation. Never reveals the
    /// key itself.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.key_bytes);
        let full = hasher.finalize();
        full[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = CryptoError;

    fn try_from(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key_bytes: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { key_bytes })
    }
}

/// Generate fresh random key bytes.
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    key
}
