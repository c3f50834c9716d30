//! Fixed-nonce AES-GCM over the verification code.
//!
//! Unlike session traffic, the out-of-band exchange uses the two
//! pre-shared nonces directly: the encrypt direction and the decrypt
//! direction each get their own. Swapped roles (both sides splitting the
//! material the same way) fail decryption deterministically. Policy allows
//! one encryption per material; nothing here enforces that.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::{OobError, OobMaterial};

/// Longest verification code accepted for out-of-band confirmation.
pub const MAX_CODE_LENGTH: usize = 16;

/// Verification-code cipher bound to one exchange's material.
pub struct OobCipher {
    material: OobMaterial,
}

impl OobCipher {
    pub fn new(material: OobMaterial) -> Self {
        Self { material }
    }

    /// Encrypt our verification code for the peer.
    pub fn encrypt_verification(&self, code: &[u8]) -> Result<Vec<u8>, OobError> {
        if code.is_empty() || code.len() > MAX_CODE_LENGTH {
            return Err(OobError::CodeTooLong);
        }
        let key = Key::<Aes256Gcm>::from_slice(&self.material.key);
        let cipher = Aes256Gcm::new(key);
        cipher
            .encrypt(Nonce::from_slice(&self.material.enc_iv), code)
            .map_err(|_| OobError::EncryptionFailed)
    }

    /// Decrypt the peer's verification code.
    pub fn decrypt_verification(&self, ciphertext: &[u8]) -> Result<Vec<u8>, OobError> {
        let key = Key::<Aes256Gcm>::from_slice(&self.material.key);
        let cipher = Aes256Gcm::new(key);
        cipher
            .decrypt(Nonce::from_slice(&self.material.dec_iv), ciphertext)
            .map_err(|_| OobError::DecryptionFailed)
    }
}

impl std::fmt::Debug for OobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobCipher").finish_non_exhaustive()
    }
}
