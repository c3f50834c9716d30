pub mod session_key;

pub use session_key::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed — wrong key or tampered payload")]
    MacFailure,

    #[error("Ciphertext too short")]
    TruncatedCiphertext,

    #[error("Key material has the wrong length")]
    InvalidKeyLength,
}
