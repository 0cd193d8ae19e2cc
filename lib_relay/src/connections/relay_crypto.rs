//! # Relay Session Crypto
//!
//! AES-256-CBC sealing for frames exchanged with the upstream relay peer.
//!
//! The key is `SHA-256(shared_secret || "YYYY-MM-DD")` over the current UTC
//! date, so both ends agree on a key without any exchange. Every sealed frame
//! is `IV || ciphertext` with PKCS7 padding.
//!
//! The IV is fixed at sixteen zero bytes. Identical plaintexts sealed on the
//! same day produce identical ciphertexts; callers needing confidentiality
//! against a passive observer must replace this scheme.

use std::fmt;

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use chrono::{NaiveDate, Utc};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The initialization vector prefixed to every sealed frame.
pub const ZERO_IV: [u8; 16] = [0u8; 16];

const BLOCK_SIZE: usize = 16;

/// Errors raised while opening a sealed frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The frame cannot hold an IV plus at least one cipher block.
    #[error("Invalid frame length: {0} bytes")]
    InvalidLength(usize),

    /// PKCS7 padding did not validate after decryption.
    #[error("Decryption failed. Verify the shared secret and the key date.")]
    Unpad,

    /// The decrypted bytes are not valid UTF-8.
    #[error("Decrypted payload is not UTF-8: {0}")]
    Utf8(String),
}

/// # Session Key
///
/// A symmetric key bound to one UTC calendar date.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
    date: NaiveDate,
}

impl SessionKey {
    /// Derives the key for `secret` on `date`.
    pub fn derive(secret: &str, date: NaiveDate) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key, date }
    }

    /// Derives the key for `secret` on the current UTC date.
    pub fn for_today(secret: &str) -> Self {
        Self::derive(secret, Utc::now().date_naive())
    }

    /// The UTC date this key is valid for.
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// First four key bytes as hex, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key[..4])
    }

    /// Encrypts `plain` and returns `IV || ciphertext`.
    pub fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let encryptor = Encryptor::<Aes256>::new(&self.key.into(), &ZERO_IV.into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain);

        let mut frame = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        frame.extend_from_slice(&ZERO_IV);
        frame.extend_from_slice(&ciphertext);
        frame
    }

    /// Decrypts an `IV || ciphertext` frame.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < 2 * BLOCK_SIZE || frame.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidLength(frame.len()));
        }

        let (iv, ciphertext) = frame.split_at(BLOCK_SIZE);
        let iv: [u8; 16] = iv
            .try_into()
            .map_err(|_| CryptoError::InvalidLength(frame.len()))?;

        let decryptor = Decryptor::<Aes256>::new(&self.key.into(), &iv.into());
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Unpad)
    }

    /// Decrypts a frame and decodes it as UTF-8 text.
    pub fn open_text(&self, frame: &[u8]) -> Result<String, CryptoError> {
        let plain = self.open(frame)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Utf8(e.to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("date", &self.date)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
