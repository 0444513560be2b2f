//! Symmetric encryption transformer around encoded values
//!
//! When a pool is opened with an encryption key, every encoded value is
//! replaced by `nonce || ciphertext || tag` under AES-256-GCM before it
//! reaches the frame log, and reversed on read. The key is process-local;
//! attaching with a different key surfaces `Decrypt` on `get`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{MventError, Result};

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Authenticated cipher applied to encoded values
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    /// Build a cipher from a 256-bit key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            inner: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt a plaintext into `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext)
            .map_err(|_| MventError::encode("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `nonce || ciphertext || tag` blob
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(MventError::decrypt("record shorter than nonce"));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| MventError::decrypt("authentication failed"))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = Cipher::new(&[7u8; 32]);
        let blob = cipher.seal(b"payload").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"payload");
        assert_eq!(cipher.open(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_distinct_nonces() {
        let cipher = Cipher::new(&[7u8; 32]);
        let a = cipher.seal(b"x").unwrap();
        let b = cipher.seal(b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Cipher::new(&[1u8; 32]).seal(b"secret").unwrap();
        let err = Cipher::new(&[2u8; 32]).open(&sealed).unwrap_err();
        assert!(matches!(err, MventError::Decrypt { .. }));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = Cipher::new(&[3u8; 32]);
        let mut blob = cipher.seal(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            cipher.open(&blob),
            Err(MventError::Decrypt { .. })
        ));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let cipher = Cipher::new(&[4u8; 32]);
        assert!(cipher.open(&[0u8; 4]).is_err());
    }
}
