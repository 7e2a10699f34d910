//! AES-GCM cipher for message body and frame encryption.
//!
//! Every sealed payload carries its random nonce as a prefix, so ciphertexts
//! are self-contained and decryptable in any order.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

/// Length of the nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for encrypting/decrypting payloads.
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    /// Create a new cipher with the given key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt, prepending a freshly generated random nonce.
    pub fn seal(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self.encrypt_with_nonce(plaintext, &nonce, ad)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`Cipher::seal`].
    pub fn open(&self, data: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CipherError::Truncated)?;
        self.decrypt_with_nonce(ciphertext, &nonce, ad)
    }

    /// Encrypt with a specific nonce.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_LEN],
        ad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;

        let nonce = Nonce::from_slice(nonce);

        cipher
            .encrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CipherError::EncryptionFailed)
    }

    /// Decrypt with a specific nonce.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        ad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;

        let nonce = Nonce::from_slice(nonce);

        cipher
            .decrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

/// Cipher errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CipherError {
    InvalidKey,
    EncryptionFailed,
    DecryptionFailed,
    Truncated,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::InvalidKey => write!(f, "invalid key"),
            CipherError::EncryptionFailed => write!(f, "encryption failed"),
            CipherError::DecryptionFailed => write!(f, "decryption failed"),
            CipherError::Truncated => write!(f, "ciphertext shorter than nonce"),
        }
    }
}

impl std::error::Error for CipherError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = Cipher::new([0xab; 32]);

        let plaintext = b"Hello, chat!";
        let ad = b"additional data";

        let sealed = cipher.seal(plaintext, ad).unwrap();
        let opened = cipher.open(&sealed, ad).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_randomizes_nonce() {
        let cipher = Cipher::new([0xab; 32]);

        let a = cipher.seal(b"same plaintext", b"").unwrap();
        let b = cipher.seal(b"same plaintext", b"").unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_ad_fails() {
        let cipher = Cipher::new([0xab; 32]);

        let sealed = cipher.seal(b"Hello, chat!", b"correct ad").unwrap();
        let result = cipher.open(&sealed, b"wrong ad");

        assert!(result.is_err());
    }

    #[test]
    fn test_open_truncated_fails() {
        let cipher = Cipher::new([0xab; 32]);
        assert_eq!(cipher.open(&[0u8; 4], b""), Err(CipherError::Truncated));
    }
}
