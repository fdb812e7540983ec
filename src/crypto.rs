//! Credential encryption and secret comparison.
//!
//! Credential blobs are sealed with AES-256-GCM-SIV under a key derived from
//! the configured encryption secret. The 12-byte nonce is random per call and
//! prepended to the ciphertext, so encrypting the same plaintext twice yields
//! different outputs. API keys are compared in constant time.

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use once_cell::sync::Lazy;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

static CIPHER: Lazy<Aes256GcmSiv> = Lazy::new(|| {
    let key = derive_key(&crate::config::load().encryption_key);
    Aes256GcmSiv::new_from_slice(&key).expect("sha256 digest is a valid aes-256 key")
});

/// Encrypt a plaintext secret into `base64(nonce || ciphertext)`.
pub fn encrypt_secret(plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = CIPHER
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(B64.encode(out))
}

/// Decrypt a blob produced by [`encrypt_secret`].
///
/// Failure means the blob is corrupted or was sealed under a different key;
/// callers surface this as "credentials corrupted, please re-import" and must
/// never delete the account on its own.
pub fn decrypt_secret(blob: &str) -> Result<String, CryptoError> {
    let raw = B64.decode(blob.trim()).map_err(|_| CryptoError::Encoding)?;
    if raw.len() <= NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = CIPHER
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Constant-time equality for API keys and other bearer secrets.
pub fn secrets_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let plain = r#"{"type":"codex","refresh_token":"rt-1"}"#;
        let sealed = encrypt_secret(plain).unwrap();
        assert_eq!(decrypt_secret(&sealed).unwrap(), plain);
    }

    #[test]
    fn same_plaintext_different_ciphertext() {
        let a = encrypt_secret("secret").unwrap();
        let b = encrypt_secret("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_fails() {
        let sealed = encrypt_secret("secret").unwrap();
        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(decrypt_secret(&B64.encode(raw)).is_err());
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        assert!(decrypt_secret("not base64!!!").is_err());
        assert!(decrypt_secret("AAAA").is_err());
    }

    #[test]
    fn constant_time_compare() {
        assert!(secrets_equal("sk-abc", "sk-abc"));
        assert!(!secrets_equal("sk-abc", "sk-abd"));
        assert!(!secrets_equal("sk-abc", "sk-abcd"));
    }
}
