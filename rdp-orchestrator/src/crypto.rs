//! At-rest encryption for account credentials, login secrets and key files,
//! plus decryption of the provider-issued boot secret.
//!
//! AES-256-GCM with a per-blob key derived through HKDF-SHA256:
//!
//! ```text
//! master_key ──┬─► HKDF-SHA256 ─► blob key
//! random salt ─┘
//!
//! sealed blob = salt (32) || nonce (12) || ciphertext || tag (16)
//! ```

use aes_gcm::{
    aead::{Aead, AeadCore, OsRng},
    Aes256Gcm, KeyInit, Nonce,
};
use base64::Engine;
use hkdf::Hkdf;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

const HKDF_INFO: &[u8] = b"rdp-orchestrator-secrets-v1";

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("master key must be at least 32 bytes")]
    InvalidMasterKey,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

pub struct SecretsCrypto {
    master_key: SecretString,
}

impl SecretsCrypto {
    pub fn new(master_key: SecretString) -> Result<Self, SecretsError> {
        if master_key.expose_secret().len() < KEY_SIZE {
            return Err(SecretsError::InvalidMasterKey);
        }
        Ok(Self { master_key })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
        let cipher = self.cipher(&salt)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretsError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SecretsError> {
        if sealed.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SecretsError::DecryptionFailed("sealed blob too short".to_string()));
        }
        let (salt, rest) = sealed.split_at(SALT_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        self.cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SecretsError::DecryptionFailed(e.to_string()))
    }

    pub fn seal_str(&self, plaintext: &SecretString) -> Result<Vec<u8>, SecretsError> {
        self.seal(plaintext.expose_secret().as_bytes())
    }

    pub fn open_string(&self, sealed: &[u8]) -> Result<SecretString, SecretsError> {
        let bytes = self.open(sealed)?;
        let s = String::from_utf8(bytes)
            .map_err(|_| SecretsError::DecryptionFailed("not valid UTF-8".to_string()))?;
        Ok(SecretString::from(s))
    }

    fn cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, SecretsError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.master_key.expose_secret().as_bytes());
        let mut derived = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut derived)
            .map_err(|_| SecretsError::EncryptionFailed("HKDF expansion failed".to_string()))?;
        Aes256Gcm::new_from_slice(&derived).map_err(|e| SecretsError::EncryptionFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SecretsCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCrypto")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

/// Decrypt a base64 boot secret with the instance's PEM private key (PKCS#1 v1.5 padding).
pub fn decrypt_boot_secret(
    private_key_pem: &SecretString,
    encoded: &str,
) -> Result<SecretString, SecretsError> {
    let pem = private_key_pem.expose_secret();
    let key = RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| SecretsError::InvalidKeyMaterial(e.to_string()))?;

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let cipher = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| SecretsError::DecryptionFailed(format!("boot secret is not base64: {}", e)))?;
    let plain = key
        .decrypt(Pkcs1v15Encrypt, &cipher)
        .map_err(|e| SecretsError::DecryptionFailed(e.to_string()))?;
    let s = String::from_utf8(plain)
        .map_err(|_| SecretsError::DecryptionFailed("boot secret is not UTF-8".to_string()))?;
    Ok(SecretString::from(s))
}
