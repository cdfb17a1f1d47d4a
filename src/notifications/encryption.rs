//! Channel configs at rest: AES-256-GCM, stored as `nonce || ciphertext`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

use super::models::ChannelConfig;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),
    #[error("Channel config is not valid JSON: {0}")]
    MalformedConfig(String),
}

pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Key as configured: 64 hex characters.
    pub fn from_hex(key_hex: &str) -> Result<Self, EncryptionError> {
        let key = hex::decode(key_hex.trim()).map_err(|e| EncryptionError::InvalidHexKey(e.to_string()))?;
        Self::new(&key)
    }

    /// Serializes and encrypts a channel config for storage.
    pub fn seal_config(&self, config: &ChannelConfig) -> Result<Vec<u8>, EncryptionError> {
        let json = serde_json::to_vec(config).map_err(|e| EncryptionError::MalformedConfig(e.to_string()))?;
        self.seal(&json)
    }

    /// Reverses [`EncryptionService::seal_config`].
    pub fn open_config(&self, stored: &[u8]) -> Result<ChannelConfig, EncryptionError> {
        let json = self.open(stored)?;
        serde_json::from_slice(&json).map_err(|e| EncryptionError::MalformedConfig(e.to_string()))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn open(&self, stored: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let Some((nonce, sealed)) = stored.split_at_checked(NONCE_LEN) else {
            return Err(EncryptionError::DecryptionFailed(format!(
                "expected at least {NONCE_LEN} bytes, got {}",
                stored.len()
            )));
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EncryptionError::DecryptionFailed("wrong key or corrupted data".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn telegram() -> ChannelConfig {
        ChannelConfig::Telegram {
            bot_token: "123:abc".to_string(),
            chat_id: "-100200".to_string(),
        }
    }

    #[test]
    fn test_sealed_config_hides_secrets() {
        let service = EncryptionService::from_hex(KEY).unwrap();
        let stored = service.seal_config(&telegram()).unwrap();
        assert!(!String::from_utf8_lossy(&stored).contains("123:abc"));
        assert_eq!(service.open_config(&stored).unwrap(), telegram());

        // Fresh nonce per seal.
        assert_ne!(service.seal_config(&telegram()).unwrap(), stored);
    }

    #[test]
    fn test_open_with_wrong_key() {
        let service = EncryptionService::from_hex(KEY).unwrap();
        let other = EncryptionService::new(&[7u8; KEY_LEN]).unwrap();
        let stored = service.seal_config(&telegram()).unwrap();
        assert!(matches!(
            other.open_config(&stored),
            Err(EncryptionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_invalid_keys_and_data() {
        assert_eq!(
            EncryptionService::from_hex("1234").err(),
            Some(EncryptionError::InvalidKeyLength(2))
        );
        assert!(matches!(
            EncryptionService::from_hex("not-a-hex-string"),
            Err(EncryptionError::InvalidHexKey(_))
        ));

        let service = EncryptionService::from_hex(KEY).unwrap();
        assert!(matches!(
            service.open_config(b"short"),
            Err(EncryptionError::DecryptionFailed(_))
        ));
        let not_json = service.seal(b"not json").unwrap();
        assert!(matches!(
            service.open_config(&not_json),
            Err(EncryptionError::MalformedConfig(_))
        ));
    }
}
