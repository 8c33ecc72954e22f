// ── Chatvend Engine: Message Encryption ────────────────────────────────────
// AES-GCM authenticated encryption for stored chat content.
// Key length selects the cipher: 16 → AES-128, 24 → AES-192, 32 → AES-256;
// anything else fails construction. Each encryption draws a fresh 12-byte
// nonce. Storage format: base64(nonce || ciphertext || tag).
// Decrypt authenticates before returning anything; tampered or truncated
// input yields `DecryptionFailed`, never partial plaintext.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::Aead;
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{AesGcm, KeyInit, Nonce};
use base64::Engine as _;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::atoms::error::{EngineError, EngineResult};

type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

enum Cipher {
    A128(Box<Aes128Gcm>),
    A192(Box<Aes192Gcm>),
    A256(Box<Aes256Gcm>),
}

pub struct CryptoService {
    cipher: Cipher,
}

impl CryptoService {
    /// Build the service from raw key material. 16/24/32 bytes only.
    pub fn new(key: &[u8]) -> EngineResult<Self> {
        let key = Zeroizing::new(key.to_vec());
        let cipher = match key.len() {
            16 => Cipher::A128(Box::new(
                Aes128Gcm::new_from_slice(&key)
                    .map_err(|e| EngineError::EncryptionFailed(e.to_string()))?,
            )),
            24 => Cipher::A192(Box::new(
                Aes192Gcm::new_from_slice(&key)
                    .map_err(|e| EngineError::EncryptionFailed(e.to_string()))?,
            )),
            32 => Cipher::A256(Box::new(
                Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| EngineError::EncryptionFailed(e.to_string()))?,
            )),
            n => {
                return Err(EngineError::EncryptionFailed(format!(
                    "key must be 16, 24 or 32 bytes, got {}",
                    n
                )))
            }
        };
        Ok(CryptoService { cipher })
    }

    /// Encrypt plaintext to base64(nonce || ciphertext || tag).
    pub fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match &self.cipher {
            Cipher::A128(c) => c.encrypt(nonce, plaintext.as_bytes()),
            Cipher::A192(c) => c.encrypt(nonce, plaintext.as_bytes()),
            Cipher::A256(c) => c.encrypt(nonce, plaintext.as_bytes()),
        }
        .map_err(|_| EngineError::EncryptionFailed("AES-GCM encrypt".into()))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(packed))
    }

    /// Decrypt base64(nonce || ciphertext || tag) back to plaintext.
    pub fn decrypt(&self, encoded: &str) -> EngineResult<String> {
        let packed = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| EngineError::DecryptionFailed)?;
        if packed.len() < NONCE_LEN + TAG_LEN {
            return Err(EngineError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = match &self.cipher {
            Cipher::A128(c) => c.decrypt(nonce, ciphertext),
            Cipher::A192(c) => c.decrypt(nonce, ciphertext),
            Cipher::A256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| EngineError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| EngineError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> CryptoService {
        CryptoService::new(&[0xAB; 32]).unwrap()
    }

    #[test]
    fn only_valid_key_lengths_construct() {
        for n in [16usize, 24, 32] {
            assert!(CryptoService::new(&vec![7u8; n]).is_ok(), "len {}", n);
        }
        for n in [0usize, 1, 15, 17, 23, 25, 31, 33, 64] {
            assert!(CryptoService::new(&vec![7u8; n]).is_err(), "len {}", n);
        }
    }

    #[test]
    fn round_trip_all_key_sizes() {
        for n in [16usize, 24, 32] {
            let svc = CryptoService::new(&vec![0x11u8; n]).unwrap();
            let plain = "پیام خصوصی کاربر — user private message";
            let ct = svc.encrypt(plain).unwrap();
            assert_ne!(ct, plain);
            assert_eq!(svc.decrypt(&ct).unwrap(), plain);
        }
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let svc = svc();
        let a = svc.encrypt("same").unwrap();
        let b = svc.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_ciphertext_fails_cleanly() {
        let svc = svc();
        let ct = svc.encrypt("hello").unwrap();
        let raw = base64::engine::general_purpose::STANDARD.decode(&ct).unwrap();
        let truncated = base64::engine::general_purpose::STANDARD.encode(&raw[..raw.len() - 4]);
        assert!(matches!(svc.decrypt(&truncated), Err(EngineError::DecryptionFailed)));
        assert!(matches!(svc.decrypt("@@not-base64@@"), Err(EngineError::DecryptionFailed)));
        assert!(matches!(svc.decrypt(""), Err(EngineError::DecryptionFailed)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let a = CryptoService::new(&[0xAB; 32]).unwrap();
        let b = CryptoService::new(&[0xCD; 32]).unwrap();
        let ct = a.encrypt("secret").unwrap();
        assert!(matches!(b.decrypt(&ct), Err(EngineError::DecryptionFailed)));
    }
}
