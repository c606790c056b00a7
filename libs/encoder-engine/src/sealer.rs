//! At-rest sealing of recipient keys.
//!
//! XChaCha20-Poly1305 keyed by SHA-256 of the operator passphrase. Every
//! sealed value is `nonce (24 bytes) || ciphertext`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, StreamError};

const NONCE_LEN: usize = 24;
const KEY_DOMAIN: &[u8] = b"iotencoder/registry/v1\0";

pub struct KeySealer {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySealer").finish_non_exhaustive()
    }
}

impl KeySealer {
    pub fn from_passphrase(passphrase: &str) -> Result<Self, EngineError> {
        if passphrase.is_empty() {
            return Err(EngineError::Config("encryption passphrase is empty".into()));
        }
        let key = Sha256::new()
            .chain_update(KEY_DOMAIN)
            .chain_update(passphrase.as_bytes())
            .finalize();
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| EngineError::Config(format!("sealing key: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StreamError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| StreamError::Internal(format!("seal recipient key: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, StreamError> {
        if sealed.len() <= NONCE_LEN {
            return Err(StreamError::Internal("sealed value too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StreamError::Internal("cannot unseal recipient key (wrong passphrase?)".into()))
    }
}
