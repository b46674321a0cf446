//! Payload encryption for the manager's send and delivery paths.
//!
//! All algorithms use a 32-byte key. The configured IV is a *base* nonce:
//! the message id is mixed into its tail so every message encrypts under a
//! distinct nonce, which the authenticated modes require. Authenticated
//! modes (GCM, `ChaCha20-Poly1305`) append their tag to the ciphertext;
//! CTR produces ciphertext of the plaintext's exact length.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use quiver_core::types::MessageId;
use quiver_core::{EncryptionAlgorithm, EncryptionConfig, QueueError, QueueResult};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Key length required by every supported algorithm.
pub const KEY_LEN: usize = 32;
/// Nonce length for the AEAD modes.
pub const AEAD_NONCE_LEN: usize = 12;
/// IV length for CTR mode.
pub const CTR_IV_LEN: usize = 16;

/// Validates key and IV lengths for the configured algorithm.
pub fn validate(config: &EncryptionConfig) -> QueueResult<()> {
    let iv_len = match config.algorithm {
        EncryptionAlgorithm::None => return Ok(()),
        EncryptionAlgorithm::Aes256Gcm | EncryptionAlgorithm::ChaCha20Poly1305 => AEAD_NONCE_LEN,
        EncryptionAlgorithm::Aes256Ctr => CTR_IV_LEN,
    };
    if config.key.len() != KEY_LEN {
        return Err(QueueError::InvalidParameter(format!(
            "encryption key must be {KEY_LEN} bytes, got {}",
            config.key.len()
        )));
    }
    if config.iv.len() != iv_len {
        return Err(QueueError::InvalidParameter(format!(
            "encryption iv must be {iv_len} bytes, got {}",
            config.iv.len()
        )));
    }
    Ok(())
}

/// Mixes the message id into the base IV so nonces are unique per message.
fn derive_nonce(base: &[u8], message_id: MessageId) -> Vec<u8> {
    let mut nonce = base.to_vec();
    let id_bytes = message_id.to_le_bytes();
    let tail = nonce.len().saturating_sub(id_bytes.len());
    for (slot, byte) in nonce[tail..].iter_mut().zip(id_bytes) {
        *slot ^= byte;
    }
    nonce
}

/// Encrypts `data` under the configured algorithm and the message's nonce.
pub fn encrypt(
    config: &EncryptionConfig,
    message_id: MessageId,
    data: &[u8],
) -> QueueResult<Vec<u8>> {
    validate(config)?;
    let nonce = derive_nonce(&config.iv, message_id);
    match config.algorithm {
        EncryptionAlgorithm::None => Ok(data.to_vec()),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&config.key)
                .map_err(|e| QueueError::EncryptionFailed(format!("aes-gcm key: {e}")))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), data)
                .map_err(|_| QueueError::EncryptionFailed("aes-gcm seal failed".into()))
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(&config.key)
                .map_err(|e| QueueError::EncryptionFailed(format!("chacha key: {e}")))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), data)
                .map_err(|_| QueueError::EncryptionFailed("chacha seal failed".into()))
        }
        EncryptionAlgorithm::Aes256Ctr => {
            let mut cipher = Aes256Ctr::new_from_slices(&config.key, &nonce)
                .map_err(|e| QueueError::EncryptionFailed(format!("aes-ctr init: {e}")))?;
            let mut out = data.to_vec();
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
    }
}

/// Inverts [`encrypt`]. Authenticated modes verify the appended tag and
/// fail on any tampering.
pub fn decrypt(
    config: &EncryptionConfig,
    message_id: MessageId,
    data: &[u8],
) -> QueueResult<Vec<u8>> {
    validate(config)?;
    let nonce = derive_nonce(&config.iv, message_id);
    match config.algorithm {
        EncryptionAlgorithm::None => Ok(data.to_vec()),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(&config.key)
                .map_err(|e| QueueError::EncryptionFailed(format!("aes-gcm key: {e}")))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), data)
                .map_err(|_| QueueError::EncryptionFailed("aes-gcm open failed".into()))
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(&config.key)
                .map_err(|e| QueueError::EncryptionFailed(format!("chacha key: {e}")))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), data)
                .map_err(|_| QueueError::EncryptionFailed("chacha open failed".into()))
        }
        EncryptionAlgorithm::Aes256Ctr => {
            let mut cipher = Aes256Ctr::new_from_slices(&config.key, &nonce)
                .map_err(|e| QueueError::EncryptionFailed(format!("aes-ctr init: {e}")))?;
            let mut out = data.to_vec();
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
    }
}

/// Wire name for the algorithm, stamped into message properties.
#[must_use]
pub fn algorithm_name(algorithm: EncryptionAlgorithm) -> &'static str {
    match algorithm {
        EncryptionAlgorithm::None => "NONE",
        EncryptionAlgorithm::Aes256Gcm => "AES_256_GCM",
        EncryptionAlgorithm::Aes256Ctr => "AES_256_CTR",
        EncryptionAlgorithm::ChaCha20Poly1305 => "CHACHA20_POLY1305",
    }
}
