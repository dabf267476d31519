//! Message encoding, AES-CBC encryption and the receive-side decode chain
//!
//! Encrypted frames are `base64(iv || AES-CBC(PKCS7(json)))` with a fresh
//! random 16-byte IV per message. Keys that are not 16, 24 or 32 bytes long
//! are truncated or zero-padded to 16 bytes. That keeps interoperability with
//! deployed nodes but is weak key handling: configure a full-length random key.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;

use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::message::{Envelope, Message};
use crate::protocol::packet::{MinimalPacket, MINIMAL_PACKET_LEN};

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// A decoded radio frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Minimal(MinimalPacket),
}

/// Bring a key to a valid AES length
pub fn normalize_key(key: &[u8]) -> Vec<u8> {
    match key.len() {
        16 | 24 | 32 => key.to_vec(),
        _ => {
            let mut normalized = vec![0u8; 16];
            let n = key.len().min(16);
            normalized[..n].copy_from_slice(&key[..n]);
            normalized
        }
    }
}

fn decryption_failed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::DecryptionFailed {
        reason: reason.into(),
    }
}

fn cbc_encrypt(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        _ => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
    };
    ciphertext.map_err(|e| ProtocolError::EncodeFailed {
        reason: e.to_string(),
    })
}

fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> ProtocolResult<Vec<u8>> {
    let plaintext = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| decryption_failed(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|e| decryption_failed(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        _ => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| decryption_failed(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };
    plaintext.map_err(|_| decryption_failed("invalid padding"))
}

/// Serialises messages and applies the shared-key encryption
#[derive(Clone)]
pub struct MessageCodec {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl MessageCodec {
    /// Codec for the given key; `None` or an empty key disables encryption
    pub fn new(key: Option<&str>) -> Self {
        let key = key
            .filter(|k| !k.is_empty())
            .map(|k| normalize_key(k.as_bytes()));
        Self { key }
    }

    pub fn plaintext() -> Self {
        Self { key: None }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Message to wire bytes
    pub fn encode(&self, message: &Message) -> ProtocolResult<Vec<u8>> {
        let envelope = message.to_envelope().map_err(|e| ProtocolError::EncodeFailed {
            reason: e.to_string(),
        })?;
        let json = serde_json::to_vec(&envelope).map_err(|e| ProtocolError::EncodeFailed {
            reason: e.to_string(),
        })?;
        match &self.key {
            Some(_) => self.encrypt(&json),
            None => Ok(json),
        }
    }

    /// Wire bytes to message, without any fallback
    pub fn decode(&self, bytes: &[u8]) -> ProtocolResult<Message> {
        match &self.key {
            Some(_) => parse_json(&self.decrypt(bytes)?),
            None => parse_json(bytes),
        }
    }

    /// Decode trying, in order: decrypt + JSON, plain JSON, minimal packet
    ///
    /// The plain JSON step lets an encrypting receiver accept unencrypted
    /// senders. When every step fails the first error is returned.
    pub fn decode_frame(&self, bytes: &[u8]) -> ProtocolResult<Frame> {
        let first_error = match self.decode(bytes) {
            Ok(message) => return Ok(Frame::Message(message)),
            Err(e) => e,
        };

        if self.is_encrypted() {
            if let Ok(message) = parse_json(bytes) {
                return Ok(Frame::Message(message));
            }
        }

        if bytes.len() == MINIMAL_PACKET_LEN {
            if let Ok(packet) = MinimalPacket::from_bytes(bytes) {
                return Ok(Frame::Minimal(packet));
            }
        }

        Err(first_error)
    }

    /// `base64(iv || ciphertext)`; plaintext returned unchanged without a key
    pub fn encrypt(&self, plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = cbc_encrypt(key, &iv, plaintext)?;

        let mut combined = Vec::with_capacity(IV_LEN + ciphertext.len());
        combined.extend_from_slice(&iv);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined).into_bytes())
    }

    pub fn decrypt(&self, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(payload.to_vec());
        };

        let text = std::str::from_utf8(payload).map_err(|_| decryption_failed("payload is not base64 text"))?;
        let combined = STANDARD
            .decode(text.trim())
            .map_err(|e| decryption_failed(format!("base64: {}", e)))?;
        if combined.len() < IV_LEN + BLOCK_LEN || (combined.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(decryption_failed(format!(
                "ciphertext length {} is not IV plus whole blocks",
                combined.len()
            )));
        }

        let (iv, ciphertext) = combined.split_at(IV_LEN);
        cbc_decrypt(key, iv, ciphertext)
    }
}

fn parse_json(bytes: &[u8]) -> ProtocolResult<Message> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    Ok(Message::from_envelope(envelope)?)
}
