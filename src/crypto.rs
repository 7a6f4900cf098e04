//! Symmetric crypto primitives
//!
//! AES-256-GCM sealing with a fresh random nonce per message. Sealed output is laid
//! out as `nonce(12) || ciphertext || tag(16)`.
use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use bincode::{Decode, Encode};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::crypto_error;
use crate::error::Result;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// A 256-bit symmetric key. The all-zero key means "no key".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Key([u8; KEY_SIZE]);

/// A 96-bit nonce, also used as the flock epoch identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Key {
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parse a hex key. Short strings are right-aligned, so leading zero bytes may
    /// be omitted.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() > KEY_SIZE {
            return Err(crypto_error!(
                "key is {} bytes, at most {} allowed",
                bytes.len(),
                KEY_SIZE
            ));
        }
        let mut key = [0u8; KEY_SIZE];
        key[KEY_SIZE - bytes.len()..].copy_from_slice(&bytes);
        Ok(Key(key))
    }

    pub fn to_hex(&self) -> Result<String> {
        if self.is_zero() {
            return Err(crypto_error!("empty key"));
        }
        Ok(hex::encode(self.0))
    }
}

// Keys only ever print their first four bytes
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl Nonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Nonce(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Nonce(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| crypto_error!("nonce must be {} bytes, got {}", NONCE_SIZE, bytes.len()))?;
        Ok(Nonce(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// Seal `plain` under `key`.
pub fn seal(plain: &[u8], key: &Key) -> Result<Vec<u8>> {
    seal_with_aad(plain, &[], key)
}

/// Seal `plain` under `key`, binding `aad` into the tag.
pub fn seal_with_aad(plain: &[u8], aad: &[u8], key: &Key) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::random();
    let sealed = cipher.encrypt(
        aes_gcm::Nonce::from_slice(nonce.as_bytes()),
        Payload { msg: plain, aad },
    )?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a message produced by [`seal`].
pub fn open(sealed: &[u8], key: &Key) -> Result<Vec<u8>> {
    open_with_aad(sealed, &[], key)
}

/// Open a message produced by [`seal_with_aad`]; `aad` must match exactly.
pub fn open_with_aad(sealed: &[u8], aad: &[u8], key: &Key) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(crypto_error!("sealed message shorter than its nonce"));
    }
    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plain = cipher.decrypt(
        aes_gcm::Nonce::from_slice(nonce),
        Payload { msg: body, aad },
    )?;
    Ok(plain)
}

/// Session key for a handshake: SHA-256 over the X25519 shared secret followed by
/// the initiator nonce and the responder nonce.
pub fn session_key(shared: &[u8; 32], initiator: &Nonce, responder: &Nonce) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(initiator.as_bytes());
    hasher.update(responder.as_bytes());
    let digest: [u8; KEY_SIZE] = hasher.finalize().into();
    Key(digest)
}
