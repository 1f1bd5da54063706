//! Per-chunk symmetric encryption for portal streams.
//!
//! Every chunk is sealed with ChaCha20-Poly1305 under a fresh random IV of `key_size` bytes. The
//! AEAD nonce is the first 12 bytes of that IV. A sealed chunk travels as
//!
//! ```text
//! [u32 LE wire length][IV (key_size bytes)][ciphertext + tag]
//! ```
//!
//! where the wire length equals `key_size + len(ciphertext)`.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::TransferError;

/// Cipher key size, also the size of the per-chunk IV
pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
/// Poly1305 authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Session facts established by the authentication handshake.
pub trait Negotiation {
    fn is_encryption_enabled(&self) -> bool;
    fn shared_secret(&self) -> &[u8];
    fn key_size(&self) -> usize {
        KEY_SIZE
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ChunkKey([u8; KEY_SIZE]);

/// Encryption settings for one transfer, built once before the transfer starts.
#[derive(Clone)]
pub struct EncryptionContext {
    key: ChunkKey,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("key_size", &KEY_SIZE)
            .finish_non_exhaustive()
    }
}

impl EncryptionContext {
    /// Use the first `key_size` bytes of `shared_secret` as the chunk key.
    pub fn new(shared_secret: &[u8]) -> Result<Self, TransferError> {
        let Some(material) = shared_secret.get(..KEY_SIZE) else {
            return Err(TransferError::Crypto(format!(
                "shared secret has {} bytes, need at least {KEY_SIZE}",
                shared_secret.len()
            )));
        };
        let mut key = ChunkKey([0u8; KEY_SIZE]);
        key.0.copy_from_slice(material);
        Ok(Self { key })
    }

    /// `None` when the session did not negotiate encryption.
    pub fn from_negotiation<N: Negotiation + ?Sized>(
        negotiation: &N,
    ) -> Result<Option<Self>, TransferError> {
        if !negotiation.is_encryption_enabled() {
            return Ok(None);
        }
        if negotiation.key_size() != KEY_SIZE {
            return Err(TransferError::Crypto(format!(
                "negotiated key size {} is not supported, expected {KEY_SIZE}",
                negotiation.key_size()
            )));
        }
        Self::new(negotiation.shared_secret()).map(Some)
    }

    pub fn key_size(&self) -> usize {
        KEY_SIZE
    }

    pub fn iv_size(&self) -> usize {
        KEY_SIZE
    }

    /// Bytes a sealed chunk adds on top of its plaintext.
    pub fn overhead(&self) -> usize {
        KEY_SIZE + TAG_SIZE
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.key.0))
    }

    pub fn encrypt(&self, iv: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.cipher()
            .encrypt(Nonce::from_slice(&iv[..NONCE_SIZE]), plaintext)
            .map_err(|err| TransferError::Crypto(err.to_string()))
    }

    pub fn decrypt(
        &self,
        iv: &[u8; KEY_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, TransferError> {
        self.cipher()
            .decrypt(Nonce::from_slice(&iv[..NONCE_SIZE]), ciphertext)
            .map_err(|err| TransferError::Crypto(format!("chunk failed authentication: {err}")))
    }

    /// Encrypt under a fresh IV and return `IV || ciphertext`.
    pub fn seal_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        let iv: [u8; KEY_SIZE] = rand::random();
        let ciphertext = self.encrypt(&iv, plaintext)?;
        let mut sealed = Vec::with_capacity(KEY_SIZE + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Split `IV || ciphertext` and decrypt.
    pub fn open_chunk(&self, sealed: &[u8]) -> Result<Vec<u8>, TransferError> {
        if sealed.len() < self.overhead() {
            return Err(TransferError::Crypto(format!(
                "sealed chunk of {} bytes is shorter than IV and tag",
                sealed.len()
            )));
        }
        let (iv, ciphertext) = sealed.split_at(KEY_SIZE);
        let mut iv_bytes = [0u8; KEY_SIZE];
        iv_bytes.copy_from_slice(iv);
        self.decrypt(&iv_bytes, ciphertext)
    }
}
