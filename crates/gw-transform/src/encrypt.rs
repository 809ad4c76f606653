//! AEAD-chunked encryption transformer.
//!
//! Wire format per chunk: `[chunk_len:4 BE][nonce:12][ciphertext+tag]`.
//! `chunk_len` counts the ciphertext+tag bytes only — the nonce is always
//! 12 bytes. Plaintext is split into 64 KiB chunks before encryption; each
//! chunk gets a fresh nonce derived from a per-instance monotonic counter,
//! so two calls to `encrypt` from the same `Encryptor` never reuse a nonce.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, KeyInit as _, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};

use gw_protocol::packet::ProtocolError;
use gw_protocol::transform::Encryptor;

pub const CHUNK_SIZE: usize = 64 * 1024;

fn next_nonce(counter: &AtomicU64) -> [u8; 12] {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&n.to_be_bytes());
    nonce
}

fn encode_chunks(
    data: &[u8],
    counter: &AtomicU64,
    mut seal: impl FnMut(&[u8; 12], &[u8]) -> Result<Vec<u8>, ProtocolError>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len() + data.len() / CHUNK_SIZE * 28 + 28);
    for chunk in data.chunks(CHUNK_SIZE) {
        let nonce = next_nonce(counter);
        let sealed = seal(&nonce, chunk)?;
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}

fn decode_chunks(
    data: &[u8],
    mut open: impl FnMut(&[u8; 12], &[u8]) -> Result<Vec<u8>, ProtocolError>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    while pos < data.len() {
        if data.len() - pos < 4 + 12 {
            return Err(ProtocolError::Malformed("truncated aead chunk header".into()));
        }
        let chunk_len =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        let nonce: [u8; 12] = data[pos..pos + 12]
            .try_into()
            .map_err(|_| ProtocolError::Malformed("bad nonce length".into()))?;
        pos += 12;
        if data.len() - pos < chunk_len {
            return Err(ProtocolError::Malformed("truncated aead chunk body".into()));
        }
        let ciphertext = &data[pos..pos + chunk_len];
        pos += chunk_len;
        out.extend_from_slice(&open(&nonce, ciphertext)?);
    }
    Ok(out)
}

pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
    counter: AtomicU64,
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            counter: AtomicU64::new(0),
        }
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        encode_chunks(data, &self.counter, |nonce, chunk| {
            self.cipher
                .encrypt(AesNonce::from_slice(nonce), chunk)
                .map_err(|e| ProtocolError::TransformFailure(e.to_string()))
        })
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        decode_chunks(data, |nonce, ciphertext| {
            self.cipher
                .decrypt(AesNonce::from_slice(nonce), ciphertext)
                .map_err(|e| ProtocolError::TransformFailure(e.to_string()))
        })
    }
}

pub struct ChaCha20Poly1305Encryptor {
    cipher: ChaCha20Poly1305,
    counter: AtomicU64,
}

impl ChaCha20Poly1305Encryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            counter: AtomicU64::new(0),
        }
    }
}

impl Encryptor for ChaCha20Poly1305Encryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        encode_chunks(data, &self.counter, |nonce, chunk| {
            self.cipher
                .encrypt(ChaChaNonce::from_slice(nonce), chunk)
                .map_err(|e| ProtocolError::TransformFailure(e.to_string()))
        })
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        decode_chunks(data, |nonce, ciphertext| {
            self.cipher
                .decrypt(ChaChaNonce::from_slice(nonce), ciphertext)
                .map_err(|e| ProtocolError::TransformFailure(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trips_small_payload() {
        let key = [7u8; 32];
        let enc = AesGcmEncryptor::new(&key);
        let plaintext = b"tunnel payload bytes";
        let ct = enc.encrypt(plaintext).unwrap();
        let pt = enc.decrypt(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn chacha_round_trips_multi_chunk_payload() {
        let key = [3u8; 32];
        let enc = ChaCha20Poly1305Encryptor::new(&key);
        let plaintext = vec![0xAB; CHUNK_SIZE * 2 + 17];
        let ct = enc.encrypt(&plaintext).unwrap();
        let pt = enc.decrypt(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn successive_chunks_use_distinct_nonces() {
        let key = [1u8; 32];
        let enc = AesGcmEncryptor::new(&key);
        let a = enc.encrypt(b"first").unwrap();
        let b = enc.encrypt(b"second").unwrap();
        // nonce occupies bytes [4..16) of each single-chunk frame.
        assert_ne!(&a[4..16], &b[4..16]);
    }
}
