//! Pluggable transformers invoked by the stream processor's transform
//! stack. Order on write is compress -> encrypt; inverse on read.

use crate::packet::ProtocolError;

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}
