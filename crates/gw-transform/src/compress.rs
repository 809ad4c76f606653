//! Zlib compression transformer selected by the `Compressed` packet flag.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use gw_protocol::packet::ProtocolError;
use gw_protocol::transform::Compressor;

pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    /// `level` follows the mapping config's `1..9` range.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.clamp(1, 9)),
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| ProtocolError::TransformFailure(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| ProtocolError::TransformFailure(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::TransformFailure(e.to_string()))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_payload() {
        let c = ZlibCompressor::new(6);
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbb";
        let compressed = c.compress(data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = c.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn level_is_clamped_into_range() {
        let c = ZlibCompressor::new(20);
        let data = b"short";
        let round = c.decompress(&c.compress(data).unwrap()).unwrap();
        assert_eq!(round, data);
    }
}
