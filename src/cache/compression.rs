//! Cached Payload Compression
//!
//! LZ4 block compression for payload text going into the persistent store.
//! The uncompressed size is prepended to the block so decompression needs no
//! side channel. The mode tag participates in the store's format versioning:
//! if it changes, previously cached payloads are unreadable and the cache
//! subset is wiped at startup.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Tag persisted under the `compressMode` key; bump when the wire format of
/// cached values changes.
pub const COMPRESS_MODE: &str = "lz4-block";

/// Compresses payload text on the way into the store and recovers it on the
/// way out.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    level: i32,
}

impl PayloadCodec {
    /// Create a codec with the default compression level
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create a codec with a custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }

    /// Compress payload text into a storable block
    pub fn compress(&self, text: &str) -> Result<Bytes> {
        let block = lz4::block::compress(
            text.as_bytes(),
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed(e.to_string()))?;
        Ok(Bytes::from(block))
    }

    /// Recover payload text from a stored block
    pub fn decompress(&self, block: &[u8]) -> Result<String> {
        let raw = lz4::block::decompress(block, None)
            .map_err(|e| Error::DecompressionFailed(e.to_string()))?;
        Ok(String::from_utf8(raw)?)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let codec = PayloadCodec::new();
        let text = r#"{"timestamp": 1500000000000, "building": false, "result": "SUCCESS"}"#;

        let block = codec.compress(text).unwrap();
        assert_eq!(codec.decompress(&block).unwrap(), text);
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let codec = PayloadCodec::new();
        let text = r#"{"invocation": "make -w check", "final_code": 0}"#.repeat(200);

        let block = codec.compress(&text).unwrap();
        assert!(block.len() < text.len());
    }

    #[test]
    fn test_garbage_block_is_an_error() {
        let codec = PayloadCodec::new();
        assert!(codec.decompress(b"definitely not lz4").is_err());
    }

    #[test]
    fn test_empty_payload() {
        let codec = PayloadCodec::new();
        let block = codec.compress("").unwrap();
        assert_eq!(codec.decompress(&block).unwrap(), "");
    }
}
