//! zlib compression transform
//!
//! Decoding is capped: input that inflates past the output limit is treated
//! as a corrupt checkpoint rather than buffered.

use super::{Coder, Transform};
use crate::codec::DEFAULT_SIZE_LIMIT;
use crate::error::{CheckpointError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Decoded bytes allowed beyond the checkpoint size limit, for the envelope
/// a store wraps around a checkpoint
pub const ENVELOPE_ALLOWANCE: u64 = 4096;

/// Default cap on decoded output
pub const DEFAULT_OUTPUT_LIMIT: u64 = DEFAULT_SIZE_LIMIT + ENVELOPE_ALLOWANCE;

/// Compression level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Store only (level 0)
    None,
    /// Fast compression (level 1)
    Fast,
    /// Default compression (level 6)
    #[default]
    Default,
    /// Maximum compression (level 9)
    Maximum,
}

impl CompressionLevel {
    fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Maximum => flate2::Compression::best(),
        }
    }
}

/// Deflates checkpoints with a zlib header
#[derive(Debug, Clone, Copy)]
pub struct Compression {
    level: CompressionLevel,
    max_output: u64,
}

impl Default for Compression {
    fn default() -> Self {
        Self::new(CompressionLevel::default())
    }
}

impl Compression {
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            level,
            max_output: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Fail decoding once the inflated data exceeds `max_output` bytes
    pub fn with_max_output(mut self, max_output: u64) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    pub fn max_output(&self) -> u64 {
        self.max_output
    }
}

impl Transform for Compression {
    fn name(&self) -> &str {
        "compression"
    }

    fn encoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(Deflater(self.level.to_flate2())))
    }

    fn decoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(Inflater(self.max_output)))
    }
}

struct Deflater(flate2::Compression);

impl Coder for Deflater {
    fn code(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 64), self.0);
        encoder
            .write_all(&data)
            .map_err(|e| CheckpointError::Transform(format!("deflate: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CheckpointError::Transform(format!("deflate finish: {}", e)))
    }
}

struct Inflater(u64);

impl Coder for Inflater {
    fn code(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        let limit = self.0;
        let mut out = Vec::with_capacity((data.len() * 4).min(limit as usize));
        ZlibDecoder::new(data.as_slice())
            .take(limit.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| CheckpointError::corrupt(format!("inflate: {}", e)))?;
        if out.len() as u64 > limit {
            return Err(CheckpointError::corrupt(format!(
                "inflated data exceeds {} bytes",
                limit
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(level: CompressionLevel, data: &[u8]) -> Vec<u8> {
        let transform = Compression::new(level);
        let encoded = transform.encoder().unwrap().code(data.to_vec()).unwrap();
        transform.decoder().unwrap().code(encoded).unwrap()
    }

    #[test]
    fn test_round_trip_all_levels() {
        let data = b"checkpoint ".repeat(200);
        for level in [
            CompressionLevel::None,
            CompressionLevel::Fast,
            CompressionLevel::Default,
            CompressionLevel::Maximum,
        ] {
            assert_eq!(round_trip(level, &data), data);
        }
        assert_eq!(round_trip(CompressionLevel::Default, b""), b"");
    }

    #[test]
    fn test_compresses_repetitive_data() {
        let data = vec![b'a'; 10_000];
        let encoded = Compression::default()
            .encoder()
            .unwrap()
            .code(data.clone())
            .unwrap();
        assert!(encoded.len() < data.len() / 10);
    }

    #[test]
    fn test_coder_is_reusable() {
        let transform = Compression::default();
        let mut encoder = transform.encoder().unwrap();
        let mut decoder = transform.decoder().unwrap();
        for text in [&b"first"[..], b"second, longer payload", b""] {
            let encoded = encoder.code(text.to_vec()).unwrap();
            assert_eq!(decoder.code(encoded).unwrap(), text);
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        let transform = Compression::default();
        let encoded = transform
            .encoder()
            .unwrap()
            .code(b"some data to compress".repeat(10))
            .unwrap();
        let truncated = encoded[..encoded.len() / 2].to_vec();
        assert!(transform.decoder().unwrap().code(truncated).is_err());
        assert!(transform.decoder().unwrap().code(b"garbage".to_vec()).is_err());
    }

    #[test]
    fn test_highly_compressible_inputs() {
        for size in [1_000, 64 * 1024, 1024 * 1024] {
            let zeros = vec![0u8; size];
            assert_eq!(round_trip(CompressionLevel::Default, &zeros), zeros);
        }
        let text = b"resume the flow at the second prompt ".repeat(5_000);
        assert_eq!(round_trip(CompressionLevel::Maximum, &text), text);
    }

    #[test]
    fn test_output_limit() {
        let transform = Compression::default().with_max_output(1024);
        let small = transform.encoder().unwrap().code(vec![7; 1024]).unwrap();
        assert_eq!(transform.decoder().unwrap().code(small).unwrap().len(), 1024);

        let bomb = transform.encoder().unwrap().code(vec![7; 1025]).unwrap();
        let err = transform.decoder().unwrap().code(bomb).unwrap_err();
        assert!(matches!(err, CheckpointError::CorruptCheckpoint(_)));
    }

    #[test]
    fn test_garbage_is_a_storage_failure() {
        let err = Compression::default()
            .decoder()
            .unwrap()
            .code(b"garbage".to_vec())
            .unwrap_err();
        assert!(err.is_storage_failure(), "{:?}", err);
    }
}
