//! Transparent LZ4 compression for archive blobs
//!
//! **Design**:
//! - Compression threshold: only blobs >= `threshold` bytes are tried
//! - Detection: a stored blob is compressed iff its slot size differs from
//!   the uncompressed size recorded in the header table
//! - Format: raw LZ4 block, no size prefix (the size lives in the hash record)
//! - Fallback: store uncompressed if the ratio is not below `min_ratio`

use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Compression method for archive blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Lz4,
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CompressionConfig {
    /// Try to compress blobs on write
    pub enabled: bool,

    /// Minimum blob size to compress (bytes)
    pub threshold: usize,

    /// Store compressed only when `compressed / original` is below this
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_ratio: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: false,
            threshold: 512,
            min_ratio: 0.9,
        }
    }
}

impl CompressionConfig {
    /// Create config with LZ4 compression enabled
    pub fn lz4() -> Self {
        CompressionConfig {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn method(&self) -> CompressionMethod {
        if self.enabled {
            CompressionMethod::Lz4
        } else {
            CompressionMethod::None
        }
    }
}

pub fn compress(data: &[u8], method: CompressionMethod) -> Vec<u8> {
    match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::block::compress(data),
    }
}

/// Decompress a blob whose original length is known
pub fn decompress(data: &[u8], method: CompressionMethod, uncompressed_size: usize) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => {
            let decompressed = lz4_flex::block::decompress(data, uncompressed_size)
                .map_err(|e| PakError::Compression(format!("LZ4 decompression failed: {}", e)))?;
            if decompressed.len() != uncompressed_size {
                return Err(PakError::Compression(format!(
                    "expected {} bytes, decompressed {}",
                    uncompressed_size,
                    decompressed.len()
                )));
            }
            Ok(decompressed)
        }
    }
}

/// Compress data if beneficial, returns (data, method_used)
pub fn compress_if_beneficial(data: &[u8], config: &CompressionConfig) -> (Vec<u8>, CompressionMethod) {
    if !config.enabled || data.is_empty() || data.len() < config.threshold {
        return (data.to_vec(), CompressionMethod::None);
    }

    let compressed = compress(data, CompressionMethod::Lz4);
    let ratio = compressed.len() as f32 / data.len() as f32;
    if ratio < config.min_ratio {
        (compressed, CompressionMethod::Lz4)
    } else {
        (data.to_vec(), CompressionMethod::None)
    }
}
