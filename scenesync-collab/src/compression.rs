//! Block compression stage of the wire codec.
//!
//! The codec never talks to a compressor directly; it goes through
//! [`BlockCompressor`] so the algorithm can be swapped without touching
//! framing. The default is LZ4 block mode with a size prefix.
//!
//! ```text
//!   body ──len ≥ threshold?──▶ compress ──▶ frame.flags |= COMPRESSED
//!        └──── no ────────────────────────▶ frame.body as is
//! ```
//!
//! Performance targets:
//! - Compress 1KB body: <10μs (LZ4 block mode)
//! - Decompress 1KB body: <5μs
//!
//! Reference: Patterson & Hennessy — Section 5.7 (Data Compression)

use std::fmt;

/// A general-purpose block compressor.
pub trait BlockCompressor: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    /// Reverse [`compress`](Self::compress). Errors are reported as text;
    /// the codec wraps them in its own error type.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String>;
}

/// LZ4 block mode, original size prepended.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl BlockCompressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| e.to_string())
    }
}

/// Compression ratio (original / compressed).
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 0.0;
    }
    original as f64 / compressed as f64
}
