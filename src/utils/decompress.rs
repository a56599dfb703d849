//! Decompression of obfuscator-embedded payloads.
//!
//! The buffer returned by the re-hosted constants initializer is still compressed: ConfuserEx
//! feeds it through an embedded LZMA decoder before storing it. This module provides that last
//! step natively, behind the [`Decompressor`] seam so tests and callers can swap the codec.
//!
//! # ConfuserEx LZMA Format
//!
//! ConfuserEx uses a custom LZMA layout:
//! - 5 bytes: LZMA decoder properties
//! - 4 bytes: Uncompressed size (little-endian i32, negative when unknown)
//! - Rest: Compressed data stream
//!
//! The standard `.lzma` header `lzma-rs` expects carries the size as a 64-bit value, so the
//! header is rebuilt before decoding.
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::utils::decompress::{Decompressor, LzmaDecompressor};
//!
//! // Too short to even hold the header.
//! assert!(LzmaDecompressor.decompress(&[0x5D, 0x00]).is_err());
//! ```

use std::io::Cursor;

use crate::{Error, Result};

/// Size of the ConfuserEx header (properties + 32-bit size).
const CONFUSEREX_HEADER_LEN: usize = 9;
/// Size of the LZMA properties block.
const PROPERTIES_LEN: usize = 5;

/// Turns a compressed payload back into its plain bytes.
pub trait Decompressor: Send + Sync {
    /// Decompresses `data`.
    ///
    /// # Errors
    /// Returns [`Error::Decompression`] if `data` is not a valid stream for this codec.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The ConfuserEx LZMA codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct LzmaDecompressor;

impl Decompressor for LzmaDecompressor {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        decompress_confuserex_lzma(data)
    }
}

/// Checks if the given data appears to be ConfuserEx LZMA format.
///
/// This is a plausibility check over the header only: a valid properties byte, a dictionary
/// between 1KB and 16MB, and a positive uncompressed size below 10MB.
#[must_use]
pub fn is_confuserex_lzma(data: &[u8]) -> bool {
    if data.len() < CONFUSEREX_HEADER_LEN + 4 {
        return false;
    }

    // lc/lp/pb packed as (pb * 5 + lp) * 9 + lc
    if data[0] > 224 {
        return false;
    }

    let dict_size = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    if !(1024..=16 * 1024 * 1024).contains(&dict_size) {
        return false;
    }

    let uncompressed_size = i32::from_le_bytes([data[5], data[6], data[7], data[8]]);
    uncompressed_size > 0 && uncompressed_size <= 10 * 1024 * 1024
}

/// Rebuilds the ConfuserEx header as a standard `.lzma` header with the given size field.
fn lzma_stream(data: &[u8], size: u64) -> Vec<u8> {
    let compressed = &data[CONFUSEREX_HEADER_LEN..];
    let mut stream = Vec::with_capacity(PROPERTIES_LEN + 8 + compressed.len());
    stream.extend_from_slice(&data[..PROPERTIES_LEN]);
    stream.extend_from_slice(&size.to_le_bytes());
    stream.extend_from_slice(compressed);
    stream
}

fn run_lzma(stream: &[u8]) -> std::result::Result<Vec<u8>, lzma_rs::error::Error> {
    let mut cursor = Cursor::new(stream);
    let mut decompressed = Vec::new();
    lzma_rs::lzma_decompress(&mut cursor, &mut decompressed)?;
    Ok(decompressed)
}

/// Decompresses ConfuserEx LZMA data.
///
/// # Format
///
/// ```text
/// [0..5]  : LZMA properties (5 bytes)
/// [5..9]  : Uncompressed size (4 bytes, little-endian i32)
/// [9..]   : LZMA compressed stream
/// ```
///
/// Streams that carry an end marker despite a declared size are decoded a second time with
/// the size treated as unknown.
///
/// # Errors
/// Returns [`Error::Decompression`] if the header is truncated or the stream is invalid.
pub fn decompress_confuserex_lzma(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < CONFUSEREX_HEADER_LEN {
        return Err(Error::Decompression(format!(
            "{} byte payload is shorter than the LZMA header",
            data.len()
        )));
    }

    let declared = i32::from_le_bytes([data[5], data[6], data[7], data[8]]);
    let Ok(size) = u64::try_from(declared) else {
        return run_lzma(&lzma_stream(data, u64::MAX))
            .map_err(|error| Error::Decompression(error.to_string()));
    };

    match run_lzma(&lzma_stream(data, size)) {
        Ok(decompressed) => Ok(decompressed),
        Err(first) => match run_lzma(&lzma_stream(data, u64::MAX)) {
            Ok(decompressed) if decompressed.len() as u64 == size => Ok(decompressed),
            _ => Err(Error::Decompression(first.to_string())),
        },
    }
}

/// Compresses `data` into the ConfuserEx LZMA layout.
///
/// Used to build test fixtures; the produced stream carries an end marker.
#[cfg(test)]
pub(crate) fn compress_confuserex_lzma(data: &[u8]) -> Vec<u8> {
    let mut standard = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(data), &mut standard).unwrap();

    let mut packed = Vec::with_capacity(standard.len());
    packed.extend_from_slice(&standard[..PROPERTIES_LEN]);
    packed.extend_from_slice(&(data.len() as i32).to_le_bytes());
    packed.extend_from_slice(&standard[PROPERTIES_LEN + 8..]);
    packed
}
