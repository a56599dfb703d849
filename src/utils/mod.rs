//! Shared helpers that do not belong to a single layer.
//!
//! # Key Components
//!
//! - [`decompress`] - The LZMA codec collaborator used on the re-hosted initializer's output

/// Decompression of ConfuserEx-packed payloads
pub mod decompress;
