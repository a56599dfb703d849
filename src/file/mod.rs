//! Byte-level access for IL bodies, blobs and serialized host images.
//!
//! # Key Components
//!
//! - [`crate::file::io`] - Little-endian primitives and buffer writers
//! - [`crate::file::parser`] - Cursor-based parser used by the IL decoder and image loader

pub mod io;
pub mod parser;
