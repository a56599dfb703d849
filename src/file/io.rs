//! Little-endian reading and writing helpers for IL streams, blobs and host images.
//!
//! Everything the engine consumes from a module is little-endian: IL operands, field initial
//! values and the decrypted constants blob. This module provides bounds-checked primitives over
//! byte slices together with the growable-buffer writers used when a host unit image is
//! serialized.
//!
//! # Key Components
//!
//! - [`crate::file::io::CilIO`] - Trait implemented by every primitive that can be read from or
//!   written to a byte buffer
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked reads
//! - [`crate::file::io::write_le_at`] - Bounds-checked writes into a fixed buffer
//! - [`crate::file::io::push_le`] - Append a value to a growable buffer
//! - [`crate::file::io::push_compressed_uint`] / [`crate::file::io::push_prefixed_string`] -
//!   ECMA-335 style encodings used by signatures and host images
//!
//! # Examples
//!
//! ```rust
//! use confuserex_constants::file::io::{read_le_at, push_le};
//!
//! let mut buffer = Vec::new();
//! push_le(&mut buffer, 5u32);
//! push_le(&mut buffer, -1i16);
//!
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u32>(&buffer, &mut offset)?, 5);
//! assert_eq!(read_le_at::<i16>(&buffer, &mut offset)?, -1);
//! assert_eq!(offset, 6);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All reading functions return [`crate::Error::OutOfBounds`] if there are insufficient bytes
//! in the buffer to complete the operation.

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary data reading and writing.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size byte
/// array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait CilIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is shorter than `T`.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Arguments
/// * `data` - The byte buffer to read from
/// * `offset` - Position to read from; advanced by `size_of::<T>()` on success
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `offset + size_of::<T>()` exceeds the buffer.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order at `offset`, advancing it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit at `offset`.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();

    let Some(end) = offset.checked_add(bytes.len()) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;

    Ok(())
}

/// Appends a value of type `T` in little-endian byte order to a growable buffer.
pub fn push_le<T: CilIO>(buffer: &mut Vec<u8>, value: T) {
    buffer.extend_from_slice(value.to_le_bytes().as_ref());
}

/// Appends an ECMA-335 II.23.2 compressed unsigned integer.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`, which the encoding
/// cannot represent.
pub fn push_compressed_uint(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    match value {
        0..=0x7F => buffer.push(value as u8),
        0x80..=0x3FFF => {
            buffer.push(((value >> 8) as u8) | 0x80);
            buffer.push(value as u8);
        }
        0x4000..=0x1FFF_FFFF => {
            buffer.push(((value >> 24) as u8) | 0xC0);
            buffer.push((value >> 16) as u8);
            buffer.push((value >> 8) as u8);
            buffer.push(value as u8);
        }
        _ => {
            return Err(malformed_error!(
                "Value {:#x} is too large for a compressed integer",
                value
            ))
        }
    }
    Ok(())
}

/// Appends a 7-bit length prefix followed by the UTF-8 bytes of `value`.
///
/// This is the counterpart of [`crate::file::parser::Parser::read_prefixed_string_utf8`].
pub fn push_prefixed_string(buffer: &mut Vec<u8>, value: &str) {
    let mut length = value.len() as u32;
    loop {
        let mut byte = (length & 0x7F) as u8;
        length >>= 7;
        if length != 0 {
            byte |= 0x80;
        }
        buffer.push(byte);
        if length == 0 {
            break;
        }
    }
    buffer.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Parser;

    #[test]
    fn test_read_le_u32() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_le::<u32>(&data).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_read_le_at_advances() {
        let data = [0xFF, 0xFF, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F];
        let mut offset = 0;
        assert_eq!(read_le_at::<i16>(&data, &mut offset).unwrap(), -1);
        assert_eq!(read_le_at::<u32>(&data, &mut offset).unwrap(), 2);
        assert_eq!(offset, 6);
    }

    #[test]
    fn test_read_le_out_of_bounds() {
        let data = [0x01, 0x02, 0x03];
        assert!(matches!(read_le::<u32>(&data), Err(OutOfBounds)));

        let mut offset = usize::MAX;
        assert!(matches!(
            read_le_at::<u8>(&data, &mut offset),
            Err(OutOfBounds)
        ));
    }

    #[test]
    fn test_write_le_at_bounds() {
        let mut data = [0u8; 6];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 0x1234u16).unwrap();
        write_le_at(&mut data, &mut offset, 1.5f32).unwrap();
        assert_eq!(&data[..2], &[0x34, 0x12]);
        assert_eq!(read_le::<f32>(&data[2..]).unwrap(), 1.5);
        assert!(write_le_at(&mut data, &mut offset, 1u8).is_err());
    }

    #[test]
    fn test_compressed_uint_matches_parser() {
        for value in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1FFF_FFFF] {
            let mut buffer = Vec::new();
            push_compressed_uint(&mut buffer, value).unwrap();
            let mut parser = Parser::new(&buffer);
            assert_eq!(parser.read_compressed_uint().unwrap(), value);
        }
        assert!(push_compressed_uint(&mut Vec::new(), 0x2000_0000).is_err());
    }

    #[test]
    fn test_prefixed_string_long_length() {
        let text = "x".repeat(300);
        let mut buffer = Vec::new();
        push_prefixed_string(&mut buffer, &text);
        assert_eq!(&buffer[..2], &[0xAC, 0x02]);

        let mut parser = Parser::new(&buffer);
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), text);
    }
}
