//! Offset derivation and value decoding.
//!
//! A recognized decryptor turns its `uint` argument into a key, masks the key to 30 bits and
//! shifts it left by two to obtain a 4-aligned byte offset into the decrypted blob. What is
//! stored at that offset depends on the instantiated type argument:
//!
//! ```text
//! string : [len: u32][len bytes of UTF-8]
//! scalar : [size_of(T) bytes, little-endian]
//! array  : [count: i32][unused: 4 bytes][count - 4 payload bytes]
//! ```
//!
//! Decoding is a pure function of the site's classification, the blob and the index; nothing
//! is retained between calls.

use std::{fmt, sync::Arc};

use crate::{
    emulation::{evaluate_native_key, NativeEmulator, NativeRoutine},
    metadata::{signatures::ElementType, token::Token},
    Error, Result,
};

/// Mask applied to a key before it is scaled to a byte offset.
pub const KEY_MASK: u32 = 0x3FFF_FFFF;

/// Derives the blob offset from a 32-bit key: `(key & 0x3FFFFFFF) << 2`.
///
/// The result is always a multiple of four.
#[must_use]
pub fn derive_offset(key: u32) -> u32 {
    (key & KEY_MASK) << 2
}

/// The arithmetic-mode key: `(index * multiplier) ^ xor_key` with 32-bit wraparound.
#[must_use]
pub fn arithmetic_key(index: u32, multiplier: u32, xor_key: u32) -> u32 {
    index.wrapping_mul(multiplier) ^ xor_key
}

/// The decrypted constants buffer of one module.
///
/// Cloning shares the underlying bytes; the contents never change after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptedBlob {
    data: Arc<[u8]>,
}

impl DecryptedBlob {
    /// Wraps the decompressed bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        DecryptedBlob {
            data: Arc::from(data),
        }
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A bounds-checked view of `length` bytes at `offset`.
    ///
    /// # Errors
    /// Returns [`Error::OffsetOutOfRange`] if the range does not fit the blob.
    pub fn slice(&self, offset: u32, length: usize) -> Result<&[u8]> {
        let out_of_range = || Error::OffsetOutOfRange {
            offset,
            length,
            blob_len: self.data.len(),
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start.checked_add(length).ok_or_else(out_of_range)?;
        self.data.get(start..end).ok_or_else(out_of_range)
    }

    fn read_u32(&self, offset: u32) -> Result<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a string record at `offset`.
    ///
    /// # Errors
    /// Returns [`Error::OffsetOutOfRange`] for truncated records and [`Error::InvalidUtf8`] if
    /// the payload is not UTF-8.
    pub fn read_string(&self, offset: u32) -> Result<&str> {
        let length = self.read_u32(offset)? as usize;
        let payload_offset = offset.checked_add(4).ok_or(Error::OffsetOutOfRange {
            offset,
            length,
            blob_len: self.data.len(),
        })?;
        let bytes = self.slice(payload_offset, length)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8(offset))
    }

    /// Reads a little-endian scalar at `offset`.
    ///
    /// # Errors
    /// Returns [`Error::OffsetOutOfRange`] if fewer than `T::SIZE` bytes remain.
    pub fn read_scalar<T: Scalar>(&self, offset: u32) -> Result<T> {
        Ok(T::from_le(self.slice(offset, T::SIZE)?))
    }

    /// Reads an array record at `offset`.
    ///
    /// # Errors
    /// Returns [`Error::OffsetOutOfRange`] for truncated records and
    /// [`Error::InvalidArrayRecord`] if the count is below four.
    pub fn read_array(&self, offset: u32) -> Result<Vec<u8>> {
        let count = self.read_u32(offset)? as i32;
        let Some(length) = count.checked_sub(4).and_then(|n| usize::try_from(n).ok()) else {
            return Err(Error::InvalidArrayRecord { offset, count });
        };
        let payload_offset = offset.checked_add(8).ok_or(Error::OffsetOutOfRange {
            offset,
            length,
            blob_len: self.data.len(),
        })?;
        Ok(self.slice(payload_offset, length)?.to_vec())
    }
}

impl fmt::Debug for DecryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedBlob")
            .field("len", &self.data.len())
            .finish()
    }
}

/// A primitive that can be read from the blob.
pub trait Scalar: Copy + Sized {
    /// Size in bytes.
    const SIZE: usize;
    /// The element type of the generic argument that selects this decoder.
    const ELEMENT_TYPE: ElementType;

    /// Builds the value from exactly [`Self::SIZE`] little-endian bytes.
    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => $element:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                const ELEMENT_TYPE: ElementType = ElementType::$element;

                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar! {
    i8 => I1,
    u8 => U1,
    i16 => I2,
    u16 => U2,
    i32 => I4,
    u32 => U4,
    i64 => I8,
    u64 => U8,
    f32 => R4,
    f64 => R8,
}

/// How a site derives its key from the call-site index.
#[derive(Debug, Clone)]
pub enum SiteMode {
    /// The index is passed through a native x86 routine.
    Native {
        /// The routine computing the key
        routine: NativeRoutine,
    },
    /// The key is `(index * multiplier) ^ xor_key`.
    Arithmetic {
        /// Multiplication constant
        multiplier: u32,
        /// XOR constant
        xor_key: u32,
    },
}

/// One recognized `T Get<T>(uint)` decryptor.
#[derive(Debug, Clone)]
pub struct DecryptionSite {
    method: Token,
    mode: SiteMode,
    blob: DecryptedBlob,
}

impl DecryptionSite {
    /// Creates a site over `blob`.
    #[must_use]
    pub fn new(method: Token, mode: SiteMode, blob: DecryptedBlob) -> Self {
        DecryptionSite { method, mode, blob }
    }

    /// The decryptor method.
    #[must_use]
    pub fn method(&self) -> Token {
        self.method
    }

    /// The key derivation mode.
    #[must_use]
    pub fn mode(&self) -> &SiteMode {
        &self.mode
    }

    /// The blob this site reads from.
    #[must_use]
    pub fn blob(&self) -> &DecryptedBlob {
        &self.blob
    }

    /// Returns `true` for native-mode sites.
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.mode, SiteMode::Native { .. })
    }

    /// The blob offset `index` refers to.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedNativeKey`] if a native routine cannot be evaluated.
    pub fn compute_offset(&self, emulator: &dyn NativeEmulator, index: u32) -> Result<u32> {
        let key = match &self.mode {
            SiteMode::Native { routine } => evaluate_native_key(emulator, routine, index)?,
            SiteMode::Arithmetic {
                multiplier,
                xor_key,
            } => arithmetic_key(index, *multiplier, *xor_key),
        };
        Ok(derive_offset(key))
    }

    /// Decodes the string for `index`.
    ///
    /// # Errors
    /// See [`Self::compute_offset`] and [`DecryptedBlob::read_string`].
    pub fn decrypt_string(&self, emulator: &dyn NativeEmulator, index: u32) -> Result<&str> {
        let offset = self.compute_offset(emulator, index)?;
        self.blob.read_string(offset)
    }

    /// Decodes the scalar for `index`.
    ///
    /// # Errors
    /// See [`Self::compute_offset`] and [`DecryptedBlob::read_scalar`].
    pub fn decrypt_scalar<T: Scalar>(&self, emulator: &dyn NativeEmulator, index: u32) -> Result<T> {
        let offset = self.compute_offset(emulator, index)?;
        self.blob.read_scalar(offset)
    }

    /// Decodes the byte array for `index`.
    ///
    /// # Errors
    /// See [`Self::compute_offset`] and [`DecryptedBlob::read_array`].
    pub fn decrypt_array(&self, emulator: &dyn NativeEmulator, index: u32) -> Result<Vec<u8>> {
        let offset = self.compute_offset(emulator, index)?;
        self.blob.read_array(offset)
    }
}

/// A value decoded for a call site, tagged by the instantiated type argument.
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptedValue {
    /// `string`
    String(Arc<str>),
    /// `sbyte`
    I1(i8),
    /// `byte`
    U1(u8),
    /// `short`
    I2(i16),
    /// `ushort`
    U2(u16),
    /// `int`
    I4(i32),
    /// `uint`
    U4(u32),
    /// `long`
    I8(i64),
    /// `ulong`
    U8(u64),
    /// `float`
    R4(f32),
    /// `double`
    R8(f64),
    /// Any single-dimensional array, as raw bytes
    Array(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::{FnEmulator, UnsupportedEmulator};

    fn string_record(value: &str) -> Vec<u8> {
        let mut record = (value.len() as u32).to_le_bytes().to_vec();
        record.extend_from_slice(value.as_bytes());
        record
    }

    fn arithmetic(blob: Vec<u8>) -> DecryptionSite {
        DecryptionSite::new(
            Token::new(0x0600_0002),
            SiteMode::Arithmetic {
                multiplier: 1,
                xor_key: 0,
            },
            DecryptedBlob::new(blob),
        )
    }

    #[test]
    fn test_offset_derivation() {
        assert_eq!(derive_offset(0), 0);
        assert_eq!(derive_offset(1), 4);
        assert_eq!(derive_offset(0xFFFF_FFFF), 0xFFFF_FFFC);
        assert_eq!(derive_offset(0xC000_0001), 4);
        for key in [0u32, 3, 0x1234_5678, 0x8000_0000, u32::MAX] {
            assert_eq!(derive_offset(key) % 4, 0);
            assert_eq!(derive_offset(key), (key & 0x3FFF_FFFF) << 2);
        }
    }

    #[test]
    fn test_arithmetic_key_wraps() {
        assert_eq!(arithmetic_key(3, 5, 1), 14);
        assert_eq!(
            arithmetic_key(0xFFFF_FFFF, 2, 0),
            0xFFFF_FFFE,
            "multiplication wraps at 32 bits"
        );
        assert_eq!(
            arithmetic_key(0x1234, 0xAA51_7E3D, 0x4749_6F55),
            arithmetic_key(0x1234, 0xAA51_7E3D, 0x4749_6F55)
        );
    }

    #[test]
    fn test_hello_scenario() {
        let site = arithmetic(vec![0x05, 0, 0, 0, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(site.decrypt_string(&UnsupportedEmulator, 0).unwrap(), "Hello");
    }

    #[test]
    fn test_strings() {
        let mut blob = string_record("");
        blob.extend(string_record("Grüße, 世界"));
        let site = arithmetic(blob);

        assert_eq!(site.decrypt_string(&UnsupportedEmulator, 0).unwrap(), "");
        assert_eq!(
            site.decrypt_string(&UnsupportedEmulator, 1).unwrap(),
            "Grüße, 世界"
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let site = arithmetic(vec![2, 0, 0, 0, 0xC3, 0x28]);
        assert!(matches!(
            site.decrypt_string(&UnsupportedEmulator, 0),
            Err(Error::InvalidUtf8(0))
        ));
    }

    #[test]
    fn test_scalars() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&[u8::MAX, 0, 0, 0]);
        blob.extend_from_slice(&i16::MIN.to_le_bytes());
        blob.extend_from_slice(&[0; 2]);
        blob.extend_from_slice(&u16::MAX.to_le_bytes());
        blob.extend_from_slice(&[0; 2]);
        blob.extend_from_slice(&i32::MIN.to_le_bytes());
        blob.extend_from_slice(&i64::MIN.to_le_bytes());
        blob.extend_from_slice(&0x7F7F_FFFFu32.to_le_bytes());
        blob.extend_from_slice(&0x3FF8_0000_0000_0001u64.to_le_bytes());
        blob.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let site = arithmetic(blob);
        let e = &UnsupportedEmulator;

        assert_eq!(site.decrypt_scalar::<u8>(e, 0).unwrap(), u8::MAX);
        assert_eq!(site.decrypt_scalar::<i8>(e, 0).unwrap(), -1);
        assert_eq!(site.decrypt_scalar::<i16>(e, 1).unwrap(), i16::MIN);
        assert_eq!(site.decrypt_scalar::<u16>(e, 1).unwrap(), 0x8000);
        assert_eq!(site.decrypt_scalar::<u16>(e, 2).unwrap(), u16::MAX);
        assert_eq!(site.decrypt_scalar::<i16>(e, 2).unwrap(), -1);
        assert_eq!(site.decrypt_scalar::<i32>(e, 3).unwrap(), i32::MIN);
        assert_eq!(site.decrypt_scalar::<u32>(e, 3).unwrap(), 0x8000_0000);
        assert_eq!(site.decrypt_scalar::<i64>(e, 4).unwrap(), i64::MIN);
        assert_eq!(site.decrypt_scalar::<u64>(e, 4).unwrap(), 0x8000_0000_0000_0000);
        assert_eq!(site.decrypt_scalar::<f32>(e, 6).unwrap().to_bits(), 0x7F7F_FFFF);
        assert_eq!(site.decrypt_scalar::<f32>(e, 6).unwrap(), f32::MAX);
        assert_eq!(
            site.decrypt_scalar::<f64>(e, 7).unwrap().to_bits(),
            0x3FF8_0000_0000_0001
        );
        assert_eq!(site.decrypt_scalar::<u64>(e, 0).unwrap(), 0x0000_8000_0000_00FF);

        // The last record ends exactly at the end of the blob
        assert_eq!(site.decrypt_scalar::<u32>(e, 9).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(
            site.decrypt_scalar::<u64>(e, 9),
            Err(Error::OffsetOutOfRange {
                offset: 36,
                length: 8,
                blob_len: 40
            })
        ));
    }

    #[test]
    fn test_arrays() {
        let payload = [1u8, 2, 3, 4, 5];
        let mut blob = ((payload.len() + 4) as i32).to_le_bytes().to_vec();
        blob.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        blob.extend_from_slice(&payload);
        blob.extend_from_slice(&[0; 3]);
        blob.extend_from_slice(&4i32.to_le_bytes());
        blob.extend_from_slice(&0i32.to_le_bytes());
        let site = arithmetic(blob);

        assert_eq!(site.decrypt_array(&UnsupportedEmulator, 0).unwrap(), payload);
        assert!(site.decrypt_array(&UnsupportedEmulator, 4).unwrap().is_empty());
    }

    #[test]
    fn test_bad_array_count() {
        let site = arithmetic(vec![3, 0, 0, 0, 0, 0, 0, 0]);
        let error = site.decrypt_array(&UnsupportedEmulator, 0).unwrap_err();
        assert!(matches!(
            error,
            Error::InvalidArrayRecord {
                offset: 0,
                count: 3
            }
        ));
        assert!(!error.is_detection_failure());
    }

    #[test]
    fn test_out_of_range() {
        let site = arithmetic(vec![0x10, 0, 0, 0, b'a']);
        assert!(matches!(
            site.decrypt_string(&UnsupportedEmulator, 0),
            Err(Error::OffsetOutOfRange {
                offset: 4,
                length: 16,
                blob_len: 5
            })
        ));
        assert!(matches!(
            site.decrypt_scalar::<u64>(&UnsupportedEmulator, 0x0FFF_FFFF),
            Err(Error::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_native_mode() {
        let routine = NativeRoutine::new(Token::new(0x0600_0009), "Key", Arc::from(&[0xC3u8][..]));
        let site = DecryptionSite::new(
            Token::new(0x0600_0003),
            SiteMode::Native { routine },
            DecryptedBlob::new(string_record("native")),
        );
        assert!(site.is_native());

        let emulator = FnEmulator::new(|_: &NativeRoutine, input: i32| Some(input - 7));
        assert_eq!(site.decrypt_string(&emulator, 7).unwrap(), "native");

        assert!(matches!(
            site.decrypt_string(&UnsupportedEmulator, 7),
            Err(Error::UnresolvedNativeKey { index: 7, .. })
        ));
    }
}
