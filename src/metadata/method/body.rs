//! Representation and parsing of CIL method bodies.
//!
//! A [`MethodBody`] holds the decoded instruction list together with the resolved local
//! variable types. Bodies can be read from and written back to the ECMA-335 tiny / fat header
//! layout (II.25.4); the host image uses this layout to persist the bodies it carries. Exception
//! handling sections are not supported: the routines this crate inspects and executes never
//! carry protected regions, and a body that announces extra sections is rejected.
//!
//! # Examples
//!
//! ```rust
//! use confuserex_constants::metadata::method::MethodBody;
//!
//! // Tiny header: (1 byte of code << 2) | 0x2, followed by `ret`
//! let (body, consumed) = MethodBody::parse(&[0x06, 0x2A], Vec::new())?;
//! assert_eq!(consumed, 2);
//! assert_eq!(body.instructions.len(), 1);
//! assert_eq!(body.to_bytes()?, vec![0x06, 0x2A]);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use bitflags::bitflags;

use crate::{
    assembly::{decode_stream, encode_body, Instruction},
    file::io::{push_le, read_le, read_le_at},
    metadata::signatures::TypeSig,
    Error::OutOfBounds,
    Parser, Result,
};

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    /// Flags of the method header (II.25.4.4)
    pub struct MethodBodyFlags: u16 {
        /// Tiny header
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// Extra data sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize locals
        const INIT_LOCALS = 0x10;
    }
}

/// Largest code size a tiny header can describe.
const TINY_MAX_CODE: usize = 0x3F;

/// Default evaluation stack depth assumed for bodies without a fat header.
const TINY_MAX_STACK: u16 = 8;

/// A decoded method body.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// Types of the local variables
    pub locals: Vec<TypeSig>,
    /// The instruction list, in layout order
    pub instructions: Vec<Instruction>,
}

impl MethodBody {
    /// Creates a body from already decoded instructions.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>, locals: Vec<TypeSig>) -> Self {
        MethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: !locals.is_empty(),
            locals,
            instructions,
        }
    }

    /// Decodes raw IL bytes (without a method header).
    ///
    /// # Errors
    /// Returns an error if the IL does not decode.
    pub fn from_il(code: &[u8], locals: Vec<TypeSig>) -> Result<Self> {
        let instructions = decode_stream(&mut Parser::new(code))?;
        Ok(Self::new(instructions, locals))
    }

    /// Parses a header-prefixed body and returns it with the number of bytes consumed.
    ///
    /// The local variable signature token of a fat header is ignored; `locals` supplies the
    /// resolved local types instead.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data and [`crate::Error::Malformed`]
    /// for unknown header formats or bodies with extra data sections.
    pub fn parse(data: &[u8], locals: Vec<TypeSig>) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_00000011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                let code = data.get(1..=size_code).ok_or(OutOfBounds)?;

                let mut body = Self::from_il(code, locals)?;
                body.max_stack = TINY_MAX_STACK;
                body.init_locals = false;
                Ok((body, size_code + 1))
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let mut cursor = 0;
                let first_duo = read_le_at::<u16>(data, &mut cursor)?;
                let max_stack = read_le_at::<u16>(data, &mut cursor)?;
                let size_code = read_le_at::<u32>(data, &mut cursor)? as usize;
                let _local_var_sig_token = read_le_at::<u32>(data, &mut cursor)?;

                let size_header = ((first_duo >> 12) * 4) as usize;
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000111111111111_u16);
                if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    return Err(malformed_error!(
                        "Method bodies with extra data sections are not supported"
                    ));
                }

                let end = size_header.checked_add(size_code).ok_or(OutOfBounds)?;
                let code = data.get(size_header..end).ok_or(OutOfBounds)?;

                let mut body = Self::from_il(code, locals)?;
                body.max_stack = max_stack;
                body.init_locals = flags_header.contains(MethodBodyFlags::INIT_LOCALS);
                Ok((body, end))
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Encodes the body with a tiny header when possible, a fat one otherwise.
    ///
    /// # Errors
    /// Returns an error if the instructions cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let code = encode_body(&self.instructions)?;

        let tiny = code.len() <= TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK
            && self.locals.is_empty()
            && !self.init_locals;

        let mut buffer = Vec::with_capacity(code.len() + 12);
        if tiny {
            #[allow(clippy::cast_possible_truncation)]
            buffer.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        } else {
            let mut flags = MethodBodyFlags::FAT_FORMAT;
            if self.init_locals {
                flags |= MethodBodyFlags::INIT_LOCALS;
            }
            let size_code = u32::try_from(code.len())
                .map_err(|_| malformed_error!("Method body too large - {}", code.len()))?;

            push_le::<u16>(&mut buffer, (3 << 12) | flags.bits());
            push_le::<u16>(&mut buffer, self.max_stack);
            push_le::<u32>(&mut buffer, size_code);
            push_le::<u32>(&mut buffer, 0);
        }
        buffer.extend_from_slice(&code);
        Ok(buffer)
    }

    /// Index of the instruction located at `offset`.
    #[must_use]
    pub fn index_of_offset(&self, offset: u64) -> Option<usize> {
        self.instructions.iter().position(|i| i.offset == offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny() {
        let data = [0x0A, 0x16, 0x2A];
        let (body, consumed) = MethodBody::parse(&data, Vec::new()).unwrap();

        assert_eq!(consumed, 3);
        assert_eq!(body.max_stack, 8);
        assert!(!body.init_locals);
        assert_eq!(body.instructions.len(), 2);
        assert_eq!(body.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_fat() {
        let data = [
            0x13, 0x30, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x11, 0x06, 0x2A,
        ];
        let (body, consumed) = MethodBody::parse(&data, vec![TypeSig::I4]).unwrap();

        assert_eq!(consumed, data.len());
        assert_eq!(body.max_stack, 2);
        assert!(body.init_locals);
        assert_eq!(body.instructions[0].mnemonic, "ldloc.0");
        assert_eq!(body.index_of_offset(1), Some(1));

        let encoded = body.to_bytes().unwrap();
        let (again, _) = MethodBody::parse(&encoded, vec![TypeSig::I4]).unwrap();
        assert_eq!(again, body);
    }

    #[test]
    fn test_truncated_and_unsupported() {
        assert!(MethodBody::parse(&[], Vec::new()).is_err());
        assert!(matches!(
            MethodBody::parse(&[0x0A, 0x16], Vec::new()),
            Err(OutOfBounds)
        ));

        let with_sections = [
            0x1B, 0x30, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A,
        ];
        assert!(MethodBody::parse(&with_sections, Vec::new()).is_err());
    }
}
