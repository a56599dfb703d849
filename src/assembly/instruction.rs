//! CIL instruction representation, operand types and shape predicates.
//!
//! # Architecture
//!
//! The module is organized around the central [`crate::assembly::instruction::Instruction`]
//! struct. Branch operands are stored as absolute [`Operand::Target`] offsets rather than
//! relative displacements; because the `offset` of an instruction survives body rewriting
//! (replacement instructions inherit the offset of the first instruction they replace), an
//! offset doubles as a stable identity for branch targets across IL surgery. The encoder maps
//! these identities back to real byte positions when a body is serialized.
//!
//! # Key Components
//!
//! - [`crate::assembly::instruction::Instruction`] - A decoded instruction
//! - [`crate::assembly::instruction::Operand`] - Type-safe operand representation
//! - [`crate::assembly::instruction::Immediate`] - Immediate value types with conversions
//! - [`crate::assembly::instruction::FlowType`] - Control flow behavior classification
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::assembly::{opcodes, Instruction, Operand, Immediate};
//!
//! let push = Instruction::new(0, opcodes::LDC_I4_S, Operand::Immediate(Immediate::Int8(-3)))?;
//! assert!(push.is_ldc_i4());
//! assert_eq!(push.ldc_i4_value(), Some(-3));
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use std::fmt::{self, UpperHex};

use crate::{
    assembly::opcodes::{self, FE_PREFIX},
    metadata::token::Token,
    Error, Result,
};

/// The operand encoding that follows an opcode in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit value (short branches, `ldc.i4.s`)
    Int8,
    /// Unsigned 8-bit value (short argument / local indices)
    UInt8,
    /// Unsigned 16-bit value (long argument / local indices)
    UInt16,
    /// Signed 32-bit value (long branches, `ldc.i4`)
    Int32,
    /// Signed 64-bit value
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Metadata token
    Token,
    /// Jump table: count followed by that many 32-bit displacements
    Switch,
}

impl OperandType {
    /// Encoded size of the operand, `None` for the variable-length switch table.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// An immediate operand value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub enum Immediate {
    Int8(i8),
    UInt8(u8),
    UInt16(u16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::UInt16(value) => write!(f, "{value:04X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl From<Immediate> for u64 {
    fn from(val: Immediate) -> Self {
        match val {
            // Signed integers keep their bit pattern
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int8(value) => value as u64,
            Immediate::UInt8(value) => u64::from(value),
            Immediate::UInt16(value) => u64::from(value),
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int32(value) => value as u64,
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int64(value) => value as u64,
            Immediate::Float32(value) => u64::from(value.to_bits()),
            Immediate::Float64(value) => value.to_bits(),
        }
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// An immediate value (constants, argument / local indices)
    Immediate(Immediate),
    /// Absolute offset of a branch target
    Target(u64),
    /// A metadata token
    Token(Token),
    /// Absolute offsets of switch targets
    Switch(Vec<u64>),
}

/// Control flow behavior of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FlowType {
    Sequential,
    ConditionalBranch,
    UnconditionalBranch,
    Call,
    Return,
    Switch,
    Throw,
    EndFinally,
    Leave,
}

/// A single CIL instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    /// Offset within the original method body; stable across rewrites
    pub offset: u64,
    /// Encoded size in bytes, as decoded
    pub size: u64,
    /// Opcode byte (second byte for two-byte opcodes)
    pub opcode: u8,
    /// `0` or [`FE_PREFIX`]
    pub prefix: u8,
    /// Textual mnemonic
    pub mnemonic: &'static str,
    /// Control flow classification
    pub flow_type: FlowType,
    /// The operand
    pub operand: Operand,
}

impl Instruction {
    /// Creates a single-byte-opcode instruction at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidMnemonic`] for unassigned opcodes.
    pub fn new(offset: u64, opcode: u8, operand: Operand) -> Result<Self> {
        Self::with_prefix(offset, 0, opcode, operand)
    }

    /// Creates an instruction, including two-byte opcodes.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidMnemonic`] for unassigned opcodes.
    pub fn with_prefix(offset: u64, prefix: u8, opcode: u8, operand: Operand) -> Result<Self> {
        let Some(info) = opcodes::lookup(prefix, opcode) else {
            return Err(Error::InvalidMnemonic(format!("{prefix:02X} {opcode:02X}")));
        };

        Ok(Instruction {
            offset,
            size: 0,
            opcode,
            prefix,
            mnemonic: info.instr,
            flow_type: info.flow,
            operand,
        })
    }

    /// `ldarg.0` at `offset`
    #[must_use]
    pub fn ldarg_0(offset: u64) -> Self {
        Self::simple(offset, opcodes::LDARG_0, "ldarg.0", FlowType::Sequential)
    }

    /// `ret` at `offset`
    #[must_use]
    pub fn ret(offset: u64) -> Self {
        Self::simple(offset, opcodes::RET, "ret", FlowType::Return)
    }

    fn simple(offset: u64, opcode: u8, mnemonic: &'static str, flow_type: FlowType) -> Self {
        Instruction {
            offset,
            size: 1,
            opcode,
            prefix: 0,
            mnemonic,
            flow_type,
            operand: Operand::None,
        }
    }

    /// Returns `true` for the single-byte opcode `opcode`.
    #[must_use]
    pub fn is(&self, opcode: u8) -> bool {
        self.prefix == 0 && self.opcode == opcode
    }

    /// Returns `true` for the two-byte opcode `0xFE opcode`.
    #[must_use]
    pub fn is_fe(&self, opcode: u8) -> bool {
        self.prefix == FE_PREFIX && self.opcode == opcode
    }

    /// Any form of `ldc.i4`.
    #[must_use]
    pub fn is_ldc_i4(&self) -> bool {
        self.prefix == 0 && (opcodes::LDC_I4_M1..=opcodes::LDC_I4).contains(&self.opcode)
    }

    /// The constant pushed by an `ldc.i4` form.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        if !self.is_ldc_i4() {
            return None;
        }
        match (self.opcode, &self.operand) {
            (opcodes::LDC_I4_S, Operand::Immediate(Immediate::Int8(value))) => {
                Some(i32::from(*value))
            }
            (opcodes::LDC_I4, Operand::Immediate(Immediate::Int32(value))) => Some(*value),
            (opcode, _) if opcode <= opcodes::LDC_I4_8 => {
                Some(i32::from(opcode) - i32::from(opcodes::LDC_I4_0))
            }
            _ => None,
        }
    }

    /// Any form of `ldarg`.
    #[must_use]
    pub fn is_ldarg(&self) -> bool {
        (self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::LDARG_0..=opcodes::LDARG_3 | opcodes::LDARG_S
            ))
            || self.is_fe(opcodes::FE_LDARG)
    }

    /// Any form of `starg`.
    #[must_use]
    pub fn is_starg(&self) -> bool {
        self.is(opcodes::STARG_S) || self.is_fe(opcodes::FE_STARG)
    }

    /// Any form of `stloc`.
    #[must_use]
    pub fn is_stloc(&self) -> bool {
        (self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::STLOC_0..=opcodes::STLOC_3 | opcodes::STLOC_S
            ))
            || self.is_fe(opcodes::FE_STLOC)
    }

    /// Any form of `ldloca`.
    #[must_use]
    pub fn is_ldloca(&self) -> bool {
        self.is(opcodes::LDLOCA_S) || self.is_fe(opcodes::FE_LDLOCA)
    }

    /// `call`, `callvirt` or `newobj`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::CALL | opcodes::CALLVIRT | opcodes::NEWOBJ
            )
    }

    /// The argument index of an `ldarg`, `ldarga` or `starg` form.
    #[must_use]
    pub fn arg_index(&self) -> Option<u16> {
        match (self.prefix, self.opcode) {
            (0, op @ opcodes::LDARG_0..=opcodes::LDARG_3) => {
                Some(u16::from(op - opcodes::LDARG_0))
            }
            (0, opcodes::LDARG_S | opcodes::LDARGA_S | opcodes::STARG_S)
            | (FE_PREFIX, opcodes::FE_LDARG | opcodes::FE_LDARGA | opcodes::FE_STARG) => {
                self.index_operand()
            }
            _ => None,
        }
    }

    /// The local index of an `ldloc`, `ldloca` or `stloc` form.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match (self.prefix, self.opcode) {
            (0, op @ opcodes::LDLOC_0..=opcodes::LDLOC_3) => {
                Some(u16::from(op - opcodes::LDLOC_0))
            }
            (0, op @ opcodes::STLOC_0..=opcodes::STLOC_3) => {
                Some(u16::from(op - opcodes::STLOC_0))
            }
            (0, opcodes::LDLOC_S | opcodes::LDLOCA_S | opcodes::STLOC_S)
            | (FE_PREFIX, opcodes::FE_LDLOC | opcodes::FE_LDLOCA | opcodes::FE_STLOC) => {
                self.index_operand()
            }
            _ => None,
        }
    }

    fn index_operand(&self) -> Option<u16> {
        match self.operand {
            Operand::Immediate(Immediate::UInt8(value)) => Some(u16::from(value)),
            Operand::Immediate(Immediate::UInt16(value)) => Some(value),
            _ => None,
        }
    }

    /// The token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Branch and switch targets of this instruction.
    #[must_use]
    pub fn targets(&self) -> Vec<u64> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Returns `true` for instructions that transfer control to a target operand.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X}: {}", self.offset, self.mnemonic)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, " 0x{imm:X}"),
            Operand::Target(target) => write!(f, " IL_{target:04X}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Switch(targets) => write!(f, " ({} targets)", targets.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(opcode: u8, operand: Operand) -> Instruction {
        Instruction::new(0, opcode, operand).unwrap()
    }

    #[test]
    fn test_ldc_forms() {
        assert_eq!(ins(opcodes::LDC_I4_M1, Operand::None).ldc_i4_value(), Some(-1));
        assert_eq!(ins(opcodes::LDC_I4_8, Operand::None).ldc_i4_value(), Some(8));
        assert_eq!(
            ins(opcodes::LDC_I4, Operand::Immediate(Immediate::Int32(0x3FFF_FFFF)))
                .ldc_i4_value(),
            Some(0x3FFF_FFFF)
        );
        assert!(!ins(opcodes::LDC_I8, Operand::Immediate(Immediate::Int64(1))).is_ldc_i4());
    }

    #[test]
    fn test_argument_and_local_forms() {
        let ldarg = ins(opcodes::LDARG_S, Operand::Immediate(Immediate::UInt8(4)));
        assert!(ldarg.is_ldarg());
        assert_eq!(ldarg.arg_index(), Some(4));

        let starg =
            Instruction::with_prefix(0, FE_PREFIX, opcodes::FE_STARG, Operand::Immediate(Immediate::UInt16(0)))
                .unwrap();
        assert!(starg.is_starg());
        assert_eq!(starg.arg_index(), Some(0));

        assert_eq!(ins(opcodes::STLOC_2, Operand::None).local_index(), Some(2));
        assert!(ins(opcodes::LDLOCA_S, Operand::Immediate(Immediate::UInt8(1))).is_ldloca());
        assert_eq!(Instruction::ldarg_0(7).arg_index(), Some(0));
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(matches!(
            Instruction::new(0, 0x24, Operand::None),
            Err(Error::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_display() {
        let call = ins(opcodes::CALL, Operand::Token(Token(0x0A000003)));
        assert_eq!(call.to_string(), "IL_0000: call 0x0a000003");
        assert!(call.is_call());
        assert_eq!(call.token(), Some(Token(0x0A000003)));
    }
}
