//! CIL instruction decoding.
//!
//! # Key Components
//!
//! - [`crate::assembly::decoder::decode_instruction`] - Core single instruction decoder
//! - [`crate::assembly::decoder::decode_stream`] - Linear instruction sequence decoder
//!
//! Offsets are relative to the start of the IL stream. Branch displacements are resolved to
//! absolute [`crate::assembly::Operand::Target`] offsets while decoding.
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::{Parser, assembly::{decode_instruction, decode_stream}};
//!
//! let code = [0x2A]; // ret
//! let mut parser = Parser::new(&code);
//! let instr = decode_instruction(&mut parser)?;
//! assert_eq!(instr.mnemonic, "ret");
//!
//! let code = [0x00, 0x2A]; // nop, ret
//! let mut parser = Parser::new(&code);
//! let instrs = decode_stream(&mut parser)?;
//! assert_eq!(instrs.len(), 2);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, Instruction, Operand, OperandType},
        opcodes::{self, FE_PREFIX},
    },
    metadata::token::Token,
    Parser, Result,
};

/// Upper bound on switch table sizes accepted from untrusted IL.
const MAX_SWITCH_TARGETS: u32 = 0x1_0000;

/// Decodes the instruction under the parser cursor.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for invalid or reserved opcodes and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = parser.pos() as u64;
    let first_byte = parser.read_le::<u8>()?;

    let (cil_instruction, prefix, opcode) = match first_byte {
        FE_PREFIX => {
            let second_byte = parser.read_le::<u8>()?;

            match opcodes::lookup(FE_PREFIX, second_byte) {
                Some(instr) => (instr, FE_PREFIX, second_byte),
                None => return Err(malformed_error!("Invalid opcode: FE {:02X}", second_byte)),
            }
        }
        _ => match opcodes::lookup(0, first_byte) {
            Some(instr) => (instr, 0, first_byte),
            None => return Err(malformed_error!("Invalid opcode: {:02X}", first_byte)),
        },
    };

    let operand = match cil_instruction.op_type {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()?;
            if case_count > MAX_SWITCH_TARGETS {
                return Err(malformed_error!("Switch with {} targets", case_count));
            }

            let mut displacements = Vec::with_capacity(case_count as usize);
            for _ in 0..case_count {
                displacements.push(parser.read_le::<i32>()?);
            }

            let next = parser.pos() as u64;
            Operand::Switch(
                displacements
                    .into_iter()
                    .map(|displacement| relative_target(next, displacement))
                    .collect(),
            )
        }
    };
    let size = parser.pos() as u64 - offset;

    let operand = match (cil_instruction.flow, operand) {
        (
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
            Operand::Immediate(Immediate::Int8(displacement)),
        ) => Operand::Target(relative_target(offset + size, i32::from(displacement))),
        (
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
            Operand::Immediate(Immediate::Int32(displacement)),
        ) => Operand::Target(relative_target(offset + size, displacement)),
        (_, operand) => operand,
    };

    Ok(Instruction {
        offset,
        size,
        opcode,
        prefix,
        mnemonic: cil_instruction.instr,
        flow_type: cil_instruction.flow,
        operand,
    })
}

fn relative_target(next: u64, displacement: i32) -> u64 {
    next.wrapping_add_signed(i64::from(displacement))
}

/// Decodes instructions until the parser is exhausted.
///
/// # Errors
/// Propagates the first [`decode_instruction`] failure.
pub fn decode_stream(parser: &mut Parser) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(parser)?);
    }

    Ok(instructions)
}
