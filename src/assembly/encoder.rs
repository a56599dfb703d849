//! CIL instruction encoding with label resolution.
//!
//! The [`crate::assembly::encoder::InstructionEncoder`] turns mnemonics and operands into
//! bytecode. Branches refer to named labels that are resolved in
//! [`InstructionEncoder::finalize`], so forward references are allowed.
//!
//! [`encode_body`] re-encodes a decoded (and possibly rewritten) instruction list. Branch
//! targets in such a list are original offsets; every instruction defines a label for its own
//! offset, which makes the re-encoding independent of how many bytes surgery added or removed.
//! Short branches are widened to their long form so that no displacement can overflow.
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::assembly::InstructionEncoder;
//!
//! let mut encoder = InstructionEncoder::new();
//! encoder.emit_instruction("ldc.i4.1", None)?;
//! encoder.emit_branch("brtrue.s", "done")?;
//! encoder.emit_instruction("nop", None)?;
//! encoder.define_label("done")?;
//! encoder.emit_instruction("ret", None)?;
//!
//! let (bytecode, _labels) = encoder.finalize()?;
//! assert_eq!(bytecode, vec![0x17, 0x2D, 0x01, 0x00, 0x2A]);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use rustc_hash::FxHashMap;

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, Instruction, Operand, OperandType},
        opcodes,
    },
    Error, Result,
};

/// Label fixup information for branch instruction resolution.
#[derive(Debug, Clone)]
struct LabelFixup {
    /// The target label name to resolve
    label: String,
    /// Position in bytecode where the branch displacement is written
    fixup_position: usize,
    /// Size of the displacement field (1 or 4 bytes)
    offset_size: u8,
}

/// Switch fixup information for multi-way branch resolution.
#[derive(Debug, Clone)]
struct SwitchFixup {
    /// The target label names, one per case
    labels: Vec<String>,
    /// Position of the first 4-byte displacement
    fixup_position: usize,
    /// Position after the switch instruction
    instruction_end_position: usize,
}

/// Encodes CIL instructions into bytecode.
#[derive(Debug, Default)]
pub struct InstructionEncoder {
    bytecode: Vec<u8>,
    labels: FxHashMap<String, u32>,
    fixups: Vec<LabelFixup>,
    switch_fixups: Vec<SwitchFixup>,
}

impl InstructionEncoder {
    /// Create a new instruction encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn emit_opcode(&mut self, mnemonic: &str) -> Result<&'static opcodes::CilInstruction> {
        let (prefix, opcode, metadata) = opcodes::lookup_mnemonic(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if prefix != 0 {
            self.bytecode.push(prefix);
        }
        self.bytecode.push(opcode);

        Ok(metadata)
    }

    /// Emit a non-branch CIL instruction with optional operand.
    ///
    /// # Errors
    ///
    /// Returns an error if the mnemonic is not recognized, names a branch, or the operand does
    /// not match the instruction's operand type.
    pub fn emit_instruction(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<()> {
        let metadata = self.emit_opcode(mnemonic)?;

        if matches!(
            metadata.flow,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Leave
                | FlowType::Switch
        ) {
            return Err(malformed_error!(
                "'{}' must be emitted with emit_branch / emit_switch",
                mnemonic
            ));
        }

        self.emit_operand(operand, metadata.op_type, mnemonic)
    }

    fn emit_operand(
        &mut self,
        operand: Option<Operand>,
        op_type: OperandType,
        mnemonic: &str,
    ) -> Result<()> {
        match (op_type, operand) {
            (OperandType::None, None | Some(Operand::None)) => {}
            (OperandType::Int8, Some(Operand::Immediate(Immediate::Int8(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::UInt8, Some(Operand::Immediate(Immediate::UInt8(value)))) => {
                self.bytecode.push(value);
            }
            (OperandType::UInt16, Some(Operand::Immediate(Immediate::UInt16(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Int32, Some(Operand::Immediate(Immediate::Int32(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Int64, Some(Operand::Immediate(Immediate::Int64(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Float32, Some(Operand::Immediate(Immediate::Float32(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Float64, Some(Operand::Immediate(Immediate::Float64(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Token, Some(Operand::Token(token))) => {
                self.bytecode.extend_from_slice(&token.value().to_le_bytes());
            }
            (expected, found) => {
                return Err(malformed_error!(
                    "Operand {:?} does not fit '{}' (expects {:?})",
                    found,
                    mnemonic,
                    expected
                ));
            }
        }
        Ok(())
    }

    /// Emit a branch instruction with label reference.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMnemonic`] if the mnemonic is not recognized, or
    /// [`crate::Error::Malformed`] if it is not a branch.
    pub fn emit_branch(&mut self, mnemonic: &str, label: &str) -> Result<()> {
        let metadata = self.emit_opcode(mnemonic)?;

        let offset_size = match (metadata.flow, metadata.op_type) {
            (
                FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
                OperandType::Int8,
            ) => 1,
            (
                FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
                OperandType::Int32,
            ) => 4,
            _ => {
                return Err(malformed_error!(
                    "instruction '{}' is not a branch instruction",
                    mnemonic
                ))
            }
        };

        self.fixups.push(LabelFixup {
            label: label.to_string(),
            fixup_position: self.bytecode.len(),
            offset_size,
        });
        self.bytecode
            .resize(self.bytecode.len() + offset_size as usize, 0);

        Ok(())
    }

    /// Emit a `switch` whose cases jump to the given labels.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the table is too large to encode.
    pub fn emit_switch(&mut self, labels: &[String]) -> Result<()> {
        let count = u32::try_from(labels.len())
            .map_err(|_| malformed_error!("Switch table too large"))?;

        self.emit_opcode("switch")?;
        self.bytecode.extend_from_slice(&count.to_le_bytes());

        let fixup_position = self.bytecode.len();
        self.bytecode
            .resize(self.bytecode.len() + labels.len() * 4, 0);

        self.switch_fixups.push(SwitchFixup {
            labels: labels.to_vec(),
            fixup_position,
            instruction_end_position: self.bytecode.len(),
        });
        Ok(())
    }

    /// Define a label at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the label was already defined.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        let position = self.current_position();
        if self.labels.insert(name.to_string(), position).is_some() {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }
        Ok(())
    }

    /// The byte position the next instruction will be emitted at.
    #[must_use]
    pub fn current_position(&self) -> u32 {
        self.bytecode.len() as u32
    }

    /// Resolves all labels and returns the bytecode with the final label positions.
    ///
    /// # Errors
    /// Returns [`crate::Error::UndefinedLabel`] for unresolved labels and
    /// [`crate::Error::Malformed`] if a short displacement does not fit.
    pub fn finalize(mut self) -> Result<(Vec<u8>, FxHashMap<String, u32>)> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let target = self.label_position(&fixup.label)?;
            let next_instruction = (fixup.fixup_position + fixup.offset_size as usize) as i64;
            let displacement = target - next_instruction;

            if fixup.offset_size == 1 {
                let short = i8::try_from(displacement).map_err(|_| {
                    malformed_error!(
                        "Branch to '{}' out of short range ({})",
                        fixup.label,
                        displacement
                    )
                })?;
                self.bytecode[fixup.fixup_position] = short.to_le_bytes()[0];
            } else {
                let long = i32::try_from(displacement)
                    .map_err(|_| malformed_error!("Branch displacement exceeds i32 range"))?;
                self.bytecode[fixup.fixup_position..fixup.fixup_position + 4]
                    .copy_from_slice(&long.to_le_bytes());
            }
        }

        let switch_fixups = std::mem::take(&mut self.switch_fixups);
        for switch_fixup in &switch_fixups {
            let end = switch_fixup.instruction_end_position as i64;
            for (i, label) in switch_fixup.labels.iter().enumerate() {
                let displacement = i32::try_from(self.label_position(label)? - end)
                    .map_err(|_| malformed_error!("Switch displacement exceeds i32 range"))?;

                let target_pos = switch_fixup.fixup_position + i * 4;
                self.bytecode[target_pos..target_pos + 4]
                    .copy_from_slice(&displacement.to_le_bytes());
            }
        }

        Ok((self.bytecode, self.labels))
    }

    fn label_position(&self, label: &str) -> Result<i64> {
        self.labels
            .get(label)
            .map(|position| i64::from(*position))
            .ok_or_else(|| Error::UndefinedLabel(label.to_string()))
    }
}

fn offset_label(offset: u64) -> String {
    format!("IL_{offset:04X}")
}

/// Re-encodes a decoded instruction list whose branch targets are instruction offsets.
///
/// # Errors
/// Returns [`crate::Error::UndefinedLabel`] if a branch targets an offset no instruction in the
/// list carries, or any encoder error.
pub fn encode_body(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let mut encoder = InstructionEncoder::new();

    for instruction in instructions {
        encoder.define_label(&offset_label(instruction.offset))?;

        match &instruction.operand {
            Operand::Target(target) => {
                let mnemonic = match opcodes::long_branch_form(instruction.opcode) {
                    Some(long) if instruction.prefix == 0 => opcodes::lookup(0, long)
                        .map(|info| info.instr)
                        .ok_or_else(|| Error::InvalidMnemonic(instruction.mnemonic.into()))?,
                    _ => instruction.mnemonic,
                };
                encoder.emit_branch(mnemonic, &offset_label(*target))?;
            }
            Operand::Switch(targets) => {
                let labels: Vec<String> = targets.iter().map(|t| offset_label(*t)).collect();
                encoder.emit_switch(&labels)?;
            }
            operand => {
                encoder.emit_instruction(instruction.mnemonic, Some(operand.clone()))?;
            }
        }
    }

    let (bytecode, _) = encoder.finalize()?;
    Ok(bytecode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::decode_stream, metadata::token::Token, Parser};

    #[test]
    fn test_encode_simple_sequence() {
        let mut encoder = InstructionEncoder::new();
        encoder
            .emit_instruction("ldc.i4", Some(Operand::Immediate(Immediate::Int32(0x1E))))
            .unwrap();
        encoder
            .emit_instruction("call", Some(Operand::Token(Token(0x06000002))))
            .unwrap();
        encoder.emit_instruction("ceq", None).unwrap();
        let (bytecode, _) = encoder.finalize().unwrap();

        assert_eq!(
            bytecode,
            vec![0x20, 0x1E, 0x00, 0x00, 0x00, 0x28, 0x02, 0x00, 0x00, 0x06, 0xFE, 0x01]
        );
    }

    #[test]
    fn test_encode_backward_branch_and_switch() {
        let mut encoder = InstructionEncoder::new();
        encoder.define_label("top").unwrap();
        encoder.emit_instruction("ldarg.0", None).unwrap();
        encoder
            .emit_switch(&["top".to_string(), "end".to_string()])
            .unwrap();
        encoder.emit_branch("br", "top").unwrap();
        encoder.define_label("end").unwrap();
        encoder.emit_instruction("ret", None).unwrap();
        let (bytecode, labels) = encoder.finalize().unwrap();

        assert_eq!(labels["end"], 19);
        let instructions = decode_stream(&mut Parser::new(&bytecode)).unwrap();
        assert_eq!(instructions[1].targets(), vec![0, 19]);
        assert_eq!(instructions[2].targets(), vec![0]);
    }

    #[test]
    fn test_encode_errors() {
        let mut encoder = InstructionEncoder::new();
        assert!(matches!(
            encoder.emit_instruction("bogus", None),
            Err(Error::InvalidMnemonic(_))
        ));
        assert!(encoder.emit_instruction("br", None).is_err());
        assert!(encoder
            .emit_instruction("ldc.i4", Some(Operand::Immediate(Immediate::Int8(1))))
            .is_err());

        let mut encoder = InstructionEncoder::new();
        encoder.emit_branch("br", "nowhere").unwrap();
        assert!(matches!(encoder.finalize(), Err(Error::UndefinedLabel(_))));
    }

    #[test]
    fn test_encode_body_widens_short_branches() {
        // ldc.i4.0; brfalse.s +1; nop; ret
        let code = [0x16, 0x2C, 0x01, 0x00, 0x2A];
        let instructions = decode_stream(&mut Parser::new(&code)).unwrap();

        let bytecode = encode_body(&instructions).unwrap();
        let reencoded = decode_stream(&mut Parser::new(&bytecode)).unwrap();

        assert_eq!(reencoded[1].mnemonic, "brfalse");
        assert_eq!(reencoded[1].targets(), vec![reencoded[3].offset]);
        assert_eq!(reencoded[3].mnemonic, "ret");
    }

    #[test]
    fn test_encode_body_after_removal() {
        // nop; nop; br.s -> ret; ret
        let code = [0x00, 0x00, 0x2B, 0x00, 0x2A];
        let mut instructions = decode_stream(&mut Parser::new(&code)).unwrap();
        instructions.remove(0);

        let bytecode = encode_body(&instructions).unwrap();
        assert_eq!(bytecode, vec![0x00, 0x38, 0x00, 0x00, 0x00, 0x00, 0x2A]);

        instructions.pop();
        assert!(matches!(
            encode_body(&instructions),
            Err(Error::UndefinedLabel(_))
        ));
    }
}
