//! CIL instruction processing: decoding, encoding, assembly and sequence matching.
//!
//! This module is the instruction layer every detection stage is built on. Method bodies are
//! kept as flat [`Instruction`] vectors; branch operands hold absolute offsets so bodies can be
//! cut and spliced without re-linking by hand, and [`encode_body`] turns such a vector back
//! into bytes.
//!
//! # Key Components
//!
//! - [`decode_instruction`] / [`decode_stream`] - Bytes to [`Instruction`]s
//! - [`InstructionEncoder`] / [`encode_body`] - [`Instruction`]s and labels to bytes
//! - [`InstructionAssembler`] - Fluent IL authoring on top of the encoder
//! - [`InstructionTemplate`] - Declarative sequence matching with captures
//! - [`opcodes`] - The opcode table
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::{
//!     Parser,
//!     assembly::{decode_stream, encode_body, InstructionAssembler},
//! };
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(0x1E)?.shr_un()?.ret()?;
//! let bytes = asm.finish()?;
//!
//! let instructions = decode_stream(&mut Parser::new(&bytes))?;
//! assert_eq!(encode_body(&instructions)?, bytes);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

mod assembler;
mod decoder;
mod encoder;
mod instruction;
pub mod opcodes;
mod template;

pub use assembler::InstructionAssembler;
pub use decoder::{decode_instruction, decode_stream};
pub use encoder::{encode_body, InstructionEncoder};
pub use instruction::{FlowType, Immediate, Instruction, Operand, OperandType};
pub use template::{predicates, InstructionTemplate, Predicate, TemplateMatch};
