//! Fluent IL assembly.
//!
//! [`InstructionAssembler`] wraps the [`crate::assembly::InstructionEncoder`] with one method
//! per instruction. It picks the compact encodings for constants, arguments and locals, and
//! returns `&mut Self` so sequences read like an IL listing:
//!
//! ```rust
//! use confuserex_constants::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(0x3FFF_FFFF)?.and()?.ldc_i4(2)?.shl()?.ret()?;
//! let instructions = asm.finish_instructions()?;
//! assert_eq!(instructions.len(), 6);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use crate::{
    assembly::{
        decoder::decode_stream,
        encoder::InstructionEncoder,
        instruction::{Immediate, Instruction, Operand},
    },
    metadata::token::Token,
    Parser, Result,
};

/// Fluent builder producing CIL bytecode.
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    encoder: InstructionEncoder,
}

macro_rules! simple_ops {
    ($( $(#[$doc:meta])* $name:ident => $mnemonic:literal ),* $(,)?) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Propagates encoder failures.
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.emit($mnemonic, None)
            }
        )*
    };
}

macro_rules! token_ops {
    ($( $(#[$doc:meta])* $name:ident => $mnemonic:literal ),* $(,)?) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Propagates encoder failures.
            pub fn $name(&mut self, token: Token) -> Result<&mut Self> {
                self.emit($mnemonic, Some(Operand::Token(token)))
            }
        )*
    };
}

macro_rules! branch_ops {
    ($( $(#[$doc:meta])* $name:ident => $mnemonic:literal ),* $(,)?) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            /// Propagates encoder failures.
            pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                self.encoder.emit_branch($mnemonic, label)?;
                Ok(self)
            }
        )*
    };
}

impl InstructionAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits an arbitrary non-branch instruction.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn emit(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<&mut Self> {
        self.encoder.emit_instruction(mnemonic, operand)?;
        Ok(self)
    }

    /// Defines a branch label at the current position.
    ///
    /// # Errors
    /// Fails if the label already exists.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        self.encoder.define_label(name)?;
        Ok(self)
    }

    /// Pushes an `int32` constant using the shortest encoding.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        match value {
            -1 => self.emit("ldc.i4.m1", None),
            0 => self.emit("ldc.i4.0", None),
            1 => self.emit("ldc.i4.1", None),
            2 => self.emit("ldc.i4.2", None),
            3 => self.emit("ldc.i4.3", None),
            4 => self.emit("ldc.i4.4", None),
            5 => self.emit("ldc.i4.5", None),
            6 => self.emit("ldc.i4.6", None),
            7 => self.emit("ldc.i4.7", None),
            8 => self.emit("ldc.i4.8", None),
            _ => match i8::try_from(value) {
                Ok(short) => self.emit("ldc.i4.s", Some(Operand::Immediate(Immediate::Int8(short)))),
                Err(_) => self.emit("ldc.i4", Some(Operand::Immediate(Immediate::Int32(value)))),
            },
        }
    }

    /// Pushes an `int32` constant using the long `ldc.i4` encoding.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldc_i4_long(&mut self, value: i32) -> Result<&mut Self> {
        self.emit("ldc.i4", Some(Operand::Immediate(Immediate::Int32(value))))
    }

    /// Pushes an `int64` constant.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit("ldc.i8", Some(Operand::Immediate(Immediate::Int64(value))))
    }

    fn indexed(&mut self, short: &[&str; 4], compact: &str, wide: &str, index: u16) -> Result<&mut Self> {
        if let Some(mnemonic) = short.get(index as usize) {
            return self.emit(mnemonic, None);
        }
        self.indexed_operand(compact, wide, index)
    }

    fn indexed_operand(&mut self, compact: &str, wide: &str, index: u16) -> Result<&mut Self> {
        match u8::try_from(index) {
            Ok(small) => self.emit(compact, Some(Operand::Immediate(Immediate::UInt8(small)))),
            Err(_) => self.emit(wide, Some(Operand::Immediate(Immediate::UInt16(index)))),
        }
    }

    /// Loads an argument.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.indexed(
            &["ldarg.0", "ldarg.1", "ldarg.2", "ldarg.3"],
            "ldarg.s",
            "ldarg",
            index,
        )
    }

    /// Stores into an argument.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.indexed_operand("starg.s", "starg", index)
    }

    /// Loads a local.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.indexed(
            &["ldloc.0", "ldloc.1", "ldloc.2", "ldloc.3"],
            "ldloc.s",
            "ldloc",
            index,
        )
    }

    /// Stores into a local.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.indexed(
            &["stloc.0", "stloc.1", "stloc.2", "stloc.3"],
            "stloc.s",
            "stloc",
            index,
        )
    }

    /// Loads the address of a local.
    ///
    /// # Errors
    /// Propagates encoder failures.
    pub fn ldloca(&mut self, index: u16) -> Result<&mut Self> {
        self.indexed_operand("ldloca.s", "ldloca", index)
    }

    simple_ops! {
        /// `nop`
        nop => "nop",
        /// `ldnull`
        ldnull => "ldnull",
        /// `dup`
        dup => "dup",
        /// `pop`
        pop => "pop",
        /// `ret`
        ret => "ret",
        /// `add`
        add => "add",
        /// `sub`
        sub => "sub",
        /// `mul`
        mul => "mul",
        /// `div`
        div => "div",
        /// `div.un`
        div_un => "div.un",
        /// `rem`
        rem => "rem",
        /// `rem.un`
        rem_un => "rem.un",
        /// `and`
        and => "and",
        /// `or`
        or => "or",
        /// `xor`
        xor => "xor",
        /// `shl`
        shl => "shl",
        /// `shr`
        shr => "shr",
        /// `shr.un`
        shr_un => "shr.un",
        /// `neg`
        neg => "neg",
        /// `not`
        not => "not",
        /// `conv.u1`
        conv_u1 => "conv.u1",
        /// `conv.u2`
        conv_u2 => "conv.u2",
        /// `conv.u4`
        conv_u4 => "conv.u4",
        /// `conv.u8`
        conv_u8 => "conv.u8",
        /// `conv.i4`
        conv_i4 => "conv.i4",
        /// `conv.i8`
        conv_i8 => "conv.i8",
        /// `conv.u`
        conv_u => "conv.u",
        /// `ceq`
        ceq => "ceq",
        /// `cgt`
        cgt => "cgt",
        /// `cgt.un`
        cgt_un => "cgt.un",
        /// `clt`
        clt => "clt",
        /// `clt.un`
        clt_un => "clt.un",
        /// `ldlen`
        ldlen => "ldlen",
        /// `ldelem.u1`
        ldelem_u1 => "ldelem.u1",
        /// `ldelem.u4`
        ldelem_u4 => "ldelem.u4",
        /// `ldelem.i4`
        ldelem_i4 => "ldelem.i4",
        /// `stelem.i1`
        stelem_i1 => "stelem.i1",
        /// `stelem.i4`
        stelem_i4 => "stelem.i4",
        /// `throw`
        throw => "throw",
    }

    token_ops! {
        /// `call`
        call => "call",
        /// `callvirt`
        callvirt => "callvirt",
        /// `newobj`
        newobj => "newobj",
        /// `newarr`
        newarr => "newarr",
        /// `ldtoken`
        ldtoken => "ldtoken",
        /// `initobj`
        initobj => "initobj",
        /// `ldsfld`
        ldsfld => "ldsfld",
        /// `stsfld`
        stsfld => "stsfld",
        /// `ldstr`
        ldstr => "ldstr",
    }

    branch_ops! {
        /// `br`
        br => "br",
        /// `br.s`
        br_s => "br.s",
        /// `brtrue`
        brtrue => "brtrue",
        /// `brfalse`
        brfalse => "brfalse",
        /// `blt`
        blt => "blt",
        /// `blt.un`
        blt_un => "blt.un",
        /// `bge`
        bge => "bge",
        /// `bne.un`
        bne_un => "bne.un",
    }

    /// Resolves labels and returns the bytecode.
    ///
    /// # Errors
    /// Fails on undefined labels or out-of-range short branches.
    pub fn finish(self) -> Result<Vec<u8>> {
        let (bytecode, _) = self.encoder.finalize()?;
        Ok(bytecode)
    }

    /// Resolves labels and decodes the result back into instructions.
    ///
    /// # Errors
    /// Fails on undefined labels or out-of-range short branches.
    pub fn finish_instructions(self) -> Result<Vec<Instruction>> {
        let bytecode = self.finish()?;
        decode_stream(&mut Parser::new(&bytecode))
    }
}
