//! CIL opcode constants and the instruction metadata table (ECMA-335 III).
//!
//! Every opcode is declared once; the declaration produces both the byte constant (e.g.
//! [`CALL`] = `0x28`, or [`FE_CEQ`] = `0x01` for the two-byte `0xFE 0x01`) and the table row
//! the decoder and encoder look mnemonics, operand types and flow types up in.
#![allow(missing_docs)]

use std::sync::OnceLock;

use rustc_hash::FxHashMap;

use crate::assembly::instruction::{FlowType, OperandType};

/// Metadata describing one CIL opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CilInstruction {
    /// The textual mnemonic, e.g. `ldc.i4.s`
    pub instr: &'static str,
    /// The operand that follows the opcode in the byte stream
    pub op_type: OperandType,
    /// How the instruction affects control flow
    pub flow: FlowType,
}

macro_rules! cil_opcodes {
    ($table:ident; $( $name:ident = $code:literal, $mnemonic:literal, $operand:ident, $flow:ident; )*) => {
        $( pub const $name: u8 = $code; )*

        static $table: &[(u8, CilInstruction)] = &[
            $(
                (
                    $code,
                    CilInstruction {
                        instr: $mnemonic,
                        op_type: OperandType::$operand,
                        flow: FlowType::$flow,
                    },
                ),
            )*
        ];
    };
}

cil_opcodes! { SINGLE_BYTE;
    NOP = 0x00, "nop", None, Sequential;
    BREAK = 0x01, "break", None, Sequential;
    LDARG_0 = 0x02, "ldarg.0", None, Sequential;
    LDARG_1 = 0x03, "ldarg.1", None, Sequential;
    LDARG_2 = 0x04, "ldarg.2", None, Sequential;
    LDARG_3 = 0x05, "ldarg.3", None, Sequential;
    LDLOC_0 = 0x06, "ldloc.0", None, Sequential;
    LDLOC_1 = 0x07, "ldloc.1", None, Sequential;
    LDLOC_2 = 0x08, "ldloc.2", None, Sequential;
    LDLOC_3 = 0x09, "ldloc.3", None, Sequential;
    STLOC_0 = 0x0A, "stloc.0", None, Sequential;
    STLOC_1 = 0x0B, "stloc.1", None, Sequential;
    STLOC_2 = 0x0C, "stloc.2", None, Sequential;
    STLOC_3 = 0x0D, "stloc.3", None, Sequential;
    LDARG_S = 0x0E, "ldarg.s", UInt8, Sequential;
    LDARGA_S = 0x0F, "ldarga.s", UInt8, Sequential;
    STARG_S = 0x10, "starg.s", UInt8, Sequential;
    LDLOC_S = 0x11, "ldloc.s", UInt8, Sequential;
    LDLOCA_S = 0x12, "ldloca.s", UInt8, Sequential;
    STLOC_S = 0x13, "stloc.s", UInt8, Sequential;
    LDNULL = 0x14, "ldnull", None, Sequential;
    LDC_I4_M1 = 0x15, "ldc.i4.m1", None, Sequential;
    LDC_I4_0 = 0x16, "ldc.i4.0", None, Sequential;
    LDC_I4_1 = 0x17, "ldc.i4.1", None, Sequential;
    LDC_I4_2 = 0x18, "ldc.i4.2", None, Sequential;
    LDC_I4_3 = 0x19, "ldc.i4.3", None, Sequential;
    LDC_I4_4 = 0x1A, "ldc.i4.4", None, Sequential;
    LDC_I4_5 = 0x1B, "ldc.i4.5", None, Sequential;
    LDC_I4_6 = 0x1C, "ldc.i4.6", None, Sequential;
    LDC_I4_7 = 0x1D, "ldc.i4.7", None, Sequential;
    LDC_I4_8 = 0x1E, "ldc.i4.8", None, Sequential;
    LDC_I4_S = 0x1F, "ldc.i4.s", Int8, Sequential;
    LDC_I4 = 0x20, "ldc.i4", Int32, Sequential;
    LDC_I8 = 0x21, "ldc.i8", Int64, Sequential;
    LDC_R4 = 0x22, "ldc.r4", Float32, Sequential;
    LDC_R8 = 0x23, "ldc.r8", Float64, Sequential;
    DUP = 0x25, "dup", None, Sequential;
    POP = 0x26, "pop", None, Sequential;
    JMP = 0x27, "jmp", Token, Call;
    CALL = 0x28, "call", Token, Call;
    CALLI = 0x29, "calli", Token, Call;
    RET = 0x2A, "ret", None, Return;
    BR_S = 0x2B, "br.s", Int8, UnconditionalBranch;
    BRFALSE_S = 0x2C, "brfalse.s", Int8, ConditionalBranch;
    BRTRUE_S = 0x2D, "brtrue.s", Int8, ConditionalBranch;
    BEQ_S = 0x2E, "beq.s", Int8, ConditionalBranch;
    BGE_S = 0x2F, "bge.s", Int8, ConditionalBranch;
    BGT_S = 0x30, "bgt.s", Int8, ConditionalBranch;
    BLE_S = 0x31, "ble.s", Int8, ConditionalBranch;
    BLT_S = 0x32, "blt.s", Int8, ConditionalBranch;
    BNE_UN_S = 0x33, "bne.un.s", Int8, ConditionalBranch;
    BGE_UN_S = 0x34, "bge.un.s", Int8, ConditionalBranch;
    BGT_UN_S = 0x35, "bgt.un.s", Int8, ConditionalBranch;
    BLE_UN_S = 0x36, "ble.un.s", Int8, ConditionalBranch;
    BLT_UN_S = 0x37, "blt.un.s", Int8, ConditionalBranch;
    BR = 0x38, "br", Int32, UnconditionalBranch;
    BRFALSE = 0x39, "brfalse", Int32, ConditionalBranch;
    BRTRUE = 0x3A, "brtrue", Int32, ConditionalBranch;
    BEQ = 0x3B, "beq", Int32, ConditionalBranch;
    BGE = 0x3C, "bge", Int32, ConditionalBranch;
    BGT = 0x3D, "bgt", Int32, ConditionalBranch;
    BLE = 0x3E, "ble", Int32, ConditionalBranch;
    BLT = 0x3F, "blt", Int32, ConditionalBranch;
    BNE_UN = 0x40, "bne.un", Int32, ConditionalBranch;
    BGE_UN = 0x41, "bge.un", Int32, ConditionalBranch;
    BGT_UN = 0x42, "bgt.un", Int32, ConditionalBranch;
    BLE_UN = 0x43, "ble.un", Int32, ConditionalBranch;
    BLT_UN = 0x44, "blt.un", Int32, ConditionalBranch;
    SWITCH = 0x45, "switch", Switch, Switch;
    LDIND_I1 = 0x46, "ldind.i1", None, Sequential;
    LDIND_U1 = 0x47, "ldind.u1", None, Sequential;
    LDIND_I2 = 0x48, "ldind.i2", None, Sequential;
    LDIND_U2 = 0x49, "ldind.u2", None, Sequential;
    LDIND_I4 = 0x4A, "ldind.i4", None, Sequential;
    LDIND_U4 = 0x4B, "ldind.u4", None, Sequential;
    LDIND_I8 = 0x4C, "ldind.i8", None, Sequential;
    LDIND_I = 0x4D, "ldind.i", None, Sequential;
    LDIND_R4 = 0x4E, "ldind.r4", None, Sequential;
    LDIND_R8 = 0x4F, "ldind.r8", None, Sequential;
    LDIND_REF = 0x50, "ldind.ref", None, Sequential;
    STIND_REF = 0x51, "stind.ref", None, Sequential;
    STIND_I1 = 0x52, "stind.i1", None, Sequential;
    STIND_I2 = 0x53, "stind.i2", None, Sequential;
    STIND_I4 = 0x54, "stind.i4", None, Sequential;
    STIND_I8 = 0x55, "stind.i8", None, Sequential;
    STIND_R4 = 0x56, "stind.r4", None, Sequential;
    STIND_R8 = 0x57, "stind.r8", None, Sequential;
    ADD = 0x58, "add", None, Sequential;
    SUB = 0x59, "sub", None, Sequential;
    MUL = 0x5A, "mul", None, Sequential;
    DIV = 0x5B, "div", None, Sequential;
    DIV_UN = 0x5C, "div.un", None, Sequential;
    REM = 0x5D, "rem", None, Sequential;
    REM_UN = 0x5E, "rem.un", None, Sequential;
    AND = 0x5F, "and", None, Sequential;
    OR = 0x60, "or", None, Sequential;
    XOR = 0x61, "xor", None, Sequential;
    SHL = 0x62, "shl", None, Sequential;
    SHR = 0x63, "shr", None, Sequential;
    SHR_UN = 0x64, "shr.un", None, Sequential;
    NEG = 0x65, "neg", None, Sequential;
    NOT = 0x66, "not", None, Sequential;
    CONV_I1 = 0x67, "conv.i1", None, Sequential;
    CONV_I2 = 0x68, "conv.i2", None, Sequential;
    CONV_I4 = 0x69, "conv.i4", None, Sequential;
    CONV_I8 = 0x6A, "conv.i8", None, Sequential;
    CONV_R4 = 0x6B, "conv.r4", None, Sequential;
    CONV_R8 = 0x6C, "conv.r8", None, Sequential;
    CONV_U4 = 0x6D, "conv.u4", None, Sequential;
    CONV_U8 = 0x6E, "conv.u8", None, Sequential;
    CALLVIRT = 0x6F, "callvirt", Token, Call;
    CPOBJ = 0x70, "cpobj", Token, Sequential;
    LDOBJ = 0x71, "ldobj", Token, Sequential;
    LDSTR = 0x72, "ldstr", Token, Sequential;
    NEWOBJ = 0x73, "newobj", Token, Call;
    CASTCLASS = 0x74, "castclass", Token, Sequential;
    ISINST = 0x75, "isinst", Token, Sequential;
    CONV_R_UN = 0x76, "conv.r.un", None, Sequential;
    UNBOX = 0x79, "unbox", Token, Sequential;
    THROW = 0x7A, "throw", None, Throw;
    LDFLD = 0x7B, "ldfld", Token, Sequential;
    LDFLDA = 0x7C, "ldflda", Token, Sequential;
    STFLD = 0x7D, "stfld", Token, Sequential;
    LDSFLD = 0x7E, "ldsfld", Token, Sequential;
    LDSFLDA = 0x7F, "ldsflda", Token, Sequential;
    STSFLD = 0x80, "stsfld", Token, Sequential;
    STOBJ = 0x81, "stobj", Token, Sequential;
    CONV_OVF_I1_UN = 0x82, "conv.ovf.i1.un", None, Sequential;
    CONV_OVF_I2_UN = 0x83, "conv.ovf.i2.un", None, Sequential;
    CONV_OVF_I4_UN = 0x84, "conv.ovf.i4.un", None, Sequential;
    CONV_OVF_I8_UN = 0x85, "conv.ovf.i8.un", None, Sequential;
    CONV_OVF_U1_UN = 0x86, "conv.ovf.u1.un", None, Sequential;
    CONV_OVF_U2_UN = 0x87, "conv.ovf.u2.un", None, Sequential;
    CONV_OVF_U4_UN = 0x88, "conv.ovf.u4.un", None, Sequential;
    CONV_OVF_U8_UN = 0x89, "conv.ovf.u8.un", None, Sequential;
    CONV_OVF_I_UN = 0x8A, "conv.ovf.i.un", None, Sequential;
    CONV_OVF_U_UN = 0x8B, "conv.ovf.u.un", None, Sequential;
    BOX = 0x8C, "box", Token, Sequential;
    NEWARR = 0x8D, "newarr", Token, Sequential;
    LDLEN = 0x8E, "ldlen", None, Sequential;
    LDELEMA = 0x8F, "ldelema", Token, Sequential;
    LDELEM_I1 = 0x90, "ldelem.i1", None, Sequential;
    LDELEM_U1 = 0x91, "ldelem.u1", None, Sequential;
    LDELEM_I2 = 0x92, "ldelem.i2", None, Sequential;
    LDELEM_U2 = 0x93, "ldelem.u2", None, Sequential;
    LDELEM_I4 = 0x94, "ldelem.i4", None, Sequential;
    LDELEM_U4 = 0x95, "ldelem.u4", None, Sequential;
    LDELEM_I8 = 0x96, "ldelem.i8", None, Sequential;
    LDELEM_I = 0x97, "ldelem.i", None, Sequential;
    LDELEM_R4 = 0x98, "ldelem.r4", None, Sequential;
    LDELEM_R8 = 0x99, "ldelem.r8", None, Sequential;
    LDELEM_REF = 0x9A, "ldelem.ref", None, Sequential;
    STELEM_I = 0x9B, "stelem.i", None, Sequential;
    STELEM_I1 = 0x9C, "stelem.i1", None, Sequential;
    STELEM_I2 = 0x9D, "stelem.i2", None, Sequential;
    STELEM_I4 = 0x9E, "stelem.i4", None, Sequential;
    STELEM_I8 = 0x9F, "stelem.i8", None, Sequential;
    STELEM_R4 = 0xA0, "stelem.r4", None, Sequential;
    STELEM_R8 = 0xA1, "stelem.r8", None, Sequential;
    STELEM_REF = 0xA2, "stelem.ref", None, Sequential;
    LDELEM = 0xA3, "ldelem", Token, Sequential;
    STELEM = 0xA4, "stelem", Token, Sequential;
    UNBOX_ANY = 0xA5, "unbox.any", Token, Sequential;
    CONV_OVF_I1 = 0xB3, "conv.ovf.i1", None, Sequential;
    CONV_OVF_U1 = 0xB4, "conv.ovf.u1", None, Sequential;
    CONV_OVF_I2 = 0xB5, "conv.ovf.i2", None, Sequential;
    CONV_OVF_U2 = 0xB6, "conv.ovf.u2", None, Sequential;
    CONV_OVF_I4 = 0xB7, "conv.ovf.i4", None, Sequential;
    CONV_OVF_U4 = 0xB8, "conv.ovf.u4", None, Sequential;
    CONV_OVF_I8 = 0xB9, "conv.ovf.i8", None, Sequential;
    CONV_OVF_U8 = 0xBA, "conv.ovf.u8", None, Sequential;
    REFANYVAL = 0xC2, "refanyval", Token, Sequential;
    CKFINITE = 0xC3, "ckfinite", None, Sequential;
    MKREFANY = 0xC6, "mkrefany", Token, Sequential;
    LDTOKEN = 0xD0, "ldtoken", Token, Sequential;
    CONV_U2 = 0xD1, "conv.u2", None, Sequential;
    CONV_U1 = 0xD2, "conv.u1", None, Sequential;
    CONV_I = 0xD3, "conv.i", None, Sequential;
    CONV_OVF_I = 0xD4, "conv.ovf.i", None, Sequential;
    CONV_OVF_U = 0xD5, "conv.ovf.u", None, Sequential;
    ADD_OVF = 0xD6, "add.ovf", None, Sequential;
    ADD_OVF_UN = 0xD7, "add.ovf.un", None, Sequential;
    MUL_OVF = 0xD8, "mul.ovf", None, Sequential;
    MUL_OVF_UN = 0xD9, "mul.ovf.un", None, Sequential;
    SUB_OVF = 0xDA, "sub.ovf", None, Sequential;
    SUB_OVF_UN = 0xDB, "sub.ovf.un", None, Sequential;
    ENDFINALLY = 0xDC, "endfinally", None, EndFinally;
    LEAVE = 0xDD, "leave", Int32, Leave;
    LEAVE_S = 0xDE, "leave.s", Int8, Leave;
    STIND_I = 0xDF, "stind.i", None, Sequential;
    CONV_U = 0xE0, "conv.u", None, Sequential;
}

/// The shared first byte of all two-byte opcodes.
pub const FE_PREFIX: u8 = 0xFE;

cil_opcodes! { DOUBLE_BYTE;
    FE_ARGLIST = 0x00, "arglist", None, Sequential;
    FE_CEQ = 0x01, "ceq", None, Sequential;
    FE_CGT = 0x02, "cgt", None, Sequential;
    FE_CGT_UN = 0x03, "cgt.un", None, Sequential;
    FE_CLT = 0x04, "clt", None, Sequential;
    FE_CLT_UN = 0x05, "clt.un", None, Sequential;
    FE_LDFTN = 0x06, "ldftn", Token, Sequential;
    FE_LDVIRTFTN = 0x07, "ldvirtftn", Token, Sequential;
    FE_LDARG = 0x09, "ldarg", UInt16, Sequential;
    FE_LDARGA = 0x0A, "ldarga", UInt16, Sequential;
    FE_STARG = 0x0B, "starg", UInt16, Sequential;
    FE_LDLOC = 0x0C, "ldloc", UInt16, Sequential;
    FE_LDLOCA = 0x0D, "ldloca", UInt16, Sequential;
    FE_STLOC = 0x0E, "stloc", UInt16, Sequential;
    FE_LOCALLOC = 0x0F, "localloc", None, Sequential;
    FE_ENDFILTER = 0x11, "endfilter", None, EndFinally;
    FE_UNALIGNED = 0x12, "unaligned.", UInt8, Sequential;
    FE_VOLATILE = 0x13, "volatile.", None, Sequential;
    FE_TAIL = 0x14, "tail.", None, Sequential;
    FE_INITOBJ = 0x15, "initobj", Token, Sequential;
    FE_CONSTRAINED = 0x16, "constrained.", Token, Sequential;
    FE_CPBLK = 0x17, "cpblk", None, Sequential;
    FE_INITBLK = 0x18, "initblk", None, Sequential;
    FE_NO = 0x19, "no.", UInt8, Sequential;
    FE_RETHROW = 0x1A, "rethrow", None, Throw;
    FE_SIZEOF = 0x1C, "sizeof", Token, Sequential;
    FE_REFANYTYPE = 0x1D, "refanytype", None, Sequential;
    FE_READONLY = 0x1E, "readonly.", None, Sequential;
}

struct OpcodeTables {
    single: [Option<CilInstruction>; 256],
    double: [Option<CilInstruction>; 256],
    by_mnemonic: FxHashMap<&'static str, (u8, u8, CilInstruction)>,
}

static TABLES: OnceLock<OpcodeTables> = OnceLock::new();

fn tables() -> &'static OpcodeTables {
    TABLES.get_or_init(|| {
        let mut tables = OpcodeTables {
            single: [None; 256],
            double: [None; 256],
            by_mnemonic: FxHashMap::default(),
        };

        for (opcode, instr) in SINGLE_BYTE {
            tables.single[*opcode as usize] = Some(*instr);
            tables.by_mnemonic.insert(instr.instr, (0, *opcode, *instr));
        }
        for (opcode, instr) in DOUBLE_BYTE {
            tables.double[*opcode as usize] = Some(*instr);
            tables
                .by_mnemonic
                .insert(instr.instr, (FE_PREFIX, *opcode, *instr));
        }

        tables
    })
}

/// Looks up the metadata of an opcode; `prefix` is `0` or [`FE_PREFIX`].
#[must_use]
pub fn lookup(prefix: u8, opcode: u8) -> Option<&'static CilInstruction> {
    let tables = tables();
    match prefix {
        0 => tables.single[opcode as usize].as_ref(),
        FE_PREFIX => tables.double[opcode as usize].as_ref(),
        _ => None,
    }
}

/// Resolves a mnemonic to `(prefix, opcode, metadata)`.
#[must_use]
pub fn lookup_mnemonic(mnemonic: &str) -> Option<(u8, u8, &'static CilInstruction)> {
    tables()
        .by_mnemonic
        .get(mnemonic)
        .map(|(prefix, opcode, instr)| (*prefix, *opcode, instr))
}

/// Maps a short-form branch opcode to its long form, if it has one.
#[must_use]
pub fn long_branch_form(opcode: u8) -> Option<u8> {
    match opcode {
        BR_S..=BLT_UN_S => Some(opcode + (BR - BR_S)),
        LEAVE_S => Some(LEAVE),
        _ => None,
    }
}
