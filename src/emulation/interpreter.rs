//! A bounded CIL interpreter for self-contained integer and array routines.
//!
//! The interpreter executes methods of a [`Module`] directly from their decoded instruction
//! lists. It covers the subset of CIL the re-hosted constants initializer is built from:
//! integer constants and arithmetic (including the overflow-checked forms), bitwise operations
//! and shifts, conversions, comparisons and branches, `switch`, locals and arguments,
//! one-dimensional primitive arrays, static fields, and calls into other methods of the same
//! module. Floating point, objects, exceptions and calls into external assemblies are outside
//! of this subset and fail with [`EmulationError::UnsupportedOpcode`] or
//! [`EmulationError::UnresolvedCall`].
//!
//! # Value Model
//!
//! Stack values are `int32`, `int64` (native integers are treated as 64-bit), `null`, or a
//! reference to a heap array. Arrays are flat little-endian byte buffers tagged with their
//! declared element type; typed element access reads `size_of(T)` bytes at `index * size_of(T)`.
//! A `byte[]` handed to a routine that reads it with `ldelem.u4` therefore yields the packed
//! 32-bit words, exactly like the field-backed `uint[]` the routine was compiled against.
//!
//! # Execution Limits
//!
//! Every run is bounded by [`EmulationLimits`]: executed instructions, call depth, total array
//! bytes, and wall-clock time (checked every 4096 instructions).
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::{
//!     assembly::InstructionAssembler,
//!     emulation::{CilInterpreter, EmValue, EmulationLimits},
//!     metadata::{
//!         builder::ModuleBuilder,
//!         method::{MethodAccessFlags, MethodBody, MethodModifiers},
//!         signatures::{MethodSig, TypeSig},
//!     },
//! };
//!
//! let mut builder = ModuleBuilder::new("Math.dll");
//! let global = builder.global_type();
//! let twice = builder.method(
//!     global,
//!     "Twice",
//!     MethodAccessFlags::PUBLIC,
//!     MethodModifiers::STATIC,
//!     MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]),
//! );
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(2)?.mul()?.ret()?;
//! builder.set_body(twice, MethodBody::new(asm.finish_instructions()?, Vec::new()))?;
//! let module = builder.build();
//!
//! let interpreter = CilInterpreter::new(EmulationLimits::default());
//! let result = interpreter.execute(&module, twice, vec![EmValue::I32(21)])?;
//! assert_eq!(result, Some(EmValue::I32(42)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::{
    assembly::{
        opcodes::{self, FE_PREFIX},
        Immediate, Instruction, Operand,
    },
    emulation::{EmulationError, EmulationLimits},
    metadata::{
        module::Module,
        signatures::{ElementType, TypeSig},
        token::{TableId, Token},
    },
};

type Result<T> = std::result::Result<T, EmulationError>;

/// How often the wall-clock timeout is checked, in executed instructions.
const TIMEOUT_CHECK_INTERVAL: u64 = 4096;

/// A value crossing the interpreter boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmValue {
    /// `null`
    Null,
    /// `int32`
    I32(i32),
    /// `int64` or native integer
    I64(i64),
    /// A one-dimensional array: element type and raw little-endian contents
    Array {
        /// Declared element type
        element: TypeSig,
        /// Raw element bytes
        data: Vec<u8>,
    },
}

impl EmValue {
    /// A `byte[]` holding `data`.
    #[must_use]
    pub fn byte_array(data: &[u8]) -> Self {
        EmValue::Array {
            element: TypeSig::U1,
            data: data.to_vec(),
        }
    }

    /// The raw contents of an array value.
    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            EmValue::Array { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Executes CIL methods within [`EmulationLimits`].
#[derive(Clone, Debug, Default)]
pub struct CilInterpreter {
    limits: EmulationLimits,
}

impl CilInterpreter {
    /// Creates an interpreter enforcing `limits`.
    #[must_use]
    pub fn new(limits: EmulationLimits) -> Self {
        CilInterpreter { limits }
    }

    /// The limits enforced by this interpreter.
    #[must_use]
    pub fn limits(&self) -> &EmulationLimits {
        &self.limits
    }

    /// Runs `method` of `module` with `args` in a fresh heap and static field store.
    ///
    /// Returns the method's return value, `None` for `void` methods.
    ///
    /// # Errors
    /// Returns an [`EmulationError`] if execution fails or exceeds a limit.
    pub fn execute(
        &self,
        module: &Module,
        method: Token,
        args: Vec<EmValue>,
    ) -> Result<Option<EmValue>> {
        let mut machine = Machine {
            module,
            limits: &self.limits,
            heap: Vec::new(),
            heap_bytes: 0,
            statics: FxHashMap::default(),
            executed: 0,
            started: Instant::now(),
        };

        let mut slots = Vec::with_capacity(args.len());
        for arg in args {
            let slot = machine.import(arg)?;
            slots.push(slot);
        }

        let result = machine.run(method, slots, 0)?;
        Ok(result.map(|slot| machine.export(slot)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Null,
    I32(i32),
    I64(i64),
    Ref(usize),
}

impl Slot {
    fn kind(self) -> &'static str {
        match self {
            Slot::Null => "null",
            Slot::I32(_) => "int32",
            Slot::I64(_) => "int64",
            Slot::Ref(_) => "array",
        }
    }

    fn wide(self, operation: &'static str) -> Result<i64> {
        match self {
            Slot::I32(value) => Ok(i64::from(value)),
            Slot::I64(value) => Ok(value),
            other => Err(mismatch(operation, "integer", other)),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Slot::Null => false,
            Slot::I32(value) => value != 0,
            Slot::I64(value) => value != 0,
            Slot::Ref(_) => true,
        }
    }
}

fn mismatch(operation: &'static str, expected: &'static str, found: Slot) -> EmulationError {
    EmulationError::TypeMismatch {
        operation,
        expected,
        found: found.kind(),
    }
}

fn default_slot(sig: &TypeSig) -> Slot {
    match sig.remove_pinned_and_modifiers().element_type() {
        ElementType::Boolean
        | ElementType::Char
        | ElementType::I1
        | ElementType::U1
        | ElementType::I2
        | ElementType::U2
        | ElementType::I4
        | ElementType::U4 => Slot::I32(0),
        ElementType::I8 | ElementType::U8 | ElementType::I | ElementType::U => Slot::I64(0),
        _ => Slot::Null,
    }
}

/// Width and signedness of an array element access.
#[derive(Clone, Copy, Debug)]
struct ElementAccess {
    size: usize,
    signed: bool,
}

impl ElementAccess {
    const I1: Self = Self::new(1, true);
    const U1: Self = Self::new(1, false);
    const I2: Self = Self::new(2, true);
    const U2: Self = Self::new(2, false);
    const I4: Self = Self::new(4, true);
    const I8: Self = Self::new(8, true);

    const fn new(size: usize, signed: bool) -> Self {
        ElementAccess { size, signed }
    }

    fn of(sig: &TypeSig) -> Option<Self> {
        match sig.remove_pinned_and_modifiers().element_type() {
            ElementType::I1 => Some(Self::I1),
            ElementType::U1 | ElementType::Boolean => Some(Self::U1),
            ElementType::I2 => Some(Self::I2),
            ElementType::U2 | ElementType::Char => Some(Self::U2),
            ElementType::I4 | ElementType::U4 => Some(Self::I4),
            ElementType::I8 | ElementType::U8 | ElementType::I | ElementType::U => {
                Some(Self::I8)
            }
            _ => None,
        }
    }
}

/// Target of a conversion instruction.
#[derive(Clone, Copy, Debug)]
enum ConvTarget {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
}

impl ConvTarget {
    fn range(self) -> (i128, i128) {
        match self {
            ConvTarget::I1 => (i128::from(i8::MIN), i128::from(i8::MAX)),
            ConvTarget::U1 => (0, i128::from(u8::MAX)),
            ConvTarget::I2 => (i128::from(i16::MIN), i128::from(i16::MAX)),
            ConvTarget::U2 => (0, i128::from(u16::MAX)),
            ConvTarget::I4 => (i128::from(i32::MIN), i128::from(i32::MAX)),
            ConvTarget::U4 => (0, i128::from(u32::MAX)),
            ConvTarget::I8 => (i128::from(i64::MIN), i128::from(i64::MAX)),
            ConvTarget::U8 => (0, i128::from(u64::MAX)),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply(self, value: Slot) -> Result<Slot> {
        let wide = value.wide("conv")?;
        Ok(match self {
            ConvTarget::I1 => Slot::I32(i32::from(wide as i8)),
            ConvTarget::U1 => Slot::I32(i32::from(wide as u8)),
            ConvTarget::I2 => Slot::I32(i32::from(wide as i16)),
            ConvTarget::U2 => Slot::I32(i32::from(wide as u16)),
            ConvTarget::I4 | ConvTarget::U4 => Slot::I32(wide as i32),
            ConvTarget::I8 => Slot::I64(wide),
            ConvTarget::U8 => match value {
                Slot::I32(narrow) => Slot::I64(i64::from(narrow as u32)),
                _ => Slot::I64(wide),
            },
        })
    }

    #[allow(clippy::cast_sign_loss)]
    fn apply_checked(self, value: Slot, unsigned_source: bool) -> Result<Slot> {
        let source = match (value, unsigned_source) {
            (Slot::I32(narrow), true) => i128::from(narrow as u32),
            (Slot::I64(wide), true) => i128::from(wide as u64),
            (other, _) => i128::from(other.wide("conv.ovf")?),
        };
        let (min, max) = self.range();
        if source < min || source > max {
            return Err(EmulationError::ArithmeticOverflow);
        }
        self.apply(value)
    }
}

fn binary_op(
    operation: &'static str,
    a: Slot,
    b: Slot,
    narrow: impl Fn(i32, i32) -> Result<i32>,
    wide: impl Fn(i64, i64) -> Result<i64>,
) -> Result<Slot> {
    match (a, b) {
        (Slot::I32(x), Slot::I32(y)) => narrow(x, y).map(Slot::I32),
        (Slot::I32(_) | Slot::I64(_), Slot::I32(_) | Slot::I64(_)) => {
            wide(a.wide(operation)?, b.wide(operation)?).map(Slot::I64)
        }
        (Slot::I32(_) | Slot::I64(_), other) | (other, _) => {
            Err(mismatch(operation, "integer", other))
        }
    }
}

fn division_error<T: PartialEq + Default>(divisor: T) -> EmulationError {
    if divisor == T::default() {
        EmulationError::DivisionByZero
    } else {
        EmulationError::ArithmeticOverflow
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn arithmetic(opcode: u8, a: Slot, b: Slot) -> Result<Slot> {
    let overflow = || EmulationError::ArithmeticOverflow;
    match opcode {
        opcodes::ADD => binary_op("add", a, b, |x, y| Ok(x.wrapping_add(y)), |x, y| Ok(x.wrapping_add(y))),
        opcodes::SUB => binary_op("sub", a, b, |x, y| Ok(x.wrapping_sub(y)), |x, y| Ok(x.wrapping_sub(y))),
        opcodes::MUL => binary_op("mul", a, b, |x, y| Ok(x.wrapping_mul(y)), |x, y| Ok(x.wrapping_mul(y))),
        opcodes::DIV => binary_op(
            "div",
            a,
            b,
            |x, y| x.checked_div(y).ok_or_else(|| division_error(y)),
            |x, y| x.checked_div(y).ok_or_else(|| division_error(y)),
        ),
        opcodes::DIV_UN => binary_op(
            "div.un",
            a,
            b,
            |x, y| (x as u32).checked_div(y as u32).map(|r| r as i32).ok_or(EmulationError::DivisionByZero),
            |x, y| (x as u64).checked_div(y as u64).map(|r| r as i64).ok_or(EmulationError::DivisionByZero),
        ),
        opcodes::REM => binary_op(
            "rem",
            a,
            b,
            |x, y| x.checked_rem(y).ok_or_else(|| division_error(y)),
            |x, y| x.checked_rem(y).ok_or_else(|| division_error(y)),
        ),
        opcodes::REM_UN => binary_op(
            "rem.un",
            a,
            b,
            |x, y| (x as u32).checked_rem(y as u32).map(|r| r as i32).ok_or(EmulationError::DivisionByZero),
            |x, y| (x as u64).checked_rem(y as u64).map(|r| r as i64).ok_or(EmulationError::DivisionByZero),
        ),
        opcodes::AND => binary_op("and", a, b, |x, y| Ok(x & y), |x, y| Ok(x & y)),
        opcodes::OR => binary_op("or", a, b, |x, y| Ok(x | y), |x, y| Ok(x | y)),
        opcodes::XOR => binary_op("xor", a, b, |x, y| Ok(x ^ y), |x, y| Ok(x ^ y)),
        opcodes::ADD_OVF => binary_op(
            "add.ovf",
            a,
            b,
            |x, y| x.checked_add(y).ok_or_else(overflow),
            |x, y| x.checked_add(y).ok_or_else(overflow),
        ),
        opcodes::ADD_OVF_UN => binary_op(
            "add.ovf.un",
            a,
            b,
            |x, y| (x as u32).checked_add(y as u32).map(|r| r as i32).ok_or_else(overflow),
            |x, y| (x as u64).checked_add(y as u64).map(|r| r as i64).ok_or_else(overflow),
        ),
        opcodes::SUB_OVF => binary_op(
            "sub.ovf",
            a,
            b,
            |x, y| x.checked_sub(y).ok_or_else(overflow),
            |x, y| x.checked_sub(y).ok_or_else(overflow),
        ),
        opcodes::SUB_OVF_UN => binary_op(
            "sub.ovf.un",
            a,
            b,
            |x, y| (x as u32).checked_sub(y as u32).map(|r| r as i32).ok_or_else(overflow),
            |x, y| (x as u64).checked_sub(y as u64).map(|r| r as i64).ok_or_else(overflow),
        ),
        opcodes::MUL_OVF => binary_op(
            "mul.ovf",
            a,
            b,
            |x, y| x.checked_mul(y).ok_or_else(overflow),
            |x, y| x.checked_mul(y).ok_or_else(overflow),
        ),
        opcodes::MUL_OVF_UN => binary_op(
            "mul.ovf.un",
            a,
            b,
            |x, y| (x as u32).checked_mul(y as u32).map(|r| r as i32).ok_or_else(overflow),
            |x, y| (x as u64).checked_mul(y as u64).map(|r| r as i64).ok_or_else(overflow),
        ),
        _ => Err(EmulationError::UnsupportedOpcode { mnemonic: "arith" }),
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn shift(opcode: u8, value: Slot, amount: Slot) -> Result<Slot> {
    let amount = amount.wide("shift")? as u32;
    match (opcode, value) {
        (opcodes::SHL, Slot::I32(x)) => Ok(Slot::I32(x.wrapping_shl(amount))),
        (opcodes::SHL, Slot::I64(x)) => Ok(Slot::I64(x.wrapping_shl(amount))),
        (opcodes::SHR, Slot::I32(x)) => Ok(Slot::I32(x.wrapping_shr(amount))),
        (opcodes::SHR, Slot::I64(x)) => Ok(Slot::I64(x.wrapping_shr(amount))),
        (opcodes::SHR_UN, Slot::I32(x)) => Ok(Slot::I32((x as u32).wrapping_shr(amount) as i32)),
        (opcodes::SHR_UN, Slot::I64(x)) => Ok(Slot::I64((x as u64).wrapping_shr(amount) as i64)),
        (_, other) => Err(mismatch("shift", "integer", other)),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Comparison {
    Eq,
    Gt,
    GtUn,
    Lt,
    LtUn,
}

#[allow(clippy::cast_sign_loss)]
fn compare(comparison: Comparison, a: Slot, b: Slot) -> Result<bool> {
    match (a, b) {
        (Slot::Null, Slot::Null) => Ok(matches!(comparison, Comparison::Eq)),
        (Slot::Ref(x), Slot::Ref(y)) => Ok(match comparison {
            Comparison::Eq => x == y,
            _ => false,
        }),
        (Slot::Ref(_), Slot::Null) => Ok(matches!(comparison, Comparison::GtUn)),
        (Slot::Null, Slot::Ref(_)) => Ok(matches!(comparison, Comparison::LtUn)),
        (Slot::I32(x), Slot::I32(y)) => Ok(match comparison {
            Comparison::Eq => x == y,
            Comparison::Gt => x > y,
            Comparison::Lt => x < y,
            Comparison::GtUn => (x as u32) > (y as u32),
            Comparison::LtUn => (x as u32) < (y as u32),
        }),
        _ => {
            let x = a.wide("compare")?;
            let y = b.wide("compare")?;
            Ok(match comparison {
                Comparison::Eq => x == y,
                Comparison::Gt => x > y,
                Comparison::Lt => x < y,
                Comparison::GtUn => (x as u64) > (y as u64),
                Comparison::LtUn => (x as u64) < (y as u64),
            })
        }
    }
}

/// Condition of a two-operand conditional branch, `None` for other opcodes.
fn branch_condition(opcode: u8, a: Slot, b: Slot) -> Option<Result<bool>> {
    let opcode = match opcode {
        opcodes::BEQ_S..=opcodes::BLT_UN_S => opcode + (opcodes::BEQ - opcodes::BEQ_S),
        other => other,
    };
    let result = match opcode {
        opcodes::BEQ => compare(Comparison::Eq, a, b),
        opcodes::BGE => compare(Comparison::Lt, a, b).map(|lt| !lt),
        opcodes::BGT => compare(Comparison::Gt, a, b),
        opcodes::BLE => compare(Comparison::Gt, a, b).map(|gt| !gt),
        opcodes::BLT => compare(Comparison::Lt, a, b),
        opcodes::BNE_UN => compare(Comparison::Eq, a, b).map(|eq| !eq),
        opcodes::BGE_UN => compare(Comparison::LtUn, a, b).map(|lt| !lt),
        opcodes::BGT_UN => compare(Comparison::GtUn, a, b),
        opcodes::BLE_UN => compare(Comparison::GtUn, a, b).map(|gt| !gt),
        opcodes::BLT_UN => compare(Comparison::LtUn, a, b),
        _ => return None,
    };
    Some(result)
}

struct HeapArray {
    element: TypeSig,
    data: Vec<u8>,
}

struct Machine<'m> {
    module: &'m Module,
    limits: &'m EmulationLimits,
    heap: Vec<HeapArray>,
    heap_bytes: usize,
    statics: FxHashMap<Token, Slot>,
    executed: u64,
    started: Instant,
}

fn pop(stack: &mut Vec<Slot>) -> Result<Slot> {
    stack.pop().ok_or(EmulationError::StackUnderflow)
}

fn immediate_index(instruction: &Instruction) -> Result<usize> {
    match instruction.operand {
        Operand::Immediate(Immediate::UInt8(value)) => Ok(usize::from(value)),
        Operand::Immediate(Immediate::UInt16(value)) => Ok(usize::from(value)),
        _ => Err(EmulationError::UnsupportedOpcode {
            mnemonic: instruction.mnemonic,
        }),
    }
}

fn token_operand(instruction: &Instruction) -> Result<Token> {
    instruction.token().ok_or(EmulationError::UnsupportedOpcode {
        mnemonic: instruction.mnemonic,
    })
}

fn load(slots: &[Slot], index: usize, locals: bool) -> Result<Slot> {
    slots.get(index).copied().ok_or(if locals {
        EmulationError::LocalIndexOutOfBounds {
            index,
            count: slots.len(),
        }
    } else {
        EmulationError::ArgumentIndexOutOfBounds {
            index,
            count: slots.len(),
        }
    })
}

fn store(slots: &mut [Slot], index: usize, value: Slot, locals: bool) -> Result<()> {
    let count = slots.len();
    let slot = slots.get_mut(index).ok_or(if locals {
        EmulationError::LocalIndexOutOfBounds { index, count }
    } else {
        EmulationError::ArgumentIndexOutOfBounds { index, count }
    })?;
    *slot = value;
    Ok(())
}

impl Machine<'_> {
    fn tick(&mut self) -> Result<()> {
        self.executed += 1;
        if self.limits.max_instructions > 0 && self.executed > self.limits.max_instructions {
            return Err(EmulationError::InstructionLimitExceeded {
                limit: self.limits.max_instructions,
            });
        }
        if self.executed % TIMEOUT_CHECK_INTERVAL == 0 {
            if let Some(limit) = self.limits.timeout() {
                if self.started.elapsed() > limit {
                    return Err(EmulationError::Timeout { limit });
                }
            }
        }
        Ok(())
    }

    fn allocate(&mut self, element: TypeSig, data: Vec<u8>) -> Result<Slot> {
        let current = self.heap_bytes.saturating_add(data.len());
        if current > self.limits.max_heap_bytes {
            return Err(EmulationError::HeapMemoryLimitExceeded {
                current,
                limit: self.limits.max_heap_bytes,
            });
        }
        self.heap_bytes = current;
        self.heap.push(HeapArray { element, data });
        Ok(Slot::Ref(self.heap.len() - 1))
    }

    fn import(&mut self, value: EmValue) -> Result<Slot> {
        match value {
            EmValue::Null => Ok(Slot::Null),
            EmValue::I32(value) => Ok(Slot::I32(value)),
            EmValue::I64(value) => Ok(Slot::I64(value)),
            EmValue::Array { element, data } => self.allocate(element, data),
        }
    }

    fn export(&self, slot: Slot) -> EmValue {
        match slot {
            Slot::Null => EmValue::Null,
            Slot::I32(value) => EmValue::I32(value),
            Slot::I64(value) => EmValue::I64(value),
            Slot::Ref(index) => match self.heap.get(index) {
                Some(array) => EmValue::Array {
                    element: array.element.clone(),
                    data: array.data.clone(),
                },
                None => EmValue::Null,
            },
        }
    }

    fn array(&self, slot: Slot) -> Result<&HeapArray> {
        match slot {
            Slot::Ref(index) => self.heap.get(index).ok_or(EmulationError::NullReference),
            Slot::Null => Err(EmulationError::NullReference),
            other => Err(mismatch("array access", "array", other)),
        }
    }

    fn array_mut(&mut self, slot: Slot) -> Result<&mut HeapArray> {
        match slot {
            Slot::Ref(index) => self
                .heap
                .get_mut(index)
                .ok_or(EmulationError::NullReference),
            Slot::Null => Err(EmulationError::NullReference),
            other => Err(mismatch("array access", "array", other)),
        }
    }

    /// Resolves an element type token (`newarr`, `ldelem T`, `stelem T`).
    fn element_type(&self, token: Token) -> Result<TypeSig> {
        let unresolved = EmulationError::UnresolvedToken { token };
        match token.table_id() {
            Some(TableId::TypeRef) => {
                let name = self.module.type_ref(token).ok_or(unresolved)?.full_name();
                TypeSig::from_system_name(&name).ok_or(EmulationError::UnresolvedToken { token })
            }
            _ => Err(unresolved),
        }
    }

    fn element_range(&self, array: Slot, index: Slot, size: usize) -> Result<(usize, usize)> {
        let length = self.array(array)?.data.len();
        let index = index.wide("array index")?;
        let out_of_bounds = EmulationError::ArrayIndexOutOfBounds {
            index,
            length: length / size.max(1),
        };
        let start = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(size))
            .ok_or(out_of_bounds.clone())?;
        let end = start.checked_add(size).ok_or(out_of_bounds.clone())?;
        if end > length {
            return Err(out_of_bounds);
        }
        Ok((start, end))
    }

    fn load_element(&self, array: Slot, index: Slot, access: ElementAccess) -> Result<Slot> {
        let (start, end) = self.element_range(array, index, access.size)?;
        let bytes = &self.array(array)?.data[start..end];

        let mut raw = [0u8; 8];
        raw[..access.size].copy_from_slice(bytes);
        let unsigned = u64::from_le_bytes(raw);

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let slot = match (access.size, access.signed) {
            (1, true) => Slot::I32(i32::from(unsigned as u8 as i8)),
            (1, false) => Slot::I32(i32::from(unsigned as u8)),
            (2, true) => Slot::I32(i32::from(unsigned as u16 as i16)),
            (2, false) => Slot::I32(i32::from(unsigned as u16)),
            (4, _) => Slot::I32(unsigned as u32 as i32),
            _ => Slot::I64(unsigned as i64),
        };
        Ok(slot)
    }

    #[allow(clippy::cast_sign_loss)]
    fn store_element(
        &mut self,
        array: Slot,
        index: Slot,
        value: Slot,
        access: ElementAccess,
    ) -> Result<()> {
        let (start, end) = self.element_range(array, index, access.size)?;
        let bytes = (value.wide("stelem")? as u64).to_le_bytes();
        self.array_mut(array)?.data[start..end].copy_from_slice(&bytes[..access.size]);
        Ok(())
    }

    fn static_field(&mut self, token: Token) -> Result<Slot> {
        if let Some(value) = self.statics.get(&token) {
            return Ok(*value);
        }
        let field = self
            .module
            .field(token)
            .ok_or(EmulationError::UnresolvedToken { token })?;
        Ok(default_slot(&field.signature))
    }

    fn set_static_field(&mut self, token: Token, value: Slot) -> Result<()> {
        if self.module.field(token).is_none() {
            return Err(EmulationError::UnresolvedToken { token });
        }
        self.statics.insert(token, value);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, token: Token, mut args: Vec<Slot>, depth: usize) -> Result<Option<Slot>> {
        if depth >= self.limits.max_call_depth {
            return Err(EmulationError::CallDepthExceeded {
                limit: self.limits.max_call_depth,
            });
        }

        let module = self.module;
        let method = module
            .method(token)
            .ok_or(EmulationError::UnresolvedCall { token })?;
        let body = method
            .body
            .as_ref()
            .ok_or(EmulationError::MissingMethodBody { token })?;
        let instructions = &body.instructions;
        let positions: FxHashMap<u64, usize> = instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, index))
            .collect();
        let jump = |target: u64| {
            positions
                .get(&target)
                .copied()
                .ok_or(EmulationError::InvalidBranchTarget { target })
        };

        let mut locals: Vec<Slot> = body.locals.iter().map(default_slot).collect();
        let mut stack: Vec<Slot> = Vec::new();
        let mut ip = 0usize;

        loop {
            let Some(instruction) = instructions.get(ip) else {
                return Err(EmulationError::FellOffEnd { token });
            };
            self.tick()?;
            ip += 1;

            let unsupported = || EmulationError::UnsupportedOpcode {
                mnemonic: instruction.mnemonic,
            };

            if instruction.prefix == FE_PREFIX {
                match instruction.opcode {
                    opcodes::FE_CEQ
                    | opcodes::FE_CGT
                    | opcodes::FE_CGT_UN
                    | opcodes::FE_CLT
                    | opcodes::FE_CLT_UN => {
                        let b = pop(&mut stack)?;
                        let a = pop(&mut stack)?;
                        let comparison = match instruction.opcode {
                            opcodes::FE_CEQ => Comparison::Eq,
                            opcodes::FE_CGT => Comparison::Gt,
                            opcodes::FE_CGT_UN => Comparison::GtUn,
                            opcodes::FE_CLT => Comparison::Lt,
                            _ => Comparison::LtUn,
                        };
                        stack.push(Slot::I32(i32::from(compare(comparison, a, b)?)));
                    }
                    opcodes::FE_LDARG => stack.push(load(&args, immediate_index(instruction)?, false)?),
                    opcodes::FE_STARG => {
                        let value = pop(&mut stack)?;
                        store(&mut args, immediate_index(instruction)?, value, false)?;
                    }
                    opcodes::FE_LDLOC => stack.push(load(&locals, immediate_index(instruction)?, true)?),
                    opcodes::FE_STLOC => {
                        let value = pop(&mut stack)?;
                        store(&mut locals, immediate_index(instruction)?, value, true)?;
                    }
                    _ => return Err(unsupported()),
                }
                continue;
            }

            match instruction.opcode {
                opcodes::NOP => {}
                opcodes::LDARG_0..=opcodes::LDARG_3 | opcodes::LDARG_S => {
                    let index = instruction.arg_index().ok_or_else(unsupported)?;
                    stack.push(load(&args, usize::from(index), false)?);
                }
                opcodes::STARG_S => {
                    let value = pop(&mut stack)?;
                    store(&mut args, immediate_index(instruction)?, value, false)?;
                }
                opcodes::LDLOC_0..=opcodes::LDLOC_3 | opcodes::LDLOC_S => {
                    let index = instruction.local_index().ok_or_else(unsupported)?;
                    stack.push(load(&locals, usize::from(index), true)?);
                }
                opcodes::STLOC_0..=opcodes::STLOC_3 | opcodes::STLOC_S => {
                    let index = instruction.local_index().ok_or_else(unsupported)?;
                    let value = pop(&mut stack)?;
                    store(&mut locals, usize::from(index), value, true)?;
                }
                opcodes::LDNULL => stack.push(Slot::Null),
                opcodes::LDC_I4_M1..=opcodes::LDC_I4 => {
                    let value = instruction.ldc_i4_value().ok_or_else(unsupported)?;
                    stack.push(Slot::I32(value));
                }
                opcodes::LDC_I8 => match instruction.operand {
                    Operand::Immediate(Immediate::Int64(value)) => stack.push(Slot::I64(value)),
                    _ => return Err(unsupported()),
                },
                opcodes::DUP => {
                    let value = *stack.last().ok_or(EmulationError::StackUnderflow)?;
                    stack.push(value);
                }
                opcodes::POP => {
                    pop(&mut stack)?;
                }
                opcodes::RET => {
                    if method.signature.return_type == TypeSig::Void {
                        return Ok(None);
                    }
                    return pop(&mut stack).map(Some);
                }
                opcodes::CALL => {
                    let target = token_operand(instruction)?;
                    if !target.is_table(TableId::MethodDef) {
                        return Err(EmulationError::UnresolvedCall { token: target });
                    }
                    let callee = module
                        .method(target)
                        .ok_or(EmulationError::UnresolvedCall { token: target })?;
                    let count =
                        callee.signature.params.len() + usize::from(callee.signature.has_this);
                    if stack.len() < count {
                        return Err(EmulationError::StackUnderflow);
                    }
                    let call_args = stack.split_off(stack.len() - count);
                    if let Some(result) = self.run(target, call_args, depth + 1)? {
                        stack.push(result);
                    }
                }
                opcodes::BR_S | opcodes::BR => match instruction.operand {
                    Operand::Target(target) => ip = jump(target)?,
                    _ => return Err(unsupported()),
                },
                opcodes::BRFALSE_S | opcodes::BRFALSE | opcodes::BRTRUE_S | opcodes::BRTRUE => {
                    let value = pop(&mut stack)?;
                    let wanted = matches!(instruction.opcode, opcodes::BRTRUE_S | opcodes::BRTRUE);
                    if value.truthy() == wanted {
                        match instruction.operand {
                            Operand::Target(target) => ip = jump(target)?,
                            _ => return Err(unsupported()),
                        }
                    }
                }
                opcodes::BEQ_S..=opcodes::BLT_UN_S | opcodes::BEQ..=opcodes::BLT_UN => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let taken = branch_condition(instruction.opcode, a, b).ok_or_else(unsupported)??;
                    if taken {
                        match instruction.operand {
                            Operand::Target(target) => ip = jump(target)?,
                            _ => return Err(unsupported()),
                        }
                    }
                }
                opcodes::SWITCH => {
                    let selector = pop(&mut stack)?.wide("switch")?;
                    if let Operand::Switch(targets) = &instruction.operand {
                        if let Some(target) = usize::try_from(selector)
                            .ok()
                            .and_then(|index| targets.get(index))
                        {
                            ip = jump(*target)?;
                        }
                    } else {
                        return Err(unsupported());
                    }
                }
                opcodes::ADD..=opcodes::XOR
                | opcodes::ADD_OVF..=opcodes::SUB_OVF_UN => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(arithmetic(instruction.opcode, a, b)?);
                }
                opcodes::SHL | opcodes::SHR | opcodes::SHR_UN => {
                    let amount = pop(&mut stack)?;
                    let value = pop(&mut stack)?;
                    stack.push(shift(instruction.opcode, value, amount)?);
                }
                opcodes::NEG => match pop(&mut stack)? {
                    Slot::I32(value) => stack.push(Slot::I32(value.wrapping_neg())),
                    Slot::I64(value) => stack.push(Slot::I64(value.wrapping_neg())),
                    other => return Err(mismatch("neg", "integer", other)),
                },
                opcodes::NOT => match pop(&mut stack)? {
                    Slot::I32(value) => stack.push(Slot::I32(!value)),
                    Slot::I64(value) => stack.push(Slot::I64(!value)),
                    other => return Err(mismatch("not", "integer", other)),
                },
                opcodes::CONV_I1
                | opcodes::CONV_I2
                | opcodes::CONV_I4
                | opcodes::CONV_I8
                | opcodes::CONV_U4
                | opcodes::CONV_U8
                | opcodes::CONV_U2
                | opcodes::CONV_U1
                | opcodes::CONV_I
                | opcodes::CONV_U => {
                    let target = match instruction.opcode {
                        opcodes::CONV_I1 => ConvTarget::I1,
                        opcodes::CONV_I2 => ConvTarget::I2,
                        opcodes::CONV_I4 => ConvTarget::I4,
                        opcodes::CONV_U4 => ConvTarget::U4,
                        opcodes::CONV_U2 => ConvTarget::U2,
                        opcodes::CONV_U1 => ConvTarget::U1,
                        opcodes::CONV_U8 | opcodes::CONV_U => ConvTarget::U8,
                        _ => ConvTarget::I8,
                    };
                    let value = pop(&mut stack)?;
                    stack.push(target.apply(value)?);
                }
                opcodes::CONV_OVF_I1_UN..=opcodes::CONV_OVF_U_UN
                | opcodes::CONV_OVF_I1..=opcodes::CONV_OVF_U8
                | opcodes::CONV_OVF_I
                | opcodes::CONV_OVF_U => {
                    let (target, unsigned_source) = match instruction.opcode {
                        opcodes::CONV_OVF_I1_UN => (ConvTarget::I1, true),
                        opcodes::CONV_OVF_I2_UN => (ConvTarget::I2, true),
                        opcodes::CONV_OVF_I4_UN => (ConvTarget::I4, true),
                        opcodes::CONV_OVF_I8_UN | opcodes::CONV_OVF_I_UN => (ConvTarget::I8, true),
                        opcodes::CONV_OVF_U1_UN => (ConvTarget::U1, true),
                        opcodes::CONV_OVF_U2_UN => (ConvTarget::U2, true),
                        opcodes::CONV_OVF_U4_UN => (ConvTarget::U4, true),
                        opcodes::CONV_OVF_U8_UN | opcodes::CONV_OVF_U_UN => (ConvTarget::U8, true),
                        opcodes::CONV_OVF_I1 => (ConvTarget::I1, false),
                        opcodes::CONV_OVF_U1 => (ConvTarget::U1, false),
                        opcodes::CONV_OVF_I2 => (ConvTarget::I2, false),
                        opcodes::CONV_OVF_U2 => (ConvTarget::U2, false),
                        opcodes::CONV_OVF_I4 => (ConvTarget::I4, false),
                        opcodes::CONV_OVF_U4 => (ConvTarget::U4, false),
                        opcodes::CONV_OVF_U8 | opcodes::CONV_OVF_U => (ConvTarget::U8, false),
                        _ => (ConvTarget::I8, false),
                    };
                    let value = pop(&mut stack)?;
                    stack.push(target.apply_checked(value, unsigned_source)?);
                }
                opcodes::NEWARR => {
                    let element = self.element_type(token_operand(instruction)?)?;
                    let size = ElementAccess::of(&element)
                        .map(|access| access.size)
                        .ok_or_else(unsupported)?;
                    let count = pop(&mut stack)?.wide("newarr")?;
                    let count = usize::try_from(count).map_err(|_| EmulationError::ArithmeticOverflow)?;
                    let bytes = count
                        .checked_mul(size)
                        .ok_or(EmulationError::ArithmeticOverflow)?;
                    if self.heap_bytes.saturating_add(bytes) > self.limits.max_heap_bytes {
                        return Err(EmulationError::HeapMemoryLimitExceeded {
                            current: self.heap_bytes.saturating_add(bytes),
                            limit: self.limits.max_heap_bytes,
                        });
                    }
                    let array = self.allocate(element, vec![0; bytes])?;
                    stack.push(array);
                }
                opcodes::LDLEN => {
                    let array = self.array(pop(&mut stack)?)?;
                    let size = ElementAccess::of(&array.element).map_or(1, |access| access.size);
                    #[allow(clippy::cast_possible_wrap)]
                    let length = (array.data.len() / size) as i64;
                    stack.push(Slot::I64(length));
                }
                opcodes::LDELEM_I1..=opcodes::LDELEM_I | opcodes::LDELEM => {
                    let access = match instruction.opcode {
                        opcodes::LDELEM_I1 => ElementAccess::I1,
                        opcodes::LDELEM_U1 => ElementAccess::U1,
                        opcodes::LDELEM_I2 => ElementAccess::I2,
                        opcodes::LDELEM_U2 => ElementAccess::U2,
                        opcodes::LDELEM_I4 | opcodes::LDELEM_U4 => ElementAccess::I4,
                        opcodes::LDELEM_I8 | opcodes::LDELEM_I => ElementAccess::I8,
                        _ => {
                            let element = self.element_type(token_operand(instruction)?)?;
                            ElementAccess::of(&element).ok_or_else(unsupported)?
                        }
                    };
                    let index = pop(&mut stack)?;
                    let array = pop(&mut stack)?;
                    stack.push(self.load_element(array, index, access)?);
                }
                opcodes::STELEM_I..=opcodes::STELEM_I8 | opcodes::STELEM => {
                    let access = match instruction.opcode {
                        opcodes::STELEM_I1 => ElementAccess::I1,
                        opcodes::STELEM_I2 => ElementAccess::I2,
                        opcodes::STELEM_I4 => ElementAccess::I4,
                        opcodes::STELEM_I8 | opcodes::STELEM_I => ElementAccess::I8,
                        _ => {
                            let element = self.element_type(token_operand(instruction)?)?;
                            ElementAccess::of(&element).ok_or_else(unsupported)?
                        }
                    };
                    let value = pop(&mut stack)?;
                    let index = pop(&mut stack)?;
                    let array = pop(&mut stack)?;
                    self.store_element(array, index, value, access)?;
                }
                opcodes::LDSFLD => {
                    let value = self.static_field(token_operand(instruction)?)?;
                    stack.push(value);
                }
                opcodes::STSFLD => {
                    let value = pop(&mut stack)?;
                    self.set_static_field(token_operand(instruction)?, value)?;
                }
                _ => return Err(unsupported()),
            }
        }
    }
}
