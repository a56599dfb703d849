//! Native key routine evaluation.
//!
//! Native-mode decryptors pass the call-site index through a small x86 routine embedded in the
//! module before deriving the blob offset. Executing that machine code is delegated to a
//! [`NativeEmulator`]; this module provides the routine description, the per-call evaluation
//! stack the result travels through, and the glue that turns an emulator answer into a key.
//!
//! # Key Components
//!
//! - [`NativeRoutine`] - A native method's identity and raw machine code
//! - [`NativeEmulator`] - The emulator seam: `emulate(routine, input) -> Option<i32>`
//! - [`FnEmulator`] / [`UnsupportedEmulator`] - Closure adapter and the "cannot emulate" default
//! - [`EvaluationStack`] / [`StackValue`] - Transient stack with per-bit validity tracking
//! - [`evaluate_native_key`] - Index in, fully determined 32-bit key out
//!
//! Every evaluation allocates its own [`EvaluationStack`]; nothing is retained between calls, so
//! one emulator can serve concurrent decodes as long as the emulator itself is `Sync`.
//!
//! # Usage Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use confuserex_constants::{
//!     emulation::{evaluate_native_key, FnEmulator, NativeRoutine},
//!     metadata::token::Token,
//! };
//!
//! let routine = NativeRoutine::new(Token::new(0x0600_0010), "Key", Arc::from(&[0xC3u8][..]));
//! let emulator = FnEmulator::new(|_: &NativeRoutine, input: i32| Some(input ^ 0x55));
//!
//! assert_eq!(evaluate_native_key(&emulator, &routine, 0x10)?, 0x45);
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use std::{fmt, sync::Arc};

use crate::{metadata::token::Token, Error, Result};

/// A native method whose machine code computes a key.
#[derive(Clone)]
pub struct NativeRoutine {
    /// `MethodDef` token of the native method
    pub token: Token,
    /// Method name
    pub name: String,
    /// Raw machine code, empty if the module carried none
    pub code: Arc<[u8]>,
}

impl NativeRoutine {
    /// Creates a routine description.
    #[must_use]
    pub fn new(token: Token, name: &str, code: Arc<[u8]>) -> Self {
        NativeRoutine {
            token,
            name: name.to_string(),
            code,
        }
    }
}

impl fmt::Debug for NativeRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRoutine")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("code_len", &self.code.len())
            .finish()
    }
}

/// Executes native key routines.
///
/// Implementations return `None` when the routine's result cannot be resolved to a concrete
/// value (unsupported instructions, memory accesses outside the routine, ...).
pub trait NativeEmulator: Send + Sync {
    /// Runs `routine` with `input` as its single `int32` argument.
    fn emulate(&self, routine: &NativeRoutine, input: i32) -> Option<i32>;
}

/// An emulator that resolves nothing.
///
/// This is the default collaborator: native-mode sites are still detected, but decoding them
/// fails with [`crate::Error::UnresolvedNativeKey`] until a real emulator is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedEmulator;

impl NativeEmulator for UnsupportedEmulator {
    fn emulate(&self, _routine: &NativeRoutine, _input: i32) -> Option<i32> {
        None
    }
}

/// Adapts a closure into a [`NativeEmulator`].
pub struct FnEmulator<F> {
    func: F,
}

impl<F> FnEmulator<F>
where
    F: Fn(&NativeRoutine, i32) -> Option<i32> + Send + Sync,
{
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        FnEmulator { func }
    }
}

impl<F> NativeEmulator for FnEmulator<F>
where
    F: Fn(&NativeRoutine, i32) -> Option<i32> + Send + Sync,
{
    fn emulate(&self, routine: &NativeRoutine, input: i32) -> Option<i32> {
        (self.func)(routine, input)
    }
}

impl<F> fmt::Debug for FnEmulator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnEmulator")
    }
}

/// A value on the emulated evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackValue {
    /// A 32-bit integer; bits cleared in `valid_bits` are unknown
    Int32 {
        /// The value (unknown bits are unspecified)
        value: i32,
        /// Mask of bits whose value is known
        valid_bits: u32,
    },
    /// A value the emulator could not determine at all
    Unknown,
}

impl StackValue {
    /// A fully known `int32`.
    #[must_use]
    pub fn int32(value: i32) -> Self {
        StackValue::Int32 {
            value,
            valid_bits: u32::MAX,
        }
    }

    /// The value, if every bit of it is known.
    #[must_use]
    pub fn concrete_i32(&self) -> Option<i32> {
        match *self {
            StackValue::Int32 {
                value,
                valid_bits: u32::MAX,
            } => Some(value),
            _ => None,
        }
    }
}

/// A small evaluation stack, created fresh for every native evaluation.
#[derive(Debug, Default)]
pub struct EvaluationStack {
    values: Vec<StackValue>,
}

impl EvaluationStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a value.
    pub fn push(&mut self, value: StackValue) {
        self.values.push(value);
    }

    /// Pops the top value.
    pub fn pop(&mut self) -> Option<StackValue> {
        self.values.pop()
    }

    /// The top value.
    #[must_use]
    pub fn peek(&self) -> Option<&StackValue> {
        self.values.last()
    }

    /// Number of values on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Evaluates a native key routine for `index`.
///
/// The index is pushed as the routine's argument, the routine is emulated, and its result must
/// come back as a fully determined `int32`.
///
/// # Errors
/// Returns [`crate::Error::UnresolvedNativeKey`] if the emulator cannot produce a concrete value.
pub fn evaluate_native_key(
    emulator: &dyn NativeEmulator,
    routine: &NativeRoutine,
    index: u32,
) -> Result<u32> {
    let unresolved = || Error::UnresolvedNativeKey {
        method: routine.token,
        index,
    };

    let mut stack = EvaluationStack::new();
    stack.push(StackValue::int32(index as i32));

    let argument = stack
        .pop()
        .and_then(|value| value.concrete_i32())
        .ok_or_else(unresolved)?;
    stack.push(
        emulator
            .emulate(routine, argument)
            .map_or(StackValue::Unknown, StackValue::int32),
    );

    let result = stack
        .pop()
        .and_then(|value| value.concrete_i32())
        .ok_or_else(unresolved)?;
    Ok(result as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine() -> NativeRoutine {
        NativeRoutine::new(Token::new(0x0600_0002), "Native", Arc::from(&[0xC3u8][..]))
    }

    #[test]
    fn test_concrete_result() {
        let emulator = FnEmulator::new(|_: &NativeRoutine, x: i32| Some(x.wrapping_mul(3)));
        assert_eq!(evaluate_native_key(&emulator, &routine(), 5).unwrap(), 15);
        assert_eq!(
            evaluate_native_key(&emulator, &routine(), 0xFFFF_FFFF).unwrap(),
            0xFFFF_FFFD
        );
    }

    #[test]
    fn test_unresolved_result() {
        let error = evaluate_native_key(&UnsupportedEmulator, &routine(), 7).unwrap_err();
        assert!(matches!(
            error,
            Error::UnresolvedNativeKey { method, index: 7 } if method == Token::new(0x0600_0002)
        ));
    }

    #[test]
    fn test_partial_values_are_not_concrete() {
        let partial = StackValue::Int32 {
            value: 1,
            valid_bits: 0x0000_FFFF,
        };
        assert_eq!(partial.concrete_i32(), None);
        assert_eq!(StackValue::Unknown.concrete_i32(), None);
        assert_eq!(StackValue::int32(-1).concrete_i32(), Some(-1));

        let mut stack = EvaluationStack::new();
        assert!(stack.is_empty());
        stack.push(partial);
        assert_eq!(stack.peek(), Some(&partial));
        assert_eq!(stack.len(), 1);
    }
}
