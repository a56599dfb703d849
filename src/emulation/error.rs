//! Emulation error types.
//!
//! This module defines the failure modes of CIL execution inside the
//! [`crate::emulation::CilInterpreter`] and of native key evaluation.

use std::{fmt, time::Duration};

use crate::metadata::token::Token;

/// Errors that can occur during CIL emulation.
///
/// This enum covers all failure modes during bytecode execution,
/// from stack underflows to unsupported opcodes.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulationError {
    /// Evaluation stack underflow (pop from empty stack).
    StackUnderflow,
    /// Type mismatch in operation.
    TypeMismatch {
        /// Operation being performed.
        operation: &'static str,
        /// Expected type.
        expected: &'static str,
        /// Actual type found.
        found: &'static str,
    },
    /// Local variable index out of bounds.
    LocalIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of locals available.
        count: usize,
    },
    /// Argument index out of bounds.
    ArgumentIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of arguments available.
        count: usize,
    },
    /// Invalid branch target.
    InvalidBranchTarget {
        /// The invalid target offset.
        target: u64,
    },
    /// Unsupported opcode.
    UnsupportedOpcode {
        /// Instruction mnemonic.
        mnemonic: &'static str,
    },
    /// A call target that is not a method defined in the executing image.
    UnresolvedCall {
        /// Token of the call target.
        token: Token,
    },
    /// A token operand that does not resolve in the executing image.
    UnresolvedToken {
        /// The unresolved token.
        token: Token,
    },
    /// Missing method body.
    MissingMethodBody {
        /// Token of the method.
        token: Token,
    },
    /// Array index out of bounds.
    ArrayIndexOutOfBounds {
        /// The invalid index.
        index: i64,
        /// Array length.
        length: usize,
    },
    /// Null reference access.
    NullReference,
    /// Division by zero.
    DivisionByZero,
    /// Arithmetic overflow.
    ArithmeticOverflow,
    /// Instruction count limit exceeded.
    InstructionLimitExceeded {
        /// Maximum allowed.
        limit: u64,
    },
    /// Call depth limit exceeded.
    CallDepthExceeded {
        /// Maximum allowed depth.
        limit: usize,
    },
    /// Heap memory limit exceeded.
    HeapMemoryLimitExceeded {
        /// Bytes that would be allocated in total.
        current: usize,
        /// Maximum allowed size.
        limit: usize,
    },
    /// Execution timeout.
    Timeout {
        /// Timeout limit.
        limit: Duration,
    },
    /// Execution ran past the last instruction.
    FellOffEnd {
        /// Token of the method.
        token: Token,
    },
    /// The value returned does not fit the requested result.
    InvalidReturn {
        /// Description of the returned value.
        found: &'static str,
    },
}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationError::StackUnderflow => write!(f, "evaluation stack underflow"),
            EmulationError::TypeMismatch {
                operation,
                expected,
                found,
            } => {
                write!(
                    f,
                    "type mismatch in {operation}: expected {expected}, found {found}"
                )
            }
            EmulationError::LocalIndexOutOfBounds { index, count } => {
                write!(
                    f,
                    "local variable index {index} out of bounds (count: {count})"
                )
            }
            EmulationError::ArgumentIndexOutOfBounds { index, count } => {
                write!(f, "argument index {index} out of bounds (count: {count})")
            }
            EmulationError::InvalidBranchTarget { target } => {
                write!(f, "invalid branch target: 0x{target:08X}")
            }
            EmulationError::UnsupportedOpcode { mnemonic } => {
                write!(f, "unsupported opcode: {mnemonic}")
            }
            EmulationError::UnresolvedCall { token } => {
                write!(f, "call target {token} is not defined in the executing image")
            }
            EmulationError::UnresolvedToken { token } => {
                write!(f, "unresolved token: {token}")
            }
            EmulationError::MissingMethodBody { token } => {
                write!(f, "method {token} has no body")
            }
            EmulationError::ArrayIndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds (length: {length})")
            }
            EmulationError::NullReference => write!(f, "null reference"),
            EmulationError::DivisionByZero => write!(f, "division by zero"),
            EmulationError::ArithmeticOverflow => write!(f, "arithmetic overflow"),
            EmulationError::InstructionLimitExceeded { limit } => {
                write!(f, "instruction limit exceeded (limit: {limit})")
            }
            EmulationError::CallDepthExceeded { limit } => {
                write!(f, "call depth exceeded (limit: {limit})")
            }
            EmulationError::HeapMemoryLimitExceeded { current, limit } => {
                write!(
                    f,
                    "heap memory limit exceeded: {current} bytes (limit: {limit})"
                )
            }
            EmulationError::Timeout { limit } => {
                write!(f, "execution timeout after {}ms", limit.as_millis())
            }
            EmulationError::FellOffEnd { token } => {
                write!(f, "execution of {token} ran past the last instruction")
            }
            EmulationError::InvalidReturn { found } => {
                write!(f, "invalid return value: {found}")
            }
        }
    }
}

impl std::error::Error for EmulationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            EmulationError::ArrayIndexOutOfBounds {
                index: 5,
                length: 4
            }
            .to_string(),
            "array index 5 out of bounds (length: 4)"
        );
        assert_eq!(
            EmulationError::UnsupportedOpcode { mnemonic: "ldftn" }.to_string(),
            "unsupported opcode: ldftn"
        );
    }

    #[test]
    fn test_converts_into_crate_error() {
        let error: crate::Error = EmulationError::DivisionByZero.into();
        assert!(error.is_detection_failure());
        assert_eq!(error.to_string(), "division by zero");
    }
}
