//! Execution of code recovered from an obfuscated module.
//!
//! The constants engine needs to run two kinds of foreign code: the re-hosted ConfuserEx
//! initializer (CIL, turned into a `byte[] -> byte[]` routine) and the small x86 key routines
//! used by native-mode decryptors. Neither is trusted to terminate or to stay within sane
//! memory bounds, so everything here runs under explicit limits.
//!
//! # Key Components
//!
//! ## CIL Execution
//! - [`crate::emulation::CilInterpreter`] - Bounded interpreter for integer and array CIL
//! - [`crate::emulation::EmValue`] - Values passed in and out of the interpreter
//! - [`crate::emulation::EmulationLimits`] - Instruction, call depth, heap and time limits
//!
//! ## Native Key Routines
//! - [`crate::emulation::NativeEmulator`] - Pluggable x86 emulation seam
//! - [`crate::emulation::NativeRoutine`] - Identity and machine code of a native method
//! - [`crate::emulation::evaluate_native_key`] - Turns an index into a concrete key
//!
//! ## Errors
//! - [`crate::emulation::EmulationError`] - Failure modes of both execution paths
//!
//! # Thread Safety
//!
//! [`CilInterpreter`] is stateless between calls: every [`CilInterpreter::execute`] builds a
//! fresh heap and static field store, so a single interpreter can be shared across threads.

mod config;
mod error;
mod interpreter;
mod native;

pub use config::EmulationLimits;
pub use error::EmulationError;
pub use interpreter::{CilInterpreter, EmValue};
pub use native::{
    evaluate_native_key, EvaluationStack, FnEmulator, NativeEmulator, NativeRoutine, StackValue,
    UnsupportedEmulator,
};
