//! ConfuserEx open-source obfuscator.
//!
//! ConfuserEx injects its runtime helpers into the `<Module>` type of the protected
//! assembly. Each protection adds its own helpers, so recognizing a protection starts from
//! the shape of that code rather than from any marker attribute.
//!
//! # Protections
//!
//! - [`constants`] - encrypted strings, primitives and initialized arrays

pub mod constants;

pub use constants::{ConstantsEngine, LzmaRoutine};
