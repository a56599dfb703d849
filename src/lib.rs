// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![deny(unsafe_code)]

//! # confuserex-constants
//!
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dotscope/blob/main/LICENSE-APACHE)
//!
//! Recovery of the constants hidden by the ConfuserEx obfuscator in .NET modules. Strings,
//! numeric literals and initialized arrays of a protected module are moved into a single
//! encrypted and LZMA-compressed buffer, and every use is replaced by a call to a generic
//! decryptor with an opaque index. This crate locates that machinery, recovers the buffer by
//! running the module's own initializer in isolation, and decodes any `(decryptor, index)` pair
//! back to the original value.
//!
//! ## Features
//!
//! - **🔍 Shape-based detection** - Finds the injected LZMA decoder, the buffer initializer and
//!   each decryptor from instruction patterns, without relying on names
//! - **⚡ Isolated execution** - The initializer runs in a freshly synthesized host unit inside
//!   a bounded CIL interpreter, never inside the analyzed module
//! - **🧩 Pluggable collaborators** - Simplifier, decompressor, executor and native emulator are
//!   traits with working defaults
//! - **🛡️ Thread-safe decoding** - A detected engine is immutable and decodes from any thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use confuserex_constants::prelude::*;
//!
//! # fn run(module: &Module) -> confuserex_constants::Result<()> {
//! let engine = ConstantsEngine::detect_default(module)?;
//! for site in engine.sites() {
//!     println!("{} ({:?})", site.method(), site.mode());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - In-memory model of a module: types, methods, fields and signatures
//! - [`assembly`] - CIL instructions, assembler, encoder and instruction templates
//! - [`emulation`] - Bounded CIL interpreter and the native emulation seam
//! - [`deobfuscation`] - The constants engine, its configuration and event log
//! - [`utils`] - Decompression
//! - [`Error`] and [`Result`] - Error handling
//!
//! ### Detection Pipeline
//!
//! Detection never modifies the module it is given. It works on a private copy, which is
//! canonicalized, searched and partially re-hosted before being dropped:
//!
//! 1. Locate the LZMA decompression routine and its helper types
//! 2. Extract the buffer by running the initializer's decryption loop in a host unit
//! 3. Classify the decryptor methods as native or arithmetic key derivation
//! 4. Decode values on demand through [`deobfuscation::ConstantsEngine`]
//!
//! ## Development
//!
//! ```bash
//! cargo test
//! cargo bench --bench constants
//! ```

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use confuserex_constants::prelude::*;
///
/// # fn run(module: &Module) {
/// if let Some(engine) = ConstantsEngine::detect(module) {
///     println!("{:?}", engine.state());
/// }
/// # }
/// ```
pub mod prelude;

/// CIL instructions, assembler and instruction templates.
///
/// - [`assembly::InstructionAssembler`] - Fluent builder for method bodies
/// - [`assembly::decode_stream`] - Decode raw IL bytes
/// - [`assembly::InstructionTemplate`] - Position-aware instruction patterns
pub mod assembly;

/// Detection and decoding of ConfuserEx constants.
pub mod deobfuscation;

/// Bounded CIL interpretation and the native emulation seam.
pub mod emulation;

/// Byte-level readers and writers.
pub mod file;

/// In-memory .NET module model.
pub mod metadata;

/// Shared helpers.
pub mod utils;

/// Crate-wide Result type.
///
/// Alias for `std::result::Result<T, Error>` used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide Error type.
///
/// All fallible operations of the crate report through this enum.
///
/// # Example
///
/// ```rust,no_run
/// use confuserex_constants::{prelude::*, Error};
///
/// # fn run(module: &Module) {
/// match ConstantsEngine::detect_default(module) {
///     Ok(engine) => println!("{} sites", engine.sites().len()),
///     Err(Error::Undetected(reason)) => println!("not protected: {reason}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// # }
/// ```
pub use error::Error;

/// Cursor-based reader used for IL bodies and host images.
///
/// # Example
///
/// ```rust,no_run
/// use confuserex_constants::{Parser, assembly::decode_instruction};
/// let code = [0x2A]; // ret
/// let mut parser = Parser::new(&code);
/// let instr = decode_instruction(&mut parser)?;
/// assert_eq!(instr.mnemonic, "ret");
/// # Ok::<(), confuserex_constants::Error>(())
/// ```
pub use file::parser::Parser;
