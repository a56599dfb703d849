//! Deobfuscation of ConfuserEx-protected .NET modules.
//!
//! This module hosts the analysis side of the crate: recognizing the code an obfuscator
//! injected into a module and recovering the data it hides. The supported protection is the
//! ConfuserEx constants scheme, see [`obfuscators::confuserex::constants`].
//!
//! # Key Components
//!
//! ## Engine
//!
//! [`ConstantsEngine`] detects the constants scheme in a [`crate::metadata::module::Module`]
//! and decodes the strings, primitives and arrays behind each decryptor call.
//!
//! ## Configuration
//!
//! [`ConstantsConfig`] holds the detection thresholds and the limits for running recovered
//! code. All fields have defaults matching current ConfuserEx builds.
//!
//! ## Diagnostics
//!
//! Every decision is recorded in an [`EventLog`]: located routines, rejected decoys, extracted
//! buffers and each decode. The log is append-only and can be shared across threads.
//!
//! ## Simplification
//!
//! Pattern matching runs over bodies canonicalized by an [`InstructionSimplifier`]. The
//! shipped [`NopStripper`] removes `nop` padding; richer simplifiers can be plugged in through
//! [`Collaborators`].
//!
//! # Example
//!
//! ```rust,no_run
//! use confuserex_constants::{
//!     deobfuscation::{Collaborators, ConstantsConfig, ConstantsEngine, EventLog},
//!     metadata::module::Module,
//! };
//!
//! # fn run(module: &Module) -> confuserex_constants::Result<()> {
//! let config = ConstantsConfig::default().with_min_decryptor_instructions(20);
//! let events = EventLog::new();
//!
//! let engine = ConstantsEngine::detect_with(
//!     module,
//!     config.clone(),
//!     Collaborators::new(&config),
//!     &events,
//! )?;
//! println!("{} decryptors, {}", engine.sites().len(), events.summary());
//! # Ok(())
//! # }
//! ```

mod config;
mod events;
mod simplifier;

pub mod obfuscators;

pub use config::ConstantsConfig;
pub use events::{Event, EventBuilder, EventKind, EventLog, EventLogIter};
pub use obfuscators::confuserex::constants::{
    Collaborators, ConstantsArtifacts, ConstantsEngine, DecryptedBlob, DecryptedValue,
    DecryptionSite, EngineState, SiteMode,
};
pub use simplifier::{InstructionSimplifier, NopStripper};
