//! # confuserex-constants Prelude
//!
//! Re-exports the types needed to detect the constants scheme in a module and decode its
//! values. Import it with a glob to get started quickly.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all crate operations
pub use crate::Error;

/// The result type used throughout the crate
pub use crate::Result;

// ================================================================================================
// Module Model
// ================================================================================================

/// In-memory module and the builder used to create one
pub use crate::metadata::{builder::ModuleBuilder, module::Module, token::Token};

/// Type signatures used to instantiate decryptors
pub use crate::metadata::signatures::TypeSig;

// ================================================================================================
// Constants Engine
// ================================================================================================

/// Detection, decoding and configuration of the constants engine
pub use crate::deobfuscation::{
    Collaborators, ConstantsConfig, ConstantsEngine, DecryptedValue, DecryptionSite, EngineState,
    EventKind, EventLog, SiteMode,
};

/// Limits applied to the re-hosted initializer
pub use crate::emulation::EmulationLimits;
