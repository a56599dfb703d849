//! Configuration for constants detection.
//!
//! The detection heuristics reject decoys by instruction count and by exact templates; the
//! floors and the tolerance of the native template are collected here together with the limits
//! the re-hosted initializer runs under.

use std::time::Duration;

use crate::emulation::EmulationLimits;

/// Configuration for the ConfuserEx constants engine.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `min_decompressor_instructions` | 60 |
/// | `min_initializer_instructions` | 15 |
/// | `min_decryptor_instructions` | 25 |
/// | `strict_native_template` | `false` |
/// | `execution` | [`EmulationLimits::default`] |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantsConfig {
    /// Minimum instruction count of the LZMA decompression routine.
    pub min_decompressor_instructions: usize,

    /// Minimum instruction count of the initializer that fills the constants buffer.
    pub min_initializer_instructions: usize,

    /// Minimum instruction count of a decryptor method.
    pub min_decryptor_instructions: usize,

    /// Require `ldloca` at the position the native template otherwise skips.
    ///
    /// ConfuserEx emits `ldloca` there; by default any instruction is accepted.
    pub strict_native_template: bool,

    /// Limits for running the re-hosted initializer.
    pub execution: EmulationLimits,
}

impl Default for ConstantsConfig {
    fn default() -> Self {
        Self {
            min_decompressor_instructions: 60,
            min_initializer_instructions: 15,
            min_decryptor_instructions: 25,
            strict_native_template: false,
            execution: EmulationLimits::default(),
        }
    }
}

impl ConstantsConfig {
    /// Sets the decompressor instruction floor.
    #[must_use]
    pub fn with_min_decompressor_instructions(mut self, count: usize) -> Self {
        self.min_decompressor_instructions = count;
        self
    }

    /// Sets the initializer instruction floor.
    #[must_use]
    pub fn with_min_initializer_instructions(mut self, count: usize) -> Self {
        self.min_initializer_instructions = count;
        self
    }

    /// Sets the decryptor instruction floor.
    #[must_use]
    pub fn with_min_decryptor_instructions(mut self, count: usize) -> Self {
        self.min_decryptor_instructions = count;
        self
    }

    /// Enables or disables the strict native template.
    #[must_use]
    pub fn with_strict_native_template(mut self, strict: bool) -> Self {
        self.strict_native_template = strict;
        self
    }

    /// Replaces the execution limits.
    #[must_use]
    pub fn with_execution_limits(mut self, limits: EmulationLimits) -> Self {
        self.execution = limits;
        self
    }

    /// Sets the instruction budget of the re-hosted initializer (0 = unlimited).
    #[must_use]
    pub fn with_max_instructions(mut self, count: u64) -> Self {
        self.execution.max_instructions = count;
        self
    }

    /// Sets the wall-clock timeout of the re-hosted initializer.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
