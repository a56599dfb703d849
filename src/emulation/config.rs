//! Execution limits for the CIL interpreter.

use std::time::Duration;

/// Execution limits to prevent runaway emulation.
///
/// The re-hosted decryption routine comes from an obfuscated binary and is executed without
/// any trust in its termination, so every run is bounded.
///
/// # Default Values
///
/// | Limit | Default Value |
/// |-------|---------------|
/// | `max_instructions` | 200,000,000 |
/// | `max_call_depth` | 256 |
/// | `max_heap_bytes` | 256 MB |
/// | `timeout_ms` | 60,000 (1 minute) |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulationLimits {
    /// Maximum instructions to execute.
    ///
    /// Set to 0 for unlimited execution. When exceeded, emulation
    /// stops with an instruction limit error.
    pub max_instructions: u64,

    /// Maximum call stack depth.
    ///
    /// Limits nested method calls to prevent stack overflow from
    /// infinite recursion.
    pub max_call_depth: usize,

    /// Maximum total size of all allocated arrays in bytes.
    pub max_heap_bytes: usize,

    /// Timeout in milliseconds.
    ///
    /// Set to 0 for no timeout. When exceeded, emulation stops
    /// with a timeout error.
    pub timeout_ms: u64,
}

impl EmulationLimits {
    /// The timeout as a [`Duration`], `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for EmulationLimits {
    /// Creates default execution limits.
    ///
    /// See the struct documentation for default values.
    fn default() -> Self {
        Self {
            max_instructions: 200_000_000,
            max_call_depth: 256,
            max_heap_bytes: 256 * 1024 * 1024, // 256 MB
            timeout_ms: 60_000,                // 1 minute
        }
    }
}
