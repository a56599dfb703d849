use thiserror::Error;

use crate::{emulation::EmulationError, metadata::token::Token};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two broad groups. Detection failures mean the module does not carry a
/// recoverable ConfuserEx constants scheme (or carries one that could not be re-hosted); they
/// collapse into "not detected" at the engine boundary. Decode failures are raised per call
/// against an already-detected engine and never invalidate the engine itself.
///
/// # Error Categories
///
/// ## Parsing Errors
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::Malformed`] - Corrupted IL, signature or host image data
/// - [`Error::InvalidMnemonic`] / [`Error::UndefinedLabel`] - IL that cannot be encoded
///
/// ## Detection Errors
/// - [`Error::Undetected`] - A detection stage found no match
/// - [`Error::Decompression`] - The extracted payload was not a valid LZMA stream
/// - [`Error::Emulation`] - The re-hosted initializer failed to execute
///
/// ## Decode Errors
/// - [`Error::OffsetOutOfRange`] - A derived offset points outside the blob
/// - [`Error::UnresolvedNativeKey`] - The native key routine could not be evaluated
/// - [`Error::UnsupportedTypeArgument`] - The call site instantiates an unknown type
/// - [`Error::InvalidUtf8`] - A string record is not valid UTF-8
/// - [`Error::InvalidArrayRecord`] - An array record header is corrupt
///
/// # Examples
///
/// ```rust,no_run
/// use confuserex_constants::{Error, deobfuscation::ConstantsEngine, metadata::module::Module};
///
/// # fn get_module() -> Module { unimplemented!() }
/// let module = get_module();
/// match ConstantsEngine::detect_default(&module) {
///     Ok(engine) => println!("{} decryptor(s)", engine.sites().len()),
///     Err(error) if error.is_detection_failure() => println!("not protected"),
///     Err(error) => eprintln!("{error}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The data is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// An opcode or mnemonic is not part of the CIL instruction set.
    #[error("Invalid instruction - {0}")]
    InvalidMnemonic(String),

    /// A branch refers to a label or offset that was never defined.
    #[error("Undefined branch target - {0}")]
    UndefinedLabel(String),

    /// A detection stage did not find what it was looking for.
    ///
    /// The message names the stage and, where possible, the reason.
    #[error("ConfuserEx constants not detected - {0}")]
    Undetected(String),

    /// A derived blob offset (plus the record it heads) does not fit the decrypted blob.
    #[error("Offset {offset:#x} (+{length}) is outside of the decrypted blob ({blob_len} bytes)")]
    OffsetOutOfRange {
        /// The byte offset derived from the call-site index
        offset: u32,
        /// The number of bytes the decoder needed at that offset
        length: usize,
        /// The size of the decrypted blob
        blob_len: usize,
    },

    /// The native key routine did not produce a concrete value for an index.
    #[error("Native key routine {method} produced no value for index {index:#x}")]
    UnresolvedNativeKey {
        /// Token of the native method that was emulated
        method: Token,
        /// The call-site index that was fed to the routine
        index: u32,
    },

    /// The generic argument of a call site is not one the decoders understand.
    #[error("Unsupported generic instantiation - {0}")]
    UnsupportedTypeArgument(String),

    /// An array record declares fewer than the four header bytes its count includes.
    #[error("Array record at offset {offset:#x} has invalid count {count}")]
    InvalidArrayRecord {
        /// The byte offset of the record
        offset: u32,
        /// The count stored in the record header
        count: i32,
    },

    /// A string record did not contain valid UTF-8.
    #[error("String record at offset {0:#x} is not valid UTF-8")]
    InvalidUtf8(u32),

    /// The decompressor rejected its input.
    #[error("Decompression failed - {0}")]
    Decompression(String),

    /// The re-hosted initializer routine failed during execution.
    #[error("{0}")]
    Emulation(#[from] EmulationError),

    /// The serialized host unit image could not be produced or loaded.
    #[error("Host image - {0}")]
    ImageFormat(String),

}

impl Error {
    /// Returns `true` for errors that mean "the scheme is not present or not recoverable".
    ///
    /// The engine reports all of these as a plain detection failure; callers that want to tell
    /// an unprotected module apart from a broken one can still inspect the variant.
    #[must_use]
    pub fn is_detection_failure(&self) -> bool {
        matches!(
            self,
            Error::Undetected(_)
                | Error::Malformed { .. }
                | Error::OutOfBounds
                | Error::InvalidMnemonic(_)
                | Error::UndefinedLabel(_)
                | Error::Decompression(_)
                | Error::Emulation(_)
                | Error::ImageFormat(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_macro_captures_location() {
        let error = malformed_error!("bad opcode {:#x}", 0xFF);
        match error {
            Error::Malformed {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "bad opcode 0xff");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_detection_failure_classification() {
        assert!(Error::Undetected("locator".into()).is_detection_failure());
        assert!(Error::Decompression("eof".into()).is_detection_failure());
        assert!(!Error::InvalidUtf8(4).is_detection_failure());
        assert!(!Error::InvalidArrayRecord {
            offset: 0,
            count: 3
        }
        .is_detection_failure());
        assert!(!Error::OffsetOutOfRange {
            offset: 8,
            length: 4,
            blob_len: 4
        }
        .is_detection_failure());
    }

    #[test]
    fn test_offset_error_display() {
        let error = Error::OffsetOutOfRange {
            offset: 0x10,
            length: 4,
            blob_len: 12,
        };
        assert_eq!(
            error.to_string(),
            "Offset 0x10 (+4) is outside of the decrypted blob (12 bytes)"
        );
    }
}
