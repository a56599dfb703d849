//! Obfuscator-specific detection and recovery.
//!
//! Each supported obfuscator lives in its own submodule and exposes the protections it can
//! undo. Protections are independent of each other: detecting one never requires another to
//! be present.
//!
//! # Supported Obfuscators
//!
//! | Obfuscator | Protection | Entry point |
//! |------------|------------|-------------|
//! | ConfuserEx | Constants  | [`confuserex::constants::ConstantsEngine`] |

pub mod confuserex;
