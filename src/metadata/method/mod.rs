//! Method definitions and their bodies.
//!
//! # Key Components
//!
//! - [`MethodDef`] - A method defined in the module, with signature, flags and optional body
//! - [`MethodBody`] - Decoded IL plus local variable types
//! - [`MethodAccessFlags`], [`MethodModifiers`], [`MethodImplCodeType`] - Attribute flags
//!
//! A method carries either a CIL [`MethodBody`], native code (for `native` implementation
//! types), or neither (abstract, runtime provided or extern methods).

mod body;
mod types;

pub use body::{MethodBody, MethodBodyFlags};
pub use types::*;

use std::sync::Arc;

use crate::metadata::{signatures::MethodSig, token::Token};

/// A method defined in the module.
#[derive(Clone, Debug)]
pub struct MethodDef {
    /// `MethodDef` token
    pub token: Token,
    /// Simple name, e.g. `Get`
    pub name: String,
    /// Token of the declaring `TypeDef`
    pub declaring_type: Token,
    /// Visibility
    pub flags_access: MethodAccessFlags,
    /// Static, virtual, special name, ...
    pub flags_modifiers: MethodModifiers,
    /// How the implementation is provided
    pub impl_code_type: MethodImplCodeType,
    /// The signature
    pub signature: MethodSig,
    /// The CIL body, if any
    pub body: Option<MethodBody>,
    /// Machine code of a native method, if any
    pub native_code: Option<Arc<[u8]>>,
}

impl MethodDef {
    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags_modifiers.contains(MethodModifiers::STATIC)
    }

    /// Returns `true` for methods implemented in native code.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.impl_code_type.is_native()
    }

    /// Returns `true` for the type initializer `.cctor`.
    #[must_use]
    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor" && self.is_static()
    }

    /// Returns `true` for `.ctor`.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor" && !self.is_static()
    }

    /// Combined `MethodAttributes` value (II.23.1.10).
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags_access.bits() | self.flags_modifiers.bits()
    }

    /// Instruction count of the body, `0` without one.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.body.as_ref().map_or(0, |body| body.instructions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::TypeSig;

    #[test]
    fn test_predicates() {
        let method = MethodDef {
            token: Token(0x06000001),
            name: ".cctor".into(),
            declaring_type: Token(0x02000001),
            flags_access: MethodAccessFlags::PRIVATE,
            flags_modifiers: MethodModifiers::STATIC | MethodModifiers::SPECIAL_NAME,
            impl_code_type: MethodImplCodeType::IL,
            signature: MethodSig::new_static(TypeSig::Void, Vec::new()),
            body: None,
            native_code: None,
        };

        assert!(method.is_static());
        assert!(method.is_static_constructor());
        assert!(!method.is_constructor());
        assert!(!method.is_native());
        assert_eq!(method.flags(), 0x0811);
        assert_eq!(method.instruction_count(), 0);
    }
}
