//! Method attribute and implementation flags.
//!
//! # Key Types
//! - [`MethodImplCodeType`]: how the body is implemented (IL, native, runtime)
//! - [`MethodAccessFlags`], [`MethodModifiers`]: visibility and modifiers of a method

use bitflags::bitflags;

/// Bitmask for extracting the code type from implementation flags
pub const METHOD_IMPL_CODE_TYPE_MASK: u32 = 0x0003;
/// Bitmask for extracting the access level from method flags
pub const METHOD_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
    /// Method implementation code type flags
    pub struct MethodImplCodeType: u32 {
        /// Method implementation is CIL
        const IL = 0x0000;
        /// Method implementation is native code
        const NATIVE = 0x0001;
        /// Reserved: shall be zero in conforming implementations
        const OPTIL = 0x0002;
        /// Method implementation is provided by the runtime
        const RUNTIME = 0x0003;
    }
}

impl MethodImplCodeType {
    /// Extract the code type from raw implementation flags
    #[must_use]
    pub fn from_impl_flags(flags: u32) -> Self {
        let code_type = flags & METHOD_IMPL_CODE_TYPE_MASK;
        Self::from_bits_truncate(code_type)
    }

    /// Returns `true` for a native (x86) body
    #[must_use]
    pub fn is_native(self) -> bool {
        self.bits() & METHOD_IMPL_CODE_TYPE_MASK == Self::NATIVE.bits()
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
    /// Method access flags
    pub struct MethodAccessFlags: u32 {
        /// Member not referenceable
        const COMPILER_CONTROLLED = 0x0000;
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by sub-types only in this assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible by anyone in the assembly
        const ASSEM = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by sub-types anywhere, plus anyone in the assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
    }
}

impl MethodAccessFlags {
    /// Extract the access level from raw method flags
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        let access = flags & METHOD_ACCESS_MASK;
        Self::from_bits_truncate(access)
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
    /// Method modifier flags
    pub struct MethodModifiers: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name+sig, else just by name
        const HIDE_BY_SIG = 0x0080;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// CLI provides 'special' behavior, depending upon the name of the method
        const RTSPECIAL_NAME = 0x1000;
        /// Implementation is forwarded through PInvoke
        const PINVOKE_IMPL = 0x2000;
    }
}

impl MethodModifiers {
    /// Extract the modifiers from raw method flags
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & !METHOD_ACCESS_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_type_extraction() {
        assert!(MethodImplCodeType::from_impl_flags(0x0001).is_native());
        assert!(MethodImplCodeType::from_impl_flags(0x0081).is_native());
        assert!(!MethodImplCodeType::from_impl_flags(0x0000).is_native());
        assert!(!MethodImplCodeType::from_impl_flags(0x0003).is_native());
    }

    #[test]
    fn test_access_and_modifiers() {
        let raw = 0x0096;
        assert_eq!(
            MethodAccessFlags::from_method_flags(raw),
            MethodAccessFlags::PUBLIC
        );
        assert_eq!(
            MethodModifiers::from_method_flags(raw),
            MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG
        );
    }
}
