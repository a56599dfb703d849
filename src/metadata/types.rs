//! Type definitions and references.

use crate::metadata::token::Token;

#[allow(non_snake_case)]
/// All possible flags for `TypeAttributes` this crate inspects or emits
pub mod TypeAttributes {
    /// Mask for extracting type visibility information.
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    /// Type has no public scope (internal to assembly).
    pub const NOT_PUBLIC: u32 = 0x0000_0000;
    /// Type has public scope.
    pub const PUBLIC: u32 = 0x0000_0001;
    /// Nested type with public visibility.
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    /// Nested type with private visibility.
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    /// Nested type visible within the assembly.
    pub const NESTED_ASSEMBLY: u32 = 0x0000_0005;
    /// Type is an interface.
    pub const INTERFACE: u32 = 0x0000_0020;
    /// Type cannot be instantiated.
    pub const ABSTRACT: u32 = 0x0000_0080;
    /// Type cannot be derived from.
    pub const SEALED: u32 = 0x0000_0100;
    /// Type name has special meaning to tools.
    pub const SPECIAL_NAME: u32 = 0x0000_0400;
    /// Initialize the type before the first static field access.
    pub const BEFORE_FIELD_INIT: u32 = 0x0010_0000;
}

/// A type defined in the module.
#[derive(Clone, Debug)]
pub struct TypeDef {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, empty for nested and global types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// `TypeAttributes` bitmask
    pub flags: u32,
    /// Enclosing type of a nested type
    pub enclosing: Option<Token>,
    /// Methods in declaration order
    pub methods: Vec<Token>,
    /// Fields in declaration order
    pub fields: Vec<Token>,
}

impl TypeDef {
    /// Returns `true` if the type is nested in another type.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.enclosing.is_some()
    }

    /// Namespace-qualified name without the enclosing chain.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// A reference to a type defined in another assembly.
#[derive(Clone, Debug)]
pub struct TypeRef {
    /// `TypeRef` token
    pub token: Token,
    /// Namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
}

impl TypeRef {
    /// `Namespace.Name`
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}
