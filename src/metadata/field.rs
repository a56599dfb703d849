//! Field definitions.

use crate::metadata::{signatures::TypeSig, token::Token};

#[allow(non_snake_case)]
/// All possible flags for `FieldAttributes`
pub mod FieldAttributes {
    /// These 3 bits contain one of the following values:
    pub const FIELD_ACCESS_MASK: u32 = 0x0007;
    /// Member not referenceable
    pub const COMPILER_CONTROLLED: u32 = 0x0000;
    /// Accessible only by the parent type
    pub const PRIVATE: u32 = 0x0001;
    /// Accessibly by anyone in the Assembly
    pub const ASSEMBLY: u32 = 0x0003;
    /// Accessibly by anyone who has visibility to this scope field contract attributes
    pub const PUBLIC: u32 = 0x0006;
    /// Defined on type, else per instance
    pub const STATIC: u32 = 0x0010;
    /// Field can only be initialized, not written to after init
    pub const INIT_ONLY: u32 = 0x0020;
    /// Value is compile time constant
    pub const LITERAL: u32 = 0x0040;
    /// Field has RVA
    pub const HAS_FIELD_RVA: u32 = 0x0100;
}

/// A field defined in the module.
#[derive(Clone, Debug)]
pub struct FieldDef {
    /// `Field` token
    pub token: Token,
    /// Simple name
    pub name: String,
    /// Token of the declaring `TypeDef`
    pub declaring_type: Token,
    /// `FieldAttributes` bitmask
    pub flags: u32,
    /// The field type
    pub signature: TypeSig,
    /// Data at the field RVA, for fields with [`FieldAttributes::HAS_FIELD_RVA`]
    pub initial_value: Option<Vec<u8>>,
}

impl FieldDef {
    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags & FieldAttributes::STATIC != 0
    }

    /// Returns `true` if the field maps initialization data.
    #[must_use]
    pub fn has_field_rva(&self) -> bool {
        self.flags & FieldAttributes::HAS_FIELD_RVA != 0
    }
}
