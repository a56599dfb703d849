//! Member references and generic method instantiations.

use crate::metadata::{
    signatures::{MethodSig, TypeSig},
    token::Token,
};

/// The signature of a referenced member.
#[derive(Clone, Debug, PartialEq)]
pub enum MemberRefSignature {
    /// A referenced method
    Method(MethodSig),
    /// A referenced field
    Field(TypeSig),
}

/// A reference to a member of another type, usually in another assembly.
#[derive(Clone, Debug)]
pub struct MemberRef {
    /// `MemberRef` token
    pub token: Token,
    /// Simple name, e.g. `BlockCopy`
    pub name: String,
    /// Full name of the declaring type, e.g. `System.Buffer`
    pub declaring_type_name: String,
    /// The referenced signature
    pub signature: MemberRefSignature,
}

impl MemberRef {
    /// The method signature, if this references a method.
    #[must_use]
    pub fn method_sig(&self) -> Option<&MethodSig> {
        match &self.signature {
            MemberRefSignature::Method(sig) => Some(sig),
            MemberRefSignature::Field(_) => None,
        }
    }
}

/// An instantiation of a generic method, e.g. `Get<string>`.
#[derive(Clone, Debug)]
pub struct MethodSpec {
    /// `MethodSpec` token
    pub token: Token,
    /// The generic method, a `MethodDef` or `MemberRef` token
    pub method: Token,
    /// The generic arguments
    pub generic_args: Vec<TypeSig>,
}
