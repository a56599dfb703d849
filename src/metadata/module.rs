//! The in-memory module model.
//!
//! A [`Module`] is a token-addressed view of the metadata tables the constants engine reads:
//! type definitions and references, methods (with decoded bodies), fields (with their RVA
//! data), member references and generic method instantiations. Tables are kept in token order,
//! so iteration follows declaration order.
//!
//! The `<Module>` global type always occupies the first `TypeDef` row.
//!
//! # Examples
//!
//! ```rust
//! use confuserex_constants::metadata::{
//!     builder::ModuleBuilder,
//!     method::{MethodAccessFlags, MethodModifiers},
//!     signatures::{MethodSig, TypeSig},
//! };
//!
//! let mut builder = ModuleBuilder::new("Sample.dll");
//! let global = builder.global_type();
//! let cctor = builder.method(
//!     global,
//!     ".cctor",
//!     MethodAccessFlags::PRIVATE,
//!     MethodModifiers::STATIC | MethodModifiers::SPECIAL_NAME,
//!     MethodSig::new_static(TypeSig::Void, Vec::new()),
//! );
//! let module = builder.build();
//!
//! assert_eq!(module.static_constructor().map(|m| m.token), Some(cctor));
//! assert_eq!(
//!     module.method_full_name(cctor).as_deref(),
//!     Some("System.Void <Module>::.cctor()")
//! );
//! ```

use std::collections::BTreeMap;

use crate::metadata::{
    field::FieldDef,
    member::{MemberRef, MemberRefSignature, MethodSpec},
    method::MethodDef,
    signatures::MethodSig,
    token::{TableId, Token},
    types::{TypeDef, TypeRef},
};

/// Token of the `<Module>` global type.
pub const GLOBAL_TYPE_TOKEN: Token = Token(0x0200_0001);

/// A loaded .NET module.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Module file name, e.g. `Sample.dll`
    pub name: String,
    /// Name of the containing assembly
    pub assembly_name: String,
    pub(crate) types: BTreeMap<Token, TypeDef>,
    pub(crate) type_refs: BTreeMap<Token, TypeRef>,
    pub(crate) methods: BTreeMap<Token, MethodDef>,
    pub(crate) fields: BTreeMap<Token, FieldDef>,
    pub(crate) member_refs: BTreeMap<Token, MemberRef>,
    pub(crate) method_specs: BTreeMap<Token, MethodSpec>,
}

impl Module {
    /// The `<Module>` type.
    #[must_use]
    pub fn global_type(&self) -> Option<&TypeDef> {
        self.types.get(&GLOBAL_TYPE_TOKEN)
    }

    /// The `.cctor` of `<Module>`.
    #[must_use]
    pub fn static_constructor(&self) -> Option<&MethodDef> {
        let global = self.global_type()?;
        global
            .methods
            .iter()
            .filter_map(|token| self.methods.get(token))
            .find(|method| method.is_static_constructor())
    }

    /// Looks up a `TypeDef`.
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        self.types.get(&token)
    }

    /// All type definitions in token order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Looks up a `TypeRef`.
    #[must_use]
    pub fn type_ref(&self, token: Token) -> Option<&TypeRef> {
        self.type_refs.get(&token)
    }

    /// All type references in token order.
    pub fn type_refs(&self) -> impl Iterator<Item = &TypeRef> {
        self.type_refs.values()
    }

    /// Looks up a `MethodDef`.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.methods.get(&token)
    }

    /// Mutable access to a `MethodDef`.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        self.methods.get_mut(&token)
    }

    /// All method definitions in token order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.values()
    }

    /// Methods declared by `type_token`, in declaration order.
    pub fn methods_of(&self, type_token: Token) -> impl Iterator<Item = &MethodDef> {
        self.types
            .get(&type_token)
            .into_iter()
            .flat_map(|ty| ty.methods.iter())
            .filter_map(|token| self.methods.get(token))
    }

    /// Types directly nested in `type_token`.
    pub fn nested_types(&self, type_token: Token) -> impl Iterator<Item = &TypeDef> {
        self.types
            .values()
            .filter(move |ty| ty.enclosing == Some(type_token))
    }

    /// Looks up a `Field`.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        self.fields.get(&token)
    }

    /// All fields in token order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Looks up a `MemberRef`.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        self.member_refs.get(&token)
    }

    /// All member references in token order.
    pub fn member_refs(&self) -> impl Iterator<Item = &MemberRef> {
        self.member_refs.values()
    }

    /// Looks up a `MethodSpec`.
    #[must_use]
    pub fn method_spec(&self, token: Token) -> Option<&MethodSpec> {
        self.method_specs.get(&token)
    }

    /// All method specs in token order.
    pub fn method_specs(&self) -> impl Iterator<Item = &MethodSpec> {
        self.method_specs.values()
    }

    /// Full name of a `TypeDef` (nested types joined with `/`) or `TypeRef`.
    #[must_use]
    pub fn type_full_name(&self, token: Token) -> Option<String> {
        match token.table_id()? {
            TableId::TypeDef => {
                let ty = self.types.get(&token)?;
                match ty.enclosing {
                    Some(enclosing) => {
                        Some(format!("{}/{}", self.type_full_name(enclosing)?, ty.name))
                    }
                    None => Some(ty.qualified_name()),
                }
            }
            TableId::TypeRef => Some(self.type_refs.get(&token)?.full_name()),
            _ => None,
        }
    }

    /// Returns `true` if `token` is a nested `TypeDef`.
    #[must_use]
    pub fn is_nested(&self, token: Token) -> bool {
        self.types.get(&token).is_some_and(TypeDef::is_nested)
    }

    /// Signature of a method token: `MethodDef`, method `MemberRef`, or the generic
    /// definition behind a `MethodSpec`.
    #[must_use]
    pub fn method_sig(&self, token: Token) -> Option<&MethodSig> {
        match token.table_id()? {
            TableId::MethodDef => Some(&self.methods.get(&token)?.signature),
            TableId::MemberRef => self.member_refs.get(&token)?.method_sig(),
            TableId::MethodSpec => self.method_sig(self.method_specs.get(&token)?.method),
            _ => None,
        }
    }

    /// Full method name in the form `Ret Declaring::Name(Params)`.
    #[must_use]
    pub fn method_full_name(&self, token: Token) -> Option<String> {
        let (declaring, name, sig) = match token.table_id()? {
            TableId::MethodDef => {
                let method = self.methods.get(&token)?;
                (
                    self.type_full_name(method.declaring_type)?,
                    method.name.as_str(),
                    &method.signature,
                )
            }
            TableId::MemberRef => {
                let member = self.member_refs.get(&token)?;
                let MemberRefSignature::Method(sig) = &member.signature else {
                    return None;
                };
                (member.declaring_type_name.clone(), member.name.as_str(), sig)
            }
            TableId::MethodSpec => {
                return self.method_full_name(self.method_specs.get(&token)?.method)
            }
            _ => return None,
        };

        Some(format!(
            "{} {}::{}{}",
            sig.return_type.full_name(),
            declaring,
            name,
            sig.params_string()
        ))
    }

    pub(crate) fn insert_type(&mut self, ty: TypeDef) {
        self.types.insert(ty.token, ty);
    }

    pub(crate) fn insert_type_ref(&mut self, ty: TypeRef) {
        self.type_refs.insert(ty.token, ty);
    }

    pub(crate) fn insert_method(&mut self, method: MethodDef) {
        if let Some(ty) = self.types.get_mut(&method.declaring_type) {
            if !ty.methods.contains(&method.token) {
                ty.methods.push(method.token);
            }
        }
        self.methods.insert(method.token, method);
    }

    pub(crate) fn insert_field(&mut self, field: FieldDef) {
        if let Some(ty) = self.types.get_mut(&field.declaring_type) {
            if !ty.fields.contains(&field.token) {
                ty.fields.push(field.token);
            }
        }
        self.fields.insert(field.token, field);
    }

    pub(crate) fn insert_member_ref(&mut self, member: MemberRef) {
        self.member_refs.insert(member.token, member);
    }

    pub(crate) fn insert_method_spec(&mut self, spec: MethodSpec) {
        self.method_specs.insert(spec.token, spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            builder::ModuleBuilder,
            method::{MethodAccessFlags, MethodModifiers},
            signatures::TypeSig,
            types::TypeAttributes,
        },
    };

    #[test]
    fn test_nested_names_and_member_refs() {
        let mut builder = ModuleBuilder::new("Test.dll");
        let outer = builder.type_def("Ns", "Outer", TypeAttributes::PUBLIC, None);
        let inner = builder.type_def("", "Inner", TypeAttributes::NESTED_PRIVATE, Some(outer));
        let get_utf8 = builder.member_ref_method(
            "System.Text.Encoding",
            "get_UTF8",
            MethodSig::new_static(TypeSig::class("System.Text.Encoding"), Vec::new()),
        );
        let module = builder.build();

        assert_eq!(module.type_full_name(inner).as_deref(), Some("Ns.Outer/Inner"));
        assert!(module.is_nested(inner));
        assert!(!module.is_nested(outer));
        assert_eq!(module.nested_types(outer).count(), 1);
        assert_eq!(
            module.method_full_name(get_utf8).as_deref(),
            Some("System.Text.Encoding System.Text.Encoding::get_UTF8()")
        );
    }

    #[test]
    fn test_method_spec_resolves_to_definition() {
        let mut builder = ModuleBuilder::new("Test.dll");
        let global = builder.global_type();
        let get = builder.method(
            global,
            "Get",
            MethodAccessFlags::ASSEM,
            MethodModifiers::STATIC,
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::U4]).with_generic_params(1),
        );
        let spec = builder.method_spec(get, vec![TypeSig::String]);
        let module = builder.build();

        assert_eq!(module.method_sig(spec).map(|s| s.generic_param_count), Some(1));
        assert_eq!(
            module.method_full_name(spec).as_deref(),
            Some("!!0 <Module>::Get(System.UInt32)")
        );
        assert_eq!(module.methods_of(global).count(), 1);
        assert!(module.static_constructor().is_none());
    }
}
