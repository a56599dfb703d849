//! Programmatic construction of [`Module`]s.
//!
//! [`ModuleBuilder`] hands out tokens row by row in each table, the way a metadata writer
//! lays out a fresh module. References (`TypeRef`, `MemberRef`, `MethodSpec`) are
//! de-duplicated, so asking twice for `System.Buffer::BlockCopy` yields the same token.

use std::sync::Arc;

use crate::{
    metadata::{
        field::FieldDef,
        member::{MemberRef, MemberRefSignature, MethodSpec},
        method::{MethodAccessFlags, MethodBody, MethodDef, MethodImplCodeType, MethodModifiers},
        module::{Module, GLOBAL_TYPE_TOKEN},
        signatures::{MethodSig, TypeSig},
        token::{TableId, Token},
        types::{TypeAttributes, TypeDef, TypeRef},
    },
    Result,
};

/// Incremental [`Module`] builder.
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
}

fn next_token(table: TableId, len: usize) -> Token {
    #[allow(clippy::cast_possible_truncation)]
    let row = len as u32 + 1;
    Token::from_parts(table, row)
}

impl ModuleBuilder {
    /// Starts a module containing only `<Module>`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let assembly_name = name
            .rsplit_once('.')
            .map_or(name, |(stem, _)| stem)
            .to_string();

        let mut module = Module {
            name: name.to_string(),
            assembly_name,
            ..Module::default()
        };
        module.insert_type(TypeDef {
            token: GLOBAL_TYPE_TOKEN,
            namespace: String::new(),
            name: "<Module>".to_string(),
            flags: TypeAttributes::NOT_PUBLIC,
            enclosing: None,
            methods: Vec::new(),
            fields: Vec::new(),
        });

        ModuleBuilder { module }
    }

    /// Token of `<Module>`.
    #[must_use]
    pub fn global_type(&self) -> Token {
        GLOBAL_TYPE_TOKEN
    }

    /// Adds a type definition.
    pub fn type_def(
        &mut self,
        namespace: &str,
        name: &str,
        flags: u32,
        enclosing: Option<Token>,
    ) -> Token {
        let token = next_token(TableId::TypeDef, self.module.types.len());
        self.module.insert_type(TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            enclosing,
            methods: Vec::new(),
            fields: Vec::new(),
        });
        token
    }

    /// Adds (or reuses) a reference to `namespace.name`.
    pub fn type_ref(&mut self, namespace: &str, name: &str) -> Token {
        if let Some(existing) = self
            .module
            .type_refs()
            .find(|ty| ty.namespace == namespace && ty.name == name)
        {
            return existing.token;
        }

        let token = next_token(TableId::TypeRef, self.module.type_refs.len());
        self.module.insert_type_ref(TypeRef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        token
    }

    /// Adds an IL method without a body.
    pub fn method(
        &mut self,
        declaring_type: Token,
        name: &str,
        access: MethodAccessFlags,
        modifiers: MethodModifiers,
        signature: MethodSig,
    ) -> Token {
        let token = next_token(TableId::MethodDef, self.module.methods.len());
        self.module.insert_method(MethodDef {
            token,
            name: name.to_string(),
            declaring_type,
            flags_access: access,
            flags_modifiers: modifiers,
            impl_code_type: MethodImplCodeType::IL,
            signature,
            body: None,
            native_code: None,
        });
        token
    }

    /// Adds a static native method with the given machine code.
    pub fn native_method(
        &mut self,
        declaring_type: Token,
        name: &str,
        signature: MethodSig,
        code: &[u8],
    ) -> Token {
        let token = self.method(
            declaring_type,
            name,
            MethodAccessFlags::ASSEM,
            MethodModifiers::STATIC,
            signature,
        );
        if let Some(method) = self.module.method_mut(token) {
            method.impl_code_type = MethodImplCodeType::NATIVE;
            method.native_code = Some(Arc::from(code));
        }
        token
    }

    /// Attaches a body to a previously declared method.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `method` is not part of the module.
    pub fn set_body(&mut self, method: Token, body: MethodBody) -> Result<()> {
        let Some(target) = self.module.method_mut(method) else {
            return Err(malformed_error!("Unknown method {}", method));
        };
        target.body = Some(body);
        Ok(())
    }

    /// Adds a field definition.
    pub fn field(
        &mut self,
        declaring_type: Token,
        name: &str,
        flags: u32,
        signature: TypeSig,
        initial_value: Option<Vec<u8>>,
    ) -> Token {
        let token = next_token(TableId::Field, self.module.fields.len());
        self.module.insert_field(FieldDef {
            token,
            name: name.to_string(),
            declaring_type,
            flags,
            signature,
            initial_value,
        });
        token
    }

    /// Adds (or reuses) a reference to a method declared by `declaring_type_name`.
    pub fn member_ref_method(
        &mut self,
        declaring_type_name: &str,
        name: &str,
        signature: MethodSig,
    ) -> Token {
        let signature = MemberRefSignature::Method(signature);
        if let Some(existing) = self.module.member_refs().find(|member| {
            member.declaring_type_name == declaring_type_name
                && member.name == name
                && member.signature == signature
        }) {
            return existing.token;
        }

        let token = next_token(TableId::MemberRef, self.module.member_refs.len());
        self.module.insert_member_ref(MemberRef {
            token,
            name: name.to_string(),
            declaring_type_name: declaring_type_name.to_string(),
            signature,
        });
        token
    }

    /// Adds (or reuses) an instantiation of the generic method `method`.
    pub fn method_spec(&mut self, method: Token, generic_args: Vec<TypeSig>) -> Token {
        if let Some(existing) = self
            .module
            .method_specs()
            .find(|spec| spec.method == method && spec.generic_args == generic_args)
        {
            return existing.token;
        }

        let token = next_token(TableId::MethodSpec, self.module.method_specs.len());
        self.module.insert_method_spec(MethodSpec {
            token,
            method,
            generic_args,
        });
        token
    }

    /// Finishes the module.
    #[must_use]
    pub fn build(self) -> Module {
        self.module
    }
}
