//! Synthetic host units for running recovered initializer code.
//!
//! The constants initializer cannot be executed where it lives: it runs as part of the module
//! constructor, reads its input from an embedded field and stores its output into another one.
//! After IL surgery it becomes a pure `byte[] (byte[])` function, which is transplanted into a
//! minimal unit of its own together with every helper type it may call into.
//!
//! # Architecture
//!
//! - [`HostUnit`] - Value representation of the unit: one public type with one public static
//!   method, the carried helper types and every type, field and member reference their bodies
//!   use. Tokens of carried items are preserved, so no body has to be rewritten.
//! - [`HostUnit::write_to`] / [`LoadedImage::load`] - Serialization into a self-describing byte
//!   image and back. Method bodies travel as real CIL (tiny / fat headers) and are decoded again
//!   on load, so a body the encoder cannot express never reaches execution.
//! - [`with_loaded_image`] - Scoped loading: the image exists only for the duration of the
//!   closure and is released on every path.
//! - [`UnitExecutor`] - The execution seam. [`CilInterpreter`] is the shipped implementation;
//!   tests substitute stubs.
//!
//! # Image Layout
//!
//! ```text
//! magic "CXHU", version u8
//! assembly name, module name         (7-bit length prefixed UTF-8)
//! entry type token, entry method     (u32 LE)
//! type refs   : count, { token, namespace, name }
//! types       : count, { token, namespace, name, flags, enclosing | 0 }
//! fields      : count, { token, name, declaring, flags, signature, initial value? }
//! member refs : count, { token, declaring type name, name, kind, signature }
//! methods     : count, { token, name, declaring, flags, impl flags, signature,
//!                        locals, body?, native code? }
//! ```
//!
//! Counts are ECMA-335 compressed integers; signatures use the element type encoding of
//! [`crate::metadata::signatures`].

use std::collections::BTreeMap;

use crate::{
    emulation::{CilInterpreter, EmValue},
    file::io::{push_compressed_uint, push_le, push_prefixed_string},
    metadata::{
        field::FieldDef,
        member::{MemberRef, MemberRefSignature},
        method::{
            MethodAccessFlags, MethodBody, MethodDef, MethodImplCodeType, MethodModifiers,
        },
        module::Module,
        signatures::{MethodSig, TypeSig},
        token::{TableId, Token},
        types::{TypeAttributes, TypeDef, TypeRef},
    },
    Error, Parser, Result,
};

/// Leading bytes of every host image.
pub const HOST_IMAGE_MAGIC: &[u8; 4] = b"CXHU";

const HOST_IMAGE_VERSION: u8 = 1;

const MEMBER_KIND_METHOD: u8 = 0;
const MEMBER_KIND_FIELD: u8 = 1;

/// A minimal, self-contained unit hosting one recovered method.
#[derive(Debug, Clone)]
pub struct HostUnit {
    assembly_name: String,
    module_name: String,
    entry_type: TypeDef,
    entry: MethodDef,
    types: BTreeMap<Token, TypeDef>,
    methods: BTreeMap<Token, MethodDef>,
    fields: BTreeMap<Token, FieldDef>,
    type_refs: BTreeMap<Token, TypeRef>,
    member_refs: BTreeMap<Token, MemberRef>,
}

impl HostUnit {
    /// Name of the synthesized assembly.
    pub const ASSEMBLY_NAME: &'static str = "TempAssembly";
    /// Name of the synthesized module.
    pub const MODULE_NAME: &'static str = "TempModule";
    /// Name of the synthesized type.
    pub const TYPE_NAME: &'static str = "TempType";

    /// Builds a unit around `body`, exposed as `public static byte[] name(byte[])`.
    ///
    /// Every method of `helper_types` is carried along, together with the enclosing types,
    /// fields, type references and member references any carried body refers to. The entry
    /// type and method receive tokens one past the last row of `source`.
    #[must_use]
    pub fn new(source: &Module, name: &str, body: MethodBody, helper_types: &[Token]) -> Self {
        let entry_type_token = Token::from_parts(
            TableId::TypeDef,
            source.types().map(|ty| ty.token.row()).max().unwrap_or(0) + 1,
        );
        let entry_token = Token::from_parts(
            TableId::MethodDef,
            source.methods().map(|m| m.token.row()).max().unwrap_or(0) + 1,
        );

        let entry_type = TypeDef {
            token: entry_type_token,
            namespace: String::new(),
            name: Self::TYPE_NAME.to_string(),
            flags: TypeAttributes::PUBLIC,
            enclosing: None,
            methods: Vec::new(),
            fields: Vec::new(),
        };
        let byte_array = TypeSig::sz_array(TypeSig::U1);
        let entry = MethodDef {
            token: entry_token,
            name: name.to_string(),
            declaring_type: entry_type_token,
            flags_access: MethodAccessFlags::PUBLIC,
            flags_modifiers: MethodModifiers::STATIC,
            impl_code_type: MethodImplCodeType::IL,
            signature: MethodSig::new_static(byte_array.clone(), vec![byte_array]),
            body: Some(body),
            native_code: None,
        };

        let mut unit = HostUnit {
            assembly_name: Self::ASSEMBLY_NAME.to_string(),
            module_name: Self::MODULE_NAME.to_string(),
            entry_type,
            entry,
            types: BTreeMap::new(),
            methods: BTreeMap::new(),
            fields: BTreeMap::new(),
            type_refs: BTreeMap::new(),
            member_refs: BTreeMap::new(),
        };

        for &helper in helper_types {
            unit.carry_type(source, helper);
            for method in source.methods_of(helper) {
                unit.methods.insert(method.token, method.clone());
            }
        }

        let mut referenced: Vec<Token> = Vec::new();
        let bodies = std::iter::once(&unit.entry)
            .chain(unit.methods.values())
            .filter_map(|method| method.body.as_ref());
        for body in bodies {
            referenced.extend(body.instructions.iter().filter_map(|i| i.token()));
        }
        for token in referenced {
            unit.carry_reference(source, token);
        }

        unit
    }

    /// Adds a shell of `token` and all of its enclosing types.
    fn carry_type(&mut self, source: &Module, token: Token) {
        let mut current = Some(token);
        while let Some(token) = current {
            if self.types.contains_key(&token) {
                break;
            }
            let Some(ty) = source.type_def(token) else {
                break;
            };
            self.types.insert(
                token,
                TypeDef {
                    methods: Vec::new(),
                    fields: Vec::new(),
                    ..ty.clone()
                },
            );
            current = ty.enclosing;
        }
    }

    fn carry_reference(&mut self, source: &Module, token: Token) {
        match token.table_id() {
            Some(TableId::TypeRef) => {
                if let Some(ty) = source.type_ref(token) {
                    self.type_refs.insert(token, ty.clone());
                }
            }
            Some(TableId::TypeDef) => self.carry_type(source, token),
            Some(TableId::Field) => {
                if let Some(field) = source.field(token) {
                    self.carry_type(source, field.declaring_type);
                    self.fields.insert(token, field.clone());
                }
            }
            Some(TableId::MemberRef) => {
                if let Some(member) = source.member_ref(token) {
                    self.member_refs.insert(token, member.clone());
                }
            }
            _ => {}
        }
    }

    /// The hosted method.
    #[must_use]
    pub fn entry(&self) -> &MethodDef {
        &self.entry
    }

    /// The synthesized type declaring the hosted method.
    #[must_use]
    pub fn entry_type(&self) -> &TypeDef {
        &self.entry_type
    }

    /// Tokens of the carried type definitions (helpers and their enclosing types).
    pub fn carried_types(&self) -> impl Iterator<Item = Token> + '_ {
        self.types.keys().copied()
    }

    /// Number of carried methods, excluding the entry.
    #[must_use]
    pub fn carried_method_count(&self) -> usize {
        self.methods.len()
    }

    /// Serializes the unit into `buffer`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a method body or signature cannot be encoded.
    pub fn write_to(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(HOST_IMAGE_MAGIC);
        buffer.push(HOST_IMAGE_VERSION);
        push_prefixed_string(buffer, &self.assembly_name);
        push_prefixed_string(buffer, &self.module_name);
        push_le::<u32>(buffer, self.entry_type.token.value());
        push_le::<u32>(buffer, self.entry.token.value());

        push_count(buffer, self.type_refs.len())?;
        for ty in self.type_refs.values() {
            push_le::<u32>(buffer, ty.token.value());
            push_prefixed_string(buffer, &ty.namespace);
            push_prefixed_string(buffer, &ty.name);
        }

        push_count(buffer, self.types.len() + 1)?;
        for ty in std::iter::once(&self.entry_type).chain(self.types.values()) {
            push_le::<u32>(buffer, ty.token.value());
            push_prefixed_string(buffer, &ty.namespace);
            push_prefixed_string(buffer, &ty.name);
            push_le::<u32>(buffer, ty.flags);
            push_le::<u32>(buffer, ty.enclosing.map_or(0, |t| t.value()));
        }

        push_count(buffer, self.fields.len())?;
        for field in self.fields.values() {
            push_le::<u32>(buffer, field.token.value());
            push_prefixed_string(buffer, &field.name);
            push_le::<u32>(buffer, field.declaring_type.value());
            push_le::<u32>(buffer, field.flags);
            field.signature.encode(buffer)?;
            push_blob(buffer, field.initial_value.as_deref())?;
        }

        push_count(buffer, self.member_refs.len())?;
        for member in self.member_refs.values() {
            push_le::<u32>(buffer, member.token.value());
            push_prefixed_string(buffer, &member.declaring_type_name);
            push_prefixed_string(buffer, &member.name);
            match &member.signature {
                MemberRefSignature::Method(sig) => {
                    buffer.push(MEMBER_KIND_METHOD);
                    sig.encode(buffer)?;
                }
                MemberRefSignature::Field(sig) => {
                    buffer.push(MEMBER_KIND_FIELD);
                    sig.encode(buffer)?;
                }
            }
        }

        push_count(buffer, self.methods.len() + 1)?;
        for method in std::iter::once(&self.entry).chain(self.methods.values()) {
            write_method(buffer, method)?;
        }

        Ok(())
    }
}

fn push_count(buffer: &mut Vec<u8>, count: usize) -> Result<()> {
    let count =
        u32::try_from(count).map_err(|_| malformed_error!("Too many rows - {}", count))?;
    push_compressed_uint(buffer, count)
}

fn push_blob(buffer: &mut Vec<u8>, blob: Option<&[u8]>) -> Result<()> {
    match blob {
        Some(data) => {
            buffer.push(1);
            push_count(buffer, data.len())?;
            buffer.extend_from_slice(data);
        }
        None => buffer.push(0),
    }
    Ok(())
}

fn write_method(buffer: &mut Vec<u8>, method: &MethodDef) -> Result<()> {
    push_le::<u32>(buffer, method.token.value());
    push_prefixed_string(buffer, &method.name);
    push_le::<u32>(buffer, method.declaring_type.value());
    push_le::<u32>(buffer, method.flags());
    push_le::<u32>(buffer, method.impl_code_type.bits());
    method.signature.encode(buffer)?;

    let locals = method.body.as_ref().map_or(&[][..], |body| &body.locals[..]);
    push_count(buffer, locals.len())?;
    for local in locals {
        local.encode(buffer)?;
    }

    let code = method.body.as_ref().map(MethodBody::to_bytes).transpose()?;
    push_blob(buffer, code.as_deref())?;
    push_blob(buffer, method.native_code.as_deref())
}

/// A host image parsed back into an executable module.
#[derive(Debug)]
pub struct LoadedImage {
    module: Module,
    entry_type: Token,
    entry: Token,
}

impl LoadedImage {
    /// Parses an image produced by [`HostUnit::write_to`].
    ///
    /// # Errors
    /// Returns [`Error::ImageFormat`] for foreign data, and [`Error::Malformed`] or
    /// [`Error::OutOfBounds`] for damaged images.
    pub fn load(data: &[u8]) -> Result<LoadedImage> {
        let mut parser = Parser::new(data);
        if data.len() < HOST_IMAGE_MAGIC.len() || parser.read_bytes(4)? != HOST_IMAGE_MAGIC {
            return Err(Error::ImageFormat("missing host image magic".to_string()));
        }
        let version = parser.read_le::<u8>()?;
        if version != HOST_IMAGE_VERSION {
            return Err(Error::ImageFormat(format!(
                "unsupported host image version {version}"
            )));
        }

        let assembly_name = parser.read_prefixed_string_utf8()?;
        let module_name = parser.read_prefixed_string_utf8()?;
        let entry_type = Token::new(parser.read_le::<u32>()?);
        let entry = Token::new(parser.read_le::<u32>()?);

        let mut module = Module {
            name: module_name,
            assembly_name,
            ..Module::default()
        };

        for _ in 0..parser.read_compressed_uint()? {
            module.insert_type_ref(TypeRef {
                token: Token::new(parser.read_le::<u32>()?),
                namespace: parser.read_prefixed_string_utf8()?,
                name: parser.read_prefixed_string_utf8()?,
            });
        }

        for _ in 0..parser.read_compressed_uint()? {
            let token = Token::new(parser.read_le::<u32>()?);
            let namespace = parser.read_prefixed_string_utf8()?;
            let name = parser.read_prefixed_string_utf8()?;
            let flags = parser.read_le::<u32>()?;
            let enclosing = Token::new(parser.read_le::<u32>()?);
            module.insert_type(TypeDef {
                token,
                namespace,
                name,
                flags,
                enclosing: (!enclosing.is_null()).then_some(enclosing),
                methods: Vec::new(),
                fields: Vec::new(),
            });
        }

        for _ in 0..parser.read_compressed_uint()? {
            let token = Token::new(parser.read_le::<u32>()?);
            let name = parser.read_prefixed_string_utf8()?;
            let declaring_type = Token::new(parser.read_le::<u32>()?);
            let flags = parser.read_le::<u32>()?;
            let signature = TypeSig::decode(&mut parser)?;
            let initial_value = read_blob(&mut parser)?.map(<[u8]>::to_vec);
            module.insert_field(FieldDef {
                token,
                name,
                declaring_type,
                flags,
                signature,
                initial_value,
            });
        }

        for _ in 0..parser.read_compressed_uint()? {
            let token = Token::new(parser.read_le::<u32>()?);
            let declaring_type_name = parser.read_prefixed_string_utf8()?;
            let name = parser.read_prefixed_string_utf8()?;
            let signature = match parser.read_le::<u8>()? {
                MEMBER_KIND_METHOD => MemberRefSignature::Method(MethodSig::decode(&mut parser)?),
                MEMBER_KIND_FIELD => MemberRefSignature::Field(TypeSig::decode(&mut parser)?),
                kind => return Err(malformed_error!("Unknown member kind - {}", kind)),
            };
            module.insert_member_ref(MemberRef {
                token,
                name,
                declaring_type_name,
                signature,
            });
        }

        for _ in 0..parser.read_compressed_uint()? {
            let method = read_method(&mut parser)?;
            module.insert_method(method);
        }

        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing byte(s) in host image",
                parser.remaining()
            ));
        }

        Ok(LoadedImage {
            module,
            entry_type,
            entry,
        })
    }

    /// The loaded module.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The synthesized type.
    #[must_use]
    pub fn entry_type(&self) -> Token {
        self.entry_type
    }

    /// The single public static method of the synthesized type.
    #[must_use]
    pub fn entry_method(&self) -> Option<Token> {
        self.module
            .methods_of(self.entry_type)
            .find(|method| {
                method.is_static() && method.flags_access == MethodAccessFlags::PUBLIC
            })
            .map(|method| method.token)
            .filter(|token| *token == self.entry)
    }
}

fn read_blob<'a>(parser: &mut Parser<'a>) -> Result<Option<&'a [u8]>> {
    match parser.read_le::<u8>()? {
        0 => Ok(None),
        1 => {
            let length = parser.read_compressed_uint()? as usize;
            Ok(Some(parser.read_bytes(length)?))
        }
        tag => Err(malformed_error!("Invalid blob presence tag - {}", tag)),
    }
}

fn read_method(parser: &mut Parser) -> Result<MethodDef> {
    let token = Token::new(parser.read_le::<u32>()?);
    let name = parser.read_prefixed_string_utf8()?;
    let declaring_type = Token::new(parser.read_le::<u32>()?);
    let flags = parser.read_le::<u32>()?;
    let impl_flags = parser.read_le::<u32>()?;
    let signature = MethodSig::decode(parser)?;

    let local_count = parser.read_compressed_uint()?;
    let mut locals = Vec::with_capacity(local_count.min(256) as usize);
    for _ in 0..local_count {
        locals.push(TypeSig::decode(parser)?);
    }

    let body = match read_blob(parser)? {
        Some(code) => {
            let (body, consumed) = MethodBody::parse(code, locals)?;
            if consumed != code.len() {
                return Err(malformed_error!(
                    "Body of {} has {} unused byte(s)",
                    token,
                    code.len() - consumed
                ));
            }
            Some(body)
        }
        None => None,
    };
    let native_code = read_blob(parser)?.map(std::sync::Arc::from);

    Ok(MethodDef {
        token,
        name,
        declaring_type,
        flags_access: MethodAccessFlags::from_method_flags(flags),
        flags_modifiers: MethodModifiers::from_method_flags(flags),
        impl_code_type: MethodImplCodeType::from_impl_flags(impl_flags),
        signature,
        body,
        native_code,
    })
}

/// Loads `image`, hands it to `f`, and releases it afterwards, whether `f` succeeds or not.
///
/// # Errors
/// Returns load errors, or whatever `f` returns.
pub fn with_loaded_image<R>(
    image: &[u8],
    f: impl FnOnce(&LoadedImage) -> Result<R>,
) -> Result<R> {
    let loaded = LoadedImage::load(image)?;
    f(&loaded)
}

/// Executes the entry method of a loaded host image.
pub trait UnitExecutor: Send + Sync {
    /// Invokes `entry` with `input` as its only `byte[]` argument and returns the `byte[]` it
    /// produced.
    ///
    /// # Errors
    /// Any failure to execute the method or to obtain a byte array from it.
    fn invoke(&self, image: &LoadedImage, entry: Token, input: &[u8]) -> Result<Vec<u8>>;
}

impl UnitExecutor for CilInterpreter {
    fn invoke(&self, image: &LoadedImage, entry: Token, input: &[u8]) -> Result<Vec<u8>> {
        let result = self.execute(image.module(), entry, vec![EmValue::byte_array(input)])?;
        result
            .and_then(EmValue::into_bytes)
            .ok_or_else(|| malformed_error!("Entry {} did not return an array", entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        emulation::EmulationLimits,
        metadata::{builder::ModuleBuilder, field::FieldAttributes},
    };

    /// `<Module>` with a nested helper `Xor.Apply(byte[], int)` and a static key field.
    fn source() -> (Module, Token, MethodBody) {
        let mut builder = ModuleBuilder::new("Source.dll");
        let global = builder.global_type();
        let helper = builder.type_def("", "Xor", TypeAttributes::NESTED_ASSEMBLY, Some(global));
        let key = builder.field(
            global,
            "key",
            FieldAttributes::STATIC | FieldAttributes::ASSEMBLY,
            TypeSig::I4,
            None,
        );
        let apply = builder.method(
            helper,
            "Apply",
            MethodAccessFlags::ASSEM,
            MethodModifiers::STATIC,
            MethodSig::new_static(
                TypeSig::sz_array(TypeSig::U1),
                vec![TypeSig::sz_array(TypeSig::U1), TypeSig::I4],
            ),
        );

        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(0).unwrap().stloc(0).unwrap().br("cond").unwrap();
        asm.label("loop").unwrap();
        asm.ldarg(0).unwrap().ldloc(0).unwrap();
        asm.ldarg(0).unwrap().ldloc(0).unwrap().ldelem_u1().unwrap();
        asm.ldarg(1).unwrap().xor().unwrap().conv_u1().unwrap().stelem_i1().unwrap();
        asm.ldloc(0).unwrap().ldc_i4(1).unwrap().add().unwrap().stloc(0).unwrap();
        asm.label("cond").unwrap();
        asm.ldloc(0).unwrap().ldarg(0).unwrap().ldlen().unwrap().conv_i4().unwrap();
        asm.blt("loop").unwrap();
        asm.ldarg(0).unwrap().ret().unwrap();
        builder
            .set_body(
                apply,
                MethodBody::new(asm.finish_instructions().unwrap(), vec![TypeSig::I4]),
            )
            .unwrap();

        let mut entry = InstructionAssembler::new();
        entry.ldc_i4(0x5A).unwrap().stsfld(key).unwrap();
        entry.ldarg(0).unwrap().ldsfld(key).unwrap().call(apply).unwrap().ret().unwrap();
        let body = MethodBody::new(entry.finish_instructions().unwrap(), Vec::new());

        (builder.build(), helper, body)
    }

    #[test]
    fn test_unit_carries_helpers_and_references() {
        let (module, helper, body) = source();
        let unit = HostUnit::new(&module, "Init", body, &[helper]);

        let carried: Vec<Token> = unit.carried_types().collect();
        assert!(carried.contains(&helper));
        assert!(carried.contains(&Token::new(0x0200_0001)));
        assert_eq!(unit.carried_method_count(), 1);
        assert_eq!(unit.entry_type().name, HostUnit::TYPE_NAME);
        assert!(unit.entry().signature.matches("System.Byte[]", "(System.Byte[])"));
        assert_eq!(unit.entry().token, Token::new(0x0600_0002));
    }

    #[test]
    fn test_image_round_trip_and_execution() {
        let (module, helper, body) = source();
        let unit = HostUnit::new(&module, "Init", body, &[helper]);

        let mut buffer = Vec::new();
        unit.write_to(&mut buffer).unwrap();
        assert!(buffer.starts_with(HOST_IMAGE_MAGIC));

        let output = with_loaded_image(&buffer, |image| {
            assert_eq!(image.module().assembly_name, HostUnit::ASSEMBLY_NAME);
            assert_eq!(image.module().name, HostUnit::MODULE_NAME);
            assert_eq!(
                image.module().type_full_name(helper).as_deref(),
                Some("<Module>/Xor")
            );
            let entry = image.entry_method().unwrap();
            CilInterpreter::new(EmulationLimits::default()).invoke(image, entry, &[0x5A, 0x00, 0xFF])
        })
        .unwrap();

        assert_eq!(output, vec![0x00, 0x5A, 0xA5]);
    }

    #[test]
    fn test_rejects_foreign_and_damaged_images() {
        assert!(matches!(
            LoadedImage::load(b"MZ\x90\x00"),
            Err(Error::ImageFormat(_))
        ));
        assert!(matches!(LoadedImage::load(b"CX"), Err(Error::ImageFormat(_))));

        let (module, helper, body) = source();
        let mut buffer = Vec::new();
        HostUnit::new(&module, "Init", body, &[helper])
            .write_to(&mut buffer)
            .unwrap();

        buffer.truncate(buffer.len() - 3);
        assert!(LoadedImage::load(&buffer).is_err());
    }

    #[test]
    fn test_closure_error_propagates() {
        let (module, helper, body) = source();
        let mut buffer = Vec::new();
        HostUnit::new(&module, "Init", body, &[helper])
            .write_to(&mut buffer)
            .unwrap();

        let result: Result<()> =
            with_loaded_image(&buffer, |_| Err(Error::Undetected("stub".to_string())));
        assert!(matches!(result, Err(Error::Undetected(_))));
    }
}
