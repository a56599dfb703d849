//! Type and method signatures.
//!
//! Signatures are kept in resolved form: class and value types carry their full name rather
//! than a coded token, which is all the constants engine needs to compare call targets by their
//! dnlib-style textual shape (`System.Int32 System.IO.Stream::Read(System.Byte[],...)`).
//!
//! The [`TypeSig::encode`] / [`TypeSig::decode`] pair uses the ECMA-335 element type bytes and
//! is the format host unit images store signatures in.

use crate::{
    file::io::{push_compressed_uint, push_prefixed_string},
    Parser, Result,
};

/// ECMA-335 II.23.1.16 element types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ElementType {
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0A,
    U8 = 0x0B,
    R4 = 0x0C,
    R8 = 0x0D,
    String = 0x0E,
    Ptr = 0x0F,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    GenericInst = 0x15,
    I = 0x18,
    U = 0x19,
    Object = 0x1C,
    SzArray = 0x1D,
    MVar = 0x1E,
    CModReqd = 0x1F,
    CModOpt = 0x20,
    Pinned = 0x45,
}

impl ElementType {
    /// Byte width of a primitive stored in an array or blob, `None` for non-primitives.
    #[must_use]
    pub fn primitive_size(self) -> Option<usize> {
        match self {
            ElementType::Boolean | ElementType::I1 | ElementType::U1 => Some(1),
            ElementType::Char | ElementType::I2 | ElementType::U2 => Some(2),
            ElementType::I4 | ElementType::U4 | ElementType::R4 => Some(4),
            ElementType::I8
            | ElementType::U8
            | ElementType::R8
            | ElementType::I
            | ElementType::U => Some(8),
            _ => None,
        }
    }
}

/// A resolved type signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// void
    Void,
    /// bool
    Boolean,
    /// char
    Char,
    /// signed 8bit integer
    I1,
    /// unsigned 8bit integer
    U1,
    /// signed 16bit integer
    I2,
    /// unsigned 16bit integer
    U2,
    /// signed 32bit integer
    I4,
    /// unsigned 32bit integer
    U4,
    /// signed 64bit integer
    I8,
    /// unsigned 64bit integer
    U8,
    /// 32bit floating-point
    R4,
    /// 64bit floating-point
    R8,
    /// System.String
    String,
    /// signed integer, sized to executing platform
    I,
    /// unsigned integer, sized to executing platform
    U,
    /// System.Object
    Object,
    /// A value type, by full name
    ValueType(String),
    /// A reference type, by full name
    Class(String),
    /// Single dimension, zero based array
    SzArray(Box<TypeSig>),
    /// Managed reference
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Generic type parameter
    Var(u32),
    /// Generic method parameter
    MVar(u32),
    /// Generic type and its arguments
    GenericInst(Box<TypeSig>, Vec<TypeSig>),
    /// A pinned local
    Pinned(Box<TypeSig>),
    /// Required modifier, by full name of the modifier type
    ModifiedRequired(String, Box<TypeSig>),
    /// Optional modifier, by full name of the modifier type
    ModifiedOptional(String, Box<TypeSig>),
}

impl TypeSig {
    /// Shorthand for `T[]`
    #[must_use]
    pub fn sz_array(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// Shorthand for a reference type by full name
    #[must_use]
    pub fn class(full_name: &str) -> Self {
        TypeSig::Class(full_name.to_string())
    }

    /// Returns the element type of the outermost signature node.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        match self {
            TypeSig::Void => ElementType::Void,
            TypeSig::Boolean => ElementType::Boolean,
            TypeSig::Char => ElementType::Char,
            TypeSig::I1 => ElementType::I1,
            TypeSig::U1 => ElementType::U1,
            TypeSig::I2 => ElementType::I2,
            TypeSig::U2 => ElementType::U2,
            TypeSig::I4 => ElementType::I4,
            TypeSig::U4 => ElementType::U4,
            TypeSig::I8 => ElementType::I8,
            TypeSig::U8 => ElementType::U8,
            TypeSig::R4 => ElementType::R4,
            TypeSig::R8 => ElementType::R8,
            TypeSig::String => ElementType::String,
            TypeSig::I => ElementType::I,
            TypeSig::U => ElementType::U,
            TypeSig::Object => ElementType::Object,
            TypeSig::ValueType(_) => ElementType::ValueType,
            TypeSig::Class(_) => ElementType::Class,
            TypeSig::SzArray(_) => ElementType::SzArray,
            TypeSig::ByRef(_) => ElementType::ByRef,
            TypeSig::Ptr(_) => ElementType::Ptr,
            TypeSig::Var(_) => ElementType::Var,
            TypeSig::MVar(_) => ElementType::MVar,
            TypeSig::GenericInst(_, _) => ElementType::GenericInst,
            TypeSig::Pinned(_) => ElementType::Pinned,
            TypeSig::ModifiedRequired(_, _) => ElementType::CModReqd,
            TypeSig::ModifiedOptional(_, _) => ElementType::CModOpt,
        }
    }

    /// Strips any leading `pinned`, `modreq` and `modopt` nodes.
    #[must_use]
    pub fn remove_pinned_and_modifiers(&self) -> &TypeSig {
        let mut current = self;
        loop {
            match current {
                TypeSig::Pinned(inner)
                | TypeSig::ModifiedRequired(_, inner)
                | TypeSig::ModifiedOptional(_, inner) => current = inner,
                _ => return current,
            }
        }
    }

    /// Returns `true` if a `!n` or `!!n` parameter appears anywhere in the signature.
    #[must_use]
    pub fn contains_generic_parameter(&self) -> bool {
        match self {
            TypeSig::Var(_) | TypeSig::MVar(_) => true,
            TypeSig::SzArray(inner)
            | TypeSig::ByRef(inner)
            | TypeSig::Ptr(inner)
            | TypeSig::Pinned(inner)
            | TypeSig::ModifiedRequired(_, inner)
            | TypeSig::ModifiedOptional(_, inner) => inner.contains_generic_parameter(),
            TypeSig::GenericInst(base, args) => {
                base.contains_generic_parameter()
                    || args.iter().any(TypeSig::contains_generic_parameter)
            }
            _ => false,
        }
    }

    /// Maps a `System.*` primitive name back to its signature.
    #[must_use]
    pub fn from_system_name(full_name: &str) -> Option<TypeSig> {
        let sig = match full_name {
            "System.Void" => TypeSig::Void,
            "System.Boolean" => TypeSig::Boolean,
            "System.Char" => TypeSig::Char,
            "System.SByte" => TypeSig::I1,
            "System.Byte" => TypeSig::U1,
            "System.Int16" => TypeSig::I2,
            "System.UInt16" => TypeSig::U2,
            "System.Int32" => TypeSig::I4,
            "System.UInt32" => TypeSig::U4,
            "System.Int64" => TypeSig::I8,
            "System.UInt64" => TypeSig::U8,
            "System.Single" => TypeSig::R4,
            "System.Double" => TypeSig::R8,
            "System.String" => TypeSig::String,
            "System.IntPtr" => TypeSig::I,
            "System.UIntPtr" => TypeSig::U,
            "System.Object" => TypeSig::Object,
            _ => return None,
        };
        Some(sig)
    }

    /// The full name in the notation used by dnlib (`System.Byte[]`, `!!0`, `A/B`).
    #[must_use]
    pub fn full_name(&self) -> String {
        match self {
            TypeSig::Void => "System.Void".into(),
            TypeSig::Boolean => "System.Boolean".into(),
            TypeSig::Char => "System.Char".into(),
            TypeSig::I1 => "System.SByte".into(),
            TypeSig::U1 => "System.Byte".into(),
            TypeSig::I2 => "System.Int16".into(),
            TypeSig::U2 => "System.UInt16".into(),
            TypeSig::I4 => "System.Int32".into(),
            TypeSig::U4 => "System.UInt32".into(),
            TypeSig::I8 => "System.Int64".into(),
            TypeSig::U8 => "System.UInt64".into(),
            TypeSig::R4 => "System.Single".into(),
            TypeSig::R8 => "System.Double".into(),
            TypeSig::String => "System.String".into(),
            TypeSig::I => "System.IntPtr".into(),
            TypeSig::U => "System.UIntPtr".into(),
            TypeSig::Object => "System.Object".into(),
            TypeSig::ValueType(name) | TypeSig::Class(name) => name.clone(),
            TypeSig::SzArray(inner) => format!("{}[]", inner.full_name()),
            TypeSig::ByRef(inner) => format!("{}&", inner.full_name()),
            TypeSig::Ptr(inner) => format!("{}*", inner.full_name()),
            TypeSig::Var(index) => format!("!{index}"),
            TypeSig::MVar(index) => format!("!!{index}"),
            TypeSig::GenericInst(base, args) => {
                let args: Vec<String> = args.iter().map(TypeSig::full_name).collect();
                format!("{}<{}>", base.full_name(), args.join(","))
            }
            TypeSig::Pinned(inner) => inner.full_name(),
            TypeSig::ModifiedRequired(modifier, inner) => {
                format!("{} modreq({modifier})", inner.full_name())
            }
            TypeSig::ModifiedOptional(modifier, inner) => {
                format!("{} modopt({modifier})", inner.full_name())
            }
        }
    }

    /// Appends the binary form of this signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a generic index exceeds the compressed range.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.push(self.element_type() as u8);
        match self {
            TypeSig::ValueType(name) | TypeSig::Class(name) => push_prefixed_string(buffer, name),
            TypeSig::SzArray(inner)
            | TypeSig::ByRef(inner)
            | TypeSig::Ptr(inner)
            | TypeSig::Pinned(inner) => inner.encode(buffer)?,
            TypeSig::Var(index) | TypeSig::MVar(index) => push_compressed_uint(buffer, *index)?,
            TypeSig::GenericInst(base, args) => {
                base.encode(buffer)?;
                push_compressed_uint(buffer, args.len() as u32)?;
                for arg in args {
                    arg.encode(buffer)?;
                }
            }
            TypeSig::ModifiedRequired(modifier, inner)
            | TypeSig::ModifiedOptional(modifier, inner) => {
                push_prefixed_string(buffer, modifier);
                inner.encode(buffer)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Reads a signature written by [`TypeSig::encode`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown element types and
    /// [`crate::Error::OutOfBounds`] for truncated input.
    pub fn decode(parser: &mut Parser) -> Result<TypeSig> {
        Self::decode_depth(parser, 0)
    }

    fn decode_depth(parser: &mut Parser, depth: usize) -> Result<TypeSig> {
        const MAX_NESTING: usize = 64;
        if depth > MAX_NESTING {
            return Err(malformed_error!("Signature nesting exceeds {}", MAX_NESTING));
        }

        let tag = parser.read_le::<u8>()?;
        let boxed = |parser: &mut Parser| -> Result<Box<TypeSig>> {
            Ok(Box::new(Self::decode_depth(parser, depth + 1)?))
        };

        let sig = match tag {
            0x01 => TypeSig::Void,
            0x02 => TypeSig::Boolean,
            0x03 => TypeSig::Char,
            0x04 => TypeSig::I1,
            0x05 => TypeSig::U1,
            0x06 => TypeSig::I2,
            0x07 => TypeSig::U2,
            0x08 => TypeSig::I4,
            0x09 => TypeSig::U4,
            0x0A => TypeSig::I8,
            0x0B => TypeSig::U8,
            0x0C => TypeSig::R4,
            0x0D => TypeSig::R8,
            0x0E => TypeSig::String,
            0x0F => TypeSig::Ptr(boxed(parser)?),
            0x10 => TypeSig::ByRef(boxed(parser)?),
            0x11 => TypeSig::ValueType(parser.read_prefixed_string_utf8()?),
            0x12 => TypeSig::Class(parser.read_prefixed_string_utf8()?),
            0x13 => TypeSig::Var(parser.read_compressed_uint()?),
            0x15 => {
                let base = boxed(parser)?;
                let count = parser.read_compressed_uint()?;
                let mut args = Vec::with_capacity(count.min(16) as usize);
                for _ in 0..count {
                    args.push(Self::decode_depth(parser, depth + 1)?);
                }
                TypeSig::GenericInst(base, args)
            }
            0x18 => TypeSig::I,
            0x19 => TypeSig::U,
            0x1C => TypeSig::Object,
            0x1D => TypeSig::SzArray(boxed(parser)?),
            0x1E => TypeSig::MVar(parser.read_compressed_uint()?),
            0x1F => {
                let modifier = parser.read_prefixed_string_utf8()?;
                TypeSig::ModifiedRequired(modifier, boxed(parser)?)
            }
            0x20 => {
                let modifier = parser.read_prefixed_string_utf8()?;
                TypeSig::ModifiedOptional(modifier, boxed(parser)?)
            }
            0x45 => TypeSig::Pinned(boxed(parser)?),
            other => return Err(malformed_error!("Unknown element type - {:#04x}", other)),
        };
        Ok(sig)
    }
}

/// A method signature (II.23.2.1) with resolved parameter types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Instance method, `this` is passed as argument 0
    pub has_this: bool,
    /// Number of generic method parameters
    pub generic_param_count: u32,
    /// The return type
    pub return_type: TypeSig,
    /// The declared parameters, excluding `this`
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    const HAS_THIS: u8 = 0x20;
    const GENERIC: u8 = 0x10;

    /// A static, non-generic signature
    #[must_use]
    pub fn new_static(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: false,
            generic_param_count: 0,
            return_type,
            params,
        }
    }

    /// An instance, non-generic signature
    #[must_use]
    pub fn new_instance(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: true,
            ..Self::new_static(return_type, params)
        }
    }

    /// Sets the number of generic parameters
    #[must_use]
    pub fn with_generic_params(mut self, count: u32) -> Self {
        self.generic_param_count = count;
        self
    }

    /// Returns `true` if the return type or any parameter mentions a generic parameter.
    #[must_use]
    pub fn contains_generic_parameter(&self) -> bool {
        self.return_type.contains_generic_parameter()
            || self.params.iter().any(TypeSig::contains_generic_parameter)
    }

    /// The parameter list in dnlib notation, e.g. `(System.Byte[],System.Int32)`.
    #[must_use]
    pub fn params_string(&self) -> String {
        let params: Vec<String> = self.params.iter().map(TypeSig::full_name).collect();
        format!("({})", params.join(","))
    }

    /// Compares the return type and parameter list against their textual forms.
    ///
    /// ```rust
    /// use confuserex_constants::metadata::signatures::{MethodSig, TypeSig};
    ///
    /// let sig = MethodSig::new_static(TypeSig::sz_array(TypeSig::U1), vec![TypeSig::sz_array(TypeSig::U1)]);
    /// assert!(sig.matches("System.Byte[]", "(System.Byte[])"));
    /// ```
    #[must_use]
    pub fn matches(&self, return_type: &str, params: &str) -> bool {
        self.return_type.full_name() == return_type && self.params_string() == params
    }

    /// Appends the binary form of this signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a count exceeds the compressed range.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut flags = 0u8;
        if self.has_this {
            flags |= Self::HAS_THIS;
        }
        if self.generic_param_count > 0 {
            flags |= Self::GENERIC;
        }
        buffer.push(flags);
        if self.generic_param_count > 0 {
            push_compressed_uint(buffer, self.generic_param_count)?;
        }
        push_compressed_uint(buffer, self.params.len() as u32)?;
        self.return_type.encode(buffer)?;
        for param in &self.params {
            param.encode(buffer)?;
        }
        Ok(())
    }

    /// Reads a signature written by [`MethodSig::encode`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] on damaged input.
    pub fn decode(parser: &mut Parser) -> Result<MethodSig> {
        let flags = parser.read_le::<u8>()?;
        let generic_param_count = if flags & Self::GENERIC != 0 {
            parser.read_compressed_uint()?
        } else {
            0
        };
        let count = parser.read_compressed_uint()?;
        let return_type = TypeSig::decode(parser)?;
        let mut params = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            params.push(TypeSig::decode(parser)?);
        }

        Ok(MethodSig {
            has_this: flags & Self::HAS_THIS != 0,
            generic_param_count,
            return_type,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_names() {
        assert_eq!(TypeSig::sz_array(TypeSig::U1).full_name(), "System.Byte[]");
        assert_eq!(TypeSig::MVar(0).full_name(), "!!0");
        assert_eq!(
            TypeSig::class("System.IO.Stream").full_name(),
            "System.IO.Stream"
        );
        assert_eq!(
            TypeSig::GenericInst(
                Box::new(TypeSig::class("System.Collections.Generic.List`1")),
                vec![TypeSig::I4]
            )
            .full_name(),
            "System.Collections.Generic.List`1<System.Int32>"
        );
    }

    #[test]
    fn test_strip_modifiers() {
        let sig = TypeSig::ModifiedOptional(
            "System.Runtime.CompilerServices.IsConst".into(),
            Box::new(TypeSig::Pinned(Box::new(TypeSig::MVar(0)))),
        );
        assert_eq!(sig.element_type(), ElementType::CModOpt);
        assert_eq!(sig.remove_pinned_and_modifiers(), &TypeSig::MVar(0));
        assert!(sig.contains_generic_parameter());
        assert!(!TypeSig::sz_array(TypeSig::U4).contains_generic_parameter());
    }

    #[test]
    fn test_method_sig_matching() {
        let read = MethodSig::new_instance(
            TypeSig::I4,
            vec![TypeSig::sz_array(TypeSig::U1), TypeSig::I4, TypeSig::I4],
        );
        assert!(read.matches("System.Int32", "(System.Byte[],System.Int32,System.Int32)"));
        assert!(!read.matches("System.Int64", "()"));
        assert_eq!(
            MethodSig::new_instance(TypeSig::I8, vec![]).params_string(),
            "()"
        );
    }

    #[test]
    fn test_encode_decode_nested_signature() {
        let sig = MethodSig::new_static(
            TypeSig::MVar(0),
            vec![
                TypeSig::U4,
                TypeSig::ByRef(Box::new(TypeSig::class("System.IO.Stream"))),
                TypeSig::ModifiedRequired(
                    "System.Runtime.CompilerServices.IsVolatile".into(),
                    Box::new(TypeSig::I4),
                ),
            ],
        )
        .with_generic_params(1);

        let mut buffer = Vec::new();
        sig.encode(&mut buffer).unwrap();
        let mut parser = Parser::new(&buffer);
        assert_eq!(MethodSig::decode(&mut parser).unwrap(), sig);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn test_decode_rejects_unknown_element() {
        let mut parser = Parser::new(&[0x7F]);
        assert!(TypeSig::decode(&mut parser).is_err());
    }

    #[test]
    fn test_primitive_names() {
        assert_eq!(TypeSig::from_system_name("System.UInt32"), Some(TypeSig::U4));
        assert_eq!(TypeSig::from_system_name("System.IO.Stream"), None);
        assert_eq!(ElementType::U8.primitive_size(), Some(8));
        assert_eq!(ElementType::Class.primitive_size(), None);
    }
}
