//! Decoded signature shapes as the metadata store hands them out.
//!
//! Signatures here are still expressed in terms of tokens and generic variable indices; the
//! type system turns them into canonical descriptors under a generic context.

use std::fmt;

use crate::metadata::token::Token;

/// A type as written in a signature blob (ECMA-335 II.23.2.12).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `void`
    Void,
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// `int8`
    I1,
    /// `uint8`
    U1,
    /// `int16`
    I2,
    /// `uint16`
    U2,
    /// `int32`
    I4,
    /// `uint32`
    U4,
    /// `int64`
    I8,
    /// `uint64`
    U8,
    /// `float32`
    R4,
    /// `float64`
    R8,
    /// `native int`
    I,
    /// `native uint`
    U,
    /// `string`
    String,
    /// `object`
    Object,
    /// A class or value type referenced by `TypeDef`/`TypeRef` token
    Named(Token),
    /// A generic instantiation of a named definition
    GenericInst(Token, Vec<TypeSig>),
    /// Single-dimensional zero-based array
    SzArray(Box<TypeSig>),
    /// Multi-dimensional array
    Array(Box<TypeSig>, u32),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Managed reference
    ByRef(Box<TypeSig>),
    /// Function pointer
    FnPtr(Box<MethodSig>),
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the enclosing method
    MVar(u32),
}

impl TypeSig {
    /// Shorthand for `SzArray`.
    #[must_use]
    pub fn sz_array(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// Shorthand for `ByRef`.
    #[must_use]
    pub fn by_ref(element: TypeSig) -> Self {
        TypeSig::ByRef(Box::new(element))
    }

    /// Shorthand for `Ptr`.
    #[must_use]
    pub fn ptr(element: TypeSig) -> Self {
        TypeSig::Ptr(Box::new(element))
    }
}

/// Calling convention bits of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    /// Managed default
    #[default]
    Default,
    /// Variable arguments
    VarArg,
    /// Unmanaged cdecl (function pointers)
    UnmanagedCdecl,
    /// Unmanaged stdcall (function pointers)
    UnmanagedStdcall,
}

/// A method signature (ECMA-335 II.23.2.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Instance method with an implicit `this`
    pub has_this: bool,
    /// `this` is listed explicitly in `params`
    pub explicit_this: bool,
    /// Calling convention
    pub calling_convention: CallingConvention,
    /// Number of generic parameters of the method
    pub generic_param_count: u32,
    /// Return type
    pub return_type: TypeSig,
    /// Parameter types, excluding the implicit `this`
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    /// A static signature.
    #[must_use]
    pub fn new_static(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: false,
            explicit_this: false,
            calling_convention: CallingConvention::Default,
            generic_param_count: 0,
            return_type,
            params,
        }
    }

    /// An instance signature.
    #[must_use]
    pub fn new_instance(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: true,
            ..MethodSig::new_static(return_type, params)
        }
    }

    /// Same signature with `count` method generic parameters.
    #[must_use]
    pub fn with_generic_params(mut self, count: u32) -> Self {
        self.generic_param_count = count;
        self
    }
}

/// Signature attached to a `MemberRef` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberRefSig {
    /// Reference to a method
    Method(MethodSig),
    /// Reference to a field
    Field(TypeSig),
}

/// Signature attached to a `StandAloneSig` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StandAloneSig {
    /// Local variable list of a method body
    Locals(Vec<TypeSig>),
    /// Call-site signature used by `calli`
    Method(MethodSig),
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::Char => write!(f, "char"),
            TypeSig::I1 => write!(f, "int8"),
            TypeSig::U1 => write!(f, "uint8"),
            TypeSig::I2 => write!(f, "int16"),
            TypeSig::U2 => write!(f, "uint16"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::U4 => write!(f, "uint32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::U8 => write!(f, "uint64"),
            TypeSig::R4 => write!(f, "float32"),
            TypeSig::R8 => write!(f, "float64"),
            TypeSig::I => write!(f, "native int"),
            TypeSig::U => write!(f, "native uint"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Named(token) => write!(f, "[{token}]"),
            TypeSig::GenericInst(token, args) => {
                write!(f, "[{token}]<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
            TypeSig::Array(element, rank) => {
                write!(f, "{element}[{}]", ",".repeat(rank.saturating_sub(1) as usize))
            }
            TypeSig::Ptr(element) => write!(f, "{element}*"),
            TypeSig::ByRef(element) => write!(f, "{element}&"),
            TypeSig::FnPtr(_) => write!(f, "method*"),
            TypeSig::Var(index) => write!(f, "!{index}"),
            TypeSig::MVar(index) => write!(f, "!!{index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shapes() {
        assert_eq!(TypeSig::sz_array(TypeSig::I4).to_string(), "int32[]");
        assert_eq!(TypeSig::Array(Box::new(TypeSig::R8), 3).to_string(), "float64[,,]");
        assert_eq!(TypeSig::by_ref(TypeSig::MVar(0)).to_string(), "!!0&");
        let inst = TypeSig::GenericInst(Token(0x0200_0004), vec![TypeSig::I4, TypeSig::String]);
        assert_eq!(inst.to_string(), "[0x02000004]<int32,string>");
    }

    #[test]
    fn instance_signature_builder() {
        let sig = MethodSig::new_instance(TypeSig::Void, vec![TypeSig::I4]).with_generic_params(1);
        assert!(sig.has_this);
        assert_eq!(sig.generic_param_count, 1);
        assert_eq!(sig.params.len(), 1);
    }
}
