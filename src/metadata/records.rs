//! Row records handed out by a [`crate::metadata::MetadataStore`].
//!
//! These are the already-decoded views of the metadata tables the compiler consumes. They are
//! plain data; all identity and canonicalization happens in the type system.

use crate::metadata::{
    flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, PInvokeInfo, TypeAttributes},
    signatures::{MemberRefSig, MethodSig, TypeSig},
    token::Token,
};

/// A row of the `TypeDef` table.
#[derive(Debug, Clone)]
pub struct TypeDefRecord {
    /// Token of this row
    pub token: Token,
    /// Namespace, empty for the global namespace
    pub namespace: String,
    /// Simple name, including the generic arity suffix if any (`List`1`)
    pub name: String,
    /// Type attributes
    pub flags: TypeAttributes,
    /// Base type, `None` for `System.Object` and interfaces
    pub extends: Option<TypeSig>,
    /// Implemented interfaces
    pub interfaces: Vec<TypeSig>,
    /// Field rows owned by this type, in declaration order
    pub fields: Vec<Token>,
    /// Method rows owned by this type, in declaration order
    pub methods: Vec<Token>,
    /// Number of generic parameters
    pub generic_params: u32,
    /// `ClassLayout.PackingSize`, 0 if unspecified
    pub packing_size: u16,
    /// `ClassLayout.ClassSize`, 0 if unspecified
    pub class_size: u32,
}

impl TypeDefRecord {
    /// `Namespace.Name`, or just `Name` in the global namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// A row of the `MethodDef` table.
#[derive(Debug, Clone)]
pub struct MethodDefRecord {
    /// Token of this row
    pub token: Token,
    /// Owning `TypeDef`
    pub owner: Token,
    /// Method name
    pub name: String,
    /// Method attributes
    pub flags: MethodAttributes,
    /// Implementation attributes
    pub impl_flags: MethodImplAttributes,
    /// Declared signature
    pub signature: MethodSig,
    /// Import information when `PINVOKE_IMPL` is set
    pub pinvoke: Option<PInvokeInfo>,
}

/// A row of the `Field` table, with its `FieldLayout` offset folded in.
#[derive(Debug, Clone)]
pub struct FieldDefRecord {
    /// Token of this row
    pub token: Token,
    /// Owning `TypeDef`
    pub owner: Token,
    /// Field name
    pub name: String,
    /// Field attributes
    pub flags: FieldAttributes,
    /// Declared type
    pub signature: TypeSig,
    /// Explicit byte offset from `FieldLayout`
    pub offset: Option<u32>,
}

/// A row of the `MemberRef` table.
#[derive(Debug, Clone)]
pub struct MemberRefRecord {
    /// Token of this row
    pub token: Token,
    /// Declaring type (named, generic instantiation or array)
    pub parent: TypeSig,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MemberRefSig,
}

/// A row of the `MethodSpec` table.
#[derive(Debug, Clone)]
pub struct MethodSpecRecord {
    /// Token of this row
    pub token: Token,
    /// Generic method definition (`MethodDef` or `MemberRef`)
    pub method: Token,
    /// Method type arguments
    pub instantiation: Vec<TypeSig>,
}
