//! Fluent construction of a [`MemoryStore`].
//!
//! The builder hands out tokens in ECMA-335 table numbering as rows are added, so IL bytes can
//! reference them directly. Method bodies are encoded into the on-disk header layout, which
//! keeps the body-parsing path identical to a store backed by a real image.
//!
//! # Examples
//!
//! ```rust
//! use cilaot::metadata::{MetadataStore, MethodAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig};
//!
//! let mut builder = StoreBuilder::new().with_core_library();
//! let object = builder.core_type("Object");
//! let program = builder.add_type("App", "Program", TypeAttributes::empty(), object);
//! let add = builder.add_method(
//!     program,
//!     "Add",
//!     MethodAttributes::STATIC,
//!     MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
//! );
//! builder.set_body(add, &[0x02, 0x03, 0x58, 0x2A]);
//!
//! let store = builder.build();
//! assert!(store.method_body(add).is_some());
//! ```

use crate::metadata::{
    flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, PInvokeInfo, TypeAttributes},
    method::{ExceptionRegion, MethodBody},
    records::{FieldDefRecord, MemberRefRecord, MethodDefRecord, MethodSpecRecord, TypeDefRecord},
    signatures::{MemberRefSig, MethodSig, StandAloneSig, TypeSig},
    store::MemoryStore,
    token::{Token, TokenTable},
};

/// Names of the primitive value types created by [`StoreBuilder::with_core_library`].
const CORE_PRIMITIVES: &[&str] = &[
    "Void", "Boolean", "Char", "SByte", "Byte", "Int16", "UInt16", "Int32", "UInt32", "Int64",
    "UInt64", "Single", "Double", "IntPtr", "UIntPtr",
];

/// Incrementally assembles a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct StoreBuilder {
    store: MemoryStore,
    type_refs: u32,
    member_refs: u32,
    standalone_sigs: u32,
    type_specs: u32,
    method_specs: u32,
    user_strings: u32,
}

impl StoreBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the `System` types the code generator relies on by name: `Object`, `ValueType`,
    /// `Enum`, `String`, `Array`, `Delegate`, `MulticastDelegate`, `Exception` and the
    /// primitive value types.
    #[must_use]
    pub fn with_core_library(mut self) -> Self {
        let object = self.add_type("System", "Object", TypeAttributes::empty(), None);
        let object_ctor = self.add_method(
            object,
            ".ctor",
            MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
            MethodSig::new_instance(TypeSig::Void, vec![]),
        );
        self.set_body(object_ctor, &[0x2A]);

        let value_type = self.add_type(
            "System",
            "ValueType",
            TypeAttributes::ABSTRACT,
            Some(TypeSig::Object),
        );
        let value_type_sig = Some(TypeSig::Named(value_type));
        self.add_type("System", "Enum", TypeAttributes::ABSTRACT, value_type_sig.clone());

        for name in CORE_PRIMITIVES {
            self.add_type(
                "System",
                name,
                TypeAttributes::SEQUENTIAL_LAYOUT | TypeAttributes::SEALED,
                value_type_sig.clone(),
            );
        }

        let string = self.add_type("System", "String", TypeAttributes::SEALED, Some(TypeSig::Object));
        self.add_field(string, "m_stringLength", FieldAttributes::empty(), TypeSig::I4);
        self.add_field(string, "m_firstChar", FieldAttributes::empty(), TypeSig::Char);

        self.add_type("System", "Array", TypeAttributes::ABSTRACT, Some(TypeSig::Object));

        let delegate = self.add_type("System", "Delegate", TypeAttributes::ABSTRACT, Some(TypeSig::Object));
        self.add_field(delegate, "m_firstParameter", FieldAttributes::empty(), TypeSig::Object);
        self.add_field(delegate, "m_helperObject", FieldAttributes::empty(), TypeSig::Object);
        self.add_field(delegate, "m_extraFunctionPointerOrData", FieldAttributes::empty(), TypeSig::I);
        self.add_field(delegate, "m_functionPointer", FieldAttributes::empty(), TypeSig::I);
        self.add_type(
            "System",
            "MulticastDelegate",
            TypeAttributes::ABSTRACT,
            Some(TypeSig::Named(delegate)),
        );

        let exception = self.add_type("System", "Exception", TypeAttributes::empty(), Some(TypeSig::Object));
        self.add_field(exception, "_message", FieldAttributes::empty(), TypeSig::String);
        let exception_ctor = self.add_method(
            exception,
            ".ctor",
            MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
            MethodSig::new_instance(TypeSig::Void, vec![TypeSig::String]),
        );
        // ldarg.0; ldarg.1; stfld _message; ret
        let message_field = Token::from_parts(TokenTable::Field, self.store.fields.len() as u32);
        let mut body = vec![0x02, 0x03, 0x7D];
        body.extend_from_slice(&message_field.value().to_le_bytes());
        body.push(0x2A);
        self.set_body(exception_ctor, &body);

        self
    }

    /// Token of a `System` type added by [`StoreBuilder::with_core_library`], wrapped as a
    /// base-type signature. `Object` yields [`TypeSig::Object`].
    #[must_use]
    pub fn core_type(&self, name: &str) -> Option<TypeSig> {
        match name {
            "Object" => Some(TypeSig::Object),
            "String" => Some(TypeSig::String),
            _ => self.find_type("System", name).map(TypeSig::Named),
        }
    }

    /// Find a previously added type.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<Token> {
        self.store
            .type_names
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    /// Add a `TypeDef` row.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        extends: Option<TypeSig>,
    ) -> Token {
        let token = Token::from_parts(TokenTable::TypeDef, self.store.type_order.len() as u32 + 1);
        self.store.types.insert(
            token,
            TypeDefRecord {
                token,
                namespace: namespace.to_string(),
                name: name.to_string(),
                flags,
                extends,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                generic_params: 0,
                packing_size: 0,
                class_size: 0,
            },
        );
        self.store.type_order.push(token);
        self.store
            .type_names
            .insert((namespace.to_string(), name.to_string()), token);
        token
    }

    /// Declare the number of generic parameters of a type.
    pub fn set_generic_params(&mut self, ty: Token, count: u32) {
        if let Some(record) = self.store.types.get_mut(&ty) {
            record.generic_params = count;
        }
    }

    /// Record an implemented interface.
    pub fn add_interface_impl(&mut self, ty: Token, interface: TypeSig) {
        if let Some(record) = self.store.types.get_mut(&ty) {
            record.interfaces.push(interface);
        }
    }

    /// Set the `ClassLayout` row of a type.
    pub fn set_layout(&mut self, ty: Token, packing_size: u16, class_size: u32) {
        if let Some(record) = self.store.types.get_mut(&ty) {
            record.packing_size = packing_size;
            record.class_size = class_size;
        }
    }

    /// Add a `TypeRef` row resolving to `target`.
    pub fn add_type_ref(&mut self, target: Token) -> Token {
        self.type_refs += 1;
        let token = Token::from_parts(TokenTable::TypeRef, self.type_refs);
        self.store.type_refs.insert(token, target);
        token
    }

    /// Add a `TypeSpec` row.
    pub fn add_type_spec(&mut self, signature: TypeSig) -> Token {
        self.type_specs += 1;
        let token = Token::from_parts(TokenTable::TypeSpec, self.type_specs);
        self.store.type_specs.insert(token, signature);
        token
    }

    /// Add a `Field` row owned by `owner`.
    pub fn add_field(
        &mut self,
        owner: Token,
        name: &str,
        flags: FieldAttributes,
        signature: TypeSig,
    ) -> Token {
        let token = Token::from_parts(TokenTable::Field, self.store.fields.len() as u32 + 1);
        self.store.fields.insert(
            token,
            FieldDefRecord {
                token,
                owner,
                name: name.to_string(),
                flags,
                signature,
                offset: None,
            },
        );
        if let Some(record) = self.store.types.get_mut(&owner) {
            record.fields.push(token);
        }
        token
    }

    /// Set the `FieldLayout` offset of a field.
    pub fn set_field_offset(&mut self, field: Token, offset: u32) {
        if let Some(record) = self.store.fields.get_mut(&field) {
            record.offset = Some(offset);
        }
    }

    /// Add a `MethodDef` row owned by `owner`.
    pub fn add_method(
        &mut self,
        owner: Token,
        name: &str,
        flags: MethodAttributes,
        signature: MethodSig,
    ) -> Token {
        let token = Token::from_parts(TokenTable::MethodDef, self.store.methods.len() as u32 + 1);
        self.store.methods.insert(
            token,
            MethodDefRecord {
                token,
                owner,
                name: name.to_string(),
                flags,
                impl_flags: MethodImplAttributes::empty(),
                signature,
                pinvoke: None,
            },
        );
        if let Some(record) = self.store.types.get_mut(&owner) {
            record.methods.push(token);
        }
        token
    }

    /// Set the implementation flags of a method.
    pub fn set_impl_flags(&mut self, method: Token, impl_flags: MethodImplAttributes) {
        if let Some(record) = self.store.methods.get_mut(&method) {
            record.impl_flags = impl_flags;
        }
    }

    /// Mark a method as a platform-invoke import.
    pub fn set_pinvoke(&mut self, method: Token, info: PInvokeInfo) {
        if let Some(record) = self.store.methods.get_mut(&method) {
            record.flags |= MethodAttributes::PINVOKE_IMPL;
            record.pinvoke = Some(info);
        }
    }

    /// Attach a body with default header settings (max stack 8, no locals).
    pub fn set_body(&mut self, method: Token, code: &[u8]) {
        self.set_method_body(method, code, 8, Token(0), false, &[]);
    }

    /// Attach a body with full header information.
    pub fn set_method_body(
        &mut self,
        method: Token,
        code: &[u8],
        max_stack: u16,
        locals: Token,
        init_locals: bool,
        regions: &[ExceptionRegion],
    ) {
        let bytes = MethodBody::encode(code, max_stack, locals, init_locals, regions);
        self.store.bodies.insert(method, bytes);
    }

    /// Attach raw body bytes verbatim, header included.
    pub fn set_raw_body(&mut self, method: Token, bytes: Vec<u8>) {
        self.store.bodies.insert(method, bytes);
    }

    /// Add a `MemberRef` row.
    pub fn add_member_ref(&mut self, parent: TypeSig, name: &str, signature: MemberRefSig) -> Token {
        self.member_refs += 1;
        let token = Token::from_parts(TokenTable::MemberRef, self.member_refs);
        self.store.member_refs.insert(
            token,
            MemberRefRecord {
                token,
                parent,
                name: name.to_string(),
                signature,
            },
        );
        token
    }

    /// Add a `MethodSpec` row.
    pub fn add_method_spec(&mut self, method: Token, instantiation: Vec<TypeSig>) -> Token {
        self.method_specs += 1;
        let token = Token::from_parts(TokenTable::MethodSpec, self.method_specs);
        self.store.method_specs.insert(
            token,
            MethodSpecRecord {
                token,
                method,
                instantiation,
            },
        );
        token
    }

    /// Add a `StandAloneSig` row describing a local variable list.
    pub fn add_locals(&mut self, locals: Vec<TypeSig>) -> Token {
        self.add_standalone_sig(StandAloneSig::Locals(locals))
    }

    /// Add a `StandAloneSig` row.
    pub fn add_standalone_sig(&mut self, signature: StandAloneSig) -> Token {
        self.standalone_sigs += 1;
        let token = Token::from_parts(TokenTable::StandAloneSig, self.standalone_sigs);
        self.store.standalone_sigs.insert(token, signature);
        token
    }

    /// Add a string to the `#US` heap.
    pub fn add_user_string(&mut self, value: &str) -> Token {
        self.user_strings += 1;
        let token = Token::from_parts(TokenTable::UserString, self.user_strings);
        self.store.user_strings.insert(token, value.to_string());
        token
    }

    /// Attach a custom attribute of type `namespace.name` to `owner`.
    pub fn add_custom_attribute(&mut self, owner: Token, namespace: &str, name: &str) {
        self.store
            .attributes
            .insert((owner, namespace.to_string(), name.to_string()));
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> MemoryStore {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;

    #[test]
    fn tokens_follow_table_numbering() {
        let mut builder = StoreBuilder::new();
        let ty = builder.add_type("N", "T", TypeAttributes::empty(), None);
        let field = builder.add_field(ty, "f", FieldAttributes::empty(), TypeSig::I4);
        let method = builder.add_method(ty, "M", MethodAttributes::STATIC, MethodSig::new_static(TypeSig::Void, vec![]));
        let string = builder.add_user_string("hi");

        assert_eq!(ty, Token(0x0200_0001));
        assert_eq!(field, Token(0x0400_0001));
        assert_eq!(method, Token(0x0600_0001));
        assert_eq!(string, Token(0x7000_0001));

        let store = builder.build();
        assert_eq!(store.type_def(ty).unwrap().fields, vec![field]);
        assert_eq!(store.user_string(string), Some("hi"));
    }

    #[test]
    fn core_library_is_resolvable() {
        let builder = StoreBuilder::new().with_core_library();
        let store = builder.build();
        for name in ["Object", "ValueType", "Int32", "String", "MulticastDelegate", "Exception"] {
            assert!(store.find_type("System", name).is_some(), "{name}");
        }
        let exception = store.find_type("System", "Exception").unwrap();
        let ctor = store.type_def(exception).unwrap().methods[0];
        let body = MethodBody::parse(store.method_body(ctor).unwrap()).unwrap();
        assert_eq!(body.code.len(), 8);
    }

    #[test]
    fn pinvoke_sets_flag() {
        let mut builder = StoreBuilder::new();
        let ty = builder.add_type("N", "Native", TypeAttributes::empty(), None);
        let method = builder.add_method(ty, "puts", MethodAttributes::STATIC, MethodSig::new_static(TypeSig::I4, vec![TypeSig::I]));
        builder.set_pinvoke(
            method,
            PInvokeInfo {
                module: "libc".into(),
                entry_point: "puts".into(),
                calling_convention: Default::default(),
            },
        );
        let store = builder.build();
        assert!(store.method_def(method).unwrap().flags.contains(MethodAttributes::PINVOKE_IMPL));
    }
}
