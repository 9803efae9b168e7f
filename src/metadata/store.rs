//! The read-only metadata seam the compiler is driven from.
//!
//! Everything the code generator knows about the input program comes through
//! [`MetadataStore`]: token-keyed row lookups, raw method bodies and custom-attribute presence
//! queries. File-format parsing lives on the other side of this trait. [`MemoryStore`] is the
//! in-memory implementation assembled with [`crate::metadata::StoreBuilder`].

use rustc_hash::{FxHashMap, FxHashSet};

use crate::metadata::{
    records::{FieldDefRecord, MemberRefRecord, MethodDefRecord, MethodSpecRecord, TypeDefRecord},
    signatures::{StandAloneSig, TypeSig},
    token::Token,
};

/// Read-only, token-keyed access to the metadata of the program being compiled.
///
/// Implementations must be shareable across the lowering worker threads. Lookups return
/// `None` for tokens the store does not know; callers turn that into
/// [`crate::Error::MissingMetadata`] or [`crate::Error::Malformed`] as appropriate.
pub trait MetadataStore: Send + Sync {
    /// Look up a `TypeDef` row.
    fn type_def(&self, token: Token) -> Option<&TypeDefRecord>;

    /// Look up a `MethodDef` row.
    fn method_def(&self, token: Token) -> Option<&MethodDefRecord>;

    /// Look up a `Field` row.
    fn field_def(&self, token: Token) -> Option<&FieldDefRecord>;

    /// Look up a `MemberRef` row.
    fn member_ref(&self, token: Token) -> Option<&MemberRefRecord>;

    /// Look up a `MethodSpec` row.
    fn method_spec(&self, token: Token) -> Option<&MethodSpecRecord>;

    /// Look up the signature of a `TypeSpec` row.
    fn type_spec(&self, token: Token) -> Option<&TypeSig>;

    /// Resolve a `TypeRef` row to the `TypeDef` it names.
    fn resolve_type_ref(&self, token: Token) -> Option<Token>;

    /// Look up a `StandAloneSig` row.
    fn standalone_sig(&self, token: Token) -> Option<&StandAloneSig>;

    /// Look up a string in the `#US` heap.
    fn user_string(&self, token: Token) -> Option<&str>;

    /// `true` if `owner` carries a custom attribute of type `namespace.name`.
    fn has_custom_attribute(&self, owner: Token, namespace: &str, name: &str) -> bool;

    /// Raw method body (header, IL bytes and extra sections) of a `MethodDef`.
    fn method_body(&self, token: Token) -> Option<&[u8]>;

    /// Find a `TypeDef` by namespace and name.
    fn find_type(&self, namespace: &str, name: &str) -> Option<Token>;

    /// All `TypeDef` tokens, in table order.
    fn types(&self) -> Vec<Token>;
}

/// A [`MetadataStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub(crate) types: FxHashMap<Token, TypeDefRecord>,
    pub(crate) type_order: Vec<Token>,
    pub(crate) type_names: FxHashMap<(String, String), Token>,
    pub(crate) type_refs: FxHashMap<Token, Token>,
    pub(crate) type_specs: FxHashMap<Token, TypeSig>,
    pub(crate) methods: FxHashMap<Token, MethodDefRecord>,
    pub(crate) fields: FxHashMap<Token, FieldDefRecord>,
    pub(crate) member_refs: FxHashMap<Token, MemberRefRecord>,
    pub(crate) method_specs: FxHashMap<Token, MethodSpecRecord>,
    pub(crate) standalone_sigs: FxHashMap<Token, StandAloneSig>,
    pub(crate) user_strings: FxHashMap<Token, String>,
    pub(crate) bodies: FxHashMap<Token, Vec<u8>>,
    pub(crate) attributes: FxHashSet<(Token, String, String)>,
}

impl MetadataStore for MemoryStore {
    fn type_def(&self, token: Token) -> Option<&TypeDefRecord> {
        self.types.get(&token)
    }

    fn method_def(&self, token: Token) -> Option<&MethodDefRecord> {
        self.methods.get(&token)
    }

    fn field_def(&self, token: Token) -> Option<&FieldDefRecord> {
        self.fields.get(&token)
    }

    fn member_ref(&self, token: Token) -> Option<&MemberRefRecord> {
        self.member_refs.get(&token)
    }

    fn method_spec(&self, token: Token) -> Option<&MethodSpecRecord> {
        self.method_specs.get(&token)
    }

    fn type_spec(&self, token: Token) -> Option<&TypeSig> {
        self.type_specs.get(&token)
    }

    fn resolve_type_ref(&self, token: Token) -> Option<Token> {
        self.type_refs.get(&token).copied()
    }

    fn standalone_sig(&self, token: Token) -> Option<&StandAloneSig> {
        self.standalone_sigs.get(&token)
    }

    fn user_string(&self, token: Token) -> Option<&str> {
        self.user_strings.get(&token).map(String::as_str)
    }

    fn has_custom_attribute(&self, owner: Token, namespace: &str, name: &str) -> bool {
        self.attributes
            .contains(&(owner, namespace.to_string(), name.to_string()))
    }

    fn method_body(&self, token: Token) -> Option<&[u8]> {
        self.bodies.get(&token).map(Vec::as_slice)
    }

    fn find_type(&self, namespace: &str, name: &str) -> Option<Token> {
        self.type_names
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    fn types(&self) -> Vec<Token> {
        self.type_order.clone()
    }
}
